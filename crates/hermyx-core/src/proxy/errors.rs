use thiserror::Error;

/// Errors raised on the dispatch path. Every variant becomes a plain-text
/// HTTP error response; none of them propagate as panics.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The upstream could not be reached or answered with a transport-level
    /// failure. Surfaces as 502 with the error text as body.
    #[error("upstream request failed: {0}")]
    Upstream(String),

    /// The per-target HTTP client could not be constructed.
    #[error("unable to build upstream client for {target}: {detail}")]
    ClientBuild { target: String, detail: String },

    /// The request carried a method or URI part that cannot be forwarded.
    #[error("unable to forward request: {0}")]
    BadRequest(String),
}

impl From<reqwest::Error> for ProxyError {
    fn from(e: reqwest::Error) -> Self {
        // `reqwest::Error`'s display output already names the failing URL
        // when one is known.
        Self::Upstream(e.to_string())
    }
}
