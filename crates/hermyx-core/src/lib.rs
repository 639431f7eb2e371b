//! # Hermyx Core
//!
//! Core library for Hermyx, a reverse HTTP proxy that applies response
//! caching and token-bucket rate limiting in front of one or more upstream
//! origins.
//!
//! - **[`config`]**: YAML configuration schema, defaulting rules, and
//!   validation. Per-route cache and rate-limit overrides are layered on top
//!   of global defaults at startup.
//!
//! - **[`routing`]**: Regex-driven route compilation and matching, with
//!   separate matcher variants for the cache path (which honors method
//!   exclusion lists) and the rate-limit path (which ignores them).
//!
//! - **[`cache`]**: Response caching behind a single store interface with
//!   memory (LRU+TTL), disk (append-only memory-mapped log), and Redis
//!   backends, plus fingerprint construction and policy resolution.
//!
//! - **[`ratelimit`]**: Token-bucket rate limiting behind a single limiter
//!   interface with memory and Redis backends, multi-dimensional key
//!   construction, and fail-open/fail-closed policy for backend outages.
//!
//! - **[`proxy`]**: The request pipeline composing the pieces above, and the
//!   pooled per-target upstream dispatcher.
//!
//! - **[`runtime`]**: Process lifecycle: listener binding, PID file
//!   management, graceful shutdown, and backend teardown.
//!
//! ## Request Flow
//!
//! ```text
//! Client Request
//!       │
//!       ▼
//! ┌──────────────┐
//! │  Rate-limit  │ ─── Denied ──► 429 + Retry-After
//! │     gate     │
//! └──────┬───────┘
//!        │ Allowed
//!        ▼
//! ┌──────────────┐
//! │ Route match  │ ─── No match ──► Fallback proxy by Host (or 404)
//! └──────┬───────┘
//!        │ Matched
//!        ▼
//! ┌──────────────┐
//! │ Cache probe  │ ─── Hit ──► 200 + X-Hermyx-Cache: HIT
//! └──────┬───────┘
//!        │ Miss
//!        ▼
//! ┌──────────────┐
//! │   Upstream   │
//! │   dispatch   │
//! └──────┬───────┘
//!        │ 2xx and small enough
//!        ▼
//! ┌──────────────┐
//! │ Cache store  │
//! └──────┬───────┘
//!        │
//!        ▼
//!  Response to client
//! ```

pub mod cache;
pub mod config;
pub mod logging;
pub mod proxy;
pub mod ratelimit;
pub mod routing;
pub mod runtime;
