//! Subcommand implementations.

use anyhow::{bail, Context};
use hermyx_core::{
    config::{default_storage_dir, HermyxConfig},
    logging, runtime,
};
use std::path::{Path, PathBuf};

/// Resolves the configured or derived storage directory for a config file.
fn resolve_storage_dir(config: &HermyxConfig, config_path: &Path) -> anyhow::Result<PathBuf> {
    match &config.storage.path {
        Some(path) => Ok(path.clone()),
        None => default_storage_dir(config_path).context("unable to derive the storage path"),
    }
}

/// `hermyx up`: load, default, validate, and run to completion.
pub async fn up(config_path: &Path) -> anyhow::Result<()> {
    let config_path = absolutize(config_path);
    if !config_path.exists() {
        bail!("config file not found: {}", config_path.display());
    }

    let mut config = HermyxConfig::load(&config_path)?;
    config.apply_defaults(&config_path)?;
    config.validate()?;

    let _log_guard = logging::init(&config.log).context("unable to initialize logging")?;
    tracing::info!(config = %config_path.display(), "starting hermyx");

    runtime::run(config).await?;
    Ok(())
}

/// `hermyx down`: read the PID file under the resolved storage path and send
/// SIGTERM.
pub fn down(config_path: &Path) -> anyhow::Result<()> {
    let config_path = absolutize(config_path);
    let config = HermyxConfig::load(&config_path)?;
    let storage_dir = resolve_storage_dir(&config, &config_path)?;

    let pid_path = runtime::pid_file_path(&storage_dir);
    let raw = std::fs::read_to_string(&pid_path)
        .with_context(|| format!("failed to read PID file {}", pid_path.display()))?;
    let pid: i32 = raw
        .trim()
        .parse()
        .with_context(|| format!("invalid PID content in {}", pid_path.display()))?;

    terminate(pid)?;
    println!("sent SIGTERM to hermyx process {pid}");
    Ok(())
}

#[cfg(unix)]
fn terminate(pid: i32) -> anyhow::Result<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    kill(Pid::from_raw(pid), Signal::SIGTERM)
        .with_context(|| format!("failed to send SIGTERM to process {pid}"))
}

#[cfg(not(unix))]
fn terminate(_pid: i32) -> anyhow::Result<()> {
    bail!("`hermyx down` is only supported on unix platforms")
}

/// `hermyx init`: write a fully-populated default config.
pub fn init(config_path: &Path) -> anyhow::Result<()> {
    let config_path = absolutize(config_path);

    let scaffold = HermyxConfig::default_scaffold(&config_path)?;
    scaffold.write_to(&config_path)?;

    println!("wrote default config to {}", config_path.display());
    Ok(())
}

fn absolutize(path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir().map(|cwd| cwd.join(path)).unwrap_or_else(|_| path.to_path_buf())
    }
}
