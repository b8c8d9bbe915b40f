//! Load config from file and environment.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use relay_core::Config;

/// Resolved worker settings: the immutable core snapshot plus process identity.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub config: Config,
    pub worker_id: u16,
    /// Emit supervisor frames on stdout.
    pub supervised: bool,
}

/// Load config: file from `--config`, else `RELAY_CONFIG`, else the first of
/// ~/.config/splitrelay/config.toml and /etc/splitrelay/config.toml that
/// exists. Env overrides: RELAY_WORKER_ID, RELAY_BASE_PORT, RELAY_LOG,
/// RELAY_SUPERVISED.
pub fn load(explicit: Option<&Path>) -> Result<WorkerSettings> {
    let path = explicit
        .map(Path::to_path_buf)
        .or_else(|| std::env::var_os("RELAY_CONFIG").map(PathBuf::from))
        .or_else(|| config_paths().into_iter().find(|p| p.exists()));
    let mut config = match path {
        Some(p) => load_file(&p)?,
        None => Config::default(),
    };
    if let Ok(s) = std::env::var("RELAY_BASE_PORT") {
        if let Ok(p) = s.parse::<u16>() {
            config.server.base_port = p;
        }
    }
    if let Ok(level) = std::env::var("RELAY_LOG") {
        config.logging.level = level;
    }
    let worker_id = std::env::var("RELAY_WORKER_ID")
        .ok()
        .and_then(|s| s.parse::<u16>().ok())
        .unwrap_or(0);
    let supervised = std::env::var("RELAY_SUPERVISED").is_ok_and(|v| v == "1");
    config.validate().context("invalid configuration")?;
    Ok(WorkerSettings {
        config,
        worker_id,
        supervised,
    })
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/splitrelay/config.toml"));
    }
    out.push(PathBuf::from("/etc/splitrelay/config.toml"));
    out
}

fn load_file(path: &Path) -> Result<Config> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    toml::from_str(&text).with_context(|| format!("parsing config {}", path.display()))
}
