//! Load config from file and environment.

use netconn_core::EngineConfig;
use serde::Deserialize;
use std::path::PathBuf;

/// Host configuration. File: ~/.config/netconn/config.toml or /etc/netconn/config.toml.
/// Env overrides: NETCONN_MAX_CONNECTIONS, NETCONN_MAX_HEADER_BYTES, NETCONN_READ_CHUNK.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Bytes requested per body read (default 4096).
    #[serde(default = "default_read_chunk")]
    pub read_chunk: usize,
    /// Log filter used when RUST_LOG is unset (default "info").
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
    #[serde(default)]
    pub engine: EngineConfig,
}

fn default_read_chunk() -> usize {
    4096
}
fn default_log_filter() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            read_chunk: default_read_chunk(),
            log_filter: default_log_filter(),
            engine: EngineConfig::default(),
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    apply_env(&mut c, |k| std::env::var(k).ok());
    c
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(n) = var("NETCONN_MAX_CONNECTIONS").and_then(|s| s.parse().ok()) {
        c.engine.max_connections = n;
    }
    if let Some(n) = var("NETCONN_MAX_HEADER_BYTES").and_then(|s| s.parse().ok()) {
        c.engine.max_header_bytes = n;
    }
    if let Some(n) = var("NETCONN_READ_CHUNK").and_then(|s| s.parse::<usize>().ok()) {
        if n > 0 {
            c.read_chunk = n;
        }
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/netconn/config.toml"));
    }
    out.push(PathBuf::from("/etc/netconn/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            match std::fs::read_to_string(&p).map(|s| toml::from_str::<Config>(&s)) {
                Ok(Ok(c)) => return Some(c),
                Ok(Err(e)) => eprintln!("netconn: ignoring {}: {}", p.display(), e),
                Err(e) => eprintln!("netconn: cannot read {}: {}", p.display(), e),
            }
            break;
        }
    }
    None
}
