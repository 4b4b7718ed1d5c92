//! Engine limits. Hosts usually embed this as an `[engine]` table in their own config file.

use serde::Deserialize;

/// Default ceiling on concurrently open connections.
pub const DEFAULT_MAX_CONNECTIONS: usize = 32;

/// Default size limit for a buffered HTTP response head (status line + headers).
pub const DEFAULT_MAX_HEADER_BYTES: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// Connections that may be open at once; further opens fail with `MAX`.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Response-head buffer limit; a head that does not fit fails with `INTERNAL`.
    #[serde(default = "default_max_header_bytes")]
    pub max_header_bytes: usize,
    /// Whether the host can open `btspp://` (RFCOMM) connections.
    #[serde(default)]
    pub bluetooth_available: bool,
}

fn default_max_connections() -> usize {
    DEFAULT_MAX_CONNECTIONS
}
fn default_max_header_bytes() -> usize {
    DEFAULT_MAX_HEADER_BYTES
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_header_bytes: default_max_header_bytes(),
            bluetooth_available: false,
        }
    }
}
