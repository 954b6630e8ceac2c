//! Engine-wide settings, loaded from TOML.
//!
//! Every field has a `serde(default)`, so a partial file (or no file at all,
//! via [`EngineConfig::default`]) is legal. This is the concrete stand-in for
//! the "configuration loading" collaborator the core spec treats as external.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}")]
    Read {
        path: PathBuf,
        #[source]
        cause: std::io::Error,
    },
    #[error("failed to parse config file {path}")]
    Parse {
        path: PathBuf,
        #[source]
        cause: toml::de::Error,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of sandbox slots in the isolation pool.
    pub slot_count: u32,
    /// `slot N` is bound to uid `base_uid + N`.
    pub base_uid: u32,
    /// `slot N` is bound to gid `base_gid + N`.
    pub base_gid: u32,
    /// Root directory under which `<slot_id>/` scratch directories live.
    pub isolate_root: PathBuf,
    /// Per-stream output cap applied when a request does not specify one.
    pub default_max_output_bytes: usize,
    /// Hard ceiling on any per-job memory limit, regardless of request.
    pub memory_ceiling_bytes: u64,
    /// Max concurrently-executing jobs for a single client identity.
    pub per_client_concurrency_cap: u32,
    /// Max concurrently-executing jobs across all clients.
    pub global_concurrency_cap: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            slot_count: 8,
            base_uid: 65_536,
            base_gid: 65_536,
            isolate_root: PathBuf::from("/var/lib/warden/isolate"),
            default_max_output_bytes: 1 << 20, // 1 MiB
            memory_ceiling_bytes: 1 << 30,     // 1 GiB
            per_client_concurrency_cap: 4,
            global_concurrency_cap: 64,
        }
    }
}

impl EngineConfig {
    /// Loads and parses a TOML config file, falling back to defaults for
    /// any field the file omits.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|cause| ConfigError::Read {
            path: path.to_path_buf(),
            cause,
        })?;
        toml::from_str(&content).map_err(|cause| ConfigError::Parse {
            path: path.to_path_buf(),
            cause,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_internally_consistent() {
        let cfg = EngineConfig::default();
        assert!(cfg.slot_count > 0);
        assert!(cfg.per_client_concurrency_cap <= cfg.global_concurrency_cap);
    }

    #[test]
    fn partial_toml_fills_in_defaults() {
        let cfg: EngineConfig = toml::from_str("slot_count = 2\n").unwrap();
        assert_eq!(cfg.slot_count, 2);
        assert_eq!(cfg.base_uid, EngineConfig::default().base_uid);
    }

    #[test]
    fn load_missing_file_is_read_error() {
        let err = EngineConfig::load("/nonexistent/warden.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
