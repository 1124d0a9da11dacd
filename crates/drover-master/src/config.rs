//! Master configuration.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use drover_core::{Error, Result};

/// Daemon configuration, loaded from TOML and overridable by flags.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MasterConfig {
    /// TCP address the dispatch listener binds, e.g. `0.0.0.0:4506`.
    pub listen: String,
    /// Path of the operator Unix socket.
    pub operator_socket: PathBuf,
    /// Root directory for the trust store.
    pub data_dir: PathBuf,
    /// Approve every minion automatically at first contact.
    pub auto_sign: bool,
    /// Reject every minion automatically at first contact.
    pub auto_denied: bool,
    /// Deadline in seconds applied to calls that do not carry their own
    /// timeout.
    pub call_timeout_default: i64,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:4506".to_string(),
            operator_socket: PathBuf::from("/run/drover/operator.sock"),
            data_dir: PathBuf::from("/var/lib/drover"),
            auto_sign: false,
            auto_denied: false,
            call_timeout_default: 10,
        }
    }
}

impl MasterConfig {
    /// Loads configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns `bad-request` when the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .map_err(|e| Error::bad_request(format!("read {}: {e}", path.display())))?;
        toml::from_str(&data)
            .map_err(|e| Error::bad_request(format!("parse {}: {e}", path.display())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_partial_toml_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("master.toml");
        std::fs::write(&path, "listen = \"127.0.0.1:7000\"\nauto_sign = true\n").unwrap();

        let cfg = MasterConfig::load(&path).unwrap();
        assert_eq!(cfg.listen, "127.0.0.1:7000");
        assert!(cfg.auto_sign);
        assert!(!cfg.auto_denied);
        assert_eq!(cfg.data_dir, PathBuf::from("/var/lib/drover"));
        assert_eq!(cfg.call_timeout_default, 10);
    }

    #[test]
    fn call_timeout_default_is_overridable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("master.toml");
        std::fs::write(&path, "call_timeout_default = 30\n").unwrap();
        assert_eq!(MasterConfig::load(&path).unwrap().call_timeout_default, 30);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("master.toml");
        std::fs::write(&path, "listne = \"oops\"\n").unwrap();
        assert!(MasterConfig::load(&path).is_err());
    }
}
