//! Minion configuration.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use drover_core::{Error, Result};

/// Agent configuration, loaded from TOML and overridable by flags.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MinionConfig {
    /// Unique minion name. Empty means "use the hostname".
    pub name: String,
    /// Master dispatch address, e.g. `master.internal:4506`.
    pub master: String,
    /// Directory for the key pair and persisted identity.
    pub data_dir: PathBuf,
    /// Host groups this minion belongs to.
    pub groups: Vec<String>,
    /// Extra grains merged over the built-in ones.
    pub grains: HashMap<String, String>,
    /// Pillar data used for target refinement.
    pub pillars: HashMap<String, String>,
}

impl Default for MinionConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            master: "127.0.0.1:4506".to_string(),
            data_dir: PathBuf::from("/var/lib/drover-minion"),
            groups: Vec::new(),
            grains: HashMap::new(),
            pillars: HashMap::new(),
        }
    }
}

impl MinionConfig {
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
