//! Minion identity records and trust states.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Trust state of a minion inside the master's store.
///
/// Only [`MinionState::Accepted`] and [`MinionState::AutoSign`] are
/// eligible for command dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MinionState {
    /// Seen, awaiting operator approval.
    Unaccepted,
    /// Approved explicitly by an operator.
    Accepted,
    /// Approved automatically at first contact.
    AutoSign,
    /// Rejected automatically at first contact.
    Denied,
    /// Rejected by an operator after being seen.
    Rejected,
}

impl MinionState {
    /// All states, in bucket-listing order.
    pub const ALL: [Self; 5] = [
        Self::Unaccepted,
        Self::Accepted,
        Self::AutoSign,
        Self::Denied,
        Self::Rejected,
    ];

    /// Canonical string persisted in the `state` file.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unaccepted => "unaccepted",
            Self::Accepted => "accepted",
            Self::AutoSign => "auto_sign",
            Self::Denied => "denied",
            Self::Rejected => "rejected",
        }
    }

    /// True when this state allows command dispatch.
    #[must_use]
    pub const fn is_eligible(self) -> bool {
        matches!(self, Self::Accepted | Self::AutoSign)
    }
}

impl fmt::Display for MinionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MinionState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "unaccepted" => Ok(Self::Unaccepted),
            "accepted" => Ok(Self::Accepted),
            "auto_sign" => Ok(Self::AutoSign),
            "denied" => Ok(Self::Denied),
            "rejected" => Ok(Self::Rejected),
            other => Err(Error::bad_request(format!("unknown minion state: {other}"))),
        }
    }
}

/// Identity record of one minion.
///
/// The `name` is chosen by the minion and immutable; it uniquely
/// identifies the record in the trust store. The `uid` is issued once by
/// the master and persisted by the minion. Timestamps are Unix seconds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Minion {
    /// Unique, minion-chosen name.
    pub name: String,
    /// Stable identifier issued by the master at first contact.
    #[serde(default)]
    pub uid: String,
    /// Reported hostname.
    #[serde(default)]
    pub hostname: String,
    /// Address the minion connected from, or the one it reported.
    #[serde(default)]
    pub ip: String,
    /// Operating system, e.g. `linux`.
    #[serde(default)]
    pub os: String,
    /// CPU architecture, e.g. `x86_64`.
    #[serde(default)]
    pub arch: String,
    /// Minion software version.
    #[serde(default)]
    pub version: String,
    /// Host groups the minion belongs to.
    #[serde(default)]
    pub groups: Vec<String>,
    /// Free-form key/value tags reported by the minion.
    #[serde(default)]
    pub tags: HashMap<String, String>,
    /// When the record was first created.
    #[serde(default)]
    pub registry_timestamp: i64,
    /// When the minion last attached.
    #[serde(default)]
    pub online_timestamp: i64,
    /// When the minion last detached.
    #[serde(default)]
    pub offline_timestamp: i64,
}

impl Minion {
    /// Static facts derived from the identity, used as selector grains.
    ///
    /// The reported tags are merged in; reserved keys win over tags.
    #[must_use]
    pub fn grains(&self) -> HashMap<String, String> {
        let mut grains = self.tags.clone();
        grains.insert("os".to_string(), self.os.clone());
        grains.insert("arch".to_string(), self.arch.clone());
        grains.insert("hostname".to_string(), self.hostname.clone());
        grains.insert("version".to_string(), self.version.clone());
        grains
    }
}

/// A minion identity plus its public key and trust state — the unit
/// consumed by operator key-management commands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MinionKey {
    /// The identity record.
    pub minion: Minion,
    /// PEM-encoded public key.
    pub public_key: String,
    /// Current trust state.
    pub state: MinionState,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_string_round_trip() {
        for state in MinionState::ALL {
            assert_eq!(state.as_str().parse::<MinionState>().unwrap(), state);
        }
    }

    #[test]
    fn only_accepted_and_autosign_are_eligible() {
        assert!(MinionState::Accepted.is_eligible());
        assert!(MinionState::AutoSign.is_eligible());
        assert!(!MinionState::Unaccepted.is_eligible());
        assert!(!MinionState::Denied.is_eligible());
        assert!(!MinionState::Rejected.is_eligible());
    }

    #[test]
    fn grains_merge_reserved_keys_over_tags() {
        let mut tags = HashMap::new();
        tags.insert("os".to_string(), "spoofed".to_string());
        tags.insert("role".to_string(), "web".to_string());
        let minion = Minion {
            name: "m1".to_string(),
            os: "linux".to_string(),
            tags,
            ..Minion::default()
        };
        let grains = minion.grains();
        assert_eq!(grains.get("os").map(String::as_str), Some("linux"));
        assert_eq!(grains.get("role").map(String::as_str), Some("web"));
    }

    #[test]
    fn identity_json_round_trip() {
        let minion = Minion {
            name: "db01".to_string(),
            uid: "u-1".to_string(),
            hostname: "db01.internal".to_string(),
            ip: "10.0.0.8".to_string(),
            os: "linux".to_string(),
            arch: "aarch64".to_string(),
            version: "0.1.0".to_string(),
            registry_timestamp: 1_700_000_000,
            ..Minion::default()
        };
        let data = serde_json::to_vec_pretty(&minion).unwrap();
        let back: Minion = serde_json::from_slice(&data).unwrap();
        assert_eq!(back, minion);
    }
}
