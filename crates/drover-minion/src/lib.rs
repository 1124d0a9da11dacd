//! drover-minion — the agent side of the fabric.
//!
//! A minion holds one long-lived dispatch stream to its master. It
//! announces its identity and public key, persists the canonical
//! identity the master hands back, then decrypts each incoming call,
//! refines the target selection against its own facts, executes the
//! command under the call deadline, and ships the encrypted result back.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod agent;
pub mod config;
pub mod runner;

pub use agent::Agent;
pub use config::MinionConfig;
