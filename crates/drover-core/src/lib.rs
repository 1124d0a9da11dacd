//! # drover-core
//!
//! Shared building blocks for the drover command-execution fabric.
//!
//! This crate carries everything both sides of the wire need to agree on:
//!
//! - **Data model**: minion identity records, trust states, call requests
//!   and responses, reports ([`minion`], [`call`])
//! - **Selector engine**: the compound target-selection expression language
//!   ([`select`])
//! - **Crypto**: chunked RSA session encryption and PEM key handling
//!   ([`crypto`])
//! - **Wire protocol**: protobuf messages and the length-prefixed frame
//!   codec ([`proto`])
//! - **Call-id allocation**: process-unique 31-bit call identifiers
//!   ([`idpool`])

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod call;
pub mod crypto;
pub mod error;
pub mod idpool;
pub mod minion;
pub mod proto;
pub mod select;

pub use call::{CallRequest, CallResponse, Report, ReportItem, ResultType};
pub use error::{Error, ErrorKind, Result};
pub use minion::{Minion, MinionKey, MinionState};
pub use select::{Selection, SelectionOptions, SelectionTarget};
