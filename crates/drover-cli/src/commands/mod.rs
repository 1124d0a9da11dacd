//! droverctl subcommands.

pub mod call;
pub mod key;
