//! Relay client module
//!
//! Reconnecting client for a single room, used by the `connect` subcommand.

mod backoff;
#[allow(dead_code)]
mod connector;

#[allow(unused_imports)]
pub use backoff::*;
pub use connector::*;
