//! Configuration module
//!
//! Loads relay and client settings from a TOML file.

mod relay;

pub use relay::*;
