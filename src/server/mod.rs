//! Relay server module
//!
//! Accepts WebSocket connections from chat clients, groups them into rooms and
//! fans inbound messages out to the other members of each room.

#[allow(dead_code)]
mod connection;
#[allow(dead_code)]
mod handler;
mod protocol;
#[allow(dead_code)]
mod registry;
#[allow(dead_code)]
mod websocket;

#[allow(unused_imports)]
pub use connection::*;
#[allow(unused_imports)]
pub use handler::*;
pub use protocol::*;
#[allow(unused_imports)]
pub use registry::*;
pub use websocket::*;
