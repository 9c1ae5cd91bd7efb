//! Relay between a game running on this machine and a multiplayer server.
//!
//! The relay looks like this:
//! Game => loopback TCP => this crate => reliable stream and datagrams => multiplayer server
//!
//! # Relaying process
//! The game connects to a loopback listener and sends length-prefixed frames
//! (`<decimal length>><payload>`). Each frame is routed to the server based on
//! its one-byte message code: acknowledged and reliable messages travel over the
//! reliable stream, everything else over UDP datagrams tagged with the client's
//! session id. Payloads larger than a threshold are zlib-compressed and tagged.
//!
//! Traffic from the server is inflated if needed, inspected for control codes
//! (ping replies, map status), and otherwise forwarded to the game as
//! newline-terminated text.
//!
//! Only one remote session exists at a time. If the game reconnects while that
//! session is still alive, the relay shuts down; once the server side has
//! ended, the next game connection gets a fresh session.

pub mod compression;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod game_link;
pub mod heartbeat;
pub mod lifecycle;
pub mod message;
pub mod multiplexer;
pub mod relay;
pub mod remote;
pub mod state;

pub use error::RelayError;
pub use lifecycle::Lifecycle;
pub use relay::Relay;
