//! crosslink - pair a phone or browser with a desktop over the LAN
//!
//! A host issues a pairing token (shown as a QR code), clients open a
//! WebSocket, authenticate with `pair`, and then share one socket for
//! clipboard, file transfer, remote input, media control and commands.

pub mod autoconnect;
pub mod config;
pub mod error;
pub mod handlers;
pub mod host;
pub mod mux;
pub mod pairing;
pub mod platform;
pub mod protocol;
pub mod qr;
pub mod registry;
pub mod session;
pub mod transfer;

pub use error::{LinkError, Result, TransferError};
pub use protocol::Message;
