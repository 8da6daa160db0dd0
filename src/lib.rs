//! Operator-station SDK for the remote vehicle control link.
//!
//! The crate is organized by concern:
//! - `link`: TCP transport, framing, request correlation and telemetry
//!   streams for one device connection.

/// Control link client, protocol types and command surface.
pub mod link;

pub use link::client::{
    CloseReport, ConnectOptions, LinkClient, LinkClientOptions, LinkDefaults, LinkError, LinkState,
};
pub use link::proto::{Message, TransactionId};
pub use link::token::Token;
