//! Control link modules.
//!
//! - `client`: connection lifecycle, socket worker and request entry point.
//! - `frame`: reconstruction of discrete messages from the byte stream.
//! - `router`: dispatch of decoded messages to requests or subscribers.
//! - `correlator`: pending-request registration and timeout enforcement.
//! - `proto`: wire message types shared with the device.
//! - `token`: outbound command tokens.
//! - `commands`: typed device commands and telemetry subscriptions.

/// Connection lifecycle and the public request entry point.
pub mod client;
/// Device command methods.
pub mod commands;
/// Request/response correlation.
pub mod correlator;
/// Byte stream framing.
pub mod frame;
/// Wire message types.
pub mod proto;
/// Message dispatch and stream subscriptions.
pub mod router;
/// Outbound command tokens.
pub mod token;
