//! SDO server
//!
//! The server answers requests from a single client on `0x600 + node_id`. Expedited, segmented
//! and block transfers are supported in both directions; block transfers are limited to string
//! objects.
mod sdo_server;

pub use sdo_server::{SdoServer, ServerOutput};

/// Enough for 127 segments of 7 bytes
///
/// This bounds the size of any segmented or block transfer.
pub const SDO_BUFFER_SIZE: usize = 889;
