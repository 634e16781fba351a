//! Common functionality shared among tincan crates.
//!
//! This crate holds the CAN frame types, the encoding of the CANopen messages handled by a node
//! (NMT, heartbeat, EMCY and the SDO command bytes), the SDO abort codes, and the node
//! configuration. Most users reach it through the `tincan_node::common` re-export.
#![cfg_attr(not(feature = "std"), no_std)]
#![warn(missing_docs, missing_copy_implementations)]
#![cfg_attr(docsrs, feature(doc_cfg))]

mod atomic_cell;
pub use atomic_cell::AtomicCell;
pub mod constants;
pub mod messages;
pub mod node_config;
pub mod node_id;
pub mod objects;
pub mod sdo;
pub mod traits;

pub use node_id::NodeId;

pub use messages::{CanId, CanMessage};
