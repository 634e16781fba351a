//! A library to implement a CANopen node in Rust
//!
//! Tincan-node implements the CANopen application layer for an embedded node. It is no_std
//! compatible and performs no heap allocation; all storage is owned by the application and
//! referenced by the node. It provides the following features:
//!
//! * An *object dictionary* of typed, permissioned slots, holding a standard set of communication
//!   objects plus the application's own objects.
//! * The *NMT* state machine, reacting to NMT commands and reporting state changes.
//! * A *heartbeat* producer, and consumers monitoring the heartbeats of other nodes.
//! * Transmit and receive *PDOs*, mapping objects into CAN frames.
//! * An *SDO server* giving remote clients access to the dictionary, with expedited, segmented and
//!   block transfers.
//! * An *SDO client* for reading and writing objects on other nodes, either fire-and-forget from
//!   the node or awaited from another task through [`SharedNode`].
//! * *EMCY* transmission and a queue of received emergencies.
//! * Hooks to persist selected object values on command.
//!
//! # Getting Started
//!
//! ## Node Configuration
//!
//! The start-up values of the communication objects come from a
//! [NodeConfig](common::node_config::NodeConfig), which can be built in code or, with the `std`
//! feature, loaded from a TOML file. See the [common::node_config] module docs.
//!
//! ## Objects
//!
//! The application creates the storage for its objects, usually as statics, and lists them as
//! [`ObjectEntry`](object_dict::ObjectEntry) values. The standard objects live in a
//! [`CommonObjects`](object_dict::CommonObjects) instance.
//!
//! ```rust
//! use tincan_node::common::{node_config::NodeConfig, objects::AccessType};
//! use tincan_node::object_dict::{CommonObjects, ObjectEntry, ScalarField, SlotRef};
//! use tincan_node::{Callbacks, CanOpenNode};
//!
//! static COMMON: CommonObjects = CommonObjects::new();
//! static SPEED: ScalarField<u16> = ScalarField::<u16>::new(0);
//!
//! let config = NodeConfig::new(5);
//! let app = [ObjectEntry::new(0x2000, AccessType::Rw, SlotRef::U16(&SPEED)).persist(true)];
//! let node = CanOpenNode::init(&config, &COMMON, &app, Callbacks::default()).unwrap();
//! assert_eq!(5, node.node_id().raw());
//! ```
//!
//! ## Handling CAN messages
//!
//! The application handles the CAN controller. Received frames are passed to
//! [`CanOpenNode::rx`], and [`CanOpenNode::step`] must be called periodically with the number of
//! milliseconds since the previous call. Frames the node produces are handed to a
//! [`CanSender`](common::traits::CanSender) during `step`.
//!
//! ```ignore
//! loop {
//!     while let Some(frame) = can.receive() {
//!         node.rx(frame).ok();
//!     }
//!     node.step(10, &mut can_tx);
//!     delay_ms(10);
//! }
//! ```
//!
//! ## Register callbacks
//!
//! [`Callbacks`] notify the application of object writes and NMT state changes, and give the node
//! a [`ParameterStore`](storage::ParameterStore) for the store and restore commands.
#![cfg_attr(all(not(test), not(feature = "std")), no_std)]
#![warn(missing_docs, missing_debug_implementations)]
#![cfg_attr(docsrs, feature(doc_cfg))]

mod delay;
pub mod emcy;
pub mod heartbeat;
pub mod nmt;
mod node;
pub mod object_dict;
pub mod pdo;
pub mod persist;
pub mod sdo_client;
mod sdo_server;
mod shared;
pub mod storage;

// Re-export types used by applications
pub use critical_section;
pub use tincan_common as common;

pub use delay::Delay;
pub use node::{CanOpenNode, Callbacks, InitError, RX_QUEUE_SIZE, TX_QUEUE_SIZE};
pub use sdo_client::SdoClientError;
pub use sdo_server::{SdoServer, ServerOutput, SDO_BUFFER_SIZE};
pub use shared::SharedNode;
