pub mod sim_bus;
pub mod utils;

pub mod prelude {
    pub use super::sim_bus::{SimBus, SimBusPort, SimBusReceiver, SimBusSender};
    pub use super::utils::{
        init_logging, shared_node, step_all, test_with_background_process, BusLogger,
    };
    pub use tincan_common::{
        messages::{Emergency, Heartbeat, NmtCommand, NmtCommandSpecifier, NmtState},
        node_config::{HeartbeatConsumerConfig, NodeConfig, PdoConfig, PdoMappingConfig},
        objects::AccessType,
        sdo::{AbortCode, RawAbortCode},
        traits::CanSender,
        CanId, CanMessage, NodeId,
    };
    pub use tincan_node::{
        object_dict::{CommonObjects, ObjectEntry, ScalarField, SlotRef, StringField},
        Callbacks, CanOpenNode, SdoClientError, SharedNode,
    };
}
