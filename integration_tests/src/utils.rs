#![allow(dead_code)]
use std::future::Future;

use crate::sim_bus::{SimBusPort, SimBusReceiver};
use tincan_common::{
    messages::CanOpenMessage,
    sdo::{SdoRequest, SdoResponse},
    CanMessage,
};
use tincan_common::node_config::NodeConfig;
use tincan_node::{
    object_dict::{CommonObjects, ObjectEntry},
    Callbacks, CanOpenNode, SharedNode,
};

/// Route log output to the test harness
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Create a node without callbacks, wrapped for use from several tasks
pub fn shared_node<'a>(
    config: &'a NodeConfig,
    common: &'a CommonObjects,
    app: &[ObjectEntry<'a>],
) -> SharedNode<'a> {
    let node = CanOpenNode::init(config, common, app, Callbacks::default()).unwrap();
    SharedNode::new(node)
}

/// Deliver pending frames to each node and run one step of each
pub fn step_all(nodes: &mut [(&SharedNode<'_>, SimBusPort)], elapsed_ms: u32) {
    for (node, port) in nodes.iter_mut() {
        port.deliver(node);
        node.step(elapsed_ms, port);
    }
}

/// Run `test_task` while the nodes are stepped in the background, once per millisecond
pub async fn test_with_background_process<T>(
    nodes: &mut [(&SharedNode<'_>, SimBusPort)],
    test_task: impl Future<Output = T>,
) -> T {
    // Step once, so the nodes have booted before the test sends requests
    step_all(nodes, 0);

    let node_process_task = async move {
        loop {
            tokio::time::sleep(tokio::time::Duration::from_millis(1)).await;
            step_all(nodes, 1);
        }
    };

    tokio::select! {
        _ = node_process_task => panic!("Node process task exited"),
        test_result = test_task => test_result
    }
}

/// Decode a frame for printing
fn describe(msg: &CanMessage) -> String {
    match CanOpenMessage::try_from(msg) {
        Ok(CanOpenMessage::SdoRequest { node, data }) => match SdoRequest::try_from(&data[..]) {
            Ok(req) => format!("SDO to {}: {:?}", node, req),
            Err(_) => format!("SDO to {}: {:02x?}", node, data),
        },
        Ok(CanOpenMessage::SdoResponse { node, data }) => match SdoResponse::try_from(&data[..]) {
            Ok(resp) => format!("SDO from {}: {:?}", node, resp),
            Err(_) => format!("SDO from {}: {:02x?}", node, data),
        },
        Ok(parsed) => format!("{:?}", parsed),
        Err(_) => format!("{:?}", msg),
    }
}

/// Prints all bus traffic when dropped
pub struct BusLogger {
    rx: SimBusReceiver,
}

impl BusLogger {
    pub fn new(rx: SimBusReceiver) -> Self {
        Self { rx }
    }

    pub fn print(&mut self) {
        println!("Bus message history");
        println!("-------------------");
        while let Some(msg) = self.rx.try_recv() {
            println!("{}", describe(&msg));
        }
    }
}

impl Drop for BusLogger {
    fn drop(&mut self) {
        self.print();
    }
}
