use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tincan_common::messages::CanMessage;
use tincan_common::traits::{CanSendError, CanSender};
use tincan_node::SharedNode;

use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

/// A simulated CAN bus connecting nodes within one test
///
/// Each node gets a [`SimBusPort`]. A frame sent on a port is delivered to every other port and to
/// every external receiver, but not back to the port it came from.
#[derive(Clone, Default)]
pub struct SimBus {
    mailboxes: Arc<Mutex<Vec<VecDeque<CanMessage>>>>,
    // Non-node listeners, e.g. bus loggers
    external_channels: Arc<Mutex<Vec<UnboundedSender<CanMessage>>>>,
}

impl SimBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a node to the bus
    pub fn new_port(&mut self) -> SimBusPort {
        let mut mailboxes = self.mailboxes.lock().unwrap();
        let index = mailboxes.len();
        mailboxes.push(VecDeque::new());
        SimBusPort {
            index,
            bus: self.clone(),
        }
    }

    /// Create a sender for frames which come from outside any node, e.g. an NMT master
    pub fn new_sender(&mut self) -> SimBusSender {
        SimBusSender { bus: self.clone() }
    }

    pub fn new_receiver(&mut self) -> SimBusReceiver {
        let (tx, rx) = unbounded_channel();
        self.external_channels.lock().unwrap().push(tx);
        SimBusReceiver { channel_rx: rx }
    }

    fn broadcast(&self, from: Option<usize>, msg: CanMessage) {
        for (i, mbox) in self.mailboxes.lock().unwrap().iter_mut().enumerate() {
            if Some(i) != from {
                mbox.push_back(msg);
            }
        }
        for ext in self.external_channels.lock().unwrap().iter() {
            // A dropped receiver just stops listening
            ext.send(msg).ok();
        }
    }
}

/// A node's connection to a [`SimBus`]
pub struct SimBusPort {
    index: usize,
    bus: SimBus,
}

impl SimBusPort {
    pub fn try_recv(&mut self) -> Option<CanMessage> {
        self.bus.mailboxes.lock().unwrap()[self.index].pop_front()
    }

    /// Move every frame waiting on this port into the node's receive queue
    pub fn deliver(&mut self, node: &SharedNode<'_>) {
        while let Some(msg) = self.try_recv() {
            if let Err(msg) = node.rx(msg) {
                println!("Node RX queue full, dropping {:?}", msg);
            }
        }
    }
}

impl CanSender for SimBusPort {
    fn send(&mut self, msg: CanMessage) -> Result<(), CanSendError> {
        self.bus.broadcast(Some(self.index), msg);
        Ok(())
    }
}

pub struct SimBusSender {
    bus: SimBus,
}

impl CanSender for SimBusSender {
    fn send(&mut self, msg: CanMessage) -> Result<(), CanSendError> {
        self.bus.broadcast(None, msg);
        Ok(())
    }
}

pub struct SimBusReceiver {
    channel_rx: UnboundedReceiver<CanMessage>,
}

impl SimBusReceiver {
    pub fn try_recv(&mut self) -> Option<CanMessage> {
        self.channel_rx.try_recv().ok()
    }

    pub async fn recv(&mut self) -> Option<CanMessage> {
        self.channel_rx.recv().await
    }

    pub fn flush(&mut self) {
        while self.channel_rx.try_recv().is_ok() {}
    }

    /// Collect every frame received so far
    pub fn drain(&mut self) -> Vec<CanMessage> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}
