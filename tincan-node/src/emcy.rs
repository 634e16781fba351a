//! Emergency message reception
use defmt_or_log::{debug, warn};
use heapless::Deque;
use tincan_common::{
    messages::{node_from_cob_id, Emergency, EMCY_BASE},
    CanMessage, NodeId,
};

/// Number of received emergencies held until the application pops them
pub const EMCY_QUEUE_SIZE: usize = 16;

/// A bounded queue of emergencies received from other nodes
///
/// When full, the oldest entry is dropped to make room.
#[derive(Debug, Default)]
pub struct EmcyQueue {
    queue: Deque<Emergency, EMCY_QUEUE_SIZE>,
}

impl EmcyQueue {
    /// Create an empty queue
    pub const fn new() -> Self {
        Self {
            queue: Deque::new(),
        }
    }

    /// Queue `msg` if it is an emergency from a node other than `own_id`
    pub fn handle_message(&mut self, msg: &CanMessage, own_id: NodeId) {
        match node_from_cob_id(msg.id(), EMCY_BASE) {
            Some(node) if node != own_id.raw() => {}
            _ => return,
        }
        let emcy = match Emergency::try_from(msg) {
            Ok(emcy) => emcy,
            Err(e) => {
                debug!("Ignoring malformed EMCY: {:?}", e);
                return;
            }
        };
        if self.queue.is_full() {
            if let Some(dropped) = self.queue.pop_front() {
                warn!(
                    "EMCY queue full, dropping 0x{:04x} from node {}",
                    dropped.error_code, dropped.node
                );
            }
        }
        // Cannot fail, a slot was freed above
        let _ = self.queue.push_back(emcy);
    }

    /// Remove and return the oldest received emergency
    pub fn pop(&mut self) -> Option<Emergency> {
        self.queue.pop_front()
    }

    /// Number of queued emergencies
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// True if no emergencies are queued
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
