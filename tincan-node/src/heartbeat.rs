//! Heartbeat producer and consumer
//!
//! Both re-read their configuration from the object dictionary on every tick, so changes made
//! over SDO take effect without a restart.

use defmt_or_log::{info, warn};
use tincan_common::{constants::sizes::MAX_HEARTBEAT_CONSUMERS, messages::Heartbeat, CanMessage};

use crate::delay::Delay;

/// Schedules the node's own heartbeat
#[derive(Debug, Default)]
pub struct HeartbeatProducer {
    timer: Delay,
}

impl HeartbeatProducer {
    /// Create a stopped producer
    pub const fn new() -> Self {
        Self { timer: Delay::Idle }
    }

    /// Stop the producer. It re-arms on the next tick.
    pub fn reset(&mut self) {
        self.timer.stop();
    }

    /// Advance by `elapsed_ms`, with the currently configured period
    ///
    /// Returns true when a heartbeat is due. A period of 0 disables the producer. A stopped
    /// producer arms on this call without counting down, so the first heartbeat follows one full
    /// period later.
    pub fn tick(&mut self, period_ms: u16, elapsed_ms: u32) -> bool {
        if period_ms == 0 {
            self.timer.stop();
            return false;
        }
        if !self.timer.is_running() {
            self.timer.set(period_ms as u32);
            return false;
        }
        self.timer.clamp(period_ms as u32);
        self.timer.elapse(elapsed_ms);
        if self.timer.expired() {
            self.timer.set(period_ms as u32);
            true
        } else {
            false
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Consumer {
    node_id: u8,
    timeout_ms: u16,
    remaining: Delay,
}

impl Consumer {
    /// Decode a word of object 0x1016: node ID in bits 16-23, timeout in bits 0-15
    fn from_word(word: u32) -> Option<(u8, u16)> {
        let node_id = ((word >> 16) & 0xFF) as u8;
        let timeout_ms = (word & 0xFFFF) as u16;
        if node_id == 0 || node_id > 127 || timeout_ms == 0 {
            None
        } else {
            Some((node_id, timeout_ms))
        }
    }
}

/// Tracks the liveness of remote nodes
#[derive(Debug, Default)]
pub struct HeartbeatConsumers {
    entries: [Option<Consumer>; MAX_HEARTBEAT_CONSUMERS],
}

impl HeartbeatConsumers {
    /// Create with no monitored nodes
    pub const fn new() -> Self {
        Self {
            entries: [None; MAX_HEARTBEAT_CONSUMERS],
        }
    }

    /// Forget all entries. They are re-armed from the configuration on the next tick.
    pub fn reset(&mut self) {
        self.entries = [None; MAX_HEARTBEAT_CONSUMERS];
    }

    fn sync(&mut self, words: &[u32]) {
        for (i, entry) in self.entries.iter_mut().enumerate() {
            let configured = words.get(i).and_then(|w| Consumer::from_word(*w));
            match (configured, entry.as_ref()) {
                (None, _) => *entry = None,
                (Some((node_id, timeout_ms)), Some(c))
                    if c.node_id == node_id && c.timeout_ms == timeout_ms => {}
                (Some((node_id, timeout_ms)), _) => {
                    let mut remaining = Delay::Idle;
                    remaining.set(timeout_ms as u32);
                    *entry = Some(Consumer {
                        node_id,
                        timeout_ms,
                        remaining,
                    });
                }
            }
        }
    }

    /// Advance all countdowns by `elapsed_ms`
    ///
    /// `words` are the current values of the consumer heartbeat time array. A changed entry is
    /// re-armed.
    pub fn tick(&mut self, words: &[u32], elapsed_ms: u32) {
        self.sync(words);
        for c in self.entries.iter_mut().flatten() {
            let was_expired = c.remaining.expired();
            c.remaining.elapse(elapsed_ms);
            if !was_expired && c.remaining.expired() {
                warn!("Heartbeat from node {} timed out", c.node_id);
            }
        }
    }

    /// Restart the countdown of the sender if `msg` is a heartbeat from a monitored node
    pub fn handle_message(&mut self, msg: &CanMessage) {
        let Ok(hb) = Heartbeat::try_from(msg) else {
            return;
        };
        for c in self.entries.iter_mut().flatten() {
            if c.node_id == hb.node {
                if c.remaining.expired() {
                    info!("Heartbeat from node {} resumed", c.node_id);
                }
                c.remaining.set(c.timeout_ms as u32);
            }
        }
    }

    /// Returns true if `node_id` is monitored and its heartbeat timed out
    pub fn is_expired(&self, node_id: u8) -> bool {
        self.entries
            .iter()
            .flatten()
            .any(|c| c.node_id == node_id && c.remaining.expired())
    }
}
