//! The node front-end
//!
//! [`CanOpenNode`] owns every protocol engine and the object dictionary. The application feeds it
//! received frames with [`CanOpenNode::rx`] and calls [`CanOpenNode::step`] periodically with the
//! time elapsed since the previous call. All processing and all transmission happen inside `step`.

use defmt_or_log::{debug, info, warn};
use heapless::Deque;
use snafu::{ResultExt as _, Snafu};
use tincan_common::{
    constants::{object_ids, sizes::MAX_HEARTBEAT_CONSUMERS, values},
    messages::{Emergency, Heartbeat, NmtState, SDO_REQ_BASE, SDO_RESP_BASE},
    node_config::{ConfigError, NodeConfig},
    objects::ObjectId,
    sdo::{AbortCode, SdoResponse},
    traits::CanSender,
    CanId, CanMessage, NodeId,
};

use crate::{
    emcy::EmcyQueue,
    heartbeat::{HeartbeatConsumers, HeartbeatProducer},
    nmt::{Nmt, NmtAction},
    object_dict::{CommonObjects, ObjectDictionary, ObjectEntry, OdError},
    pdo::PdoEngine,
    sdo_client::{SdoClient, SdoClientError},
    sdo_server::SdoServer,
    storage::ParameterStore,
};

/// Number of received frames buffered between calls to `step`
pub const RX_QUEUE_SIZE: usize = 32;
/// Number of frames produced outside of `step` which can wait for the next call
pub const TX_QUEUE_SIZE: usize = 16;

/// Errors returned by [`CanOpenNode::init`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Snafu)]
pub enum InitError {
    /// The node config is not usable
    #[snafu(display("Invalid node config: {source}"))]
    Config {
        /// The validation failure
        source: ConfigError,
    },
    /// The object dictionary could not be built
    #[snafu(display("Invalid object dictionary: {source}"))]
    ObjectDict {
        /// The construction failure
        source: OdError,
    },
}

/// Application hooks called by the node
#[derive(Default)]
pub struct Callbacks<'a> {
    /// Called after an object was written over SDO or by an RPDO, with its index and sub
    pub on_write: Option<&'a mut (dyn FnMut(u16, u8) + Send)>,
    /// Called whenever the NMT state changes
    pub on_state_change: Option<&'a mut (dyn FnMut(NmtState) + Send)>,
    /// Storage for persisted objects
    pub store: Option<&'a mut (dyn ParameterStore + Send)>,
}

impl core::fmt::Debug for Callbacks<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Callbacks")
            .field("on_write", &self.on_write.is_some())
            .field("on_state_change", &self.on_state_change.is_some())
            .field("store", &self.store.is_some())
            .finish()
    }
}

fn queue_frame(queue: &mut Deque<CanMessage, TX_QUEUE_SIZE>, msg: CanMessage) {
    if queue.push_back(msg).is_err() {
        warn!("TX queue full, dropping frame to {:?}", msg.id());
    }
}

fn transmit(sender: &mut dyn CanSender, msg: CanMessage) {
    if let Err(e) = sender.send(msg) {
        warn!("Failed to send frame to {:?}, dropping it", e.0.id());
    }
}

/// Run the node's own handling of a completed object write
///
/// Writing the command value to 0x1010 sub 1 saves the persisted objects, and writing it to 0x1011
/// sub 1 clears them. Both command objects read back as 1 afterwards.
fn handle_store_commands(
    od: &ObjectDictionary<'_>,
    common: &CommonObjects,
    store: &mut Option<&mut (dyn ParameterStore + Send)>,
    object: ObjectId,
) -> Result<(), AbortCode> {
    let (command, slot) = match (object.index, object.sub) {
        (object_ids::STORE_PARAMETERS, 1) => (values::SAVE_CMD, &common.store_parameters[0]),
        (object_ids::RESTORE_DEFAULTS, 1) => (values::LOAD_CMD, &common.restore_defaults[0]),
        _ => return Ok(()),
    };
    let value = slot.load();
    slot.store(values::COMMAND_SUPPORTED);
    if value != command {
        warn!("Invalid command 0x{:08x} written to 0x{:x}", value, object.index);
        return Err(AbortCode::CantStore);
    }
    let Some(store) = store.as_mut() else {
        warn!("No parameter store, cannot handle 0x{:x}", object.index);
        return Err(AbortCode::CantStore);
    };
    let result = if object.index == object_ids::STORE_PARAMETERS {
        store.save(od)
    } else {
        store.clear()
    };
    result.map_err(|e| {
        warn!("Parameter storage failed: {:?}", e);
        AbortCode::CantStore
    })
}

/// A CANopen node
pub struct CanOpenNode<'a> {
    config: &'a NodeConfig,
    common: &'a CommonObjects,
    od: ObjectDictionary<'a>,
    node_id: NodeId,
    nmt: Nmt,
    heartbeat: HeartbeatProducer,
    consumers: HeartbeatConsumers,
    pdo: PdoEngine,
    sdo_server: SdoServer,
    sdo_client: SdoClient,
    emcy: EmcyQueue,
    rx_queue: Deque<CanMessage, RX_QUEUE_SIZE>,
    tx_queue: Deque<CanMessage, TX_QUEUE_SIZE>,
    callbacks: Callbacks<'a>,
}

impl core::fmt::Debug for CanOpenNode<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CanOpenNode")
            .field("node_id", &self.node_id)
            .field("state", &self.nmt.state())
            .field("sdo_server", &self.sdo_server)
            .field("sdo_client", &self.sdo_client)
            .field("callbacks", &self.callbacks)
            .finish()
    }
}

impl<'a> CanOpenNode<'a> {
    /// Create a node
    ///
    /// Builds the object dictionary from `common` and `app_objects`, writes the configured values
    /// into the common objects and loads any stored parameters. The node starts in
    /// [`NmtState::BootUp`] and moves to PreOperational on the first call to `step`.
    pub fn init(
        config: &'a NodeConfig,
        common: &'a CommonObjects,
        app_objects: &[ObjectEntry<'a>],
        callbacks: Callbacks<'a>,
    ) -> Result<Self, InitError> {
        config.validate().context(ConfigSnafu)?;
        let od = ObjectDictionary::new(common, app_objects).context(ObjectDictSnafu)?;
        let node_id = NodeId::new(config.node_id)
            .map_err(|_| ConfigError::InvalidNodeId {
                value: config.node_id,
            })
            .context(ConfigSnafu)?;

        let mut node = Self {
            config,
            common,
            od,
            node_id,
            nmt: Nmt::new(),
            heartbeat: HeartbeatProducer::new(),
            consumers: HeartbeatConsumers::new(),
            pdo: PdoEngine::new(),
            sdo_server: SdoServer::new(config.sdo_timeout_ms),
            sdo_client: SdoClient::new(),
            emcy: EmcyQueue::new(),
            rx_queue: Deque::new(),
            tx_queue: Deque::new(),
            callbacks,
        };
        node.start(node_id);
        Ok(node)
    }

    /// Bring every component to its start-up state, using `node_id`
    fn start(&mut self, node_id: NodeId) {
        self.common.apply_config(self.config, node_id);
        if let Some(store) = self.callbacks.store.as_mut() {
            if let Err(e) = store.load(&self.od) {
                warn!("Failed to load stored parameters: {:?}", e);
            }
        }
        // A stored node ID takes effect now
        self.node_id = match self.od.read_u8(object_ids::NODE_ID, 0).map(NodeId::new) {
            Ok(Ok(id)) => id,
            _ => {
                warn!("Invalid node ID in 0x100B, using {}", node_id.raw());
                self.common.node_id.store(node_id.raw());
                node_id
            }
        };

        self.nmt.reset();
        self.heartbeat.reset();
        self.consumers.reset();
        let words = self.consumer_words();
        self.consumers.tick(&words, 0);
        self.pdo.reset();
        self.sdo_server.reset();
        self.sdo_client.reset();
        info!("Node {} started", self.node_id.raw());
    }

    /// Restart the node, as on an NMT reset command
    ///
    /// The node ID written to 0x100B takes effect, the configured values are re-applied and stored
    /// parameters reloaded. Any transfer in progress is dropped.
    pub fn reset(&mut self) {
        let pending = self.od.read_u8(object_ids::NODE_ID, 0).map(NodeId::new);
        let node_id = match pending {
            Ok(Ok(id)) => id,
            _ => self.node_id,
        };
        info!("Node {} restarting", self.node_id.raw());
        self.start(node_id);
        self.notify_state(NmtState::BootUp);
    }

    /// Queue a received frame for the next `step`
    ///
    /// Returns the frame back if the queue is full.
    pub fn rx(&mut self, msg: CanMessage) -> Result<(), CanMessage> {
        self.rx_queue.push_back(msg)
    }

    /// Process received frames, advance all timers by `elapsed_ms` and send what is due
    pub fn step(&mut self, elapsed_ms: u32, sender: &mut dyn CanSender) {
        while let Some(msg) = self.tx_queue.pop_front() {
            transmit(sender, msg);
        }

        if self.nmt.state() == NmtState::BootUp {
            self.boot_up(&mut |msg| transmit(&mut *sender, msg));
        }

        while let Some(msg) = self.rx_queue.pop_front() {
            if self.dispatch(&msg, &mut |msg| transmit(&mut *sender, msg)) {
                // Remaining frames are handled after the boot transition on the next step
                self.reset();
                return;
            }
        }

        self.tick(elapsed_ms, &mut |msg| transmit(&mut *sender, msg));
    }

    fn boot_up(&mut self, send: &mut impl FnMut(CanMessage)) {
        let action = self.nmt.set_state(NmtState::PreOperational);
        if action != NmtAction::None {
            send(self.heartbeat_message());
            self.state_changed(action);
        }
    }

    fn heartbeat_message(&self) -> CanMessage {
        Heartbeat {
            node: self.node_id.raw(),
            state: self.nmt.state(),
        }
        .into()
    }

    fn consumer_words(&self) -> [u32; MAX_HEARTBEAT_CONSUMERS] {
        core::array::from_fn(|i| {
            self.od
                .read_u32(object_ids::HEARTBEAT_CONSUMER_TIME, i as u8 + 1)
                .unwrap_or(0)
        })
    }

    fn notify_state(&mut self, state: NmtState) {
        if let Some(cb) = self.callbacks.on_state_change.as_mut() {
            cb(state);
        }
    }

    fn state_changed(&mut self, action: NmtAction) {
        if let NmtAction::StateChanged { from, to } = action {
            info!("NMT state {:?} -> {:?}", from, to);
            if from == NmtState::Operational {
                self.pdo.reset();
            }
            self.notify_state(to);
        }
    }

    /// Handle one received frame. Returns true if the node must restart.
    fn dispatch(&mut self, msg: &CanMessage, send: &mut impl FnMut(CanMessage)) -> bool {
        match self.nmt.handle_message(msg, self.node_id) {
            NmtAction::Restart => return true,
            action => self.state_changed(action),
        }

        let state = self.nmt.state();
        if state == NmtState::BootUp || msg.id().is_extended() {
            return false;
        }

        if state == NmtState::Operational {
            let on_write = &mut self.callbacks.on_write;
            self.pdo.handle_message(
                &self.od,
                self.node_id,
                msg,
                &mut |index, sub| {
                    if let Some(cb) = on_write.as_mut() {
                        cb(index, sub);
                    }
                },
                send,
            );
        }

        self.consumers.handle_message(msg);

        if msg.id() == CanId::std(SDO_REQ_BASE + self.node_id.raw() as u16) {
            self.handle_sdo_request(msg, send);
        }

        self.sdo_client.handle_message(msg, send);
        self.emcy.handle_message(msg, self.node_id);
        false
    }

    fn handle_sdo_request(&mut self, msg: &CanMessage, send: &mut impl FnMut(CanMessage)) {
        let resp_id = CanId::std(SDO_RESP_BASE + self.node_id.raw() as u16);
        let output = self
            .sdo_server
            .handle_request(&self.od, msg.data(), &mut |segment| {
                send(segment.to_can_message(resp_id))
            });

        let mut response = output.response;
        if let Some(object) = output.updated_object {
            match handle_store_commands(&self.od, self.common, &mut self.callbacks.store, object)
            {
                Ok(()) => {
                    if let Some(cb) = self.callbacks.on_write.as_mut() {
                        cb(object.index, object.sub);
                    }
                }
                Err(abort_code) => {
                    response = Some(SdoResponse::abort(object.index, object.sub, abort_code));
                }
            }
        }
        if let Some(response) = response {
            send(response.to_can_message(resp_id));
        }
    }

    fn tick(&mut self, elapsed_ms: u32, send: &mut impl FnMut(CanMessage)) {
        let state = self.nmt.state();
        if state == NmtState::BootUp {
            return;
        }

        let period = self
            .od
            .read_u16(object_ids::HEARTBEAT_PRODUCER_TIME, 0)
            .unwrap_or(0);
        if self.heartbeat.tick(period, elapsed_ms) {
            send(self.heartbeat_message());
        }

        let words = self.consumer_words();
        self.consumers.tick(&words, elapsed_ms);

        if let Some(abort) = self.sdo_server.tick(elapsed_ms) {
            send(abort.to_can_message(CanId::std(SDO_RESP_BASE + self.node_id.raw() as u16)));
        }
        self.sdo_client.tick(elapsed_ms, send);

        if state == NmtState::Operational {
            self.pdo.tick(&self.od, self.node_id, elapsed_ms, send);
        }
    }

    /// Change the NMT state from the application
    ///
    /// Moving from BootUp to PreOperational sends a heartbeat, as the boot transition in `step`
    /// does.
    pub fn set_state(&mut self, state: NmtState) {
        let action = self.nmt.set_state(state);
        if action
            == (NmtAction::StateChanged {
                from: NmtState::BootUp,
                to: NmtState::PreOperational,
            })
        {
            let msg = self.heartbeat_message();
            queue_frame(&mut self.tx_queue, msg);
        }
        self.state_changed(action);
    }

    /// The current NMT state
    pub fn nmt_state(&self) -> NmtState {
        self.nmt.state()
    }

    /// The node ID in use
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// The object dictionary
    pub fn od(&self) -> &ObjectDictionary<'a> {
        &self.od
    }

    /// Returns true if `node_id` is a monitored node whose heartbeat timed out
    pub fn heartbeat_expired(&self, node_id: u8) -> bool {
        self.consumers.is_expired(node_id)
    }

    /// Send every TPDO mapping `(index, sub)` on the next step
    ///
    /// Returns true if any TPDO maps the object.
    pub fn pdo_mapping_update(&mut self, index: u16, sub: u8) -> bool {
        self.pdo.pdo_mapping_update(&self.od, index, sub)
    }

    /// Queue an emergency message from this node
    pub fn emcy_send(&mut self, error_code: u16, data: [u8; 4]) {
        let msg = Emergency {
            node: self.node_id.raw(),
            error_code,
            data,
        }
        .into();
        queue_frame(&mut self.tx_queue, msg);
    }

    /// Take the oldest emergency received from another node
    pub fn emcy_pop(&mut self) -> Option<Emergency> {
        self.emcy.pop()
    }

    /// Write an object on another node without waiting for the result
    ///
    /// The request is sent on the next step. The outcome is only logged.
    pub fn sdo_write(
        &mut self,
        node_id: u8,
        index: u16,
        sub: u8,
        data: &[u8],
    ) -> Result<(), SdoClientError> {
        let queue = &mut self.tx_queue;
        self.sdo_client.start_download(
            node_id,
            index,
            sub,
            data,
            self.config.sdo_timeout_ms,
            true,
            &mut |msg| queue_frame(queue, msg),
        )?;
        debug!("Queued SDO write of 0x{:x}sub{} to node {}", index, sub, node_id);
        Ok(())
    }

    /// The SDO timeout in ms from the node config
    pub fn sdo_timeout_ms(&self) -> u32 {
        self.config.sdo_timeout_ms
    }

    /// Run `f` with the SDO client and a sink which queues frames for the next step
    pub(crate) fn with_sdo_client<R>(
        &mut self,
        f: impl FnOnce(&mut SdoClient, &mut dyn FnMut(CanMessage)) -> R,
    ) -> R {
        let queue = &mut self.tx_queue;
        f(&mut self.sdo_client, &mut |msg| queue_frame(queue, msg))
    }
}
