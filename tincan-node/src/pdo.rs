//! PDO transmission and reception
//!
//! The PDO configuration lives entirely in the object dictionary (objects 0x1400-0x1A03), so it can
//! be changed over SDO at any time. Nothing is cached here except the TPDO timers; every tick
//! re-reads the communication and mapping parameters.

use defmt_or_log::{debug, warn};
use tincan_common::{
    constants::{object_ids, pdo_comm_subs, sizes::MAX_PDO_MAPPINGS, sizes::NUM_PDOS, values},
    messages::SDO_RESP_BASE,
    sdo::{AbortCode, SdoResponse},
    CanId, CanMessage, NodeId,
};

use crate::{
    delay::Delay,
    object_dict::{ObjectDictionary, ResolvedEntry},
};

/// One decoded mapping parameter
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PdoMapping {
    /// Mapped object index
    pub index: u16,
    /// Mapped sub index
    pub sub: u8,
    /// Length of the field in bits
    pub bits: u8,
}

impl PdoMapping {
    /// Decode a mapping word: `index << 16 | sub << 8 | bits`
    pub fn from_word(word: u32) -> Self {
        Self {
            index: (word >> 16) as u16,
            sub: (word >> 8) as u8,
            bits: word as u8,
        }
    }

    /// Number of bytes the field occupies in the frame
    pub fn byte_len(&self) -> usize {
        (self.bits as usize).div_ceil(8)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Direction {
    Tx,
    Rx,
}

/// Decode the COB-ID word of a PDO communication object
///
/// Returns None when the PDO is disabled or names an extended ID, which the node never uses.
fn cob_id_from_word(word: u32) -> Option<CanId> {
    if word & values::PDO_COB_ID_DISABLED != 0 {
        None
    } else if word & values::PDO_COB_ID_EXTENDED != 0 {
        debug!("Ignoring PDO with extended COB-ID word 0x{:x}", word);
        None
    } else {
        Some(CanId::std((word & 0x7FF) as u16))
    }
}

fn is_async(transmission_type: u32) -> bool {
    transmission_type == values::TRANSMISSION_ASYNC as u32
        || transmission_type == values::TRANSMISSION_ASYNC_MANUFACTURER as u32
}

fn read_comm(od: &ObjectDictionary, index: u16, sub: u8) -> u32 {
    od.read_u32(index, sub).unwrap_or(0)
}

fn mappings<'o>(
    od: &'o ObjectDictionary<'o>,
    index: u16,
) -> impl Iterator<Item = PdoMapping> + 'o {
    (1..=MAX_PDO_MAPPINGS as u8)
        .map(move |sub| od.read_u32(index, sub).unwrap_or(0))
        .take_while(|word| *word != 0)
        .map(PdoMapping::from_word)
        .take_while(|m| m.bits != 0)
}

/// Check that a mapped object can be carried in a PDO field of the mapped length
fn resolve_mapped<'a>(
    od: &ObjectDictionary<'a>,
    mapping: &PdoMapping,
    direction: Direction,
) -> Result<ResolvedEntry<'a>, AbortCode> {
    let entry = od
        .resolve(mapping.index, mapping.sub)
        .map_err(|_| AbortCode::NoSuchObject)?;
    if !entry.is_pdo_mappable() || mapping.bits % 8 != 0 {
        return Err(AbortCode::UnnallowedPdo);
    }
    let len = mapping.byte_len();
    let allowed = match direction {
        Direction::Tx => entry.access.is_readable() && len <= entry.width(),
        Direction::Rx => entry.access.is_writable() && len == entry.width(),
    };
    if allowed {
        Ok(entry)
    } else {
        Err(AbortCode::UnnallowedPdo)
    }
}

fn mapping_abort(node_id: NodeId, mapping: &PdoMapping, code: AbortCode) -> CanMessage {
    warn!(
        "PDO mapping of 0x{:x}sub{} failed: {:?}",
        mapping.index, mapping.sub, code
    );
    SdoResponse::abort(mapping.index, mapping.sub, code)
        .to_can_message(CanId::std(SDO_RESP_BASE + node_id.raw() as u16))
}

#[derive(Clone, Copy, Debug, Default)]
struct TpdoTimers {
    event: Delay,
    inhibit_ms: u32,
}

/// Runs the TPDO timers and applies received RPDOs
#[derive(Debug, Default)]
pub struct PdoEngine {
    tpdos: [TpdoTimers; NUM_PDOS],
}

impl PdoEngine {
    /// Create an engine with all timers stopped
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop all timers
    ///
    /// Called whenever the node leaves the Operational state.
    pub fn reset(&mut self) {
        self.tpdos = Default::default();
    }

    /// Force every TPDO which maps `(index, sub)` to send on the next tick
    ///
    /// Returns true if any TPDO maps the object.
    pub fn pdo_mapping_update(&mut self, od: &ObjectDictionary, index: u16, sub: u8) -> bool {
        let mut found = false;
        for (slot, timers) in self.tpdos.iter_mut().enumerate() {
            let mapping_index = object_ids::TPDO_MAPPING_BASE + slot as u16;
            if mappings(od, mapping_index).any(|m| m.index == index && m.sub == sub) {
                timers.event.expire();
                found = true;
            }
        }
        found
    }

    /// Advance the TPDO timers, sending every PDO which is due
    ///
    /// Must only be called while the node is Operational.
    pub fn tick(
        &mut self,
        od: &ObjectDictionary,
        node_id: NodeId,
        elapsed_ms: u32,
        send: &mut impl FnMut(CanMessage),
    ) {
        for (slot, timers) in self.tpdos.iter_mut().enumerate() {
            let comm_index = object_ids::TPDO_COMM_BASE + slot as u16;
            let cob_word = read_comm(od, comm_index, pdo_comm_subs::COB_ID);
            let transmission_type = read_comm(od, comm_index, pdo_comm_subs::TRANSMISSION_TYPE);
            let inhibit_ms = read_comm(od, comm_index, pdo_comm_subs::INHIBIT_TIME);
            let event_ms = read_comm(od, comm_index, pdo_comm_subs::EVENT_TIMER);

            timers.inhibit_ms = timers.inhibit_ms.saturating_sub(elapsed_ms);

            let cob_id = match cob_id_from_word(cob_word) {
                Some(id) if is_async(transmission_type) => id,
                _ => {
                    timers.event.stop();
                    continue;
                }
            };

            match (timers.event, event_ms) {
                (Delay::Idle, 0) => {}
                (Delay::Idle, ms) => timers.event.set(ms),
                (Delay::Running(_), ms) => {
                    if ms != 0 {
                        timers.event.clamp(ms);
                    }
                    timers.event.elapse(elapsed_ms);
                }
            }

            if !timers.event.expired() || timers.inhibit_ms > 0 {
                continue;
            }

            if event_ms == 0 {
                timers.event.stop();
            } else {
                timers.event.set(event_ms);
            }
            timers.inhibit_ms = inhibit_ms;

            if let Some(msg) = pack_tpdo(od, node_id, slot, cob_id, send) {
                send(msg);
            }
        }
    }

    /// Apply `msg` to every enabled RPDO with a matching COB-ID
    ///
    /// `on_write` is called for each field written. Must only be called while the node is
    /// Operational.
    pub fn handle_message(
        &self,
        od: &ObjectDictionary,
        node_id: NodeId,
        msg: &CanMessage,
        on_write: &mut impl FnMut(u16, u8),
        send: &mut impl FnMut(CanMessage),
    ) {
        for slot in 0..NUM_PDOS {
            let comm_index = object_ids::RPDO_COMM_BASE + slot as u16;
            let cob_word = read_comm(od, comm_index, pdo_comm_subs::COB_ID);
            let transmission_type = read_comm(od, comm_index, pdo_comm_subs::TRANSMISSION_TYPE);
            if cob_id_from_word(cob_word) != Some(msg.id()) || !is_async(transmission_type) {
                continue;
            }
            apply_rpdo(od, node_id, slot, msg.data(), on_write, send);
        }
    }
}

/// Build the frame of a TPDO from its mapped objects
///
/// Fields which fail to resolve stay zero and produce an abort notification. Returns None if no
/// field could be packed.
fn pack_tpdo(
    od: &ObjectDictionary,
    node_id: NodeId,
    slot: usize,
    cob_id: CanId,
    send: &mut impl FnMut(CanMessage),
) -> Option<CanMessage> {
    let mut data = [0u8; 8];
    let mut offset = 0;
    let mut packed = false;
    for mapping in mappings(od, object_ids::TPDO_MAPPING_BASE + slot as u16) {
        let len = mapping.byte_len();
        if offset + len > data.len() {
            debug!("TPDO{} mapping overflows the frame", slot);
            break;
        }
        let result = resolve_mapped(od, &mapping, Direction::Tx)
            .and_then(|entry| entry.read(&mut data[offset..offset + len]));
        match result {
            Ok(_) => packed = true,
            Err(code) => send(mapping_abort(node_id, &mapping, code)),
        }
        offset += len;
    }
    packed.then(|| CanMessage::new(cob_id, &data[..offset]))
}

fn apply_rpdo(
    od: &ObjectDictionary,
    node_id: NodeId,
    slot: usize,
    data: &[u8],
    on_write: &mut impl FnMut(u16, u8),
    send: &mut impl FnMut(CanMessage),
) {
    let mut offset = 0;
    for mapping in mappings(od, object_ids::RPDO_MAPPING_BASE + slot as u16) {
        let len = mapping.byte_len();
        if offset + len > data.len() {
            debug!("RPDO{} frame too short for its mapping", slot);
            break;
        }
        let result = resolve_mapped(od, &mapping, Direction::Rx)
            .and_then(|entry| entry.write(&data[offset..offset + len]));
        match result {
            Ok(()) => on_write(mapping.index, mapping.sub),
            Err(code) => send(mapping_abort(node_id, &mapping, code)),
        }
        offset += len;
    }
}
