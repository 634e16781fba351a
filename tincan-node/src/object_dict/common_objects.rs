//! Storage for the communication objects every node carries

use tincan_common::{
    constants::{object_ids, pdo_comm_subs, sizes, values},
    messages::{RPDO_BASES, TPDO_BASES},
    node_config::{NodeConfig, PdoConfig},
    objects::AccessType,
    NodeId,
};

use super::{ObjectEntry, ScalarField, SlotRef};

/// Number of entries contributed by [`CommonObjects`]
pub const COMMON_OBJECT_COUNT: usize = 7 + 4 * sizes::NUM_PDOS;

/// The standard communication objects
///
/// The application owns an instance (usually a `static`) and passes it to the node, which lists its
/// fields in the object dictionary.
#[derive(Debug)]
pub struct CommonObjects {
    /// 0x1000
    pub device_type: ScalarField<u32>,
    /// 0x100B
    pub node_id: ScalarField<u8>,
    /// 0x1010
    pub store_parameters: [ScalarField<u32>; 1],
    /// 0x1011
    pub restore_defaults: [ScalarField<u32>; 1],
    /// 0x1016
    pub heartbeat_consumers: [ScalarField<u32>; sizes::MAX_HEARTBEAT_CONSUMERS],
    /// 0x1017
    pub heartbeat_producer_time: ScalarField<u16>,
    /// 0x1018
    pub identity: [ScalarField<u32>; 4],
    /// 0x1400 - 0x1403
    pub rpdo_comm: [[ScalarField<u32>; sizes::RPDO_COMM_LEN]; sizes::NUM_PDOS],
    /// 0x1600 - 0x1603
    pub rpdo_mapping: [[ScalarField<u32>; sizes::MAX_PDO_MAPPINGS]; sizes::NUM_PDOS],
    /// 0x1800 - 0x1803
    pub tpdo_comm: [[ScalarField<u32>; sizes::TPDO_COMM_LEN]; sizes::NUM_PDOS],
    /// 0x1A00 - 0x1A03
    pub tpdo_mapping: [[ScalarField<u32>; sizes::MAX_PDO_MAPPINGS]; sizes::NUM_PDOS],
}

impl Default for CommonObjects {
    fn default() -> Self {
        Self::new()
    }
}

impl CommonObjects {
    /// Create the objects with every value zero
    pub const fn new() -> Self {
        Self {
            device_type: ScalarField::<u32>::new(0),
            node_id: ScalarField::<u8>::new(0),
            store_parameters: [const { ScalarField::<u32>::new(0) }; 1],
            restore_defaults: [const { ScalarField::<u32>::new(0) }; 1],
            heartbeat_consumers: [const { ScalarField::<u32>::new(0) };
                sizes::MAX_HEARTBEAT_CONSUMERS],
            heartbeat_producer_time: ScalarField::<u16>::new(0),
            identity: [const { ScalarField::<u32>::new(0) }; 4],
            rpdo_comm: [const { [const { ScalarField::<u32>::new(0) }; sizes::RPDO_COMM_LEN] };
                sizes::NUM_PDOS],
            rpdo_mapping: [const {
                [const { ScalarField::<u32>::new(0) }; sizes::MAX_PDO_MAPPINGS]
            }; sizes::NUM_PDOS],
            tpdo_comm: [const { [const { ScalarField::<u32>::new(0) }; sizes::TPDO_COMM_LEN] };
                sizes::NUM_PDOS],
            tpdo_mapping: [const {
                [const { ScalarField::<u32>::new(0) }; sizes::MAX_PDO_MAPPINGS]
            }; sizes::NUM_PDOS],
        }
    }

    /// The dictionary entries describing these objects
    pub fn entries(&self) -> [ObjectEntry<'_>; COMMON_OBJECT_COUNT] {
        const N: usize = sizes::NUM_PDOS;
        core::array::from_fn(|i| match i {
            0 => ObjectEntry::new(
                object_ids::DEVICE_TYPE,
                AccessType::Const,
                SlotRef::U32(&self.device_type),
            ),
            1 => ObjectEntry::new(
                object_ids::NODE_ID,
                AccessType::Rw,
                SlotRef::U8(&self.node_id),
            )
            .persist(true),
            2 => ObjectEntry::new(
                object_ids::STORE_PARAMETERS,
                AccessType::Rw,
                SlotRef::ArrayU32(&self.store_parameters),
            ),
            3 => ObjectEntry::new(
                object_ids::RESTORE_DEFAULTS,
                AccessType::Rw,
                SlotRef::ArrayU32(&self.restore_defaults),
            ),
            4 => ObjectEntry::new(
                object_ids::HEARTBEAT_CONSUMER_TIME,
                AccessType::Rw,
                SlotRef::ArrayU32(&self.heartbeat_consumers),
            )
            .persist(true),
            5 => ObjectEntry::new(
                object_ids::HEARTBEAT_PRODUCER_TIME,
                AccessType::Rw,
                SlotRef::U16(&self.heartbeat_producer_time),
            )
            .persist(true),
            6 => ObjectEntry::new(
                object_ids::IDENTITY,
                AccessType::Const,
                SlotRef::ArrayU32(&self.identity),
            ),
            i if i < 7 + N => {
                let n = i - 7;
                ObjectEntry::new(
                    object_ids::RPDO_COMM_BASE + n as u16,
                    AccessType::Rw,
                    SlotRef::ArrayU32(&self.rpdo_comm[n]),
                )
                .persist(true)
            }
            i if i < 7 + 2 * N => {
                let n = i - 7 - N;
                ObjectEntry::new(
                    object_ids::RPDO_MAPPING_BASE + n as u16,
                    AccessType::Rw,
                    SlotRef::ArrayU32(&self.rpdo_mapping[n]),
                )
                .persist(true)
                .count_non_zero()
            }
            i if i < 7 + 3 * N => {
                let n = i - 7 - 2 * N;
                ObjectEntry::new(
                    object_ids::TPDO_COMM_BASE + n as u16,
                    AccessType::Rw,
                    SlotRef::ArrayU32(&self.tpdo_comm[n]),
                )
                .persist(true)
            }
            i => {
                let n = i - 7 - 3 * N;
                ObjectEntry::new(
                    object_ids::TPDO_MAPPING_BASE + n as u16,
                    AccessType::Rw,
                    SlotRef::ArrayU32(&self.tpdo_mapping[n]),
                )
                .persist(true)
                .count_non_zero()
            }
        })
    }

    /// Write the configured start-up values
    ///
    /// `node_id` is the ID the node starts with. It is stored in 0x100B and used for the default
    /// PDO COB-IDs.
    pub fn apply_config(&self, config: &NodeConfig, node_id: NodeId) {
        self.device_type.store(config.device_type);
        self.node_id.store(node_id.raw());
        self.store_parameters[0].store(values::COMMAND_SUPPORTED);
        self.restore_defaults[0].store(values::COMMAND_SUPPORTED);
        self.heartbeat_producer_time
            .store(config.heartbeat_period_ms);

        for (i, slot) in self.heartbeat_consumers.iter().enumerate() {
            let word = config
                .heartbeat_consumers
                .get(i)
                .map(|c| ((c.node_id as u32) << 16) | c.timeout_ms as u32)
                .unwrap_or(0);
            slot.store(word);
        }

        let identity = &config.identity;
        for (slot, value) in self.identity.iter().zip([
            identity.vendor_id,
            identity.product_code,
            identity.revision_number,
            identity.serial_number,
        ]) {
            slot.store(value);
        }

        for n in 0..sizes::NUM_PDOS {
            let default_tpdo = PdoConfig::new(n as u8);
            let tpdo = config.tpdo(n).unwrap_or(&default_tpdo);
            let comm = &self.tpdo_comm[n];
            comm[(pdo_comm_subs::COB_ID - 1) as usize]
                .store(cob_id_word(tpdo, TPDO_BASES[n], node_id));
            comm[(pdo_comm_subs::TRANSMISSION_TYPE - 1) as usize]
                .store(tpdo.transmission_type as u32);
            comm[(pdo_comm_subs::INHIBIT_TIME - 1) as usize].store(tpdo.inhibit_time_ms as u32);
            comm[3].store(0);
            comm[(pdo_comm_subs::EVENT_TIMER - 1) as usize].store(tpdo.event_timer_ms as u32);
            store_mappings(&self.tpdo_mapping[n], tpdo);

            let default_rpdo = PdoConfig::new(n as u8);
            let rpdo = config.rpdo(n).unwrap_or(&default_rpdo);
            let comm = &self.rpdo_comm[n];
            comm[(pdo_comm_subs::COB_ID - 1) as usize]
                .store(cob_id_word(rpdo, RPDO_BASES[n], node_id));
            comm[(pdo_comm_subs::TRANSMISSION_TYPE - 1) as usize]
                .store(rpdo.transmission_type as u32);
            store_mappings(&self.rpdo_mapping[n], rpdo);
        }
    }
}

fn cob_id_word(pdo: &PdoConfig, base: u16, node_id: NodeId) -> u32 {
    let id = pdo.cob_id.unwrap_or(base + node_id.raw() as u16) as u32;
    if pdo.enabled {
        id
    } else {
        id | values::PDO_COB_ID_DISABLED
    }
}

fn store_mappings(slots: &[ScalarField<u32>], pdo: &PdoConfig) {
    for (i, slot) in slots.iter().enumerate() {
        slot.store(pdo.mappings.get(i).map(|m| m.to_word()).unwrap_or(0));
    }
}
