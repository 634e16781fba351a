//! Constants defining standard objects, special values and sizes
//!

/// Object indices for the objects every node carries
pub mod object_ids {
    /// Device type
    pub const DEVICE_TYPE: u16 = 0x1000;
    /// The node ID the node uses after its next restart
    pub const NODE_ID: u16 = 0x100B;
    /// Store parameters command object
    pub const STORE_PARAMETERS: u16 = 0x1010;
    /// Restore default parameters command object
    pub const RESTORE_DEFAULTS: u16 = 0x1011;
    /// Consumer heartbeat time array
    pub const HEARTBEAT_CONSUMER_TIME: u16 = 0x1016;
    /// The heartbeat producer time object index
    pub const HEARTBEAT_PRODUCER_TIME: u16 = 0x1017;
    /// The identity object index
    pub const IDENTITY: u16 = 0x1018;
    /// First RPDO communication parameter object
    pub const RPDO_COMM_BASE: u16 = 0x1400;
    /// First RPDO mapping parameter object
    pub const RPDO_MAPPING_BASE: u16 = 0x1600;
    /// First TPDO communication parameter object
    pub const TPDO_COMM_BASE: u16 = 0x1800;
    /// First TPDO mapping parameter object
    pub const TPDO_MAPPING_BASE: u16 = 0x1A00;
}

/// Special values used to access standard objects
pub mod values {
    /// Magic value ("save" read as a little endian u32) written to object 0x1010 to store parameters
    pub const SAVE_CMD: u32 = 0x6576_6173;
    /// Magic value ("load" read as a little endian u32) written to object 0x1011 to restore defaults
    pub const LOAD_CMD: u32 = 0x6461_6F6C;
    /// Value read back from the store/restore command objects, meaning the command is supported
    pub const COMMAND_SUPPORTED: u32 = 1;
    /// Asynchronous PDO transmission type
    pub const TRANSMISSION_ASYNC: u8 = 0xFF;
    /// Manufacturer specific asynchronous PDO transmission type, handled like [`TRANSMISSION_ASYNC`]
    pub const TRANSMISSION_ASYNC_MANUFACTURER: u8 = 0xFE;
    /// Bit in a PDO COB-ID word which marks the PDO disabled
    pub const PDO_COB_ID_DISABLED: u32 = 1 << 31;
    /// Bit in a PDO COB-ID word which selects a 29-bit identifier
    pub const PDO_COB_ID_EXTENDED: u32 = 1 << 29;
}

/// Sizes of fixed tables
pub mod sizes {
    /// Number of RPDO and of TPDO slots on a node
    pub const NUM_PDOS: usize = 4;
    /// Number of mapping entries per PDO
    pub const MAX_PDO_MAPPINGS: usize = 8;
    /// Number of entries in the heartbeat consumer array
    pub const MAX_HEARTBEAT_CONSUMERS: usize = 8;
    /// Number of words in a TPDO communication parameter array
    pub const TPDO_COMM_LEN: usize = 5;
    /// Number of words in an RPDO communication parameter array
    pub const RPDO_COMM_LEN: usize = 2;
}

/// Sub indices of the PDO communication parameter arrays
pub mod pdo_comm_subs {
    /// COB-ID word
    pub const COB_ID: u8 = 1;
    /// Transmission type
    pub const TRANSMISSION_TYPE: u8 = 2;
    /// Inhibit time in ms (TPDO only)
    pub const INHIBIT_TIME: u8 = 3;
    /// Event timer in ms (TPDO only)
    pub const EVENT_TIMER: u8 = 5;
}
