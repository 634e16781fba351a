//! Node configuration
//!
//! A [`NodeConfig`] holds the start-up values of the standard communication objects of a node: its
//! node ID, heartbeat timing, identity, heartbeat consumers and the default PDO configuration. The
//! node writes these into its object dictionary on every restart, before any stored parameters are
//! loaded.
//!
//! With the `std` feature a config can be read from a TOML file.
//!
//! # An example TOML file
//!
//! ```toml
//! node_id = 5
//! device_type = 0x191
//! heartbeat_period_ms = 1000
//! sdo_timeout_ms = 500
//!
//! [identity]
//! vendor_id = 0xCAFE
//! product_code = 1032
//! revision_number = 1
//! serial_number = 12345
//!
//! # Watch node 3, expecting a heartbeat at least every 1500ms
//! [[heartbeat_consumers]]
//! node_id = 3
//! timeout_ms = 1500
//!
//! # TPDO slots are numbered from 0 (TPDO1, objects 0x1800/0x1A00)
//! [[tpdos]]
//! slot = 0
//! event_timer_ms = 100
//! inhibit_time_ms = 10
//! mappings = [
//!     { index = 0x2000, sub = 0, bits = 8 },
//!     { index = 0x2001, sub = 0, bits = 16 },
//! ]
//!
//! [[rpdos]]
//! slot = 0
//! cob_id = 0x203
//! mappings = [{ index = 0x2100, sub = 1, bits = 32 }]
//! ```
//!
//! PDOs which are not listed keep their default COB-ID (base + node ID), are enabled, and have no
//! mappings.
use heapless::Vec;
use snafu::Snafu;

use crate::constants::{sizes, values};
use crate::NodeId;

const fn default_sdo_timeout() -> u32 {
    1000
}

const fn default_true() -> bool {
    true
}

const fn default_transmission_type() -> u8 {
    values::TRANSMISSION_ASYNC
}

/// Start-up configuration of a node
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "std", derive(serde::Deserialize))]
#[cfg_attr(feature = "std", serde(deny_unknown_fields))]
pub struct NodeConfig {
    /// The node ID (1..=127)
    pub node_id: u8,
    /// Value of the device type object (0x1000)
    #[cfg_attr(feature = "std", serde(default))]
    pub device_type: u32,
    /// Default heartbeat producer period in ms (0x1017). 0 disables the heartbeat.
    #[cfg_attr(feature = "std", serde(default))]
    pub heartbeat_period_ms: u16,
    /// Time the SDO server and client wait for the next frame of a transfer, in ms
    #[cfg_attr(feature = "std", serde(default = "default_sdo_timeout"))]
    pub sdo_timeout_ms: u32,
    /// Values of the identity object (0x1018)
    #[cfg_attr(feature = "std", serde(default))]
    pub identity: IdentityConfig,
    /// Remote nodes whose heartbeat is monitored (0x1016)
    #[cfg_attr(feature = "std", serde(default))]
    pub heartbeat_consumers: Vec<HeartbeatConsumerConfig, { sizes::MAX_HEARTBEAT_CONSUMERS }>,
    /// Default TPDO configuration
    #[cfg_attr(feature = "std", serde(default))]
    pub tpdos: Vec<PdoConfig, { sizes::NUM_PDOS }>,
    /// Default RPDO configuration
    #[cfg_attr(feature = "std", serde(default))]
    pub rpdos: Vec<PdoConfig, { sizes::NUM_PDOS }>,
}

/// The four words of the identity object
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "std", derive(serde::Deserialize))]
#[cfg_attr(feature = "std", serde(deny_unknown_fields))]
pub struct IdentityConfig {
    /// Vendor ID (0x1018 sub 1)
    #[cfg_attr(feature = "std", serde(default))]
    pub vendor_id: u32,
    /// Product code (0x1018 sub 2)
    #[cfg_attr(feature = "std", serde(default))]
    pub product_code: u32,
    /// Revision number (0x1018 sub 3)
    #[cfg_attr(feature = "std", serde(default))]
    pub revision_number: u32,
    /// Serial number (0x1018 sub 4)
    #[cfg_attr(feature = "std", serde(default))]
    pub serial_number: u32,
}

/// A monitored remote node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "std", derive(serde::Deserialize))]
#[cfg_attr(feature = "std", serde(deny_unknown_fields))]
pub struct HeartbeatConsumerConfig {
    /// The remote node ID
    pub node_id: u8,
    /// Time after the last heartbeat before the node is considered lost
    pub timeout_ms: u16,
}

/// Default configuration for one PDO slot
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "std", derive(serde::Deserialize))]
#[cfg_attr(feature = "std", serde(deny_unknown_fields))]
pub struct PdoConfig {
    /// The PDO number, counting from 0
    pub slot: u8,
    /// Whether the PDO is enabled
    #[cfg_attr(feature = "std", serde(default = "default_true"))]
    pub enabled: bool,
    /// The COB-ID. Defaults to the standard base for the slot plus the node ID.
    #[cfg_attr(feature = "std", serde(default))]
    pub cob_id: Option<u16>,
    /// Transmission type. Only asynchronous types (0xFE, 0xFF) are serviced.
    #[cfg_attr(feature = "std", serde(default = "default_transmission_type"))]
    pub transmission_type: u8,
    /// TPDO event timer in ms. 0 disables periodic transmission.
    #[cfg_attr(feature = "std", serde(default))]
    pub event_timer_ms: u16,
    /// TPDO inhibit time in ms
    #[cfg_attr(feature = "std", serde(default))]
    pub inhibit_time_ms: u16,
    /// The mapped objects, in frame order
    #[cfg_attr(feature = "std", serde(default))]
    pub mappings: Vec<PdoMappingConfig, { sizes::MAX_PDO_MAPPINGS }>,
}

impl PdoConfig {
    /// Create an enabled, asynchronous PDO config with default COB-ID and no mappings
    pub fn new(slot: u8) -> Self {
        Self {
            slot,
            enabled: true,
            cob_id: None,
            transmission_type: values::TRANSMISSION_ASYNC,
            event_timer_ms: 0,
            inhibit_time_ms: 0,
            mappings: Vec::new(),
        }
    }

    /// Total number of mapped bits
    pub fn mapped_bits(&self) -> u32 {
        self.mappings.iter().map(|m| m.bits as u32).sum()
    }
}

/// One entry of a PDO mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "std", derive(serde::Deserialize))]
#[cfg_attr(feature = "std", serde(deny_unknown_fields))]
pub struct PdoMappingConfig {
    /// Mapped object index
    pub index: u16,
    /// Mapped sub index
    #[cfg_attr(feature = "std", serde(default))]
    pub sub: u8,
    /// Number of bits occupied in the frame
    pub bits: u8,
}

impl PdoMappingConfig {
    /// The mapping word as stored in the mapping parameter objects
    pub fn to_word(&self) -> u32 {
        ((self.index as u32) << 16) | ((self.sub as u32) << 8) | self.bits as u32
    }
}

/// Error returned when a config is not usable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Snafu)]
pub enum ConfigError {
    /// The node ID is outside 1..=127
    #[snafu(display("Invalid node ID {value}, must be in 1..=127"))]
    InvalidNodeId {
        /// The configured value
        value: u8,
    },
    /// A PDO slot number is too large
    #[snafu(display("PDO slot {slot} out of range, node has {} slots", sizes::NUM_PDOS))]
    PdoSlotOutOfRange {
        /// The configured slot
        slot: u8,
    },
    /// A PDO slot is configured twice
    #[snafu(display("Multiple definitions for PDO slot {slot}"))]
    DuplicatePdoSlot {
        /// The duplicated slot
        slot: u8,
    },
    /// The mappings of a PDO do not fit in one frame
    #[snafu(display("PDO slot {slot} maps {bits} bits, more than 64"))]
    MappingTooLong {
        /// The offending slot
        slot: u8,
        /// Total mapped bits
        bits: u32,
    },
}

impl NodeConfig {
    /// Create a config for `node_id` with every other value at its default
    pub fn new(node_id: u8) -> Self {
        Self {
            node_id,
            device_type: 0,
            heartbeat_period_ms: 0,
            sdo_timeout_ms: default_sdo_timeout(),
            identity: IdentityConfig::default(),
            heartbeat_consumers: Vec::new(),
            tpdos: Vec::new(),
            rpdos: Vec::new(),
        }
    }

    /// Check the config for values the node cannot apply
    pub fn validate(&self) -> Result<(), ConfigError> {
        if NodeId::new(self.node_id).is_err() {
            return InvalidNodeIdSnafu {
                value: self.node_id,
            }
            .fail();
        }
        Self::validate_pdos(&self.tpdos)?;
        Self::validate_pdos(&self.rpdos)?;
        Ok(())
    }

    fn validate_pdos(pdos: &[PdoConfig]) -> Result<(), ConfigError> {
        let mut seen = [false; sizes::NUM_PDOS];
        for pdo in pdos {
            let slot = pdo.slot as usize;
            if slot >= sizes::NUM_PDOS {
                return PdoSlotOutOfRangeSnafu { slot: pdo.slot }.fail();
            }
            if seen[slot] {
                return DuplicatePdoSlotSnafu { slot: pdo.slot }.fail();
            }
            seen[slot] = true;
            let bits = pdo.mapped_bits();
            if bits > 64 {
                return MappingTooLongSnafu {
                    slot: pdo.slot,
                    bits,
                }
                .fail();
            }
        }
        Ok(())
    }

    /// Find the config for a TPDO slot
    pub fn tpdo(&self, slot: usize) -> Option<&PdoConfig> {
        self.tpdos.iter().find(|p| p.slot as usize == slot)
    }

    /// Find the config for an RPDO slot
    pub fn rpdo(&self, slot: usize) -> Option<&PdoConfig> {
        self.rpdos.iter().find(|p| p.slot as usize == slot)
    }
}

#[cfg(feature = "std")]
pub use loading::LoadError;

#[cfg(feature = "std")]
mod loading {
    use super::{ConfigError, NodeConfig};
    use snafu::{ResultExt as _, Snafu};

    /// Error returned when loading a node config fails
    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub(super)))]
    pub enum LoadError {
        /// An IO error occured while reading the file
        #[snafu(display("IO error: {source}"))]
        Io {
            /// The underlying IO error
            source: std::io::Error,
        },
        /// An error occured in the TOML parser
        #[snafu(display("Toml parse error: {source}"))]
        TomlParsing {
            /// The toml error which led to this error
            source: toml::de::Error,
        },
        /// The config parsed but holds unusable values
        #[snafu(display("Invalid config: {source}"))]
        Invalid {
            /// The validation failure
            source: ConfigError,
        },
    }

    impl NodeConfig {
        /// Try to read a node config from a file
        pub fn load(config_path: impl AsRef<std::path::Path>) -> Result<Self, LoadError> {
            let config_str = std::fs::read_to_string(&config_path).context(IoSnafu)?;
            Self::load_from_str(&config_str)
        }

        /// Try to read a config from a &str
        pub fn load_from_str(config_str: &str) -> Result<Self, LoadError> {
            let config: NodeConfig = toml::from_str(config_str).context(TomlParsingSnafu)?;
            config.validate().context(InvalidSnafu)?;
            defmt_or_log::debug!("Loaded config for node {}", config.node_id);
            Ok(config)
        }
    }
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;
    use assertables::assert_contains;

    #[test]
    fn test_load_full_config() {
        const TOML: &str = r#"
            node_id = 5
            device_type = 0x191
            heartbeat_period_ms = 1000

            [identity]
            vendor_id = 0xCAFE
            product_code = 1032

            [[heartbeat_consumers]]
            node_id = 3
            timeout_ms = 1500

            [[tpdos]]
            slot = 1
            event_timer_ms = 100
            mappings = [
                { index = 0x2000, sub = 0, bits = 8 },
                { index = 0x2001, bits = 16 },
            ]

            [[rpdos]]
            slot = 0
            enabled = false
            cob_id = 0x203
        "#;

        let config = NodeConfig::load_from_str(TOML).unwrap();
        assert_eq!(5, config.node_id);
        assert_eq!(0x191, config.device_type);
        assert_eq!(1000, config.sdo_timeout_ms);
        assert_eq!(0xCAFE, config.identity.vendor_id);
        assert_eq!(0, config.identity.serial_number);
        assert_eq!(3, config.heartbeat_consumers[0].node_id);

        let tpdo = config.tpdo(1).unwrap();
        assert!(tpdo.enabled);
        assert_eq!(0xFF, tpdo.transmission_type);
        assert_eq!(None, tpdo.cob_id);
        assert_eq!(24, tpdo.mapped_bits());
        assert_eq!(0x2001_0010, tpdo.mappings[1].to_word());
        assert!(config.tpdo(0).is_none());

        let rpdo = config.rpdo(0).unwrap();
        assert!(!rpdo.enabled);
        assert_eq!(Some(0x203), rpdo.cob_id);
    }

    #[test]
    fn test_invalid_node_id() {
        let err = NodeConfig::load_from_str("node_id = 0").unwrap_err();
        assert!(matches!(
            err,
            LoadError::Invalid {
                source: ConfigError::InvalidNodeId { value: 0 }
            }
        ));
        assert_contains!(err.to_string().as_str(), "Invalid node ID 0");
    }

    #[test]
    fn test_duplicate_pdo_slot() {
        const TOML: &str = r#"
            node_id = 1
            [[tpdos]]
            slot = 2
            [[tpdos]]
            slot = 2
        "#;
        let err = NodeConfig::load_from_str(TOML).unwrap_err();
        assert_contains!(
            err.to_string().as_str(),
            "Multiple definitions for PDO slot 2"
        );
    }

    #[test]
    fn test_pdo_errors() {
        const TOML: &str = r#"
            node_id = 1
            [[rpdos]]
            slot = 4
        "#;
        let err = NodeConfig::load_from_str(TOML).unwrap_err();
        assert_contains!(err.to_string().as_str(), "PDO slot 4 out of range");

        let mut config = NodeConfig::new(1);
        let mut pdo = PdoConfig::new(0);
        for i in 0..5 {
            pdo.mappings
                .push(PdoMappingConfig {
                    index: 0x2000 + i,
                    sub: 0,
                    bits: 16,
                })
                .unwrap();
        }
        config.tpdos.push(pdo).unwrap();
        assert_eq!(
            Err(ConfigError::MappingTooLong { slot: 0, bits: 80 }),
            config.validate()
        );
    }

    #[test]
    fn test_unknown_field_rejected() {
        let err = NodeConfig::load_from_str("node_id = 1\nnode_name = \"x\"").unwrap_err();
        assert!(matches!(err, LoadError::TomlParsing { .. }));
    }
}
