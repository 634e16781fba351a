//! CAN frames and the non-SDO CANopen messages
//!
//! SDO frames are encoded in [`crate::sdo`].
use int_enum::IntEnum;
use snafu::Snafu;

/// A CAN identifier
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CanId {
    /// A 29-bit identifier
    Extended(u32),
    /// An 11-bit identifier
    Std(u16),
}

impl CanId {
    /// Create an extended ID
    pub const fn extended(id: u32) -> CanId {
        CanId::Extended(id)
    }

    /// Create a standard ID
    pub const fn std(id: u16) -> CanId {
        CanId::Std(id)
    }

    /// Get the raw identifier value
    pub fn raw(&self) -> u32 {
        match self {
            CanId::Extended(id) => *id,
            CanId::Std(id) => *id as u32,
        }
    }

    /// True for 29-bit identifiers
    pub fn is_extended(&self) -> bool {
        match self {
            CanId::Extended(_) => true,
            CanId::Std(_) => false,
        }
    }
}

const MAX_DATA_LENGTH: usize = 8;

/// A classic CAN frame with up to 8 data bytes
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CanMessage {
    /// Data bytes. Bytes past `dlc` are zero.
    pub data: [u8; MAX_DATA_LENGTH],
    /// Number of valid bytes in `data`
    pub dlc: u8,
    /// The frame identifier
    pub id: CanId,
}

impl Default for CanMessage {
    fn default() -> Self {
        Self {
            data: [0; MAX_DATA_LENGTH],
            dlc: 0,
            id: CanId::Std(0),
        }
    }
}

impl CanMessage {
    /// Create a new frame
    ///
    /// At most 8 bytes of `data` are used.
    pub fn new(id: CanId, data: &[u8]) -> Self {
        let len = data.len().min(MAX_DATA_LENGTH);
        let mut buf = [0u8; MAX_DATA_LENGTH];
        buf[..len].copy_from_slice(&data[..len]);
        Self {
            id,
            dlc: len as u8,
            data: buf,
        }
    }

    /// Get the frame identifier
    pub fn id(&self) -> CanId {
        self.id
    }

    /// Get the valid data bytes
    pub fn data(&self) -> &[u8] {
        &self.data[0..(self.dlc as usize).min(MAX_DATA_LENGTH)]
    }
}

/// COB-ID of NMT commands
pub const NMT_CMD_ID: CanId = CanId::Std(0);
/// Base COB-ID for heartbeat messages (node ID is added)
pub const HEARTBEAT_BASE: u16 = 0x700;
/// Base COB-ID for emergency messages (node ID is added)
pub const EMCY_BASE: u16 = 0x80;
/// The base ID for SDO requests (server node ID is added)
pub const SDO_REQ_BASE: u16 = 0x600;
/// The base ID for SDO responses (server node ID is added)
pub const SDO_RESP_BASE: u16 = 0x580;
/// Default base COB-IDs of TPDO 1-4 (node ID is added)
pub const TPDO_BASES: [u16; 4] = [0x180, 0x280, 0x380, 0x480];
/// Default base COB-IDs of RPDO 1-4 (node ID is added)
pub const RPDO_BASES: [u16; 4] = [0x200, 0x300, 0x400, 0x500];

/// If `id` is `base + node` for a node ID in 1..=127, return the node ID
pub fn node_from_cob_id(id: CanId, base: u16) -> Option<u8> {
    match id {
        CanId::Std(raw) if raw & !0x7F == base && raw & 0x7F != 0 => Some((raw & 0x7F) as u8),
        _ => None,
    }
}

/// NMT command specifiers
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntEnum)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum NmtCommandSpecifier {
    /// Enter Operational
    Start = 1,
    /// Enter Stopped
    Stop = 2,
    /// Enter PreOperational
    EnterPreOperational = 128,
    /// Restart the application
    ResetNode = 129,
    /// Restart communication
    ResetCommunication = 130,
}

/// An NMT command frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NmtCommand {
    /// The command to execute
    pub cmd: NmtCommandSpecifier,
    /// The addressed node, or 0 for all nodes
    pub node: u8,
}

impl TryFrom<&CanMessage> for NmtCommand {
    type Error = MessageError;

    fn try_from(msg: &CanMessage) -> Result<Self, Self::Error> {
        let payload = msg.data();
        if msg.id() != NMT_CMD_ID {
            UnexpectedIdSnafu {
                cob_id: msg.id(),
                expected: NMT_CMD_ID,
            }
            .fail()
        } else if payload.len() >= 2 {
            let cmd = NmtCommandSpecifier::try_from(payload[0])
                .map_err(|value| MessageError::InvalidNmtCommand { value })?;
            Ok(NmtCommand {
                cmd,
                node: payload[1],
            })
        } else {
            MessageTooShortSnafu { len: payload.len() }.fail()
        }
    }
}

impl From<NmtCommand> for CanMessage {
    fn from(cmd: NmtCommand) -> Self {
        CanMessage::new(NMT_CMD_ID, &[cmd.cmd.into(), cmd.node])
    }
}

/// The NMT life-cycle states
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntEnum)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum NmtState {
    /// Initial state after power-on or restart. The node leaves it on its first step.
    BootUp = 0,
    /// Only NMT, heartbeat and SDO are active
    Stopped = 4,
    /// Everything is active, including PDOs
    Operational = 5,
    /// Awaiting a start command. PDOs are inactive.
    PreOperational = 127,
}

impl core::fmt::Display for NmtState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            NmtState::BootUp => write!(f, "BootUp"),
            NmtState::Stopped => write!(f, "Stopped"),
            NmtState::Operational => write!(f, "Operational"),
            NmtState::PreOperational => write!(f, "PreOperational"),
        }
    }
}

/// A heartbeat message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Heartbeat {
    /// The producing node
    pub node: u8,
    /// The producer's state
    pub state: NmtState,
}

impl From<Heartbeat> for CanMessage {
    fn from(value: Heartbeat) -> Self {
        CanMessage::new(
            CanId::Std(HEARTBEAT_BASE | value.node as u16),
            &[value.state.into()],
        )
    }
}

impl TryFrom<&CanMessage> for Heartbeat {
    type Error = MessageError;

    fn try_from(msg: &CanMessage) -> Result<Self, Self::Error> {
        let node = node_from_cob_id(msg.id(), HEARTBEAT_BASE)
            .ok_or(MessageError::UnrecognizedId { cob_id: msg.id() })?;
        let payload = msg.data();
        if payload.is_empty() {
            return MessageTooShortSnafu { len: 0usize }.fail();
        }
        let state = NmtState::try_from(payload[0] & 0x7F)
            .map_err(|value| MessageError::InvalidNmtState { value })?;
        Ok(Heartbeat { node, state })
    }
}

/// An emergency message
///
/// The frame is always 8 bytes: bytes 0-1 are unused, bytes 2-3 hold the error code (little endian)
/// and bytes 4-7 carry application data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Emergency {
    /// The producing node
    pub node: u8,
    /// Error code
    pub error_code: u16,
    /// Application specific data
    pub data: [u8; 4],
}

impl From<Emergency> for CanMessage {
    fn from(value: Emergency) -> Self {
        let mut payload = [0u8; 8];
        payload[2..4].copy_from_slice(&value.error_code.to_le_bytes());
        payload[4..8].copy_from_slice(&value.data);
        CanMessage::new(CanId::Std(EMCY_BASE | value.node as u16), &payload)
    }
}

impl TryFrom<&CanMessage> for Emergency {
    type Error = MessageError;

    fn try_from(msg: &CanMessage) -> Result<Self, Self::Error> {
        let node = node_from_cob_id(msg.id(), EMCY_BASE)
            .ok_or(MessageError::UnrecognizedId { cob_id: msg.id() })?;
        let payload = msg.data();
        if payload.len() < 8 {
            return MessageTooShortSnafu { len: payload.len() }.fail();
        }
        Ok(Emergency {
            node,
            error_code: u16::from_le_bytes([payload[2], payload[3]]),
            data: [payload[4], payload[5], payload[6], payload[7]],
        })
    }
}

/// A received frame classified by CANopen message type
///
/// Used for logging bus traffic. The node itself dispatches every frame to each of its handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CanOpenMessage {
    /// An NMT command
    NmtCommand(NmtCommand),
    /// A heartbeat
    Heartbeat(Heartbeat),
    /// An emergency
    Emergency(Emergency),
    /// An SDO request to `node`
    SdoRequest {
        /// The addressed server
        node: u8,
        /// The raw payload
        data: [u8; 8],
    },
    /// An SDO response from `node`
    SdoResponse {
        /// The responding server
        node: u8,
        /// The raw payload
        data: [u8; 8],
    },
    /// Any other standard frame, e.g. a PDO
    Other(CanMessage),
}

impl TryFrom<&CanMessage> for CanOpenMessage {
    type Error = MessageError;

    fn try_from(msg: &CanMessage) -> Result<Self, Self::Error> {
        let cob_id = msg.id();
        if cob_id.is_extended() {
            return ExtendedIdSnafu { cob_id }.fail();
        }
        if cob_id == NMT_CMD_ID {
            Ok(CanOpenMessage::NmtCommand(msg.try_into()?))
        } else if node_from_cob_id(cob_id, HEARTBEAT_BASE).is_some() {
            Ok(CanOpenMessage::Heartbeat(msg.try_into()?))
        } else if node_from_cob_id(cob_id, EMCY_BASE).is_some() {
            Ok(CanOpenMessage::Emergency(msg.try_into()?))
        } else if let Some(node) = node_from_cob_id(cob_id, SDO_REQ_BASE) {
            Ok(CanOpenMessage::SdoRequest {
                node,
                data: msg.data,
            })
        } else if let Some(node) = node_from_cob_id(cob_id, SDO_RESP_BASE) {
            Ok(CanOpenMessage::SdoResponse {
                node,
                data: msg.data,
            })
        } else {
            Ok(CanOpenMessage::Other(*msg))
        }
    }
}

/// Errors which occur while interpreting a CAN frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Snafu)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MessageError {
    /// The frame carries fewer bytes than the message needs
    #[snafu(display("Message too short ({len} bytes)"))]
    MessageTooShort {
        /// Number of bytes in the frame
        len: usize,
    },
    /// The message ID was not the expected value
    #[snafu(display("Unexpected message ID found: {cob_id:?}, expected: {expected:?}"))]
    UnexpectedId {
        /// The received ID
        cob_id: CanId,
        /// The ID that was expected
        expected: CanId,
    },
    /// The ID does not belong to the message type
    #[snafu(display("Unrecognized message ID {cob_id:?}"))]
    UnrecognizedId {
        /// The received ID
        cob_id: CanId,
    },
    /// CANopen only uses standard identifiers
    #[snafu(display("Extended ID {cob_id:?} is not a CANopen message"))]
    ExtendedId {
        /// The received ID
        cob_id: CanId,
    },
    /// The NMT command byte is not a known command
    #[snafu(display("Invalid NMT command {value}"))]
    InvalidNmtCommand {
        /// The received command byte
        value: u8,
    },
    /// The NMT state integer in the message is not a valid NMT state
    #[snafu(display("Invalid NMT state {value}"))]
    InvalidNmtState {
        /// The received state byte
        value: u8,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nmt_command_bytes() {
        let msg = CanMessage::new(NMT_CMD_ID, &[0x81, 5]);
        let cmd = NmtCommand::try_from(&msg).unwrap();
        assert_eq!(NmtCommandSpecifier::ResetNode, cmd.cmd);
        assert_eq!(5, cmd.node);
        assert_eq!(msg, CanMessage::from(cmd));

        let bad = CanMessage::new(NMT_CMD_ID, &[0x03, 0]);
        assert_eq!(
            Err(MessageError::InvalidNmtCommand { value: 3 }),
            NmtCommand::try_from(&bad)
        );
        let short = CanMessage::new(NMT_CMD_ID, &[0x01]);
        assert_eq!(
            Err(MessageError::MessageTooShort { len: 1 }),
            NmtCommand::try_from(&short)
        );
    }

    #[test]
    fn test_heartbeat_bytes() {
        let msg: CanMessage = Heartbeat {
            node: 0x12,
            state: NmtState::PreOperational,
        }
        .into();
        assert_eq!(CanId::Std(0x712), msg.id());
        assert_eq!(&[0x7F], msg.data());

        let hb = Heartbeat::try_from(&CanMessage::new(CanId::Std(0x705), &[0x05])).unwrap();
        assert_eq!(5, hb.node);
        assert_eq!(NmtState::Operational, hb.state);
    }

    #[test]
    fn test_emergency_bytes() {
        let emcy = Emergency {
            node: 3,
            error_code: 0x8130,
            data: [1, 2, 3, 4],
        };
        let msg: CanMessage = emcy.into();
        assert_eq!(CanId::Std(0x83), msg.id());
        assert_eq!(&[0, 0, 0x30, 0x81, 1, 2, 3, 4], msg.data());
        assert_eq!(Ok(emcy), Emergency::try_from(&msg));
    }

    #[test]
    fn test_classify() {
        let msg = CanMessage::new(CanId::Std(0x605), &[0x40, 0, 0x10, 0, 0, 0, 0, 0]);
        assert!(matches!(
            CanOpenMessage::try_from(&msg),
            Ok(CanOpenMessage::SdoRequest { node: 5, .. })
        ));
        let msg = CanMessage::new(CanId::Extended(0x605), &[0; 8]);
        assert!(CanOpenMessage::try_from(&msg).is_err());
        // 0x80 is SYNC, not an emergency
        let msg = CanMessage::new(CanId::Std(0x80), &[]);
        assert!(matches!(
            CanOpenMessage::try_from(&msg),
            Ok(CanOpenMessage::Other(_))
        ));
    }
}
