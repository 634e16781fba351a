//! SDO frame encoding and abort codes
//!
//! Every SDO frame is 8 bytes. The top three bits of byte 0 hold the command specifier, the rest of
//! the byte holds flags. Multiplexed frames carry the object index (little endian) in bytes 1-2 and
//! the sub index in byte 3.
//!
//! Block transfer segments carry no command specifier; they are parsed as [`BlockSegment`] by a
//! party which knows a block is in progress.
use int_enum::IntEnum;

use crate::messages::{CanId, CanMessage};

/// SDO abort codes
#[derive(Clone, Copy, Debug, PartialEq, Eq, IntEnum)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u32)]
pub enum AbortCode {
    /// Toggle bit not alternated
    ToggleNotAlternated = 0x0503_0000,
    /// SDO protocol timed out
    SdoTimeout = 0x0504_0000,
    /// Client/server command specifier not valid or unknown
    InvalidCommandSpecifier = 0x0504_0001,
    /// Invalid block size (block mode only)
    InvalidBlockSize = 0x0504_0002,
    /// Invalid sequence number (block mode only)
    InvalidSequenceNumber = 0x0504_0003,
    /// CRC Error (block mode only )
    CrcError = 0x0504_0004,
    /// Out of memory
    OutOfMemory = 0x0504_0005,
    /// Unsupported access to an object
    UnsupportedAccess = 0x0601_0000,
    /// Attempt to read a write only object
    WriteOnly = 0x0601_0001,
    /// Attempt to write a read only object
    ReadOnly = 0x0601_0002,
    /// Object does not exist in the dictionary
    NoSuchObject = 0x0602_0000,
    /// Object cannot be mapped to the PDO
    UnnallowedPdo = 0x0604_0041,
    /// The number and length of objects would exceed PDO length
    PdoTooLong = 0x0604_0042,
    /// General parameter incompatibility
    IncompatibleParameter = 0x0604_0043,
    /// Access failed due to hardware error
    HardwareError = 0x0606_0000,
    /// Data type does not match, length of service parameter does not match
    DataTypeMismatch = 0x0607_0010,
    /// Data type does not match, length of service parameter too high
    DataTypeMismatchLengthHigh = 0x0607_0012,
    /// Data type does not match, length of service parameter too low
    DataTypeMismatchLengthLow = 0x0607_0013,
    /// Sub-index does not exist
    NoSuchSubIndex = 0x0609_0011,
    /// Invalid value for parameter (download only)
    InvalidValue = 0x0609_0030,
    /// Value of parameter too high (download only)
    ValueTooHigh = 0x0609_0031,
    /// Value of parameter too low (download only)
    ValueTooLow = 0x0609_0032,
    /// Resource not available: SDO connection
    ResourceNotAvailable = 0x060A_0023,
    /// General error
    GeneralError = 0x0800_0000,
    /// Data cannot be transferred or stored to the application
    CantStore = 0x0800_0020,
    /// Data cannot be transferred or stored to the application because of local control
    CantStoreLocalControl = 0x0800_0021,
    /// Data cannot be transferred or stored to the application because of the device state
    CantStoreDeviceState = 0x0800_0022,
    /// No object dictionary is present
    NoObjectDict = 0x0800_0023,
    /// No data available
    NoData = 0x0800_0024,
}

/// An abort code as received over the bus, which may not be one of the known codes
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RawAbortCode {
    /// A recognized abort code
    Valid(AbortCode),
    /// An unrecognized abort code
    Unknown(u32),
}

impl From<u32> for RawAbortCode {
    fn from(value: u32) -> Self {
        match AbortCode::try_from(value) {
            Ok(code) => RawAbortCode::Valid(code),
            Err(raw) => RawAbortCode::Unknown(raw),
        }
    }
}

impl From<AbortCode> for RawAbortCode {
    fn from(value: AbortCode) -> Self {
        RawAbortCode::Valid(value)
    }
}

impl core::fmt::Display for RawAbortCode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            RawAbortCode::Valid(code) => write!(f, "{:?} (0x{:08X})", code, *code as u32),
            RawAbortCode::Unknown(raw) => write!(f, "Unknown (0x{:08X})", raw),
        }
    }
}

/// Client command specifier values (bits 7-5 of byte 0 in requests)
#[derive(Clone, Copy, Debug, PartialEq, Eq, IntEnum)]
#[repr(u8)]
pub enum ClientCommand {
    /// Segment of a segmented download
    DownloadSegment = 0,
    /// Start a download
    InitiateDownload = 1,
    /// Start an upload
    InitiateUpload = 2,
    /// Request the next upload segment
    ReqUploadSegment = 3,
    /// Abort the transfer
    Abort = 4,
    /// Block upload sub-commands
    BlockUpload = 5,
    /// Block download sub-commands
    BlockDownload = 6,
}

/// Server command specifier values (bits 7-5 of byte 0 in responses)
#[derive(Clone, Copy, Debug, PartialEq, Eq, IntEnum)]
#[repr(u8)]
pub enum ServerCommand {
    /// Segment of a segmented upload
    SegmentUpload = 0,
    /// Acknowledge a download segment
    SegmentDownload = 1,
    /// Acknowledge an upload
    Upload = 2,
    /// Acknowledge a download command
    Download = 3,
    /// Abort the transfer
    Abort = 4,
    /// Block download sub-commands
    BlockDownload = 5,
    /// Block upload sub-commands
    BlockUpload = 6,
}

/// Largest block size allowed in block transfers
pub const MAX_BLOCK_SIZE: u8 = 127;

/// Sub-command bits of block transfer frames
mod sub_cmd {
    pub const INITIATE: u8 = 0;
    pub const END: u8 = 1;
    pub const CONFIRM_BLOCK: u8 = 2;
    pub const START_UPLOAD: u8 = 3;
}

const fn cmd_byte(cs: u8, flags: u8) -> u8 {
    (cs << 5) | (flags & 0x1F)
}

fn write_mux(payload: &mut [u8; 8], index: u16, sub: u8) {
    payload[1..3].copy_from_slice(&index.to_le_bytes());
    payload[3] = sub;
}

fn read_index(value: &[u8]) -> u16 {
    u16::from_le_bytes([value[1], value[2]])
}

fn read_u32(value: &[u8]) -> u32 {
    u32::from_le_bytes([value[4], value[5], value[6], value[7]])
}

fn read_seg_data(value: &[u8]) -> [u8; 7] {
    let mut data = [0; 7];
    data.copy_from_slice(&value[1..8]);
    data
}

fn bit(byte: u8, n: u8) -> bool {
    byte & (1 << n) != 0
}

/// An SDO request frame sent from the client to the server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdoRequest {
    /// Start a download, or perform a whole expedited download
    InitiateDownload {
        /// Number of unused bytes in data
        n: u8,
        /// Expedited
        e: bool,
        /// Size valid
        s: bool,
        /// Object index
        index: u16,
        /// Object sub-index
        sub: u8,
        /// The value when e=1, or the size when e=0 and s=1
        data: [u8; 4],
    },
    /// One segment of a segmented download
    DownloadSegment {
        /// Toggle flag
        t: bool,
        /// Number of unused bytes in data
        n: u8,
        /// When set, indicates there are no more segments to be sent
        c: bool,
        /// Segment data
        data: [u8; 7],
    },
    /// Start an upload
    InitiateUpload {
        /// Object index
        index: u16,
        /// Object sub-index
        sub: u8,
    },
    /// Request the next segment of a segmented upload
    ReqUploadSegment {
        /// Toggle flag
        t: bool,
    },
    /// Abort the transfer
    Abort {
        /// Object index
        index: u16,
        /// Object sub-index
        sub: u8,
        /// The abort code
        abort_code: u32,
    },
    /// Start a block download
    InitiateBlockDownload {
        /// Client CRC supported flag
        cc: bool,
        /// Size flag
        s: bool,
        /// Object index
        index: u16,
        /// Object sub-index
        sub: u8,
        /// If s=1, contains the number of bytes to be downloaded
        size: u32,
    },
    /// End a block download
    EndBlockDownload {
        /// Number of bytes in the last segment which carry no data
        n: u8,
        /// CRC of the whole transfer
        crc: u16,
    },
    /// Start a block upload
    InitiateBlockUpload {
        /// Client CRC supported flag
        cc: bool,
        /// Object index
        index: u16,
        /// Object sub-index
        sub: u8,
        /// Number of segments per block
        blksize: u8,
        /// Protocol switch threshold: if the object is no larger, the server may answer with a
        /// normal upload instead
        pst: u8,
    },
    /// Tell the server to begin sending block upload segments
    StartBlockUpload,
    /// Acknowledge a block of upload segments
    ConfirmBlock {
        /// The last sequence number received in order
        ackseq: u8,
        /// Number of segments in the next block
        blksize: u8,
    },
    /// Acknowledge the end of a block upload
    EndBlockUpload,
}

impl SdoRequest {
    /// Create an abort message
    pub fn abort(index: u16, sub: u8, abort_code: AbortCode) -> Self {
        SdoRequest::Abort {
            index,
            sub,
            abort_code: abort_code as u32,
        }
    }

    /// Create an initiate download message
    pub fn initiate_download(index: u16, sub: u8, size: Option<u32>) -> Self {
        let data = size.unwrap_or(0).to_le_bytes();

        SdoRequest::InitiateDownload {
            n: 0,
            e: false,
            s: size.is_some(),
            index,
            sub,
            data,
        }
    }

    /// Create a download segment message
    ///
    /// At most 7 bytes of `segment_data` are used.
    pub fn download_segment(toggle: bool, last_segment: bool, segment_data: &[u8]) -> Self {
        let len = segment_data.len().min(7);
        let mut data = [0; 7];
        data[0..len].copy_from_slice(&segment_data[..len]);
        SdoRequest::DownloadSegment {
            t: toggle,
            n: 7 - len as u8,
            c: last_segment,
            data,
        }
    }

    /// Create an expedited download message
    ///
    /// At most 4 bytes of `data` are used.
    pub fn expedited_download(index: u16, sub: u8, data: &[u8]) -> Self {
        let len = data.len().min(4);
        let mut msg_data = [0; 4];
        msg_data[0..len].copy_from_slice(&data[..len]);

        SdoRequest::InitiateDownload {
            n: (4 - len) as u8,
            e: true,
            s: true,
            index,
            sub,
            data: msg_data,
        }
    }

    /// Create an initiate upload message
    pub fn initiate_upload(index: u16, sub: u8) -> Self {
        SdoRequest::InitiateUpload { index, sub }
    }

    /// Create an upload segment request
    pub fn upload_segment_request(toggle: bool) -> Self {
        SdoRequest::ReqUploadSegment { t: toggle }
    }

    /// Create an initiate block download message, with CRC support and a known size
    pub fn initiate_block_download(index: u16, sub: u8, size: u32) -> Self {
        SdoRequest::InitiateBlockDownload {
            cc: true,
            s: true,
            index,
            sub,
            size,
        }
    }

    /// Create an end block download message
    pub fn end_block_download(n: u8, crc: u16) -> Self {
        SdoRequest::EndBlockDownload { n, crc }
    }

    /// Create an initiate block upload message, with CRC support
    pub fn initiate_block_upload(index: u16, sub: u8, blksize: u8, pst: u8) -> Self {
        SdoRequest::InitiateBlockUpload {
            cc: true,
            index,
            sub,
            blksize,
            pst,
        }
    }

    /// Get the encoded 8 byte payload
    pub fn to_bytes(self) -> [u8; 8] {
        let mut payload = [0; 8];

        match self {
            SdoRequest::InitiateDownload {
                n,
                e,
                s,
                index,
                sub,
                data,
            } => {
                payload[0] = cmd_byte(
                    ClientCommand::InitiateDownload as u8,
                    ((n & 0x3) << 2) | ((e as u8) << 1) | s as u8,
                );
                write_mux(&mut payload, index, sub);
                payload[4..8].copy_from_slice(&data);
            }
            SdoRequest::DownloadSegment { t, n, c, data } => {
                payload[0] = cmd_byte(
                    ClientCommand::DownloadSegment as u8,
                    ((t as u8) << 4) | ((n & 7) << 1) | (c as u8),
                );
                payload[1..8].copy_from_slice(&data);
            }
            SdoRequest::InitiateUpload { index, sub } => {
                payload[0] = cmd_byte(ClientCommand::InitiateUpload as u8, 0);
                write_mux(&mut payload, index, sub);
            }
            SdoRequest::ReqUploadSegment { t } => {
                payload[0] = cmd_byte(ClientCommand::ReqUploadSegment as u8, (t as u8) << 4);
            }
            SdoRequest::Abort {
                index,
                sub,
                abort_code,
            } => {
                payload[0] = cmd_byte(ClientCommand::Abort as u8, 0);
                write_mux(&mut payload, index, sub);
                payload[4..8].copy_from_slice(&abort_code.to_le_bytes());
            }
            SdoRequest::InitiateBlockDownload {
                cc,
                s,
                index,
                sub,
                size,
            } => {
                payload[0] = cmd_byte(
                    ClientCommand::BlockDownload as u8,
                    ((cc as u8) << 2) | ((s as u8) << 1) | sub_cmd::INITIATE,
                );
                write_mux(&mut payload, index, sub);
                payload[4..8].copy_from_slice(&size.to_le_bytes());
            }
            SdoRequest::EndBlockDownload { n, crc } => {
                payload[0] = cmd_byte(
                    ClientCommand::BlockDownload as u8,
                    ((n & 7) << 2) | sub_cmd::END,
                );
                payload[1..3].copy_from_slice(&crc.to_le_bytes());
            }
            SdoRequest::InitiateBlockUpload {
                cc,
                index,
                sub,
                blksize,
                pst,
            } => {
                payload[0] = cmd_byte(
                    ClientCommand::BlockUpload as u8,
                    ((cc as u8) << 2) | sub_cmd::INITIATE,
                );
                write_mux(&mut payload, index, sub);
                payload[4] = blksize;
                payload[5] = pst;
            }
            SdoRequest::StartBlockUpload => {
                payload[0] = cmd_byte(ClientCommand::BlockUpload as u8, sub_cmd::START_UPLOAD);
            }
            SdoRequest::ConfirmBlock { ackseq, blksize } => {
                payload[0] = cmd_byte(ClientCommand::BlockUpload as u8, sub_cmd::CONFIRM_BLOCK);
                payload[1] = ackseq;
                payload[2] = blksize;
            }
            SdoRequest::EndBlockUpload => {
                payload[0] = cmd_byte(ClientCommand::BlockUpload as u8, sub_cmd::END);
            }
        }
        payload
    }

    /// Encode as a CAN frame with the given ID
    pub fn to_can_message(self, id: CanId) -> CanMessage {
        CanMessage::new(id, &self.to_bytes())
    }
}

impl TryFrom<&[u8]> for SdoRequest {
    type Error = AbortCode;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        if value.len() < 8 {
            return Err(AbortCode::InvalidCommandSpecifier);
        }
        let ccs = ClientCommand::try_from(value[0] >> 5)
            .map_err(|_| AbortCode::InvalidCommandSpecifier)?;

        match ccs {
            ClientCommand::DownloadSegment => Ok(SdoRequest::DownloadSegment {
                t: bit(value[0], 4),
                n: (value[0] >> 1) & 0x7,
                c: bit(value[0], 0),
                data: read_seg_data(value),
            }),
            ClientCommand::InitiateDownload => Ok(SdoRequest::InitiateDownload {
                n: (value[0] >> 2) & 0x3,
                e: bit(value[0], 1),
                s: bit(value[0], 0),
                index: read_index(value),
                sub: value[3],
                data: [value[4], value[5], value[6], value[7]],
            }),
            ClientCommand::InitiateUpload => Ok(SdoRequest::InitiateUpload {
                index: read_index(value),
                sub: value[3],
            }),
            ClientCommand::ReqUploadSegment => Ok(SdoRequest::ReqUploadSegment {
                t: bit(value[0], 4),
            }),
            ClientCommand::Abort => Ok(SdoRequest::Abort {
                index: read_index(value),
                sub: value[3],
                abort_code: read_u32(value),
            }),
            ClientCommand::BlockUpload => match value[0] & 0x3 {
                sub_cmd::INITIATE => Ok(SdoRequest::InitiateBlockUpload {
                    cc: bit(value[0], 2),
                    index: read_index(value),
                    sub: value[3],
                    blksize: value[4],
                    pst: value[5],
                }),
                sub_cmd::END => Ok(SdoRequest::EndBlockUpload),
                sub_cmd::CONFIRM_BLOCK => Ok(SdoRequest::ConfirmBlock {
                    ackseq: value[1],
                    blksize: value[2],
                }),
                _ => Ok(SdoRequest::StartBlockUpload),
            },
            ClientCommand::BlockDownload => {
                if value[0] & 1 == sub_cmd::END {
                    Ok(SdoRequest::EndBlockDownload {
                        n: (value[0] >> 2) & 0x7,
                        crc: u16::from_le_bytes([value[1], value[2]]),
                    })
                } else {
                    Ok(SdoRequest::InitiateBlockDownload {
                        cc: bit(value[0], 2),
                        s: bit(value[0], 1),
                        index: read_index(value),
                        sub: value[3],
                        size: read_u32(value),
                    })
                }
            }
        }
    }
}

/// An SDO response frame sent from the server to the client
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SdoResponse {
    /// Response to an initiate upload
    ConfirmUpload {
        /// Number of unused bytes in data
        n: u8,
        /// Expedited flag
        e: bool,
        /// Size flag
        s: bool,
        /// Object index
        index: u16,
        /// Object sub-index
        sub: u8,
        /// Value if e=1, or size if s=1
        data: [u8; 4],
    },
    /// One segment of a segmented upload
    UploadSegment {
        /// Toggle flag
        t: bool,
        /// Number of unused bytes in data
        n: u8,
        /// Set on the last segment
        c: bool,
        /// Segment data
        data: [u8; 7],
    },
    /// Response to an initiate download
    ConfirmDownload {
        /// Object index
        index: u16,
        /// Object sub-index
        sub: u8,
    },
    /// Response to a download segment
    ConfirmDownloadSegment {
        /// Toggle flag, matching the segment being acknowledged
        t: bool,
    },
    /// Response to an initiate block download
    ConfirmBlockDownload {
        /// Server CRC supported flag
        sc: bool,
        /// Object index
        index: u16,
        /// Object sub-index
        sub: u8,
        /// Number of segments per block
        blksize: u8,
    },
    /// Acknowledge a block of download segments
    ConfirmBlock {
        /// The last sequence number received in order
        ackseq: u8,
        /// Number of segments in the next block
        blksize: u8,
    },
    /// Acknowledge the end of a block download
    ConfirmBlockDownloadEnd,
    /// Response to an initiate block upload
    ConfirmBlockUpload {
        /// Server CRC supported flag
        sc: bool,
        /// Size flag
        s: bool,
        /// Object index
        index: u16,
        /// Object sub-index
        sub: u8,
        /// Number of bytes to be uploaded
        size: u32,
    },
    /// End a block upload
    BlockUploadEnd {
        /// Number of bytes in the last segment which carry no data
        n: u8,
        /// CRC of the whole transfer
        crc: u16,
    },
    /// Abort the transfer
    Abort {
        /// Object index
        index: u16,
        /// Object sub-index
        sub: u8,
        /// The abort code
        abort_code: u32,
    },
}

impl TryFrom<&[u8]> for SdoResponse {
    type Error = AbortCode;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        if value.len() < 8 {
            return Err(AbortCode::InvalidCommandSpecifier);
        }
        let scs = ServerCommand::try_from(value[0] >> 5)
            .map_err(|_| AbortCode::InvalidCommandSpecifier)?;
        match scs {
            ServerCommand::SegmentUpload => Ok(SdoResponse::UploadSegment {
                t: bit(value[0], 4),
                n: (value[0] >> 1) & 7,
                c: bit(value[0], 0),
                data: read_seg_data(value),
            }),
            ServerCommand::SegmentDownload => Ok(SdoResponse::ConfirmDownloadSegment {
                t: bit(value[0], 4),
            }),
            ServerCommand::Upload => Ok(SdoResponse::ConfirmUpload {
                n: (value[0] >> 2) & 0x3,
                e: bit(value[0], 1),
                s: bit(value[0], 0),
                index: read_index(value),
                sub: value[3],
                data: [value[4], value[5], value[6], value[7]],
            }),
            ServerCommand::Download => Ok(SdoResponse::ConfirmDownload {
                index: read_index(value),
                sub: value[3],
            }),
            ServerCommand::Abort => Ok(SdoResponse::Abort {
                index: read_index(value),
                sub: value[3],
                abort_code: read_u32(value),
            }),
            ServerCommand::BlockDownload => match value[0] & 0x3 {
                sub_cmd::INITIATE => Ok(SdoResponse::ConfirmBlockDownload {
                    sc: bit(value[0], 2),
                    index: read_index(value),
                    sub: value[3],
                    blksize: value[4],
                }),
                sub_cmd::END => Ok(SdoResponse::ConfirmBlockDownloadEnd),
                sub_cmd::CONFIRM_BLOCK => Ok(SdoResponse::ConfirmBlock {
                    ackseq: value[1],
                    blksize: value[2],
                }),
                _ => Err(AbortCode::InvalidCommandSpecifier),
            },
            ServerCommand::BlockUpload => {
                if value[0] & 1 == sub_cmd::END {
                    Ok(SdoResponse::BlockUploadEnd {
                        n: (value[0] >> 2) & 7,
                        crc: u16::from_le_bytes([value[1], value[2]]),
                    })
                } else {
                    Ok(SdoResponse::ConfirmBlockUpload {
                        sc: bit(value[0], 2),
                        s: bit(value[0], 1),
                        index: read_index(value),
                        sub: value[3],
                        size: read_u32(value),
                    })
                }
            }
        }
    }
}

impl TryFrom<&CanMessage> for SdoResponse {
    type Error = AbortCode;

    fn try_from(msg: &CanMessage) -> Result<Self, Self::Error> {
        SdoResponse::try_from(msg.data())
    }
}

impl SdoResponse {
    /// Create an expedited upload response
    ///
    /// At most 4 bytes of `data` are used.
    pub fn expedited_upload(index: u16, sub: u8, data: &[u8]) -> SdoResponse {
        let len = data.len().min(4);
        let mut msg_data = [0; 4];
        msg_data[0..len].copy_from_slice(&data[..len]);

        SdoResponse::ConfirmUpload {
            index,
            sub,
            e: true,
            s: true,
            n: 4 - len as u8,
            data: msg_data,
        }
    }

    /// Create a response announcing a segmented upload of `size` bytes
    pub fn upload_acknowledge(index: u16, sub: u8, size: u32) -> SdoResponse {
        SdoResponse::ConfirmUpload {
            n: 0,
            e: false,
            s: true,
            index,
            sub,
            data: size.to_le_bytes(),
        }
    }

    /// Create an upload segment
    ///
    /// At most 7 bytes of `data` are used.
    pub fn upload_segment(t: bool, c: bool, data: &[u8]) -> SdoResponse {
        let len = data.len().min(7);
        let mut buf = [0; 7];
        buf[0..len].copy_from_slice(&data[..len]);
        SdoResponse::UploadSegment {
            t,
            n: (7 - len) as u8,
            c,
            data: buf,
        }
    }

    /// Create a download acknowledgement
    pub fn download_acknowledge(index: u16, sub: u8) -> SdoResponse {
        SdoResponse::ConfirmDownload { index, sub }
    }

    /// Create a download segment acknowledgement
    pub fn download_segment_acknowledge(t: bool) -> SdoResponse {
        SdoResponse::ConfirmDownloadSegment { t }
    }

    /// Create a block download acknowledgement, with CRC support
    pub fn block_download_acknowledge(index: u16, sub: u8, blksize: u8) -> SdoResponse {
        SdoResponse::ConfirmBlockDownload {
            sc: true,
            index,
            sub,
            blksize,
        }
    }

    /// Create a block upload acknowledgement, with CRC support
    pub fn block_upload_acknowledge(index: u16, sub: u8, size: u32) -> SdoResponse {
        SdoResponse::ConfirmBlockUpload {
            sc: true,
            s: true,
            index,
            sub,
            size,
        }
    }

    /// Create an abort response
    pub fn abort(index: u16, sub: u8, abort_code: AbortCode) -> SdoResponse {
        let abort_code = abort_code as u32;
        SdoResponse::Abort {
            index,
            sub,
            abort_code,
        }
    }

    /// Get the encoded 8 byte payload
    pub fn to_bytes(self) -> [u8; 8] {
        let mut payload = [0; 8];

        match self {
            SdoResponse::ConfirmUpload {
                n,
                e,
                s,
                index,
                sub,
                data,
            } => {
                payload[0] = cmd_byte(
                    ServerCommand::Upload as u8,
                    ((n & 0x3) << 2) | ((e as u8) << 1) | (s as u8),
                );
                write_mux(&mut payload, index, sub);
                payload[4..8].copy_from_slice(&data);
            }
            SdoResponse::ConfirmDownload { index, sub } => {
                payload[0] = cmd_byte(ServerCommand::Download as u8, 0);
                write_mux(&mut payload, index, sub);
            }
            SdoResponse::UploadSegment { t, n, c, data } => {
                payload[0] = cmd_byte(
                    ServerCommand::SegmentUpload as u8,
                    ((t as u8) << 4) | ((n & 7) << 1) | c as u8,
                );
                payload[1..8].copy_from_slice(&data);
            }
            SdoResponse::ConfirmDownloadSegment { t } => {
                payload[0] = cmd_byte(ServerCommand::SegmentDownload as u8, (t as u8) << 4);
            }
            SdoResponse::ConfirmBlockDownload {
                sc,
                index,
                sub,
                blksize,
            } => {
                payload[0] = cmd_byte(
                    ServerCommand::BlockDownload as u8,
                    ((sc as u8) << 2) | sub_cmd::INITIATE,
                );
                write_mux(&mut payload, index, sub);
                payload[4] = blksize;
            }
            SdoResponse::ConfirmBlock { ackseq, blksize } => {
                payload[0] = cmd_byte(ServerCommand::BlockDownload as u8, sub_cmd::CONFIRM_BLOCK);
                payload[1] = ackseq;
                payload[2] = blksize;
            }
            SdoResponse::ConfirmBlockDownloadEnd => {
                payload[0] = cmd_byte(ServerCommand::BlockDownload as u8, sub_cmd::END);
            }
            SdoResponse::ConfirmBlockUpload {
                sc,
                s,
                index,
                sub,
                size,
            } => {
                payload[0] = cmd_byte(
                    ServerCommand::BlockUpload as u8,
                    ((sc as u8) << 2) | ((s as u8) << 1) | sub_cmd::INITIATE,
                );
                write_mux(&mut payload, index, sub);
                payload[4..8].copy_from_slice(&size.to_le_bytes());
            }
            SdoResponse::BlockUploadEnd { n, crc } => {
                payload[0] = cmd_byte(
                    ServerCommand::BlockUpload as u8,
                    ((n & 7) << 2) | sub_cmd::END,
                );
                payload[1..3].copy_from_slice(&crc.to_le_bytes());
            }
            SdoResponse::Abort {
                index,
                sub,
                abort_code,
            } => {
                payload[0] = cmd_byte(ServerCommand::Abort as u8, 0);
                write_mux(&mut payload, index, sub);
                payload[4..8].copy_from_slice(&abort_code.to_le_bytes());
            }
        }
        payload
    }

    /// Encode as a CAN frame with the given ID
    pub fn to_can_message(self, id: CanId) -> CanMessage {
        CanMessage::new(id, &self.to_bytes())
    }
}

/// One segment of a block transfer
///
/// Byte 0 holds the "no more segments" flag in bit 7 and the sequence number (1..=127) in bits 6-0.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockSegment {
    /// Set on the last segment of the transfer
    pub c: bool,
    /// Sequence number within the block
    pub seqnum: u8,
    /// Segment data
    pub data: [u8; 7],
}

impl BlockSegment {
    /// Create a block segment
    ///
    /// At most 7 bytes of `data` are used.
    pub fn new(seqnum: u8, last: bool, data: &[u8]) -> Self {
        let len = data.len().min(7);
        let mut buf = [0; 7];
        buf[..len].copy_from_slice(&data[..len]);
        Self {
            c: last,
            seqnum: seqnum & 0x7F,
            data: buf,
        }
    }

    /// Get the encoded 8 byte payload
    pub fn to_bytes(self) -> [u8; 8] {
        let mut payload = [0; 8];
        payload[0] = ((self.c as u8) << 7) | (self.seqnum & 0x7F);
        payload[1..8].copy_from_slice(&self.data);
        payload
    }

    /// Encode as a CAN frame with the given ID
    pub fn to_can_message(self, id: CanId) -> CanMessage {
        CanMessage::new(id, &self.to_bytes())
    }
}

impl TryFrom<&[u8]> for BlockSegment {
    type Error = AbortCode;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        if value.len() < 8 {
            return Err(AbortCode::InvalidCommandSpecifier);
        }
        Ok(BlockSegment {
            c: bit(value[0], 7),
            seqnum: value[0] & 0x7F,
            data: read_seg_data(value),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expedited_download_bytes() {
        let req = SdoRequest::expedited_download(0x2000, 1, &[0xAA, 0xBB]);
        assert_eq!([0x2B, 0x00, 0x20, 1, 0xAA, 0xBB, 0, 0], req.to_bytes());
        assert_eq!(Ok(req), SdoRequest::try_from(&req.to_bytes()[..]));

        let req = SdoRequest::expedited_download(0x2000, 1, &[1, 2, 3, 4]);
        assert_eq!(0x23, req.to_bytes()[0]);
    }

    #[test]
    fn test_segmented_download_bytes() {
        let req = SdoRequest::initiate_download(0x1008, 0, Some(20));
        assert_eq!([0x21, 0x08, 0x10, 0, 20, 0, 0, 0], req.to_bytes());

        let seg = SdoRequest::download_segment(true, true, &[1, 2, 3]);
        // t=1, n=4, c=1
        assert_eq!(0x19, seg.to_bytes()[0]);
        assert_eq!([1, 2, 3, 0, 0, 0, 0], seg.to_bytes()[1..8]);

        assert_eq!(
            [0x60, 0x08, 0x10, 0, 0, 0, 0, 0],
            SdoResponse::download_acknowledge(0x1008, 0).to_bytes()
        );
        assert_eq!(
            0x30,
            SdoResponse::download_segment_acknowledge(true).to_bytes()[0]
        );
    }

    #[test]
    fn test_upload_bytes() {
        assert_eq!(
            [0x40, 0x18, 0x10, 1, 0, 0, 0, 0],
            SdoRequest::initiate_upload(0x1018, 1).to_bytes()
        );
        assert_eq!(
            [0x4F, 0x18, 0x10, 1, 7, 0, 0, 0],
            SdoResponse::expedited_upload(0x1018, 1, &[7]).to_bytes()
        );
        assert_eq!(
            [0x41, 0x08, 0x10, 0, 11, 0, 0, 0],
            SdoResponse::upload_acknowledge(0x1008, 0, 11).to_bytes()
        );
        assert_eq!(0x60, SdoRequest::upload_segment_request(false).to_bytes()[0]);
        assert_eq!(0x70, SdoRequest::upload_segment_request(true).to_bytes()[0]);

        let seg = SdoResponse::upload_segment(false, true, b"abcd");
        assert_eq!(0x07, seg.to_bytes()[0]);
        assert_eq!(Ok(seg), SdoResponse::try_from(&seg.to_bytes()[..]));
    }

    #[test]
    fn test_abort_bytes() {
        let resp = SdoResponse::abort(0x2000, 3, AbortCode::NoSuchObject);
        assert_eq!([0x80, 0x00, 0x20, 3, 0x00, 0x00, 0x02, 0x06], resp.to_bytes());
        let SdoResponse::Abort { abort_code, .. } =
            SdoResponse::try_from(&resp.to_bytes()[..]).unwrap()
        else {
            panic!("Expected abort");
        };
        assert_eq!(
            RawAbortCode::Valid(AbortCode::NoSuchObject),
            RawAbortCode::from(abort_code)
        );
        assert_eq!(RawAbortCode::Unknown(0x1234), RawAbortCode::from(0x1234u32));
    }

    #[test]
    fn test_block_download_bytes() {
        let req = SdoRequest::initiate_block_download(0x2001, 0, 100);
        assert_eq!([0xC6, 0x01, 0x20, 0, 100, 0, 0, 0], req.to_bytes());
        assert_eq!(Ok(req), SdoRequest::try_from(&req.to_bytes()[..]));

        let resp = SdoResponse::block_download_acknowledge(0x2001, 0, 127);
        assert_eq!([0xA4, 0x01, 0x20, 0, 127, 0, 0, 0], resp.to_bytes());

        let ack = SdoResponse::ConfirmBlock {
            ackseq: 15,
            blksize: 127,
        };
        assert_eq!([0xA2, 15, 127, 0, 0, 0, 0, 0], ack.to_bytes());
        assert_eq!(Ok(ack), SdoResponse::try_from(&ack.to_bytes()[..]));

        let end = SdoRequest::end_block_download(5, 0xBEEF);
        assert_eq!([0xD5, 0xEF, 0xBE, 0, 0, 0, 0, 0], end.to_bytes());
        assert_eq!(Ok(end), SdoRequest::try_from(&end.to_bytes()[..]));
        assert_eq!(0xA1, SdoResponse::ConfirmBlockDownloadEnd.to_bytes()[0]);

        let seg = BlockSegment::new(127, true, &[1, 2]);
        assert_eq!([0xFF, 1, 2, 0, 0, 0, 0, 0], seg.to_bytes());
        assert_eq!(Ok(seg), BlockSegment::try_from(&seg.to_bytes()[..]));
    }

    #[test]
    fn test_block_upload_bytes() {
        let req = SdoRequest::initiate_block_upload(0x2002, 0, 127, 0);
        assert_eq!([0xA4, 0x02, 0x20, 0, 127, 0, 0, 0], req.to_bytes());
        assert_eq!(Ok(req), SdoRequest::try_from(&req.to_bytes()[..]));
        assert_eq!(0xA3, SdoRequest::StartBlockUpload.to_bytes()[0]);
        assert_eq!(0xA1, SdoRequest::EndBlockUpload.to_bytes()[0]);

        let resp = SdoResponse::block_upload_acknowledge(0x2002, 0, 300);
        assert_eq!([0xC6, 0x02, 0x20, 0, 0x2C, 0x01, 0, 0], resp.to_bytes());
        assert_eq!(Ok(resp), SdoResponse::try_from(&resp.to_bytes()[..]));

        let end = SdoResponse::BlockUploadEnd { n: 3, crc: 0x1234 };
        assert_eq!([0xCD, 0x34, 0x12, 0, 0, 0, 0, 0], end.to_bytes());
    }

    #[test]
    fn test_invalid_frames() {
        assert_eq!(
            Err(AbortCode::InvalidCommandSpecifier),
            SdoRequest::try_from(&[0xE0, 0, 0, 0, 0, 0, 0, 0][..])
        );
        assert_eq!(
            Err(AbortCode::InvalidCommandSpecifier),
            SdoRequest::try_from(&[0x40, 0, 0x10, 0][..])
        );
        assert_eq!(
            Err(AbortCode::InvalidCommandSpecifier),
            SdoResponse::try_from(&[0xE0, 0, 0, 0, 0, 0, 0, 0][..])
        );
    }
}
