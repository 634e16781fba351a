use crc16::{State, XMODEM};
use defmt_or_log::{debug, warn};
use tincan_common::{
    objects::ObjectId,
    sdo::{AbortCode, BlockSegment, SdoRequest, SdoResponse, MAX_BLOCK_SIZE},
};

use super::SDO_BUFFER_SIZE;
use crate::{delay::Delay, object_dict::ObjectDictionary};

/// Size of block download blocks
///
/// One block of 127 segments exactly fills the buffer.
const BLKSIZE: u8 = MAX_BLOCK_SIZE;

/// Byte 0 of an abort frame
///
/// During a block download every other frame is a segment, with a sequence number of at least 1.
const ABORT_CMD: u8 = 0x80;

/// Check the length announced by a client against the object and the buffer
fn validate_download_size(size: usize, capacity: usize) -> Result<(), AbortCode> {
    if size > capacity {
        Err(AbortCode::DataTypeMismatchLengthHigh)
    } else if size > SDO_BUFFER_SIZE {
        Err(AbortCode::OutOfMemory)
    } else {
        Ok(())
    }
}

/// A run of block upload segments to send
#[derive(Clone, Copy, Debug)]
struct Burst {
    start: usize,
    blksize: u8,
    len: usize,
}

struct SdoResult {
    response: Option<SdoResponse>,
    burst: Option<Burst>,
    updated_object: Option<ObjectId>,
    new_state: SdoState,
}

impl SdoResult {
    fn no_response(new_state: SdoState) -> Self {
        Self {
            response: None,
            burst: None,
            updated_object: None,
            new_state,
        }
    }

    fn abort(index: u16, sub: u8, abort_code: AbortCode) -> Self {
        warn!(
            "Aborting SDO transfer of 0x{:x}sub{}: {:?}",
            index, sub, abort_code
        );
        Self::response(SdoResponse::abort(index, sub, abort_code), SdoState::Idle)
    }

    fn response(response: SdoResponse, new_state: SdoState) -> Self {
        Self {
            response: Some(response),
            burst: None,
            updated_object: None,
            new_state,
        }
    }

    fn response_with_update(
        response: SdoResponse,
        index: u16,
        sub: u8,
        new_state: SdoState,
    ) -> Self {
        Self {
            response: Some(response),
            burst: None,
            updated_object: Some(ObjectId { index, sub }),
            new_state,
        }
    }

    fn burst(burst: Burst, new_state: SdoState) -> Self {
        Self {
            response: None,
            burst: Some(burst),
            updated_object: None,
            new_state,
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct SegmentedDownload {
    index: u16,
    sub: u8,
    toggle: bool,
    cursor: usize,
    size: Option<usize>,
}

#[derive(Clone, Copy, Debug)]
struct SegmentedUpload {
    index: u16,
    sub: u8,
    toggle: bool,
    cursor: usize,
    len: usize,
}

#[derive(Clone, Copy, Debug)]
struct BlockDownload {
    index: u16,
    sub: u8,
    client_supports_crc: bool,
    size: Option<usize>,
    /// Bytes received in acknowledged blocks
    committed: usize,
    next_seq: u8,
}

#[derive(Clone, Copy, Debug)]
struct BlockUpload {
    index: u16,
    sub: u8,
    len: usize,
    blksize: u8,
    block_start: usize,
}

impl BlockUpload {
    /// Number of segments in the block starting at `block_start`
    fn segments_in_block(&self) -> usize {
        (self.len - self.block_start)
            .div_ceil(7)
            .max(1)
            .min(self.blksize as usize)
    }
}

#[derive(Clone, Copy, Debug)]
enum SdoState {
    Idle,
    SegmentedDownload(SegmentedDownload),
    SegmentedUpload(SegmentedUpload),
    BlockDownload(BlockDownload),
    BlockDownloadEnd(BlockDownload),
    BlockUploadStart(BlockUpload),
    BlockUploadWaitAck(BlockUpload),
    BlockUploadEnd { index: u16, sub: u8 },
}

impl SdoState {
    /// The object of the transfer in progress
    fn object(&self) -> Option<(u16, u8)> {
        match *self {
            SdoState::Idle => None,
            SdoState::SegmentedDownload(s) => Some((s.index, s.sub)),
            SdoState::SegmentedUpload(s) => Some((s.index, s.sub)),
            SdoState::BlockDownload(s) | SdoState::BlockDownloadEnd(s) => Some((s.index, s.sub)),
            SdoState::BlockUploadStart(s) | SdoState::BlockUploadWaitAck(s) => {
                Some((s.index, s.sub))
            }
            SdoState::BlockUploadEnd { index, sub } => Some((index, sub)),
        }
    }
}

/// What the server produced for one request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerOutput {
    /// The response to send to the client
    pub response: Option<SdoResponse>,
    /// The object written, when a download completed
    ///
    /// The response acknowledges the write; the caller may replace it with an abort if its own
    /// handling of the write fails.
    pub updated_object: Option<ObjectId>,
}

/// Implements an SDO server
///
/// A single SDO server can be controlled by a single SDO client at one time. Downloads are
/// collected in the server's buffer and written to the object when the last segment arrives, so an
/// aborted download leaves the object untouched.
pub struct SdoServer {
    state: SdoState,
    buffer: [u8; SDO_BUFFER_SIZE],
    timer: Delay,
    timeout_ms: u32,
}

impl core::fmt::Debug for SdoServer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SdoServer")
            .field("state", &self.state)
            .field("timer", &self.timer)
            .field("timeout_ms", &self.timeout_ms)
            .finish()
    }
}

impl SdoServer {
    /// Create a new SDO server
    ///
    /// A transfer which sees no request for `timeout_ms` is aborted.
    pub const fn new(timeout_ms: u32) -> Self {
        Self {
            state: SdoState::Idle,
            buffer: [0; SDO_BUFFER_SIZE],
            timer: Delay::Idle,
            timeout_ms,
        }
    }

    /// Drop any transfer in progress without notifying the client
    pub fn reset(&mut self) {
        self.state = SdoState::Idle;
        self.timer.stop();
    }

    /// Returns true if no transfer is in progress
    pub fn is_idle(&self) -> bool {
        matches!(self.state, SdoState::Idle)
    }

    /// Handle the payload of a request frame
    ///
    /// Block upload segments are passed to `send_segment`, in order, before this returns.
    pub fn handle_request(
        &mut self,
        od: &ObjectDictionary,
        data: &[u8],
        send_segment: &mut impl FnMut(BlockSegment),
    ) -> ServerOutput {
        let result = match self.state {
            SdoState::BlockDownload(state) if data.first() != Some(&ABORT_CMD) => {
                self.block_segment(state, data)
            }
            state => match SdoRequest::try_from(data) {
                Ok(req) => self.dispatch(od, state, req),
                Err(abort_code) => {
                    let (index, sub) = state.object().unwrap_or((0, 0));
                    SdoResult::abort(index, sub, abort_code)
                }
            },
        };

        if let Some(burst) = result.burst {
            self.send_burst(burst, send_segment);
        }
        self.state = result.new_state;
        if self.is_idle() {
            self.timer.stop();
        } else {
            self.timer.set(self.timeout_ms);
        }
        ServerOutput {
            response: result.response,
            updated_object: result.updated_object,
        }
    }

    /// Advance the transfer timeout
    ///
    /// Returns the abort to send if the transfer timed out.
    pub fn tick(&mut self, elapsed_ms: u32) -> Option<SdoResponse> {
        self.timer.elapse(elapsed_ms);
        if !self.timer.expired() {
            return None;
        }
        let (index, sub) = self.state.object().unwrap_or((0, 0));
        warn!("SDO transfer of 0x{:x}sub{} timed out", index, sub);
        self.reset();
        Some(SdoResponse::abort(index, sub, AbortCode::GeneralError))
    }

    fn dispatch(&mut self, od: &ObjectDictionary, state: SdoState, req: SdoRequest) -> SdoResult {
        let result = match (state, req) {
            (_, SdoRequest::Abort { abort_code, .. }) => {
                if !matches!(state, SdoState::Idle) {
                    debug!("Client aborted SDO transfer: 0x{:x}", abort_code);
                }
                return SdoResult::no_response(SdoState::Idle);
            }
            (SdoState::Idle, req) => return self.idle(od, req),
            (SdoState::SegmentedDownload(s), SdoRequest::DownloadSegment { t, n, c, data }) => {
                self.download_segment(od, s, t, n, c, &data)
            }
            (SdoState::SegmentedUpload(s), SdoRequest::ReqUploadSegment { t }) => {
                self.upload_segment(s, t)
            }
            (SdoState::BlockDownloadEnd(s), SdoRequest::EndBlockDownload { n, crc }) => {
                self.end_block_download(od, s, n, crc)
            }
            (SdoState::BlockUploadStart(s), SdoRequest::StartBlockUpload) => Ok(SdoResult::burst(
                Burst {
                    start: s.block_start,
                    blksize: s.blksize,
                    len: s.len,
                },
                SdoState::BlockUploadWaitAck(s),
            )),
            (SdoState::BlockUploadWaitAck(s), SdoRequest::ConfirmBlock { ackseq, blksize }) => {
                self.confirm_upload_block(s, ackseq, blksize)
            }
            (SdoState::BlockUploadEnd { .. }, SdoRequest::EndBlockUpload) => {
                Ok(SdoResult::no_response(SdoState::Idle))
            }
            _ => Err(AbortCode::InvalidCommandSpecifier),
        };
        let (index, sub) = state.object().unwrap_or((0, 0));
        result_or_abort(index, sub, result)
    }

    fn idle(&mut self, od: &ObjectDictionary, req: SdoRequest) -> SdoResult {
        match req {
            SdoRequest::InitiateDownload {
                n,
                e,
                s,
                index,
                sub,
                data,
            } => result_or_abort(index, sub, self.initiate_download(od, n, e, s, index, sub, data)),
            SdoRequest::InitiateUpload { index, sub } => {
                result_or_abort(index, sub, self.initiate_upload(od, index, sub))
            }
            SdoRequest::InitiateBlockDownload {
                cc,
                s,
                index,
                sub,
                size,
            } => result_or_abort(
                index,
                sub,
                self.initiate_block_download(od, cc, s.then_some(size as usize), index, sub),
            ),
            SdoRequest::InitiateBlockUpload {
                cc: _,
                index,
                sub,
                blksize,
                pst,
            } => result_or_abort(
                index,
                sub,
                self.initiate_block_upload(od, index, sub, blksize, pst),
            ),
            _ => SdoResult::abort(0, 0, AbortCode::InvalidCommandSpecifier),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn initiate_download(
        &mut self,
        od: &ObjectDictionary,
        n: u8,
        e: bool,
        s: bool,
        index: u16,
        sub: u8,
        data: [u8; 4],
    ) -> Result<SdoResult, AbortCode> {
        let entry = od.resolve(index, sub)?;
        if e {
            // Strings may only be written with a segmented or block download
            if entry.is_string() {
                return Err(AbortCode::UnsupportedAccess);
            }
            let len = if s {
                4 - n.min(3) as usize
            } else {
                entry.width().min(4)
            };
            entry.write(&data[..len])?;
            Ok(SdoResult::response_with_update(
                SdoResponse::download_acknowledge(index, sub),
                index,
                sub,
                SdoState::Idle,
            ))
        } else {
            if !entry.is_string() {
                return Err(AbortCode::UnsupportedAccess);
            }
            if !entry.access.is_writable() {
                return Err(AbortCode::ReadOnly);
            }
            let size = s.then_some(u32::from_le_bytes(data) as usize);
            if let Some(size) = size {
                validate_download_size(size, entry.capacity())?;
            }
            Ok(SdoResult::response(
                SdoResponse::download_acknowledge(index, sub),
                SdoState::SegmentedDownload(SegmentedDownload {
                    index,
                    sub,
                    toggle: false,
                    cursor: 0,
                    size,
                }),
            ))
        }
    }

    fn download_segment(
        &mut self,
        od: &ObjectDictionary,
        state: SegmentedDownload,
        t: bool,
        n: u8,
        c: bool,
        data: &[u8; 7],
    ) -> Result<SdoResult, AbortCode> {
        if t != state.toggle {
            return Err(AbortCode::ToggleNotAlternated);
        }
        let len = 7 - n.min(7) as usize;
        let end = state.cursor + len;
        if end > SDO_BUFFER_SIZE {
            return Err(AbortCode::OutOfMemory);
        }
        self.buffer[state.cursor..end].copy_from_slice(&data[..len]);

        if !c {
            return Ok(SdoResult::response(
                SdoResponse::download_segment_acknowledge(t),
                SdoState::SegmentedDownload(SegmentedDownload {
                    toggle: !t,
                    cursor: end,
                    ..state
                }),
            ));
        }

        if state.size.is_some_and(|size| size != end) {
            return Err(AbortCode::DataTypeMismatch);
        }
        self.commit(od, state.index, state.sub, end)?;
        Ok(SdoResult::response_with_update(
            SdoResponse::download_segment_acknowledge(t),
            state.index,
            state.sub,
            SdoState::Idle,
        ))
    }

    /// Write the first `len` bytes of the buffer to an object
    fn commit(
        &self,
        od: &ObjectDictionary,
        index: u16,
        sub: u8,
        len: usize,
    ) -> Result<(), AbortCode> {
        let entry = od.resolve(index, sub)?;
        if len > entry.capacity() {
            return Err(AbortCode::DataTypeMismatchLengthHigh);
        }
        entry.write(&self.buffer[..len])
    }

    /// Copy a string object into the buffer, returning its length
    fn snapshot(&mut self, od: &ObjectDictionary, index: u16, sub: u8) -> Result<usize, AbortCode> {
        let entry = od.resolve(index, sub)?;
        if !entry.access.is_readable() {
            return Err(AbortCode::WriteOnly);
        }
        if entry.width() > SDO_BUFFER_SIZE {
            return Err(AbortCode::OutOfMemory);
        }
        entry.read(&mut self.buffer)
    }

    fn initiate_upload(
        &mut self,
        od: &ObjectDictionary,
        index: u16,
        sub: u8,
    ) -> Result<SdoResult, AbortCode> {
        let entry = od.resolve(index, sub)?;
        if entry.is_string() {
            let len = self.snapshot(od, index, sub)?;
            Ok(SdoResult::response(
                SdoResponse::upload_acknowledge(index, sub, len as u32),
                SdoState::SegmentedUpload(SegmentedUpload {
                    index,
                    sub,
                    toggle: false,
                    cursor: 0,
                    len,
                }),
            ))
        } else {
            let mut buf = [0; 4];
            let len = entry.read(&mut buf)?;
            Ok(SdoResult::response(
                SdoResponse::expedited_upload(index, sub, &buf[..len]),
                SdoState::Idle,
            ))
        }
    }

    fn upload_segment(&mut self, state: SegmentedUpload, t: bool) -> Result<SdoResult, AbortCode> {
        if t != state.toggle {
            return Err(AbortCode::ToggleNotAlternated);
        }
        let end = (state.cursor + 7).min(state.len);
        let c = end == state.len;
        let response = SdoResponse::upload_segment(t, c, &self.buffer[state.cursor..end]);
        let new_state = if c {
            SdoState::Idle
        } else {
            SdoState::SegmentedUpload(SegmentedUpload {
                toggle: !t,
                cursor: end,
                ..state
            })
        };
        Ok(SdoResult::response(response, new_state))
    }

    fn initiate_block_download(
        &mut self,
        od: &ObjectDictionary,
        client_supports_crc: bool,
        size: Option<usize>,
        index: u16,
        sub: u8,
    ) -> Result<SdoResult, AbortCode> {
        let entry = od.resolve(index, sub)?;
        if !entry.is_string() {
            return Err(AbortCode::UnsupportedAccess);
        }
        if !entry.access.is_writable() {
            return Err(AbortCode::ReadOnly);
        }
        if let Some(size) = size {
            validate_download_size(size, entry.capacity())?;
        }
        Ok(SdoResult::response(
            SdoResponse::block_download_acknowledge(index, sub, BLKSIZE),
            SdoState::BlockDownload(BlockDownload {
                index,
                sub,
                client_supports_crc,
                size,
                committed: 0,
                next_seq: 1,
            }),
        ))
    }

    fn block_segment(&mut self, state: BlockDownload, data: &[u8]) -> SdoResult {
        let segment = match BlockSegment::try_from(data) {
            Ok(segment) => segment,
            Err(abort_code) => return SdoResult::abort(state.index, state.sub, abort_code),
        };

        if segment.seqnum != 0 && segment.seqnum == state.next_seq {
            let start = state.committed + (segment.seqnum as usize - 1) * 7;
            let end = start + 7;
            if end > SDO_BUFFER_SIZE {
                return SdoResult::abort(state.index, state.sub, AbortCode::OutOfMemory);
            }
            self.buffer[start..end].copy_from_slice(&segment.data);

            let ack = SdoResponse::ConfirmBlock {
                ackseq: segment.seqnum,
                blksize: BLKSIZE,
            };
            if segment.c {
                SdoResult::response(
                    ack,
                    SdoState::BlockDownloadEnd(BlockDownload {
                        committed: end,
                        ..state
                    }),
                )
            } else if segment.seqnum == BLKSIZE {
                SdoResult::response(
                    ack,
                    SdoState::BlockDownload(BlockDownload {
                        committed: end,
                        next_seq: 1,
                        ..state
                    }),
                )
            } else {
                SdoResult::no_response(SdoState::BlockDownload(BlockDownload {
                    next_seq: state.next_seq + 1,
                    ..state
                }))
            }
        } else if segment.c || segment.seqnum == BLKSIZE {
            // A segment went missing. Acknowledging the last one received in order makes the
            // client resend the rest, starting a new block.
            let ackseq = state.next_seq - 1;
            debug!("Block download missed segment {}", state.next_seq);
            SdoResult::response(
                SdoResponse::ConfirmBlock {
                    ackseq,
                    blksize: BLKSIZE,
                },
                SdoState::BlockDownload(BlockDownload {
                    committed: state.committed + ackseq as usize * 7,
                    next_seq: 1,
                    ..state
                }),
            )
        } else {
            SdoResult::no_response(SdoState::BlockDownload(state))
        }
    }

    fn end_block_download(
        &mut self,
        od: &ObjectDictionary,
        state: BlockDownload,
        n: u8,
        crc: u16,
    ) -> Result<SdoResult, AbortCode> {
        let len = state.committed.saturating_sub(n as usize);
        if state.size.is_some_and(|size| size != len) {
            return Err(AbortCode::DataTypeMismatch);
        }
        if state.client_supports_crc && State::<XMODEM>::calculate(&self.buffer[..len]) != crc {
            return Err(AbortCode::CrcError);
        }
        self.commit(od, state.index, state.sub, len)?;
        Ok(SdoResult::response_with_update(
            SdoResponse::ConfirmBlockDownloadEnd,
            state.index,
            state.sub,
            SdoState::Idle,
        ))
    }

    fn initiate_block_upload(
        &mut self,
        od: &ObjectDictionary,
        index: u16,
        sub: u8,
        blksize: u8,
        pst: u8,
    ) -> Result<SdoResult, AbortCode> {
        let entry = od.resolve(index, sub)?;
        if !entry.is_string() || (pst != 0 && entry.width() <= pst as usize) {
            debug!("Switching block upload of 0x{:x}sub{} to normal upload", index, sub);
            return self.initiate_upload(od, index, sub);
        }
        if blksize == 0 || blksize > MAX_BLOCK_SIZE {
            return Err(AbortCode::InvalidBlockSize);
        }
        let len = self.snapshot(od, index, sub)?;
        Ok(SdoResult::response(
            SdoResponse::block_upload_acknowledge(index, sub, len as u32),
            SdoState::BlockUploadStart(BlockUpload {
                index,
                sub,
                len,
                blksize,
                block_start: 0,
            }),
        ))
    }

    fn confirm_upload_block(
        &mut self,
        state: BlockUpload,
        ackseq: u8,
        blksize: u8,
    ) -> Result<SdoResult, AbortCode> {
        let segments = state.segments_in_block();
        if ackseq as usize > segments {
            return Err(AbortCode::InvalidSequenceNumber);
        }
        let block_end = state.block_start + segments * 7;
        if ackseq as usize == segments && block_end >= state.len {
            let n = (block_end - state.len) as u8;
            let crc = State::<XMODEM>::calculate(&self.buffer[..state.len]);
            return Ok(SdoResult::response(
                SdoResponse::BlockUploadEnd { n, crc },
                SdoState::BlockUploadEnd {
                    index: state.index,
                    sub: state.sub,
                },
            ));
        }
        if blksize == 0 || blksize > MAX_BLOCK_SIZE {
            return Err(AbortCode::InvalidBlockSize);
        }
        let next = BlockUpload {
            block_start: state.block_start + ackseq as usize * 7,
            blksize,
            ..state
        };
        Ok(SdoResult::burst(
            Burst {
                start: next.block_start,
                blksize,
                len: next.len,
            },
            SdoState::BlockUploadWaitAck(next),
        ))
    }

    fn send_burst(&self, burst: Burst, send_segment: &mut impl FnMut(BlockSegment)) {
        let mut offset = burst.start;
        for seqnum in 1..=burst.blksize {
            let end = (offset + 7).min(burst.len);
            let last = end == burst.len;
            send_segment(BlockSegment::new(seqnum, last, &self.buffer[offset..end]));
            offset = end;
            if last {
                break;
            }
        }
    }
}

fn result_or_abort(index: u16, sub: u8, result: Result<SdoResult, AbortCode>) -> SdoResult {
    result.unwrap_or_else(|abort_code| SdoResult::abort(index, sub, abort_code))
}
