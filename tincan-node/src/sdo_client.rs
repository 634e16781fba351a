//! SDO client
//!
//! The client runs one transfer at a time against a remote SDO server. A transfer is started by
//! one of the `start_*` methods, which queue the first request frame, and is then driven by the
//! responses passed to [`SdoClient::handle_message`] and the elapsed time passed to
//! [`SdoClient::tick`].
//!
//! A transfer either belongs to a waiting caller, which collects the result with
//! [`SdoClient::poll_result`], or is detached, in which case the result is only logged.

use core::task::{Context, Poll, Waker};

use crc16::{State, XMODEM};
use defmt_or_log::{debug, info, warn};
use snafu::Snafu;
use tincan_common::{
    messages::{SDO_REQ_BASE, SDO_RESP_BASE},
    sdo::{AbortCode, BlockSegment, RawAbortCode, SdoRequest, SdoResponse, MAX_BLOCK_SIZE},
    CanId, CanMessage,
};

use crate::{delay::Delay, sdo_server::SDO_BUFFER_SIZE};

/// Byte 0 of an abort frame, which cannot be a block segment
const ABORT_CMD: u8 = 0x80;

/// Errors returned by SDO client transfers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Snafu)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SdoClientError {
    /// Another transfer is using the client
    #[snafu(display("Another SDO transfer is in progress"))]
    HardwareBusy,
    /// The server did not answer before the timeout
    #[snafu(display("Node {node_id} did not respond"))]
    NotResponding {
        /// The server node
        node_id: u8,
    },
    /// The server aborted the transfer
    #[snafu(display("Transfer of 0x{index:x}sub{sub} aborted: {abort_code}"))]
    Aborted {
        /// Object index
        index: u16,
        /// Object sub index
        sub: u8,
        /// The code sent by the server
        abort_code: RawAbortCode,
    },
    /// The data to write does not fit the transfer buffer
    #[snafu(display("Cannot transfer {len} bytes, the limit is {SDO_BUFFER_SIZE}"))]
    TransferTooLarge {
        /// Length of the data
        len: usize,
    },
    /// The server sent more data than the read buffer can hold
    #[snafu(display("Received data does not fit the read buffer"))]
    BufferTooSmall,
    /// A segment arrived with the wrong toggle bit
    #[snafu(display("Toggle bit not alternated"))]
    ToggleNotAlternated,
    /// The server sent a response which does not fit the transfer
    #[snafu(display("Unexpected SDO response"))]
    UnexpectedResponse,
    /// The amount of data received differs from the size the server announced
    #[snafu(display("Received data does not match the announced size"))]
    UnexpectedSize,
    /// The CRC of a block transfer did not match
    #[snafu(display("Block transfer CRC mismatch"))]
    CrcMismatch,
    /// The node restarted during the transfer
    #[snafu(display("Node restarted during the transfer"))]
    NodeReset,
    /// The server node ID is not in 1..=127
    #[snafu(display("Invalid server node ID {node_id}"))]
    InvalidNodeId {
        /// The invalid ID
        node_id: u8,
    },
}

/// Where a transfer is waiting
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ClientPhase {
    /// Waiting for the acknowledgement of an expedited download
    ExpeditedDownload,
    /// Waiting for the acknowledgement of a segmented download initiate
    SegmentedDownload,
    /// Waiting for the acknowledgement of a download segment
    SegmentedDownloadWaitReply,
    /// Waiting for the reply to an upload initiate of at most 4 bytes
    ExpeditedUpload,
    /// Waiting for the reply to an upload initiate
    SegmentedUpload,
    /// Waiting for an upload segment
    SegmentedUploadWaitReply,
    /// Waiting for the acknowledgement of a block download initiate
    BlockDownload,
    /// Waiting for the acknowledgement of a block of segments
    BlockDownloadWaitAck,
    /// Waiting for the acknowledgement of the end of a block download
    BlockDownloadEnd,
    /// Waiting for the reply to a block upload initiate
    BlockUpload,
    /// Receiving block upload segments
    BlockUploadReceive,
    /// Waiting for the end of a block upload
    BlockUploadEnd,
}

impl ClientPhase {
    /// Waiting for the reply to an initiate request, which always names the object
    fn is_initiate(&self) -> bool {
        matches!(
            self,
            ClientPhase::ExpeditedDownload
                | ClientPhase::SegmentedDownload
                | ClientPhase::ExpeditedUpload
                | ClientPhase::SegmentedUpload
                | ClientPhase::BlockDownload
                | ClientPhase::BlockUpload
        )
    }
}

#[derive(Clone, Copy, Debug)]
struct ClientTransfer {
    phase: ClientPhase,
    server: u8,
    index: u16,
    sub: u8,
    toggle: bool,
    /// Bytes sent or received
    cursor: usize,
    /// Bytes to send, or the size announced by the server
    total: Option<usize>,
    /// Most bytes a read may return
    max_len: usize,
    block_start: usize,
    blksize: u8,
    /// Last sequence number sent or received in the current block
    seq: u8,
    crc: bool,
    timer: Delay,
    timeout_ms: u32,
    detached: bool,
}

impl ClientTransfer {
    fn request_id(&self) -> CanId {
        CanId::std(SDO_REQ_BASE + self.server as u16)
    }

    fn response_id(&self) -> CanId {
        CanId::std(SDO_RESP_BASE + self.server as u16)
    }

    fn send(&self, request: SdoRequest, send: &mut impl FnMut(CanMessage)) {
        send(request.to_can_message(self.request_id()));
    }
}

/// The multiplexer of the responses which carry one
fn response_object(resp: &SdoResponse) -> Option<(u16, u8)> {
    match *resp {
        SdoResponse::ConfirmUpload { index, sub, .. }
        | SdoResponse::ConfirmDownload { index, sub }
        | SdoResponse::ConfirmBlockDownload { index, sub, .. }
        | SdoResponse::ConfirmBlockUpload { index, sub, .. }
        | SdoResponse::Abort { index, sub, .. } => Some((index, sub)),
        _ => None,
    }
}

/// An SDO client with a single transfer slot
pub struct SdoClient {
    transfer: Option<ClientTransfer>,
    buffer: [u8; SDO_BUFFER_SIZE],
    completed: Option<Result<usize, SdoClientError>>,
    waker: Option<Waker>,
}

impl core::fmt::Debug for SdoClient {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SdoClient")
            .field("transfer", &self.transfer)
            .field("completed", &self.completed)
            .finish()
    }
}

impl Default for SdoClient {
    fn default() -> Self {
        Self::new()
    }
}

impl SdoClient {
    /// Create an idle client
    pub const fn new() -> Self {
        Self {
            transfer: None,
            buffer: [0; SDO_BUFFER_SIZE],
            completed: None,
            waker: None,
        }
    }

    /// Returns true while a transfer runs, or its result has not been collected
    pub fn is_busy(&self) -> bool {
        self.transfer.is_some() || self.completed.is_some()
    }

    /// The phase of the running transfer
    pub fn phase(&self) -> Option<ClientPhase> {
        self.transfer.map(|t| t.phase)
    }

    fn begin(
        &mut self,
        server: u8,
        index: u16,
        sub: u8,
        phase: ClientPhase,
        timeout_ms: u32,
        detached: bool,
    ) -> Result<ClientTransfer, SdoClientError> {
        if self.is_busy() {
            return HardwareBusySnafu.fail();
        }
        if server == 0 || server > 127 {
            return InvalidNodeIdSnafu { node_id: server }.fail();
        }
        let mut timer = Delay::Idle;
        timer.set(timeout_ms);
        Ok(ClientTransfer {
            phase,
            server,
            index,
            sub,
            toggle: false,
            cursor: 0,
            total: None,
            max_len: SDO_BUFFER_SIZE,
            block_start: 0,
            blksize: MAX_BLOCK_SIZE,
            seq: 0,
            crc: false,
            timer,
            timeout_ms,
            detached,
        })
    }

    fn load_buffer(&mut self, data: &[u8]) -> Result<(), SdoClientError> {
        if data.len() > SDO_BUFFER_SIZE {
            return TransferTooLargeSnafu { len: data.len() }.fail();
        }
        self.buffer[..data.len()].copy_from_slice(data);
        Ok(())
    }

    /// Start writing `data` to an object on `server`
    ///
    /// Up to 4 bytes are sent expedited, longer data segmented. A detached transfer reports its
    /// result only to the log.
    #[allow(clippy::too_many_arguments)]
    pub fn start_download(
        &mut self,
        server: u8,
        index: u16,
        sub: u8,
        data: &[u8],
        timeout_ms: u32,
        detached: bool,
        send: &mut impl FnMut(CanMessage),
    ) -> Result<(), SdoClientError> {
        let expedited = data.len() <= 4;
        let phase = if expedited {
            ClientPhase::ExpeditedDownload
        } else {
            ClientPhase::SegmentedDownload
        };
        let mut transfer = self.begin(server, index, sub, phase, timeout_ms, detached)?;
        self.load_buffer(data)?;
        transfer.total = Some(data.len());
        if expedited {
            transfer.send(SdoRequest::expedited_download(index, sub, data), send);
        } else {
            transfer.send(
                SdoRequest::initiate_download(index, sub, Some(data.len() as u32)),
                send,
            );
        }
        self.transfer = Some(transfer);
        Ok(())
    }

    /// Start reading an object from `server`
    ///
    /// The transfer fails with [`SdoClientError::BufferTooSmall`] if the server sends more than
    /// `max_len` bytes.
    pub fn start_upload(
        &mut self,
        server: u8,
        index: u16,
        sub: u8,
        max_len: usize,
        timeout_ms: u32,
        send: &mut impl FnMut(CanMessage),
    ) -> Result<(), SdoClientError> {
        let phase = if max_len <= 4 {
            ClientPhase::ExpeditedUpload
        } else {
            ClientPhase::SegmentedUpload
        };
        let mut transfer = self.begin(server, index, sub, phase, timeout_ms, false)?;
        transfer.max_len = max_len.min(SDO_BUFFER_SIZE);
        transfer.send(SdoRequest::initiate_upload(index, sub), send);
        self.transfer = Some(transfer);
        Ok(())
    }

    /// Start writing `data` with a block download
    pub fn start_block_download(
        &mut self,
        server: u8,
        index: u16,
        sub: u8,
        data: &[u8],
        timeout_ms: u32,
        send: &mut impl FnMut(CanMessage),
    ) -> Result<(), SdoClientError> {
        let mut transfer = self.begin(
            server,
            index,
            sub,
            ClientPhase::BlockDownload,
            timeout_ms,
            false,
        )?;
        self.load_buffer(data)?;
        transfer.total = Some(data.len());
        transfer.send(
            SdoRequest::initiate_block_download(index, sub, data.len() as u32),
            send,
        );
        self.transfer = Some(transfer);
        Ok(())
    }

    /// Start reading an object with a block upload
    ///
    /// The server may answer with a normal upload instead, which is handled transparently.
    pub fn start_block_upload(
        &mut self,
        server: u8,
        index: u16,
        sub: u8,
        max_len: usize,
        timeout_ms: u32,
        send: &mut impl FnMut(CanMessage),
    ) -> Result<(), SdoClientError> {
        let mut transfer = self.begin(
            server,
            index,
            sub,
            ClientPhase::BlockUpload,
            timeout_ms,
            false,
        )?;
        transfer.max_len = max_len.min(SDO_BUFFER_SIZE);
        transfer.send(
            SdoRequest::initiate_block_upload(index, sub, MAX_BLOCK_SIZE, 0),
            send,
        );
        self.transfer = Some(transfer);
        Ok(())
    }

    /// Collect the result of a transfer
    ///
    /// On success this is the number of bytes transferred; for reads the data is available from
    /// [`SdoClient::data`]. Returns `Pending` and registers the waker while the transfer runs.
    pub fn poll_result(&mut self, cx: &mut Context<'_>) -> Poll<Result<usize, SdoClientError>> {
        if let Some(result) = self.completed.take() {
            return Poll::Ready(result);
        }
        if self.transfer.is_none() {
            // Released by a restart
            return Poll::Ready(Err(SdoClientError::NodeReset));
        }
        self.waker = Some(cx.waker().clone());
        Poll::Pending
    }

    /// Collect the result of a transfer, if it has completed
    pub fn take_result(&mut self) -> Option<Result<usize, SdoClientError>> {
        self.completed.take()
    }

    /// The first `len` bytes received by the last read
    pub fn data(&self, len: usize) -> &[u8] {
        &self.buffer[..len.min(SDO_BUFFER_SIZE)]
    }

    /// Give up the transfer owned by a waiting caller
    ///
    /// A transfer still running is aborted. Detached transfers are not affected.
    pub fn release(&mut self, send: &mut impl FnMut(CanMessage)) {
        if let Some(transfer) = self.transfer {
            if transfer.detached {
                return;
            }
            debug!("Releasing SDO transfer of 0x{:x}sub{}", transfer.index, transfer.sub);
            transfer.send(
                SdoRequest::abort(transfer.index, transfer.sub, AbortCode::GeneralError),
                send,
            );
            self.transfer = None;
        }
        self.completed = None;
        self.waker = None;
    }

    /// Drop the transfer because the node is restarting
    pub fn reset(&mut self) {
        if self.transfer.is_some_and(|t| !t.detached) {
            self.finish(Err(SdoClientError::NodeReset));
        }
        self.transfer = None;
    }

    /// Advance the transfer timeout
    pub fn tick(&mut self, elapsed_ms: u32, send: &mut impl FnMut(CanMessage)) {
        let Some(transfer) = self.transfer.as_mut() else {
            return;
        };
        transfer.timer.elapse(elapsed_ms);
        if transfer.timer.expired() {
            let node_id = transfer.server;
            warn!("SDO server {} did not respond", node_id);
            self.fail(
                AbortCode::SdoTimeout,
                SdoClientError::NotResponding { node_id },
                send,
            );
        }
    }

    /// Process a received frame
    ///
    /// Frames which are not a response from the server of the running transfer, or which name a
    /// different object, are ignored.
    pub fn handle_message(&mut self, msg: &CanMessage, send: &mut impl FnMut(CanMessage)) {
        let Some(mut transfer) = self.transfer else {
            return;
        };
        if msg.id() != transfer.response_id() {
            return;
        }
        let data = msg.data();

        if transfer.phase == ClientPhase::BlockUploadReceive && data.first() != Some(&ABORT_CMD) {
            match BlockSegment::try_from(data) {
                Ok(segment) => {
                    transfer.timer.set(transfer.timeout_ms);
                    self.block_upload_segment(transfer, segment, send);
                }
                Err(_) => self.fail(
                    AbortCode::InvalidCommandSpecifier,
                    SdoClientError::UnexpectedResponse,
                    send,
                ),
            }
            return;
        }

        let Ok(resp) = SdoResponse::try_from(data) else {
            debug!("Ignoring malformed SDO response");
            return;
        };
        match response_object(&resp) {
            Some(obj) if obj != (transfer.index, transfer.sub) => return,
            None if transfer.phase.is_initiate() => {
                // Left over from an earlier transfer to the same server
                debug!("Ignoring stale SDO segment response from {}", transfer.server);
                return;
            }
            _ => {}
        }
        transfer.timer.set(transfer.timeout_ms);
        self.handle_response(transfer, resp, send);
    }

    fn handle_response(
        &mut self,
        mut t: ClientTransfer,
        resp: SdoResponse,
        send: &mut impl FnMut(CanMessage),
    ) {
        match (t.phase, resp) {
            (_, SdoResponse::Abort { abort_code, .. }) => {
                let abort_code = RawAbortCode::from(abort_code);
                warn!(
                    "SDO server {} aborted transfer of 0x{:x}sub{}: {}",
                    t.server, t.index, t.sub, abort_code
                );
                self.finish(Err(SdoClientError::Aborted {
                    index: t.index,
                    sub: t.sub,
                    abort_code,
                }));
            }
            (ClientPhase::ExpeditedDownload, SdoResponse::ConfirmDownload { .. }) => {
                self.finish(Ok(t.total.unwrap_or(0)));
            }
            (ClientPhase::SegmentedDownload, SdoResponse::ConfirmDownload { .. }) => {
                self.send_download_segment(t, send);
            }
            (
                ClientPhase::SegmentedDownloadWaitReply,
                SdoResponse::ConfirmDownloadSegment { t: toggle },
            ) => {
                if toggle != t.toggle {
                    return self.fail(
                        AbortCode::ToggleNotAlternated,
                        SdoClientError::ToggleNotAlternated,
                        send,
                    );
                }
                let total = t.total.unwrap_or(0);
                if t.cursor >= total {
                    self.finish(Ok(total));
                } else {
                    t.toggle = !t.toggle;
                    self.send_download_segment(t, send);
                }
            }
            (
                ClientPhase::ExpeditedUpload | ClientPhase::SegmentedUpload | ClientPhase::BlockUpload,
                SdoResponse::ConfirmUpload { n, e, s, data, .. },
            ) => {
                if e {
                    if t.phase != ClientPhase::ExpeditedUpload {
                        debug!(
                            "Server {} answered the upload of 0x{:x}sub{} expedited",
                            t.server, t.index, t.sub
                        );
                    }
                    let len = if s { 4 - n.min(3) as usize } else { 4 };
                    if len > t.max_len {
                        return self.fail(
                            AbortCode::OutOfMemory,
                            SdoClientError::BufferTooSmall,
                            send,
                        );
                    }
                    self.buffer[..len].copy_from_slice(&data[..len]);
                    self.finish(Ok(len));
                } else {
                    if s {
                        let size = u32::from_le_bytes(data) as usize;
                        if size > t.max_len {
                            return self.fail(
                                AbortCode::OutOfMemory,
                                SdoClientError::BufferTooSmall,
                                send,
                            );
                        }
                        t.total = Some(size);
                    }
                    t.phase = ClientPhase::SegmentedUploadWaitReply;
                    t.send(SdoRequest::upload_segment_request(t.toggle), send);
                    self.transfer = Some(t);
                }
            }
            (
                ClientPhase::SegmentedUploadWaitReply,
                SdoResponse::UploadSegment {
                    t: toggle,
                    n,
                    c,
                    data,
                },
            ) => {
                if toggle != t.toggle {
                    return self.fail(
                        AbortCode::ToggleNotAlternated,
                        SdoClientError::ToggleNotAlternated,
                        send,
                    );
                }
                let len = 7 - n.min(7) as usize;
                let end = t.cursor + len;
                if end > t.max_len {
                    return self.fail(
                        AbortCode::OutOfMemory,
                        SdoClientError::BufferTooSmall,
                        send,
                    );
                }
                self.buffer[t.cursor..end].copy_from_slice(&data[..len]);
                t.cursor = end;
                if c {
                    if t.total.is_some_and(|size| size != end) {
                        return self.fail(
                            AbortCode::DataTypeMismatch,
                            SdoClientError::UnexpectedSize,
                            send,
                        );
                    }
                    self.finish(Ok(end));
                } else {
                    t.toggle = !t.toggle;
                    t.send(SdoRequest::upload_segment_request(t.toggle), send);
                    self.transfer = Some(t);
                }
            }
            (
                ClientPhase::BlockDownload,
                SdoResponse::ConfirmBlockDownload { sc, blksize, .. },
            ) => {
                if blksize == 0 || blksize > MAX_BLOCK_SIZE {
                    return self.fail(
                        AbortCode::InvalidBlockSize,
                        SdoClientError::UnexpectedResponse,
                        send,
                    );
                }
                t.crc = sc;
                t.blksize = blksize;
                self.send_block(t, send);
            }
            (ClientPhase::BlockDownloadWaitAck, SdoResponse::ConfirmBlock { ackseq, blksize }) => {
                if ackseq > t.seq {
                    return self.fail(
                        AbortCode::InvalidSequenceNumber,
                        SdoClientError::UnexpectedResponse,
                        send,
                    );
                }
                let total = t.total.unwrap_or(0);
                if ackseq == t.seq && t.cursor >= total {
                    let n = (t.block_start + t.seq as usize * 7).saturating_sub(total);
                    let crc = if t.crc {
                        State::<XMODEM>::calculate(&self.buffer[..total])
                    } else {
                        0
                    };
                    t.phase = ClientPhase::BlockDownloadEnd;
                    t.send(SdoRequest::end_block_download(n as u8, crc), send);
                    self.transfer = Some(t);
                    return;
                }
                if blksize == 0 || blksize > MAX_BLOCK_SIZE {
                    return self.fail(
                        AbortCode::InvalidBlockSize,
                        SdoClientError::UnexpectedResponse,
                        send,
                    );
                }
                if ackseq < t.seq {
                    debug!("Server acknowledged {} of {} segments", ackseq, t.seq);
                }
                t.block_start += ackseq as usize * 7;
                t.blksize = blksize;
                self.send_block(t, send);
            }
            (ClientPhase::BlockDownloadEnd, SdoResponse::ConfirmBlockDownloadEnd) => {
                self.finish(Ok(t.total.unwrap_or(0)));
            }
            (ClientPhase::BlockUpload, SdoResponse::ConfirmBlockUpload { sc, s, size, .. }) => {
                if s {
                    if size as usize > t.max_len {
                        return self.fail(
                            AbortCode::OutOfMemory,
                            SdoClientError::BufferTooSmall,
                            send,
                        );
                    }
                    t.total = Some(size as usize);
                }
                t.crc = sc;
                t.phase = ClientPhase::BlockUploadReceive;
                t.send(SdoRequest::StartBlockUpload, send);
                self.transfer = Some(t);
            }
            (ClientPhase::BlockUploadEnd, SdoResponse::BlockUploadEnd { n, crc }) => {
                let len = t.cursor.saturating_sub(n as usize);
                if len > t.max_len {
                    return self.fail(
                        AbortCode::OutOfMemory,
                        SdoClientError::BufferTooSmall,
                        send,
                    );
                }
                if t.total.is_some_and(|size| size != len) {
                    return self.fail(
                        AbortCode::DataTypeMismatch,
                        SdoClientError::UnexpectedSize,
                        send,
                    );
                }
                if t.crc && State::<XMODEM>::calculate(&self.buffer[..len]) != crc {
                    return self.fail(AbortCode::CrcError, SdoClientError::CrcMismatch, send);
                }
                t.send(SdoRequest::EndBlockUpload, send);
                self.finish(Ok(len));
            }
            _ => self.fail(
                AbortCode::InvalidCommandSpecifier,
                SdoClientError::UnexpectedResponse,
                send,
            ),
        }
    }

    fn send_download_segment(&mut self, mut t: ClientTransfer, send: &mut impl FnMut(CanMessage)) {
        let total = t.total.unwrap_or(0);
        let end = (t.cursor + 7).min(total);
        let last = end == total;
        t.send(
            SdoRequest::download_segment(t.toggle, last, &self.buffer[t.cursor..end]),
            send,
        );
        t.cursor = end;
        t.phase = ClientPhase::SegmentedDownloadWaitReply;
        self.transfer = Some(t);
    }

    /// Send one block of segments starting at `block_start`
    fn send_block(&mut self, mut t: ClientTransfer, send: &mut impl FnMut(CanMessage)) {
        let total = t.total.unwrap_or(0);
        let mut offset = t.block_start;
        t.seq = 0;
        for seqnum in 1..=t.blksize {
            let end = (offset + 7).min(total);
            let last = end == total;
            send(BlockSegment::new(seqnum, last, &self.buffer[offset..end]).to_can_message(t.request_id()));
            t.seq = seqnum;
            offset = end;
            if last {
                break;
            }
        }
        t.cursor = offset;
        t.phase = ClientPhase::BlockDownloadWaitAck;
        self.transfer = Some(t);
    }

    fn block_upload_segment(
        &mut self,
        mut t: ClientTransfer,
        segment: BlockSegment,
        send: &mut impl FnMut(CanMessage),
    ) {
        let in_order = segment.seqnum != 0 && segment.seqnum == t.seq + 1;
        if in_order {
            let start = t.block_start + (segment.seqnum as usize - 1) * 7;
            let end = start + 7;
            if end > SDO_BUFFER_SIZE {
                return self.fail(
                    AbortCode::OutOfMemory,
                    SdoClientError::BufferTooSmall,
                    send,
                );
            }
            self.buffer[start..end].copy_from_slice(&segment.data);
            t.seq = segment.seqnum;
        }

        if segment.c && in_order {
            t.send(
                SdoRequest::ConfirmBlock {
                    ackseq: t.seq,
                    blksize: t.blksize,
                },
                send,
            );
            t.cursor = t.block_start + t.seq as usize * 7;
            t.phase = ClientPhase::BlockUploadEnd;
        } else if segment.c || segment.seqnum >= t.blksize {
            // End of a block, possibly with segments missing. The server resends whatever follows
            // the acknowledged sequence number.
            t.send(
                SdoRequest::ConfirmBlock {
                    ackseq: t.seq,
                    blksize: t.blksize,
                },
                send,
            );
            t.block_start += t.seq as usize * 7;
            t.seq = 0;
        }
        self.transfer = Some(t);
    }

    /// Abort the transfer on the server and complete it with `error`
    fn fail(
        &mut self,
        abort_code: AbortCode,
        error: SdoClientError,
        send: &mut impl FnMut(CanMessage),
    ) {
        if let Some(transfer) = self.transfer {
            transfer.send(
                SdoRequest::abort(transfer.index, transfer.sub, abort_code),
                send,
            );
        }
        self.finish(Err(error));
    }

    fn finish(&mut self, result: Result<usize, SdoClientError>) {
        let Some(transfer) = self.transfer.take() else {
            return;
        };
        if transfer.detached {
            match result {
                Ok(_) => info!(
                    "SDO write of 0x{:x}sub{} to node {} complete",
                    transfer.index, transfer.sub, transfer.server
                ),
                Err(e) => warn!(
                    "SDO write of 0x{:x}sub{} to node {} failed: {:?}",
                    transfer.index, transfer.sub, transfer.server, e
                ),
            }
            return;
        }
        self.completed = Some(result);
        if let Some(waker) = self.waker.take() {
            waker.wake();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SERVER: u8 = 5;

    fn server_frame(resp: SdoResponse) -> CanMessage {
        resp.to_can_message(CanId::std(0x585))
    }

    fn requests(sent: &[CanMessage]) -> Vec<SdoRequest> {
        sent.iter()
            .map(|m| {
                assert_eq!(CanId::std(0x605), m.id());
                SdoRequest::try_from(m.data()).unwrap()
            })
            .collect()
    }

    #[test]
    fn test_expedited_download() {
        let mut client = SdoClient::new();
        let mut sent = Vec::new();
        client
            .start_download(SERVER, 0x2000, 1, &[1, 2], 100, false, &mut |m| sent.push(m))
            .unwrap();
        assert_eq!(
            vec![SdoRequest::expedited_download(0x2000, 1, &[1, 2])],
            requests(&sent)
        );
        assert_eq!(Some(ClientPhase::ExpeditedDownload), client.phase());

        assert_eq!(
            Err(SdoClientError::HardwareBusy),
            client.start_upload(SERVER, 0x2000, 1, 4, 100, &mut |_| {})
        );

        // Responses for another object or from another node are ignored
        client.handle_message(
            &server_frame(SdoResponse::download_acknowledge(0x2000, 2)),
            &mut |_| {},
        );
        client.handle_message(
            &SdoResponse::download_acknowledge(0x2000, 1).to_can_message(CanId::std(0x586)),
            &mut |_| {},
        );
        assert_eq!(None, client.take_result());

        client.handle_message(
            &server_frame(SdoResponse::download_acknowledge(0x2000, 1)),
            &mut |_| {},
        );
        assert_eq!(Some(Ok(2)), client.take_result());
        assert!(!client.is_busy());
    }

    #[test]
    fn test_segmented_download() {
        let mut client = SdoClient::new();
        let mut sent = Vec::new();
        let data = b"0123456789";
        client
            .start_download(SERVER, 0x2001, 0, data, 100, false, &mut |m| sent.push(m))
            .unwrap();
        client.handle_message(
            &server_frame(SdoResponse::download_acknowledge(0x2001, 0)),
            &mut |m| sent.push(m),
        );
        client.handle_message(
            &server_frame(SdoResponse::download_segment_acknowledge(false)),
            &mut |m| sent.push(m),
        );
        assert_eq!(None, client.take_result());
        client.handle_message(
            &server_frame(SdoResponse::download_segment_acknowledge(true)),
            &mut |m| sent.push(m),
        );
        assert_eq!(Some(Ok(10)), client.take_result());
        assert_eq!(
            vec![
                SdoRequest::initiate_download(0x2001, 0, Some(10)),
                SdoRequest::download_segment(false, false, b"0123456"),
                SdoRequest::download_segment(true, true, b"789"),
            ],
            requests(&sent)
        );
    }

    #[test]
    fn test_toggle_error() {
        let mut client = SdoClient::new();
        let mut sent = Vec::new();
        client
            .start_upload(SERVER, 0x2001, 0, 100, 100, &mut |m| sent.push(m))
            .unwrap();
        client.handle_message(
            &server_frame(SdoResponse::upload_acknowledge(0x2001, 0, 10)),
            &mut |m| sent.push(m),
        );
        client.handle_message(
            &server_frame(SdoResponse::upload_segment(true, false, b"abc")),
            &mut |m| sent.push(m),
        );
        assert_eq!(
            Some(Err(SdoClientError::ToggleNotAlternated)),
            client.take_result()
        );
        assert_eq!(
            SdoRequest::abort(0x2001, 0, AbortCode::ToggleNotAlternated),
            *requests(&sent).last().unwrap()
        );
    }

    #[test]
    fn test_stale_segment_before_initiate_reply() {
        let mut client = SdoClient::new();
        let mut sent = Vec::new();
        client
            .start_upload(SERVER, 0x2001, 0, 100, 100, &mut |m| sent.push(m))
            .unwrap();
        for stale in [
            SdoResponse::upload_segment(false, true, b"old"),
            SdoResponse::download_segment_acknowledge(true),
            SdoResponse::ConfirmBlock {
                ackseq: 3,
                blksize: 127,
            },
        ] {
            client.handle_message(&server_frame(stale), &mut |m| sent.push(m));
        }
        assert_eq!(None, client.take_result());
        assert_eq!(Some(ClientPhase::SegmentedUpload), client.phase());
        assert_eq!(1, sent.len());

        client.handle_message(
            &server_frame(SdoResponse::upload_acknowledge(0x2001, 0, 3)),
            &mut |m| sent.push(m),
        );
        client.handle_message(
            &server_frame(SdoResponse::upload_segment(false, true, b"new")),
            &mut |m| sent.push(m),
        );
        assert_eq!(Some(Ok(3)), client.take_result());
        assert_eq!(b"new", client.data(3));
    }

    #[test]
    fn test_segmented_upload() {
        let mut client = SdoClient::new();
        let mut sent = Vec::new();
        client
            .start_upload(SERVER, 0x2001, 0, 100, 100, &mut |m| sent.push(m))
            .unwrap();
        client.handle_message(
            &server_frame(SdoResponse::upload_acknowledge(0x2001, 0, 10)),
            &mut |m| sent.push(m),
        );
        client.handle_message(
            &server_frame(SdoResponse::upload_segment(false, false, b"0123456")),
            &mut |m| sent.push(m),
        );
        client.handle_message(
            &server_frame(SdoResponse::upload_segment(true, true, b"789")),
            &mut |m| sent.push(m),
        );
        assert_eq!(Some(Ok(10)), client.take_result());
        assert_eq!(b"0123456789", client.data(10));
        assert_eq!(
            vec![
                SdoRequest::initiate_upload(0x2001, 0),
                SdoRequest::upload_segment_request(false),
                SdoRequest::upload_segment_request(true),
            ],
            requests(&sent)
        );
    }

    #[test]
    fn test_expedited_upload_reply() {
        let mut client = SdoClient::new();
        client
            .start_upload(SERVER, 0x2000, 0, 4, 100, &mut |_| {})
            .unwrap();
        client.handle_message(
            &server_frame(SdoResponse::expedited_upload(0x2000, 0, &[9, 8])),
            &mut |_| {},
        );
        assert_eq!(Some(Ok(2)), client.take_result());
        assert_eq!(&[9, 8], client.data(2));

        // Larger than the caller's buffer
        let mut sent = Vec::new();
        client
            .start_upload(SERVER, 0x2000, 0, 1, 100, &mut |_| {})
            .unwrap();
        client.handle_message(
            &server_frame(SdoResponse::expedited_upload(0x2000, 0, &[9, 8])),
            &mut |m| sent.push(m),
        );
        assert_eq!(Some(Err(SdoClientError::BufferTooSmall)), client.take_result());
        assert_eq!(
            vec![SdoRequest::abort(0x2000, 0, AbortCode::OutOfMemory)],
            requests(&sent)
        );
    }

    #[test]
    fn test_server_abort() {
        let mut client = SdoClient::new();
        client
            .start_upload(SERVER, 0x3000, 0, 4, 100, &mut |_| {})
            .unwrap();
        client.handle_message(
            &server_frame(SdoResponse::abort(0x3000, 0, AbortCode::NoSuchObject)),
            &mut |_| {},
        );
        assert_eq!(
            Some(Err(SdoClientError::Aborted {
                index: 0x3000,
                sub: 0,
                abort_code: AbortCode::NoSuchObject.into()
            })),
            client.take_result()
        );
    }

    #[test]
    fn test_timeout() {
        let mut client = SdoClient::new();
        let mut sent = Vec::new();
        client
            .start_upload(SERVER, 0x2000, 0, 4, 100, &mut |_| {})
            .unwrap();
        client.tick(99, &mut |m| sent.push(m));
        assert!(sent.is_empty());
        client.tick(1, &mut |m| sent.push(m));
        assert_eq!(
            vec![SdoRequest::abort(0x2000, 0, AbortCode::SdoTimeout)],
            requests(&sent)
        );
        assert_eq!(
            Some(Err(SdoClientError::NotResponding { node_id: SERVER })),
            client.take_result()
        );
        assert!(!client.is_busy());
        assert!(client
            .start_upload(SERVER, 0x2000, 0, 4, 100, &mut |_| {})
            .is_ok());
    }

    #[test]
    fn test_detached_and_release() {
        let mut client = SdoClient::new();
        client
            .start_download(SERVER, 0x2000, 0, &[1], 100, true, &mut |_| {})
            .unwrap();
        // Release does not touch a detached transfer
        client.release(&mut |_| panic!("Unexpected abort"));
        assert!(client.is_busy());
        client.handle_message(
            &server_frame(SdoResponse::download_acknowledge(0x2000, 0)),
            &mut |_| {},
        );
        assert!(!client.is_busy());
        assert_eq!(None, client.take_result());

        let mut sent = Vec::new();
        client
            .start_upload(SERVER, 0x2000, 0, 4, 100, &mut |_| {})
            .unwrap();
        client.release(&mut |m| sent.push(m));
        assert_eq!(
            vec![SdoRequest::abort(0x2000, 0, AbortCode::GeneralError)],
            requests(&sent)
        );
        assert!(!client.is_busy());
    }

    #[test]
    fn test_invalid_start() {
        let mut client = SdoClient::new();
        assert_eq!(
            Err(SdoClientError::InvalidNodeId { node_id: 0 }),
            client.start_upload(0, 0x2000, 0, 4, 100, &mut |_| {})
        );
        assert_eq!(
            Err(SdoClientError::TransferTooLarge { len: 1000 }),
            client.start_download(SERVER, 0x2000, 0, &[0; 1000], 100, false, &mut |_| {})
        );
        assert!(!client.is_busy());
    }

    #[test]
    fn test_block_upload() {
        let mut client = SdoClient::new();
        let mut sent = Vec::new();
        let data: Vec<u8> = (0..10).collect();
        client
            .start_block_upload(SERVER, 0x2001, 0, 100, 100, &mut |m| sent.push(m))
            .unwrap();
        client.handle_message(
            &server_frame(SdoResponse::block_upload_acknowledge(0x2001, 0, 10)),
            &mut |m| sent.push(m),
        );
        for seg in [
            BlockSegment::new(1, false, &data[0..7]),
            BlockSegment::new(2, true, &data[7..10]),
        ] {
            client.handle_message(&seg.to_can_message(CanId::std(0x585)), &mut |m| sent.push(m));
        }
        let crc = State::<XMODEM>::calculate(&data);
        client.handle_message(
            &server_frame(SdoResponse::BlockUploadEnd { n: 4, crc }),
            &mut |m| sent.push(m),
        );
        assert_eq!(Some(Ok(10)), client.take_result());
        assert_eq!(&data[..], client.data(10));
        assert_eq!(
            vec![
                SdoRequest::initiate_block_upload(0x2001, 0, 127, 0),
                SdoRequest::StartBlockUpload,
                SdoRequest::ConfirmBlock {
                    ackseq: 2,
                    blksize: 127
                },
                SdoRequest::EndBlockUpload,
            ],
            requests(&sent)
        );
    }
}
