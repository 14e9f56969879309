// crates/canopen-rs/src/sdo/client.rs

//! The SDO client: issues dictionary requests to remote servers.
//!
//! At most one transaction per remote server is in flight; further requests
//! to the same server queue FIFO and never preempt the ongoing one.

use super::{abort_payload, ccs, crc16, multiplexer, scs, AbortCode, DEFAULT_TIMEOUT_US, MAX_BLKSIZE};
use crate::can::CanFrame;
use crate::exec::Promise;
use crate::hal::CanOpenError;
use crate::node::TimerEvent;
use crate::timer::{TimerHandle, TimerQueue};
use crate::types::NodeId;
use alloc::collections::{BTreeMap, VecDeque};
use alloc::vec::Vec;
use log::{debug, trace, warn};

/// Result of a client transfer: uploaded bytes, or empty for downloads.
pub type SdoResult = Result<Vec<u8>, CanOpenError>;

/// Handle identifying a submitted request, used for cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SdoHandle(u64);

/// Which transfer protocol a request uses.
#[derive(Debug, Clone, PartialEq)]
pub enum SdoRequestKind {
    /// Expedited (≤ 4 bytes) or segmented download of the payload.
    Download(Vec<u8>),
    /// Expedited or segmented upload.
    Upload,
    /// 127-segment block download with CRC.
    BlockDownload(Vec<u8>),
    /// 127-segment block upload with CRC.
    BlockUpload,
}

/// A completed transfer, reported back to the node for routing.
#[derive(Debug, Clone, PartialEq)]
pub struct SdoCompletion {
    pub handle: SdoHandle,
    pub node: NodeId,
    pub index: u16,
    pub sub_index: u8,
    pub result: SdoResult,
    pub(crate) owner: Owner,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Owner {
    /// Completion is reported to the application promise.
    Public,
    /// Completion feeds a concise-DCF job; only the job's final outcome is
    /// made public.
    Dcf(SdoHandle),
}

struct QueuedRequest {
    handle: SdoHandle,
    index: u16,
    sub_index: u8,
    kind: SdoRequestKind,
    timeout_us: u64,
    owner: Owner,
    promise: Promise<SdoResult>,
}

#[derive(Debug)]
enum TransferState {
    DownloadInitSent,
    DownloadSegments { toggle: bool, offset: usize },
    UploadInitSent,
    UploadSegments { toggle: bool },
    BlockDownloadInitSent,
    /// A sub-block is on the wire; waiting for the server's acknowledgement.
    BlockDownloadAck { offset: usize, sent: u8 },
    BlockDownloadEndSent,
    BlockUploadInitSent,
    BlockUploadSegments {
        next_seqno: u8,
        blksize: u8,
        crc_enabled: bool,
        total: usize,
    },
    /// Waiting for the server's end-of-transfer after all data arrived.
    BlockUploadEndWait { crc_enabled: bool },
}

struct ActiveTransfer {
    request: QueuedRequest,
    state: TransferState,
    /// Payload buffer: outgoing data for downloads, received data for
    /// uploads.
    buffer: Vec<u8>,
    blksize: u8,
}

struct DcfJob {
    node: NodeId,
    remaining: VecDeque<(u16, u8, Vec<u8>)>,
    total: usize,
    promise: Promise<SdoResult>,
}

#[derive(Default)]
struct Connection {
    queue: VecDeque<QueuedRequest>,
    active: Option<ActiveTransfer>,
    timer: Option<TimerHandle>,
}

/// The client engine. One instance serves all remote nodes, with one
/// connection (queue + in-flight slot) per server.
#[derive(Default)]
pub struct SdoClient {
    connections: BTreeMap<NodeId, Connection>,
    dcf_jobs: BTreeMap<SdoHandle, DcfJob>,
    next_handle: u64,
}

impl SdoClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate_handle(&mut self) -> SdoHandle {
        let handle = SdoHandle(self.next_handle);
        self.next_handle += 1;
        handle
    }

    /// Queues an expedited/segmented download of `data` to the remote entry.
    pub fn download(
        &mut self,
        timers: &mut TimerQueue<TimerEvent>,
        now: u64,
        node: NodeId,
        index: u16,
        sub_index: u8,
        data: Vec<u8>,
    ) -> (SdoHandle, Promise<SdoResult>, Vec<CanFrame>) {
        self.submit(
            timers,
            now,
            node,
            index,
            sub_index,
            SdoRequestKind::Download(data),
            DEFAULT_TIMEOUT_US,
        )
    }

    /// Queues an expedited/segmented upload of the remote entry.
    pub fn upload(
        &mut self,
        timers: &mut TimerQueue<TimerEvent>,
        now: u64,
        node: NodeId,
        index: u16,
        sub_index: u8,
    ) -> (SdoHandle, Promise<SdoResult>, Vec<CanFrame>) {
        self.submit(
            timers,
            now,
            node,
            index,
            sub_index,
            SdoRequestKind::Upload,
            DEFAULT_TIMEOUT_US,
        )
    }

    /// Queues a transfer with an explicit protocol and timeout.
    pub fn submit(
        &mut self,
        timers: &mut TimerQueue<TimerEvent>,
        now: u64,
        node: NodeId,
        index: u16,
        sub_index: u8,
        kind: SdoRequestKind,
        timeout_us: u64,
    ) -> (SdoHandle, Promise<SdoResult>, Vec<CanFrame>) {
        let handle = self.allocate_handle();
        let promise = Promise::new();
        let request = QueuedRequest {
            handle,
            index,
            sub_index,
            kind,
            timeout_us,
            owner: Owner::Public,
            promise: promise.clone(),
        };
        let frames = self.enqueue(timers, now, node, request);
        (handle, promise, frames)
    }

    /// Parses a concise DCF stream and downloads each entry in order,
    /// aborting the whole job on the first failure.
    ///
    /// Format (little-endian): entry count u32, then per entry
    /// `index: u16, sub_index: u8, size: u32, data[size]`.
    pub fn download_dcf(
        &mut self,
        timers: &mut TimerQueue<TimerEvent>,
        now: u64,
        node: NodeId,
        dcf: &[u8],
    ) -> Result<(SdoHandle, Promise<SdoResult>, Vec<CanFrame>), CanOpenError> {
        let entries = parse_concise_dcf(dcf)?;
        let handle = self.allocate_handle();
        let promise = Promise::new();
        if entries.is_empty() {
            promise.resolve(Ok(Vec::new()));
            return Ok((handle, promise, Vec::new()));
        }
        let mut job = DcfJob {
            node,
            remaining: entries.into_iter().collect(),
            total: 0,
            promise: promise.clone(),
        };
        job.total = job.remaining.len();
        let frames = self.start_next_dcf_entry(timers, now, handle, &mut job);
        self.dcf_jobs.insert(handle, job);
        Ok((handle, promise, frames))
    }

    fn start_next_dcf_entry(
        &mut self,
        timers: &mut TimerQueue<TimerEvent>,
        now: u64,
        job_handle: SdoHandle,
        job: &mut DcfJob,
    ) -> Vec<CanFrame> {
        let Some((index, sub_index, data)) = job.remaining.pop_front() else {
            return Vec::new();
        };
        let handle = self.allocate_handle();
        let request = QueuedRequest {
            handle,
            index,
            sub_index,
            kind: SdoRequestKind::Download(data),
            timeout_us: DEFAULT_TIMEOUT_US,
            owner: Owner::Dcf(job_handle),
            promise: Promise::new(),
        };
        self.enqueue(timers, now, job.node, request)
    }

    fn enqueue(
        &mut self,
        timers: &mut TimerQueue<TimerEvent>,
        now: u64,
        node: NodeId,
        request: QueuedRequest,
    ) -> Vec<CanFrame> {
        let connection = self.connections.entry(node).or_default();
        connection.queue.push_back(request);
        if connection.active.is_none() {
            Self::start_next(connection, timers, now, node)
        } else {
            Vec::new()
        }
    }

    /// Pops the next queued request of `connection` and emits its opening
    /// frame(s).
    fn start_next(
        connection: &mut Connection,
        timers: &mut TimerQueue<TimerEvent>,
        now: u64,
        node: NodeId,
    ) -> Vec<CanFrame> {
        let Some(request) = connection.queue.pop_front() else {
            return Vec::new();
        };
        let tx_cob_id = node.sdo_request_cob_id();
        let index = request.index;
        let sub_index = request.sub_index;
        let mut frames = Vec::new();
        let (state, buffer) = match &request.kind {
            SdoRequestKind::Download(data) => {
                let mut init = [0u8; 8];
                init[1] = (index & 0xFF) as u8;
                init[2] = (index >> 8) as u8;
                init[3] = sub_index;
                if data.len() <= 4 {
                    let n = (4 - data.len()) as u8;
                    init[0] = (ccs::DOWNLOAD_INITIATE << 5) | (n << 2) | 0x03;
                    init[4..4 + data.len()].copy_from_slice(data);
                } else {
                    init[0] = (ccs::DOWNLOAD_INITIATE << 5) | 0x01;
                    init[4..8].copy_from_slice(&(data.len() as u32).to_le_bytes());
                }
                frames.push(frame(tx_cob_id, init));
                (TransferState::DownloadInitSent, data.clone())
            }
            SdoRequestKind::Upload => {
                let mut init = [0u8; 8];
                init[0] = ccs::UPLOAD_INITIATE << 5;
                init[1] = (index & 0xFF) as u8;
                init[2] = (index >> 8) as u8;
                init[3] = sub_index;
                frames.push(frame(tx_cob_id, init));
                (TransferState::UploadInitSent, Vec::new())
            }
            SdoRequestKind::BlockDownload(data) => {
                let mut init = [0u8; 8];
                // cc = CRC supported, s = size indicated, cs = 0.
                init[0] = (ccs::BLOCK_DOWNLOAD << 5) | 0x04 | 0x02;
                init[1] = (index & 0xFF) as u8;
                init[2] = (index >> 8) as u8;
                init[3] = sub_index;
                init[4..8].copy_from_slice(&(data.len() as u32).to_le_bytes());
                frames.push(frame(tx_cob_id, init));
                (TransferState::BlockDownloadInitSent, data.clone())
            }
            SdoRequestKind::BlockUpload => {
                let mut init = [0u8; 8];
                // cc = CRC supported, cs = 0.
                init[0] = (ccs::BLOCK_UPLOAD << 5) | 0x04;
                init[1] = (index & 0xFF) as u8;
                init[2] = (index >> 8) as u8;
                init[3] = sub_index;
                init[4] = MAX_BLKSIZE;
                frames.push(frame(tx_cob_id, init));
                (TransferState::BlockUploadInitSent, Vec::new())
            }
        };

        let timeout_us = request.timeout_us;
        connection.active = Some(ActiveTransfer {
            request,
            state,
            buffer,
            blksize: MAX_BLKSIZE,
        });
        if let Some(handle) = connection.timer.take() {
            timers.cancel(handle);
        }
        connection.timer = Some(timers.schedule(now + timeout_us, TimerEvent::SdoClient(node)));
        trace!(
            "[SDO] client start {:#06X}:{:#04X} on node {}",
            index,
            sub_index,
            node
        );
        frames
    }

    /// True while any transaction with `node` is in flight.
    pub fn is_busy(&self, node: NodeId) -> bool {
        self.connections
            .get(&node)
            .is_some_and(|connection| connection.active.is_some())
    }

    /// Cancels a request. Pending requests are removed silently; the
    /// in-flight request additionally sends an SDO abort to the server.
    /// Cancelling a completed request is a no-op.
    pub fn cancel(
        &mut self,
        timers: &mut TimerQueue<TimerEvent>,
        now: u64,
        handle: SdoHandle,
    ) -> (Vec<CanFrame>, Vec<SdoCompletion>) {
        let mut frames = Vec::new();
        let mut completions = Vec::new();
        let mut next_node = None;
        for (&node, connection) in self.connections.iter_mut() {
            if let Some(position) = connection
                .queue
                .iter()
                .position(|request| request.handle == handle)
            {
                let request = connection.queue.remove(position).expect("indexed");
                completions.push(complete(node, request, Err(CanOpenError::Aborted)));
                break;
            }
            if connection
                .active
                .as_ref()
                .is_some_and(|active| active.request.handle == handle)
            {
                let active = connection.active.take().expect("checked");
                frames.push(frame(
                    node.sdo_request_cob_id(),
                    abort_payload(active.request.index, active.request.sub_index, AbortCode::Error),
                ));
                completions.push(complete(node, active.request, Err(CanOpenError::Aborted)));
                next_node = Some(node);
                break;
            }
        }
        if let Some(node) = next_node {
            if let Some(connection) = self.connections.get_mut(&node) {
                frames.extend(Self::start_next(connection, timers, now, node));
            }
        }
        (frames, completions)
    }

    /// Cancels every queued and in-flight request, e.g. on shutdown or NMT
    /// reset-communication. In-flight transactions send an abort frame.
    pub fn cancel_all(
        &mut self,
        timers: &mut TimerQueue<TimerEvent>,
        error: CanOpenError,
        abort_on_wire: bool,
    ) -> (Vec<CanFrame>, Vec<SdoCompletion>) {
        let mut frames = Vec::new();
        let mut completions = Vec::new();
        for (&node, connection) in self.connections.iter_mut() {
            if let Some(handle) = connection.timer.take() {
                timers.cancel(handle);
            }
            if let Some(active) = connection.active.take() {
                if abort_on_wire {
                    frames.push(frame(
                        node.sdo_request_cob_id(),
                        abort_payload(
                            active.request.index,
                            active.request.sub_index,
                            AbortCode::Error,
                        ),
                    ));
                }
                completions.push(complete(node, active.request, Err(error)));
            }
            while let Some(request) = connection.queue.pop_front() {
                completions.push(complete(node, request, Err(error)));
            }
        }
        for (_, job) in core::mem::take(&mut self.dcf_jobs) {
            job.promise.resolve(Err(error));
        }
        (frames, completions)
    }

    /// The per-transaction timeout of `node` expired.
    pub fn on_timeout(
        &mut self,
        timers: &mut TimerQueue<TimerEvent>,
        now: u64,
        node: NodeId,
    ) -> (Vec<CanFrame>, Vec<SdoCompletion>) {
        let Some(connection) = self.connections.get_mut(&node) else {
            return (Vec::new(), Vec::new());
        };
        connection.timer = None;
        let Some(active) = connection.active.take() else {
            return (Vec::new(), Vec::new());
        };
        warn!(
            "[SDO] client timeout on node {} {:#06X}:{:#04X}",
            node, active.request.index, active.request.sub_index
        );
        let mut frames = alloc::vec![frame(
            node.sdo_request_cob_id(),
            abort_payload(
                active.request.index,
                active.request.sub_index,
                AbortCode::Timeout
            ),
        )];
        let mut completions =
            alloc::vec![complete(node, active.request, Err(CanOpenError::Timeout))];
        frames.extend(Self::start_next(connection, timers, now, node));
        self.drive_dcf_jobs(timers, now, &mut frames, &mut completions);
        (frames, completions)
    }

    /// Processes one server-to-client frame from `node`.
    pub fn handle_frame(
        &mut self,
        timers: &mut TimerQueue<TimerEvent>,
        now: u64,
        node: NodeId,
        received: &CanFrame,
    ) -> (Vec<CanFrame>, Vec<SdoCompletion>) {
        let data = received.payload();
        if data.len() != 8 {
            return (Vec::new(), Vec::new());
        }
        let Some(connection) = self.connections.get_mut(&node) else {
            return (Vec::new(), Vec::new());
        };
        let Some(mut active) = connection.active.take() else {
            return (Vec::new(), Vec::new());
        };

        let tx_cob_id = node.sdo_request_cob_id();
        let command = data[0];
        let mut frames = Vec::new();
        let mut outcome: Option<SdoResult> = None;

        // While block-upload segments stream in, byte 0 carries
        // `last << 7 | seqno`, so a final segment with seqno <= 31 mimics
        // the abort specifier. Sequence numbers are 1..=127; only the bare
        // 0x80 is an abort in that state.
        let streaming_segments =
            matches!(active.state, TransferState::BlockUploadSegments { .. });

        if command >> 5 == scs::ABORT && (!streaming_segments || command == 0x80) {
            let (index, sub_index) = multiplexer(data);
            let code =
                AbortCode::from_u32(u32::from_le_bytes([data[4], data[5], data[6], data[7]]));
            debug!(
                "[SDO] server abort from node {} on {:#06X}:{:#04X}: {}",
                node, index, sub_index, code
            );
            outcome = Some(Err(CanOpenError::SdoAbort(code)));
        } else {
            match &mut active.state {
                TransferState::DownloadInitSent => {
                    if command >> 5 == scs::DOWNLOAD_INITIATE {
                        if active.buffer.len() <= 4 {
                            outcome = Some(Ok(Vec::new()));
                        } else {
                            let (segment, _last) = download_segment(&active.buffer, 0, false);
                            frames.push(frame(tx_cob_id, segment));
                            active.state = TransferState::DownloadSegments {
                                toggle: false,
                                offset: active.buffer.len().min(7),
                            };
                        }
                    } else {
                        outcome = protocol_error(&mut frames, tx_cob_id, &active);
                    }
                }
                TransferState::DownloadSegments { toggle, offset } => {
                    let acked_toggle = command & 0x10 != 0;
                    if command >> 5 == scs::DOWNLOAD_SEGMENT && acked_toggle == *toggle {
                        if *offset >= active.buffer.len() {
                            outcome = Some(Ok(Vec::new()));
                        } else {
                            let next_toggle = !*toggle;
                            let (segment, _last) =
                                download_segment(&active.buffer, *offset, next_toggle);
                            frames.push(frame(tx_cob_id, segment));
                            let sent = (active.buffer.len() - *offset).min(7);
                            active.state = TransferState::DownloadSegments {
                                toggle: next_toggle,
                                offset: *offset + sent,
                            };
                        }
                    } else {
                        outcome = protocol_error(&mut frames, tx_cob_id, &active);
                    }
                }
                TransferState::UploadInitSent => {
                    if command >> 5 == scs::UPLOAD_INITIATE {
                        if command & 0x02 != 0 {
                            // Expedited response.
                            let len = if command & 0x01 != 0 {
                                4 - ((command >> 2) & 0x03) as usize
                            } else {
                                4
                            };
                            outcome = Some(Ok(data[4..4 + len].to_vec()));
                        } else {
                            let mut request = [0u8; 8];
                            request[0] = ccs::UPLOAD_SEGMENT << 5;
                            frames.push(frame(tx_cob_id, request));
                            active.state = TransferState::UploadSegments { toggle: false };
                        }
                    } else {
                        outcome = protocol_error(&mut frames, tx_cob_id, &active);
                    }
                }
                TransferState::UploadSegments { toggle } => {
                    let received_toggle = command & 0x10 != 0;
                    if command >> 5 == scs::UPLOAD_SEGMENT && received_toggle == *toggle {
                        let unused = ((command >> 1) & 0x07) as usize;
                        active.buffer.extend_from_slice(&data[1..8 - unused]);
                        if command & 0x01 != 0 {
                            outcome = Some(Ok(core::mem::take(&mut active.buffer)));
                        } else {
                            let next_toggle = !*toggle;
                            let mut request = [0u8; 8];
                            request[0] = (ccs::UPLOAD_SEGMENT << 5)
                                | if next_toggle { 0x10 } else { 0 };
                            frames.push(frame(tx_cob_id, request));
                            active.state = TransferState::UploadSegments {
                                toggle: next_toggle,
                            };
                        }
                    } else {
                        outcome = protocol_error(&mut frames, tx_cob_id, &active);
                    }
                }
                TransferState::BlockDownloadInitSent => {
                    if command >> 5 == scs::BLOCK_DOWNLOAD && command & 0x03 == 0 {
                        let blksize = data[4];
                        if blksize == 0 || blksize > MAX_BLKSIZE {
                            frames.push(frame(
                                tx_cob_id,
                                abort_payload(
                                    active.request.index,
                                    active.request.sub_index,
                                    AbortCode::BlkSize,
                                ),
                            ));
                            outcome =
                                Some(Err(CanOpenError::SdoAbort(AbortCode::BlkSize)));
                        } else {
                            active.blksize = blksize;
                            let (sub_block, sent) =
                                block_download_segments(&active.buffer, 0, blksize);
                            frames.extend(
                                sub_block.into_iter().map(|data| frame(tx_cob_id, data)),
                            );
                            active.state =
                                TransferState::BlockDownloadAck { offset: 0, sent };
                        }
                    } else {
                        outcome = protocol_error(&mut frames, tx_cob_id, &active);
                    }
                }
                TransferState::BlockDownloadAck { offset, sent } => {
                    if command >> 5 == scs::BLOCK_DOWNLOAD && command & 0x03 == 0x02 {
                        let ackseq = data[1];
                        let blksize = data[2];
                        if ackseq > *sent || blksize == 0 || blksize > MAX_BLKSIZE {
                            frames.push(frame(
                                tx_cob_id,
                                abort_payload(
                                    active.request.index,
                                    active.request.sub_index,
                                    AbortCode::BlkSeq,
                                ),
                            ));
                            outcome = Some(Err(CanOpenError::SdoAbort(AbortCode::BlkSeq)));
                        } else {
                            let new_offset =
                                (*offset + ackseq as usize * 7).min(active.buffer.len());
                            active.blksize = blksize;
                            if new_offset >= active.buffer.len() {
                                // All data acknowledged: end of transfer.
                                let total = active.buffer.len();
                                let unused = (7 - (total % 7)) % 7;
                                let mut end = [0u8; 8];
                                end[0] = (ccs::BLOCK_DOWNLOAD << 5)
                                    | ((unused as u8) << 2)
                                    | 0x01;
                                end[1..3]
                                    .copy_from_slice(&crc16(&active.buffer).to_le_bytes());
                                frames.push(frame(tx_cob_id, end));
                                active.state = TransferState::BlockDownloadEndSent;
                            } else {
                                let (sub_block, count) = block_download_segments(
                                    &active.buffer,
                                    new_offset,
                                    blksize,
                                );
                                frames.extend(
                                    sub_block.into_iter().map(|data| frame(tx_cob_id, data)),
                                );
                                active.state = TransferState::BlockDownloadAck {
                                    offset: new_offset,
                                    sent: count,
                                };
                            }
                        }
                    } else {
                        outcome = protocol_error(&mut frames, tx_cob_id, &active);
                    }
                }
                TransferState::BlockDownloadEndSent => {
                    if command >> 5 == scs::BLOCK_DOWNLOAD && command & 0x03 == 0x01 {
                        outcome = Some(Ok(Vec::new()));
                    } else {
                        outcome = protocol_error(&mut frames, tx_cob_id, &active);
                    }
                }
                TransferState::BlockUploadInitSent => {
                    if command >> 5 == scs::BLOCK_UPLOAD && command & 0x01 == 0 {
                        let crc_enabled = command & 0x04 != 0;
                        let total = if command & 0x02 != 0 {
                            u32::from_le_bytes([data[4], data[5], data[6], data[7]]) as usize
                        } else {
                            0
                        };
                        let mut start = [0u8; 8];
                        start[0] = (ccs::BLOCK_UPLOAD << 5) | 0x03;
                        frames.push(frame(tx_cob_id, start));
                        active.state = TransferState::BlockUploadSegments {
                            next_seqno: 1,
                            blksize: MAX_BLKSIZE,
                            crc_enabled,
                            total,
                        };
                    } else {
                        outcome = protocol_error(&mut frames, tx_cob_id, &active);
                    }
                }
                TransferState::BlockUploadSegments {
                    next_seqno,
                    blksize,
                    crc_enabled,
                    ..
                } => {
                    // Segment frames carry `last << 7 | seqno` in byte 0,
                    // which can mimic the abort and end-of-transfer command
                    // specifiers. The abort test above therefore only
                    // accepts the bare 0x80 in this state; anything else is
                    // matched against the expected sequence number, and an
                    // out-of-sequence frame (including a premature
                    // end-of-transfer) aborts the transfer.
                    let last = command & 0x80 != 0;
                    let seqno = command & 0x7F;
                    if seqno != *next_seqno {
                        frames.push(frame(
                            tx_cob_id,
                            abort_payload(
                                active.request.index,
                                active.request.sub_index,
                                AbortCode::BlkSeq,
                            ),
                        ));
                        outcome = Some(Err(CanOpenError::SdoAbort(AbortCode::BlkSeq)));
                    } else {
                        let crc = *crc_enabled;
                        active.buffer.extend_from_slice(&data[1..8]);
                        if last || seqno == *blksize {
                            let mut ack = [0u8; 8];
                            ack[0] = (ccs::BLOCK_UPLOAD << 5) | 0x02;
                            ack[1] = seqno;
                            ack[2] = MAX_BLKSIZE;
                            frames.push(frame(tx_cob_id, ack));
                            if last {
                                active.state = TransferState::BlockUploadEndWait {
                                    crc_enabled: crc,
                                };
                            } else {
                                *next_seqno = 1;
                                *blksize = MAX_BLKSIZE;
                            }
                        } else {
                            *next_seqno += 1;
                        }
                    }
                }
                TransferState::BlockUploadEndWait { crc_enabled } => {
                    if command >> 5 == scs::BLOCK_UPLOAD && command & 0x03 == 0x01 {
                        let unused = ((command >> 2) & 0x07) as usize;
                        active.buffer.truncate(active.buffer.len() - unused);
                        let crc_ok = if *crc_enabled {
                            let received_crc = u16::from_le_bytes([data[1], data[2]]);
                            received_crc == crc16(&active.buffer)
                        } else {
                            true
                        };
                        if crc_ok {
                            let mut end = [0u8; 8];
                            end[0] = (ccs::BLOCK_UPLOAD << 5) | 0x01;
                            frames.push(frame(tx_cob_id, end));
                            outcome = Some(Ok(core::mem::take(&mut active.buffer)));
                        } else {
                            frames.push(frame(
                                tx_cob_id,
                                abort_payload(
                                    active.request.index,
                                    active.request.sub_index,
                                    AbortCode::BlkCrc,
                                ),
                            ));
                            outcome = Some(Err(CanOpenError::SdoAbort(AbortCode::BlkCrc)));
                        }
                    } else {
                        outcome = protocol_error(&mut frames, tx_cob_id, &active);
                    }
                }
            }
        }

        let mut completions = Vec::new();
        match outcome {
            Some(result) => {
                if let Some(handle) = connection.timer.take() {
                    timers.cancel(handle);
                }
                completions.push(complete(node, active.request, result));
                frames.extend(Self::start_next(connection, timers, now, node));
            }
            None => {
                // Transaction continues: restart the timeout window.
                if let Some(handle) = connection.timer.take() {
                    timers.cancel(handle);
                }
                let timeout_us = active.request.timeout_us;
                connection.timer =
                    Some(timers.schedule(now + timeout_us, TimerEvent::SdoClient(node)));
                connection.active = Some(active);
            }
        }
        self.drive_dcf_jobs(timers, now, &mut frames, &mut completions);
        (frames, completions)
    }

    /// Advances concise-DCF jobs whose current entry completed, turning
    /// internal completions into either the next download or the job's own
    /// public completion.
    fn drive_dcf_jobs(
        &mut self,
        timers: &mut TimerQueue<TimerEvent>,
        now: u64,
        frames: &mut Vec<CanFrame>,
        completions: &mut Vec<SdoCompletion>,
    ) {
        let mut index = 0;
        while index < completions.len() {
            let Owner::Dcf(job_handle) = completions[index].owner else {
                index += 1;
                continue;
            };
            let completion = completions.remove(index);
            let Some(mut job) = self.dcf_jobs.remove(&job_handle) else {
                continue;
            };
            match completion.result {
                Ok(_) => {
                    if job.remaining.is_empty() {
                        debug!(
                            "[SDO] DCF download to node {} complete ({} entries)",
                            job.node, job.total
                        );
                        job.promise.resolve(Ok(Vec::new()));
                        completions.insert(
                            index,
                            SdoCompletion {
                                handle: job_handle,
                                node: job.node,
                                index: 0,
                                sub_index: 0,
                                result: Ok(Vec::new()),
                                owner: Owner::Public,
                            },
                        );
                        index += 1;
                    } else {
                        frames.extend(
                            self.start_next_dcf_entry(timers, now, job_handle, &mut job),
                        );
                        self.dcf_jobs.insert(job_handle, job);
                    }
                }
                Err(error) => {
                    warn!(
                        "[SDO] DCF download to node {} failed at {:#06X}:{:#04X}",
                        job.node, completion.index, completion.sub_index
                    );
                    job.promise.resolve(Err(error));
                    completions.insert(
                        index,
                        SdoCompletion {
                            handle: job_handle,
                            node: job.node,
                            index: completion.index,
                            sub_index: completion.sub_index,
                            result: Err(error),
                            owner: Owner::Public,
                        },
                    );
                    index += 1;
                }
            }
        }
    }

}

fn protocol_error(
    frames: &mut Vec<CanFrame>,
    tx_cob_id: u16,
    active: &ActiveTransfer,
) -> Option<SdoResult> {
    frames.push(frame(
        tx_cob_id,
        abort_payload(active.request.index, active.request.sub_index, AbortCode::NoCs),
    ));
    Some(Err(CanOpenError::Protocol))
}

fn complete(node: NodeId, request: QueuedRequest, result: SdoResult) -> SdoCompletion {
    request.promise.resolve(result.clone());
    SdoCompletion {
        handle: request.handle,
        node,
        index: request.index,
        sub_index: request.sub_index,
        result,
        owner: request.owner,
    }
}

/// Builds one download segment starting at `offset`.
fn download_segment(data: &[u8], offset: usize, toggle: bool) -> ([u8; 8], bool) {
    let remaining = data.len() - offset;
    let chunk = remaining.min(7);
    let last = remaining <= 7;
    let mut segment = [0u8; 8];
    segment[0] = (ccs::DOWNLOAD_SEGMENT << 5)
        | if toggle { 0x10 } else { 0 }
        | (((7 - chunk) as u8) << 1)
        | last as u8;
    segment[1..1 + chunk].copy_from_slice(&data[offset..offset + chunk]);
    (segment, last)
}

/// Builds one sub-block of block-download segments starting at `offset`.
fn block_download_segments(data: &[u8], offset: usize, blksize: u8) -> (Vec<[u8; 8]>, u8) {
    let mut segments = Vec::new();
    let mut cursor = offset;
    let mut count = 0;
    for seqno in 1..=blksize {
        let remaining = data.len() - cursor;
        let chunk = remaining.min(7);
        let last = remaining <= 7;
        let mut segment = [0u8; 8];
        segment[0] = seqno | if last { 0x80 } else { 0 };
        segment[1..1 + chunk].copy_from_slice(&data[cursor..cursor + chunk]);
        segments.push(segment);
        cursor += chunk;
        count = seqno;
        if last {
            break;
        }
    }
    (segments, count)
}

/// Parses a concise DCF stream into (index, sub-index, data) records.
fn parse_concise_dcf(dcf: &[u8]) -> Result<Vec<(u16, u8, Vec<u8>)>, CanOpenError> {
    if dcf.len() < 4 {
        return Err(CanOpenError::Configuration("concise DCF too short"));
    }
    let count = u32::from_le_bytes([dcf[0], dcf[1], dcf[2], dcf[3]]) as usize;
    let mut entries = Vec::with_capacity(count.min(1024));
    let mut cursor = 4;
    for _ in 0..count {
        if dcf.len() < cursor + 7 {
            return Err(CanOpenError::Configuration("truncated concise DCF entry"));
        }
        let index = u16::from_le_bytes([dcf[cursor], dcf[cursor + 1]]);
        let sub_index = dcf[cursor + 2];
        let size = u32::from_le_bytes([
            dcf[cursor + 3],
            dcf[cursor + 4],
            dcf[cursor + 5],
            dcf[cursor + 6],
        ]) as usize;
        cursor += 7;
        if dcf.len() < cursor + size {
            return Err(CanOpenError::Configuration("truncated concise DCF data"));
        }
        entries.push((index, sub_index, dcf[cursor..cursor + size].to_vec()));
        cursor += size;
    }
    Ok(entries)
}

fn frame(cob_id: u16, data: [u8; 8]) -> CanFrame {
    CanFrame {
        id: crate::can::CanId::Std(cob_id),
        data,
        dlc: 8,
        rtr: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(node: NodeId, data: [u8; 8]) -> CanFrame {
        CanFrame::new(node.sdo_response_cob_id(), &data).unwrap()
    }

    #[test]
    fn test_expedited_download_wire_format() {
        let mut client = SdoClient::new();
        let mut timers = TimerQueue::new();
        let node = NodeId(2);

        let (_, promise, frames) =
            client.download(&mut timers, 0, node, 0x2005, 0x00, alloc::vec![0x42]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].cob_id(), Some(0x602));
        assert_eq!(
            frames[0].payload(),
            &[0x2F, 0x05, 0x20, 0x00, 0x42, 0x00, 0x00, 0x00]
        );

        let (frames, completions) = client.handle_frame(
            &mut timers,
            10,
            node,
            &response(node, [0x60, 0x05, 0x20, 0x00, 0, 0, 0, 0]),
        );
        assert!(frames.is_empty());
        assert_eq!(completions.len(), 1);
        assert_eq!(completions[0].result, Ok(Vec::new()));
        assert_eq!(promise.peek(), Some(Ok(Vec::new())));
        assert!(!client.is_busy(node));
    }

    #[test]
    fn test_requests_to_same_node_queue_fifo() {
        let mut client = SdoClient::new();
        let mut timers = TimerQueue::new();
        let node = NodeId(4);

        let (_, _, first) = client.download(&mut timers, 0, node, 0x2000, 0, alloc::vec![1]);
        assert_eq!(first.len(), 1);
        // Second request must not go on the wire while the first is active.
        let (_, _, second) = client.upload(&mut timers, 0, node, 0x2001, 0);
        assert!(second.is_empty());
        assert!(client.is_busy(node));

        let (frames, completions) = client.handle_frame(
            &mut timers,
            10,
            node,
            &response(node, [0x60, 0x00, 0x20, 0x00, 0, 0, 0, 0]),
        );
        assert_eq!(completions.len(), 1);
        // The queued upload starts immediately after the completion.
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload()[0], 0x40);
    }

    #[test]
    fn test_segmented_upload_assembles_data() {
        let mut client = SdoClient::new();
        let mut timers = TimerQueue::new();
        let node = NodeId(3);

        let (_, promise, _) = client.upload(&mut timers, 0, node, 0x2009, 0);
        // Server indicates a 10-byte segmented upload.
        let (frames, _) = client.handle_frame(
            &mut timers,
            5,
            node,
            &response(node, [0x41, 0x09, 0x20, 0x00, 10, 0, 0, 0]),
        );
        assert_eq!(frames[0].payload()[0], 0x60);

        // First segment, toggle 0, 7 bytes.
        let (frames, _) = client.handle_frame(
            &mut timers,
            6,
            node,
            &response(node, [0x00, b'a', b'b', b'c', b'd', b'e', b'f', b'g']),
        );
        assert_eq!(frames[0].payload()[0], 0x70);

        // Last segment, toggle 1, 3 bytes (n = 4), c = 1.
        let (_, completions) = client.handle_frame(
            &mut timers,
            7,
            node,
            &response(node, [0x10 | (4 << 1) | 0x01, b'h', b'i', b'j', 0, 0, 0, 0]),
        );
        assert_eq!(completions[0].result, Ok(b"abcdefghij".to_vec()));
        assert_eq!(promise.peek(), Some(Ok(b"abcdefghij".to_vec())));
    }

    #[test]
    fn test_server_abort_completes_with_code() {
        let mut client = SdoClient::new();
        let mut timers = TimerQueue::new();
        let node = NodeId(9);

        let (_, promise, _) = client.upload(&mut timers, 0, node, 0x7FFF, 0);
        let mut abort = [0u8; 8];
        abort[0] = 0x80;
        abort[4..8].copy_from_slice(&AbortCode::NoObj.as_u32().to_le_bytes());
        let (_, completions) = client.handle_frame(&mut timers, 5, node, &response(node, abort));
        assert_eq!(
            completions[0].result,
            Err(CanOpenError::SdoAbort(AbortCode::NoObj))
        );
        assert_eq!(
            promise.peek(),
            Some(Err(CanOpenError::SdoAbort(AbortCode::NoObj)))
        );
    }

    #[test]
    fn test_timeout_sends_abort_and_fails() {
        let mut client = SdoClient::new();
        let mut timers = TimerQueue::new();
        let node = NodeId(7);

        client.download(&mut timers, 0, node, 0x2000, 0, alloc::vec![0]);
        assert_eq!(timers.pop_due(DEFAULT_TIMEOUT_US), Some(TimerEvent::SdoClient(node)));

        let (frames, completions) = client.on_timeout(&mut timers, DEFAULT_TIMEOUT_US, node);
        assert_eq!(frames[0].payload()[0], 0x80);
        assert_eq!(
            u32::from_le_bytes(frames[0].payload()[4..8].try_into().unwrap()),
            AbortCode::Timeout.as_u32()
        );
        assert_eq!(completions[0].result, Err(CanOpenError::Timeout));
    }

    #[test]
    fn test_block_download_round_trip() {
        let mut client = SdoClient::new();
        let mut timers = TimerQueue::new();
        let node = NodeId(2);
        let payload: Vec<u8> = (0u8..20).collect();

        let (_, promise, frames) = client.submit(
            &mut timers,
            0,
            node,
            0x2009,
            0,
            SdoRequestKind::BlockDownload(payload.clone()),
            DEFAULT_TIMEOUT_US,
        );
        // Initiate: ccs = 6, cc, s.
        assert_eq!(frames[0].payload()[0], 0xC6);
        assert_eq!(
            u32::from_le_bytes(frames[0].payload()[4..8].try_into().unwrap()),
            20
        );

        // Server accepts with blksize 127.
        let (frames, _) = client.handle_frame(
            &mut timers,
            5,
            node,
            &response(node, [0xA4, 0x09, 0x20, 0x00, 127, 0, 0, 0]),
        );
        // 20 bytes = 3 segments, last flagged.
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].payload()[0], 1);
        assert_eq!(frames[1].payload()[0], 2);
        assert_eq!(frames[2].payload()[0], 0x83);

        // Server acknowledges all 3 segments.
        let (frames, _) = client.handle_frame(
            &mut timers,
            6,
            node,
            &response(node, [0xA2, 3, 127, 0, 0, 0, 0, 0]),
        );
        // End-of-transfer with CRC.
        assert_eq!(frames.len(), 1);
        let end = frames[0].payload();
        assert_eq!(end[0], 0xC1 | (1 << 2));
        assert_eq!(u16::from_le_bytes([end[1], end[2]]), crc16(&payload));

        // Server confirms the end.
        let (_, completions) = client.handle_frame(
            &mut timers,
            7,
            node,
            &response(node, [0xA1, 0, 0, 0, 0, 0, 0, 0]),
        );
        assert_eq!(completions[0].result, Ok(Vec::new()));
        assert_eq!(promise.peek(), Some(Ok(Vec::new())));
    }

    #[test]
    fn test_dcf_download_chains_entries() {
        let mut client = SdoClient::new();
        let mut timers = TimerQueue::new();
        let node = NodeId(2);

        // Concise DCF: two entries.
        let mut dcf = Vec::new();
        dcf.extend_from_slice(&2u32.to_le_bytes());
        dcf.extend_from_slice(&0x1017u16.to_le_bytes());
        dcf.push(0);
        dcf.extend_from_slice(&2u32.to_le_bytes());
        dcf.extend_from_slice(&500u16.to_le_bytes());
        dcf.extend_from_slice(&0x2005u16.to_le_bytes());
        dcf.push(0);
        dcf.extend_from_slice(&1u32.to_le_bytes());
        dcf.push(0x42);

        let (_, promise, frames) = client
            .download_dcf(&mut timers, 0, node, &dcf)
            .unwrap();
        // First entry goes out immediately.
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0].payload()[1..4], &[0x17, 0x10, 0x00]);

        // Acknowledge the first download; the second starts, with no public
        // completion yet.
        let (frames, completions) = client.handle_frame(
            &mut timers,
            5,
            node,
            &response(node, [0x60, 0x17, 0x10, 0x00, 0, 0, 0, 0]),
        );
        assert!(completions.is_empty());
        assert_eq!(&frames[0].payload()[1..4], &[0x05, 0x20, 0x00]);
        assert!(!promise.is_resolved());

        // Acknowledge the second; the job completes.
        let (_, completions) = client.handle_frame(
            &mut timers,
            6,
            node,
            &response(node, [0x60, 0x05, 0x20, 0x00, 0, 0, 0, 0]),
        );
        assert_eq!(completions.len(), 1);
        assert_eq!(completions[0].result, Ok(Vec::new()));
        assert_eq!(promise.peek(), Some(Ok(Vec::new())));
    }

    #[test]
    fn test_dcf_download_fails_fast() {
        let mut client = SdoClient::new();
        let mut timers = TimerQueue::new();
        let node = NodeId(2);

        let mut dcf = Vec::new();
        dcf.extend_from_slice(&2u32.to_le_bytes());
        for index in [0x2000u16, 0x2001] {
            dcf.extend_from_slice(&index.to_le_bytes());
            dcf.push(0);
            dcf.extend_from_slice(&1u32.to_le_bytes());
            dcf.push(0x01);
        }

        let (_, promise, _) = client.download_dcf(&mut timers, 0, node, &dcf).unwrap();

        // First entry is rejected by the server.
        let mut abort = [0u8; 8];
        abort[0] = 0x80;
        abort[1] = 0x00;
        abort[2] = 0x20;
        abort[4..8].copy_from_slice(&AbortCode::NoWrite.as_u32().to_le_bytes());
        let (frames, completions) =
            client.handle_frame(&mut timers, 5, node, &response(node, abort));
        assert_eq!(
            completions[0].result,
            Err(CanOpenError::SdoAbort(AbortCode::NoWrite))
        );
        assert_eq!(
            promise.peek(),
            Some(Err(CanOpenError::SdoAbort(AbortCode::NoWrite)))
        );
        // The second entry is never attempted.
        assert!(frames.is_empty());
        assert!(!client.is_busy(node));
    }

    #[test]
    fn test_cancel_in_flight_sends_abort() {
        let mut client = SdoClient::new();
        let mut timers = TimerQueue::new();
        let node = NodeId(5);

        let (handle, promise, _) =
            client.download(&mut timers, 0, node, 0x2000, 0, alloc::vec![1]);
        let (frames, completions) = client.cancel(&mut timers, 1, handle);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload()[0], 0x80);
        assert_eq!(completions[0].result, Err(CanOpenError::Aborted));
        assert_eq!(promise.peek(), Some(Err(CanOpenError::Aborted)));
    }

    #[test]
    fn test_cancel_queued_is_silent() {
        let mut client = SdoClient::new();
        let mut timers = TimerQueue::new();
        let node = NodeId(5);

        client.download(&mut timers, 0, node, 0x2000, 0, alloc::vec![1]);
        let (handle, promise, _) = client.upload(&mut timers, 0, node, 0x2001, 0);
        let (frames, completions) = client.cancel(&mut timers, 1, handle);
        assert!(frames.is_empty());
        assert_eq!(completions[0].result, Err(CanOpenError::Aborted));
        assert_eq!(promise.peek(), Some(Err(CanOpenError::Aborted)));
        // The in-flight transfer is untouched.
        assert!(client.is_busy(node));
    }

    #[test]
    fn test_cancel_all_flushes_everything() {
        let mut client = SdoClient::new();
        let mut timers = TimerQueue::new();

        client.download(&mut timers, 0, NodeId(5), 0x2000, 0, alloc::vec![1]);
        client.upload(&mut timers, 0, NodeId(6), 0x2001, 0);
        client.upload(&mut timers, 0, NodeId(6), 0x2002, 0);

        let (frames, completions) =
            client.cancel_all(&mut timers, CanOpenError::Aborted, true);
        // Two in-flight aborts on the wire.
        assert_eq!(frames.len(), 2);
        assert_eq!(completions.len(), 3);
        assert!(completions
            .iter()
            .all(|completion| completion.result == Err(CanOpenError::Aborted)));
        assert!(timers.is_empty());
    }

    #[test]
    fn test_block_upload_final_segment_with_low_seqno() {
        let mut client = SdoClient::new();
        let mut timers = TimerQueue::new();
        let node = NodeId(2);
        // 135 bytes: 20 segments, the last one flagged -> byte 0 is 0x94,
        // whose top bits match the abort specifier.
        let payload: Vec<u8> = (0..135u16).map(|i| i as u8).collect();

        let (_, promise, _) = client.submit(
            &mut timers,
            0,
            node,
            0x2009,
            0,
            SdoRequestKind::BlockUpload,
            DEFAULT_TIMEOUT_US,
        );
        // Server accepts: scs = 6, sc, s, size = 135.
        let mut init = [0u8; 8];
        init[0] = 0xC6;
        init[1] = 0x09;
        init[2] = 0x20;
        init[4..8].copy_from_slice(&135u32.to_le_bytes());
        let (frames, _) = client.handle_frame(&mut timers, 1, node, &response(node, init));
        assert_eq!(frames[0].payload()[0], 0xA3);

        // Stream the 20 segments.
        let mut ack = Vec::new();
        for seqno in 1u8..=20 {
            let offset = (seqno as usize - 1) * 7;
            let chunk = (payload.len() - offset).min(7);
            let mut segment = [0u8; 8];
            segment[0] = seqno | if seqno == 20 { 0x80 } else { 0 };
            segment[1..1 + chunk].copy_from_slice(&payload[offset..offset + chunk]);
            let (frames, completions) =
                client.handle_frame(&mut timers, 2, node, &response(node, segment));
            assert!(completions.is_empty());
            if seqno < 20 {
                assert!(frames.is_empty());
            } else {
                ack = frames;
            }
        }
        // The final segment (0x94) is acknowledged, not read as an abort.
        assert_eq!(ack.len(), 1);
        assert_eq!(&ack[0].payload()[..2], &[0xA2, 20]);
        assert!(!promise.is_resolved());

        // End-of-transfer: n = 5 unused bytes, CRC over the payload.
        let mut end = [0u8; 8];
        end[0] = 0xC1 | (5 << 2);
        end[1..3].copy_from_slice(&crc16(&payload).to_le_bytes());
        let (frames, completions) =
            client.handle_frame(&mut timers, 3, node, &response(node, end));
        assert_eq!(frames[0].payload()[0], 0xA1);
        assert_eq!(completions[0].result, Ok(payload.clone()));
        assert_eq!(promise.peek(), Some(Ok(payload)));
    }

    #[test]
    fn test_block_upload_bare_abort_mid_stream() {
        let mut client = SdoClient::new();
        let mut timers = TimerQueue::new();
        let node = NodeId(2);

        let (_, promise, _) = client.submit(
            &mut timers,
            0,
            node,
            0x2009,
            0,
            SdoRequestKind::BlockUpload,
            DEFAULT_TIMEOUT_US,
        );
        let mut init = [0u8; 8];
        init[0] = 0xC6;
        init[4..8].copy_from_slice(&135u32.to_le_bytes());
        client.handle_frame(&mut timers, 1, node, &response(node, init));
        client.handle_frame(
            &mut timers,
            2,
            node,
            &response(node, [0x01, 0, 0, 0, 0, 0, 0, 0]),
        );

        // A genuine server abort is the bare 0x80.
        let mut abort = [0u8; 8];
        abort[0] = 0x80;
        abort[4..8].copy_from_slice(&AbortCode::DataDev.as_u32().to_le_bytes());
        let (_, completions) =
            client.handle_frame(&mut timers, 3, node, &response(node, abort));
        assert_eq!(
            completions[0].result,
            Err(CanOpenError::SdoAbort(AbortCode::DataDev))
        );
        assert_eq!(
            promise.peek(),
            Some(Err(CanOpenError::SdoAbort(AbortCode::DataDev)))
        );
        assert!(!client.is_busy(node));
    }
}
