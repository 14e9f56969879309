// crates/canopen-rs/src/sdo/server.rs

use super::{abort_payload, ccs, crc16, multiplexer, scs, AbortCode, DEFAULT_TIMEOUT_US, MAX_BLKSIZE};
use crate::can::CanFrame;
use crate::node::TimerEvent;
use crate::od::ObjectDictionary;
use crate::timer::{TimerHandle, TimerQueue};
use crate::types::NodeId;
use alloc::vec::Vec;
use log::{debug, trace, warn};

/// The state of the single server transaction.
///
/// Transactions are keyed by the (client-to-server, server-to-client)
/// COB-ID pair; one server instance serves one pair.
#[derive(Debug, Default)]
enum ServerState {
    #[default]
    Idle,
    SegmentedDownload(DownloadState),
    SegmentedUpload(UploadState),
    BlockDownload(BlockDownloadState),
    /// All sub-blocks received; waiting for the end-of-transfer request.
    BlockDownloadEnd(BlockDownloadState),
    /// Block upload initiated; waiting for the start command.
    BlockUploadStart(BlockUploadState),
    /// Sub-block sent; waiting for the client's acknowledgement.
    BlockUploadAck(BlockUploadState),
    /// End-of-transfer sent; waiting for the closing acknowledgement.
    BlockUploadEnd(BlockUploadState),
}

#[derive(Debug)]
struct DownloadState {
    index: u16,
    sub_index: u8,
    toggle: bool,
    expected_size: Option<usize>,
    buffer: Vec<u8>,
}

#[derive(Debug)]
struct UploadState {
    index: u16,
    sub_index: u8,
    toggle: bool,
    data: Vec<u8>,
    offset: usize,
}

#[derive(Debug)]
struct BlockDownloadState {
    index: u16,
    sub_index: u8,
    crc_enabled: bool,
    next_seqno: u8,
    blksize: u8,
    buffer: Vec<u8>,
}

#[derive(Debug)]
struct BlockUploadState {
    index: u16,
    sub_index: u8,
    crc_enabled: bool,
    data: Vec<u8>,
    /// Offset of the first byte of the sub-block currently on the wire.
    offset: usize,
    blksize: u8,
    /// Segments sent in the current sub-block.
    segments_sent: u8,
}

/// The SDO server: answers remote requests against the local dictionary.
///
/// Supports expedited, segmented and block transfer. One transaction at a
/// time; a new initiate while busy aborts the old transaction first.
pub struct SdoServer {
    rx_cob_id: u16,
    tx_cob_id: u16,
    timeout_us: u64,
    state: ServerState,
    timer: Option<TimerHandle>,
}

impl SdoServer {
    /// Creates a server on the default SDO channel of `node_id`
    /// (0x600 + id / 0x580 + id).
    pub fn new(node_id: NodeId) -> Self {
        Self {
            rx_cob_id: node_id.sdo_request_cob_id(),
            tx_cob_id: node_id.sdo_response_cob_id(),
            timeout_us: DEFAULT_TIMEOUT_US,
            state: ServerState::Idle,
            timer: None,
        }
    }

    /// The client-to-server COB-ID this server listens on.
    pub fn rx_cob_id(&self) -> u16 {
        self.rx_cob_id
    }

    /// Overrides the per-segment timeout.
    pub fn set_timeout_us(&mut self, timeout_us: u64) {
        self.timeout_us = timeout_us;
    }

    /// Aborts any ongoing transaction, e.g. on NMT reset-communication.
    pub fn reset(&mut self, timers: &mut TimerQueue<TimerEvent>) -> Vec<CanFrame> {
        self.disarm(timers);
        match core::mem::take(&mut self.state) {
            ServerState::Idle => Vec::new(),
            state => {
                let (index, sub_index) = state_multiplexer(&state);
                debug!("[SDO] server transaction aborted by reset");
                alloc::vec![self.abort_frame(index, sub_index, AbortCode::DataDev)]
            }
        }
    }

    /// The per-segment timeout fired.
    pub fn on_timeout(&mut self, timers: &mut TimerQueue<TimerEvent>) -> Vec<CanFrame> {
        self.timer = None;
        self.disarm(timers);
        match core::mem::take(&mut self.state) {
            ServerState::Idle => Vec::new(),
            state => {
                let (index, sub_index) = state_multiplexer(&state);
                warn!(
                    "[SDO] server timeout on {:#06X}:{:#04X}",
                    index, sub_index
                );
                alloc::vec![self.abort_frame(index, sub_index, AbortCode::Timeout)]
            }
        }
    }

    /// Processes one client-to-server frame.
    pub fn handle_frame(
        &mut self,
        od: &mut ObjectDictionary,
        timers: &mut TimerQueue<TimerEvent>,
        frame: &CanFrame,
        now: u64,
    ) -> Vec<CanFrame> {
        let data = frame.payload();
        if data.len() != 8 {
            // Malformed SDO frames are dropped without a reply.
            return Vec::new();
        }

        let command = data[0];
        // During a block download byte 0 carries `last << 7 | seqno`, so
        // the top bits of a final segment (seqno <= 31) mimic the abort
        // specifier; those states recognize the bare 0x80 themselves.
        let block_download_phase = matches!(
            self.state,
            ServerState::BlockDownload(_) | ServerState::BlockDownloadEnd(_)
        );
        let response = match core::mem::take(&mut self.state) {
            ServerState::Idle => self.handle_idle(od, data),
            ServerState::SegmentedDownload(state) => self.handle_download_segment(od, data, state),
            ServerState::SegmentedUpload(state) => self.handle_upload_segment(data, state),
            ServerState::BlockDownload(state) => self.handle_block_segment(data, state),
            ServerState::BlockDownloadEnd(state) => self.handle_block_end(od, data, state),
            ServerState::BlockUploadStart(state) => self.handle_block_upload_start(data, state),
            ServerState::BlockUploadAck(state) => self.handle_block_upload_ack(data, state),
            ServerState::BlockUploadEnd(state) => self.handle_block_upload_end(data, state),
        };

        // Abort from the client kills the transaction without a reply.
        if !block_download_phase && command >> 5 == ccs::ABORT {
            trace!("[SDO] client abort received");
            self.state = ServerState::Idle;
            self.disarm(timers);
            return Vec::new();
        }

        if matches!(self.state, ServerState::Idle) {
            self.disarm(timers);
        } else {
            self.rearm(timers, now);
        }
        response
    }

    // --- Idle: initiate requests ---

    fn handle_idle(&mut self, od: &mut ObjectDictionary, data: &[u8]) -> Vec<CanFrame> {
        let command = data[0];
        let (index, sub_index) = multiplexer(data);
        match command >> 5 {
            ccs::DOWNLOAD_INITIATE => self.initiate_download(od, command, index, sub_index, data),
            ccs::UPLOAD_INITIATE => self.initiate_upload(od, index, sub_index),
            ccs::BLOCK_DOWNLOAD if command & 0x01 == 0 => {
                self.initiate_block_download(command, index, sub_index)
            }
            ccs::BLOCK_UPLOAD if command & 0x03 == 0 => {
                self.initiate_block_upload(od, command, index, sub_index, data)
            }
            ccs::ABORT => Vec::new(),
            _ => alloc::vec![self.abort_frame(index, sub_index, AbortCode::NoCs)],
        }
    }

    fn initiate_download(
        &mut self,
        od: &mut ObjectDictionary,
        command: u8,
        index: u16,
        sub_index: u8,
        data: &[u8],
    ) -> Vec<CanFrame> {
        let expedited = command & 0x02 != 0;
        let size_indicated = command & 0x01 != 0;
        if expedited {
            let len = if size_indicated {
                4 - ((command >> 2) & 0x03) as usize
            } else {
                4
            };
            return match od.download(index, sub_index, &data[4..4 + len]) {
                Ok(()) => alloc::vec![self.response_frame(index, sub_index, scs::DOWNLOAD_INITIATE)],
                Err(code) => alloc::vec![self.abort_frame(index, sub_index, code)],
            };
        }

        let expected_size = if size_indicated {
            Some(u32::from_le_bytes([data[4], data[5], data[6], data[7]]) as usize)
        } else {
            None
        };
        self.state = ServerState::SegmentedDownload(DownloadState {
            index,
            sub_index,
            toggle: false,
            expected_size,
            buffer: Vec::new(),
        });
        alloc::vec![self.response_frame(index, sub_index, scs::DOWNLOAD_INITIATE)]
    }

    fn handle_download_segment(
        &mut self,
        od: &mut ObjectDictionary,
        data: &[u8],
        mut state: DownloadState,
    ) -> Vec<CanFrame> {
        let command = data[0];
        if command >> 5 != ccs::DOWNLOAD_SEGMENT {
            if command >> 5 == ccs::ABORT {
                return Vec::new();
            }
            return alloc::vec![self.abort_frame(state.index, state.sub_index, AbortCode::NoCs)];
        }
        let toggle = command & 0x10 != 0;
        if toggle != state.toggle {
            return alloc::vec![self.abort_frame(state.index, state.sub_index, AbortCode::Toggle)];
        }
        let unused = ((command >> 1) & 0x07) as usize;
        state.buffer.extend_from_slice(&data[1..8 - unused]);

        let mut response = [0u8; 8];
        response[0] = (scs::DOWNLOAD_SEGMENT << 5) | if toggle { 0x10 } else { 0 };
        let reply = self.frame(response);

        if command & 0x01 != 0 {
            // Last segment: commit.
            if let Some(expected) = state.expected_size {
                if state.buffer.len() != expected {
                    let code = if state.buffer.len() > expected {
                        AbortCode::TypeLenHi
                    } else {
                        AbortCode::TypeLenLo
                    };
                    return alloc::vec![self.abort_frame(state.index, state.sub_index, code)];
                }
            }
            return match od.download(state.index, state.sub_index, &state.buffer) {
                Ok(()) => alloc::vec![reply],
                Err(code) => {
                    alloc::vec![self.abort_frame(state.index, state.sub_index, code)]
                }
            };
        }

        state.toggle = !state.toggle;
        self.state = ServerState::SegmentedDownload(state);
        alloc::vec![reply]
    }

    fn initiate_upload(
        &mut self,
        od: &mut ObjectDictionary,
        index: u16,
        sub_index: u8,
    ) -> Vec<CanFrame> {
        let data = match od.upload(index, sub_index) {
            Ok(data) => data,
            Err(code) => return alloc::vec![self.abort_frame(index, sub_index, code)],
        };
        if data.len() <= 4 {
            let n = (4 - data.len()) as u8;
            let mut response = [0u8; 8];
            response[0] = (scs::UPLOAD_INITIATE << 5) | (n << 2) | 0x03;
            response[1] = (index & 0xFF) as u8;
            response[2] = (index >> 8) as u8;
            response[3] = sub_index;
            response[4..4 + data.len()].copy_from_slice(&data);
            return alloc::vec![self.frame(response)];
        }

        let mut response = [0u8; 8];
        response[0] = (scs::UPLOAD_INITIATE << 5) | 0x01;
        response[1] = (index & 0xFF) as u8;
        response[2] = (index >> 8) as u8;
        response[3] = sub_index;
        response[4..8].copy_from_slice(&(data.len() as u32).to_le_bytes());
        self.state = ServerState::SegmentedUpload(UploadState {
            index,
            sub_index,
            toggle: false,
            data,
            offset: 0,
        });
        alloc::vec![self.frame(response)]
    }

    fn handle_upload_segment(&mut self, data: &[u8], mut state: UploadState) -> Vec<CanFrame> {
        let command = data[0];
        if command >> 5 != ccs::UPLOAD_SEGMENT {
            if command >> 5 == ccs::ABORT {
                return Vec::new();
            }
            return alloc::vec![self.abort_frame(state.index, state.sub_index, AbortCode::NoCs)];
        }
        let toggle = command & 0x10 != 0;
        if toggle != state.toggle {
            return alloc::vec![self.abort_frame(state.index, state.sub_index, AbortCode::Toggle)];
        }

        let remaining = state.data.len() - state.offset;
        let chunk = remaining.min(7);
        let last = remaining <= 7;
        let mut response = [0u8; 8];
        response[0] = (scs::UPLOAD_SEGMENT << 5)
            | if toggle { 0x10 } else { 0 }
            | (((7 - chunk) as u8) << 1)
            | last as u8;
        response[1..1 + chunk].copy_from_slice(&state.data[state.offset..state.offset + chunk]);
        state.offset += chunk;

        if !last {
            state.toggle = !state.toggle;
            self.state = ServerState::SegmentedUpload(state);
        }
        alloc::vec![self.frame(response)]
    }

    // --- Block download ---

    fn initiate_block_download(&mut self, command: u8, index: u16, sub_index: u8) -> Vec<CanFrame> {
        let crc_enabled = command & 0x04 != 0;
        let mut response = [0u8; 8];
        response[0] = (scs::BLOCK_DOWNLOAD << 5) | 0x04; // sc = CRC supported, ss = 0
        response[1] = (index & 0xFF) as u8;
        response[2] = (index >> 8) as u8;
        response[3] = sub_index;
        response[4] = MAX_BLKSIZE;
        self.state = ServerState::BlockDownload(BlockDownloadState {
            index,
            sub_index,
            crc_enabled,
            next_seqno: 1,
            blksize: MAX_BLKSIZE,
            buffer: Vec::new(),
        });
        alloc::vec![self.frame(response)]
    }

    fn handle_block_segment(
        &mut self,
        data: &[u8],
        mut state: BlockDownloadState,
    ) -> Vec<CanFrame> {
        // Sequence numbers are 1..=127, so the bare 0x80 can only be a
        // client abort. Leaving the state taken ends the transaction.
        if data[0] == 0x80 {
            trace!("[SDO] client abort during block download");
            return Vec::new();
        }
        let last = data[0] & 0x80 != 0;
        let seqno = data[0] & 0x7F;
        if seqno != state.next_seqno {
            return alloc::vec![self.abort_frame(state.index, state.sub_index, AbortCode::BlkSeq)];
        }
        state.buffer.extend_from_slice(&data[1..8]);

        if last || seqno == state.blksize {
            let mut response = [0u8; 8];
            response[0] = (scs::BLOCK_DOWNLOAD << 5) | 0x02; // ss = 2: block response
            response[1] = seqno;
            response[2] = state.blksize;
            state.next_seqno = 1;
            self.state = if last {
                ServerState::BlockDownloadEnd(state)
            } else {
                ServerState::BlockDownload(state)
            };
            return alloc::vec![self.frame(response)];
        }

        state.next_seqno += 1;
        self.state = ServerState::BlockDownload(state);
        Vec::new()
    }

    fn handle_block_end(
        &mut self,
        od: &mut ObjectDictionary,
        data: &[u8],
        mut state: BlockDownloadState,
    ) -> Vec<CanFrame> {
        let command = data[0];
        if command >> 5 != ccs::BLOCK_DOWNLOAD || command & 0x01 == 0 {
            if command >> 5 == ccs::ABORT {
                return Vec::new();
            }
            return alloc::vec![self.abort_frame(state.index, state.sub_index, AbortCode::NoCs)];
        }
        // n = bytes of the last segment that carry no data.
        let unused = ((command >> 2) & 0x07) as usize;
        state.buffer.truncate(state.buffer.len() - unused);

        if state.crc_enabled {
            let received = u16::from_le_bytes([data[1], data[2]]);
            let computed = crc16(&state.buffer);
            if received != computed {
                warn!(
                    "[SDO] block download CRC mismatch: got {:#06X}, computed {:#06X}",
                    received, computed
                );
                return alloc::vec![self.abort_frame(
                    state.index,
                    state.sub_index,
                    AbortCode::BlkCrc
                )];
            }
        }

        match od.download(state.index, state.sub_index, &state.buffer) {
            Ok(()) => {
                let mut response = [0u8; 8];
                response[0] = (scs::BLOCK_DOWNLOAD << 5) | 0x01; // ss = 1: end response
                alloc::vec![self.frame(response)]
            }
            Err(code) => alloc::vec![self.abort_frame(state.index, state.sub_index, code)],
        }
    }

    // --- Block upload ---

    fn initiate_block_upload(
        &mut self,
        od: &mut ObjectDictionary,
        command: u8,
        index: u16,
        sub_index: u8,
        data: &[u8],
    ) -> Vec<CanFrame> {
        let crc_enabled = command & 0x04 != 0;
        let blksize = data[4];
        if blksize == 0 || blksize > MAX_BLKSIZE {
            return alloc::vec![self.abort_frame(index, sub_index, AbortCode::BlkSize)];
        }
        let upload = match od.upload(index, sub_index) {
            Ok(upload) => upload,
            Err(code) => return alloc::vec![self.abort_frame(index, sub_index, code)],
        };

        let mut response = [0u8; 8];
        response[0] = (scs::BLOCK_UPLOAD << 5) | 0x04 | 0x02; // sc = CRC, s = size indicated
        response[1] = (index & 0xFF) as u8;
        response[2] = (index >> 8) as u8;
        response[3] = sub_index;
        response[4..8].copy_from_slice(&(upload.len() as u32).to_le_bytes());
        self.state = ServerState::BlockUploadStart(BlockUploadState {
            index,
            sub_index,
            crc_enabled,
            data: upload,
            offset: 0,
            blksize,
            segments_sent: 0,
        });
        alloc::vec![self.frame(response)]
    }

    fn handle_block_upload_start(
        &mut self,
        data: &[u8],
        state: BlockUploadState,
    ) -> Vec<CanFrame> {
        let command = data[0];
        if command >> 5 != ccs::BLOCK_UPLOAD || command & 0x03 != 0x03 {
            if command >> 5 == ccs::ABORT {
                return Vec::new();
            }
            return alloc::vec![self.abort_frame(state.index, state.sub_index, AbortCode::NoCs)];
        }
        self.send_sub_block(state)
    }

    fn handle_block_upload_ack(
        &mut self,
        data: &[u8],
        mut state: BlockUploadState,
    ) -> Vec<CanFrame> {
        let command = data[0];
        if command >> 5 != ccs::BLOCK_UPLOAD || command & 0x03 != 0x02 {
            if command >> 5 == ccs::ABORT {
                return Vec::new();
            }
            return alloc::vec![self.abort_frame(state.index, state.sub_index, AbortCode::NoCs)];
        }
        let ackseq = data[1];
        let new_blksize = data[2];
        if new_blksize == 0 || new_blksize > MAX_BLKSIZE {
            return alloc::vec![self.abort_frame(state.index, state.sub_index, AbortCode::BlkSize)];
        }
        if ackseq != state.segments_sent {
            // The client saw fewer segments than we sent; resend from the
            // first unacknowledged one.
            debug!(
                "[SDO] block upload ack {} of {} segments; rewinding",
                ackseq, state.segments_sent
            );
        }
        state.offset += ackseq as usize * 7;
        state.blksize = new_blksize;
        state.segments_sent = 0;

        if state.offset >= state.data.len() {
            // Everything acknowledged: send end-of-transfer.
            let total = state.data.len();
            let unused = (7 - (total % 7)) % 7;
            let mut response = [0u8; 8];
            response[0] = (scs::BLOCK_UPLOAD << 5) | ((unused as u8) << 2) | 0x01; // es = 1
            if state.crc_enabled {
                response[1..3].copy_from_slice(&crc16(&state.data).to_le_bytes());
            }
            self.state = ServerState::BlockUploadEnd(state);
            return alloc::vec![self.frame(response)];
        }
        self.send_sub_block(state)
    }

    fn handle_block_upload_end(&mut self, data: &[u8], state: BlockUploadState) -> Vec<CanFrame> {
        let command = data[0];
        if command >> 5 == ccs::BLOCK_UPLOAD && command & 0x03 == 0x01 {
            trace!("[SDO] block upload complete ({} bytes)", state.data.len());
            return Vec::new();
        }
        if command >> 5 == ccs::ABORT {
            return Vec::new();
        }
        alloc::vec![self.abort_frame(state.index, state.sub_index, AbortCode::NoCs)]
    }

    /// Emits one sub-block of up to `blksize` segments.
    fn send_sub_block(&mut self, mut state: BlockUploadState) -> Vec<CanFrame> {
        let mut frames = Vec::new();
        let mut offset = state.offset;
        for seqno in 1..=state.blksize {
            let remaining = state.data.len() - offset;
            let chunk = remaining.min(7);
            let last = remaining <= 7;
            let mut segment = [0u8; 8];
            segment[0] = seqno | if last { 0x80 } else { 0 };
            segment[1..1 + chunk].copy_from_slice(&state.data[offset..offset + chunk]);
            frames.push(self.frame(segment));
            offset += chunk;
            state.segments_sent = seqno;
            if last {
                break;
            }
        }
        self.state = ServerState::BlockUploadAck(state);
        frames
    }

    // --- Helpers ---

    fn response_frame(&self, index: u16, sub_index: u8, scs: u8) -> CanFrame {
        let mut data = [0u8; 8];
        data[0] = scs << 5;
        data[1] = (index & 0xFF) as u8;
        data[2] = (index >> 8) as u8;
        data[3] = sub_index;
        self.frame(data)
    }

    fn abort_frame(&self, index: u16, sub_index: u8, code: AbortCode) -> CanFrame {
        debug!(
            "[SDO] server abort {:#06X}:{:#04X}: {}",
            index, sub_index, code
        );
        self.frame(abort_payload(index, sub_index, code))
    }

    fn frame(&self, data: [u8; 8]) -> CanFrame {
        CanFrame::new(self.tx_cob_id, &data).unwrap_or(CanFrame {
            id: crate::can::CanId::Std(self.tx_cob_id),
            data,
            dlc: 8,
            rtr: false,
        })
    }

    fn rearm(&mut self, timers: &mut TimerQueue<TimerEvent>, now: u64) {
        self.disarm(timers);
        self.timer = Some(timers.schedule(now + self.timeout_us, TimerEvent::SdoServer));
    }

    fn disarm(&mut self, timers: &mut TimerQueue<TimerEvent>) {
        if let Some(handle) = self.timer.take() {
            timers.cancel(handle);
        }
    }
}

fn state_multiplexer(state: &ServerState) -> (u16, u8) {
    match state {
        ServerState::Idle => (0, 0),
        ServerState::SegmentedDownload(s) => (s.index, s.sub_index),
        ServerState::SegmentedUpload(s) => (s.index, s.sub_index),
        ServerState::BlockDownload(s) | ServerState::BlockDownloadEnd(s) => (s.index, s.sub_index),
        ServerState::BlockUploadStart(s)
        | ServerState::BlockUploadAck(s)
        | ServerState::BlockUploadEnd(s) => (s.index, s.sub_index),
    }
}
