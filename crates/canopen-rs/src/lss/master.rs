// crates/canopen-rs/src/lss/master.rs

//! The serialized LSS master: one FIFO queue, at most one request on the
//! wire, inhibit-time pacing between outgoing frames.

use super::{bit_rate_from_table, cs, LssAddress, LssMode, LssRequest, LssSub};
use crate::can::CanFrame;
use crate::exec::Promise;
use crate::hal::CanOpenError;
use crate::node::TimerEvent;
use crate::timer::{TimerHandle, TimerQueue};
use crate::types::{NodeId, COBID_LSS_REQUEST, COBID_LSS_RESPONSE};
use alloc::collections::VecDeque;
use alloc::vec::Vec;
use log::{debug, info, warn};

/// Default response timeout.
const DEFAULT_TIMEOUT_US: u64 = 100_000;

/// Default inhibit spacing between outgoing LSS frames.
const DEFAULT_INHIBIT_US: u64 = 100;

/// Upper bound of the inhibit time (u16 in 100 µs units).
const MAX_INHIBIT_US: u64 = 6_553_500;

/// Handle identifying a submitted LSS request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LssHandle(u64);

/// Successful completion values of the LSS operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LssOutcome {
    /// Unconfirmed or plainly confirmed operation finished.
    Done,
    /// A configuration service answered with its error byte
    /// (0 = success, 1 = out of range, 2 = storage failure).
    Configured { error: u8, spec_error: u8 },
    /// A 32-bit inquiry answered.
    Inquired(u32),
    /// The node-ID inquiry answered (0xFF reads back as `None`).
    InquiredNodeId(Option<NodeId>),
    /// Whether any non-configured slave responded in the timeout window.
    Identified(bool),
    /// Slowscan converged on a single slave.
    Resolved(LssAddress),
    /// Fastscan determined one address element.
    Scanned(u32),
    /// The bit-rate activation frame went out; the driver must now run the
    /// stop / set-bitrate / restart sequence with the given delay.
    BitRateActivation { delay_ms: u16, bit_rate_bps: u32 },
}

/// Result type of every LSS completion.
pub type LssResult = Result<LssOutcome, CanOpenError>;

struct Pending {
    handle: LssHandle,
    request: LssRequest,
    promise: Promise<LssResult>,
}

enum Phase {
    /// Unconfirmed service: completes when the frame has been emitted.
    Unconfirmed(LssOutcome),
    /// A simple confirmed service: one response frame with this CS.
    AwaitSimple { cs: u8 },
    AwaitInquire { cs: u8 },
    /// Switch-selective: all four select frames sent, waiting for 0x44.
    AwaitSelective,
    /// Identify-non-configured: waiting for any 0x50 until the timeout.
    AwaitIdentify,
    Slowscan(SlowscanState),
    Fastscan(FastscanState),
}

struct SlowscanState {
    vendor_id: u32,
    product_code: u32,
    /// Remaining search interval over `revision << 32 | serial`.
    lo: u64,
    hi: u64,
    /// Upper bound of the probe currently on the wire.
    probe_hi: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FastscanPhase {
    /// Initial probe with bit-check 0x80, confirming an unconfigured slave
    /// is present and resetting its scan state.
    Reset,
    /// Probing one bit: a response means the bit is 0.
    Bit(u8),
    /// Final confirm with lss_next advanced; a response locks the element.
    Confirm,
}

struct FastscanState {
    sub: LssSub,
    id: u32,
    mask: u32,
    phase: FastscanPhase,
}

/// The LSS master engine.
pub struct LssMaster {
    queue: VecDeque<Pending>,
    active: Option<(Pending, Phase)>,
    timeout_us: u64,
    inhibit_us: u64,
    /// Bit rate the bus currently runs at; required before bit-rate services.
    current_bit_rate_bps: u32,
    /// Bit rate selected by the last successful configure-bit-rate.
    pending_bit_rate_bps: Option<u32>,
    /// Earliest instant the next LSS frame may be sent.
    next_slot: u64,
    /// Frames held back by the inhibit time.
    backlog: VecDeque<CanFrame>,
    inhibit_timer: Option<TimerHandle>,
    response_timer: Option<TimerHandle>,
    /// Response timeout arms once the backlog drains.
    arm_on_drain: bool,
    next_handle: u64,
}

impl Default for LssMaster {
    fn default() -> Self {
        Self {
            queue: VecDeque::new(),
            active: None,
            timeout_us: DEFAULT_TIMEOUT_US,
            inhibit_us: DEFAULT_INHIBIT_US,
            current_bit_rate_bps: 0,
            pending_bit_rate_bps: None,
            next_slot: 0,
            backlog: VecDeque::new(),
            inhibit_timer: None,
            response_timer: None,
            arm_on_drain: false,
            next_handle: 0,
        }
    }
}

impl LssMaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides the response timeout.
    pub fn set_timeout_us(&mut self, timeout_us: u64) {
        self.timeout_us = timeout_us;
    }

    /// Sets the inhibit spacing; rounded up to the nearest multiple of
    /// 100 µs and capped at 6.5535 s.
    pub fn set_inhibit_us(&mut self, inhibit_us: u64) {
        self.inhibit_us = inhibit_us.div_ceil(100).min(MAX_INHIBIT_US / 100) * 100;
    }

    /// Tells the master the bit rate the bus currently runs at. Bit-rate
    /// services fail fast while this is zero.
    pub fn set_current_bit_rate(&mut self, bit_rate_bps: u32) {
        self.current_bit_rate_bps = bit_rate_bps;
    }

    /// Appends a request; if the queue was empty its protocol bytes go out
    /// immediately (subject to the inhibit pacing).
    pub fn submit(
        &mut self,
        request: LssRequest,
        timers: &mut TimerQueue<TimerEvent>,
        now: u64,
    ) -> (LssHandle, Promise<LssResult>, Vec<CanFrame>) {
        let handle = LssHandle(self.next_handle);
        self.next_handle += 1;
        let promise = Promise::new();

        // Fail-fast validation before anything is queued.
        if let Err(error) = self.validate(&request) {
            promise.resolve(Err(error));
            return (handle, promise, Vec::new());
        }

        self.queue.push_back(Pending {
            handle,
            request,
            promise: promise.clone(),
        });
        let frames = if self.active.is_none() {
            self.start_next(timers, now)
        } else {
            Vec::new()
        };
        (handle, promise, frames)
    }

    fn validate(&self, request: &LssRequest) -> Result<(), CanOpenError> {
        match request {
            LssRequest::ConfigureBitRate { table, index } => {
                if self.current_bit_rate_bps == 0 {
                    return Err(CanOpenError::InvalidArgument);
                }
                if bit_rate_from_table(*table, *index).is_none() {
                    return Err(CanOpenError::InvalidArgument);
                }
                Ok(())
            }
            LssRequest::ActivateBitRate { .. } => {
                if self.current_bit_rate_bps == 0 {
                    return Err(CanOpenError::InvalidArgument);
                }
                if self.pending_bit_rate_bps.is_none() {
                    return Err(CanOpenError::NotReady);
                }
                Ok(())
            }
            LssRequest::Slowscan { lo, hi } => {
                if lo.vendor_id != hi.vendor_id || lo.product_code != hi.product_code {
                    return Err(CanOpenError::InvalidArgument);
                }
                let lo_key = (lo.revision as u64) << 32 | lo.serial as u64;
                let hi_key = (hi.revision as u64) << 32 | hi.serial as u64;
                if lo_key > hi_key {
                    return Err(CanOpenError::InvalidArgument);
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Cancels one request. Pending entries are removed silently; the
    /// in-flight request additionally aborts the slave-side state by
    /// switching every slave back to waiting mode.
    pub fn cancel(
        &mut self,
        handle: LssHandle,
        timers: &mut TimerQueue<TimerEvent>,
        now: u64,
    ) -> Vec<CanFrame> {
        if let Some(position) = self.queue.iter().position(|entry| entry.handle == handle) {
            let entry = self.queue.remove(position).expect("indexed");
            entry.promise.resolve(Err(CanOpenError::Aborted));
            return Vec::new();
        }
        if self
            .active
            .as_ref()
            .is_some_and(|(entry, _)| entry.handle == handle)
        {
            let (entry, _) = self.active.take().expect("checked");
            debug!("[LSS] cancelling in-flight request");
            entry.promise.resolve(Err(CanOpenError::Aborted));
            self.disarm_response(timers);
            let mut frames = self.emit(
                alloc::vec![lss_frame(&[cs::SWITCH_GLOBAL, LssMode::Waiting as u8])],
                timers,
                now,
            );
            frames.extend(self.start_next(timers, now));
            return frames;
        }
        Vec::new()
    }

    /// Cancels everything, e.g. on shutdown.
    pub fn cancel_all(&mut self, timers: &mut TimerQueue<TimerEvent>, now: u64) -> Vec<CanFrame> {
        let mut frames = Vec::new();
        if let Some((entry, _)) = self.active.take() {
            entry.promise.resolve(Err(CanOpenError::Aborted));
            self.disarm_response(timers);
            frames.extend(self.emit(
                alloc::vec![lss_frame(&[cs::SWITCH_GLOBAL, LssMode::Waiting as u8])],
                timers,
                now,
            ));
        }
        while let Some(entry) = self.queue.pop_front() {
            entry.promise.resolve(Err(CanOpenError::Aborted));
        }
        frames
    }

    /// Pops the queue head and emits its opening frames.
    fn start_next(&mut self, timers: &mut TimerQueue<TimerEvent>, now: u64) -> Vec<CanFrame> {
        let Some(entry) = self.queue.pop_front() else {
            return Vec::new();
        };
        let (raw_frames, phase) = self.opening_frames(&entry.request);
        self.active = Some((entry, phase));
        let mut frames = self.emit(raw_frames, timers, now);
        // An unconfirmed service whose frame left immediately is complete;
        // backlogged ones resolve once the pacer drains (via the timeout).
        if self.backlog.is_empty() {
            if let Some((_, Phase::Unconfirmed(_))) = self.active.as_ref() {
                let Some((entry, Phase::Unconfirmed(outcome))) = self.active.take() else {
                    unreachable!();
                };
                self.complete(entry, Ok(outcome), timers);
                frames.extend(self.start_next(timers, now));
                return frames;
            }
        }
        self.after_send(timers, now);
        frames
    }

    /// Builds the first frame batch and the phase for a request.
    fn opening_frames(&mut self, request: &LssRequest) -> (Vec<CanFrame>, Phase) {
        match request {
            LssRequest::SwitchGlobal(mode) => (
                alloc::vec![lss_frame(&[cs::SWITCH_GLOBAL, *mode as u8])],
                Phase::Unconfirmed(LssOutcome::Done),
            ),
            LssRequest::SwitchSelective(address) => {
                let frames = alloc::vec![
                    lss_u32_frame(cs::SWITCH_SELECTIVE_VENDOR, address.vendor_id),
                    lss_u32_frame(cs::SWITCH_SELECTIVE_PRODUCT, address.product_code),
                    lss_u32_frame(cs::SWITCH_SELECTIVE_REVISION, address.revision),
                    lss_u32_frame(cs::SWITCH_SELECTIVE_SERIAL, address.serial),
                ];
                (frames, Phase::AwaitSelective)
            }
            LssRequest::ConfigureNodeId(node) => {
                let id = node.map(|node| node.0).unwrap_or(0xFF);
                (
                    alloc::vec![lss_frame(&[cs::CONFIGURE_NODE_ID, id])],
                    Phase::AwaitSimple {
                        cs: cs::CONFIGURE_NODE_ID,
                    },
                )
            }
            LssRequest::ConfigureBitRate { table, index } => (
                alloc::vec![lss_frame(&[cs::CONFIGURE_BIT_TIMING, *table, *index])],
                Phase::AwaitSimple {
                    cs: cs::CONFIGURE_BIT_TIMING,
                },
            ),
            LssRequest::ActivateBitRate { delay_ms } => {
                let delay = delay_ms.to_le_bytes();
                let bit_rate_bps = self.pending_bit_rate_bps.unwrap_or(0);
                (
                    alloc::vec![lss_frame(&[cs::ACTIVATE_BIT_TIMING, delay[0], delay[1]])],
                    Phase::Unconfirmed(LssOutcome::BitRateActivation {
                        delay_ms: *delay_ms,
                        bit_rate_bps,
                    }),
                )
            }
            LssRequest::StoreConfiguration => (
                alloc::vec![lss_frame(&[cs::STORE_CONFIGURATION])],
                Phase::AwaitSimple {
                    cs: cs::STORE_CONFIGURATION,
                },
            ),
            LssRequest::InquireVendorId => (
                alloc::vec![lss_frame(&[cs::INQUIRE_VENDOR])],
                Phase::AwaitInquire {
                    cs: cs::INQUIRE_VENDOR,
                },
            ),
            LssRequest::InquireProductCode => (
                alloc::vec![lss_frame(&[cs::INQUIRE_PRODUCT])],
                Phase::AwaitInquire {
                    cs: cs::INQUIRE_PRODUCT,
                },
            ),
            LssRequest::InquireRevision => (
                alloc::vec![lss_frame(&[cs::INQUIRE_REVISION])],
                Phase::AwaitInquire {
                    cs: cs::INQUIRE_REVISION,
                },
            ),
            LssRequest::InquireSerial => (
                alloc::vec![lss_frame(&[cs::INQUIRE_SERIAL])],
                Phase::AwaitInquire {
                    cs: cs::INQUIRE_SERIAL,
                },
            ),
            LssRequest::InquireNodeId => (
                alloc::vec![lss_frame(&[cs::INQUIRE_NODE_ID])],
                Phase::AwaitInquire {
                    cs: cs::INQUIRE_NODE_ID,
                },
            ),
            LssRequest::IdentifyNonConfigured => (
                alloc::vec![lss_frame(&[cs::IDENTIFY_NON_CONFIGURED])],
                Phase::AwaitIdentify,
            ),
            LssRequest::Slowscan { lo, hi } => {
                let state = SlowscanState {
                    vendor_id: lo.vendor_id,
                    product_code: lo.product_code,
                    lo: (lo.revision as u64) << 32 | lo.serial as u64,
                    hi: (hi.revision as u64) << 32 | hi.serial as u64,
                    probe_hi: 0,
                };
                let (frames, state) = slowscan_probe(state);
                (frames, Phase::Slowscan(state))
            }
            LssRequest::Fastscan { sub, address, mask } => {
                let state = FastscanState {
                    sub: *sub,
                    id: *address & !*mask,
                    mask: *mask,
                    phase: FastscanPhase::Reset,
                };
                let frames = alloc::vec![fastscan_frame(&state, 0x80, state.sub)];
                (frames, Phase::Fastscan(state))
            }
        }
    }

    /// Processes a slave-to-master frame (COB-ID 0x7E4).
    pub fn handle_frame(
        &mut self,
        frame: &CanFrame,
        timers: &mut TimerQueue<TimerEvent>,
        now: u64,
    ) -> Vec<CanFrame> {
        if frame.cob_id() != Some(COBID_LSS_RESPONSE) {
            return Vec::new();
        }
        let payload = frame.payload();
        if payload.len() < 8 {
            return Vec::new();
        }
        let Some((entry, phase)) = self.active.take() else {
            return Vec::new();
        };
        let command = payload[0];

        match phase {
            Phase::Unconfirmed(_) => {
                // No response expected; keep waiting for our own completion.
                self.active = Some((entry, phase));
                Vec::new()
            }
            Phase::AwaitSimple { cs: expected } => {
                if command != expected {
                    self.active = Some((entry, Phase::AwaitSimple { cs: expected }));
                    return Vec::new();
                }
                let outcome = LssOutcome::Configured {
                    error: payload[1],
                    spec_error: payload[2],
                };
                if expected == cs::CONFIGURE_BIT_TIMING && payload[1] == 0 {
                    if let LssRequest::ConfigureBitRate { table, index } = &entry.request {
                        self.pending_bit_rate_bps = bit_rate_from_table(*table, *index);
                    }
                }
                self.complete(entry, Ok(outcome), timers);
                self.start_next(timers, now)
            }
            Phase::AwaitInquire { cs: expected } => {
                if command != expected {
                    self.active = Some((entry, Phase::AwaitInquire { cs: expected }));
                    return Vec::new();
                }
                let outcome = if expected == cs::INQUIRE_NODE_ID {
                    LssOutcome::InquiredNodeId(NodeId::try_from(payload[1]).ok())
                } else {
                    LssOutcome::Inquired(u32::from_le_bytes([
                        payload[1], payload[2], payload[3], payload[4],
                    ]))
                };
                self.complete(entry, Ok(outcome), timers);
                self.start_next(timers, now)
            }
            Phase::AwaitSelective => {
                if command != cs::SWITCH_SELECTIVE_RESPONSE {
                    self.active = Some((entry, Phase::AwaitSelective));
                    return Vec::new();
                }
                self.complete(entry, Ok(LssOutcome::Done), timers);
                self.start_next(timers, now)
            }
            Phase::AwaitIdentify => {
                if command != cs::IDENTIFY_NON_CONFIGURED_SLAVE {
                    self.active = Some((entry, Phase::AwaitIdentify));
                    return Vec::new();
                }
                info!("[LSS] non-configured slave present");
                self.complete(entry, Ok(LssOutcome::Identified(true)), timers);
                self.start_next(timers, now)
            }
            Phase::Slowscan(mut state) => {
                if command != cs::IDENTIFY_SLAVE {
                    self.active = Some((entry, Phase::Slowscan(state)));
                    return Vec::new();
                }
                self.disarm_response(timers);
                if state.lo == state.hi {
                    let address = LssAddress {
                        vendor_id: state.vendor_id,
                        product_code: state.product_code,
                        revision: (state.lo >> 32) as u32,
                        serial: state.lo as u32,
                    };
                    info!("[LSS] slowscan resolved {:?}", address);
                    self.complete(entry, Ok(LssOutcome::Resolved(address)), timers);
                    return self.start_next(timers, now);
                }
                // A slave answered inside [lo, probe_hi]: narrow down.
                state.hi = state.probe_hi;
                let (frames, state) = slowscan_probe(state);
                self.active = Some((entry, Phase::Slowscan(state)));
                let frames = self.emit(frames, timers, now);
                self.after_send(timers, now);
                frames
            }
            Phase::Fastscan(mut state) => {
                if command != cs::IDENTIFY_SLAVE {
                    self.active = Some((entry, Phase::Fastscan(state)));
                    return Vec::new();
                }
                self.disarm_response(timers);
                match state.phase {
                    FastscanPhase::Reset => {
                        // A slave is listening; start probing the top bit.
                        let frames = self.next_fastscan_probe(&mut state, 31, timers, now);
                        self.active = Some((entry, Phase::Fastscan(state)));
                        frames
                    }
                    FastscanPhase::Bit(bit) => {
                        // Response: the probed bit is 0; id unchanged.
                        if bit == 0 {
                            let frames = self.fastscan_confirm(&mut state, timers, now);
                            self.active = Some((entry, Phase::Fastscan(state)));
                            frames
                        } else {
                            let frames =
                                self.next_fastscan_probe(&mut state, bit - 1, timers, now);
                            self.active = Some((entry, Phase::Fastscan(state)));
                            frames
                        }
                    }
                    FastscanPhase::Confirm => {
                        info!(
                            "[LSS] fastscan {:?} resolved {:#010X}",
                            state.sub, state.id
                        );
                        self.complete(entry, Ok(LssOutcome::Scanned(state.id)), timers);
                        self.start_next(timers, now)
                    }
                }
            }
        }
    }

    /// The response timeout fired.
    pub fn on_timeout(&mut self, timers: &mut TimerQueue<TimerEvent>, now: u64) -> Vec<CanFrame> {
        self.response_timer = None;
        let Some((entry, phase)) = self.active.take() else {
            return Vec::new();
        };
        match phase {
            Phase::Unconfirmed(outcome) => {
                // The pacer already flushed the frame; the grace period is
                // over and the operation is complete.
                self.complete(entry, Ok(outcome), timers);
                self.start_next(timers, now)
            }
            Phase::AwaitSimple { .. } | Phase::AwaitInquire { .. } | Phase::AwaitSelective => {
                warn!("[LSS] confirmed service timed out");
                self.complete(entry, Err(CanOpenError::Timeout), timers);
                self.start_next(timers, now)
            }
            Phase::AwaitIdentify => {
                self.complete(entry, Ok(LssOutcome::Identified(false)), timers);
                self.start_next(timers, now)
            }
            Phase::Slowscan(mut state) => {
                if state.lo == state.hi {
                    // The final verification went unanswered: no slave.
                    self.complete(entry, Err(CanOpenError::Timeout), timers);
                    return self.start_next(timers, now);
                }
                // No slave in [lo, probe_hi]: search the upper half.
                state.lo = state.probe_hi + 1;
                let (frames, state) = slowscan_probe(state);
                self.active = Some((entry, Phase::Slowscan(state)));
                let frames = self.emit(frames, timers, now);
                self.after_send(timers, now);
                frames
            }
            Phase::Fastscan(mut state) => match state.phase {
                FastscanPhase::Reset => {
                    // No unconfigured slave on the bus.
                    self.complete(entry, Err(CanOpenError::Timeout), timers);
                    self.start_next(timers, now)
                }
                FastscanPhase::Bit(bit) => {
                    // No response: the probed bit is 1.
                    state.id |= 1 << bit;
                    let frames = if bit == 0 {
                        self.fastscan_confirm(&mut state, timers, now)
                    } else {
                        self.next_fastscan_probe(&mut state, bit - 1, timers, now)
                    };
                    self.active = Some((entry, Phase::Fastscan(state)));
                    frames
                }
                FastscanPhase::Confirm => {
                    self.complete(entry, Err(CanOpenError::Timeout), timers);
                    self.start_next(timers, now)
                }
            },
        }
    }

    /// The inhibit spacing elapsed: flush the next backlogged frame.
    pub fn on_inhibit(&mut self, timers: &mut TimerQueue<TimerEvent>, now: u64) -> Vec<CanFrame> {
        self.inhibit_timer = None;
        let Some(frame) = self.backlog.pop_front() else {
            return Vec::new();
        };
        self.next_slot = now + self.inhibit_us;
        if self.backlog.is_empty() {
            if self.arm_on_drain {
                self.arm_on_drain = false;
                self.arm_response(timers, now);
            }
        } else {
            self.inhibit_timer =
                Some(timers.schedule(self.next_slot, TimerEvent::LssInhibit));
        }
        alloc::vec![frame]
    }

    /// True while a request is on the wire.
    pub fn is_busy(&self) -> bool {
        self.active.is_some()
    }

    // --- Internals ---

    /// Emits frames through the inhibit pacer: frames that fit the current
    /// slot go out now, the rest are backlogged behind an inhibit timer.
    fn emit(
        &mut self,
        frames: Vec<CanFrame>,
        timers: &mut TimerQueue<TimerEvent>,
        now: u64,
    ) -> Vec<CanFrame> {
        let mut out = Vec::new();
        for frame in frames {
            if self.backlog.is_empty() && now >= self.next_slot {
                self.next_slot = now + self.inhibit_us;
                out.push(frame);
            } else {
                self.backlog.push_back(frame);
            }
        }
        if !self.backlog.is_empty() && self.inhibit_timer.is_none() {
            self.inhibit_timer = Some(timers.schedule(self.next_slot, TimerEvent::LssInhibit));
        }
        out
    }

    /// Arms the response timeout, deferring it while frames are still
    /// backlogged.
    fn after_send(&mut self, timers: &mut TimerQueue<TimerEvent>, now: u64) {
        if self.active.is_none() {
            return;
        }
        if self.backlog.is_empty() {
            self.arm_response(timers, now);
        } else {
            self.arm_on_drain = true;
        }
    }

    fn arm_response(&mut self, timers: &mut TimerQueue<TimerEvent>, now: u64) {
        self.disarm_response(timers);
        self.response_timer = Some(timers.schedule(now + self.timeout_us, TimerEvent::LssTimeout));
    }

    fn disarm_response(&mut self, timers: &mut TimerQueue<TimerEvent>) {
        if let Some(handle) = self.response_timer.take() {
            timers.cancel(handle);
        }
        self.arm_on_drain = false;
    }

    fn complete(
        &mut self,
        entry: Pending,
        result: LssResult,
        timers: &mut TimerQueue<TimerEvent>,
    ) {
        self.disarm_response(timers);
        entry.promise.resolve(result);
    }

    fn next_fastscan_probe(
        &mut self,
        state: &mut FastscanState,
        mut bit: u8,
        timers: &mut TimerQueue<TimerEvent>,
        now: u64,
    ) -> Vec<CanFrame> {
        // Skip bits excluded from the scan; their value comes from the
        // caller-provided address.
        loop {
            if state.mask & (1 << bit) != 0 {
                break;
            }
            if bit == 0 {
                let frames = self.fastscan_confirm(state, timers, now);
                return frames;
            }
            bit -= 1;
        }
        state.phase = FastscanPhase::Bit(bit);
        let frames = self.emit(
            alloc::vec![fastscan_frame(state, bit, state.sub)],
            timers,
            now,
        );
        self.after_send_probe(timers, now);
        frames
    }

    fn fastscan_confirm(
        &mut self,
        state: &mut FastscanState,
        timers: &mut TimerQueue<TimerEvent>,
        now: u64,
    ) -> Vec<CanFrame> {
        state.phase = FastscanPhase::Confirm;
        let frames = self.emit(
            alloc::vec![fastscan_frame(state, 0, state.sub.next())],
            timers,
            now,
        );
        self.after_send_probe(timers, now);
        frames
    }

    /// Like `after_send`, usable while `self.active` is temporarily taken.
    fn after_send_probe(&mut self, timers: &mut TimerQueue<TimerEvent>, now: u64) {
        if self.backlog.is_empty() {
            self.arm_response(timers, now);
        } else {
            self.arm_on_drain = true;
        }
    }
}

/// Builds a master-to-slave LSS frame (8 data bytes, zero padded).
fn lss_frame(payload: &[u8]) -> CanFrame {
    let mut data = [0u8; 8];
    data[..payload.len()].copy_from_slice(payload);
    CanFrame {
        id: crate::can::CanId::Std(COBID_LSS_REQUEST),
        data,
        dlc: 8,
        rtr: false,
    }
}

fn lss_u32_frame(cs: u8, value: u32) -> CanFrame {
    let bytes = value.to_le_bytes();
    lss_frame(&[cs, bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn fastscan_frame(state: &FastscanState, bit_check: u8, next: LssSub) -> CanFrame {
    let id = state.id.to_le_bytes();
    lss_frame(&[
        cs::FASTSCAN,
        id[0],
        id[1],
        id[2],
        id[3],
        bit_check,
        state.sub as u8,
        next as u8,
    ])
}

/// Emits the six identify-remote-slave frames for `[lo, probe_hi]` and
/// records the probe bound.
fn slowscan_probe(mut state: SlowscanState) -> (Vec<CanFrame>, SlowscanState) {
    let mid = state.lo + (state.hi - state.lo) / 2;
    state.probe_hi = mid;
    let rev_lo = (state.lo >> 32) as u32;
    let rev_hi = (mid >> 32) as u32;
    let ser_lo = state.lo as u32;
    let ser_hi = mid as u32;
    let frames = alloc::vec![
        lss_u32_frame(cs::IDENTIFY_VENDOR, state.vendor_id),
        lss_u32_frame(cs::IDENTIFY_PRODUCT, state.product_code),
        lss_u32_frame(cs::IDENTIFY_REVISION_LO, rev_lo),
        lss_u32_frame(cs::IDENTIFY_REVISION_HI, rev_hi),
        lss_u32_frame(cs::IDENTIFY_SERIAL_LO, ser_lo),
        lss_u32_frame(cs::IDENTIFY_SERIAL_HI, ser_hi),
    ];
    (frames, state)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(payload: &[u8]) -> CanFrame {
        let mut data = [0u8; 8];
        data[..payload.len()].copy_from_slice(payload);
        CanFrame::new(COBID_LSS_RESPONSE, &data).unwrap()
    }

    #[test]
    fn test_switch_global_is_unconfirmed() {
        let mut timers = TimerQueue::new();
        let mut master = LssMaster::new();
        let (_, promise, frames) =
            master.submit(LssRequest::SwitchGlobal(LssMode::Configuration), &mut timers, 0);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].cob_id(), Some(0x7E5));
        assert_eq!(frames[0].payload()[0], 0x04);
        assert_eq!(frames[0].payload()[1], 0x01);
        // Completed without any response.
        assert_eq!(promise.peek(), Some(Ok(LssOutcome::Done)));
        assert!(!master.is_busy());
    }

    #[test]
    fn test_requests_are_serialized() {
        let mut timers = TimerQueue::new();
        let mut master = LssMaster::new();
        let (_, first, frames) =
            master.submit(LssRequest::ConfigureNodeId(Some(NodeId(7))), &mut timers, 0);
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0].payload()[..2], &[0x11, 0x07]);

        // A second request stays queued while the first is on the wire.
        let (_, second, frames) = master.submit(LssRequest::InquireNodeId, &mut timers, 10);
        assert!(frames.is_empty());
        assert!(master.is_busy());

        // Configure response: success.
        let frames = master.handle_frame(&response(&[0x11, 0, 0]), &mut timers, 200);
        assert_eq!(
            first.peek(),
            Some(Ok(LssOutcome::Configured {
                error: 0,
                spec_error: 0
            }))
        );
        // The inquiry went out right after.
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload()[0], 0x5E);

        master.handle_frame(&response(&[0x5E, 0x07, 0, 0, 0]), &mut timers, 400);
        assert_eq!(
            second.peek(),
            Some(Ok(LssOutcome::InquiredNodeId(Some(NodeId(7)))))
        );
    }

    #[test]
    fn test_inquire_vendor() {
        let mut timers = TimerQueue::new();
        let mut master = LssMaster::new();
        let (_, promise, _) = master.submit(LssRequest::InquireVendorId, &mut timers, 0);
        let bytes = 0x360u32.to_le_bytes();
        master.handle_frame(
            &response(&[0x5A, bytes[0], bytes[1], bytes[2], bytes[3]]),
            &mut timers,
            100,
        );
        assert_eq!(promise.peek(), Some(Ok(LssOutcome::Inquired(0x360))));
    }

    #[test]
    fn test_bit_rate_services_fail_fast_without_current_rate() {
        let mut timers = TimerQueue::new();
        let mut master = LssMaster::new();
        let (_, promise, frames) = master.submit(
            LssRequest::ConfigureBitRate { table: 0, index: 2 },
            &mut timers,
            0,
        );
        assert!(frames.is_empty());
        assert_eq!(promise.peek(), Some(Err(CanOpenError::InvalidArgument)));
        // Activate without a configured rate is NotReady even with a rate.
        master.set_current_bit_rate(500_000);
        let (_, promise, _) =
            master.submit(LssRequest::ActivateBitRate { delay_ms: 100 }, &mut timers, 0);
        assert_eq!(promise.peek(), Some(Err(CanOpenError::NotReady)));
    }

    #[test]
    fn test_configure_then_activate_bit_rate() {
        let mut timers = TimerQueue::new();
        let mut master = LssMaster::new();
        master.set_current_bit_rate(500_000);

        let (_, configure, _) = master.submit(
            LssRequest::ConfigureBitRate { table: 0, index: 4 },
            &mut timers,
            0,
        );
        master.handle_frame(&response(&[0x13, 0, 0]), &mut timers, 100);
        assert_eq!(
            configure.peek(),
            Some(Ok(LssOutcome::Configured {
                error: 0,
                spec_error: 0
            }))
        );

        let (_, activate, frames) =
            master.submit(LssRequest::ActivateBitRate { delay_ms: 200 }, &mut timers, 1_000);
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0].payload()[..3], &[0x15, 200, 0]);
        assert_eq!(
            activate.peek(),
            Some(Ok(LssOutcome::BitRateActivation {
                delay_ms: 200,
                bit_rate_bps: 125_000
            }))
        );
    }

    #[test]
    fn test_identify_non_configured() {
        let mut timers = TimerQueue::new();
        let mut master = LssMaster::new();

        // A slave responds.
        let (_, promise, _) = master.submit(LssRequest::IdentifyNonConfigured, &mut timers, 0);
        master.handle_frame(&response(&[0x50]), &mut timers, 100);
        assert_eq!(promise.peek(), Some(Ok(LssOutcome::Identified(true))));

        // Nobody responds.
        let (_, promise, _) =
            master.submit(LssRequest::IdentifyNonConfigured, &mut timers, 1_000);
        master.on_timeout(&mut timers, 101_000);
        assert_eq!(promise.peek(), Some(Ok(LssOutcome::Identified(false))));
    }

    #[test]
    fn test_switch_selective_paced_by_inhibit() {
        let mut timers = TimerQueue::new();
        let mut master = LssMaster::new();
        let address = LssAddress::new(0x360, 0x2, 0x3, 0x4);
        let (_, _, frames) =
            master.submit(LssRequest::SwitchSelective(address), &mut timers, 0);
        // Only the first frame fits the first slot; the rest are paced.
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload()[0], 0x40);

        let mut sent = Vec::new();
        let mut now = 0;
        while let Some(deadline) = timers.next_deadline() {
            now = deadline;
            match timers.pop_due(now) {
                Some(TimerEvent::LssInhibit) => sent.extend(master.on_inhibit(&mut timers, now)),
                Some(TimerEvent::LssTimeout) => break,
                other => panic!("unexpected timer {:?}", other),
            }
        }
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[0].payload()[0], 0x41);
        assert_eq!(sent[1].payload()[0], 0x42);
        assert_eq!(sent[2].payload()[0], 0x43);

        // Confirmation completes the request.
        let frames = master.handle_frame(&response(&[0x44]), &mut timers, now + 50);
        assert!(frames.is_empty());
        assert!(!master.is_busy());
    }

    #[test]
    fn test_cancel_queued_and_in_flight() {
        let mut timers = TimerQueue::new();
        let mut master = LssMaster::new();
        let (head, head_promise, _) =
            master.submit(LssRequest::InquireSerial, &mut timers, 0);
        let (queued, queued_promise, _) =
            master.submit(LssRequest::InquireRevision, &mut timers, 0);

        // Queued: removed silently.
        let frames = master.cancel(queued, &mut timers, 10);
        assert!(frames.is_empty());
        assert_eq!(queued_promise.peek(), Some(Err(CanOpenError::Aborted)));

        // Head: the slave-side state is reset via switch-global(waiting).
        let frames = master.cancel(head, &mut timers, 200);
        assert_eq!(head_promise.peek(), Some(Err(CanOpenError::Aborted)));
        assert!(frames
            .iter()
            .any(|frame| frame.payload()[0] == 0x04 && frame.payload()[1] == 0x00));
    }

    /// Drives the master against a scripted slave until the promise
    /// resolves, alternating emitted frames and timeouts.
    fn drive_scan(
        master: &mut LssMaster,
        timers: &mut TimerQueue<TimerEvent>,
        promise: &Promise<LssResult>,
        mut initial: Vec<CanFrame>,
        mut slave_responds: impl FnMut(&CanFrame) -> bool,
    ) {
        let mut now = 0u64;
        let mut respond = initial.iter().any(&mut slave_responds);
        initial.clear();
        for _ in 0..2_000 {
            if promise.is_resolved() {
                return;
            }
            now += 1_000;
            let frames = if respond {
                master.handle_frame(&response(&[cs::IDENTIFY_SLAVE]), timers, now)
            } else {
                // Let the response timeout fire.
                let deadline = timers.next_deadline().expect("armed timeout");
                now = deadline.max(now);
                match timers.pop_due(now) {
                    Some(TimerEvent::LssTimeout) => master.on_timeout(timers, now),
                    Some(TimerEvent::LssInhibit) => master.on_inhibit(timers, now),
                    other => panic!("unexpected timer {:?}", other),
                }
            };
            respond = frames.iter().any(&mut slave_responds);
        }
        panic!("scan did not converge");
    }

    #[test]
    fn test_fastscan_resolves_element() {
        let mut timers = TimerQueue::new();
        let mut master = LssMaster::new();
        master.set_inhibit_us(0);
        let slave_value: u32 = 0x360;

        let (_, promise, frames) = master.submit(
            LssRequest::Fastscan {
                sub: LssSub::Vendor,
                address: 0,
                mask: 0xFFFF_FFFF,
            },
            &mut timers,
            0,
        );

        let slave = move |frame: &CanFrame| {
            let payload = frame.payload();
            if payload[0] != cs::FASTSCAN {
                return false;
            }
            let id = u32::from_le_bytes([payload[1], payload[2], payload[3], payload[4]]);
            let bit_check = payload[5];
            match bit_check {
                0x80 => true,
                0 => {
                    if payload[7] != payload[6] {
                        // Confirm frame: exact match required.
                        id == slave_value
                    } else {
                        id >> 0 == slave_value
                    }
                }
                1..=31 => (id >> bit_check) == (slave_value >> bit_check),
                _ => false,
            }
        };
        drive_scan(&mut master, &mut timers, &promise, frames, slave);
        assert_eq!(promise.peek(), Some(Ok(LssOutcome::Scanned(0x360))));
    }

    #[test]
    fn test_fastscan_without_slave_times_out() {
        let mut timers = TimerQueue::new();
        let mut master = LssMaster::new();
        let (_, promise, _) = master.submit(
            LssRequest::Fastscan {
                sub: LssSub::Vendor,
                address: 0,
                mask: 0xFFFF_FFFF,
            },
            &mut timers,
            0,
        );
        master.on_timeout(&mut timers, 100_000);
        assert_eq!(promise.peek(), Some(Err(CanOpenError::Timeout)));
    }

    #[test]
    fn test_slowscan_bisects_to_single_slave() {
        let mut timers = TimerQueue::new();
        let mut master = LssMaster::new();
        master.set_inhibit_us(0);

        let slave = LssAddress::new(0x360, 0x2, 0x3, 0x4);
        let lo = LssAddress::new(0x360, 0x2, 0x3, 0x0);
        let hi = LssAddress::new(0x360, 0x2, 0x3, 0xFF);
        let (_, promise, frames) =
            master.submit(LssRequest::Slowscan { lo, hi }, &mut timers, 0);

        // The scripted slave collects each probe's range and answers when
        // its own key falls inside.
        let mut range = [0u32; 4]; // rev_lo, rev_hi, ser_lo, ser_hi
        let slave_key = (slave.revision as u64) << 32 | slave.serial as u64;
        let responder = move |frame: &CanFrame| {
            let payload = frame.payload();
            let value = u32::from_le_bytes([payload[1], payload[2], payload[3], payload[4]]);
            match payload[0] {
                cs::IDENTIFY_REVISION_LO => {
                    range[0] = value;
                    false
                }
                cs::IDENTIFY_REVISION_HI => {
                    range[1] = value;
                    false
                }
                cs::IDENTIFY_SERIAL_LO => {
                    range[2] = value;
                    false
                }
                cs::IDENTIFY_SERIAL_HI => {
                    let lo_key = (range[0] as u64) << 32 | range[2] as u64;
                    let hi_key = (range[1] as u64) << 32 | value as u64;
                    (lo_key..=hi_key).contains(&slave_key)
                }
                _ => false,
            }
        };
        drive_scan(&mut master, &mut timers, &promise, frames, responder);
        assert_eq!(promise.peek(), Some(Ok(LssOutcome::Resolved(slave))));
    }

    #[test]
    fn test_slowscan_rejects_mismatched_bounds() {
        let mut timers = TimerQueue::new();
        let mut master = LssMaster::new();
        let lo = LssAddress::new(1, 2, 0, 0);
        let hi = LssAddress::new(9, 2, 0, 0);
        let (_, promise, frames) =
            master.submit(LssRequest::Slowscan { lo, hi }, &mut timers, 0);
        assert!(frames.is_empty());
        assert_eq!(promise.peek(), Some(Err(CanOpenError::InvalidArgument)));
    }

    #[test]
    fn test_inhibit_rounding() {
        let mut master = LssMaster::new();
        master.set_inhibit_us(250);
        assert_eq!(master.inhibit_us, 300);
        master.set_inhibit_us(10_000_000);
        assert_eq!(master.inhibit_us, MAX_INHIBIT_US);
    }
}
