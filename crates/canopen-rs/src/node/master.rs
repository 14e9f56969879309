// crates/canopen-rs/src/node/master.rs

use super::{NodeAction, Notification, TimerEvent};
use crate::can::{CanFrame, FrameDispatcher, FrameFilter};
use crate::emcy::{EmcyEngine, EmcyRecord};
use crate::exec::{Executor, Promise};
use crate::hal::{BusState, CanOpenError, ErrorInfo};
use crate::lss::{LssHandle, LssMaster, LssRequest, LssResult};
use crate::nmt::boot::{BootEngine, BootOutcome, BootRequest};
use crate::nmt::heartbeat::{HeartbeatConsumer, HeartbeatEvent, HeartbeatProducer, NodeGuard};
use crate::nmt::master::{NmtMaster, SlaveState};
use crate::nmt::redundancy::{RedundancyEvent, RedundancyManager};
use crate::nmt::states::{NmtCommand, NmtState};
use crate::od::{self, ObjectDictionary};
use crate::pdo::{Rpdo, RpdoOutcome, Tpdo};
use crate::sdo::client::{SdoClient, SdoCompletion, SdoHandle, SdoResult};
use crate::sdo::server::SdoServer;
use crate::sync::SyncEngine;
use crate::timer::TimerQueue;
use crate::timestamp::TimeStampEngine;
use crate::types::{NodeId, COBID_HEARTBEAT_BASE, COBID_LSS_RESPONSE, COBID_NMT, COBID_SDO_TX_BASE};
use alloc::collections::BTreeMap;
use alloc::rc::Rc;
use alloc::vec::Vec;
use core::cell::Cell;
use log::{debug, info, warn};

/// Frame-routing endpoints registered with the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Endpoint {
    Nmt,
    Sync,
    Time,
    Emcy,
    Heartbeat,
    SdoServer,
    SdoClient,
    Lss,
    Rpdo(u16),
    TpdoRtr(u16),
}

/// A complete CANopen master node: one object dictionary, one frame
/// dispatcher, one timer queue, one executor and one set of protocol
/// engines, all driven sans-IO.
///
/// The embedding program owns the CAN driver and the clock: it feeds
/// received frames into `process_frame`, pumps `tick` when
/// `next_action_time` is due, performs the returned `NodeAction`s, and
/// drains the executor between calls.
pub struct MasterNode {
    node_id: NodeId,
    od: ObjectDictionary,
    timers: TimerQueue<TimerEvent>,
    exec: Executor,
    dispatcher: FrameDispatcher<Endpoint>,
    nmt: NmtMaster,
    hb_producer: HeartbeatProducer,
    hb_consumer: HeartbeatConsumer,
    node_guard: NodeGuard,
    boot: BootEngine,
    redundancy: RedundancyManager,
    emcy: EmcyEngine,
    sync: SyncEngine,
    timestamp: TimeStampEngine,
    sdo_server: SdoServer,
    sdo_client: SdoClient,
    lss: LssMaster,
    rpdos: Vec<Rpdo>,
    tpdos: Vec<Tpdo>,
    /// In-flight SDO transfers owned by the boot engine, by slave.
    boot_sdo: BTreeMap<NodeId, SdoHandle>,
    /// Set by the 0x1003:0 download indication; drained after each call.
    history_clear: Rc<Cell<bool>>,
    bus_state: BusState,
}

impl MasterNode {
    /// Creates a node around a prepared object dictionary. Missing
    /// communication-profile objects are seeded with defaults. The node
    /// starts in `Initializing`; call `start` to run the boot cascade.
    pub fn new(mut od: ObjectDictionary, node_id: NodeId) -> Self {
        od::predefined::populate(&mut od, node_id);
        let history_clear = Rc::new(Cell::new(false));
        let flag = Rc::clone(&history_clear);
        od.set_download_indication(
            0x1003,
            0,
            alloc::boxed::Box::new(move |_, _, data| {
                EmcyEngine::validate_history_write(data)?;
                flag.set(true);
                Ok(None)
            }),
        );

        Self {
            node_id,
            od,
            timers: TimerQueue::new(),
            exec: Executor::new(),
            dispatcher: FrameDispatcher::new(),
            nmt: NmtMaster::new(node_id),
            hb_producer: HeartbeatProducer::new(node_id),
            hb_consumer: HeartbeatConsumer::new(),
            node_guard: NodeGuard::new(),
            boot: BootEngine::new(),
            redundancy: RedundancyManager::new(),
            emcy: EmcyEngine::new(node_id),
            sync: SyncEngine::new(),
            timestamp: TimeStampEngine::new(),
            sdo_server: SdoServer::new(node_id),
            sdo_client: SdoClient::new(),
            lss: LssMaster::new(),
            rpdos: Vec::new(),
            tpdos: Vec::new(),
            boot_sdo: BTreeMap::new(),
            history_clear,
            bus_state: BusState::Active,
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn nmt_state(&self) -> NmtState {
        self.nmt.state()
    }

    pub fn od(&self) -> &ObjectDictionary {
        &self.od
    }

    pub fn od_mut(&mut self) -> &mut ObjectDictionary {
        &mut self.od
    }

    /// The cooperative task queue application callbacks run on. Drain it
    /// between node calls; tasks never run inside them.
    pub fn executor(&mut self) -> &mut Executor {
        &mut self.exec
    }

    /// The tracked state of a configured slave.
    pub fn slave_state(&self, node: NodeId) -> Option<SlaveState> {
        self.nmt.slave_state(node)
    }

    /// The absolute timestamp of the next scheduled event, for the
    /// embedder's sleep loop.
    pub fn next_action_time(&self) -> Option<u64> {
        self.timers.next_deadline()
    }

    /// Runs the power-on cascade: reset-application, reset-communication,
    /// boot-up emission, PRE-OPERATIONAL.
    pub fn start(&mut self, now: u64) -> Vec<NodeAction> {
        self.apply_nmt_local(NmtCommand::ResetNode, now)
    }

    // --- Application services ---

    /// Issues an NMT command. `target == None` broadcasts; broadcast and
    /// self-addressed commands also drive the local state machine.
    pub fn request_nmt(
        &mut self,
        command: NmtCommand,
        target: Option<NodeId>,
        now: u64,
    ) -> Vec<NodeAction> {
        let mut actions = Vec::new();
        if let Some(frame) = self.nmt.command_frame(command, target) {
            actions.push(NodeAction::SendFrame(frame));
        }
        let local = target.is_none() || target == Some(self.node_id);
        if local {
            actions.extend(self.apply_nmt_local(command, now));
        }
        actions
    }

    /// Queues an SDO download (write) to a remote node.
    pub fn sdo_download(
        &mut self,
        node: NodeId,
        index: u16,
        sub_index: u8,
        data: Vec<u8>,
        now: u64,
    ) -> (SdoHandle, Promise<SdoResult>, Vec<NodeAction>) {
        let (handle, promise, frames) =
            self.sdo_client
                .download(&mut self.timers, now, node, index, sub_index, data);
        (handle, promise, send_all(frames))
    }

    /// Queues an SDO upload (read) from a remote node.
    pub fn sdo_upload(
        &mut self,
        node: NodeId,
        index: u16,
        sub_index: u8,
        now: u64,
    ) -> (SdoHandle, Promise<SdoResult>, Vec<NodeAction>) {
        let (handle, promise, frames) =
            self.sdo_client
                .upload(&mut self.timers, now, node, index, sub_index);
        (handle, promise, send_all(frames))
    }

    /// Queues a transfer with an explicit protocol (e.g. block mode).
    pub fn sdo_submit(
        &mut self,
        node: NodeId,
        index: u16,
        sub_index: u8,
        kind: crate::sdo::client::SdoRequestKind,
        timeout_us: u64,
        now: u64,
    ) -> (SdoHandle, Promise<SdoResult>, Vec<NodeAction>) {
        let (handle, promise, frames) = self.sdo_client.submit(
            &mut self.timers,
            now,
            node,
            index,
            sub_index,
            kind,
            timeout_us,
        );
        (handle, promise, send_all(frames))
    }

    /// Downloads a concise DCF to a remote node, entry by entry.
    pub fn sdo_download_dcf(
        &mut self,
        node: NodeId,
        dcf: &[u8],
        now: u64,
    ) -> Result<(SdoHandle, Promise<SdoResult>, Vec<NodeAction>), CanOpenError> {
        let (handle, promise, frames) =
            self.sdo_client.download_dcf(&mut self.timers, now, node, dcf)?;
        Ok((handle, promise, send_all(frames)))
    }

    /// Cancels an SDO request; the in-flight one aborts on the wire.
    pub fn sdo_cancel(&mut self, handle: SdoHandle, now: u64) -> Vec<NodeAction> {
        let (frames, completions) = self.sdo_client.cancel(&mut self.timers, now, handle);
        let mut actions = send_all(frames);
        actions.extend(self.route_sdo_completions(completions, now));
        actions
    }

    /// Submits an LSS request to the serialized master queue.
    pub fn lss_submit(
        &mut self,
        request: LssRequest,
        now: u64,
    ) -> (LssHandle, Promise<LssResult>, Vec<NodeAction>) {
        let (handle, promise, frames) = self.lss.submit(request, &mut self.timers, now);
        (handle, promise, send_all(frames))
    }

    /// Cancels an LSS request.
    pub fn lss_cancel(&mut self, handle: LssHandle, now: u64) -> Vec<NodeAction> {
        send_all(self.lss.cancel(handle, &mut self.timers, now))
    }

    /// Tells the LSS master the bus bit rate, enabling bit-rate services.
    pub fn lss_set_current_bit_rate(&mut self, bit_rate_bps: u32) {
        self.lss.set_current_bit_rate(bit_rate_bps);
    }

    /// Fires an application event on a TPDO (event-driven and
    /// acyclic-synchronous transmission types).
    pub fn tpdo_event(&mut self, number: u16, now: u64) -> Vec<NodeAction> {
        if self.nmt.state() != NmtState::Operational {
            return Vec::new();
        }
        let mut actions = Vec::new();
        for tpdo in &mut self.tpdos {
            if tpdo.number() == number {
                actions.extend(send_all(tpdo.event(&mut self.od, &mut self.timers, now)));
            }
        }
        actions
    }

    /// Produces an emergency frame and records it in the error history.
    pub fn produce_emcy(&mut self, record: EmcyRecord) -> Vec<NodeAction> {
        send_all(self.emcy.produce(&mut self.od, record))
    }

    /// Registers interest in emergencies from a producer node.
    pub fn consume_emcy_from(&mut self, producer: NodeId) {
        self.emcy.consume_from(producer);
    }

    /// Starts node-guarding a slave (the legacy error-control alternative).
    pub fn guard_slave(
        &mut self,
        node: NodeId,
        guard_time_ms: u16,
        life_factor: u8,
        now: u64,
    ) {
        self.node_guard
            .guard(node, guard_time_ms, life_factor, &mut self.timers, now);
    }

    /// Arms the bus-toggle redundancy protocol.
    pub fn configure_redundancy(
        &mut self,
        ntoggle: u8,
        ttoggle: u8,
        ctoggle: u8,
        period_us: u64,
        now: u64,
    ) {
        self.redundancy
            .configure(ntoggle, ttoggle, ctoggle, period_us, &mut self.timers, now);
    }

    /// Cancels every outstanding request on every queue and drains the
    /// executor. Call before dropping the node.
    pub fn shutdown(&mut self, now: u64) -> Vec<NodeAction> {
        info!("[NODE] shutting down");
        let mut actions = Vec::new();
        let (frames, completions) =
            self.sdo_client
                .cancel_all(&mut self.timers, CanOpenError::Aborted, true);
        actions.extend(send_all(frames));
        actions.extend(self.route_sdo_completions(completions, now));
        actions.extend(send_all(self.lss.cancel_all(&mut self.timers, now)));
        for tpdo in &mut self.tpdos {
            tpdo.deactivate(&mut self.timers);
        }
        self.exec.cancel_all();
        self.timers.clear();
        actions
    }

    // --- Driver-facing surface ---

    /// Routes one received frame through the dispatcher. Invalid frames are
    /// silently discarded.
    pub fn process_frame(&mut self, frame: &CanFrame, now: u64) -> Vec<NodeAction> {
        let mut actions = Vec::new();
        for endpoint in self.dispatcher.lookup(frame) {
            self.dispatch(endpoint, frame, now, &mut actions);
        }
        self.drain_history_clear();
        actions
    }

    /// Pumps the timer queue: every due timer fires in deadline order.
    pub fn tick(&mut self, now: u64) -> Vec<NodeAction> {
        let mut actions = Vec::new();
        while let Some(event) = self.timers.pop_due(now) {
            self.dispatch_timer(event, now, &mut actions);
        }
        actions
    }

    /// The CAN driver reported a controller state change.
    pub fn on_bus_state(&mut self, state: BusState, now: u64) -> Vec<NodeAction> {
        let previous = core::mem::replace(&mut self.bus_state, state);
        if previous == state {
            return Vec::new();
        }
        let mut actions = Vec::new();
        match state {
            BusState::BusOff => {
                warn!("[NODE] bus-off: failing in-flight operations");
                // No abort frames: the bus is gone.
                let (_, completions) =
                    self.sdo_client
                        .cancel_all(&mut self.timers, CanOpenError::BusError, false);
                actions.extend(self.route_sdo_completions(completions, now));
                for outcome in self.boot.on_bus_off(&mut self.timers) {
                    actions.extend(self.finish_boot(outcome, now));
                }
                for tpdo in &mut self.tpdos {
                    tpdo.deactivate(&mut self.timers);
                }
            }
            BusState::Active => {
                info!("[NODE] bus recovered");
                if self.nmt.state() == NmtState::Operational {
                    for tpdo in &mut self.tpdos {
                        tpdo.activate(&mut self.timers, now);
                    }
                }
            }
            BusState::Passive => {
                warn!("[NODE] controller error-passive");
            }
        }
        actions
    }

    // --- Frame dispatch ---

    fn dispatch(
        &mut self,
        endpoint: Endpoint,
        frame: &CanFrame,
        now: u64,
        actions: &mut Vec<NodeAction>,
    ) {
        match endpoint {
            Endpoint::Nmt => {
                if let Some(command) = self.nmt.handle_frame(frame) {
                    actions.extend(self.apply_nmt_local(command, now));
                }
            }
            Endpoint::Sync => {
                let counter = self.sync.handle_frame(frame);
                actions.push(NodeAction::Notify(Notification::Sync { counter }));
                if self.nmt.state() == NmtState::Operational {
                    for rpdo in &mut self.rpdos {
                        if rpdo.on_sync(&mut self.od) == RpdoOutcome::Committed {
                            actions.push(NodeAction::Notify(Notification::RpdoWrite {
                                pdo: rpdo.number(),
                            }));
                        }
                    }
                    for tpdo in &mut self.tpdos {
                        let frames =
                            tpdo.on_sync(&mut self.od, &mut self.timers, counter, now);
                        actions.extend(send_all(frames));
                    }
                }
            }
            Endpoint::Time => {
                if let Some(time) = self.timestamp.handle_frame(frame) {
                    actions.push(NodeAction::Notify(Notification::TimeStamp {
                        millis: time.millis,
                        days: time.days,
                    }));
                }
            }
            Endpoint::Emcy => {
                let Some(cob_id) = frame.cob_id() else {
                    return;
                };
                let Ok(producer) = NodeId::try_from((cob_id & 0x7F) as u8) else {
                    return;
                };
                if let Some(record) = self.emcy.handle_frame(producer, frame) {
                    actions.push(NodeAction::Notify(Notification::Emergency {
                        node: producer,
                        record,
                    }));
                }
            }
            Endpoint::Heartbeat => {
                let Some(cob_id) = frame.cob_id() else {
                    return;
                };
                let Ok(node) = NodeId::try_from((cob_id - COBID_HEARTBEAT_BASE) as u8) else {
                    return;
                };
                self.node_guard.handle_response(node, frame);
                self.redundancy.on_heartbeat();
                let events = self
                    .hb_consumer
                    .handle_frame(node, frame, &mut self.timers, now);
                for event in events {
                    self.apply_heartbeat_event(event, now, actions);
                }
            }
            Endpoint::SdoServer => {
                if self.nmt.state() == NmtState::Stopped {
                    return;
                }
                let frames =
                    self.sdo_server
                        .handle_frame(&mut self.od, &mut self.timers, frame, now);
                actions.extend(send_all(frames));
            }
            Endpoint::SdoClient => {
                let Some(cob_id) = frame.cob_id() else {
                    return;
                };
                let Ok(node) = NodeId::try_from((cob_id - COBID_SDO_TX_BASE) as u8) else {
                    return;
                };
                let (frames, completions) =
                    self.sdo_client
                        .handle_frame(&mut self.timers, now, node, frame);
                actions.extend(send_all(frames));
                actions.extend(self.route_sdo_completions(completions, now));
            }
            Endpoint::Lss => {
                let frames = self.lss.handle_frame(frame, &mut self.timers, now);
                actions.extend(send_all(frames));
            }
            Endpoint::Rpdo(number) => {
                if self.nmt.state() != NmtState::Operational {
                    return;
                }
                for rpdo in &mut self.rpdos {
                    if rpdo.number() == number {
                        match rpdo.handle_frame(&mut self.od, frame) {
                            RpdoOutcome::Committed => {
                                actions.push(NodeAction::Notify(Notification::RpdoWrite {
                                    pdo: number,
                                }));
                            }
                            RpdoOutcome::LengthError => {
                                actions.push(NodeAction::Notify(
                                    Notification::RpdoLengthError {
                                        pdo: number,
                                        dlc: frame.dlc,
                                    },
                                ));
                            }
                            RpdoOutcome::Buffered | RpdoOutcome::None => {}
                        }
                    }
                }
            }
            Endpoint::TpdoRtr(number) => {
                if self.nmt.state() != NmtState::Operational {
                    return;
                }
                for tpdo in &mut self.tpdos {
                    if tpdo.number() == number {
                        let frames = tpdo.on_rtr(&mut self.od, &mut self.timers, now);
                        actions.extend(send_all(frames));
                    }
                }
            }
        }
    }

    fn dispatch_timer(&mut self, event: TimerEvent, now: u64, actions: &mut Vec<NodeAction>) {
        match event {
            TimerEvent::HeartbeatProduce => {
                let frames = self
                    .hb_producer
                    .on_timer(self.nmt.state(), &mut self.timers, now);
                actions.extend(send_all(frames));
            }
            TimerEvent::HeartbeatConsumer(node) => {
                for event in self.hb_consumer.on_timeout(node) {
                    self.apply_heartbeat_event(event, now, actions);
                }
            }
            TimerEvent::NodeGuardPoll(node) => {
                let (frames, events) = self.node_guard.on_poll(node, &mut self.timers, now);
                actions.extend(send_all(frames));
                for event in events {
                    self.apply_heartbeat_event(event, now, actions);
                }
            }
            TimerEvent::NodeGuardExpired(node) => {
                actions.push(NodeAction::Notify(Notification::NodeGuardingTimeout(node)));
            }
            TimerEvent::SyncProduce => {
                let frames = self.sync.on_timer(&mut self.timers, now);
                let produced = !frames.is_empty();
                let counter = frames
                    .first()
                    .and_then(|frame| frame.payload().first().copied());
                // The SYNC frame leaves first; the local producer's SYNC
                // also drives the local PDOs.
                actions.extend(send_all(frames));
                if produced && self.nmt.state() == NmtState::Operational {
                    for rpdo in &mut self.rpdos {
                        if rpdo.on_sync(&mut self.od) == RpdoOutcome::Committed {
                            actions.push(NodeAction::Notify(Notification::RpdoWrite {
                                pdo: rpdo.number(),
                            }));
                        }
                    }
                    for tpdo in &mut self.tpdos {
                        let emitted = tpdo.on_sync(&mut self.od, &mut self.timers, counter, now);
                        actions.extend(send_all(emitted));
                    }
                }
            }
            TimerEvent::TimeProduce => {
                let frames = self.timestamp.on_timer(&mut self.timers, now);
                actions.extend(send_all(frames));
            }
            TimerEvent::SdoServer => {
                let frames = self.sdo_server.on_timeout(&mut self.timers);
                actions.extend(send_all(frames));
            }
            TimerEvent::SdoClient(node) => {
                let (frames, completions) =
                    self.sdo_client.on_timeout(&mut self.timers, now, node);
                actions.extend(send_all(frames));
                actions.extend(self.route_sdo_completions(completions, now));
            }
            TimerEvent::TpdoEventTimer(number) => {
                if self.nmt.state() != NmtState::Operational {
                    return;
                }
                for tpdo in &mut self.tpdos {
                    if tpdo.number() == number {
                        let frames =
                            tpdo.on_event_timer(&mut self.od, &mut self.timers, now);
                        actions.extend(send_all(frames));
                    }
                }
            }
            TimerEvent::TpdoInhibit(number) => {
                for tpdo in &mut self.tpdos {
                    if tpdo.number() == number {
                        let frames =
                            tpdo.on_inhibit_elapsed(&mut self.od, &mut self.timers, now);
                        actions.extend(send_all(frames));
                    }
                }
            }
            TimerEvent::LssTimeout => {
                let frames = self.lss.on_timeout(&mut self.timers, now);
                actions.extend(send_all(frames));
            }
            TimerEvent::LssInhibit => {
                let frames = self.lss.on_inhibit(&mut self.timers, now);
                actions.extend(send_all(frames));
            }
            TimerEvent::BootStep(node) => {
                // Abandon the boot-owned transfer before failing the job.
                if let Some(handle) = self.boot_sdo.remove(&node) {
                    let (frames, _) = self.sdo_client.cancel(&mut self.timers, now, handle);
                    actions.extend(send_all(frames));
                }
                for outcome in self.boot.on_timeout(node) {
                    actions.extend(self.finish_boot(outcome, now));
                }
            }
            TimerEvent::RedundancyWindow => {
                for event in self.redundancy.on_window(&mut self.timers, now) {
                    match event {
                        RedundancyEvent::SwitchChannel { alternate } => {
                            actions.push(NodeAction::Notify(Notification::BusChannelSwitch {
                                alternate,
                            }));
                        }
                        RedundancyEvent::ToggleBudgetExhausted => {
                            actions.extend(self.produce_emcy(EmcyRecord {
                                error_code: 0x8100, // communication error
                                error_register: 0x10,
                                manufacturer_info: [0; 5],
                            }));
                        }
                    }
                }
            }
        }
    }

    // --- NMT orchestration ---

    fn apply_nmt_local(&mut self, command: NmtCommand, now: u64) -> Vec<NodeAction> {
        let mut actions = Vec::new();
        match command {
            NmtCommand::ResetNode | NmtCommand::ResetCommunication => {
                // Outstanding transfers abort on any communication reset.
                let frames = self.sdo_server.reset(&mut self.timers);
                actions.extend(send_all(frames));
                let (frames, completions) =
                    self.sdo_client
                        .cancel_all(&mut self.timers, CanOpenError::Aborted, true);
                actions.extend(send_all(frames));
                actions.extend(self.route_sdo_completions(completions, now));

                self.nmt.reset(&mut self.od, command);
                actions.extend(self.reset_communication(now));
                actions.push(NodeAction::Notify(Notification::NmtStateChange(
                    NmtState::PreOperational,
                )));
            }
            NmtCommand::Start => {
                if self.nmt.apply_local(command).is_some() {
                    for tpdo in &mut self.tpdos {
                        tpdo.activate(&mut self.timers, now);
                    }
                    actions.push(NodeAction::Notify(Notification::NmtStateChange(
                        NmtState::Operational,
                    )));
                }
            }
            NmtCommand::Stop | NmtCommand::EnterPreOperational => {
                if let Some(state) = self.nmt.apply_local(command) {
                    for tpdo in &mut self.tpdos {
                        tpdo.deactivate(&mut self.timers);
                    }
                    for rpdo in &mut self.rpdos {
                        rpdo.deactivate();
                    }
                    actions.push(NodeAction::Notify(Notification::NmtStateChange(state)));
                }
            }
        }
        actions
    }

    /// Re-initialises every engine from the dictionary and re-registers the
    /// frame filters. The boot-up frame is emitted last.
    fn reset_communication(&mut self, now: u64) -> Vec<NodeAction> {
        let mut actions = Vec::new();

        self.nmt.configure(&self.od);
        self.sync.configure(&self.od, &mut self.timers, now);
        self.timestamp.configure(&self.od, &mut self.timers, now);
        self.hb_producer.configure(&self.od, &mut self.timers, now);
        self.hb_consumer.configure(&self.od, &mut self.timers, now);

        // Rebuild the PDO instances from the communication parameters.
        for tpdo in &mut self.tpdos {
            tpdo.deactivate(&mut self.timers);
        }
        self.rpdos.clear();
        self.tpdos.clear();
        for number in 1..=512u16 {
            match Rpdo::from_od(&self.od, number) {
                Ok(Some(rpdo)) => self.rpdos.push(rpdo),
                Ok(None) => {}
                Err(code) => warn!("[NODE] RPDO {} misconfigured: {}", number, code),
            }
            match Tpdo::from_od(&self.od, number) {
                Ok(Some(tpdo)) => self.tpdos.push(tpdo),
                Ok(None) => {}
                Err(code) => warn!("[NODE] TPDO {} misconfigured: {}", number, code),
            }
        }

        self.rebuild_dispatcher();
        debug!(
            "[NODE] communication reset: {} RPDO(s), {} TPDO(s)",
            self.rpdos.len(),
            self.tpdos.len()
        );

        if let Some(frame) = self.hb_producer.boot_up_frame() {
            actions.push(NodeAction::SendFrame(frame));
        }
        actions
    }

    fn rebuild_dispatcher(&mut self) {
        self.dispatcher.clear();
        self.dispatcher
            .register(FrameFilter::exact(COBID_NMT), Endpoint::Nmt);
        self.dispatcher
            .register(FrameFilter::exact(self.sync.cob_id()), Endpoint::Sync);
        if self.timestamp.is_consuming() {
            self.dispatcher
                .register(FrameFilter::exact(self.timestamp.cob_id()), Endpoint::Time);
        }
        self.dispatcher
            .register(FrameFilter::function(0x080), Endpoint::Emcy);
        self.dispatcher
            .register(FrameFilter::function(COBID_HEARTBEAT_BASE), Endpoint::Heartbeat);
        self.dispatcher.register(
            FrameFilter::exact(self.sdo_server.rx_cob_id()),
            Endpoint::SdoServer,
        );
        self.dispatcher
            .register(FrameFilter::function(COBID_SDO_TX_BASE), Endpoint::SdoClient);
        self.dispatcher
            .register(FrameFilter::exact(COBID_LSS_RESPONSE), Endpoint::Lss);
        for rpdo in &self.rpdos {
            self.dispatcher
                .register(FrameFilter::exact(rpdo.cob_id()), Endpoint::Rpdo(rpdo.number()));
        }
        for tpdo in &self.tpdos {
            self.dispatcher.register(
                FrameFilter {
                    cob_id: tpdo.cob_id(),
                    mask: 0x7FF,
                    rtr: Some(true),
                },
                Endpoint::TpdoRtr(tpdo.number()),
            );
        }
    }

    // --- Error control and boot plumbing ---

    fn apply_heartbeat_event(
        &mut self,
        event: HeartbeatEvent,
        now: u64,
        actions: &mut Vec<NodeAction>,
    ) {
        match event {
            HeartbeatEvent::BootUp(node) => {
                actions.push(NodeAction::Notify(Notification::BootUp(node)));
                if node == self.node_id {
                    return;
                }
                self.nmt.set_slave_state(node, SlaveState::Booting);
                let assignment = self.nmt.assignment(node);
                let (requests, outcomes) =
                    self.boot
                        .start(&self.od, node, assignment, &mut self.timers, now);
                self.run_boot_requests(node, requests, now, actions);
                for outcome in outcomes {
                    actions.extend(self.finish_boot(outcome, now));
                }
            }
            HeartbeatEvent::StateChange(node, state) => {
                actions.push(NodeAction::Notify(Notification::HeartbeatStateChange(
                    node, state,
                )));
            }
            HeartbeatEvent::Timeout(node) => {
                self.nmt.set_slave_state(node, SlaveState::Lost);
                actions.push(NodeAction::Notify(Notification::HeartbeatTimeout(node)));
            }
            HeartbeatEvent::GuardExpired(node) => {
                self.nmt.set_slave_state(node, SlaveState::Lost);
                actions.push(NodeAction::Notify(Notification::NodeGuardingTimeout(node)));
            }
        }
    }

    fn run_boot_requests(
        &mut self,
        node: NodeId,
        requests: Vec<BootRequest>,
        now: u64,
        actions: &mut Vec<NodeAction>,
    ) {
        for request in requests {
            match request {
                BootRequest::Upload { index, sub_index } => {
                    let (handle, _, frames) =
                        self.sdo_client
                            .upload(&mut self.timers, now, node, index, sub_index);
                    self.boot_sdo.insert(node, handle);
                    actions.extend(send_all(frames));
                }
                BootRequest::DownloadDcf(dcf) => {
                    match self.sdo_client.download_dcf(&mut self.timers, now, node, &dcf) {
                        Ok((handle, _, frames)) => {
                            self.boot_sdo.insert(node, handle);
                            actions.extend(send_all(frames));
                        }
                        Err(error) => {
                            warn!("[NODE] invalid stored DCF for node {}: {}", node, error);
                            for outcome in [BootOutcome { node, es: b'J' }] {
                                actions.extend(self.finish_boot(outcome, now));
                            }
                            self.boot.abort_job(node, &mut self.timers);
                        }
                    }
                }
                BootRequest::SuspendErrorControl => {
                    self.hb_consumer.suspend(node, &mut self.timers);
                }
                BootRequest::ResumeErrorControl => {
                    self.hb_consumer.resume(node, &mut self.timers, now);
                }
                BootRequest::StartSlave => {
                    if !self.nmt.autostart_disabled() {
                        if let Some(frame) =
                            self.nmt.command_frame(NmtCommand::Start, Some(node))
                        {
                            actions.push(NodeAction::SendFrame(frame));
                        }
                    }
                }
            }
        }
    }

    fn finish_boot(&mut self, outcome: BootOutcome, _now: u64) -> Vec<NodeAction> {
        self.boot_sdo.remove(&outcome.node);
        let state = if outcome.es == 0 {
            SlaveState::Operational
        } else {
            SlaveState::BootFailed(outcome.es)
        };
        self.nmt.set_slave_state(outcome.node, state);
        if outcome.es == 0 {
            info!("[NMT] slave {} booted", outcome.node);
        } else {
            warn!(
                "[NMT] slave {} boot failed with status '{}'",
                outcome.node, outcome.es as char
            );
        }
        alloc::vec![NodeAction::Notify(Notification::BootResult {
            node: outcome.node,
            es: outcome.es,
        })]
    }

    fn route_sdo_completions(
        &mut self,
        completions: Vec<SdoCompletion>,
        now: u64,
    ) -> Vec<NodeAction> {
        let mut actions = Vec::new();
        for completion in completions {
            if self.boot_sdo.get(&completion.node) == Some(&completion.handle) {
                self.boot_sdo.remove(&completion.node);
                let (requests, outcomes) = self.boot.on_sdo_result(
                    &self.od,
                    completion.node,
                    &completion.result,
                    &mut self.timers,
                    now,
                );
                self.run_boot_requests(completion.node, requests, now, &mut actions);
                for outcome in outcomes {
                    actions.extend(self.finish_boot(outcome, now));
                }
                continue;
            }
            if let Err(error) = completion.result {
                actions.push(NodeAction::Notify(Notification::OperationFailed(
                    ErrorInfo {
                        operation: "sdo transfer",
                        node: Some(completion.node),
                        object: Some((completion.index, completion.sub_index)),
                        error,
                    },
                )));
            }
        }
        actions
    }

    fn drain_history_clear(&mut self) {
        if self.history_clear.replace(false) {
            self.emcy.clear_history(&mut self.od);
        }
    }
}

fn send_all(frames: Vec<CanFrame>) -> Vec<NodeAction> {
    frames.into_iter().map(NodeAction::SendFrame).collect()
}
