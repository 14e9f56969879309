// crates/canopen-rs/src/nmt/heartbeat.rs

//! Heartbeat production and consumption, plus the legacy node-guarding
//! alternative (CiA 301, Section 7.2.8.2).

use super::states::NmtState;
use crate::can::CanFrame;
use crate::node::TimerEvent;
use crate::od::ObjectDictionary;
use crate::timer::{TimerHandle, TimerQueue};
use crate::types::NodeId;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use log::{debug, info, warn};

/// Liveness events reported by the consumer side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatEvent {
    /// The node emitted a boot-up frame.
    BootUp(NodeId),
    /// The node's reported NMT state changed.
    StateChange(NodeId, NmtState),
    /// No heartbeat arrived within the consumer time.
    Timeout(NodeId),
    /// A node-guarded slave stopped answering for a full lifetime.
    GuardExpired(NodeId),
}

/// The local heartbeat producer: emits the node's state byte on
/// 0x700 + node-ID every `producer_ms` (object 0x1017).
pub struct HeartbeatProducer {
    node_id: NodeId,
    period_ms: u16,
    timer: Option<TimerHandle>,
}

impl HeartbeatProducer {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            period_ms: 0,
            timer: None,
        }
    }

    /// Re-reads object 0x1017 and (re)arms production.
    pub fn configure(
        &mut self,
        od: &ObjectDictionary,
        timers: &mut TimerQueue<TimerEvent>,
        now: u64,
    ) {
        self.disarm(timers);
        self.period_ms = od.read_u16(0x1017, 0).unwrap_or(0);
        if self.period_ms > 0 {
            debug!("[NMT] heartbeat producer armed: {} ms", self.period_ms);
            self.timer = Some(timers.schedule(
                now + self.period_ms as u64 * 1000,
                TimerEvent::HeartbeatProduce,
            ));
        }
    }

    /// The production period elapsed.
    pub fn on_timer(
        &mut self,
        state: NmtState,
        timers: &mut TimerQueue<TimerEvent>,
        now: u64,
    ) -> Vec<CanFrame> {
        self.timer = None;
        if self.period_ms == 0 {
            return Vec::new();
        }
        self.timer = Some(timers.schedule(
            now + self.period_ms as u64 * 1000,
            TimerEvent::HeartbeatProduce,
        ));
        CanFrame::new(self.node_id.heartbeat_cob_id(), &[state.to_heartbeat_byte()])
            .into_iter()
            .collect()
    }

    /// The boot-up message emitted when initialisation finishes.
    pub fn boot_up_frame(&self) -> Option<CanFrame> {
        CanFrame::new(self.node_id.heartbeat_cob_id(), &[0x00])
    }

    pub fn disarm(&mut self, timers: &mut TimerQueue<TimerEvent>) {
        if let Some(handle) = self.timer.take() {
            timers.cancel(handle);
        }
    }
}

struct ConsumerEntry {
    consumer_ms: u16,
    timer: Option<TimerHandle>,
    last_state: Option<NmtState>,
    /// Monitoring is suspended (e.g. while the boot procedure checks the
    /// node's error history).
    suspended: bool,
}

/// The heartbeat consumer: one expiry timer per monitored node, configured
/// from object 0x1016 (`node-ID << 16 | time_ms`).
#[derive(Default)]
pub struct HeartbeatConsumer {
    entries: BTreeMap<NodeId, ConsumerEntry>,
}

impl HeartbeatConsumer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds the consumer set from object 0x1016. Existing timers are
    /// cancelled; each monitored node restarts its window at `now`.
    pub fn configure(
        &mut self,
        od: &ObjectDictionary,
        timers: &mut TimerQueue<TimerEvent>,
        now: u64,
    ) {
        for (_, entry) in core::mem::take(&mut self.entries) {
            if let Some(handle) = entry.timer {
                timers.cancel(handle);
            }
        }
        let count = od.read_u8(0x1016, 0).unwrap_or(0);
        for slot in 1..=count {
            let Some(raw) = od.read_u32(0x1016, slot) else {
                continue;
            };
            let consumer_ms = (raw & 0xFFFF) as u16;
            let Ok(node) = NodeId::try_from(((raw >> 16) & 0xFF) as u8) else {
                continue;
            };
            if consumer_ms == 0 {
                continue;
            }
            self.monitor(node, consumer_ms, timers, now);
        }
    }

    /// Starts (or restarts) monitoring one node.
    pub fn monitor(
        &mut self,
        node: NodeId,
        consumer_ms: u16,
        timers: &mut TimerQueue<TimerEvent>,
        now: u64,
    ) {
        self.drop_node(node, timers);
        info!("[NMT] heartbeat consumer for node {}: {} ms", node, consumer_ms);
        let timer = timers.schedule(
            now + consumer_ms as u64 * 1000,
            TimerEvent::HeartbeatConsumer(node),
        );
        self.entries.insert(
            node,
            ConsumerEntry {
                consumer_ms,
                timer: Some(timer),
                last_state: None,
                suspended: false,
            },
        );
    }

    /// Suspends monitoring without forgetting the configuration.
    pub fn suspend(&mut self, node: NodeId, timers: &mut TimerQueue<TimerEvent>) {
        if let Some(entry) = self.entries.get_mut(&node) {
            if let Some(handle) = entry.timer.take() {
                timers.cancel(handle);
            }
            entry.suspended = true;
        }
    }

    /// Resumes a suspended consumer with a fresh window.
    pub fn resume(&mut self, node: NodeId, timers: &mut TimerQueue<TimerEvent>, now: u64) {
        if let Some(entry) = self.entries.get_mut(&node) {
            entry.suspended = false;
            if let Some(handle) = entry.timer.take() {
                timers.cancel(handle);
            }
            entry.timer = Some(timers.schedule(
                now + entry.consumer_ms as u64 * 1000,
                TimerEvent::HeartbeatConsumer(node),
            ));
        }
    }

    /// Stops monitoring one node entirely.
    pub fn drop_node(&mut self, node: NodeId, timers: &mut TimerQueue<TimerEvent>) {
        if let Some(entry) = self.entries.remove(&node) {
            if let Some(handle) = entry.timer {
                timers.cancel(handle);
            }
        }
    }

    /// True if `node` is being monitored (and not suspended).
    pub fn is_monitoring(&self, node: NodeId) -> bool {
        self.entries
            .get(&node)
            .is_some_and(|entry| !entry.suspended)
    }

    /// Processes a heartbeat frame from `node`. The window restarts on every
    /// beat and on every state change.
    pub fn handle_frame(
        &mut self,
        node: NodeId,
        frame: &CanFrame,
        timers: &mut TimerQueue<TimerEvent>,
        now: u64,
    ) -> Vec<HeartbeatEvent> {
        let Some(&byte) = frame.payload().first() else {
            return Vec::new();
        };
        let mut events = Vec::new();
        // Boot-up frames are reported even for unmonitored nodes; the boot
        // engine needs them.
        let state = NmtState::from_heartbeat_byte(byte & 0x7F);
        if byte == 0x00 {
            events.push(HeartbeatEvent::BootUp(node));
        }

        if let Some(entry) = self.entries.get_mut(&node) {
            if !entry.suspended {
                if let Some(handle) = entry.timer.take() {
                    timers.cancel(handle);
                }
                entry.timer = Some(timers.schedule(
                    now + entry.consumer_ms as u64 * 1000,
                    TimerEvent::HeartbeatConsumer(node),
                ));
            }
            if let Some(state) = state {
                if entry.last_state != Some(state) {
                    entry.last_state = Some(state);
                    events.push(HeartbeatEvent::StateChange(node, state));
                }
            }
        }
        events
    }

    /// The consumer window of `node` expired.
    pub fn on_timeout(&mut self, node: NodeId) -> Vec<HeartbeatEvent> {
        let Some(entry) = self.entries.get_mut(&node) else {
            return Vec::new();
        };
        entry.timer = None;
        // The timer is not re-armed: exactly one timeout is delivered until
        // the next heartbeat restarts the window.
        warn!("[NMT] heartbeat timeout for node {}", node);
        alloc::vec![HeartbeatEvent::Timeout(node)]
    }
}

struct GuardEntry {
    guard_time_ms: u16,
    life_factor: u8,
    /// Toggle bit expected in the next response.
    expected_toggle: bool,
    /// Polls without a good response.
    missed: u8,
    /// A response arrived since the last poll.
    answered: bool,
    poll_timer: Option<TimerHandle>,
    faulted: bool,
}

/// Master-side node guarding: periodic RTR polls with toggled responses.
#[derive(Default)]
pub struct NodeGuard {
    slaves: BTreeMap<NodeId, GuardEntry>,
}

impl NodeGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts guarding a slave.
    pub fn guard(
        &mut self,
        node: NodeId,
        guard_time_ms: u16,
        life_factor: u8,
        timers: &mut TimerQueue<TimerEvent>,
        now: u64,
    ) {
        self.drop_node(node, timers);
        if guard_time_ms == 0 || life_factor == 0 {
            return;
        }
        let poll_timer = timers.schedule(
            now + guard_time_ms as u64 * 1000,
            TimerEvent::NodeGuardPoll(node),
        );
        self.slaves.insert(
            node,
            GuardEntry {
                guard_time_ms,
                life_factor,
                expected_toggle: false,
                missed: 0,
                answered: true,
                poll_timer: Some(poll_timer),
                faulted: false,
            },
        );
    }

    pub fn drop_node(&mut self, node: NodeId, timers: &mut TimerQueue<TimerEvent>) {
        if let Some(entry) = self.slaves.remove(&node) {
            if let Some(handle) = entry.poll_timer {
                timers.cancel(handle);
            }
        }
    }

    /// The guard interval of `node` elapsed: account for the previous poll
    /// and emit the next RTR.
    pub fn on_poll(
        &mut self,
        node: NodeId,
        timers: &mut TimerQueue<TimerEvent>,
        now: u64,
    ) -> (Vec<CanFrame>, Vec<HeartbeatEvent>) {
        let Some(entry) = self.slaves.get_mut(&node) else {
            return (Vec::new(), Vec::new());
        };
        entry.poll_timer = Some(timers.schedule(
            now + entry.guard_time_ms as u64 * 1000,
            TimerEvent::NodeGuardPoll(node),
        ));

        let mut events = Vec::new();
        if entry.answered {
            entry.missed = 0;
        } else {
            entry.missed = entry.missed.saturating_add(1);
            if entry.missed >= entry.life_factor && !entry.faulted {
                entry.faulted = true;
                warn!("[NMT] node guarding lifetime of node {} exhausted", node);
                events.push(HeartbeatEvent::GuardExpired(node));
            }
        }
        entry.answered = false;

        let frames = alloc::vec![CanFrame::new_rtr(node.heartbeat_cob_id(), 1)];
        (frames, events)
    }

    /// A guard response arrived on 0x700 + node. Bad toggles count as
    /// missing responses.
    pub fn handle_response(&mut self, node: NodeId, frame: &CanFrame) {
        let Some(entry) = self.slaves.get_mut(&node) else {
            return;
        };
        let Some(&byte) = frame.payload().first() else {
            return;
        };
        let toggle = byte & 0x80 != 0;
        if toggle == entry.expected_toggle {
            entry.expected_toggle = !entry.expected_toggle;
            entry.answered = true;
            entry.faulted = false;
        } else {
            debug!("[NMT] node {} guard response with bad toggle", node);
        }
    }

    pub fn is_guarding(&self, node: NodeId) -> bool {
        self.slaves.contains_key(&node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::od::{self, ObjectValue};

    #[test]
    fn test_producer_emits_state_byte() {
        let mut dictionary = ObjectDictionary::new();
        od::predefined::populate(&mut dictionary, NodeId(1));
        dictionary
            .write(0x1017, 0, ObjectValue::Unsigned16(500))
            .unwrap();
        let mut timers = TimerQueue::new();
        let mut producer = HeartbeatProducer::new(NodeId(1));
        producer.configure(&dictionary, &mut timers, 0);

        assert_eq!(timers.pop_due(500_000), Some(TimerEvent::HeartbeatProduce));
        let frames = producer.on_timer(NmtState::Operational, &mut timers, 500_000);
        assert_eq!(frames[0].cob_id(), Some(0x701));
        assert_eq!(frames[0].payload(), &[0x05]);
        assert_eq!(timers.next_deadline(), Some(1_000_000));
    }

    #[test]
    fn test_consumer_restarts_window_and_reports_changes() {
        let mut timers = TimerQueue::new();
        let mut consumer = HeartbeatConsumer::new();
        consumer.monitor(NodeId(5), 100, &mut timers, 0);

        let beat = CanFrame::new(0x705, &[0x7F]).unwrap();
        let events = consumer.handle_frame(NodeId(5), &beat, &mut timers, 50_000);
        assert_eq!(
            events,
            alloc::vec![HeartbeatEvent::StateChange(NodeId(5), NmtState::PreOperational)]
        );
        // Window restarted from the beat.
        assert_eq!(timers.next_deadline(), Some(150_000));

        // Same state again: no event.
        let events = consumer.handle_frame(NodeId(5), &beat, &mut timers, 60_000);
        assert!(events.is_empty());
    }

    #[test]
    fn test_consumer_timeout_fires_once() {
        let mut timers = TimerQueue::new();
        let mut consumer = HeartbeatConsumer::new();
        consumer.monitor(NodeId(5), 100, &mut timers, 0);

        assert_eq!(
            timers.pop_due(100_000),
            Some(TimerEvent::HeartbeatConsumer(NodeId(5)))
        );
        assert_eq!(
            consumer.on_timeout(NodeId(5)),
            alloc::vec![HeartbeatEvent::Timeout(NodeId(5))]
        );
        // Not re-armed until the next heartbeat.
        assert!(timers.is_empty());
    }

    #[test]
    fn test_boot_up_reported_even_when_unmonitored() {
        let mut timers = TimerQueue::new();
        let mut consumer = HeartbeatConsumer::new();
        let boot = CanFrame::new(0x702, &[0x00]).unwrap();
        let events = consumer.handle_frame(NodeId(2), &boot, &mut timers, 0);
        assert_eq!(events, alloc::vec![HeartbeatEvent::BootUp(NodeId(2))]);
    }

    #[test]
    fn test_configure_from_od() {
        let mut dictionary = ObjectDictionary::new();
        od::predefined::populate(&mut dictionary, NodeId(1));
        dictionary
            .write(0x1016, 1, ObjectValue::Unsigned32(5 << 16 | 100))
            .unwrap();
        let mut timers = TimerQueue::new();
        let mut consumer = HeartbeatConsumer::new();
        consumer.configure(&dictionary, &mut timers, 0);
        assert!(consumer.is_monitoring(NodeId(5)));
        assert!(!consumer.is_monitoring(NodeId(6)));
    }

    #[test]
    fn test_node_guard_lifetime() {
        let mut timers = TimerQueue::new();
        let mut guard = NodeGuard::new();
        guard.guard(NodeId(3), 10, 3, &mut timers, 0);

        // Poll 1: previous window had a response (initial grace).
        let (frames, events) = guard.on_poll(NodeId(3), &mut timers, 10_000);
        assert!(frames[0].rtr);
        assert_eq!(frames[0].cob_id(), Some(0x703));
        assert!(events.is_empty());

        // Three unanswered polls exhaust the lifetime.
        let (_, events) = guard.on_poll(NodeId(3), &mut timers, 20_000);
        assert!(events.is_empty());
        let (_, events) = guard.on_poll(NodeId(3), &mut timers, 30_000);
        assert!(events.is_empty());
        let (_, events) = guard.on_poll(NodeId(3), &mut timers, 40_000);
        assert_eq!(events, alloc::vec![HeartbeatEvent::GuardExpired(NodeId(3))]);
    }

    #[test]
    fn test_node_guard_toggle_check() {
        let mut timers = TimerQueue::new();
        let mut guard = NodeGuard::new();
        guard.guard(NodeId(3), 10, 2, &mut timers, 0);
        guard.on_poll(NodeId(3), &mut timers, 10_000);

        // First response must carry toggle 0.
        let good = CanFrame::new(0x703, &[0x7F]).unwrap();
        guard.handle_response(NodeId(3), &good);
        let (_, events) = guard.on_poll(NodeId(3), &mut timers, 20_000);
        assert!(events.is_empty());

        // Repeating the same toggle is treated as a miss.
        guard.handle_response(NodeId(3), &good);
        let (_, events) = guard.on_poll(NodeId(3), &mut timers, 30_000);
        assert!(events.is_empty());
        let (_, events) = guard.on_poll(NodeId(3), &mut timers, 40_000);
        assert_eq!(events, alloc::vec![HeartbeatEvent::GuardExpired(NodeId(3))]);
    }
}
