// crates/canopen-rs/src/nmt/master.rs

use super::states::{NmtCommand, NmtState};
use crate::can::CanFrame;
use crate::od::ObjectDictionary;
use crate::types::{NodeId, COBID_NMT};
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use log::{info, warn};

/// Assignment flags of object 0x1F81 (CiA 302, Section 4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlaveAssignment(pub u32);

impl SlaveAssignment {
    /// Bit 0: the node is a slave of this master.
    pub fn is_slave(&self) -> bool {
        self.0 & 0x01 != 0
    }

    /// Bit 2: on an error-control event the slave's errors are treated as
    /// not recoverable.
    pub fn error_not_recoverable(&self) -> bool {
        self.0 & 0x04 != 0
    }

    /// Bit 3: the slave is mandatory for network operation.
    pub fn mandatory(&self) -> bool {
        self.0 & 0x08 != 0
    }
}

/// Tracked state of one configured slave.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlaveState {
    /// Configured but not heard from yet.
    Unknown,
    /// Boot-up seen; the boot-slave procedure is running.
    Booting,
    /// Boot finished successfully; the slave participates in the network.
    Operational,
    /// Boot failed with the recorded error-status letter.
    BootFailed(u8),
    /// Error control (heartbeat or guarding) reported the slave missing.
    Lost,
}

/// The master's NMT engine: the local state machine (CiA 301, Figure 14),
/// the NMT command producer, and the per-slave state tracker.
pub struct NmtMaster {
    node_id: NodeId,
    state: NmtState,
    startup: u32,
    pub(crate) slaves: BTreeMap<NodeId, (SlaveAssignment, SlaveState)>,
}

impl NmtMaster {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            state: NmtState::Initializing,
            startup: 0,
            slaves: BTreeMap::new(),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn state(&self) -> NmtState {
        self.state
    }

    /// The NMT start-up word (object 0x1F80).
    pub fn startup(&self) -> u32 {
        self.startup
    }

    /// Bit 2 of 0x1F80: slaves are not started automatically after boot.
    pub fn autostart_disabled(&self) -> bool {
        self.startup & 0x04 != 0
    }

    /// Rebuilds the slave tracker and start-up flags from objects
    /// 0x1F80/0x1F81. Called during reset-communication.
    pub fn configure(&mut self, od: &ObjectDictionary) {
        self.startup = od.read_u32(0x1F80, 0).unwrap_or(0);
        let previous = core::mem::take(&mut self.slaves);
        let count = od.read_u8(0x1F81, 0).unwrap_or(0);
        for slot in 1..=count {
            let Some(raw) = od.read_u32(0x1F81, slot) else {
                continue;
            };
            let assignment = SlaveAssignment(raw);
            if !assignment.is_slave() {
                continue;
            }
            let Ok(node) = NodeId::try_from(slot) else {
                continue;
            };
            if node == self.node_id {
                continue;
            }
            let state = previous
                .get(&node)
                .map(|(_, state)| *state)
                .unwrap_or(SlaveState::Unknown);
            self.slaves.insert(node, (assignment, state));
        }
        info!(
            "[NMT] master manages {} slave(s) ({} mandatory)",
            self.slaves.len(),
            self.slaves
                .values()
                .filter(|(assignment, _)| assignment.mandatory())
                .count()
        );
    }

    /// The assignment flags of a configured slave.
    pub fn assignment(&self, node: NodeId) -> Option<SlaveAssignment> {
        self.slaves.get(&node).map(|(assignment, _)| *assignment)
    }

    pub fn slave_state(&self, node: NodeId) -> Option<SlaveState> {
        self.slaves.get(&node).map(|(_, state)| *state)
    }

    pub(crate) fn set_slave_state(&mut self, node: NodeId, state: SlaveState) {
        if let Some((_, slot)) = self.slaves.get_mut(&node) {
            *slot = state;
        }
    }

    /// Runs the initialisation cascade: reset-application restores the
    /// manufacturer and profile areas, reset-communication the
    /// communication area. The caller re-initialises the engines afterwards
    /// and emits the boot-up frame.
    ///
    /// Returns every transient state passed through, ending in
    /// `PreOperational`.
    pub fn reset(&mut self, od: &mut ObjectDictionary, command: NmtCommand) -> Vec<NmtState> {
        let mut passed = Vec::new();
        let from_application = matches!(command, NmtCommand::ResetNode);

        if from_application {
            self.state = NmtState::ResetApplication;
            passed.push(self.state);
            od.restore_power_on_values(0x2000, 0x5FFF);
            od.restore_power_on_values(0x6000, 0x9FFF);
        }

        self.state = NmtState::ResetCommunication;
        passed.push(self.state);
        od.restore_power_on_values(0x1000, 0x1FFF);

        self.state = NmtState::Boot;
        passed.push(self.state);

        self.state = NmtState::PreOperational;
        passed.push(self.state);
        info!("[NMT] local reset complete ({:?})", command);
        passed
    }

    /// Applies an NMT command to the local state machine. Reset commands are
    /// handled by `reset`; this covers the mode switches.
    pub fn apply_local(&mut self, command: NmtCommand) -> Option<NmtState> {
        let next = match (self.state, command) {
            (NmtState::PreOperational | NmtState::Stopped, NmtCommand::Start) => {
                NmtState::Operational
            }
            (NmtState::Operational | NmtState::PreOperational, NmtCommand::Stop) => {
                NmtState::Stopped
            }
            (NmtState::Operational | NmtState::Stopped, NmtCommand::EnterPreOperational) => {
                NmtState::PreOperational
            }
            _ => return None,
        };
        if next != self.state {
            info!("[NMT] local state {:?} -> {:?}", self.state, next);
            self.state = next;
            Some(next)
        } else {
            None
        }
    }

    /// Builds the NMT command frame for `target` (`None` broadcasts).
    pub fn command_frame(&self, command: NmtCommand, target: Option<NodeId>) -> Option<CanFrame> {
        let node_byte = target.map(|node| node.0).unwrap_or(0);
        CanFrame::new(COBID_NMT, &[command as u8, node_byte])
    }

    /// Processes a received NMT command frame. Returns the command when it
    /// addresses this node (directly or broadcast).
    pub fn handle_frame(&mut self, frame: &CanFrame) -> Option<NmtCommand> {
        let payload = frame.payload();
        if payload.len() != 2 {
            return None;
        }
        let Some(command) = NmtCommand::from_u8(payload[0]) else {
            warn!("[NMT] unknown command specifier {:#04X}", payload[0]);
            return None;
        };
        let addressed = payload[1] == 0 || payload[1] == self.node_id.0;
        addressed.then_some(command)
    }

    /// True once every mandatory slave reached `Operational`.
    pub fn all_mandatory_operational(&self) -> bool {
        self.slaves
            .values()
            .filter(|(assignment, _)| assignment.mandatory())
            .all(|(_, state)| *state == SlaveState::Operational)
    }
}
