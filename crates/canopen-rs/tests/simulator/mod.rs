// crates/canopen-rs/tests/simulator/mod.rs

//! A virtual CAN bus with simulated time and scripted remote nodes, shared
//! by the integration tests.

#![allow(dead_code)]

use canopen_rs::can::CanFrame;
use canopen_rs::lss::LssAddress;
use canopen_rs::nmt::states::{NmtCommand, NmtState};
use canopen_rs::node::{MasterNode, NodeAction, Notification};
use canopen_rs::od::ObjectDictionary;
use canopen_rs::sdo::server::SdoServer;
use canopen_rs::timer::TimerQueue;
use canopen_rs::types::NodeId;

/// A CANopen slave model: an object dictionary behind a real SDO server,
/// an NMT state byte, and optional LSS behaviour.
pub struct SimulatedSlave {
    pub node_id: NodeId,
    pub od: ObjectDictionary,
    server: SdoServer,
    timers: TimerQueue<canopen_rs::node::TimerEvent>,
    pub nmt_state: NmtState,
}

impl SimulatedSlave {
    pub fn new(node_id: NodeId, od: ObjectDictionary) -> Self {
        Self {
            node_id,
            od,
            server: SdoServer::new(node_id),
            timers: TimerQueue::new(),
            nmt_state: NmtState::PreOperational,
        }
    }

    /// The boot-up frame this slave emits after power-on.
    pub fn boot_up_frame(&self) -> CanFrame {
        CanFrame::new(self.node_id.heartbeat_cob_id(), &[0x00]).unwrap()
    }

    /// A heartbeat frame carrying the current state.
    pub fn heartbeat_frame(&self) -> CanFrame {
        CanFrame::new(
            self.node_id.heartbeat_cob_id(),
            &[self.nmt_state.to_heartbeat_byte()],
        )
        .unwrap()
    }

    /// Feeds one bus frame into the slave; returns its responses.
    pub fn handle_frame(&mut self, frame: &CanFrame, now: u64) -> Vec<CanFrame> {
        let Some(cob_id) = frame.cob_id() else {
            return Vec::new();
        };
        if cob_id == 0x000 {
            let payload = frame.payload();
            if payload.len() == 2 && (payload[1] == 0 || payload[1] == self.node_id.0) {
                match NmtCommand::from_u8(payload[0]) {
                    Some(NmtCommand::Start) => self.nmt_state = NmtState::Operational,
                    Some(NmtCommand::Stop) => self.nmt_state = NmtState::Stopped,
                    Some(NmtCommand::EnterPreOperational) => {
                        self.nmt_state = NmtState::PreOperational
                    }
                    _ => {}
                }
            }
            return Vec::new();
        }
        if cob_id == self.node_id.sdo_request_cob_id() && !frame.rtr {
            return self
                .server
                .handle_frame(&mut self.od, &mut self.timers, frame, now);
        }
        Vec::new()
    }
}

/// An unconfigured LSS slave answering identify and fastscan requests.
pub struct LssSlaveModel {
    pub address: LssAddress,
    pub configured_node_id: Option<NodeId>,
    pub in_configuration_state: bool,
    /// Fastscan progress: which element the slave expects to be scanned.
    lss_sub: u8,
}

impl LssSlaveModel {
    pub fn new(address: LssAddress) -> Self {
        Self {
            address,
            configured_node_id: None,
            in_configuration_state: false,
            lss_sub: 0,
        }
    }

    fn element(&self, sub: u8) -> u32 {
        match sub {
            0 => self.address.vendor_id,
            1 => self.address.product_code,
            2 => self.address.revision,
            _ => self.address.serial,
        }
    }

    /// Feeds one master request (COB-ID 0x7E5); returns the slave response,
    /// if any.
    pub fn handle_frame(&mut self, frame: &CanFrame) -> Option<CanFrame> {
        if frame.cob_id() != Some(0x7E5) {
            return None;
        }
        let payload = frame.payload();
        match payload[0] {
            // Identify non-configured remote slave.
            0x4C if self.configured_node_id.is_none() => {
                Some(lss_response(&[0x50]))
            }
            // Configure node-ID (only in configuration state).
            0x11 if self.in_configuration_state => {
                self.configured_node_id = NodeId::try_from(payload[1]).ok();
                Some(lss_response(&[0x11, 0, 0]))
            }
            // Fastscan.
            0x51 => {
                if self.configured_node_id.is_some() {
                    return None;
                }
                let id = u32::from_le_bytes([payload[1], payload[2], payload[3], payload[4]]);
                let bit_check = payload[5];
                let sub = payload[6];
                let next = payload[7];
                let respond = match bit_check {
                    0x80 => {
                        self.lss_sub = 0;
                        true
                    }
                    0..=31 => {
                        let value = self.element(sub);
                        let matches = if bit_check == 0 {
                            id == value
                        } else {
                            (id >> bit_check) == (value >> bit_check)
                        };
                        if matches && bit_check == 0 && next != sub {
                            // Confirm frame: advance the scan pointer; the
                            // final element switches us to configuration.
                            self.lss_sub = next;
                            if sub == 3 {
                                self.in_configuration_state = true;
                            }
                        }
                        matches
                    }
                    _ => false,
                };
                // 0x4F: identify slave.
                respond.then(|| lss_response(&[0x4F]))
            }
            _ => None,
        }
    }
}

fn lss_response(payload: &[u8]) -> CanFrame {
    let mut data = [0u8; 8];
    data[..payload.len()].copy_from_slice(payload);
    CanFrame::new(0x7E4, &data).unwrap()
}

/// Drives a master and a set of slaves until the bus goes quiet, splitting
/// the master's actions into sent frames and notifications.
pub struct Harness {
    pub master: MasterNode,
    pub slaves: Vec<SimulatedSlave>,
    pub sent: Vec<CanFrame>,
    /// Frames the slaves put on the bus, as seen by the master.
    pub received: Vec<CanFrame>,
    pub notifications: Vec<Notification>,
    pub now: u64,
}

impl Harness {
    pub fn new(master: MasterNode) -> Self {
        Self {
            master,
            slaves: Vec::new(),
            sent: Vec::new(),
            received: Vec::new(),
            notifications: Vec::new(),
            now: 0,
        }
    }

    pub fn add_slave(&mut self, slave: SimulatedSlave) {
        self.slaves.push(slave);
    }

    /// Performs the master's actions: frames go to every slave, whose
    /// responses feed back into the master, until nothing moves.
    pub fn settle(&mut self, actions: Vec<NodeAction>) {
        let mut pending: Vec<CanFrame> = Vec::new();
        for action in actions {
            match action {
                NodeAction::SendFrame(frame) => {
                    self.sent.push(frame);
                    pending.push(frame);
                }
                NodeAction::Notify(notification) => self.notifications.push(notification),
            }
        }
        // Frames ping-pong between master and slaves until quiescent.
        for _ in 0..10_000 {
            let Some(frame) = pending.first().copied() else {
                return;
            };
            pending.remove(0);
            let mut responses = Vec::new();
            for slave in &mut self.slaves {
                responses.extend(slave.handle_frame(&frame, self.now));
            }
            self.received.extend(responses.iter().copied());
            for response in responses {
                let actions = self.master.process_frame(&response, self.now);
                for action in actions {
                    match action {
                        NodeAction::SendFrame(frame) => {
                            self.sent.push(frame);
                            pending.push(frame);
                        }
                        NodeAction::Notify(notification) => {
                            self.notifications.push(notification)
                        }
                    }
                }
            }
        }
        panic!("bus did not settle");
    }

    /// Advances simulated time, pumping the master's timer queue.
    pub fn advance_to(&mut self, deadline: u64) {
        while let Some(next) = self.master.next_action_time() {
            if next > deadline {
                break;
            }
            self.now = next;
            let actions = self.master.tick(self.now);
            self.settle(actions);
        }
        self.now = deadline;
    }

    /// Injects a frame from the bus side (e.g. a slave heartbeat).
    pub fn inject(&mut self, frame: CanFrame) {
        let actions = self.master.process_frame(&frame, self.now);
        self.settle(actions);
    }

    /// Frames sent on a given COB-ID since the last call to `clear_sent`.
    pub fn sent_on(&self, cob_id: u16) -> Vec<CanFrame> {
        self.sent
            .iter()
            .filter(|frame| frame.cob_id() == Some(cob_id))
            .copied()
            .collect()
    }

    pub fn clear_sent(&mut self) {
        self.sent.clear();
    }
}
