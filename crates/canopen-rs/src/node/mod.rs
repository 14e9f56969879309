// crates/canopen-rs/src/node/mod.rs

pub mod master;

pub use master::MasterNode;

use crate::can::CanFrame;
use crate::emcy::EmcyRecord;
use crate::hal::ErrorInfo;
use crate::nmt::states::NmtState;
use crate::types::NodeId;

/// Work the node asks the embedding program to perform after a call into
/// `process_frame` / `tick` / `on_bus_state`.
///
/// Engines never perform I/O and never invoke application code themselves;
/// they return it here so the driver loop can send frames and deliver
/// notifications with no node lock held.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeAction {
    /// Transmit a frame on the CAN channel.
    SendFrame(CanFrame),
    /// Deliver an application-observable event.
    Notify(Notification),
}

/// Application-observable events produced by the protocol engines.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    /// A monitored node's heartbeat did not arrive within the consumer time.
    HeartbeatTimeout(NodeId),
    /// A monitored node reported a new NMT state in its heartbeat.
    HeartbeatStateChange(NodeId, NmtState),
    /// A node-guarding slave stopped answering (or toggled wrongly) for a
    /// full lifetime.
    NodeGuardingTimeout(NodeId),
    /// A boot-up frame (heartbeat state 0x00) was received.
    BootUp(NodeId),
    /// The boot-slave procedure for a node finished. `es` is 0 on success or
    /// the ASCII CiA 302 error-status letter ('A'..'O') on failure.
    BootResult { node: NodeId, es: u8 },
    /// An emergency frame was consumed.
    Emergency {
        node: NodeId,
        record: EmcyRecord,
    },
    /// A SYNC frame was consumed; `counter` is present when the producer
    /// sends one.
    Sync { counter: Option<u8> },
    /// A TIME frame was consumed.
    TimeStamp {
        millis: u32,
        days: u16,
    },
    /// A synchronous RPDO committed its buffered payload to the dictionary
    /// (or an event-driven RPDO wrote through directly).
    RpdoWrite { pdo: u16 },
    /// An RPDO received a payload whose length does not match its mapping.
    RpdoLengthError { pdo: u16, dlc: u8 },
    /// The local NMT state changed.
    NmtStateChange(NmtState),
    /// The redundancy manager switched the active bus channel.
    BusChannelSwitch { alternate: bool },
    /// An asynchronous operation failed; structured diagnostic attached.
    OperationFailed(ErrorInfo),
}

/// Timer events routed through the node's timer queue.
///
/// Each engine owns a subset of variants; `MasterNode::tick` pops due events
/// and dispatches them back into the owning engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerEvent {
    /// The local heartbeat producer is due.
    HeartbeatProduce,
    /// A heartbeat consumer expired.
    HeartbeatConsumer(NodeId),
    /// The next node-guarding RTR poll is due.
    NodeGuardPoll(NodeId),
    /// A node-guarding slave exhausted its lifetime.
    NodeGuardExpired(NodeId),
    /// The SYNC producer is due.
    SyncProduce,
    /// The TIME producer is due.
    TimeProduce,
    /// The SDO server's segment timeout expired.
    SdoServer,
    /// An SDO client transaction timed out.
    SdoClient(NodeId),
    /// A TPDO event timer forced an emission.
    TpdoEventTimer(u16),
    /// A TPDO inhibit window closed (a deferred event may now fire).
    TpdoInhibit(u16),
    /// The LSS master's pending request timed out.
    LssTimeout,
    /// The LSS inhibit spacing elapsed; the next frame may go out.
    LssInhibit,
    /// A boot-slave step timed out.
    BootStep(NodeId),
    /// The redundancy manager's heartbeat-miss window elapsed.
    RedundancyWindow,
}
