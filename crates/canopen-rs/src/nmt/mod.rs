// crates/canopen-rs/src/nmt/mod.rs

//! Network management: the local state machine, heartbeat and
//! node-guarding error control, the boot-slave procedure (CiA 302) and the
//! bus-toggle redundancy protocol (CiA 302-6).

pub mod boot;
pub mod heartbeat;
pub mod master;
pub mod redundancy;
pub mod states;

pub use boot::{BootEngine, BootRequest};
pub use heartbeat::{HeartbeatConsumer, HeartbeatEvent, HeartbeatProducer, NodeGuard};
pub use master::NmtMaster;
pub use redundancy::RedundancyManager;
pub use states::{NmtCommand, NmtState};
