#![cfg_attr(not(feature = "std"), no_std)]

// 'alloc' is used for dynamic allocation (e.g. payload buffers, the OD map).
extern crate alloc;

// --- Foundation Modules ---
pub mod types;
pub mod hal;
pub mod can;
pub mod timer;
pub mod exec;

// --- Data Store ---
pub mod od;

// --- Protocol Engines ---
pub mod emcy;
pub mod lss;
pub mod nmt;
pub mod pdo;
pub mod sdo;
pub mod sync;
pub mod timestamp;

// --- Node Abstraction ---
pub mod node;

// --- Top-level Exports ---
pub use types::NodeId;
pub use hal::{BusState, CanDriver, CanOpenError, ErrorInfo};
pub use can::{CanFrame, CanId, FrameDispatcher, FrameFilter};
pub use od::{ObjectDictionary, ObjectEntry, ObjectValue};
pub use sdo::AbortCode;
pub use nmt::{NmtCommand, NmtState};
pub use node::{MasterNode, NodeAction, Notification};
