// crates/canopen-rs/src/hal.rs
use crate::can::CanFrame;
use crate::sdo::AbortCode;
use crate::types::{NodeId, NodeIdError};
use core::array::TryFromSliceError;
use core::fmt;

/// Defines a portable, descriptive error type for the CANopen stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CanOpenError {
    /// The underlying CAN driver failed (bus-off, controller fault, I/O).
    BusError,
    /// The driver's transmit queue is full; retry after the next poll.
    WouldBlock,
    /// A confirmed service did not complete within its timeout.
    Timeout,
    /// The operation was cancelled by the user or by a state transition.
    Aborted,
    /// A received frame is malformed or out of sequence for its protocol.
    Protocol,
    /// The remote SDO peer (or the local server) reported an abort code.
    SdoAbort(AbortCode),
    /// A device description or parameter is invalid or out of range.
    Configuration(&'static str),
    /// The operation is not permitted in the current NMT state.
    NotAllowed,
    /// An argument is outside its documented domain.
    InvalidArgument,
    /// The driver or engine is not yet configured or ready.
    NotReady,
    /// The provided buffer is too small for the operation.
    BufferTooShort,
    /// A value in a frame is not a valid NodeId.
    InvalidNodeId(u8),
    /// A multi-byte value could not be parsed from a slice.
    SliceConversion,
    /// The requested object dictionary index does not exist.
    ObjectNotFound,
    /// The requested sub-index does not exist for the given object.
    SubObjectNotFound,
    /// An attempt was made to read/write a value with an incorrect data type.
    TypeMismatch,
    /// Internal logic error.
    InternalError(&'static str),
}

impl fmt::Display for CanOpenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BusError => write!(f, "Underlying CAN bus error"),
            Self::WouldBlock => write!(f, "Driver transmit queue full"),
            Self::Timeout => write!(f, "Confirmed service timed out"),
            Self::Aborted => write!(f, "Operation cancelled"),
            Self::Protocol => write!(f, "Malformed or out-of-sequence frame"),
            Self::SdoAbort(code) => write!(f, "SDO abort: {}", code),
            Self::Configuration(s) => write!(f, "Configuration error: {}", s),
            Self::NotAllowed => write!(f, "Operation not permitted in current NMT state"),
            Self::InvalidArgument => write!(f, "Invalid argument"),
            Self::NotReady => write!(f, "Driver or engine not ready"),
            Self::BufferTooShort => write!(f, "Buffer is too short"),
            Self::InvalidNodeId(v) => write!(f, "Invalid NodeId: {}", v),
            Self::SliceConversion => write!(f, "Failed to convert slice to fixed-size array"),
            Self::ObjectNotFound => write!(f, "OD index not found"),
            Self::SubObjectNotFound => write!(f, "OD sub-index not found"),
            Self::TypeMismatch => write!(f, "Data type mismatch"),
            Self::InternalError(s) => write!(f, "Internal error: {}", s),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for CanOpenError {}

// --- From implementations for error conversion ---

impl From<TryFromSliceError> for CanOpenError {
    fn from(_: TryFromSliceError) -> Self {
        CanOpenError::SliceConversion
    }
}

impl From<NodeIdError> for CanOpenError {
    fn from(err: NodeIdError) -> Self {
        match err {
            NodeIdError::InvalidRange(val) => CanOpenError::InvalidNodeId(val),
        }
    }
}

impl From<AbortCode> for CanOpenError {
    fn from(code: AbortCode) -> Self {
        CanOpenError::SdoAbort(code)
    }
}

impl From<&'static str> for CanOpenError {
    fn from(s: &'static str) -> Self {
        CanOpenError::InternalError(s)
    }
}

/// A structured, user-visible failure report attached to completion
/// notifications: which service failed, against which node and object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorInfo {
    /// Name of the failed service ("sdo upload", "lss fastscan", ...).
    pub operation: &'static str,
    /// Remote node the service was addressed to, if any.
    pub node: Option<NodeId>,
    /// Object dictionary address involved, if any.
    pub object: Option<(u16, u8)>,
    /// The underlying error kind.
    pub error: CanOpenError,
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed", self.operation)?;
        if let Some(node) = self.node {
            write!(f, " (node {})", node)?;
        }
        if let Some((index, sub)) = self.object {
            write!(f, " [{:#06X}:{:#04X}]", index, sub)?;
        }
        write!(f, ": {}", self.error)
    }
}

/// The reported state of the CAN controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BusState {
    /// Error-active: normal operation.
    #[default]
    Active,
    /// Error-passive: the controller no longer sends active error flags.
    Passive,
    /// Bus-off: the controller has left the bus.
    BusOff,
}

/// Hardware abstraction for a single CAN channel.
///
/// This trait abstracts the physical sending of CAN frames and controller
/// management, so the core protocol logic stays platform-agnostic (no_std).
/// Received frames and asynchronous state changes are pushed into the core
/// by the embedding program via `MasterNode::process_frame` and
/// `MasterNode::on_bus_state`.
pub trait CanDriver {
    /// Queues a single frame for transmission.
    ///
    /// Must not block; returns `CanOpenError::WouldBlock` when the driver's
    /// transmit queue is full. Frames with equal COB-ID must leave the
    /// controller in the order they were queued.
    fn send(&mut self, frame: &CanFrame) -> Result<(), CanOpenError>;

    /// Returns the current controller state.
    fn state(&self) -> BusState;

    /// Stops the controller (no frames are sent or received until `start`).
    fn stop(&mut self) -> Result<(), CanOpenError>;

    /// (Re)starts a stopped controller.
    fn start(&mut self) -> Result<(), CanOpenError>;

    /// Reconfigures the bit rate. Only valid while stopped.
    fn set_bitrate(&mut self, bit_rate_bps: u32) -> Result<(), CanOpenError>;
}
