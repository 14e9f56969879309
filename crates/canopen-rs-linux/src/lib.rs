// crates/canopen-rs-linux/src/lib.rs
#![cfg(target_os = "linux")]

//! SocketCAN back-end for the `canopen-rs` master stack.
//!
//! Wraps a raw CAN socket plus the netlink interface handle, mapping the
//! core's `CanDriver` contract onto the Linux CAN subsystem.

use canopen_rs::can::{CanFrame, CanId};
use canopen_rs::{BusState, CanDriver, CanOpenError};
use socketcan::{CanInterface, CanSocket, EmbeddedFrame, Socket};
use std::io;

/// A `CanDriver` over one SocketCAN interface (e.g. "can0").
pub struct SocketCanDriver {
    socket: CanSocket,
    interface: CanInterface,
    interface_name: String,
    /// Mirrors the last state pushed into the core.
    state: BusState,
}

impl SocketCanDriver {
    /// Opens the interface in non-blocking mode.
    pub fn new(interface_name: &str) -> Result<Self, String> {
        let socket = CanSocket::open(interface_name)
            .map_err(|e| format!("cannot open {}: {}", interface_name, e))?;
        socket
            .set_nonblocking(true)
            .map_err(|e| format!("cannot set non-blocking: {}", e))?;
        let interface = CanInterface::open(interface_name)
            .map_err(|e| format!("cannot open netlink handle for {}: {:?}", interface_name, e))?;
        Ok(Self {
            socket,
            interface,
            interface_name: interface_name.to_owned(),
            state: BusState::Active,
        })
    }

    /// Attempts to receive a single frame. Returns `Ok(None)` when the
    /// socket has nothing buffered.
    pub fn try_receive(&mut self) -> Result<Option<CanFrame>, CanOpenError> {
        match self.socket.read_frame() {
            Ok(frame) => Ok(convert_incoming(&frame)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(_) => Err(CanOpenError::BusError),
        }
    }

    pub fn interface_name(&self) -> &str {
        &self.interface_name
    }
}

impl CanDriver for SocketCanDriver {
    fn send(&mut self, frame: &CanFrame) -> Result<(), CanOpenError> {
        let outgoing = convert_outgoing(frame).ok_or(CanOpenError::InvalidArgument)?;
        match self.socket.write_frame(&outgoing) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Err(CanOpenError::WouldBlock),
            Err(_) => Err(CanOpenError::BusError),
        }
    }

    fn state(&self) -> BusState {
        self.state
    }

    fn stop(&mut self) -> Result<(), CanOpenError> {
        self.interface
            .bring_down()
            .map_err(|_| CanOpenError::BusError)?;
        self.state = BusState::BusOff;
        Ok(())
    }

    fn start(&mut self) -> Result<(), CanOpenError> {
        self.interface
            .bring_up()
            .map_err(|_| CanOpenError::BusError)?;
        self.state = BusState::Active;
        Ok(())
    }

    fn set_bitrate(&mut self, bit_rate_bps: u32) -> Result<(), CanOpenError> {
        // Only valid while the interface is down.
        if self.state != BusState::BusOff {
            return Err(CanOpenError::NotAllowed);
        }
        self.interface
            .set_bitrate(bit_rate_bps, None)
            .map_err(|_| CanOpenError::BusError)
    }
}

/// Executes the LSS bit-rate activation sequence on a driver: half the
/// switch delay with the old rate still active, controller stopped, the new
/// rate applied, a full delay of bus silence, then restart.
///
/// Call when an `ActivateBitRate` request completes with
/// `LssOutcome::BitRateActivation`.
pub fn apply_bit_rate_switch(
    driver: &mut dyn CanDriver,
    delay_ms: u16,
    bit_rate_bps: u32,
) -> Result<(), CanOpenError> {
    let half = std::time::Duration::from_millis(delay_ms as u64 / 2);
    std::thread::sleep(half);
    driver.stop()?;
    std::thread::sleep(half);
    driver.set_bitrate(bit_rate_bps)?;
    std::thread::sleep(std::time::Duration::from_millis(delay_ms as u64));
    driver.start()
}

/// Converts a core frame into a SocketCAN frame.
fn convert_outgoing(frame: &CanFrame) -> Option<socketcan::CanFrame> {
    let id = match frame.id {
        CanId::Std(raw) => socketcan::Id::Standard(socketcan::StandardId::new(raw)?),
        CanId::Ext(raw) => socketcan::Id::Extended(socketcan::ExtendedId::new(raw)?),
    };
    if frame.rtr {
        socketcan::CanFrame::new_remote(id, frame.dlc as usize)
    } else {
        socketcan::CanFrame::new(id, frame.payload())
    }
}

/// Converts a received SocketCAN frame into a core frame. Error frames are
/// dropped.
fn convert_incoming(frame: &socketcan::CanFrame) -> Option<CanFrame> {
    if matches!(frame, socketcan::CanFrame::Error(_)) {
        return None;
    }
    let id = match frame.id() {
        socketcan::Id::Standard(id) => CanId::Std(id.as_raw()),
        socketcan::Id::Extended(id) => CanId::Ext(id.as_raw()),
    };
    if frame.is_remote_frame() {
        let mut remote = CanFrame::new_rtr(0, frame.dlc() as u8);
        remote.id = id;
        return Some(remote);
    }
    let mut converted = CanFrame::new(0, frame.data())?;
    converted.id = id;
    Some(converted)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outgoing_conversion_preserves_payload() {
        let frame = CanFrame::new(0x205, &[1, 2, 3]).unwrap();
        let converted = convert_outgoing(&frame).unwrap();
        assert_eq!(converted.data(), &[1, 2, 3]);
        assert!(!converted.is_remote_frame());
    }

    #[test]
    fn test_rtr_conversion() {
        let frame = CanFrame::new_rtr(0x701, 1);
        let converted = convert_outgoing(&frame).unwrap();
        assert!(converted.is_remote_frame());
    }

    #[test]
    fn test_round_trip_via_socketcan_types() {
        let frame = CanFrame::new(0x81, &[0x00, 0x81, 0x11, 1, 2, 3, 4, 5]).unwrap();
        let outgoing = convert_outgoing(&frame).unwrap();
        let back = convert_incoming(&outgoing).unwrap();
        assert_eq!(back, frame);
    }
}
