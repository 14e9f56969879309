// crates/canopen-rs/src/pdo/mod.rs

//! Process Data Objects: the time- and event-driven transport mapping
//! object dictionary ranges onto single CAN frames (CiA 301, Section 7.2.2).

pub mod rpdo;
pub mod tpdo;

pub use rpdo::{Rpdo, RpdoOutcome};
pub use tpdo::Tpdo;

use crate::od::{ObjectDictionary, PdoMapping};
use crate::sdo::AbortCode;
use alloc::vec::Vec;

/// Maximum payload of a classic PDO frame, in bits.
pub const MAX_PDO_BITS: u32 = 64;

/// The transmission type byte of the PDO communication parameter
/// (CiA 301, Table 67).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransmissionType {
    /// 0: transmitted on the SYNC following an application event.
    SynchronousAcyclic,
    /// 1..=240: transmitted on every Nth SYNC.
    SynchronousCyclic(u8),
    /// 252: updated on SYNC, transmitted on RTR only.
    SynchronousRtr,
    /// 253: transmitted on RTR only.
    AsyncRtr,
    /// 254: event-driven, manufacturer-specific event.
    EventManufacturer,
    /// 255: event-driven, device-profile event.
    EventProfile,
}

impl TransmissionType {
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::SynchronousAcyclic),
            1..=240 => Some(Self::SynchronousCyclic(raw)),
            252 => Some(Self::SynchronousRtr),
            253 => Some(Self::AsyncRtr),
            254 => Some(Self::EventManufacturer),
            255 => Some(Self::EventProfile),
            _ => None,
        }
    }

    /// True for the SYNC-driven variants.
    pub fn is_synchronous(&self) -> bool {
        matches!(
            self,
            Self::SynchronousAcyclic | Self::SynchronousCyclic(_) | Self::SynchronousRtr
        )
    }
}

/// One entry of a PDO mapping object: a 32-bit value selecting
/// `(index, sub-index, bit length)` of a local dictionary entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PdoMapEntry {
    pub index: u16,
    pub sub_index: u8,
    pub bit_length: u8,
}

impl PdoMapEntry {
    /// Decodes the OD representation `index << 16 | sub << 8 | bits`.
    pub fn from_u32(raw: u32) -> Self {
        Self {
            index: (raw >> 16) as u16,
            sub_index: (raw >> 8) as u8,
            bit_length: raw as u8,
        }
    }

    pub fn to_u32(&self) -> u32 {
        (self.index as u32) << 16 | (self.sub_index as u32) << 8 | self.bit_length as u32
    }

    /// Byte length of this entry in the frame. Mappable CiA 301 types are
    /// all whole bytes wide.
    pub fn byte_length(&self) -> usize {
        (self.bit_length as usize).div_ceil(8)
    }
}

/// Direction of a mapping, seen from this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PdoDirection {
    Transmit,
    Receive,
}

/// Reads a mapping object (0x1600+n or 0x1A00+n) and validates it: every
/// referenced entry must exist, be mappable in `direction`, match the
/// declared bit length, and the total must fit a classic frame.
pub fn read_mapping(
    od: &ObjectDictionary,
    mapping_index: u16,
    direction: PdoDirection,
) -> Result<Vec<PdoMapEntry>, AbortCode> {
    let count = od.read_u8(mapping_index, 0).ok_or(AbortCode::NoObj)? as usize;
    let mut entries = Vec::with_capacity(count);
    let mut total_bits: u32 = 0;
    for slot in 1..=count {
        let raw = od
            .read_u32(mapping_index, slot as u8)
            .ok_or(AbortCode::NoSub)?;
        if raw == 0 {
            continue;
        }
        let entry = PdoMapEntry::from_u32(raw);
        let target = od.entry(entry.index).ok_or(AbortCode::NoObj)?;
        let mappable = match direction {
            PdoDirection::Transmit => target.pdo_mapping.tx(),
            PdoDirection::Receive => target.pdo_mapping.rx(),
        };
        if !mappable {
            return Err(AbortCode::NoPdo);
        }
        let ty = target
            .data_type(entry.sub_index)
            .ok_or(AbortCode::NoSub)?;
        match ty.bit_length() {
            Some(bits) if bits == entry.bit_length as u16 => {}
            _ => return Err(AbortCode::NoPdo),
        }
        total_bits += entry.bit_length as u32;
        entries.push(entry);
    }
    if total_bits > MAX_PDO_BITS {
        return Err(AbortCode::PdoLen);
    }
    Ok(entries)
}

/// Total mapped length in bytes.
pub fn mapped_byte_length(entries: &[PdoMapEntry]) -> usize {
    entries.iter().map(PdoMapEntry::byte_length).sum()
}

/// Re-exported for mapping-aware tests and the EDS loader.
pub fn is_mappable(mapping: PdoMapping, direction: PdoDirection) -> bool {
    match direction {
        PdoDirection::Transmit => mapping.tx(),
        PdoDirection::Receive => mapping.rx(),
    }
}
