// crates/canopen-rs/src/pdo/rpdo.rs

use super::{mapped_byte_length, read_mapping, PdoDirection, PdoMapEntry, TransmissionType};
use crate::can::CanFrame;
use crate::od::ObjectDictionary;
use crate::sdo::AbortCode;
use alloc::vec::Vec;
use log::warn;

/// Result of feeding a frame (or a SYNC) into an RPDO.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpdoOutcome {
    /// The payload was written into the mapped entries.
    Committed,
    /// The payload was buffered until the next SYNC.
    Buffered,
    /// The payload length does not match the mapping; nothing was written.
    LengthError,
    /// Nothing to do.
    None,
}

/// A receive PDO instance, configured from objects 0x1400+n / 0x1600+n.
#[derive(Debug)]
pub struct Rpdo {
    /// 1-based PDO number.
    number: u16,
    cob_id: u16,
    transmission: TransmissionType,
    mapping: Vec<PdoMapEntry>,
    /// Payload awaiting the next SYNC (synchronous modes).
    buffered: Option<Vec<u8>>,
}

impl Rpdo {
    /// Reads RPDO `number` (1-based) from the dictionary. Returns `Ok(None)`
    /// when absent or disabled via COB-ID bit 31.
    pub fn from_od(od: &ObjectDictionary, number: u16) -> Result<Option<Self>, AbortCode> {
        let comm_index = 0x1400 + (number - 1);
        let Some(raw_cob) = od.read_u32(comm_index, 1) else {
            return Ok(None);
        };
        if raw_cob & 0x8000_0000 != 0 {
            return Ok(None);
        }
        let transmission = od
            .read_u8(comm_index, 2)
            .and_then(TransmissionType::from_u8)
            .ok_or(AbortCode::ParamRange)?;
        let mapping = read_mapping(od, 0x1600 + (number - 1), PdoDirection::Receive)?;
        Ok(Some(Self {
            number,
            cob_id: (raw_cob & 0x7FF) as u16,
            transmission,
            mapping,
            buffered: None,
        }))
    }

    pub fn number(&self) -> u16 {
        self.number
    }

    pub fn cob_id(&self) -> u16 {
        self.cob_id
    }

    /// Drops any buffered payload. Called when the node leaves OPERATIONAL.
    pub fn deactivate(&mut self) {
        self.buffered = None;
    }

    /// Feeds a received frame into this RPDO.
    pub fn handle_frame(&mut self, od: &mut ObjectDictionary, frame: &CanFrame) -> RpdoOutcome {
        let payload = frame.payload();
        if payload.len() != mapped_byte_length(&self.mapping) {
            warn!(
                "[PDO] RPDO {} length mismatch: got {} byte(s), mapped {}",
                self.number,
                payload.len(),
                mapped_byte_length(&self.mapping)
            );
            return RpdoOutcome::LengthError;
        }
        if self.transmission.is_synchronous() {
            self.buffered = Some(payload.to_vec());
            RpdoOutcome::Buffered
        } else {
            self.commit(od, payload)
        }
    }

    /// A SYNC arrived: commit the buffered payload, if any.
    pub fn on_sync(&mut self, od: &mut ObjectDictionary) -> RpdoOutcome {
        match self.buffered.take() {
            Some(payload) => self.commit(od, &payload),
            None => RpdoOutcome::None,
        }
    }

    /// Writes the payload into the mapped entries in declaration order.
    fn commit(&self, od: &mut ObjectDictionary, payload: &[u8]) -> RpdoOutcome {
        let mut offset = 0;
        for entry in &self.mapping {
            let len = entry.byte_length();
            if let Err(code) = od.download(entry.index, entry.sub_index, &payload[offset..offset + len])
            {
                warn!(
                    "[PDO] RPDO {} write to {:#06X}:{:#04X} failed: {}",
                    self.number, entry.index, entry.sub_index, code
                );
                return RpdoOutcome::LengthError;
            }
            offset += len;
        }
        RpdoOutcome::Committed
    }
}
