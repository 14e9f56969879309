// crates/canopen-rs/src/emcy.rs

//! The emergency object: error-history stack, EMCY producer and consumer
//! (CiA 301, Section 7.2.7).

use crate::can::CanFrame;
use crate::od::{ObjectDictionary, ObjectValue};
use crate::sdo::AbortCode;
use crate::types::NodeId;
use alloc::collections::VecDeque;
use alloc::vec::Vec;
use log::{debug, warn};

/// Upper bound of the error history (object 0x1003 holds at most 254
/// entries).
pub const MAX_ERROR_HISTORY: usize = 254;

/// One emergency record, as carried in the 8-byte EMCY frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EmcyRecord {
    /// Emergency error code (CiA 301, Table 26).
    pub error_code: u16,
    /// Mirror of object 0x1001.
    pub error_register: u8,
    /// Manufacturer-specific diagnostic bytes.
    pub manufacturer_info: [u8; 5],
}

impl EmcyRecord {
    fn to_frame_payload(self) -> [u8; 8] {
        let mut data = [0u8; 8];
        data[0..2].copy_from_slice(&self.error_code.to_le_bytes());
        data[2] = self.error_register;
        data[3..8].copy_from_slice(&self.manufacturer_info);
        data
    }

    fn from_frame_payload(data: &[u8]) -> Option<Self> {
        if data.len() < 8 {
            return None;
        }
        let mut manufacturer_info = [0u8; 5];
        manufacturer_info.copy_from_slice(&data[3..8]);
        Some(Self {
            error_code: u16::from_le_bytes([data[0], data[1]]),
            error_register: data[2],
            manufacturer_info,
        })
    }
}

/// The emergency engine of one node: producer, bounded history and the
/// consumer registry.
pub struct EmcyEngine {
    node_id: NodeId,
    /// Newest-first history, mirrored into object 0x1003.
    history: VecDeque<EmcyRecord>,
    /// Producer nodes whose emergencies are delivered to the application.
    consumed_producers: Vec<NodeId>,
}

impl EmcyEngine {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            history: VecDeque::new(),
            consumed_producers: Vec::new(),
        }
    }

    /// The COB-ID this node produces emergencies on: object 0x1014 when
    /// present, otherwise 0x80 + node-ID. Bit 31 set means the producer is
    /// disabled.
    fn producer_cob_id(&self, od: &ObjectDictionary) -> Option<u16> {
        let raw = od
            .read_u32(0x1014, 0)
            .unwrap_or(self.node_id.emcy_cob_id() as u32);
        if raw & 0x8000_0000 != 0 {
            return None;
        }
        Some((raw & 0x7FF) as u16)
    }

    /// Produces an emergency: pushes onto the history, mirrors object
    /// 0x1003/0x1001, and returns the frame to emit (if the producer is
    /// enabled).
    pub fn produce(&mut self, od: &mut ObjectDictionary, record: EmcyRecord) -> Vec<CanFrame> {
        warn!(
            "[EMCY] producing emergency {:#06X} (register {:#04X})",
            record.error_code, record.error_register
        );
        self.history.push_front(record);
        self.history.truncate(MAX_ERROR_HISTORY);
        self.refresh_od(od);
        let _ = od.write_internal(
            0x1001,
            0,
            ObjectValue::Unsigned8(record.error_register),
            false,
        );

        match self.producer_cob_id(od) {
            Some(cob_id) => CanFrame::new(cob_id, &record.to_frame_payload())
                .into_iter()
                .collect(),
            None => Vec::new(),
        }
    }

    /// Registers interest in emergencies from `producer`.
    pub fn consume_from(&mut self, producer: NodeId) {
        if !self.consumed_producers.contains(&producer) {
            self.consumed_producers.push(producer);
        }
    }

    /// Handles a received EMCY frame; returns the parsed record when a
    /// consumer is registered for the producer.
    pub fn handle_frame(&mut self, producer: NodeId, frame: &CanFrame) -> Option<EmcyRecord> {
        let record = EmcyRecord::from_frame_payload(frame.payload())?;
        debug!(
            "[EMCY] node {} reports {:#06X} (register {:#04X})",
            producer, record.error_code, record.error_register
        );
        self.consumed_producers
            .contains(&producer)
            .then_some(record)
    }

    /// Number of recorded errors.
    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    /// Clears the history, e.g. on a write of 0 to object 0x1003:0.
    pub fn clear_history(&mut self, od: &mut ObjectDictionary) {
        self.history.clear();
        self.refresh_od(od);
    }

    /// Validates a write to object 0x1003:0 per CiA 301: only the value 0
    /// (clear) is accepted.
    pub fn validate_history_write(data: &[u8]) -> Result<(), AbortCode> {
        if data.len() == 1 && data[0] == 0 {
            Ok(())
        } else {
            Err(AbortCode::ParamRange)
        }
    }

    /// Rewrites object 0x1003 from the in-memory history (newest first, as
    /// `error_code | (manufacturer bits << 16)` per the standard layout).
    fn refresh_od(&self, od: &mut ObjectDictionary) {
        let values: Vec<ObjectValue> = self
            .history
            .iter()
            .map(|record| {
                let additional =
                    u16::from_le_bytes([record.manufacturer_info[0], record.manufacturer_info[1]]);
                ObjectValue::Unsigned32((additional as u32) << 16 | record.error_code as u32)
            })
            .collect();
        od.insert(
            0x1003,
            crate::od::ObjectEntry::array(
                "PreDefinedErrorField",
                values,
                crate::od::AccessType::ReadOnly,
            ),
        );
    }
}
