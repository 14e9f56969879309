// crates/canopen-rs/src/pdo/tpdo.rs

use super::{mapped_byte_length, read_mapping, PdoDirection, PdoMapEntry, TransmissionType};
use crate::can::CanFrame;
use crate::node::TimerEvent;
use crate::od::ObjectDictionary;
use crate::sdo::AbortCode;
use crate::timer::{TimerHandle, TimerQueue};
use alloc::vec::Vec;
use log::{debug, warn};

/// A transmit PDO instance, configured from objects 0x1800+n / 0x1A00+n.
#[derive(Debug)]
pub struct Tpdo {
    /// 1-based PDO number.
    number: u16,
    cob_id: u16,
    transmission: TransmissionType,
    /// Minimum spacing between event-driven emissions, in 100 µs units.
    inhibit_100us: u16,
    /// Idle timer forcing an event, in ms. 0 disables it.
    event_timer_ms: u16,
    /// SYNC counter value gating emissions. 0 disables the gate.
    sync_start: u8,
    mapping: Vec<PdoMapEntry>,
    /// SYNCs seen since the last cyclic emission.
    syncs_since_emit: u8,
    /// An application event is armed (acyclic synchronous mode).
    event_pending: bool,
    /// An event arrived during the inhibit window and waits for it to close.
    deferred_event: bool,
    /// End of the current inhibit window.
    inhibit_until: u64,
    event_timer: Option<TimerHandle>,
    inhibit_timer: Option<TimerHandle>,
}

impl Tpdo {
    /// Reads TPDO `number` (1-based) from the dictionary. Returns `Ok(None)`
    /// when the communication object is absent or the COB-ID is flagged
    /// invalid (bit 31).
    pub fn from_od(od: &ObjectDictionary, number: u16) -> Result<Option<Self>, AbortCode> {
        let comm_index = 0x1800 + (number - 1);
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
        let inhibit_100us = od.read_u16(comm_index, 3).unwrap_or(0);
        let event_timer_ms = od.read_u16(comm_index, 5).unwrap_or(0);
        let sync_start = od.read_u8(comm_index, 6).unwrap_or(0);
        let mapping = read_mapping(od, 0x1A00 + (number - 1), PdoDirection::Transmit)?;

        Ok(Some(Self {
            number,
            cob_id: (raw_cob & 0x7FF) as u16,
            transmission,
            inhibit_100us,
            event_timer_ms,
            sync_start,
            mapping,
            syncs_since_emit: 0,
            event_pending: false,
            deferred_event: false,
            inhibit_until: 0,
            event_timer: None,
            inhibit_timer: None,
        }))
    }

    pub fn number(&self) -> u16 {
        self.number
    }

    pub fn cob_id(&self) -> u16 {
        self.cob_id
    }

    pub fn transmission(&self) -> TransmissionType {
        self.transmission
    }

    /// Starts the event timer (if configured). Called when the node enters
    /// OPERATIONAL.
    pub fn activate(&mut self, timers: &mut TimerQueue<TimerEvent>, now: u64) {
        self.syncs_since_emit = 0;
        self.event_pending = false;
        self.deferred_event = false;
        self.inhibit_until = 0;
        self.arm_event_timer(timers, now);
    }

    /// Cancels timers and suspends emission. Called when the node leaves
    /// OPERATIONAL or on bus-off.
    pub fn deactivate(&mut self, timers: &mut TimerQueue<TimerEvent>) {
        if let Some(handle) = self.event_timer.take() {
            timers.cancel(handle);
        }
        if let Some(handle) = self.inhibit_timer.take() {
            timers.cancel(handle);
        }
        self.event_pending = false;
        self.deferred_event = false;
    }

    /// A SYNC arrived. Synchronous TPDOs may emit.
    pub fn on_sync(
        &mut self,
        od: &mut ObjectDictionary,
        timers: &mut TimerQueue<TimerEvent>,
        counter: Option<u8>,
        now: u64,
    ) -> Vec<CanFrame> {
        if self.sync_start != 0 && counter != Some(self.sync_start) {
            return Vec::new();
        }
        match self.transmission {
            TransmissionType::SynchronousAcyclic => {
                if self.event_pending {
                    self.event_pending = false;
                    self.emit(od, timers, now)
                } else {
                    Vec::new()
                }
            }
            TransmissionType::SynchronousCyclic(every) => {
                self.syncs_since_emit += 1;
                if self.syncs_since_emit >= every {
                    self.syncs_since_emit = 0;
                    self.emit(od, timers, now)
                } else {
                    Vec::new()
                }
            }
            _ => Vec::new(),
        }
    }

    /// An application event: emit now (event-driven), or arm for the next
    /// SYNC (synchronous acyclic). Emissions inside the inhibit window are
    /// deferred to its end.
    pub fn event(
        &mut self,
        od: &mut ObjectDictionary,
        timers: &mut TimerQueue<TimerEvent>,
        now: u64,
    ) -> Vec<CanFrame> {
        match self.transmission {
            TransmissionType::SynchronousAcyclic => {
                self.event_pending = true;
                Vec::new()
            }
            TransmissionType::EventManufacturer | TransmissionType::EventProfile => {
                if now < self.inhibit_until {
                    if !self.deferred_event {
                        self.deferred_event = true;
                        self.inhibit_timer = Some(
                            timers.schedule(self.inhibit_until, TimerEvent::TpdoInhibit(self.number)),
                        );
                    }
                    Vec::new()
                } else {
                    self.emit(od, timers, now)
                }
            }
            _ => Vec::new(),
        }
    }

    /// A remote transmission request for this TPDO's COB-ID.
    pub fn on_rtr(
        &mut self,
        od: &mut ObjectDictionary,
        timers: &mut TimerQueue<TimerEvent>,
        now: u64,
    ) -> Vec<CanFrame> {
        match self.transmission {
            TransmissionType::SynchronousRtr | TransmissionType::AsyncRtr => {
                self.emit(od, timers, now)
            }
            _ => Vec::new(),
        }
    }

    /// The idle event timer fired: force an event.
    pub fn on_event_timer(
        &mut self,
        od: &mut ObjectDictionary,
        timers: &mut TimerQueue<TimerEvent>,
        now: u64,
    ) -> Vec<CanFrame> {
        self.event_timer = None;
        debug!("[PDO] TPDO {} event timer elapsed", self.number);
        self.event(od, timers, now)
    }

    /// The inhibit window closed: flush a deferred event.
    pub fn on_inhibit_elapsed(
        &mut self,
        od: &mut ObjectDictionary,
        timers: &mut TimerQueue<TimerEvent>,
        now: u64,
    ) -> Vec<CanFrame> {
        self.inhibit_timer = None;
        if self.deferred_event {
            self.deferred_event = false;
            self.emit(od, timers, now)
        } else {
            Vec::new()
        }
    }

    /// Assembles and emits the frame, restarting inhibit and event timers.
    fn emit(
        &mut self,
        od: &mut ObjectDictionary,
        timers: &mut TimerQueue<TimerEvent>,
        now: u64,
    ) -> Vec<CanFrame> {
        let Some(frame) = self.assemble(od) else {
            return Vec::new();
        };
        if self.inhibit_100us > 0 {
            self.inhibit_until = now + self.inhibit_100us as u64 * 100;
        }
        self.arm_event_timer(timers, now);
        alloc::vec![frame]
    }

    /// Concatenates the mapped dictionary values, little-endian, no padding
    /// between sub-fields.
    fn assemble(&self, od: &mut ObjectDictionary) -> Option<CanFrame> {
        let mut payload = Vec::with_capacity(mapped_byte_length(&self.mapping));
        for entry in &self.mapping {
            match od.upload(entry.index, entry.sub_index) {
                Ok(bytes) => {
                    let want = entry.byte_length();
                    if bytes.len() < want {
                        warn!(
                            "[PDO] TPDO {} mapping {:#06X}:{:#04X} shorter than declared",
                            self.number, entry.index, entry.sub_index
                        );
                        return None;
                    }
                    payload.extend_from_slice(&bytes[..want]);
                }
                Err(code) => {
                    warn!(
                        "[PDO] TPDO {} cannot read {:#06X}:{:#04X}: {}",
                        self.number, entry.index, entry.sub_index, code
                    );
                    return None;
                }
            }
        }
        CanFrame::new(self.cob_id, &payload)
    }

    fn arm_event_timer(&mut self, timers: &mut TimerQueue<TimerEvent>, now: u64) {
        if let Some(handle) = self.event_timer.take() {
            timers.cancel(handle);
        }
        if self.event_timer_ms > 0
            && matches!(
                self.transmission,
                TransmissionType::EventManufacturer | TransmissionType::EventProfile
            )
        {
            self.event_timer = Some(timers.schedule(
                now + self.event_timer_ms as u64 * 1000,
                TimerEvent::TpdoEventTimer(self.number),
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::od::{AccessType, ObjectEntry, ObjectValue, PdoMapping};
    use alloc::vec;

    fn tpdo_od(transmission: u8, inhibit_100us: u16, event_timer_ms: u16) -> ObjectDictionary {
        let mut od = ObjectDictionary::new();
        od.insert(
            0x6000,
            ObjectEntry::variable("Status", ObjectValue::Unsigned16(0xBEEF))
                .with_pdo_mapping(PdoMapping::Tpdo),
        );
        od.insert(
            0x6001,
            ObjectEntry::variable("Counter", ObjectValue::Unsigned8(0x7))
                .with_pdo_mapping(PdoMapping::Tpdo),
        );
        od.insert(
            0x1800,
            ObjectEntry::record(
                "Tpdo1Comm",
                vec![
                    ObjectValue::Unsigned32(0x181),
                    ObjectValue::Unsigned8(transmission),
                    ObjectValue::Unsigned16(inhibit_100us),
                    ObjectValue::Unsigned8(0), // reserved
                    ObjectValue::Unsigned16(event_timer_ms),
                    ObjectValue::Unsigned8(0), // sync start
                ],
                AccessType::ReadWrite,
            ),
        );
        od.insert(
            0x1A00,
            ObjectEntry::array(
                "Tpdo1Mapping",
                vec![
                    ObjectValue::Unsigned32(0x6000_0010),
                    ObjectValue::Unsigned32(0x6001_0008),
                ],
                AccessType::ReadWrite,
            ),
        );
        od
    }

    #[test]
    fn test_sync_cyclic_fires_every_nth() {
        let mut od = tpdo_od(3, 0, 0);
        let mut timers = TimerQueue::new();
        let mut tpdo = Tpdo::from_od(&od, 1).unwrap().unwrap();
        tpdo.activate(&mut timers, 0);

        let mut emitted = Vec::new();
        for _ in 0..4 {
            emitted.extend(tpdo.on_sync(&mut od, &mut timers, None, 0));
        }
        // Exactly one frame, after the third SYNC.
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].cob_id(), Some(0x181));
        assert_eq!(emitted[0].payload(), &[0xEF, 0xBE, 0x07]);
    }

    #[test]
    fn test_acyclic_fires_on_sync_after_event() {
        let mut od = tpdo_od(0, 0, 0);
        let mut timers = TimerQueue::new();
        let mut tpdo = Tpdo::from_od(&od, 1).unwrap().unwrap();
        tpdo.activate(&mut timers, 0);

        assert!(tpdo.on_sync(&mut od, &mut timers, None, 0).is_empty());
        assert!(tpdo.event(&mut od, &mut timers, 0).is_empty());
        assert_eq!(tpdo.on_sync(&mut od, &mut timers, None, 0).len(), 1);
        // Consumed: the next SYNC is silent again.
        assert!(tpdo.on_sync(&mut od, &mut timers, None, 0).is_empty());
    }

    #[test]
    fn test_event_driven_respects_inhibit() {
        let mut od = tpdo_od(254, 10, 0); // inhibit = 1 ms
        let mut timers = TimerQueue::new();
        let mut tpdo = Tpdo::from_od(&od, 1).unwrap().unwrap();
        tpdo.activate(&mut timers, 0);

        assert_eq!(tpdo.event(&mut od, &mut timers, 0).len(), 1);
        // Within the inhibit window: deferred, not dropped.
        assert!(tpdo.event(&mut od, &mut timers, 500).is_empty());
        assert_eq!(timers.pop_due(1000), Some(TimerEvent::TpdoInhibit(1)));
        let frames = tpdo.on_inhibit_elapsed(&mut od, &mut timers, 1000);
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn test_event_timer_forces_emission() {
        let mut od = tpdo_od(255, 0, 5);
        let mut timers = TimerQueue::new();
        let mut tpdo = Tpdo::from_od(&od, 1).unwrap().unwrap();
        tpdo.activate(&mut timers, 0);

        assert_eq!(timers.pop_due(5_000), Some(TimerEvent::TpdoEventTimer(1)));
        let frames = tpdo.on_event_timer(&mut od, &mut timers, 5_000);
        assert_eq!(frames.len(), 1);
        // Re-armed after the forced emission.
        assert_eq!(timers.next_deadline(), Some(10_000));
    }

    #[test]
    fn test_sync_start_value_gates_emission() {
        let mut od = tpdo_od(1, 0, 0);
        od.write(0x1800, 6, ObjectValue::Unsigned8(2)).unwrap();
        let mut timers = TimerQueue::new();
        let mut tpdo = Tpdo::from_od(&od, 1).unwrap().unwrap();
        tpdo.activate(&mut timers, 0);

        assert!(tpdo.on_sync(&mut od, &mut timers, Some(1), 0).is_empty());
        assert_eq!(tpdo.on_sync(&mut od, &mut timers, Some(2), 0).len(), 1);
        assert!(tpdo.on_sync(&mut od, &mut timers, Some(3), 0).is_empty());
    }

    #[test]
    fn test_disabled_cob_id_yields_none() {
        let mut od = tpdo_od(1, 0, 0);
        od.write(0x1800, 1, ObjectValue::Unsigned32(0x8000_0181))
            .unwrap();
        assert!(Tpdo::from_od(&od, 1).unwrap().is_none());
    }

    #[test]
    fn test_rtr_modes() {
        let mut od = tpdo_od(253, 0, 0);
        let mut timers = TimerQueue::new();
        let mut tpdo = Tpdo::from_od(&od, 1).unwrap().unwrap();
        tpdo.activate(&mut timers, 0);
        assert_eq!(tpdo.on_rtr(&mut od, &mut timers, 0).len(), 1);
        // Plain events do nothing in RTR-only mode.
        assert!(tpdo.event(&mut od, &mut timers, 0).is_empty());
    }
}
