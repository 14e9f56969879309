// crates/canopen-rs/src/timestamp.rs

//! The TIME stamp object: time-of-day broadcast (CiA 301, Section 7.2.6).

use crate::can::CanFrame;
use crate::node::TimerEvent;
use crate::od::{ObjectDictionary, TimeOfDay};
use crate::timer::{TimerHandle, TimerQueue};
use crate::types::COBID_TIME_DEFAULT;
use alloc::vec::Vec;
use log::debug;

/// The TIME engine of one node.
///
/// Object 0x1012 configures the COB-ID: bit 31 marks this node as a
/// consumer, bit 30 as the producer. Periodic production is optional and
/// programmatic (`set_period_us`); the wall-clock source is supplied by the
/// embedding program on each emission.
pub struct TimeStampEngine {
    cob_id: u16,
    consuming: bool,
    producing: bool,
    period_us: u64,
    timer: Option<TimerHandle>,
    /// Reference time supplied by the application for periodic production.
    current: TimeOfDay,
}

impl Default for TimeStampEngine {
    fn default() -> Self {
        Self {
            cob_id: COBID_TIME_DEFAULT,
            consuming: false,
            producing: false,
            period_us: 0,
            timer: None,
            current: TimeOfDay::default(),
        }
    }
}

impl TimeStampEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cob_id(&self) -> u16 {
        self.cob_id
    }

    pub fn is_consuming(&self) -> bool {
        self.consuming
    }

    /// Re-reads object 0x1012. Called at reset-communication.
    pub fn configure(
        &mut self,
        od: &ObjectDictionary,
        timers: &mut TimerQueue<TimerEvent>,
        now: u64,
    ) {
        self.disarm(timers);
        let raw = od.read_u32(0x1012, 0).unwrap_or(COBID_TIME_DEFAULT as u32);
        self.cob_id = (raw & 0x7FF) as u16;
        self.consuming = raw & 0x8000_0000 != 0;
        self.producing = raw & 0x4000_0000 != 0;
        if self.producing && self.period_us > 0 {
            self.timer = Some(timers.schedule(now + self.period_us, TimerEvent::TimeProduce));
        }
    }

    /// Enables periodic production with the given spacing.
    pub fn set_period_us(
        &mut self,
        period_us: u64,
        timers: &mut TimerQueue<TimerEvent>,
        now: u64,
    ) {
        self.disarm(timers);
        self.period_us = period_us;
        if self.producing && period_us > 0 {
            self.timer = Some(timers.schedule(now + period_us, TimerEvent::TimeProduce));
        }
    }

    /// Updates the wall-clock value broadcast by the periodic producer.
    pub fn set_time(&mut self, time: TimeOfDay) {
        self.current = time;
    }

    /// Builds one TIME frame for an explicit broadcast.
    pub fn produce(&self, time: TimeOfDay) -> Vec<CanFrame> {
        if !self.producing {
            return Vec::new();
        }
        let mut data = [0u8; 6];
        data[0..4].copy_from_slice(&(time.millis & 0x0FFF_FFFF).to_le_bytes());
        data[4..6].copy_from_slice(&time.days.to_le_bytes());
        debug!("[TIME] broadcasting day {} ms {}", time.days, time.millis);
        CanFrame::new(self.cob_id, &data).into_iter().collect()
    }

    /// The periodic producer fired.
    pub fn on_timer(&mut self, timers: &mut TimerQueue<TimerEvent>, now: u64) -> Vec<CanFrame> {
        self.timer = None;
        if !self.producing || self.period_us == 0 {
            return Vec::new();
        }
        self.timer = Some(timers.schedule(now + self.period_us, TimerEvent::TimeProduce));
        self.produce(self.current)
    }

    /// Parses a received TIME frame.
    pub fn handle_frame(&self, frame: &CanFrame) -> Option<TimeOfDay> {
        if !self.consuming {
            return None;
        }
        let data = frame.payload();
        if data.len() < 6 {
            return None;
        }
        Some(TimeOfDay {
            millis: u32::from_le_bytes([data[0], data[1], data[2], data[3]]) & 0x0FFF_FFFF,
            days: u16::from_le_bytes([data[4], data[5]]),
        })
    }

    pub fn disarm(&mut self, timers: &mut TimerQueue<TimerEvent>) {
        if let Some(handle) = self.timer.take() {
            timers.cancel(handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::od::{self, ObjectValue};
    use crate::types::NodeId;

    #[test]
    fn test_producer_frame_layout() {
        let mut dictionary = ObjectDictionary::new();
        od::predefined::populate(&mut dictionary, NodeId(1));
        dictionary
            .write(0x1012, 0, ObjectValue::Unsigned32(0x4000_0100))
            .unwrap();
        let mut timers = TimerQueue::new();
        let mut engine = TimeStampEngine::new();
        engine.configure(&dictionary, &mut timers, 0);

        let frames = engine.produce(TimeOfDay {
            millis: 43_200_000,
            days: 15_000,
        });
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].cob_id(), Some(0x100));
        assert_eq!(frames[0].dlc, 6);
    }

    #[test]
    fn test_consumer_parses_frame() {
        let mut dictionary = ObjectDictionary::new();
        od::predefined::populate(&mut dictionary, NodeId(1));
        dictionary
            .write(0x1012, 0, ObjectValue::Unsigned32(0x8000_0100))
            .unwrap();
        let mut timers = TimerQueue::new();
        let mut engine = TimeStampEngine::new();
        engine.configure(&dictionary, &mut timers, 0);
        assert!(engine.is_consuming());

        let mut data = [0u8; 6];
        data[0..4].copy_from_slice(&1000u32.to_le_bytes());
        data[4..6].copy_from_slice(&42u16.to_le_bytes());
        let frame = CanFrame::new(0x100, &data).unwrap();
        assert_eq!(
            engine.handle_frame(&frame),
            Some(TimeOfDay {
                millis: 1000,
                days: 42
            })
        );
    }

    #[test]
    fn test_non_consumer_ignores_frames() {
        let engine = TimeStampEngine::new();
        let frame = CanFrame::new(0x100, &[0u8; 6]).unwrap();
        assert!(engine.handle_frame(&frame).is_none());
    }
}
