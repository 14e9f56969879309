// crates/canopen-rs/src/sync.rs

//! The SYNC object: periodic synchronization frame production and
//! consumption (CiA 301, Section 7.2.5).

use crate::can::CanFrame;
use crate::node::TimerEvent;
use crate::od::ObjectDictionary;
use crate::timer::{TimerHandle, TimerQueue};
use crate::types::COBID_SYNC_DEFAULT;
use alloc::vec::Vec;
use log::{debug, trace};

/// The SYNC engine of one node.
///
/// Production is armed from the object dictionary: object 0x1005 bit 30
/// marks this node as the SYNC producer, 0x1006 gives the period in µs and
/// 0x1019 the counter overflow (0 = no counter byte, else 2..=240).
pub struct SyncEngine {
    cob_id: u16,
    period_us: u64,
    counter_overflow: u8,
    next_counter: u8,
    producing: bool,
    timer: Option<TimerHandle>,
}

impl Default for SyncEngine {
    fn default() -> Self {
        Self {
            cob_id: COBID_SYNC_DEFAULT,
            period_us: 0,
            counter_overflow: 0,
            next_counter: 1,
            producing: false,
            timer: None,
        }
    }
}

impl SyncEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// The COB-ID SYNC frames are expected on.
    pub fn cob_id(&self) -> u16 {
        self.cob_id
    }

    /// Re-reads 0x1005/0x1006/0x1019 and (re)arms the producer timer.
    /// Called at reset-communication.
    pub fn configure(
        &mut self,
        od: &ObjectDictionary,
        timers: &mut TimerQueue<TimerEvent>,
        now: u64,
    ) {
        self.disarm(timers);
        let raw = od.read_u32(0x1005, 0).unwrap_or(COBID_SYNC_DEFAULT as u32);
        self.cob_id = (raw & 0x7FF) as u16;
        self.producing = raw & 0x4000_0000 != 0;
        self.period_us = od.read_u32(0x1006, 0).unwrap_or(0) as u64;
        self.counter_overflow = od.read_u8(0x1019, 0).unwrap_or(0);
        self.next_counter = 1;

        if self.producing && self.period_us > 0 {
            debug!(
                "[SYNC] producing on {:#05X} every {} us (overflow {})",
                self.cob_id, self.period_us, self.counter_overflow
            );
            self.timer = Some(timers.schedule(now + self.period_us, TimerEvent::SyncProduce));
        }
    }

    /// The production period elapsed: emit one SYNC and re-arm.
    pub fn on_timer(&mut self, timers: &mut TimerQueue<TimerEvent>, now: u64) -> Vec<CanFrame> {
        self.timer = None;
        if !self.producing || self.period_us == 0 {
            return Vec::new();
        }
        self.timer = Some(timers.schedule(now + self.period_us, TimerEvent::SyncProduce));

        let frame = if self.counter_overflow >= 2 {
            let counter = self.next_counter;
            self.next_counter = if counter >= self.counter_overflow {
                1
            } else {
                counter + 1
            };
            CanFrame::new(self.cob_id, &[counter])
        } else {
            CanFrame::new(self.cob_id, &[])
        };
        frame.into_iter().collect()
    }

    /// Parses a received SYNC frame into its optional counter byte.
    pub fn handle_frame(&self, frame: &CanFrame) -> Option<u8> {
        let counter = frame.payload().first().copied();
        trace!("[SYNC] consumed (counter {:?})", counter);
        counter
    }

    /// Stops production, e.g. on NMT stop or reset.
    pub fn disarm(&mut self, timers: &mut TimerQueue<TimerEvent>) {
        if let Some(handle) = self.timer.take() {
            timers.cancel(handle);
        }
    }
}
