// crates/canopen-rs/src/nmt/redundancy.rs

//! Bus-toggle redundancy (CiA 302-6): two physical channels, `default` and
//! `alternate`. The master publishes its heartbeat on the active channel;
//! consecutive missing heartbeats trigger a channel switch, bounded by a
//! toggle budget.

use crate::node::TimerEvent;
use crate::timer::{TimerHandle, TimerQueue};
use alloc::vec::Vec;
use log::{info, warn};

/// Decisions taken by the redundancy manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedundancyEvent {
    /// Switch the driver to the other channel.
    SwitchChannel { alternate: bool },
    /// The toggle budget is exhausted: raise an emergency and stay put.
    ToggleBudgetExhausted,
}

/// Counts missed master heartbeats and decides channel switches.
pub struct RedundancyManager {
    /// Missed heartbeats before a switch.
    ntoggle: u8,
    /// Grace windows after a switch before counting resumes.
    ttoggle: u8,
    /// Maximum number of switches before giving up.
    ctoggle: u8,
    /// The master heartbeat period, which is also the observation window.
    period_us: u64,
    missed: u8,
    grace: u8,
    toggles: u8,
    on_alternate: bool,
    exhausted: bool,
    timer: Option<TimerHandle>,
}

impl RedundancyManager {
    pub fn new() -> Self {
        Self {
            ntoggle: 0,
            ttoggle: 0,
            ctoggle: 0,
            period_us: 0,
            missed: 0,
            grace: 0,
            toggles: 0,
            on_alternate: false,
            exhausted: false,
            timer: None,
        }
    }

    /// Arms the manager. `period_us` is the expected master heartbeat
    /// spacing; zero disables the protocol.
    pub fn configure(
        &mut self,
        ntoggle: u8,
        ttoggle: u8,
        ctoggle: u8,
        period_us: u64,
        timers: &mut TimerQueue<TimerEvent>,
        now: u64,
    ) {
        self.disarm(timers);
        self.ntoggle = ntoggle;
        self.ttoggle = ttoggle;
        self.ctoggle = ctoggle;
        self.period_us = period_us;
        self.missed = 0;
        self.grace = 0;
        self.toggles = 0;
        self.on_alternate = false;
        self.exhausted = false;
        if ntoggle > 0 && period_us > 0 {
            info!(
                "[NMT] redundancy armed: Ntoggle={} Ttoggle={} Ctoggle={}",
                ntoggle, ttoggle, ctoggle
            );
            self.timer = Some(timers.schedule(now + period_us, TimerEvent::RedundancyWindow));
        }
    }

    /// True when the alternate channel is active.
    pub fn on_alternate(&self) -> bool {
        self.on_alternate
    }

    /// A master heartbeat was observed on the active channel.
    pub fn on_heartbeat(&mut self) {
        self.missed = 0;
        self.grace = 0;
    }

    /// One observation window elapsed without the counter being reset.
    pub fn on_window(
        &mut self,
        timers: &mut TimerQueue<TimerEvent>,
        now: u64,
    ) -> Vec<RedundancyEvent> {
        self.timer = None;
        if self.ntoggle == 0 || self.period_us == 0 {
            return Vec::new();
        }
        self.timer = Some(timers.schedule(now + self.period_us, TimerEvent::RedundancyWindow));

        if self.exhausted {
            return Vec::new();
        }
        if self.grace > 0 {
            self.grace -= 1;
            return Vec::new();
        }
        self.missed = self.missed.saturating_add(1);
        if self.missed < self.ntoggle {
            return Vec::new();
        }
        self.missed = 0;

        if self.toggles >= self.ctoggle {
            warn!("[NMT] redundancy toggle budget exhausted; staying on current channel");
            self.exhausted = true;
            return alloc::vec![RedundancyEvent::ToggleBudgetExhausted];
        }
        self.toggles += 1;
        self.on_alternate = !self.on_alternate;
        self.grace = self.ttoggle;
        info!(
            "[NMT] switching to {} bus channel (toggle {}/{})",
            if self.on_alternate { "alternate" } else { "default" },
            self.toggles,
            self.ctoggle
        );
        alloc::vec![RedundancyEvent::SwitchChannel {
            alternate: self.on_alternate
        }]
    }

    pub fn disarm(&mut self, timers: &mut TimerQueue<TimerEvent>) {
        if let Some(handle) = self.timer.take() {
            timers.cancel(handle);
        }
    }
}

impl Default for RedundancyManager {
    fn default() -> Self {
        Self::new()
    }
}
