//! The MAC's timers. They only track state here; the actual expiry events
//! are scheduled through the [`MacContext`].

use mr80211_abstract::{MacContext, TimerKind};

use crate::error::MacError;

#[derive(Debug, Clone)]
pub struct MacTimer {
    kind: TimerKind,
    busy: bool,
    paused: bool,
    stime: f64,
    rtime: f64,
}

impl MacTimer {
    pub fn new(kind: TimerKind) -> Self {
        Self {
            kind,
            busy: false,
            paused: false,
            stime: 0.0,
            rtime: 0.0,
        }
    }

    pub fn kind(&self) -> TimerKind {
        self.kind
    }

    pub fn busy(&self) -> bool {
        self.busy
    }

    pub fn paused(&self) -> bool {
        self.paused
    }

    pub fn start(&mut self, ctx: &mut dyn MacContext, t: f64) -> Result<(), MacError> {
        if self.busy {
            return Err(MacError::invariant(format!("{:?} timer started while busy", self.kind)));
        }
        self.busy = true;
        self.paused = false;
        self.stime = ctx.now();
        self.rtime = t;
        ctx.start_timer(self.kind, t);
        Ok(())
    }

    pub fn stop(&mut self, ctx: &mut dyn MacContext) -> Result<(), MacError> {
        if !self.busy {
            return Err(MacError::invariant(format!("{:?} timer stopped while idle", self.kind)));
        }
        if !self.paused {
            ctx.cancel_timer(self.kind);
        }
        self.clear();
        Ok(())
    }

    /// Time left until expiry.
    pub fn expire(&self, now: f64) -> f64 {
        self.stime + self.rtime - now
    }

    /// Called when the scheduled expiry fires, before the handler runs.
    pub fn expired(&mut self) {
        self.clear();
    }

    fn clear(&mut self) {
        self.busy = false;
        self.paused = false;
        self.stime = 0.0;
        self.rtime = 0.0;
    }
}

/// Random backoff counted in slots, frozen while the medium is busy.
#[derive(Debug, Clone)]
pub struct BackoffTimer {
    timer: MacTimer,
    difs_wait: f64,
    slot_time: f64,
}

impl BackoffTimer {
    pub fn new(slot_time: f64) -> Self {
        Self {
            timer: MacTimer::new(TimerKind::Backoff),
            difs_wait: 0.0,
            slot_time,
        }
    }

    pub fn set_slot_time(&mut self, slot_time: f64) {
        self.slot_time = slot_time;
    }

    pub fn busy(&self) -> bool {
        self.timer.busy
    }

    pub fn paused(&self) -> bool {
        self.timer.paused
    }

    /// Remaining backoff, excluding any DIFS still to wait.
    pub fn remaining(&self) -> f64 {
        self.timer.rtime
    }

    /// Draw a backoff in `[0, cw)` slots. A busy channel freezes it until
    /// [`BackoffTimer::resume`].
    pub fn start(&mut self, ctx: &mut dyn MacContext, cw: u32, idle: bool, difs: f64) -> Result<(), MacError> {
        if self.timer.busy {
            return Err(MacError::invariant("backoff started while busy"));
        }
        if cw == 0 {
            return Err(MacError::invariant("backoff with empty contention window"));
        }
        let slots = ctx.rng().next_u32() % cw;
        self.timer.busy = true;
        self.timer.paused = !idle;
        self.timer.stime = ctx.now();
        self.timer.rtime = f64::from(slots) * self.slot_time;
        self.difs_wait = difs;
        if idle {
            ctx.start_timer(TimerKind::Backoff, self.timer.rtime + difs);
        }
        Ok(())
    }

    pub fn pause(&mut self, ctx: &mut dyn MacContext) -> Result<(), MacError> {
        if !self.timer.busy || self.timer.paused {
            return Err(MacError::invariant("backoff paused while not running"));
        }
        let elapsed = ctx.now() - (self.timer.stime + self.difs_wait);
        let slots = (elapsed / self.slot_time).floor().max(0.0);
        self.timer.rtime = (self.timer.rtime - slots * self.slot_time).max(0.0);
        self.difs_wait = 0.0;
        ctx.cancel_timer(TimerKind::Backoff);
        self.timer.paused = true;
        Ok(())
    }

    pub fn resume(&mut self, ctx: &mut dyn MacContext, difs: f64) -> Result<(), MacError> {
        if !self.timer.busy || !self.timer.paused {
            return Err(MacError::invariant("backoff resumed while not paused"));
        }
        self.timer.paused = false;
        self.timer.stime = ctx.now();
        self.difs_wait = difs;
        ctx.start_timer(TimerKind::Backoff, self.timer.rtime + difs);
        Ok(())
    }

    pub fn stop(&mut self, ctx: &mut dyn MacContext) -> Result<(), MacError> {
        self.difs_wait = 0.0;
        self.timer.stop(ctx)
    }

    pub fn expired(&mut self) {
        self.difs_wait = 0.0;
        self.timer.expired();
    }
}

#[derive(Debug, Clone)]
pub struct MacTimers {
    pub backoff: BackoffTimer,
    pub defer: MacTimer,
    pub send: MacTimer,
    pub recv: MacTimer,
    pub nav: MacTimer,
    pub interface: MacTimer,
}

impl MacTimers {
    pub fn new(slot_time: f64) -> Self {
        Self {
            backoff: BackoffTimer::new(slot_time),
            defer: MacTimer::new(TimerKind::Defer),
            send: MacTimer::new(TimerKind::Send),
            recv: MacTimer::new(TimerKind::Recv),
            nav: MacTimer::new(TimerKind::Nav),
            interface: MacTimer::new(TimerKind::Interface),
        }
    }

    /// Clear the state of `kind` ahead of running its handler.
    pub fn expired(&mut self, kind: TimerKind) {
        match kind {
            TimerKind::Backoff => self.backoff.expired(),
            TimerKind::Defer => self.defer.expired(),
            TimerKind::Send => self.send.expired(),
            TimerKind::Recv => self.recv.expired(),
            TimerKind::Nav => self.nav.expired(),
            TimerKind::Interface => self.interface.expired(),
        }
    }

    pub fn is_busy(&self, kind: TimerKind) -> bool {
        match kind {
            TimerKind::Backoff => self.backoff.busy(),
            TimerKind::Defer => self.defer.busy(),
            TimerKind::Send => self.send.busy(),
            TimerKind::Recv => self.recv.busy(),
            TimerKind::Nav => self.nav.busy(),
            TimerKind::Interface => self.interface.busy(),
        }
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use mr80211_abstract::{MacContext, MacFrame, TimerKind, TxFailReason};
    use rand::RngCore;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::collections::HashMap;

    /// Records every request a MAC makes; time only moves when a test says so.
    pub struct RecordingContext {
        pub now: f64,
        pub timers: HashMap<TimerKind, f64>,
        pub cancelled: Vec<TimerKind>,
        pub transmitted: Vec<MacFrame>,
        pub delivered: Vec<MacFrame>,
        pub forwarded: Vec<MacFrame>,
        pub failed: Vec<(MacFrame, TxFailReason)>,
        pub ready: usize,
        pub rng: StdRng,
    }

    impl RecordingContext {
        pub fn new(seed: u64) -> Self {
            Self {
                now: 0.0,
                timers: HashMap::new(),
                cancelled: Vec::new(),
                transmitted: Vec::new(),
                delivered: Vec::new(),
                forwarded: Vec::new(),
                failed: Vec::new(),
                ready: 0,
                rng: StdRng::seed_from_u64(seed),
            }
        }

        /// Absolute expiry time of a pending timer.
        pub fn deadline(&self, kind: TimerKind) -> Option<f64> {
            self.timers.get(&kind).copied()
        }
    }

    impl MacContext for RecordingContext {
        fn now(&self) -> f64 {
            self.now
        }

        fn start_timer(&mut self, timer: TimerKind, delay: f64) {
            self.timers.insert(timer, self.now + delay);
        }

        fn cancel_timer(&mut self, timer: TimerKind) {
            self.timers.remove(&timer);
            self.cancelled.push(timer);
        }

        fn transmit(&mut self, frame: MacFrame) {
            self.transmitted.push(frame);
        }

        fn deliver_up(&mut self, frame: MacFrame) {
            self.delivered.push(frame);
        }

        fn forward(&mut self, frame: MacFrame) {
            self.forwarded.push(frame);
        }

        fn tx_failed(&mut self, frame: MacFrame, reason: TxFailReason) {
            self.failed.push((frame, reason));
        }

        fn upper_ready(&mut self) {
            self.ready += 1;
        }

        fn rng(&mut self) -> &mut dyn RngCore {
            &mut self.rng
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::RecordingContext;
    use super::*;

    const SLOT: f64 = 20e-6;
    const DIFS: f64 = 50e-6;

    #[test]
    fn busy_timer_cannot_restart() {
        let mut ctx = RecordingContext::new(0);
        let mut t = MacTimer::new(TimerKind::Defer);
        t.start(&mut ctx, 1e-3).unwrap();
        assert!(matches!(t.start(&mut ctx, 1e-3), Err(MacError::Invariant(_))));
        ctx.now = 4e-4;
        assert!((t.expire(ctx.now) - 6e-4).abs() < 1e-12);
        t.stop(&mut ctx).unwrap();
        assert!(!t.busy());
        assert_eq!(ctx.cancelled, vec![TimerKind::Defer]);
        assert!(t.stop(&mut ctx).is_err());
    }

    #[test]
    fn backoff_draws_within_window() {
        let mut ctx = RecordingContext::new(11);
        for _ in 0..50 {
            let mut b = BackoffTimer::new(SLOT);
            b.start(&mut ctx, 8, true, DIFS).unwrap();
            let slots = b.remaining() / SLOT;
            assert!(slots >= 0.0 && slots < 8.0);
            assert!((slots - slots.round()).abs() < 1e-9);
            let deadline = ctx.deadline(TimerKind::Backoff).unwrap();
            assert!((deadline - (b.remaining() + DIFS)).abs() < 1e-12);
        }
    }

    #[test]
    fn busy_channel_starts_paused() {
        let mut ctx = RecordingContext::new(2);
        let mut b = BackoffTimer::new(SLOT);
        b.start(&mut ctx, 16, false, DIFS).unwrap();
        assert!(b.busy() && b.paused());
        assert!(ctx.deadline(TimerKind::Backoff).is_none());
        ctx.now = 1.0;
        b.resume(&mut ctx, DIFS).unwrap();
        let deadline = ctx.deadline(TimerKind::Backoff).unwrap();
        assert!((deadline - (1.0 + DIFS + b.remaining())).abs() < 1e-12);
    }

    #[test]
    fn pause_keeps_unconsumed_slots() {
        let mut ctx = RecordingContext::new(5);
        let mut b = BackoffTimer::new(SLOT);
        // find a seed-independent draw with enough slots
        loop {
            b.start(&mut ctx, 32, true, DIFS).unwrap();
            if b.remaining() >= 10.0 * SLOT {
                break;
            }
            b.stop(&mut ctx).unwrap();
        }
        let before = b.remaining();
        // DIFS plus 3.5 slots of countdown
        ctx.now += DIFS + 3.5 * SLOT;
        b.pause(&mut ctx).unwrap();
        assert!((b.remaining() - (before - 3.0 * SLOT)).abs() < 1e-12);
        assert!(ctx.deadline(TimerKind::Backoff).is_none());

        // busy again before DIFS elapsed: nothing consumed
        let frozen = b.remaining();
        b.resume(&mut ctx, DIFS).unwrap();
        ctx.now += DIFS / 2.0;
        b.pause(&mut ctx).unwrap();
        assert!((b.remaining() - frozen).abs() < 1e-12);
    }
}
