//! Rate adaptation driven by the MAC's event hooks.

use mr80211_abstract::{ArfConfig, MacAddr, MacFrame, PhyMode};
use tracing::debug;

use crate::error::ConfigError;
use crate::mac::MacEventHandler;
use crate::mib::{CounterId, MacCounters};

/// A ladder of PHY modes, slowest first, with a current position.
#[derive(Debug, Clone, PartialEq)]
pub struct RateAdapter {
    modes: Vec<PhyMode>,
    index: usize,
}

impl RateAdapter {
    pub fn new(modes: Vec<PhyMode>) -> Result<Self, ConfigError> {
        if modes.is_empty() {
            return Err(ConfigError::InvalidValue {
                name: "rate adapter modes",
                reason: "the mode ladder is empty".into(),
            });
        }
        for mode in &modes {
            mode.phy_header_duration(false)?;
        }
        Ok(Self { modes, index: 0 })
    }

    pub fn modes(&self) -> &[PhyMode] {
        &self.modes
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn current(&self) -> PhyMode {
        self.modes[self.index]
    }

    pub fn set_mode_at_index(&mut self, index: usize) -> Result<(), ConfigError> {
        if index >= self.modes.len() {
            return Err(ConfigError::InvalidValue {
                name: "mode index",
                reason: format!("{index} is past the {} modes of the ladder", self.modes.len()),
            });
        }
        self.index = index;
        Ok(())
    }

    /// Move to `mode`. Returns `false` if the ladder does not have it.
    pub fn set_mode(&mut self, mode: PhyMode) -> bool {
        match self.modes.iter().position(|&m| m == mode) {
            Some(i) => {
                self.index = i;
                true
            }
            None => false,
        }
    }

    /// Step to the next faster mode. `false` when already at the top.
    pub fn incr_mode(&mut self) -> bool {
        if self.index + 1 < self.modes.len() {
            self.index += 1;
            true
        } else {
            false
        }
    }

    /// Step to the next slower mode. `false` when already at the bottom.
    pub fn decr_mode(&mut self) -> bool {
        if self.index > 0 {
            self.index -= 1;
            true
        } else {
            false
        }
    }
}

/// Auto Rate Fallback: step up after a run of successful transmissions or
/// when the timer runs out, step down after a run of failed attempts.
///
/// The MAC gives handlers no clock outside [`MacEventHandler::before_send_data`],
/// so the timer is measured from the start of the transmission whose outcome
/// changed the rate and is checked when the next data frame is framed.
#[derive(Debug, Clone)]
pub struct Arf {
    addr: MacAddr,
    config: ArfConfig,
    adapter: RateAdapter,
    n_success: u32,
    n_failed: u32,
    just_incr: bool,
    just_timed_out: bool,
    deadline: Option<f64>,
    last_send: f64,
}

impl Arf {
    /// Starts at `initial` if the ladder has it, at the slowest mode otherwise.
    pub fn new(addr: MacAddr, config: ArfConfig, initial: PhyMode) -> Result<Self, ConfigError> {
        let thresholds = [
            ("succ_to_incr", config.succ_to_incr),
            ("fail_to_decr", config.fail_to_decr),
            ("fail_to_decr_after_timeout", config.fail_to_decr_after_timeout),
            ("fail_to_decr_after_incr", config.fail_to_decr_after_incr),
        ];
        for (name, value) in thresholds {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    name,
                    reason: "must be at least 1".into(),
                });
            }
        }
        if !config.timeout.is_finite() || config.timeout <= 0.0 {
            return Err(ConfigError::InvalidValue {
                name: "ARF timeout",
                reason: format!("{} s", config.timeout),
            });
        }
        let mut adapter = RateAdapter::new(config.modes.clone())?;
        adapter.set_mode(initial);
        Ok(Self {
            addr,
            config,
            adapter,
            n_success: 0,
            n_failed: 0,
            just_incr: false,
            just_timed_out: false,
            deadline: None,
            last_send: 0.0,
        })
    }

    pub fn adapter(&self) -> &RateAdapter {
        &self.adapter
    }

    pub fn current_mode(&self) -> PhyMode {
        self.adapter.current()
    }

    fn resched(&mut self) {
        self.deadline = Some(self.last_send + self.config.timeout);
    }

    fn tx_successful(&mut self) {
        self.n_success += 1;
        self.n_failed = 0;
        self.just_timed_out = false;
        self.just_incr = false;
        if self.n_success >= self.config.succ_to_incr {
            if self.adapter.incr_mode() {
                debug!("node {} ARF steps up to {}", self.addr, self.adapter.current());
                self.resched();
                self.just_incr = true;
            }
            self.n_success = 0;
        }
    }

    fn tx_failed(&mut self) {
        self.n_failed += 1;
        self.n_success = 0;
        let step_down = (self.just_incr && self.n_failed >= self.config.fail_to_decr_after_incr)
            || (self.just_timed_out && self.n_failed >= self.config.fail_to_decr_after_timeout)
            || self.n_failed >= self.config.fail_to_decr;
        if step_down {
            if self.adapter.decr_mode() {
                debug!("node {} ARF steps down to {}", self.addr, self.adapter.current());
                self.resched();
            }
            self.n_failed = 0;
            self.just_timed_out = false;
            self.just_incr = false;
        }
    }

    fn expire(&mut self) {
        self.deadline = None;
        self.n_failed = 0;
        self.just_incr = false;
        if self.adapter.incr_mode() {
            debug!("node {} ARF timer tries {}", self.addr, self.adapter.current());
            self.just_timed_out = true;
            self.resched();
        }
        self.n_success = 0;
    }
}

impl MacEventHandler for Arf {
    fn counter_event(&mut self, id: CounterId, _counters: &MacCounters) {
        match id {
            CounterId::MpduTxSuccessful => self.tx_successful(),
            CounterId::AckFailed | CounterId::RtsFailed => self.tx_failed(),
            _ => {}
        }
    }

    fn before_send_data(&mut self, now: f64, _frame: &MacFrame, _data_mode: PhyMode) -> Option<PhyMode> {
        self.last_send = now;
        if self.deadline.is_some_and(|d| now >= d) {
            self.expire();
        }
        Some(self.adapter.current())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn fresh(initial: PhyMode) -> Arf {
        Arf::new(MacAddr(0), ArfConfig::default(), initial).unwrap()
    }

    fn report(arf: &mut Arf, id: CounterId, times: usize) {
        let counters = MacCounters::default();
        for _ in 0..times {
            arf.counter_event(id, &counters);
        }
    }

    fn mode_at(arf: &mut Arf, now: f64) -> Option<PhyMode> {
        let frame = MacFrame::data(MacAddr(0), MacAddr(1), 100, Bytes::new());
        arf.before_send_data(now, &frame, PhyMode::Mode11Mb)
    }

    #[test]
    fn ladder_clamps_at_both_ends() {
        let mut ladder = RateAdapter::new(vec![PhyMode::Mode1Mb, PhyMode::Mode2Mb]).unwrap();
        assert!(!ladder.decr_mode());
        assert!(ladder.incr_mode());
        assert!(!ladder.incr_mode());
        assert_eq!(ladder.current(), PhyMode::Mode2Mb);
        assert!(ladder.set_mode_at_index(2).is_err());
        ladder.set_mode_at_index(0).unwrap();
        assert_eq!(ladder.current(), PhyMode::Mode1Mb);
        assert!(!ladder.set_mode(PhyMode::Mode54Mb));

        assert!(RateAdapter::new(Vec::new()).is_err());
        assert!(RateAdapter::new(vec![PhyMode::Unknown]).is_err());
    }

    #[test]
    fn steps_up_after_a_run_of_successes() {
        let mut arf = fresh(PhyMode::Mode1Mb);
        assert_eq!(mode_at(&mut arf, 0.0), Some(PhyMode::Mode1Mb));
        report(&mut arf, CounterId::MpduTxSuccessful, 9);
        assert_eq!(arf.current_mode(), PhyMode::Mode1Mb);
        report(&mut arf, CounterId::MpduTxSuccessful, 1);
        assert_eq!(mode_at(&mut arf, 0.01), Some(PhyMode::Mode2Mb));

        // a failed attempt in between restarts the run
        report(&mut arf, CounterId::MpduTxSuccessful, 9);
        report(&mut arf, CounterId::AckFailed, 1);
        report(&mut arf, CounterId::MpduTxSuccessful, 9);
        assert_eq!(arf.current_mode(), PhyMode::Mode2Mb);
        report(&mut arf, CounterId::MpduTxSuccessful, 1);
        assert_eq!(arf.current_mode(), PhyMode::Mode5_5Mb);
    }

    #[test]
    fn steps_down_after_consecutive_failures() {
        let mut arf = fresh(PhyMode::Mode11Mb);
        report(&mut arf, CounterId::AckFailed, 1);
        assert_eq!(arf.current_mode(), PhyMode::Mode11Mb);
        report(&mut arf, CounterId::RtsFailed, 1);
        assert_eq!(arf.current_mode(), PhyMode::Mode5_5Mb);

        // a success resets the failure run
        report(&mut arf, CounterId::AckFailed, 1);
        report(&mut arf, CounterId::MpduTxSuccessful, 1);
        report(&mut arf, CounterId::AckFailed, 1);
        assert_eq!(arf.current_mode(), PhyMode::Mode5_5Mb);
    }

    #[test]
    fn first_failure_after_a_step_up_falls_back() {
        let mut arf = fresh(PhyMode::Mode2Mb);
        report(&mut arf, CounterId::MpduTxSuccessful, 10);
        assert_eq!(arf.current_mode(), PhyMode::Mode5_5Mb);
        report(&mut arf, CounterId::AckFailed, 1);
        assert_eq!(arf.current_mode(), PhyMode::Mode2Mb);
        // back to the normal threshold
        report(&mut arf, CounterId::AckFailed, 1);
        assert_eq!(arf.current_mode(), PhyMode::Mode2Mb);
    }

    #[test]
    fn clamps_at_the_ends_of_the_ladder() {
        let mut arf = fresh(PhyMode::Mode11Mb);
        report(&mut arf, CounterId::MpduTxSuccessful, 30);
        assert_eq!(arf.current_mode(), PhyMode::Mode11Mb);

        let mut arf = fresh(PhyMode::Mode1Mb);
        report(&mut arf, CounterId::AckFailed, 10);
        assert_eq!(arf.current_mode(), PhyMode::Mode1Mb);
        assert_eq!(arf.adapter().index(), 0);
    }

    #[test]
    fn timer_tries_a_faster_mode() {
        let mut arf = fresh(PhyMode::Mode11Mb);
        mode_at(&mut arf, 1.0);
        report(&mut arf, CounterId::AckFailed, 2);
        assert_eq!(mode_at(&mut arf, 1.05), Some(PhyMode::Mode5_5Mb));
        // the timer runs from the transmission that failed
        assert_eq!(mode_at(&mut arf, 1.2), Some(PhyMode::Mode11Mb));

        // one failure after a timed out step up is enough to fall back
        report(&mut arf, CounterId::AckFailed, 1);
        assert_eq!(mode_at(&mut arf, 1.21), Some(PhyMode::Mode5_5Mb));
    }

    #[test]
    fn timer_is_idle_until_the_rate_changes() {
        let mut arf = fresh(PhyMode::Mode1Mb);
        assert_eq!(mode_at(&mut arf, 50.0), Some(PhyMode::Mode1Mb));
    }

    #[test]
    fn unknown_initial_mode_starts_at_the_bottom() {
        let arf = fresh(PhyMode::Mode54Mb);
        assert_eq!(arf.current_mode(), PhyMode::Mode1Mb);
    }

    #[test]
    fn zero_thresholds_are_rejected() {
        let config = ArfConfig {
            fail_to_decr: 0,
            ..ArfConfig::default()
        };
        assert!(Arf::new(MacAddr(0), config, PhyMode::Mode1Mb).is_err());
        let config = ArfConfig {
            timeout: 0.0,
            ..ArfConfig::default()
        };
        assert!(Arf::new(MacAddr(0), config, PhyMode::Mode1Mb).is_err());
    }
}
