use std::cell::RefCell;
use std::rc::Rc;
use tracing::{trace, warn};

/// Accumulated power closer to zero than this is snapped to zero, so that
/// rounding residue of matched +P/-P updates does not linger.
const ACC_POWER_ROUND_THRESH: f64 = 1e-20;

/// Received power at a point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PowerSample {
    pub time: f64,
    pub power: f64,
}

/// Received power seen by one station while it receives a frame.
///
/// The PHY reports every change of the total in-band power with
/// [`PowerProfile::add_element`]; the MAC opens a recording when a frame
/// starts and closes it when the frame ends. Recorded samples hold the
/// absolute power from their time (relative to the start of the recording)
/// until the next sample.
#[derive(Debug, Clone)]
pub struct PowerProfile {
    samples: Vec<PowerSample>,
    recording: bool,
    reference_time: f64,
    accumulated: f64,
}

pub type SharedPowerProfile = Rc<RefCell<PowerProfile>>;

impl Default for PowerProfile {
    fn default() -> Self {
        Self {
            samples: vec![PowerSample::default()],
            recording: false,
            reference_time: 0.0,
            accumulated: 0.0,
        }
    }
}

impl PowerProfile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedPowerProfile {
        Rc::new(RefCell::new(Self::new()))
    }

    /// Drop previous samples and start a recording at absolute time `now`
    /// with the current power level as first sample.
    pub fn start_new_recording(&mut self, now: f64) {
        if self.recording {
            warn!("power profile recording restarted while already recording");
        }
        self.samples.clear();
        self.samples.push(PowerSample {
            time: 0.0,
            power: self.accumulated,
        });
        self.reference_time = now;
        self.recording = true;
    }

    /// Apply a power change `delta` (W) happening at absolute time `time`.
    pub fn add_element(&mut self, time: f64, delta: f64) {
        self.accumulated += delta;
        if self.accumulated.abs() <= ACC_POWER_ROUND_THRESH {
            self.accumulated = 0.0;
        }
        trace!("power change {:+e} at {} -> {:e}", delta, time, self.accumulated);

        if !self.recording {
            self.reference_time = time;
            return;
        }

        let rel = time - self.reference_time;
        // at least one sample exists while recording
        let Some(tail) = self.samples.last_mut() else {
            return;
        };
        if rel <= tail.time {
            if rel < tail.time {
                warn!("power change at {} precedes last sample, merged", time);
            }
            tail.power += delta;
        } else {
            self.samples.push(PowerSample {
                time: rel,
                power: self.accumulated,
            });
        }
    }

    pub fn stop_recording(&mut self) {
        if !self.recording {
            warn!("power profile stop requested but no recording is active");
        }
        self.recording = false;
    }

    pub fn is_recording(&self) -> bool {
        self.recording
    }

    /// Current total power in W.
    pub fn current_power(&self) -> f64 {
        self.accumulated
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn element(&self, index: usize) -> Option<PowerSample> {
        self.samples.get(index).copied()
    }

    pub fn samples(&self) -> &[PowerSample] {
        &self.samples
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_relative_times_and_absolute_power() {
        let mut p = PowerProfile::new();
        p.add_element(1.0, 2e-9);
        p.start_new_recording(1.0);
        p.add_element(1.5, 1e-9);
        p.add_element(2.0, -1e-9);
        p.add_element(3.0, -2e-9);
        p.stop_recording();

        let s = p.samples();
        assert_eq!(s.len(), 4);
        assert_eq!(s[0], PowerSample { time: 0.0, power: 2e-9 });
        assert!((s[1].time - 0.5).abs() < 1e-12);
        assert!((s[1].power - 3e-9).abs() < 1e-21);
        assert!((s[2].power - 2e-9).abs() < 1e-21);
        assert_eq!(s[3].power, 0.0);
        assert_eq!(p.current_power(), 0.0);
    }

    #[test]
    fn simultaneous_changes_merge_into_one_sample() {
        let mut p = PowerProfile::new();
        p.start_new_recording(0.0);
        p.add_element(0.0, 1e-9);
        p.add_element(1.0, 1e-9);
        p.add_element(1.0, 3e-9);
        assert_eq!(p.len(), 2);
        assert!((p.element(0).unwrap().power - 1e-9).abs() < 1e-21);
        assert!((p.element(1).unwrap().power - 5e-9).abs() < 1e-21);
        assert!(p.element(2).is_none());
    }

    #[test]
    fn outside_recording_only_tracks_total() {
        let mut p = PowerProfile::new();
        p.add_element(0.1, 4e-9);
        p.add_element(0.2, 1e-9);
        assert_eq!(p.len(), 1);
        assert!(!p.is_recording());
        assert!((p.current_power() - 5e-9).abs() < 1e-21);
    }

    #[test]
    fn snaps_residual_power_to_zero() {
        let mut p = PowerProfile::new();
        p.add_element(0.0, 1e-9);
        p.add_element(0.0, 2e-9);
        p.add_element(1.0, -3e-9);
        assert_eq!(p.current_power(), 0.0);
    }
}
