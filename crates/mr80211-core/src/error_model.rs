use mr80211_abstract::{MacFrame, PhyMode};
use rand::{Rng, RngCore};
use serde::Serialize;
use std::rc::Rc;
use tracing::{debug, warn};

use crate::error::ConfigError;
use crate::per::PerTable;
use crate::power_profile::PowerProfile;

/// Fate of a received frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum PacketOutcome {
    Ok,
    ErrorNoise,
    ErrorInterference,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ErrorDecision {
    pub outcome: PacketOutcome,
    /// Signal to noise ratio in dB, `None` without ambient noise.
    pub snr: Option<f64>,
    /// Signal to noise plus interference ratio in dB, `None` when both vanish.
    pub snir: Option<f64>,
    /// Mean interference power over the frame in W.
    pub interference: f64,
}

/// Decides whether a received frame survives noise and interference,
/// using PER values looked up for its SNR and SNIR.
#[derive(Debug, Clone)]
pub struct ChannelErrorModel {
    table: Rc<PerTable>,
    noise_power: f64,
    debug_level: u8,
}

impl ChannelErrorModel {
    pub fn new(table: Rc<PerTable>) -> Self {
        Self {
            table,
            noise_power: 0.0,
            debug_level: 0,
        }
    }

    pub fn with_noise(table: Rc<PerTable>, noise_power: f64) -> Result<Self, ConfigError> {
        let mut model = Self::new(table);
        model.set_noise_power(noise_power)?;
        Ok(model)
    }

    pub fn set_noise_power(&mut self, watts: f64) -> Result<(), ConfigError> {
        if !watts.is_finite() || watts < 0.0 {
            return Err(ConfigError::InvalidValue {
                name: "noise power",
                reason: format!("{watts} W"),
            });
        }
        self.noise_power = watts;
        Ok(())
    }

    pub fn noise_power(&self) -> f64 {
        self.noise_power
    }

    pub fn set_debug_level(&mut self, level: u8) {
        self.debug_level = level;
    }

    pub fn table(&self) -> &PerTable {
        &self.table
    }

    pub fn into_table(self) -> Rc<PerTable> {
        self.table
    }

    /// Time-weighted mean of the profile over `[0, duration]`.
    pub fn avg(profile: &PowerProfile, duration: f64) -> f64 {
        let samples = profile.samples();
        let Some(last) = samples.last() else {
            return 0.0;
        };
        if duration <= 0.0 {
            return samples[0].power;
        }
        let mut energy: f64 = samples
            .windows(2)
            .map(|w| w[0].power * (w[1].time - w[0].time))
            .sum();
        energy += last.power * (duration - last.time);
        energy / duration
    }

    /// Three-way decision on a uniform draw `x`. The noise threshold is
    /// checked first.
    pub fn classify(x: f64, per_noise_only: f64, per_with_interference: f64) -> PacketOutcome {
        if x < per_noise_only {
            PacketOutcome::ErrorNoise
        } else if x < per_with_interference {
            PacketOutcome::ErrorInterference
        } else {
            PacketOutcome::Ok
        }
    }

    fn per_or_zero(&self, mode: PhyMode, snr: f64, len: u32) -> f64 {
        match self.table.get_per(mode, snr, len) {
            Ok(per) => per,
            Err(err) => {
                warn!("no error model for {}: {}", mode, err);
                0.0
            }
        }
    }

    pub fn get_err(&self, profile: &PowerProfile, frame: &MacFrame, rng: &mut dyn RngCore) -> ErrorDecision {
        let signal = frame.rx.power;
        let avg_power = Self::avg(profile, frame.txtime);
        let interference = avg_power - signal;

        let mut snr = None;
        let mut per_noise_only = 0.0;
        if self.noise_power.abs() > f64::MIN_POSITIVE {
            let s = 10.0 * (signal / self.noise_power).log10();
            per_noise_only = self.per_or_zero(frame.mode, s, frame.size);
            snr = Some(s);
        }

        let mut snir = None;
        let mut per_with_interference = 0.0;
        let total = self.noise_power + interference;
        if total.abs() > f64::MIN_POSITIVE {
            let s = 10.0 * (signal / total).log10();
            per_with_interference = self.per_or_zero(frame.mode, s, frame.size);
            snir = Some(s);
        }

        let x: f64 = rng.random();
        let outcome = Self::classify(x, per_noise_only, per_with_interference);

        if self.debug_level > 3 {
            debug!(
                "get_err avg={:e}W signal={:e}W noise={:e}W interf={:e}W snr={:?} snir={:?} \
                 per_noise={} per_interf={} x={} -> {:?}",
                avg_power,
                signal,
                self.noise_power,
                interference,
                snr,
                snir,
                per_noise_only,
                per_with_interference,
                x,
                outcome
            );
        }

        ErrorDecision {
            outcome,
            snr,
            snir,
            interference,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use mr80211_abstract::MacAddr;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn frame(power: f64, txtime: f64) -> MacFrame {
        let mut f = MacFrame::data(MacAddr(0), MacAddr(1), 100, Bytes::new());
        f.mode = PhyMode::Mode1Mb;
        f.txtime = txtime;
        f.rx.power = power;
        f
    }

    fn flat_table(per: f64) -> Rc<PerTable> {
        let mut t = PerTable::new();
        t.set_per(PhyMode::Mode1Mb, 100, -100.0, per).unwrap();
        t.set_per(PhyMode::Mode1Mb, 100, 100.0, per).unwrap();
        Rc::new(t)
    }

    #[test]
    fn average_of_step_profile() {
        let mut p = PowerProfile::new();
        p.add_element(0.0, 1.0);
        p.start_new_recording(0.0);
        p.add_element(1.0, 2.0);
        // 1W for 1s then 3W for 3s
        let avg = ChannelErrorModel::avg(&p, 4.0);
        assert!((avg - 2.5).abs() < 1e-12);
        assert_eq!(ChannelErrorModel::avg(&p, 0.0), 1.0);
    }

    #[test]
    fn branch_order_is_noise_then_interference() {
        use PacketOutcome::*;
        assert_eq!(ChannelErrorModel::classify(0.1, 0.2, 0.5), ErrorNoise);
        assert_eq!(ChannelErrorModel::classify(0.3, 0.2, 0.5), ErrorInterference);
        assert_eq!(ChannelErrorModel::classify(0.6, 0.2, 0.5), Ok);
        // inverted thresholds: interference can never be blamed
        assert_eq!(ChannelErrorModel::classify(0.1, 0.5, 0.2), ErrorNoise);
        assert_eq!(ChannelErrorModel::classify(0.3, 0.5, 0.2), ErrorNoise);
        assert_eq!(ChannelErrorModel::classify(0.6, 0.5, 0.2), Ok);
        assert_eq!(ChannelErrorModel::classify(0.0, 0.0, 0.0), Ok);
    }

    #[test]
    fn interference_free_frame_reports_snr() {
        let model = ChannelErrorModel::with_noise(flat_table(0.0), 1e-12).unwrap();
        let mut p = PowerProfile::new();
        p.add_element(0.0, 1e-9);
        p.start_new_recording(0.0);
        let mut rng = StdRng::seed_from_u64(1);
        let d = model.get_err(&p, &frame(1e-9, 1e-3), &mut rng);
        assert_eq!(d.outcome, PacketOutcome::Ok);
        assert!((d.snr.unwrap() - 30.0).abs() < 1e-9);
        assert!((d.snir.unwrap() - 30.0).abs() < 1e-9);
        assert!(d.interference.abs() < 1e-21);
    }

    #[test]
    fn certain_loss_is_blamed_on_noise() {
        let model = ChannelErrorModel::with_noise(flat_table(1.0), 1e-12).unwrap();
        let mut p = PowerProfile::new();
        p.add_element(0.0, 1e-9);
        p.start_new_recording(0.0);
        let mut rng = StdRng::seed_from_u64(9);
        for _ in 0..20 {
            let d = model.get_err(&p, &frame(1e-9, 1e-3), &mut rng);
            assert_eq!(d.outcome, PacketOutcome::ErrorNoise);
        }
    }

    #[test]
    fn interference_lowers_snir() {
        let mut t = PerTable::new();
        // PER falls from 1 at 0dB to 0 at 20dB
        t.set_per(PhyMode::Mode1Mb, 100, 0.0, 1.0).unwrap();
        t.set_per(PhyMode::Mode1Mb, 100, 20.0, 0.0).unwrap();
        let model = ChannelErrorModel::with_noise(Rc::new(t), 1e-12).unwrap();

        let mut p = PowerProfile::new();
        p.add_element(0.0, 1e-9);
        p.start_new_recording(0.0);
        // an equally strong interferer covers the whole frame
        p.add_element(0.0, 1e-9);
        let mut rng = StdRng::seed_from_u64(3);
        let d = model.get_err(&p, &frame(1e-9, 1e-3), &mut rng);
        assert!((d.interference - 1e-9).abs() < 1e-18);
        // SNIR ~ 0dB -> PER ~ 1, SNR 30dB -> PER 0
        assert_eq!(d.outcome, PacketOutcome::ErrorInterference);
        assert!(d.snir.unwrap() < 0.01);
    }

    #[test]
    fn missing_calibration_means_no_losses() {
        let model = ChannelErrorModel::with_noise(Rc::new(PerTable::new()), 1e-12).unwrap();
        let mut p = PowerProfile::new();
        p.add_element(0.0, 1e-9);
        p.start_new_recording(0.0);
        let mut rng = StdRng::seed_from_u64(5);
        let d = model.get_err(&p, &frame(1e-9, 1e-3), &mut rng);
        assert_eq!(d.outcome, PacketOutcome::Ok);
    }

    #[test]
    fn zero_noise_skips_snr() {
        let model = ChannelErrorModel::new(flat_table(1.0));
        let mut p = PowerProfile::new();
        p.add_element(0.0, 1e-9);
        p.start_new_recording(0.0);
        let mut rng = StdRng::seed_from_u64(5);
        let d = model.get_err(&p, &frame(1e-9, 1e-3), &mut rng);
        assert_eq!(d.snr, None);
        assert_eq!(d.snir, None);
        assert_eq!(d.outcome, PacketOutcome::Ok);
        assert!(model.clone().set_noise_power(-1.0).is_err());
    }
}
