use serde::{Deserialize, Serialize};

use crate::frame::{ACK_LEN, MacAddr};
use crate::phy_mode::{PhyMode, PhyModeError};

/// PHY attributes the MAC needs for its timing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PhyMib {
    pub cw_min: u32,
    pub cw_max: u32,
    pub slot_time: f64,
    pub sifs: f64,
    pub use_short_preamble: bool,
    /// Window in which a DSSS reception may be replaced by a stronger frame.
    pub b_sync_interval: f64,
    /// Same for OFDM receptions.
    pub g_sync_interval: f64,
}

impl Default for PhyMib {
    fn default() -> Self {
        Self {
            cw_min: 32,
            cw_max: 1024,
            slot_time: 20e-6,
            sifs: 10e-6,
            use_short_preamble: false,
            b_sync_interval: 20e-6,
            g_sync_interval: 4e-6,
        }
    }
}

impl PhyMib {
    pub fn pifs(&self) -> f64 {
        self.sifs + self.slot_time
    }

    pub fn difs(&self) -> f64 {
        self.sifs + 2.0 * self.slot_time
    }

    /// EIFS is always computed for an ACK at 1Mb/s (802.11-1999, 9.2.10).
    pub fn eifs(&self) -> f64 {
        let preamble = if self.use_short_preamble {
            crate::phy_mode::SHORT_PREAMBLE_DURATION
        } else {
            crate::phy_mode::LONG_PREAMBLE_DURATION
        };
        self.sifs + self.difs() + preamble + 8.0 * f64::from(ACK_LEN) / 1e6
    }

    pub fn sync_interval(&self, mode: PhyMode) -> f64 {
        if mode.is_ofdm() {
            self.g_sync_interval
        } else {
            self.b_sync_interval
        }
    }

    pub fn txtime(&self, bytes: u32, mode: PhyMode) -> Result<f64, PhyModeError> {
        mode.txtime(bytes, self.use_short_preamble)
    }
}

/// Configurable MAC attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MacMib {
    pub rts_threshold: u32,
    pub short_retry_limit: u32,
    pub long_retry_limit: u32,
    pub verbose_counters: bool,
}

impl Default for MacMib {
    fn default() -> Self {
        Self {
            rts_threshold: 3000,
            short_retry_limit: 7,
            long_retry_limit: 4,
            verbose_counters: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MacConfig {
    pub phy: PhyMib,
    pub mac: MacMib,
    /// Mode used for control frames and broadcast data.
    pub basic_mode: PhyMode,
    /// Mode used for unicast data.
    pub data_mode: PhyMode,
    /// `None` runs the station in IBSS (ad hoc) mode.
    pub bss_id: Option<MacAddr>,
    /// Size of the per-source duplicate detection cache.
    pub station_count: usize,
    pub debug_level: u8,
}

impl Default for MacConfig {
    fn default() -> Self {
        Self {
            phy: PhyMib::default(),
            mac: MacMib::default(),
            basic_mode: PhyMode::Mode1Mb,
            data_mode: PhyMode::Mode11Mb,
            bss_id: None,
            station_count: 0,
            debug_level: 0,
        }
    }
}

/// Auto Rate Fallback parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArfConfig {
    /// Mode ladder, slowest first.
    pub modes: Vec<PhyMode>,
    /// Consecutive successes before stepping up.
    pub succ_to_incr: u32,
    /// Consecutive failures before stepping down.
    pub fail_to_decr: u32,
    /// Failures tolerated after a step up tried by the timer.
    pub fail_to_decr_after_timeout: u32,
    /// Failures tolerated after a step up earned by successes.
    pub fail_to_decr_after_incr: u32,
    /// Seconds after a rate change before a step up is tried anyway.
    pub timeout: f64,
}

impl Default for ArfConfig {
    fn default() -> Self {
        Self {
            modes: vec![PhyMode::Mode1Mb, PhyMode::Mode2Mb, PhyMode::Mode5_5Mb, PhyMode::Mode11Mb],
            succ_to_incr: 10,
            fail_to_decr: 2,
            fail_to_decr_after_timeout: 1,
            fail_to_decr_after_incr: 1,
            timeout: 0.1,
        }
    }
}

/// How unicast data modes are picked.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RateAdaptation {
    /// Always use the configured data mode.
    #[default]
    Fixed,
    Arf(ArfConfig),
}

/// Simulation-wide settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    pub seed: u64,
    /// Stop processing events after this virtual time, in seconds.
    pub duration: f64,
    /// Ambient noise power in W.
    pub noise_power: f64,
    /// Transmit power in W.
    pub tx_power: f64,
    /// Carrier frequency in Hz.
    pub frequency: f64,
    /// System loss factor of the Friis equation.
    pub system_loss: f64,
    /// Frames received below this power are not sensed at all.
    pub cs_threshold: f64,
    /// Interface queue length above each MAC.
    pub queue_limit: usize,
    pub mac: MacConfig,
    pub rate_adaptation: RateAdaptation,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            duration: 10.0,
            noise_power: 7e-12,
            tx_power: 0.281_838_15,
            frequency: 2.437e9,
            system_loss: 1.0,
            cs_threshold: 1.559e-11,
            queue_limit: 50,
            mac: MacConfig::default(),
            rate_adaptation: RateAdaptation::Fixed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interframe_spaces() {
        let phy = PhyMib::default();
        assert!((phy.difs() - 50e-6).abs() < 1e-12);
        assert!((phy.pifs() - 30e-6).abs() < 1e-12);
        // SIFS + DIFS + 192us + 112us
        assert!((phy.eifs() - 364e-6).abs() < 1e-12);
    }

    #[test]
    fn sync_interval_follows_modulation() {
        let phy = PhyMib::default();
        assert_eq!(phy.sync_interval(PhyMode::Mode11Mb), phy.b_sync_interval);
        assert_eq!(phy.sync_interval(PhyMode::Mode24Mb), phy.g_sync_interval);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let cfg: SimConfig = toml::from_str(
            r#"
            seed = 7
            [mac]
            data_mode = "mode54mb"
            [mac.phy]
            cw_min = 16
            "#,
        )
        .unwrap();
        assert_eq!(cfg.seed, 7);
        assert_eq!(cfg.mac.data_mode, PhyMode::Mode54Mb);
        assert_eq!(cfg.mac.phy.cw_min, 16);
        assert_eq!(cfg.mac.phy.cw_max, 1024);
        assert_eq!(cfg.queue_limit, 50);
    }

    #[test]
    fn rate_adaptation_is_tagged_by_kind() {
        let cfg: SimConfig = toml::from_str("").unwrap();
        assert_eq!(cfg.rate_adaptation, RateAdaptation::Fixed);

        let cfg: SimConfig = toml::from_str(
            r#"
            [rate_adaptation]
            kind = "arf"
            modes = ["Mode6Mb", "Mode12Mb", "Mode24Mb"]
            succ_to_incr = 5
            "#,
        )
        .unwrap();
        let RateAdaptation::Arf(arf) = cfg.rate_adaptation else {
            panic!("expected ARF");
        };
        assert_eq!(arf.modes, vec![PhyMode::Mode6Mb, PhyMode::Mode12Mb, PhyMode::Mode24Mb]);
        assert_eq!(arf.succ_to_incr, 5);
        assert_eq!(arf.fail_to_decr, 2);

        assert!(toml::from_str::<SimConfig>("[rate_adaptation]\nkind = \"rbar\"").is_err());
    }
}
