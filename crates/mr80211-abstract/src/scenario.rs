use crate::config::{RateAdaptation, SimConfig};
use crate::phy_mode::PhyMode;
use serde::Deserialize;
use std::path::PathBuf;

#[derive(Deserialize, Debug, Clone)]
pub struct TestScenario {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub config: SimConfigOverride,
    pub stations: Vec<StationSpec>,
    /// Inline calibration points.
    #[serde(default)]
    pub per: Vec<PerEntry>,
    /// Calibration file with `<mode> <len> <snr> <per>` lines, relative to the scenario file.
    pub per_file: Option<PathBuf>,
    #[serde(default)]
    pub actions: Vec<TestAction>,
    #[serde(default)]
    pub assertions: Vec<TestAssertion>,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct StationSpec {
    pub x: f64,
    pub y: f64,
    /// At most one station may be the access point; the others join its BSS.
    #[serde(default)]
    pub ap: bool,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct PerEntry {
    pub mode: PhyMode,
    pub len: u32,
    pub snr: f64,
    pub per: f64,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct SimConfigOverride {
    pub seed: Option<u64>,
    pub duration: Option<f64>,
    pub noise_power: Option<f64>,
    pub tx_power: Option<f64>,
    pub frequency: Option<f64>,
    pub cs_threshold: Option<f64>,
    pub queue_limit: Option<usize>,
    pub cw_min: Option<u32>,
    pub cw_max: Option<u32>,
    pub slot_time: Option<f64>,
    pub sifs: Option<f64>,
    pub use_short_preamble: Option<bool>,
    pub rts_threshold: Option<u32>,
    pub short_retry_limit: Option<u32>,
    pub long_retry_limit: Option<u32>,
    pub basic_mode: Option<PhyMode>,
    pub data_mode: Option<PhyMode>,
    pub verbose_counters: Option<bool>,
    pub debug_level: Option<u8>,
    pub rate_adaptation: Option<RateAdaptation>,
}

impl SimConfigOverride {
    pub fn apply_to(&self, config: &mut SimConfig) {
        if let Some(v) = self.seed {
            config.seed = v;
        }
        if let Some(v) = self.duration {
            config.duration = v;
        }
        if let Some(v) = self.noise_power {
            config.noise_power = v;
        }
        if let Some(v) = self.tx_power {
            config.tx_power = v;
        }
        if let Some(v) = self.frequency {
            config.frequency = v;
        }
        if let Some(v) = self.cs_threshold {
            config.cs_threshold = v;
        }
        if let Some(v) = self.queue_limit {
            config.queue_limit = v;
        }
        let phy = &mut config.mac.phy;
        if let Some(v) = self.cw_min {
            phy.cw_min = v;
        }
        if let Some(v) = self.cw_max {
            phy.cw_max = v;
        }
        if let Some(v) = self.slot_time {
            phy.slot_time = v;
        }
        if let Some(v) = self.sifs {
            phy.sifs = v;
        }
        if let Some(v) = self.use_short_preamble {
            phy.use_short_preamble = v;
        }
        let mib = &mut config.mac.mac;
        if let Some(v) = self.rts_threshold {
            mib.rts_threshold = v;
        }
        if let Some(v) = self.short_retry_limit {
            mib.short_retry_limit = v;
        }
        if let Some(v) = self.long_retry_limit {
            mib.long_retry_limit = v;
        }
        if let Some(v) = self.verbose_counters {
            mib.verbose_counters = v;
        }
        if let Some(v) = self.basic_mode {
            config.mac.basic_mode = v;
        }
        if let Some(v) = self.data_mode {
            config.mac.data_mode = v;
        }
        if let Some(v) = self.debug_level {
            config.mac.debug_level = v;
        }
        if let Some(v) = &self.rate_adaptation {
            config.rate_adaptation = v.clone();
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TestAction {
    /// `count` packets of `size` bytes from `src`, spaced by `interval` seconds.
    /// Omitting `dst` broadcasts.
    Send {
        time: f64,
        src: u32,
        dst: Option<u32>,
        size: u32,
        #[serde(default = "one")]
        count: u32,
        #[serde(default)]
        interval: f64,
    },
    /// Zero the idle slot counters of every station.
    ResetIdleSlots { time: f64 },
}

fn one() -> u32 {
    1
}

#[derive(Deserialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TestAssertion {
    /// Number of data frames delivered to the upper layer of `dst`.
    Delivered { dst: u32, min: u64, max: Option<u64> },
    /// Value of a named MAC counter (e.g. `MPDUTxFailed`) of `station`.
    Counter {
        station: u32,
        name: String,
        min: u64,
        max: Option<u64>,
    },
    /// Number of transmission give-ups reported by `station`.
    TxFailed { station: u32, min: u64, max: Option<u64> },
    /// The last processed event happens before this virtual time.
    MaxDuration { seconds: f64 },
}
