use mr80211_abstract::{SimConfig, TxFailReason};
use mr80211_core::MacCounters;
use serde::Serialize;
use std::collections::HashMap;

use crate::engine::{LinkEventSummary, StationId};

/// A data frame handed to the upper layer.
#[derive(Debug, Clone, Serialize)]
pub struct Delivery {
    pub time: f64,
    pub station: StationId,
    /// Transmitter of the last hop.
    pub from: u32,
    /// Originator, as carried in the third address field.
    pub origin: u32,
    pub uid: u64,
    pub size: u32,
}

/// A packet the MAC gave up on.
#[derive(Debug, Clone, Serialize)]
pub struct TxFailure {
    pub time: f64,
    pub station: StationId,
    pub dst: u32,
    pub uid: u64,
    pub size: u32,
    pub reason: TxFailReason,
}

#[derive(Debug, Clone, Serialize)]
pub struct StationReport {
    pub id: StationId,
    pub x: f64,
    pub y: f64,
    pub ap: bool,
    pub counters: MacCounters,
    /// Counters in the `name=value` text form.
    pub counters_string: String,
    pub delivered: u64,
    pub tx_failed: u64,
    pub queue_drops: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub config: SimConfig,
    pub duration: f64,
    pub stations: Vec<StationReport>,
    pub deliveries: Vec<Delivery>,
    pub tx_failures: Vec<TxFailure>,
    pub peer_stats: Vec<String>,
    pub metrics: HashMap<String, Vec<(f64, f64)>>,
    pub link_events: Vec<LinkEventSummary>,
}

impl SimulationReport {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Total data frames delivered across all stations.
    pub fn total_delivered(&self) -> u64 {
        self.stations.iter().map(|s| s.delivered).sum()
    }
}

#[cfg(test)]
mod tests {
    use crate::engine::Simulator;
    use mr80211_abstract::{SimConfig, StationSpec};

    #[test]
    fn report_serializes_counters_and_deliveries() {
        let stations = [
            StationSpec { x: 0.0, y: 0.0, ap: false },
            StationSpec { x: 5.0, y: 0.0, ap: false },
        ];
        let mut sim = Simulator::new(SimConfig::default(), &stations, None).unwrap();
        sim.schedule_send(0.0, 0, Some(1), 100).unwrap();
        sim.run().unwrap();

        let report = sim.export_report();
        assert_eq!(report.total_delivered(), 1);
        assert_eq!(report.stations[0].counters.mpdu_tx_successful, 1);

        let json: serde_json::Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();
        assert_eq!(json["deliveries"][0]["size"], 100);
        assert_eq!(json["stations"][1]["delivered"], 1);
        assert!(json["link_events"].as_array().is_some_and(|e| !e.is_empty()));
    }
}
