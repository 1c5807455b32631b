//! MAC management information base: the protocol counters kept per station
//! (and per peer pair when a peer statistics database is attached).

use mr80211_abstract::FrameType;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

use crate::error::ConfigError;

/// Names every counter a [`crate::MacEventHandler`] can be notified about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum CounterId {
    MpduTxSuccessful,
    MpduTxOneRetry,
    MpduTxMultipleRetries,
    MpduTxFailed,
    RtsFailed,
    AckFailed,
    MpduRxSuccessful,
    FrameReceives,
    DataFrameReceives,
    CtrlFrameReceives,
    MgmtFrameReceives,
    FrameErrors,
    DataFrameErrors,
    CtrlFrameErrors,
    MgmtFrameErrors,
    FrameErrorsNoise,
    DataFrameErrorsNoise,
    CtrlFrameErrorsNoise,
    MgmtFrameErrorsNoise,
    FrameDropSyn,
    DataFrameDropSyn,
    CtrlFrameDropSyn,
    MgmtFrameDropSyn,
    FrameDropTxa,
    DataFrameDropTxa,
    CtrlFrameDropTxa,
    MgmtFrameDropTxa,
    IdleSlots,
    Idle2Slots,
}

impl CounterId {
    pub const ALL: [CounterId; 29] = [
        CounterId::MpduTxSuccessful,
        CounterId::MpduTxOneRetry,
        CounterId::MpduTxMultipleRetries,
        CounterId::MpduTxFailed,
        CounterId::RtsFailed,
        CounterId::AckFailed,
        CounterId::MpduRxSuccessful,
        CounterId::FrameReceives,
        CounterId::DataFrameReceives,
        CounterId::CtrlFrameReceives,
        CounterId::MgmtFrameReceives,
        CounterId::FrameErrors,
        CounterId::DataFrameErrors,
        CounterId::CtrlFrameErrors,
        CounterId::MgmtFrameErrors,
        CounterId::FrameErrorsNoise,
        CounterId::DataFrameErrorsNoise,
        CounterId::CtrlFrameErrorsNoise,
        CounterId::MgmtFrameErrorsNoise,
        CounterId::FrameDropSyn,
        CounterId::DataFrameDropSyn,
        CounterId::CtrlFrameDropSyn,
        CounterId::MgmtFrameDropSyn,
        CounterId::FrameDropTxa,
        CounterId::DataFrameDropTxa,
        CounterId::CtrlFrameDropTxa,
        CounterId::MgmtFrameDropTxa,
        CounterId::IdleSlots,
        CounterId::Idle2Slots,
    ];

    /// MIB attribute name, as used in scenario assertions.
    pub fn name(self) -> &'static str {
        match self {
            CounterId::MpduTxSuccessful => "MPDUTxSuccessful",
            CounterId::MpduTxOneRetry => "MPDUTxOneRetry",
            CounterId::MpduTxMultipleRetries => "MPDUTxMultipleRetries",
            CounterId::MpduTxFailed => "MPDUTxFailed",
            CounterId::RtsFailed => "RTSFailed",
            CounterId::AckFailed => "ACKFailed",
            CounterId::MpduRxSuccessful => "MPDURxSuccessful",
            CounterId::FrameReceives => "FrameReceives",
            CounterId::DataFrameReceives => "DataFrameReceives",
            CounterId::CtrlFrameReceives => "CtrlFrameReceives",
            CounterId::MgmtFrameReceives => "MgmtFrameReceives",
            CounterId::FrameErrors => "FrameErrors",
            CounterId::DataFrameErrors => "DataFrameErrors",
            CounterId::CtrlFrameErrors => "CtrlFrameErrors",
            CounterId::MgmtFrameErrors => "MgmtFrameErrors",
            CounterId::FrameErrorsNoise => "FrameErrorsNoise",
            CounterId::DataFrameErrorsNoise => "DataFrameErrorsNoise",
            CounterId::CtrlFrameErrorsNoise => "CtrlFrameErrorsNoise",
            CounterId::MgmtFrameErrorsNoise => "MgmtFrameErrorsNoise",
            CounterId::FrameDropSyn => "FrameDropSyn",
            CounterId::DataFrameDropSyn => "DataFrameDropSyn",
            CounterId::CtrlFrameDropSyn => "CtrlFrameDropSyn",
            CounterId::MgmtFrameDropSyn => "MgmtFrameDropSyn",
            CounterId::FrameDropTxa => "FrameDropTxa",
            CounterId::DataFrameDropTxa => "DataFrameDropTxa",
            CounterId::CtrlFrameDropTxa => "CtrlFrameDropTxa",
            CounterId::MgmtFrameDropTxa => "MgmtFrameDropTxa",
            CounterId::IdleSlots => "idleSlots",
            CounterId::Idle2Slots => "idle2Slots",
        }
    }
}

impl fmt::Display for CounterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for CounterId {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CounterId::ALL
            .into_iter()
            .find(|id| id.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| ConfigError::InvalidValue {
                name: "counter name",
                reason: format!("`{s}` is not a MAC counter"),
            })
    }
}

/// Receive-side counter families that keep a per frame type split.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxCounter {
    Receives,
    Errors,
    ErrorsNoise,
    DropSyn,
    DropTxa,
}

impl RxCounter {
    /// The aggregate counter and the frame type specific one.
    pub fn ids(self, frame_type: FrameType) -> (CounterId, CounterId) {
        use CounterId::*;
        use FrameType::{Control, Data, Management};
        match (self, frame_type) {
            (RxCounter::Receives, Data) => (FrameReceives, DataFrameReceives),
            (RxCounter::Receives, Control) => (FrameReceives, CtrlFrameReceives),
            (RxCounter::Receives, Management) => (FrameReceives, MgmtFrameReceives),
            (RxCounter::Errors, Data) => (FrameErrors, DataFrameErrors),
            (RxCounter::Errors, Control) => (FrameErrors, CtrlFrameErrors),
            (RxCounter::Errors, Management) => (FrameErrors, MgmtFrameErrors),
            (RxCounter::ErrorsNoise, Data) => (FrameErrorsNoise, DataFrameErrorsNoise),
            (RxCounter::ErrorsNoise, Control) => (FrameErrorsNoise, CtrlFrameErrorsNoise),
            (RxCounter::ErrorsNoise, Management) => (FrameErrorsNoise, MgmtFrameErrorsNoise),
            (RxCounter::DropSyn, Data) => (FrameDropSyn, DataFrameDropSyn),
            (RxCounter::DropSyn, Control) => (FrameDropSyn, CtrlFrameDropSyn),
            (RxCounter::DropSyn, Management) => (FrameDropSyn, MgmtFrameDropSyn),
            (RxCounter::DropTxa, Data) => (FrameDropTxa, DataFrameDropTxa),
            (RxCounter::DropTxa, Control) => (FrameDropTxa, CtrlFrameDropTxa),
            (RxCounter::DropTxa, Management) => (FrameDropTxa, MgmtFrameDropTxa),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MacCounters {
    pub mpdu_tx_successful: u64,
    pub mpdu_tx_one_retry: u64,
    pub mpdu_tx_multiple_retries: u64,
    pub mpdu_tx_failed: u64,
    pub rts_failed: u64,
    pub ack_failed: u64,
    pub mpdu_rx_successful: u64,
    pub frame_receives: u64,
    pub data_frame_receives: u64,
    pub ctrl_frame_receives: u64,
    pub mgmt_frame_receives: u64,
    pub frame_errors: u64,
    pub data_frame_errors: u64,
    pub ctrl_frame_errors: u64,
    pub mgmt_frame_errors: u64,
    pub frame_errors_noise: u64,
    pub data_frame_errors_noise: u64,
    pub ctrl_frame_errors_noise: u64,
    pub mgmt_frame_errors_noise: u64,
    pub frame_drop_syn: u64,
    pub data_frame_drop_syn: u64,
    pub ctrl_frame_drop_syn: u64,
    pub mgmt_frame_drop_syn: u64,
    pub frame_drop_txa: u64,
    pub data_frame_drop_txa: u64,
    pub ctrl_frame_drop_txa: u64,
    pub mgmt_frame_drop_txa: u64,
    pub idle_slots: u64,
    pub idle2_slots: u64,
}

impl MacCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: CounterId) -> u64 {
        match id {
            CounterId::MpduTxSuccessful => self.mpdu_tx_successful,
            CounterId::MpduTxOneRetry => self.mpdu_tx_one_retry,
            CounterId::MpduTxMultipleRetries => self.mpdu_tx_multiple_retries,
            CounterId::MpduTxFailed => self.mpdu_tx_failed,
            CounterId::RtsFailed => self.rts_failed,
            CounterId::AckFailed => self.ack_failed,
            CounterId::MpduRxSuccessful => self.mpdu_rx_successful,
            CounterId::FrameReceives => self.frame_receives,
            CounterId::DataFrameReceives => self.data_frame_receives,
            CounterId::CtrlFrameReceives => self.ctrl_frame_receives,
            CounterId::MgmtFrameReceives => self.mgmt_frame_receives,
            CounterId::FrameErrors => self.frame_errors,
            CounterId::DataFrameErrors => self.data_frame_errors,
            CounterId::CtrlFrameErrors => self.ctrl_frame_errors,
            CounterId::MgmtFrameErrors => self.mgmt_frame_errors,
            CounterId::FrameErrorsNoise => self.frame_errors_noise,
            CounterId::DataFrameErrorsNoise => self.data_frame_errors_noise,
            CounterId::CtrlFrameErrorsNoise => self.ctrl_frame_errors_noise,
            CounterId::MgmtFrameErrorsNoise => self.mgmt_frame_errors_noise,
            CounterId::FrameDropSyn => self.frame_drop_syn,
            CounterId::DataFrameDropSyn => self.data_frame_drop_syn,
            CounterId::CtrlFrameDropSyn => self.ctrl_frame_drop_syn,
            CounterId::MgmtFrameDropSyn => self.mgmt_frame_drop_syn,
            CounterId::FrameDropTxa => self.frame_drop_txa,
            CounterId::DataFrameDropTxa => self.data_frame_drop_txa,
            CounterId::CtrlFrameDropTxa => self.ctrl_frame_drop_txa,
            CounterId::MgmtFrameDropTxa => self.mgmt_frame_drop_txa,
            CounterId::IdleSlots => self.idle_slots,
            CounterId::Idle2Slots => self.idle2_slots,
        }
    }

    fn slot(&mut self, id: CounterId) -> &mut u64 {
        match id {
            CounterId::MpduTxSuccessful => &mut self.mpdu_tx_successful,
            CounterId::MpduTxOneRetry => &mut self.mpdu_tx_one_retry,
            CounterId::MpduTxMultipleRetries => &mut self.mpdu_tx_multiple_retries,
            CounterId::MpduTxFailed => &mut self.mpdu_tx_failed,
            CounterId::RtsFailed => &mut self.rts_failed,
            CounterId::AckFailed => &mut self.ack_failed,
            CounterId::MpduRxSuccessful => &mut self.mpdu_rx_successful,
            CounterId::FrameReceives => &mut self.frame_receives,
            CounterId::DataFrameReceives => &mut self.data_frame_receives,
            CounterId::CtrlFrameReceives => &mut self.ctrl_frame_receives,
            CounterId::MgmtFrameReceives => &mut self.mgmt_frame_receives,
            CounterId::FrameErrors => &mut self.frame_errors,
            CounterId::DataFrameErrors => &mut self.data_frame_errors,
            CounterId::CtrlFrameErrors => &mut self.ctrl_frame_errors,
            CounterId::MgmtFrameErrors => &mut self.mgmt_frame_errors,
            CounterId::FrameErrorsNoise => &mut self.frame_errors_noise,
            CounterId::DataFrameErrorsNoise => &mut self.data_frame_errors_noise,
            CounterId::CtrlFrameErrorsNoise => &mut self.ctrl_frame_errors_noise,
            CounterId::MgmtFrameErrorsNoise => &mut self.mgmt_frame_errors_noise,
            CounterId::FrameDropSyn => &mut self.frame_drop_syn,
            CounterId::DataFrameDropSyn => &mut self.data_frame_drop_syn,
            CounterId::CtrlFrameDropSyn => &mut self.ctrl_frame_drop_syn,
            CounterId::MgmtFrameDropSyn => &mut self.mgmt_frame_drop_syn,
            CounterId::FrameDropTxa => &mut self.frame_drop_txa,
            CounterId::DataFrameDropTxa => &mut self.data_frame_drop_txa,
            CounterId::CtrlFrameDropTxa => &mut self.ctrl_frame_drop_txa,
            CounterId::MgmtFrameDropTxa => &mut self.mgmt_frame_drop_txa,
            CounterId::IdleSlots => &mut self.idle_slots,
            CounterId::Idle2Slots => &mut self.idle2_slots,
        }
    }

    pub fn add(&mut self, id: CounterId, step: u64) {
        *self.slot(id) += step;
    }

    pub fn inc(&mut self, id: CounterId) {
        self.add(id, 1);
    }

    /// Bump a receive family's aggregate and its frame type split.
    pub fn inc_rx(&mut self, counter: RxCounter, frame_type: FrameType) {
        let (total, split) = counter.ids(frame_type);
        self.inc(total);
        self.inc(split);
    }

    pub fn reset_idle_slots(&mut self) {
        self.idle_slots = 0;
        self.idle2_slots = 0;
    }

    /// Share of data frame errors caused by noise alone.
    pub fn perr(&self) -> f64 {
        if self.data_frame_errors == 0 {
            return 0.0;
        }
        self.data_frame_errors_noise as f64 / self.data_frame_errors as f64
    }

    /// Share of data frame errors caused by collisions.
    pub fn pcoll(&self) -> f64 {
        if self.data_frame_errors == 0 {
            return 0.0;
        }
        let coll = self.data_frame_errors.saturating_sub(self.data_frame_errors_noise);
        coll as f64 / self.data_frame_errors as f64
    }

    fn groups(&self) -> [(&'static str, Vec<u64>); 8] {
        [
            (
                "TxSucc",
                vec![
                    self.mpdu_tx_successful,
                    self.mpdu_tx_one_retry,
                    self.mpdu_tx_multiple_retries,
                ],
            ),
            (
                "TxFail",
                vec![self.mpdu_tx_failed, self.rts_failed, self.ack_failed],
            ),
            (
                "RXSucc",
                vec![
                    self.mpdu_rx_successful,
                    self.frame_receives,
                    self.data_frame_receives,
                    self.ctrl_frame_receives,
                    self.mgmt_frame_receives,
                ],
            ),
            (
                "RXFail",
                vec![
                    self.frame_errors,
                    self.data_frame_errors,
                    self.ctrl_frame_errors,
                    self.mgmt_frame_errors,
                ],
            ),
            (
                "RXFailNoise",
                vec![
                    self.frame_errors_noise,
                    self.data_frame_errors_noise,
                    self.ctrl_frame_errors_noise,
                    self.mgmt_frame_errors_noise,
                ],
            ),
            (
                "SYN",
                vec![
                    self.frame_drop_syn,
                    self.data_frame_drop_syn,
                    self.ctrl_frame_drop_syn,
                    self.mgmt_frame_drop_syn,
                ],
            ),
            (
                "TXA",
                vec![
                    self.frame_drop_txa,
                    self.data_frame_drop_txa,
                    self.ctrl_frame_drop_txa,
                    self.mgmt_frame_drop_txa,
                ],
            ),
            // the label typo is kept, log parsers match on it
            ("IdleSlost", vec![self.idle_slots, self.idle2_slots]),
        ]
    }

    /// Fixed-width dump of every counter for log post-processing.
    pub fn counters_string(&self, verbose: bool) -> String {
        let groups = self.groups();
        let rendered: Vec<String> = groups
            .iter()
            .map(|(label, values)| {
                let width = if *label == "IdleSlost" { 8 } else { 5 };
                let cols: Vec<String> = values.iter().map(|v| format!("{v:width$}")).collect();
                if verbose {
                    format!("{label} {}", cols.join(" "))
                } else {
                    cols.join(" ")
                }
            })
            .collect();
        if verbose {
            format!(" {}", rendered.join("  "))
        } else {
            rendered.join("   ")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_round_trip_through_parse() {
        for id in CounterId::ALL {
            assert_eq!(id.name().parse::<CounterId>().unwrap(), id);
        }
        assert_eq!("mpdutxfailed".parse::<CounterId>().unwrap(), CounterId::MpduTxFailed);
        assert!("TxBytes".parse::<CounterId>().is_err());
    }

    #[test]
    fn rx_family_bumps_total_and_split() {
        let mut c = MacCounters::new();
        c.inc_rx(RxCounter::Receives, FrameType::Data);
        c.inc_rx(RxCounter::Receives, FrameType::Control);
        c.inc_rx(RxCounter::DropTxa, FrameType::Management);
        assert_eq!(c.get(CounterId::FrameReceives), 2);
        assert_eq!(c.get(CounterId::DataFrameReceives), 1);
        assert_eq!(c.get(CounterId::CtrlFrameReceives), 1);
        assert_eq!(c.get(CounterId::FrameDropTxa), 1);
        assert_eq!(c.get(CounterId::MgmtFrameDropTxa), 1);
    }

    #[test]
    fn error_ratios() {
        let mut c = MacCounters::new();
        assert_eq!(c.perr(), 0.0);
        assert_eq!(c.pcoll(), 0.0);
        for _ in 0..4 {
            c.inc_rx(RxCounter::Errors, FrameType::Data);
        }
        c.inc_rx(RxCounter::ErrorsNoise, FrameType::Data);
        assert!((c.perr() - 0.25).abs() < 1e-12);
        assert!((c.pcoll() - 0.75).abs() < 1e-12);
    }

    #[test]
    fn verbose_counter_string() {
        let mut c = MacCounters::new();
        c.add(CounterId::MpduTxSuccessful, 12);
        c.add(CounterId::Idle2Slots, 123456);
        let s = c.counters_string(true);
        assert!(s.starts_with(" TxSucc    12     0     0  TxFail     0     0     0  RXSucc "));
        assert!(s.ends_with("IdleSlost        0   123456"));
    }

    #[test]
    fn terse_counter_string() {
        let c = MacCounters::new();
        let s = c.counters_string(false);
        let zeros = "    0";
        let expected = [
            vec![zeros; 3].join(" "),
            vec![zeros; 3].join(" "),
            vec![zeros; 5].join(" "),
            vec![zeros; 4].join(" "),
            vec![zeros; 4].join(" "),
            vec![zeros; 4].join(" "),
            vec![zeros; 4].join(" "),
            "       0        0".to_string(),
        ]
        .join("   ");
        assert_eq!(s, expected);
    }

    #[test]
    fn reset_idle_slots_keeps_other_counters() {
        let mut c = MacCounters::new();
        c.add(CounterId::IdleSlots, 5);
        c.add(CounterId::Idle2Slots, 7);
        c.inc(CounterId::AckFailed);
        c.reset_idle_slots();
        assert_eq!(c.idle_slots, 0);
        assert_eq!(c.idle2_slots, 0);
        assert_eq!(c.ack_failed, 1);
    }
}
