use mr80211_abstract::MacAddr;
use serde::Serialize;
use std::fmt;

use crate::mib::MacCounters;

/// Link quality and counters for one ordered (src, dst) pair.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PeerStats {
    /// dB
    pub snr: f64,
    /// dB
    pub snir: f64,
    /// W
    pub interference: f64,
    pub counters: MacCounters,
}

impl PeerStats {
    pub fn render(&self, verbose: bool) -> String {
        format!(
            "{:6.3} {:6.3} {:6.3}  {}",
            self.snr,
            self.snir,
            self.interference,
            self.counters.counters_string(verbose)
        )
    }
}

impl fmt::Display for PeerStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render(false))
    }
}

/// Storage for per-pair statistics shared by every MAC of a simulation.
pub trait PeerStatsDb {
    /// Entry for the pair, created on first access.
    fn get_peer_stats(&mut self, src: MacAddr, dst: MacAddr) -> &mut PeerStats;

    /// Entry for the pair if it has ever been touched.
    fn peer_stats(&self, src: MacAddr, dst: MacAddr) -> Option<&PeerStats>;

    /// One `"%3d <--> %3d   <stats>"` line per touched pair.
    fn dump(&self) -> Vec<String>;
}

/// Square table indexed by station number.
#[derive(Debug, Clone, Default)]
pub struct StaticPeerStatsDb {
    num_peers: usize,
    entries: Vec<Option<PeerStats>>,
    verbose_counters: bool,
}

impl StaticPeerStatsDb {
    pub fn new(num_peers: usize) -> Self {
        Self {
            num_peers,
            entries: vec![None; num_peers * num_peers],
            verbose_counters: false,
        }
    }

    pub fn num_peers(&self) -> usize {
        self.num_peers
    }

    pub fn set_verbose_counters(&mut self, verbose: bool) {
        self.verbose_counters = verbose;
    }

    fn grow(&mut self, needed: usize) {
        let n = needed.max(self.num_peers);
        let mut entries = vec![None; n * n];
        for src in 0..self.num_peers {
            for dst in 0..self.num_peers {
                entries[src * n + dst] = self.entries[src * self.num_peers + dst].take();
            }
        }
        self.entries = entries;
        self.num_peers = n;
    }

    fn slot(&self, src: MacAddr, dst: MacAddr) -> Option<usize> {
        let (s, d) = (src.index(), dst.index());
        (s < self.num_peers && d < self.num_peers).then_some(s * self.num_peers + d)
    }
}

impl PeerStatsDb for StaticPeerStatsDb {
    fn get_peer_stats(&mut self, src: MacAddr, dst: MacAddr) -> &mut PeerStats {
        let needed = src.index().max(dst.index()) + 1;
        if needed > self.num_peers {
            self.grow(needed);
        }
        let idx = src.index() * self.num_peers + dst.index();
        self.entries[idx].get_or_insert_with(PeerStats::default)
    }

    fn peer_stats(&self, src: MacAddr, dst: MacAddr) -> Option<&PeerStats> {
        self.slot(src, dst).and_then(|i| self.entries[i].as_ref())
    }

    fn dump(&self) -> Vec<String> {
        let n = self.num_peers;
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(i, e)| {
                e.as_ref().map(|ps| {
                    format!("{:3} <--> {:3}   {}", i / n, i % n, ps.render(self.verbose_counters))
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mib::CounterId;

    #[test]
    fn entries_are_created_lazily_per_ordered_pair() {
        let mut db = StaticPeerStatsDb::new(3);
        assert!(db.peer_stats(MacAddr(0), MacAddr(1)).is_none());
        db.get_peer_stats(MacAddr(0), MacAddr(1)).snr = 12.5;
        assert_eq!(db.peer_stats(MacAddr(0), MacAddr(1)).unwrap().snr, 12.5);
        assert!(db.peer_stats(MacAddr(1), MacAddr(0)).is_none());
    }

    #[test]
    fn grows_for_out_of_range_peers() {
        let mut db = StaticPeerStatsDb::new(2);
        db.get_peer_stats(MacAddr(1), MacAddr(0))
            .counters
            .inc(CounterId::MpduTxSuccessful);
        db.get_peer_stats(MacAddr(4), MacAddr(1)).snir = 3.0;
        assert_eq!(db.num_peers(), 5);
        let kept = db.peer_stats(MacAddr(1), MacAddr(0)).unwrap();
        assert_eq!(kept.counters.mpdu_tx_successful, 1);
        assert_eq!(db.peer_stats(MacAddr(4), MacAddr(1)).unwrap().snir, 3.0);
    }

    #[test]
    fn dump_lines() {
        let mut db = StaticPeerStatsDb::new(4);
        let ps = db.get_peer_stats(MacAddr(2), MacAddr(3));
        ps.snr = 10.0;
        ps.snir = 9.5;
        db.get_peer_stats(MacAddr(0), MacAddr(1));

        let lines = db.dump();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("  0 <-->   1    0.000  0.000  0.000      0"));
        assert!(lines[1].starts_with("  2 <-->   3   10.000  9.500  0.000      0"));
    }
}
