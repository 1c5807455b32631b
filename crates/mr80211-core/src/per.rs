//! Table-driven packet error rate model.
//!
//! Calibration points are stored per PHY mode as rows of a fixed packet
//! length, each row holding (SNR, PER) pairs in ascending SNR order.
//! Queries bracket the target between the two nearest lengths and the two
//! nearest SNR (or PER) samples of each length and interpolate linearly
//! along both axes.

use mr80211_abstract::{PhyMode, PhyModeError};
use std::fmt;
use tracing::{debug, warn};

use crate::error::{ConfigError, LookupError};

/// Lengths swept by [`PerTable::print_data`].
pub const DUMP_LENGTHS: [u32; 4] = [128, 256, 512, 1024];

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SnrPer {
    pub snr: f64,
    pub per: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PerRow {
    pub len: u32,
    /// Ascending in SNR.
    pub points: Vec<SnrPer>,
}

/// One calibration point returned by a lookup.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PerPoint {
    pub len: u32,
    pub snr: f64,
    pub per: f64,
}

/// The up to four calibration points bracketing a query.
///
/// Slot layout: `[0]` upper and `[1]` lower neighbour on the first length
/// (L1, the shortest length not below the target, or the longest length),
/// `[2]` upper and `[3]` lower neighbour on the previous length L2, which is
/// only looked at when L1 is strictly longer than the target.
///
/// For SNR→PER lookups "upper" is the first point with SNR ≥ target; for
/// PER→SNR lookups it is the first point with PER ≤ target. "Lower" is the
/// point just before it. When the target lies beyond the last sample of a
/// row, that sample is reported as the lower neighbour.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PerQueryResult {
    pub slots: [Option<PerPoint>; 4],
}

impl PerQueryResult {
    pub fn l1_upper(&self) -> Option<PerPoint> {
        self.slots[0]
    }

    pub fn l1_lower(&self) -> Option<PerPoint> {
        self.slots[1]
    }

    pub fn l2_upper(&self) -> Option<PerPoint> {
        self.slots[2]
    }

    pub fn l2_lower(&self) -> Option<PerPoint> {
        self.slots[3]
    }

    /// The (upper, lower) pair of each length with a missing side filled
    /// from the other side of the same length.
    pub fn backfilled(&self) -> [Option<(PerPoint, PerPoint)>; 2] {
        [
            backfill(self.slots[0], self.slots[1]),
            backfill(self.slots[2], self.slots[3]),
        ]
    }
}

fn backfill(upper: Option<PerPoint>, lower: Option<PerPoint>) -> Option<(PerPoint, PerPoint)> {
    match (upper, lower) {
        (Some(u), Some(l)) => Some((u, l)),
        (Some(p), None) | (None, Some(p)) => Some((p, p)),
        (None, None) => None,
    }
}

fn nearly_equal(a: f64, b: f64) -> bool {
    (a - b).abs() <= f64::EPSILON * a.abs().max(b.abs()).max(1.0)
}

/// Linear interpolation through (x0, y0) and (x1, y1); collapses to `y0`
/// when the abscissas coincide.
fn interpolate(x0: f64, y0: f64, x1: f64, y1: f64, x: f64) -> f64 {
    if nearly_equal(x0, x1) {
        y0
    } else {
        y0 + (y1 - y0) / (x1 - x0) * (x - x0)
    }
}

/// An interpolated SNR sample emitted by [`PerTable::print_data`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SnrSample {
    pub mode: PhyMode,
    pub len: u32,
    pub per: f64,
    pub snr: f64,
}

impl fmt::Display for SnrSample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {:.1} {}", self.mode, self.len, self.per, self.snr)
    }
}

#[derive(Debug, Clone, Default)]
pub struct PerTable {
    tables: [Vec<PerRow>; PhyMode::ALL.len()],
    debug_level: u8,
}

impl PerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_debug_level(&mut self, level: u8) {
        self.debug_level = level;
    }

    pub fn rows(&self, mode: PhyMode) -> &[PerRow] {
        match mode.index() {
            Some(i) => &self.tables[i],
            None => &[],
        }
    }

    pub fn is_empty(&self, mode: PhyMode) -> bool {
        self.rows(mode).is_empty()
    }

    /// Insert a calibration point, keeping lengths and SNRs sorted.
    ///
    /// Identical (length, snr) pairs are all kept; the most recent one sorts
    /// first and is therefore the one lookups see.
    pub fn set_per(&mut self, mode: PhyMode, len: u32, snr: f64, per: f64) -> Result<(), ConfigError> {
        let idx = mode
            .index()
            .ok_or_else(|| PhyModeError::Unrecognized(mode.to_string()))?;
        if !snr.is_finite() || !per.is_finite() {
            return Err(ConfigError::InvalidValue {
                name: "PER entry",
                reason: format!("snr={snr} per={per} must be finite"),
            });
        }
        let rows = &mut self.tables[idx];
        let pos = rows.partition_point(|r| r.len < len);
        if rows.get(pos).is_none_or(|r| r.len != len) {
            rows.insert(
                pos,
                PerRow {
                    len,
                    points: Vec::new(),
                },
            );
        }
        let points = &mut rows[pos].points;
        let at = points.partition_point(|p| p.snr < snr);
        points.insert(at, SnrPer { snr, per });
        Ok(())
    }

    /// String-keyed form of [`PerTable::set_per`] for configuration input.
    pub fn add_per_entry(&mut self, mode: &str, len: u32, snr: f64, per: f64) -> Result<(), ConfigError> {
        let mode: PhyMode = mode.parse()?;
        self.set_per(mode, len, snr, per)
    }

    /// Load `<mode> <len> <snr> <per>` lines. Blank lines and `#` comments are
    /// skipped. Returns the number of points added.
    pub fn load_from_str(&mut self, text: &str) -> Result<usize, ConfigError> {
        let mut added = 0;
        for (n, raw) in text.lines().enumerate() {
            let line = raw.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let parse_err = |reason: String| ConfigError::Parse { line: n + 1, reason };
            let fields: Vec<&str> = line.split_whitespace().collect();
            let [mode, len, snr, per] = fields.as_slice() else {
                return Err(parse_err(format!("expected 4 fields, found {}", fields.len())));
            };
            let mode: PhyMode = mode.parse().map_err(|e: PhyModeError| parse_err(e.to_string()))?;
            let len: u32 = len
                .parse()
                .map_err(|_| parse_err(format!("bad length `{len}`")))?;
            let snr: f64 = snr.parse().map_err(|_| parse_err(format!("bad snr `{snr}`")))?;
            let per: f64 = per.parse().map_err(|_| parse_err(format!("bad per `{per}`")))?;
            self.set_per(mode, len, snr, per)?;
            added += 1;
        }
        Ok(added)
    }

    /// The length rows bracketing `tlen`: L1 and, when L1 is longer than
    /// the target, the row before it.
    fn length_bracket(&self, mode: PhyMode, tlen: u32) -> Result<(&PerRow, Option<&PerRow>), LookupError> {
        let rows = self.rows(mode);
        if rows.is_empty() {
            warn!("PER table for {} has no entries", mode);
            return Err(LookupError::EmptyTable(mode));
        }
        let i1 = rows
            .iter()
            .position(|r| r.len >= tlen)
            .unwrap_or(rows.len() - 1);
        let l1 = &rows[i1];
        let l2 = if l1.len > tlen && i1 > 0 {
            Some(&rows[i1 - 1])
        } else {
            None
        };
        Ok((l1, l2))
    }

    fn bracket_row<F>(row: &PerRow, reached: F, beyond: impl Fn(&SnrPer) -> bool) -> [Option<PerPoint>; 2]
    where
        F: Fn(&SnrPer) -> bool,
    {
        let point = |p: &SnrPer| PerPoint {
            len: row.len,
            snr: p.snr,
            per: p.per,
        };
        match row.points.iter().position(&reached) {
            Some(j) => {
                let lower = if j > 0 && beyond(&row.points[j]) {
                    Some(point(&row.points[j - 1]))
                } else {
                    None
                };
                [Some(point(&row.points[j])), lower]
            }
            None => [None, row.points.last().map(point)],
        }
    }

    fn lookup<F, G>(&self, mode: PhyMode, tlen: u32, reached: F, beyond: G) -> Result<PerQueryResult, LookupError>
    where
        F: Fn(&SnrPer) -> bool + Copy,
        G: Fn(&SnrPer) -> bool + Copy,
    {
        let (l1, l2) = self.length_bracket(mode, tlen)?;
        let [s0, s1] = Self::bracket_row(l1, reached, beyond);
        let [s2, s3] = match l2 {
            Some(row) => Self::bracket_row(row, reached, beyond),
            None => [None, None],
        };
        Ok(PerQueryResult {
            slots: [s0, s1, s2, s3],
        })
    }

    /// Bracketing calibration points for a PER query at `tsnr` dB.
    pub fn lookup_per(&self, mode: PhyMode, tsnr: f64, tlen: u32) -> Result<PerQueryResult, LookupError> {
        self.lookup(mode, tlen, |p| p.snr >= tsnr, |p| p.snr > tsnr)
    }

    /// Bracketing calibration points for an SNR query at error rate `tper`.
    /// Assumes PER decreases as SNR grows within a row.
    pub fn lookup_snr(&self, mode: PhyMode, tper: f64, tlen: u32) -> Result<PerQueryResult, LookupError> {
        self.lookup(mode, tlen, |p| p.per <= tper, |p| p.per < tper)
    }

    /// Combine the per-length values over the length axis.
    fn across_lengths(
        &self,
        mode: PhyMode,
        tlen: u32,
        target: f64,
        values: [Option<(u32, f64)>; 2],
    ) -> Result<f64, LookupError> {
        match values {
            [Some((len1, v1)), Some((len2, v2))] => Ok(interpolate(
                f64::from(len1),
                v1,
                f64::from(len2),
                v2,
                f64::from(tlen),
            )),
            [Some((_, v)), None] | [None, Some((_, v))] => Ok(v),
            [None, None] => {
                warn!("no usable PER bracket for {} len={} target={}", mode, tlen, target);
                Err(LookupError::NoBracket {
                    mode,
                    len: tlen,
                    target,
                })
            }
        }
    }

    /// Packet error rate of a `tlen`-byte frame received at `tsnr` dB.
    pub fn get_per(&self, mode: PhyMode, tsnr: f64, tlen: u32) -> Result<f64, LookupError> {
        let q = self.lookup_per(mode, tsnr, tlen)?;
        let values = q
            .backfilled()
            .map(|pair| pair.map(|(u, l)| (u.len, interpolate(l.snr, l.per, u.snr, u.per, tsnr))));
        let per = self.across_lengths(mode, tlen, tsnr, values)?;
        if self.debug_level > 2 {
            debug!("get_per {} snr={} len={} -> {} ({:?})", mode, tsnr, tlen, per, q);
        }
        Ok(per)
    }

    /// SNR in dB at which a `tlen`-byte frame sees error rate `tper`.
    pub fn get_snr(&self, mode: PhyMode, tper: f64, tlen: u32) -> Result<f64, LookupError> {
        let q = self.lookup_snr(mode, tper, tlen)?;
        let values = q
            .backfilled()
            .map(|pair| pair.map(|(u, l)| (u.len, interpolate(l.per, l.snr, u.per, u.snr, tper))));
        let snr = self.across_lengths(mode, tlen, tper, values)?;
        if self.debug_level > 2 {
            debug!("get_snr {} per={} len={} -> {} ({:?})", mode, tper, tlen, snr, q);
        }
        Ok(snr)
    }

    /// SNR needed for PER 0.0, 0.1, ... 0.9 at a few reference lengths, for
    /// every mode that has calibration data.
    pub fn print_data(&self) -> Vec<SnrSample> {
        let mut out = Vec::new();
        for mode in PhyMode::ALL {
            if self.is_empty(mode) {
                continue;
            }
            for len in DUMP_LENGTHS {
                for step in 0..10u32 {
                    let per = f64::from(step) / 10.0;
                    if let Ok(snr) = self.get_snr(mode, per, len) {
                        out.push(SnrSample { mode, len, per, snr });
                    }
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_table() -> PerTable {
        let mut t = PerTable::new();
        t.set_per(PhyMode::Mode1Mb, 20, 1.0, 0.4).unwrap();
        t.set_per(PhyMode::Mode1Mb, 20, 2.0, 0.2).unwrap();
        t.set_per(PhyMode::Mode1Mb, 10, 1.0, 0.2).unwrap();
        t.set_per(PhyMode::Mode1Mb, 5, 1.0, 1.0).unwrap();
        t
    }

    fn monotone_table() -> PerTable {
        let mut t = PerTable::new();
        for (len, shift) in [(100u32, 0.0), (1000, 3.0)] {
            for (snr, per) in [(0.0, 0.9), (5.0, 0.5), (10.0, 0.1), (15.0, 0.01)] {
                t.set_per(PhyMode::Mode11Mb, len, snr + shift, per).unwrap();
            }
        }
        t
    }

    #[test]
    fn end_to_end_example() {
        let t = sample_table();
        let per = t.get_per(PhyMode::Mode1Mb, 1.5, 20).unwrap();
        assert!((per - 0.3).abs() < 1e-12, "got {per}");
    }

    #[test]
    fn rows_are_sorted_on_insert() {
        let mut t = PerTable::new();
        t.set_per(PhyMode::Mode2Mb, 300, 4.0, 0.1).unwrap();
        t.set_per(PhyMode::Mode2Mb, 100, 2.0, 0.3).unwrap();
        t.set_per(PhyMode::Mode2Mb, 300, 1.0, 0.6).unwrap();
        t.set_per(PhyMode::Mode2Mb, 200, 3.0, 0.2).unwrap();
        let rows = t.rows(PhyMode::Mode2Mb);
        let lens: Vec<u32> = rows.iter().map(|r| r.len).collect();
        assert_eq!(lens, vec![100, 200, 300]);
        let snrs: Vec<f64> = rows[2].points.iter().map(|p| p.snr).collect();
        assert_eq!(snrs, vec![1.0, 4.0]);
        assert!(t.is_empty(PhyMode::Mode1Mb));
    }

    #[test]
    fn exact_at_sample_points() {
        let t = monotone_table();
        for row in t.rows(PhyMode::Mode11Mb) {
            for p in &row.points {
                assert_eq!(t.get_per(PhyMode::Mode11Mb, p.snr, row.len).unwrap(), p.per);
            }
        }
    }

    #[test]
    fn bracket_ordering() {
        let t = monotone_table();
        for tsnr in [-3.0, 0.0, 2.5, 7.0, 12.9, 15.0, 40.0] {
            for tlen in [50u32, 100, 500, 1000, 4000] {
                let q = t.lookup_per(PhyMode::Mode11Mb, tsnr, tlen).unwrap();
                for upper in [q.l1_upper(), q.l2_upper()].into_iter().flatten() {
                    assert!(upper.snr >= tsnr);
                }
                for lower in [q.l1_lower(), q.l2_lower()].into_iter().flatten() {
                    assert!(lower.snr < tsnr);
                }
            }
        }
    }

    #[test]
    fn length_bracket_only_below_longer_row() {
        let t = monotone_table();
        let q = t.lookup_per(PhyMode::Mode11Mb, 7.0, 500).unwrap();
        assert_eq!(q.l1_upper().map(|p| p.len), Some(1000));
        assert_eq!(q.l2_upper().map(|p| p.len), Some(100));

        let q = t.lookup_per(PhyMode::Mode11Mb, 7.0, 1000).unwrap();
        assert!(q.l2_upper().is_none() && q.l2_lower().is_none());

        // longer than every row: the longest row alone answers
        let q = t.lookup_per(PhyMode::Mode11Mb, 7.0, 5000).unwrap();
        assert_eq!(q.l1_upper().map(|p| p.len), Some(1000));
        assert!(q.l2_upper().is_none());
    }

    #[test]
    fn interpolates_across_lengths() {
        let t = monotone_table();
        // at 550 bytes: halfway between rows 100 and 1000
        let p100 = t.get_per(PhyMode::Mode11Mb, 6.0, 100).unwrap();
        let p1000 = t.get_per(PhyMode::Mode11Mb, 6.0, 1000).unwrap();
        let mid = t.get_per(PhyMode::Mode11Mb, 6.0, 550).unwrap();
        assert!((mid - (p100 + p1000) / 2.0).abs() < 1e-12);
    }

    #[test]
    fn clamps_outside_snr_range() {
        let t = monotone_table();
        assert_eq!(t.get_per(PhyMode::Mode11Mb, -10.0, 100).unwrap(), 0.9);
        assert_eq!(t.get_per(PhyMode::Mode11Mb, 99.0, 100).unwrap(), 0.01);
    }

    #[test]
    fn get_snr_inverts_get_per() {
        let t = monotone_table();
        for s in [1.0, 4.2, 7.5, 11.0, 14.9] {
            for len in [100u32, 1000] {
                let per = t.get_per(PhyMode::Mode11Mb, s, len).unwrap();
                let back = t.get_snr(PhyMode::Mode11Mb, per, len).unwrap();
                assert!((back - s).abs() < 1e-9, "s={s} len={len} back={back}");
            }
        }
    }

    #[test]
    fn single_length_table_ignores_requested_length() {
        let mut t = PerTable::new();
        t.set_per(PhyMode::Mode6Mb, 500, 2.0, 0.5).unwrap();
        t.set_per(PhyMode::Mode6Mb, 500, 6.0, 0.1).unwrap();
        let at = t.get_per(PhyMode::Mode6Mb, 4.0, 500).unwrap();
        for len in [1, 499, 501, 10_000] {
            assert_eq!(t.get_per(PhyMode::Mode6Mb, 4.0, len).unwrap(), at);
        }
        assert!((at - 0.3).abs() < 1e-12);
    }

    #[test]
    fn duplicate_points_use_latest_insert() {
        let mut t = PerTable::new();
        t.set_per(PhyMode::Mode1Mb, 100, 3.0, 0.5).unwrap();
        t.set_per(PhyMode::Mode1Mb, 100, 3.0, 0.7).unwrap();
        assert_eq!(t.rows(PhyMode::Mode1Mb)[0].points.len(), 2);
        assert_eq!(t.get_per(PhyMode::Mode1Mb, 3.0, 100).unwrap(), 0.7);
    }

    #[test]
    fn coincident_abscissas_collapse_to_constant() {
        assert_eq!(interpolate(3.0, 0.5, 3.0, 0.7, 2.0), 0.5);
        assert_eq!(interpolate(3.0, 0.5, 3.0 + 1e-17, 0.7, 9.0), 0.5);
        assert!((interpolate(1.0, 0.4, 2.0, 0.2, 1.5) - 0.3).abs() < 1e-12);
    }

    #[test]
    fn empty_mode_is_a_lookup_error() {
        let t = sample_table();
        assert_eq!(
            t.get_per(PhyMode::Mode54Mb, 10.0, 100),
            Err(LookupError::EmptyTable(PhyMode::Mode54Mb))
        );
        assert!(t.lookup_snr(PhyMode::Unknown, 0.1, 100).is_err());
    }

    #[test]
    fn rejects_unknown_modes() {
        let mut t = PerTable::new();
        assert!(matches!(
            t.add_per_entry("Mode7Mb", 100, 1.0, 0.1),
            Err(ConfigError::PhyMode(PhyModeError::Unrecognized(_)))
        ));
        assert!(t.set_per(PhyMode::Unknown, 100, 1.0, 0.1).is_err());
        t.add_per_entry("mode9mb", 100, 1.0, 0.1).unwrap();
        assert!(!t.is_empty(PhyMode::Mode9Mb));
    }

    #[test]
    fn loads_calibration_text() {
        let mut t = PerTable::new();
        let n = t
            .load_from_str("# mode len snr per\nMode1Mb 20 1 0.4\n\nMode1Mb 20 2 0.2 # tail\n")
            .unwrap();
        assert_eq!(n, 2);
        assert!((t.get_per(PhyMode::Mode1Mb, 1.5, 20).unwrap() - 0.3).abs() < 1e-12);

        let err = t.load_from_str("Mode1Mb 20 x 0.1").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { line: 1, .. }));
        let err = t.load_from_str("\nMode1Mb 20 1").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { line: 2, .. }));
    }

    #[test]
    fn print_data_covers_calibrated_modes() {
        let t = monotone_table();
        let samples = t.print_data();
        assert_eq!(samples.len(), DUMP_LENGTHS.len() * 10);
        assert!(samples.iter().all(|s| s.mode == PhyMode::Mode11Mb));
        let first = samples[0];
        assert_eq!(first.len, 128);
        assert_eq!(first.per, 0.0);
        // PER 0 lies beyond the last sample: clamps to the highest SNR of each row
        assert_eq!(first.to_string().split(' ').count(), 4);
        assert!(samples.iter().all(|s| s.snr.is_finite()));
    }
}
