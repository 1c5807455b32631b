use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Long PLCP preamble + header for DSSS/CCK rates.
pub const LONG_PREAMBLE_DURATION: f64 = 192e-6;
/// Short PLCP preamble + header for DSSS/CCK rates.
pub const SHORT_PREAMBLE_DURATION: f64 = LONG_PREAMBLE_DURATION / 2.0;
/// OFDM preamble (16us) + SIGNAL (4us) + signal extension (6us).
pub const OFDM_PREAMBLE_DURATION: f64 = 26e-6;
pub const OFDM_SYMBOL_DURATION: f64 = 4e-6;
/// SERVICE (16 bits) + tail (6 bits).
pub const OFDM_SERVICE_TAIL_BITS: f64 = 22.0;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PhyModeError {
    #[error("unknown PHY mode `{0}`")]
    Unrecognized(String),
    #[error("PHY mode is unknown and has no timing")]
    NoTiming,
}

/// 802.11b/g transmission modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum PhyMode {
    Mode1Mb,
    Mode2Mb,
    Mode5_5Mb,
    Mode11Mb,
    Mode6Mb,
    Mode9Mb,
    Mode12Mb,
    Mode18Mb,
    Mode24Mb,
    Mode36Mb,
    Mode48Mb,
    Mode54Mb,
    Unknown,
}

impl PhyMode {
    /// Every mode with defined timing, in table order.
    pub const ALL: [PhyMode; 12] = [
        PhyMode::Mode1Mb,
        PhyMode::Mode2Mb,
        PhyMode::Mode5_5Mb,
        PhyMode::Mode11Mb,
        PhyMode::Mode6Mb,
        PhyMode::Mode9Mb,
        PhyMode::Mode12Mb,
        PhyMode::Mode18Mb,
        PhyMode::Mode24Mb,
        PhyMode::Mode36Mb,
        PhyMode::Mode48Mb,
        PhyMode::Mode54Mb,
    ];

    pub fn name(self) -> &'static str {
        match self {
            PhyMode::Mode1Mb => "Mode1Mb",
            PhyMode::Mode2Mb => "Mode2Mb",
            PhyMode::Mode5_5Mb => "Mode5_5Mb",
            PhyMode::Mode11Mb => "Mode11Mb",
            PhyMode::Mode6Mb => "Mode6Mb",
            PhyMode::Mode9Mb => "Mode9Mb",
            PhyMode::Mode12Mb => "Mode12Mb",
            PhyMode::Mode18Mb => "Mode18Mb",
            PhyMode::Mode24Mb => "Mode24Mb",
            PhyMode::Mode36Mb => "Mode36Mb",
            PhyMode::Mode48Mb => "Mode48Mb",
            PhyMode::Mode54Mb => "Mode54Mb",
            PhyMode::Unknown => "Unknown",
        }
    }

    /// Position in [`PhyMode::ALL`], `None` for `Unknown`.
    pub fn index(self) -> Option<usize> {
        PhyMode::ALL.iter().position(|m| *m == self)
    }

    /// Bit rate in bit/s.
    pub fn rate(self) -> Option<f64> {
        match self {
            PhyMode::Mode1Mb => Some(1e6),
            PhyMode::Mode2Mb => Some(2e6),
            PhyMode::Mode5_5Mb => Some(5.5e6),
            PhyMode::Mode11Mb => Some(11e6),
            PhyMode::Mode6Mb => Some(6e6),
            PhyMode::Mode9Mb => Some(9e6),
            PhyMode::Mode12Mb => Some(12e6),
            PhyMode::Mode18Mb => Some(18e6),
            PhyMode::Mode24Mb => Some(24e6),
            PhyMode::Mode36Mb => Some(36e6),
            PhyMode::Mode48Mb => Some(48e6),
            PhyMode::Mode54Mb => Some(54e6),
            PhyMode::Unknown => None,
        }
    }

    pub fn is_dsss(self) -> bool {
        matches!(
            self,
            PhyMode::Mode1Mb | PhyMode::Mode2Mb | PhyMode::Mode5_5Mb | PhyMode::Mode11Mb
        )
    }

    pub fn is_ofdm(self) -> bool {
        self.ofdm_bits_per_symbol().is_some()
    }

    /// Data bits carried by one OFDM symbol.
    pub fn ofdm_bits_per_symbol(self) -> Option<f64> {
        match self {
            PhyMode::Mode6Mb => Some(24.0),
            PhyMode::Mode9Mb => Some(36.0),
            PhyMode::Mode12Mb => Some(48.0),
            PhyMode::Mode18Mb => Some(72.0),
            PhyMode::Mode24Mb => Some(96.0),
            PhyMode::Mode36Mb => Some(144.0),
            PhyMode::Mode48Mb => Some(192.0),
            PhyMode::Mode54Mb => Some(216.0),
            _ => None,
        }
    }

    pub fn phy_header_duration(self, short_preamble: bool) -> Result<f64, PhyModeError> {
        if self.is_dsss() {
            Ok(if short_preamble {
                SHORT_PREAMBLE_DURATION
            } else {
                LONG_PREAMBLE_DURATION
            })
        } else if self.is_ofdm() {
            Ok(OFDM_PREAMBLE_DURATION)
        } else {
            Err(PhyModeError::NoTiming)
        }
    }

    /// Airtime in seconds of a `bytes`-long PSDU sent in this mode.
    pub fn txtime(self, bytes: u32, short_preamble: bool) -> Result<f64, PhyModeError> {
        let header = self.phy_header_duration(short_preamble)?;
        let bits = 8.0 * f64::from(bytes);
        match (self.ofdm_bits_per_symbol(), self.rate()) {
            (Some(nbits), _) => {
                Ok(header + ((OFDM_SERVICE_TAIL_BITS + bits) / nbits).ceil() * OFDM_SYMBOL_DURATION)
            }
            (None, Some(rate)) => Ok(header + bits / rate),
            (None, None) => Err(PhyModeError::NoTiming),
        }
    }
}

impl fmt::Display for PhyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for PhyMode {
    type Err = PhyModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PhyMode::ALL
            .iter()
            .copied()
            .find(|m| m.name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| PhyModeError::Unrecognized(s.to_string()))
    }
}

impl TryFrom<String> for PhyMode {
    type Error = PhyModeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PhyMode> for String {
    fn from(mode: PhyMode) -> Self {
        mode.name().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_names_case_insensitively() {
        assert_eq!("mode5_5mb".parse::<PhyMode>().unwrap(), PhyMode::Mode5_5Mb);
        assert_eq!("Mode54Mb".parse::<PhyMode>().unwrap(), PhyMode::Mode54Mb);
        assert!(matches!(
            "Mode3Mb".parse::<PhyMode>(),
            Err(PhyModeError::Unrecognized(_))
        ));
        assert!("Unknown".parse::<PhyMode>().is_err());
    }

    #[test]
    fn dsss_airtime() {
        // 14-byte ACK at 1Mb/s with long preamble: 192us + 112us
        let t = PhyMode::Mode1Mb.txtime(14, false).unwrap();
        assert!((t - 304e-6).abs() < 1e-12);
        let t = PhyMode::Mode11Mb.txtime(1100, true).unwrap();
        assert!((t - (96e-6 + 8800.0 / 11e6)).abs() < 1e-12);
    }

    #[test]
    fn ofdm_airtime_rounds_up_to_whole_symbols() {
        // (22 + 112) / 24 = 5.58 -> 6 symbols
        let t = PhyMode::Mode6Mb.txtime(14, false).unwrap();
        assert!((t - (26e-6 + 6.0 * 4e-6)).abs() < 1e-12);
        // preamble flag has no effect on OFDM
        assert_eq!(
            PhyMode::Mode54Mb.txtime(1500, true).unwrap(),
            PhyMode::Mode54Mb.txtime(1500, false).unwrap()
        );
    }

    #[test]
    fn unknown_mode_has_no_timing() {
        assert_eq!(PhyMode::Unknown.txtime(100, false), Err(PhyModeError::NoTiming));
        assert_eq!(PhyMode::Unknown.index(), None);
        assert_eq!(PhyMode::Mode11Mb.index(), Some(3));
    }
}
