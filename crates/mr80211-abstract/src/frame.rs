use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::phy_mode::PhyMode;

pub const ETHER_FCS_LEN: u32 = 4;
/// MAC header of a data frame including the FCS.
pub const MAC_HDR_LEN: u32 = 30 + ETHER_FCS_LEN;
pub const RTS_LEN: u32 = 20;
pub const CTS_LEN: u32 = 14;
pub const ACK_LEN: u32 = 14;

/// Station address. Stations are numbered from zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MacAddr(pub u32);

impl MacAddr {
    pub const BROADCAST: MacAddr = MacAddr(u32::MAX);

    pub fn is_broadcast(self) -> bool {
        self == MacAddr::BROADCAST
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_broadcast() {
            f.write_str("bcast")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FrameType {
    Management,
    Control,
    Data,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FrameSubtype {
    Beacon,
    Rts,
    Cts,
    Ack,
    Data,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameControl {
    pub frame_type: FrameType,
    pub subtype: FrameSubtype,
    pub retry: bool,
}

impl FrameControl {
    pub fn new(frame_type: FrameType, subtype: FrameSubtype) -> Self {
        Self {
            frame_type,
            subtype,
            retry: false,
        }
    }
}

/// Reception annotations filled in by the PHY.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RxInfo {
    /// Received power in W.
    pub power: f64,
    /// Set when the frame cannot be decoded regardless of SINR
    /// (e.g. we started transmitting while it was on the air).
    pub error: bool,
}

#[derive(Debug, Clone)]
pub struct MacFrame {
    /// Identifies the upper-layer packet this frame carries; 0 for MAC-generated frames.
    pub uid: u64,
    pub fc: FrameControl,
    /// Duration/ID field in microseconds.
    pub duration: u16,
    pub ra: MacAddr,
    pub ta: MacAddr,
    pub addr3: MacAddr,
    pub seqno: u16,
    /// Size in bytes. Includes the MAC header once the MAC has framed it.
    pub size: u32,
    pub mode: PhyMode,
    /// Airtime in seconds for `size` bytes at `mode`.
    pub txtime: f64,
    pub payload: Bytes,
    pub rx: RxInfo,
}

impl MacFrame {
    fn with_control(fc: FrameControl, ra: MacAddr, ta: MacAddr, size: u32) -> Self {
        Self {
            uid: 0,
            fc,
            duration: 0,
            ra,
            ta,
            addr3: MacAddr::BROADCAST,
            seqno: 0,
            size,
            mode: PhyMode::Unknown,
            txtime: 0.0,
            payload: Bytes::new(),
            rx: RxInfo::default(),
        }
    }

    /// An upper-layer packet of `size` bytes handed to the MAC for `dst`.
    pub fn data(src: MacAddr, dst: MacAddr, size: u32, payload: Bytes) -> Self {
        let mut frame = Self::with_control(
            FrameControl::new(FrameType::Data, FrameSubtype::Data),
            dst,
            src,
            size,
        );
        frame.addr3 = dst;
        frame.payload = payload;
        frame
    }

    pub fn rts(ra: MacAddr, ta: MacAddr) -> Self {
        Self::with_control(
            FrameControl::new(FrameType::Control, FrameSubtype::Rts),
            ra,
            ta,
            RTS_LEN,
        )
    }

    pub fn cts(ra: MacAddr, ta: MacAddr) -> Self {
        Self::with_control(
            FrameControl::new(FrameType::Control, FrameSubtype::Cts),
            ra,
            ta,
            CTS_LEN,
        )
    }

    pub fn ack(ra: MacAddr, ta: MacAddr) -> Self {
        Self::with_control(
            FrameControl::new(FrameType::Control, FrameSubtype::Ack),
            ra,
            ta,
            ACK_LEN,
        )
    }

    pub fn is_broadcast(&self) -> bool {
        self.ra.is_broadcast()
    }

    pub fn kind(&self) -> &'static str {
        match self.fc.subtype {
            FrameSubtype::Beacon => "BEACON",
            FrameSubtype::Rts => "RTS",
            FrameSubtype::Cts => "CTS",
            FrameSubtype::Ack => "ACK",
            FrameSubtype::Data => "DATA",
        }
    }
}

impl fmt::Display for MacFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}->{} size={} dur={}us mode={}",
            self.kind(),
            self.ta,
            self.ra,
            self.size,
            self.duration,
            self.mode
        )?;
        if self.fc.frame_type == FrameType::Data {
            write!(f, " seq={}", self.seqno)?;
        }
        if self.fc.retry {
            f.write_str(" retry")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_frames_have_fixed_lengths() {
        let a = MacAddr(1);
        let b = MacAddr(2);
        assert_eq!(MacFrame::rts(a, b).size, RTS_LEN);
        assert_eq!(MacFrame::cts(a, b).size, CTS_LEN);
        assert_eq!(MacFrame::ack(a, b).size, ACK_LEN);
        assert_eq!(MAC_HDR_LEN, 34);
    }

    #[test]
    fn data_frame_addressing() {
        let f = MacFrame::data(MacAddr(3), MacAddr::BROADCAST, 100, Bytes::from_static(b"hi"));
        assert!(f.is_broadcast());
        assert_eq!(f.ta, MacAddr(3));
        assert_eq!(f.fc.frame_type, FrameType::Data);
        assert_eq!(f.to_string(), "DATA 3->bcast size=100 dur=0us mode=Unknown seq=0");
    }
}
