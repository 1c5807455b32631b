pub mod config;
pub mod frame;
pub mod interface;
pub mod phy_mode;
pub mod scenario;

pub use config::{ArfConfig, MacConfig, MacMib, PhyMib, RateAdaptation, SimConfig};
pub use frame::{
    ACK_LEN, CTS_LEN, FrameControl, FrameSubtype, FrameType, MAC_HDR_LEN, MacAddr, MacFrame,
    RTS_LEN, RxInfo,
};
pub use interface::{MacContext, TimerKind, TxFailReason};
pub use phy_mode::{PhyMode, PhyModeError};
pub use scenario::{
    PerEntry, SimConfigOverride, StationSpec, TestAction, TestAssertion, TestScenario,
};
