pub mod error;
pub mod error_model;
pub mod mac;
pub mod mib;
pub mod peerstats;
pub mod per;
pub mod power_profile;
pub mod rate_adapter;
pub mod timers;

pub use error::{ConfigError, LookupError, MacError};
pub use error_model::{ChannelErrorModel, ErrorDecision, PacketOutcome};
pub use mac::{IdleUpdate, MAX_PROPAGATION_DELAY, Mac80211, MacCommand, MacEventHandler, MacState};
pub use mib::{CounterId, MacCounters, RxCounter};
pub use peerstats::{PeerStats, PeerStatsDb, StaticPeerStatsDb};
pub use per::{PerPoint, PerQueryResult, PerRow, PerTable, SnrPer, SnrSample};
pub use power_profile::{PowerProfile, PowerSample, SharedPowerProfile};
pub use rate_adapter::{Arf, RateAdapter};
pub use timers::{BackoffTimer, MacTimer, MacTimers};
