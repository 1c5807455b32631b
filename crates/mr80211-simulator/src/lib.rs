pub mod engine;
pub mod scenario_runner;
pub mod trace;

pub use engine::{LinkEventSummary, SPEED_OF_LIGHT, Simulator, Station, StationId};
pub use scenario_runner::{build_simulator, check_assertions, run_scenario, run_scenario_str};
pub use trace::{Delivery, SimulationReport, StationReport, TxFailure};
