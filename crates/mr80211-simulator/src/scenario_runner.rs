use anyhow::{Context, anyhow, bail};
use mr80211_abstract::{SimConfig, TestAction, TestAssertion, TestScenario};
use mr80211_core::{CounterId, PerTable};
use std::fs;
use std::path::Path;
use std::rc::Rc;
use tracing::info;

use crate::engine::Simulator;

/// Read a scenario file, run it and check its assertions. The finished
/// simulator is returned so the caller can export a report.
pub fn run_scenario(scenario_path: &Path) -> anyhow::Result<Simulator> {
    let content = fs::read_to_string(scenario_path)
        .with_context(|| format!("Failed to read scenario file {}", scenario_path.display()))?;
    let base_dir = scenario_path.parent().unwrap_or(Path::new("."));
    run_scenario_str(&content, base_dir)
}

/// Same as [`run_scenario`] for an in-memory scenario. `per_file` is
/// resolved against `base_dir`.
pub fn run_scenario_str(content: &str, base_dir: &Path) -> anyhow::Result<Simulator> {
    let scenario: TestScenario = toml::from_str(content).context("Failed to parse scenario")?;

    info!("Running Scenario: {}", scenario.name);
    if !scenario.description.is_empty() {
        info!("Description: {}", scenario.description);
    }

    let mut sim = build_simulator(&scenario, base_dir)?;

    let max_duration = scenario.assertions.iter().find_map(|a| match a {
        TestAssertion::MaxDuration { seconds } => Some(*seconds),
        _ => None,
    });

    // Run loop
    while let Some(t) = sim.peek_next_event_time() {
        if t > sim.config().duration {
            break;
        }
        sim.step()?;
        if let Some(max) = max_duration {
            if sim.current_time() > max {
                return Err(anyhow!("Test timed out after {} s", max));
            }
        }
    }

    check_assertions(&sim, &scenario.assertions)?;
    info!("Test Scenario Passed!");
    Ok(sim)
}

/// Build the configuration, calibration table and traffic of a scenario.
pub fn build_simulator(scenario: &TestScenario, base_dir: &Path) -> anyhow::Result<Simulator> {
    if scenario.stations.is_empty() {
        bail!("scenario `{}` has no stations", scenario.name);
    }

    let mut config = SimConfig::default();
    scenario.config.apply_to(&mut config);

    let mut table = PerTable::new();
    table.set_debug_level(config.mac.debug_level);
    for entry in &scenario.per {
        table
            .set_per(entry.mode, entry.len, entry.snr, entry.per)
            .with_context(|| format!("invalid PER entry {entry:?}"))?;
    }
    if let Some(file) = &scenario.per_file {
        let path = base_dir.join(file);
        let text = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read PER file {}", path.display()))?;
        let n = table
            .load_from_str(&text)
            .with_context(|| format!("Failed to parse PER file {}", path.display()))?;
        info!("Loaded {} PER entries from {}", n, path.display());
    }
    let table = (!scenario.per.is_empty() || scenario.per_file.is_some()).then(|| Rc::new(table));

    let mut sim = Simulator::new(config, &scenario.stations, table)?;

    for action in &scenario.actions {
        match action {
            TestAction::Send {
                time,
                src,
                dst,
                size,
                count,
                interval,
            } => {
                for i in 0..*count {
                    let at = time + f64::from(i) * interval;
                    sim.schedule_send(at, *src as usize, dst.map(|d| d as usize), *size)?;
                }
            }
            TestAction::ResetIdleSlots { time } => sim.schedule_reset_idle_slots(*time),
        }
    }
    Ok(sim)
}

fn check_range(what: &str, value: u64, min: u64, max: Option<u64>) -> anyhow::Result<()> {
    if value < min {
        return Err(anyhow!("Assertion Failed: {} is {}, expected min {}", what, value, min));
    }
    if let Some(max) = max {
        if value > max {
            return Err(anyhow!("Assertion Failed: {} is {}, expected max {}", what, value, max));
        }
    }
    Ok(())
}

pub fn check_assertions(sim: &Simulator, assertions: &[TestAssertion]) -> anyhow::Result<()> {
    let station = |id: u32| {
        sim.stations
            .get(id as usize)
            .ok_or_else(|| anyhow!("Assertion refers to unknown station {}", id))
    };

    for assertion in assertions {
        match assertion {
            TestAssertion::Delivered { dst, min, max } => {
                let s = station(*dst)?;
                check_range(&format!("delivered count of station {dst}"), s.delivered, *min, *max)?;
            }
            TestAssertion::Counter {
                station: id,
                name,
                min,
                max,
            } => {
                let counter: CounterId = name.parse()?;
                let value = station(*id)?.mac.counters().get(counter);
                check_range(&format!("{} of station {}", counter, id), value, *min, *max)?;
            }
            TestAssertion::TxFailed { station: id, min, max } => {
                let s = station(*id)?;
                check_range(&format!("failed transmissions of station {id}"), s.tx_failed, *min, *max)?;
            }
            TestAssertion::MaxDuration { .. } => {} // Already checked
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mr80211_abstract::PhyMode;

    const TWO_STATIONS: &str = r#"
        name = "two stations"
        [config]
        seed = 9
        duration = 2.0

        [[stations]]
        x = 0.0
        y = 0.0
        [[stations]]
        x = 20.0
        y = 0.0

        [[actions]]
        type = "send"
        time = 0.0
        src = 0
        dst = 1
        size = 512
        count = 4
        interval = 0.01
    "#;

    fn with_assertions(extra: &str) -> String {
        format!("{TWO_STATIONS}\n{extra}")
    }

    #[test]
    fn passing_scenario_returns_the_simulator() {
        let text = with_assertions(
            r#"
            [[assertions]]
            type = "delivered"
            dst = 1
            min = 4
            max = 4

            [[assertions]]
            type = "counter"
            station = 0
            name = "MPDUTxSuccessful"
            min = 4

            [[assertions]]
            type = "tx_failed"
            station = 0
            min = 0
            max = 0

            [[assertions]]
            type = "max_duration"
            seconds = 1.0
            "#,
        );
        let sim = run_scenario_str(&text, Path::new(".")).unwrap();
        assert_eq!(sim.stations[1].delivered, 4);
    }

    #[test]
    fn failed_assertion_is_reported() {
        let text = with_assertions(
            r#"
            [[assertions]]
            type = "delivered"
            dst = 1
            min = 5
            "#,
        );
        let err = run_scenario_str(&text, Path::new(".")).unwrap_err();
        assert!(err.to_string().contains("Assertion Failed"));
    }

    #[test]
    fn unknown_counter_names_are_rejected() {
        let text = with_assertions(
            r#"
            [[assertions]]
            type = "counter"
            station = 0
            name = "NoSuchCounter"
            min = 0
            "#,
        );
        assert!(run_scenario_str(&text, Path::new(".")).is_err());
    }

    #[test]
    fn out_of_range_station_in_action_is_rejected() {
        let text = TWO_STATIONS.replace("dst = 1", "dst = 7");
        assert!(run_scenario_str(&text, Path::new(".")).is_err());
    }

    #[test]
    fn max_duration_exceeded_times_out() {
        let text = with_assertions(
            r#"
            [[assertions]]
            type = "max_duration"
            seconds = 0.015
            "#,
        );
        let err = run_scenario_str(&text, Path::new(".")).unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[test]
    fn missing_per_file_is_an_error() {
        let text = TWO_STATIONS.replace("[config]", "per_file = \"does-not-exist.per\"\n[config]");
        let err = run_scenario_str(&text, Path::new("/nonexistent")).unwrap_err();
        assert!(format!("{err:#}").contains("PER file"));
    }

    #[test]
    fn bundled_scenarios_pass() {
        let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../scenarios");
        for name in ["hidden_terminal.toml", "infrastructure.toml", "rate_adaptation.toml"] {
            if let Err(e) = run_scenario(&dir.join(name)) {
                panic!("{name}: {e:#}");
            }
        }
    }

    #[test]
    fn rate_adaptation_is_selected_by_the_scenario() {
        let text = TWO_STATIONS.replace(
            "duration = 2.0",
            "duration = 2.0\ndata_mode = \"Mode1Mb\"\n[config.rate_adaptation]\nkind = \"arf\"\nsucc_to_incr = 2",
        );
        let sim = run_scenario_str(&text, Path::new(".")).unwrap();
        assert_eq!(sim.stations[1].delivered, 4);
        // the step earned by the last exchange waits for the next frame
        assert_eq!(sim.stations[0].mac.config().data_mode, PhyMode::Mode2Mb);
    }

    #[test]
    fn inline_per_entries_enable_the_error_model() {
        let text = TWO_STATIONS.replace(
            "[[actions]]",
            r#"
            [[per]]
            mode = "Mode11Mb"
            len = 1024
            snr = 10.0
            per = 0.0

            [[per]]
            mode = "Mode1Mb"
            len = 1024
            snr = 10.0
            per = 0.0

            [[actions]]"#,
        );
        let sim = run_scenario_str(&text, Path::new(".")).unwrap();
        assert_eq!(sim.stations[1].delivered, 4);
        assert!(!sim.peer_stats_dump().is_empty());
    }
}
