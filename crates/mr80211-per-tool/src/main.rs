use anyhow::{Context, Result, anyhow, bail};
use clap::Parser;
use mr80211_abstract::PhyMode;
use mr80211_core::PerTable;
use std::fs;
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about = "Query packet error rate calibration tables")]
struct Args {
    /// Calibration file with `<mode> <len> <snr> <per>` lines.
    #[arg(long)]
    table: PathBuf,

    /// Print the SNR needed for PER 0.0..0.9 at the reference lengths.
    #[arg(long, default_value_t = false)]
    dump: bool,

    /// Interpolated PER of a frame.
    #[arg(long, num_args = 3, value_names = ["MODE", "SNR", "LEN"])]
    per: Option<Vec<String>>,

    /// Interpolated SNR at which a frame sees the given PER.
    #[arg(long, num_args = 3, value_names = ["MODE", "PER", "LEN"])]
    snr: Option<Vec<String>>,

    /// Log the bracketing points of every lookup.
    #[arg(long, default_value_t = 0)]
    debug_level: u8,
}

/// `MODE VALUE LEN` as given on the command line.
fn parse_query(args: &[String]) -> Result<(PhyMode, f64, u32)> {
    let [mode, value, len] = args else {
        bail!("expected MODE VALUE LEN, got {} arguments", args.len());
    };
    let mode: PhyMode = mode.parse()?;
    let value: f64 = value
        .parse()
        .map_err(|_| anyhow!("`{}` is not a number", value))?;
    let len: u32 = len
        .parse()
        .map_err(|_| anyhow!("`{}` is not a frame length", len))?;
    Ok((mode, value, len))
}

fn main() -> Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt::init();
    info!("mr80211-per-tool starting...");

    let text = fs::read_to_string(&args.table)
        .with_context(|| format!("Failed to read PER file {}", args.table.display()))?;
    let mut table = PerTable::new();
    table.set_debug_level(args.debug_level);
    let n = table
        .load_from_str(&text)
        .with_context(|| format!("Failed to parse PER file {}", args.table.display()))?;
    info!("Loaded {} entries from {}", n, args.table.display());

    if let Some(query) = &args.per {
        let (mode, snr, len) = parse_query(query)?;
        let per = table.get_per(mode, snr, len)?;
        println!("{mode} len={len} snr={snr} -> per={per}");
    }

    if let Some(query) = &args.snr {
        let (mode, per, len) = parse_query(query)?;
        let snr = table.get_snr(mode, per, len)?;
        println!("{mode} len={len} per={per} -> snr={snr}");
    }

    if args.dump {
        for sample in table.print_data() {
            println!("{sample}");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parses_queries() {
        let (mode, value, len) = parse_query(&strings(&["mode11mb", "7.5", "1024"])).unwrap();
        assert_eq!(mode, PhyMode::Mode11Mb);
        assert_eq!(value, 7.5);
        assert_eq!(len, 1024);
    }

    #[test]
    fn rejects_bad_queries() {
        assert!(parse_query(&strings(&["Mode3Mb", "1", "2"])).is_err());
        assert!(parse_query(&strings(&["Mode1Mb", "x", "2"])).is_err());
        assert!(parse_query(&strings(&["Mode1Mb", "1", "-2"])).is_err());
    }

    #[test]
    fn cli_accepts_three_value_queries() {
        let args = Args::try_parse_from([
            "mr80211-per-tool",
            "--table",
            "t.per",
            "--per",
            "Mode1Mb",
            "4.0",
            "1024",
            "--dump",
        ])
        .unwrap();
        assert_eq!(args.per.unwrap().len(), 3);
        assert!(args.dump);
        assert!(args.snr.is_none());
    }
}
