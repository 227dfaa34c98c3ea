//! Run one backtest over a CSV file and print the report as JSON.
//!
//! usage: backtest <bars.csv> [strategy.json]

use std::path::Path;

use anyhow::{anyhow, Context, Result};

use replayfx::bus::CancelToken;
use replayfx::config::{env_flag, env_or, EngineConfig};
use replayfx::data::CsvDir;
use replayfx::engine::{run_backtest, BacktestRequest, EngineSettings};
use replayfx::logging::flush;
use replayfx::strategy::StrategyConfig;

fn load_strategy(path: Option<String>) -> Result<StrategyConfig> {
    let Some(path) = path else {
        return Ok(StrategyConfig::default());
    };
    let text = std::fs::read_to_string(&path).with_context(|| format!("reading {path}"))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {path}"))
}

fn main() -> Result<()> {
    let mut args = std::env::args().skip(1);
    let csv = args.next().unwrap_or_else(|| "data.csv".to_string());
    let path = Path::new(&csv);
    let symbol = path
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| anyhow!("cannot derive a symbol from {csv}"))?
        .to_string();
    let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
    let engine = EngineConfig::from_env();
    let source = CsvDir::new(dir, engine.bar_interval_ms);

    if env_flag("VALIDATE_DATA", false) {
        let m = source.manifest(&symbol)?;
        eprintln!("data_quality rows={} bad_rows={} gaps={} sha256={}", m.row_count, m.bad_rows, m.gaps.len(), m.hash_sha256);
        if !m.warnings.is_empty() {
            eprintln!("data_warnings: {:?}", m.warnings);
        }
    }

    let mut req = BacktestRequest::new(load_strategy(args.next())?);
    req.symbols = vec![symbol];
    req.initial_capital = env_or("INITIAL_CAPITAL", req.initial_capital);

    let settings = EngineSettings::from_env();
    let report = run_backtest("cli", &req, &source, &settings, &CancelToken::new(), |s| s)?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    flush();
    Ok(())
}
