//! Backtest plus walk-forward and Monte Carlo checks. Exits 2 when the
//! strategy is not viable.
//!
//! usage: validate <bars.csv> [strategy.json]

use std::path::Path;
use std::process::ExitCode;

use anyhow::{anyhow, Context, Result};

use replayfx::bus::CancelToken;
use replayfx::config::{env_or, EngineConfig};
use replayfx::data::CsvDir;
use replayfx::engine::{run_backtest, BacktestRequest, EngineSettings};
use replayfx::logging::flush;
use replayfx::strategy::StrategyConfig;
use replayfx::validation::ValidationConfig;

fn run() -> Result<bool> {
    let mut args = std::env::args().skip(1);
    let csv = args.next().ok_or_else(|| anyhow!("usage: validate <bars.csv> [strategy.json]"))?;
    let path = Path::new(&csv);
    let symbol = path
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| anyhow!("cannot derive a symbol from {csv}"))?
        .to_string();
    let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
    let source = CsvDir::new(dir, EngineConfig::from_env().bar_interval_ms);

    let strategy: StrategyConfig = match args.next() {
        Some(p) => serde_json::from_str(&std::fs::read_to_string(&p).with_context(|| format!("reading {p}"))?)
            .with_context(|| format!("parsing {p}"))?,
        None => StrategyConfig::default(),
    };
    let mut req = BacktestRequest::new(strategy);
    req.symbols = vec![symbol];
    req.initial_capital = env_or("INITIAL_CAPITAL", req.initial_capital);
    req.validation = Some(ValidationConfig::from_env());

    let report = run_backtest("validate", &req, &source, &EngineSettings::from_env(), &CancelToken::new(), |s| s)?;
    let verdict = report.validation.ok_or_else(|| anyhow!("validation did not run"))?;
    println!("{}", serde_json::to_string_pretty(&verdict)?);
    Ok(verdict.viable)
}

fn main() -> ExitCode {
    let code = match run() {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(2),
        Err(e) => {
            eprintln!("validate failed: {e:#}");
            ExitCode::FAILURE
        }
    };
    flush();
    code
}
