//! Bootstrap of closed-trade PnL into a terminal-equity distribution.
//!
//! Paths are generated in fixed-size chunks, each with its own seed derived
//! from the base seed, so the result does not depend on how many threads
//! share the work.

use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::logging::{log, obj, v_num, Domain, Level};

const CHUNK: usize = 256;

type Chunk = (usize, Vec<f64>);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonteCarloReport {
    pub paths: usize,
    pub trades_per_path: usize,
    pub initial_capital: f64,
    pub p5: f64,
    pub p50: f64,
    pub p95: f64,
    pub mean: f64,
    /// Share of paths ending above the initial capital.
    pub robustness: f64,
}

fn chunk_seed(seed: u64, chunk: usize) -> u64 {
    seed ^ (chunk as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15)
}

fn run_chunk(pnls: &[f64], initial: f64, seed: u64, chunk: usize, count: usize) -> Vec<f64> {
    let mut rng = StdRng::seed_from_u64(chunk_seed(seed, chunk));
    (0..count)
        .map(|_| initial + (0..pnls.len()).map(|_| pnls[rng.gen_range(0..pnls.len())]).sum::<f64>())
        .collect()
}

/// Nearest-rank percentile of sorted data.
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = ((p / 100.0) * (sorted.len() - 1) as f64).round() as usize;
    sorted[idx.min(sorted.len() - 1)]
}

/// A panicked worker fails the bootstrap; its paths are never dropped
/// silently.
fn gather(joined: Vec<std::thread::Result<Vec<Chunk>>>) -> EngineResult<Vec<Chunk>> {
    let mut out = Vec::new();
    for r in joined {
        match r {
            Ok(chunks) => out.extend(chunks),
            Err(panic) => {
                let msg = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "panic".to_string());
                return Err(EngineError::Internal(format!("monte carlo worker panicked: {msg}")));
            }
        }
    }
    Ok(out)
}

pub fn bootstrap(pnls: &[f64], initial_capital: f64, paths: usize, seed: u64, workers: usize) -> EngineResult<MonteCarloReport> {
    if pnls.is_empty() || paths == 0 {
        return Ok(MonteCarloReport {
            paths: 0,
            trades_per_path: pnls.len(),
            initial_capital,
            p5: initial_capital,
            p50: initial_capital,
            p95: initial_capital,
            mean: initial_capital,
            robustness: 0.0,
        });
    }

    let chunks = paths.div_ceil(CHUNK);
    let workers = workers.clamp(1, chunks);
    let mut per_chunk = std::thread::scope(|s| {
        let handles: Vec<_> = (0..workers)
            .map(|w| {
                s.spawn(move || {
                    (w..chunks)
                        .step_by(workers)
                        .map(|c| {
                            let count = CHUNK.min(paths - c * CHUNK);
                            (c, run_chunk(pnls, initial_capital, seed, c, count))
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        gather(handles.into_iter().map(|h| h.join()).collect())
    })?;
    per_chunk.sort_by_key(|(c, _)| *c);
    let mut terminal: Vec<f64> = per_chunk.into_iter().flat_map(|(_, v)| v).collect();

    let n = terminal.len();
    let positive = terminal.iter().filter(|e| **e > initial_capital).count();
    let mean = terminal.iter().sum::<f64>() / n.max(1) as f64;
    terminal.sort_by(|a, b| a.total_cmp(b));

    let report = MonteCarloReport {
        paths: n,
        trades_per_path: pnls.len(),
        initial_capital,
        p5: percentile(&terminal, 5.0),
        p50: percentile(&terminal, 50.0),
        p95: percentile(&terminal, 95.0),
        mean,
        robustness: positive as f64 / n.max(1) as f64,
    };
    log(
        Level::Info,
        Domain::Validation,
        "monte_carlo",
        obj(&[
            ("paths", v_num(n as f64)),
            ("p5", v_num(report.p5)),
            ("p50", v_num(report.p50)),
            ("p95", v_num(report.p95)),
            ("robustness", v_num(report.robustness)),
        ]),
    );
    Ok(report)
}
