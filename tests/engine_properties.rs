//! Whole-run properties: same inputs give the same outputs, the books
//! always balance, the kill switch is final, and the event log is enough
//! to rebuild the portfolio. An interrupted run continues from its
//! checkpoint as if it had never stopped.

mod common;

use std::sync::{Arc, Mutex};

use replayfx::bus::{BusConfig, CancelToken};
use replayfx::data::{Checkpoint, TimeRange};
use replayfx::engine::{run_backtest, simulate, BacktestRequest, EngineSettings, ExecModel, RunObserver};
use replayfx::error::EngineError;
use replayfx::events::{AlertKind, Envelope, Event};
use replayfx::portfolio::Portfolio;
use replayfx::risk::RiskLimits;
use replayfx::strategy::StrategyConfig;

use common::{cache, trending_walk, with_jump};

fn journaled() -> EngineSettings {
    EngineSettings { bus: BusConfig { journal: true, ..BusConfig::default() }, ..EngineSettings::default() }
}

fn request() -> BacktestRequest {
    let mut req = BacktestRequest::new(StrategyConfig::default());
    req.symbols = vec!["BTC".to_string()];
    req
}

#[test]
fn identical_inputs_give_identical_reports() {
    let bars = trending_walk(600, 7, 0.004, 0.004, 60);
    let source = cache("BTC", bars);
    let req = request();
    let settings = EngineSettings::default();

    let a = run_backtest("a", &req, &source, &settings, &CancelToken::new(), |s| s).unwrap();
    let b = run_backtest("b", &req, &source, &settings, &CancelToken::new(), |s| s).unwrap();

    assert!(a.counters.fills > 0, "walk should trade");
    assert_eq!(a.trade_log_sha256, b.trade_log_sha256);
    assert_eq!(a.equity_sha256, b.equity_sha256);
    assert_eq!(a.trades, b.trades);
    assert_eq!(a.events, b.events);
    assert_eq!(a.counters, b.counters);
    assert_eq!(a.data_fingerprints, b.data_fingerprints);
}

#[test]
fn different_data_changes_the_fingerprints() {
    let settings = EngineSettings::default();
    let req = request();
    let a = run_backtest("a", &req, &cache("BTC", trending_walk(400, 1, 0.004, 0.004, 50)), &settings, &CancelToken::new(), |s| s)
        .unwrap();
    let b = run_backtest("b", &req, &cache("BTC", trending_walk(400, 2, 0.004, 0.004, 50)), &settings, &CancelToken::new(), |s| s)
        .unwrap();
    assert_ne!(a.data_fingerprints["BTC"], b.data_fingerprints["BTC"]);
    assert_ne!(a.equity_sha256, b.equity_sha256);
}

#[test]
fn books_balance_after_every_event() {
    let source = cache("BTC", trending_walk(500, 11, 0.004, 0.005, 40));
    let mut req = request();
    req.execution = ExecModel { fee_rate: Some(0.001), half_spread: Some(0.0005), ..ExecModel::default() };
    let settings = journaled();
    let sim = simulate(&req.strategy, &req, &req.symbols, TimeRange::default(), &source, &settings, &CancelToken::new(), None)
        .unwrap();

    let mut p = Portfolio::new(req.initial_capital);
    let mut fees = 0.0;
    for env in &sim.journal {
        match &env.event {
            Event::Tick(t) => p.mark(&t.symbol, t.price),
            Event::Fill(f) => {
                p.apply_fill(env.ts, f);
                if f.is_executed() {
                    assert!(f.fee >= 0.0);
                    fees += f.fee;
                }
            }
            _ => continue,
        }
        assert!(p.conservation_error() < 1e-6, "seq {} error {}", env.seq, p.conservation_error());
    }
    assert!(sim.session.portfolio.conservation_error() < 1e-6);
    assert!((sim.session.portfolio.snapshot().fees - fees).abs() < 1e-9);
}

#[test]
fn journal_replay_rebuilds_the_portfolio() {
    let source = cache("BTC", trending_walk(500, 23, 0.004, 0.004, 50));
    let mut req = request();
    req.close_at_end = false;
    let settings = journaled();
    let sim = simulate(&req.strategy, &req, &req.symbols, TimeRange::default(), &source, &settings, &CancelToken::new(), None)
        .unwrap();
    assert!(!sim.journal.is_empty());

    let live = &sim.session.portfolio;
    let replayed = Portfolio::replay(req.initial_capital, &sim.journal);
    assert!((replayed.equity() - live.equity()).abs() < 1e-9);
    assert_eq!(replayed.trades, live.trades);
    assert_eq!(replayed.open_positions(), live.open_positions());

    // Replaying twice gives the same answer.
    let again = Portfolio::replay(req.initial_capital, &sim.journal);
    assert_eq!(again.snapshot(), replayed.snapshot());
}

#[test]
fn kill_switch_is_final_for_the_run() {
    // A 30% bar after a calm walk is far beyond six standard deviations.
    let bars = with_jump(trending_walk(400, 5, 0.003, 0.003, 50), 250, 1.3);
    let source = cache("BTC", bars);
    let mut req = request();
    req.risk = Some(RiskLimits { volatility_window: 10, volatility_spike_mult: 6.0, ..RiskLimits::default() });
    let settings = journaled();
    let sim = simulate(&req.strategy, &req, &req.symbols, TimeRange::default(), &source, &settings, &CancelToken::new(), None)
        .unwrap();

    assert!(sim.session.risk.is_killed());
    let kill_seq = sim
        .journal
        .iter()
        .find_map(|e| match &e.event {
            Event::RiskAlert(a) if a.is_kill() => Some(e.seq),
            _ => None,
        })
        .expect("kill alert in journal");

    for env in sim.journal.iter().filter(|e| e.seq > kill_seq) {
        match &env.event {
            Event::Fill(f) if f.is_executed() => assert!(f.reduce_only, "opening fill {} after kill", f.order_id),
            Event::RiskAlert(a) => {
                assert!(!matches!(&a.kind, AlertKind::StateTransition { to, .. } if to != "killed"));
            }
            Event::Signal(_) | Event::Tick(_) | Event::RegimeChange(_) | Event::Fill(_) => {}
            Event::OrderRequest(o) => assert!(o.reduce_only, "opening order {} after kill", o.order_id),
            _ => {}
        }
    }
    // Killed runs are not liquidated at the end.
    let report = run_backtest("k", &req, &source, &EngineSettings::default(), &CancelToken::new(), |s| s).unwrap();
    assert!(report.killed);
    assert_eq!(report.risk_state, "killed");
}

#[test]
fn fail_on_kill_turns_the_run_into_an_error() {
    let bars = with_jump(trending_walk(300, 9, 0.003, 0.003, 50), 200, 0.7);
    let source = cache("BTC", bars);
    let mut req = request();
    req.risk = Some(RiskLimits { volatility_window: 10, volatility_spike_mult: 6.0, ..RiskLimits::default() });
    req.fail_on_kill = true;
    let report = run_backtest("k", &req, &source, &EngineSettings::default(), &CancelToken::new(), |s| s).unwrap();
    // The engine still reports; the job layer decides what a kill means.
    assert!(report.killed);
    let (status, reason) = replayfx::jobs::classify(&Ok(report), req.fail_on_kill);
    assert_eq!(status, replayfx::jobs::JobStatus::FailedRiskViolation);
    assert!(reason.unwrap().contains("volatility_spike:BTC"));
}

/// Collects reported events, and the number reported at each checkpoint.
/// Cancels the run at checkpoint `stop_at` when set.
#[derive(Clone, Default)]
struct Recorder {
    events: Arc<Mutex<Vec<Envelope>>>,
    checkpoints: Arc<Mutex<Vec<(Checkpoint, usize)>>>,
    stop_at: Option<(usize, CancelToken)>,
}

impl RunObserver for Recorder {
    fn on_event(&mut self, env: &Envelope) {
        self.events.lock().unwrap().push(env.clone());
    }

    fn on_checkpoint(&mut self, cp: Checkpoint) {
        let reported = self.events.lock().unwrap().len();
        let mut seen = self.checkpoints.lock().unwrap();
        seen.push((cp, reported));
        if let Some((n, cancel)) = &self.stop_at {
            if seen.len() == *n {
                cancel.cancel();
            }
        }
    }
}

#[test]
fn resumed_run_matches_an_uninterrupted_one() {
    let source = cache("BTC", trending_walk(600, 7, 0.004, 0.004, 60));
    let req = request();
    let settings = EngineSettings::default();

    let whole = Recorder::default();
    let observer = whole.clone();
    let expected = run_backtest("whole", &req, &source, &settings, &CancelToken::new(), |s| s.with_observer(Box::new(observer))).unwrap();
    assert!(expected.counters.fills > 0);

    let cancel = CancelToken::new();
    let first = Recorder { stop_at: Some((2, cancel.clone())), ..Recorder::default() };
    let observer = first.clone();
    let interrupted = run_backtest("r", &req, &source, &settings, &cancel, |s| s.with_observer(Box::new(observer)));
    assert!(matches!(interrupted, Err(EngineError::Cancelled)));
    let (cp, persisted) = *first.checkpoints.lock().unwrap().last().unwrap();
    assert_eq!(cp.seq, 1_000);

    let second = Recorder::default();
    let observer = second.clone();
    let resumed = run_backtest("r", &req, &source, &settings, &CancelToken::new(), |s| {
        s.with_observer(Box::new(observer)).resume_after(cp)
    })
    .unwrap();

    assert_eq!(resumed.trade_log_sha256, expected.trade_log_sha256);
    assert_eq!(resumed.equity_sha256, expected.equity_sha256);
    assert_eq!(resumed.counters, expected.counters);

    // Events up to the checkpoint are reported once, by the first attempt.
    let mut stitched = first.events.lock().unwrap()[..persisted].to_vec();
    stitched.extend(second.events.lock().unwrap().iter().cloned());
    assert_eq!(stitched, *whole.events.lock().unwrap());
    assert!(second.checkpoints.lock().unwrap().iter().all(|(c, _)| c.seq > cp.seq));
}

#[test]
fn resume_refuses_a_checkpoint_from_other_data() {
    let source = cache("BTC", trending_walk(200, 3, 0.004, 0.004, 60));
    let req = request();
    let bogus = Checkpoint { ts: 1, seq: 10 };
    let err = run_backtest("r", &req, &source, &EngineSettings::default(), &CancelToken::new(), |s| s.resume_after(bogus))
        .unwrap_err();
    assert!(matches!(err, EngineError::Data(_)), "{err}");
}
