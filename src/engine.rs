//! One deterministic run.
//!
//! A `Session` owns every piece of mutable run state and is the bus
//! context; handlers registered by `wire` are the only code that touches
//! it. Per tick the order is: mark, risk evaluation, matching resting
//! orders, regime, signals, exits. Orders placed on a tick fill no earlier
//! than the next tick of their symbol.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::bus::{BusConfig, CancelToken, EventBus, Outbox, RunOutcome};
use crate::data::{BarSource, Checkpoint, ReplayConfig, Replayer, TimeRange};
use crate::error::{DataError, EngineError, EngineResult, ValidationError};
use crate::events::{Envelope, Event, EventKind, Fill, OrderRequest, OrderType, RiskAlert, Side, SignalUpdate, Tick, Timestamp};
use crate::execution::{ExecConfig, ExecutionSimulator};
use crate::indicators::Atr;
use crate::logging::{log, log_audit, obj, v_num, v_str, Domain, Level};
use crate::metrics::{MetricsConfig, PerformanceMetrics};
use crate::notify::AlertDispatcher;
use crate::portfolio::{EquityPoint, Portfolio, TradeRecord};
use crate::regime::{RegimeClassifier, RegimeConfig};
use crate::risk::{BookView, RiskLimits, RiskManager};
use crate::signals::{AggregatorConfig, SignalEngine};
use crate::sizing::{round_to_lot, Sizer, SizingConfig, SizingInput, TradeStats};
use crate::strategy::{SizingPolicy, SourceSpec, StrategyConfig};
use crate::validation::{self, walk_forward, ValidationConfig, ValidationResult};

const PROGRESS_EVERY: u64 = 1_000;
const CHECKPOINT_EVERY: u64 = 500;
const DEFAULT_ATR_PERIOD: usize = 14;

// =============================================================================
// Settings and requests
// =============================================================================

/// Process-wide component configs; one copy per run.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub bus: BusConfig,
    pub lookahead: usize,
    pub gap_fill_tolerance: u64,
    pub regime: RegimeConfig,
    pub aggregator: AggregatorConfig,
    pub sizing: SizingConfig,
    pub exec: ExecConfig,
    pub risk: RiskLimits,
    pub validation: ValidationConfig,
    pub metrics: MetricsConfig,
    /// Threads a single run may use for Monte Carlo.
    pub workers: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        let replay = ReplayConfig::default();
        Self {
            bus: BusConfig::default(),
            lookahead: replay.lookahead,
            gap_fill_tolerance: replay.gap_fill_tolerance,
            regime: RegimeConfig::default(),
            aggregator: AggregatorConfig::default(),
            sizing: SizingConfig::default(),
            exec: ExecConfig::default(),
            risk: RiskLimits::default(),
            validation: ValidationConfig::default(),
            metrics: MetricsConfig::default(),
            workers: 1,
        }
    }
}

impl EngineSettings {
    pub fn from_env() -> Self {
        let engine = crate::config::EngineConfig::from_env();
        let mut regime = RegimeConfig::from_env();
        if regime.reference_symbol.is_none() {
            regime.reference_symbol = engine.reference_symbol.clone();
        }
        Self {
            bus: BusConfig::from_env(),
            lookahead: engine.lookahead,
            gap_fill_tolerance: engine.gap_fill_tolerance,
            regime,
            aggregator: AggregatorConfig::from_env(),
            sizing: SizingConfig::from_env(),
            exec: ExecConfig::from_env(),
            risk: RiskLimits::from_env(),
            validation: ValidationConfig::from_env(),
            metrics: MetricsConfig::from_env(),
            workers: crate::config::env_or("RUN_WORKERS", 1usize).max(1),
        }
    }
}

/// Fee and slippage overrides carried by a request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecModel {
    pub fee_rate: Option<f64>,
    pub half_spread: Option<f64>,
    pub impact_k: Option<f64>,
    pub max_participation: Option<f64>,
    pub latency_ticks: Option<u32>,
}

impl ExecModel {
    pub fn apply(&self, base: &ExecConfig) -> ExecConfig {
        ExecConfig {
            fee_rate: self.fee_rate.unwrap_or(base.fee_rate),
            half_spread: self.half_spread.unwrap_or(base.half_spread),
            impact_k: self.impact_k.unwrap_or(base.impact_k),
            max_participation: self.max_participation.unwrap_or(base.max_participation),
            latency_ticks: self.latency_ticks.unwrap_or(base.latency_ticks),
            ..base.clone()
        }
    }

    fn validate(&self) -> Result<(), ValidationError> {
        for (name, v) in [
            ("execution.fee_rate", self.fee_rate),
            ("execution.half_spread", self.half_spread),
            ("execution.impact_k", self.impact_k),
        ] {
            if v.map_or(false, |v| !(v.is_finite() && v >= 0.0)) {
                return Err(ValidationError::invalid(name, "must be >= 0"));
            }
        }
        if self.max_participation.map_or(false, |v| v.is_nan() || v <= 0.0) {
            return Err(ValidationError::invalid("execution.max_participation", "must be > 0"));
        }
        Ok(())
    }
}

fn default_capital() -> f64 {
    10_000.0
}

fn default_true() -> bool {
    true
}

/// Everything one backtest needs besides the data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestRequest {
    pub strategy: StrategyConfig,
    /// Empty means every symbol the source has.
    #[serde(default)]
    pub symbols: Vec<String>,
    #[serde(default)]
    pub range: TimeRange,
    #[serde(default = "default_capital")]
    pub initial_capital: f64,
    #[serde(default)]
    pub execution: ExecModel,
    /// Replaces the configured limits for this run.
    #[serde(default)]
    pub risk: Option<RiskLimits>,
    /// Runs walk-forward and Monte Carlo when present.
    #[serde(default)]
    pub validation: Option<ValidationConfig>,
    /// Report a run that ends killed as a risk violation.
    #[serde(default)]
    pub fail_on_kill: bool,
    /// Liquidate open positions at the last price of the data.
    #[serde(default = "default_true")]
    pub close_at_end: bool,
}

impl BacktestRequest {
    pub fn new(strategy: StrategyConfig) -> Self {
        Self {
            strategy,
            symbols: Vec::new(),
            range: TimeRange::default(),
            initial_capital: default_capital(),
            execution: ExecModel::default(),
            risk: None,
            validation: None,
            fail_on_kill: false,
            close_at_end: true,
        }
    }

    /// Synchronous gate: nothing is simulated for an invalid request.
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.strategy.validate()?;
        if !(self.initial_capital.is_finite() && self.initial_capital > 0.0) {
            return Err(ValidationError::invalid("initial_capital", "must be > 0"));
        }
        if let (Some(s), Some(e)) = (self.range.start, self.range.end) {
            if s > e {
                return Err(ValidationError::invalid("range", "start after end"));
            }
        }
        if self.symbols.iter().any(|s| s.trim().is_empty()) {
            return Err(ValidationError::invalid("symbols", "empty symbol"));
        }
        self.execution.validate()?;
        if let Some(limits) = &self.risk {
            limits.validate()?;
        }
        if let Some(v) = &self.validation {
            v.validate()?;
        }
        Ok(())
    }
}

// =============================================================================
// Session
// =============================================================================

/// Receives run events as they are delivered, and progress.
pub trait RunObserver: Send {
    fn on_event(&mut self, _env: &Envelope) {}
    fn on_progress(&mut self, _ticks: u64, _ts: Timestamp) {}
    /// Every event up to `cp` has been handled and passed to `on_event`.
    fn on_checkpoint(&mut self, _cp: Checkpoint) {}
}

pub struct NoopObserver;

impl RunObserver for NoopObserver {}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunCounters {
    pub ticks: u64,
    pub signals: u64,
    pub orders_submitted: u64,
    pub orders_rejected: u64,
    pub fills: u64,
    pub rejected_fills: u64,
    pub regime_changes: u64,
}

/// Where approved orders go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderRoute {
    /// Matched against later ticks by the in-process simulator.
    Simulator,
    /// Queued for an external venue; fills come back as bus events.
    External,
}

pub struct Session {
    pub strategy: StrategyConfig,
    pub portfolio: Portfolio,
    pub risk: RiskManager,
    pub regime: RegimeClassifier,
    pub signals: SignalEngine,
    pub sizer: Sizer,
    pub sim: ExecutionSimulator,
    pub alerts: Vec<RiskAlert>,
    pub counters: RunCounters,
    atr: BTreeMap<String, Atr>,
    atr_period: usize,
    order_seq: u64,
    trade_pnls: Vec<f64>,
    observer: Box<dyn RunObserver>,
    dispatcher: Option<AlertDispatcher>,
    route: OrderRoute,
    outbound: Vec<OrderRequest>,
    /// External orders not yet done: order id to (symbol, signed remaining).
    external: BTreeMap<String, (String, f64)>,
    resume: Option<Checkpoint>,
    /// Rebuilding state from an earlier attempt; nothing leaves the run.
    restoring: bool,
}

impl Session {
    pub fn new(
        strategy: StrategyConfig,
        initial_capital: f64,
        settings: &EngineSettings,
        exec: ExecConfig,
        limits: RiskLimits,
    ) -> Self {
        let atr_period = strategy
            .sources
            .iter()
            .find_map(|s| match s {
                SourceSpec::Momentum { atr_period, .. } => Some(*atr_period),
                _ => None,
            })
            .unwrap_or(DEFAULT_ATR_PERIOD);
        Self {
            portfolio: Portfolio::new(initial_capital),
            risk: RiskManager::new(limits, initial_capital),
            regime: RegimeClassifier::new(settings.regime.clone()),
            signals: SignalEngine::new(strategy.sources.clone(), settings.aggregator.clone()),
            sizer: Sizer::new(settings.sizing.clone(), strategy.sizing.clone()),
            sim: ExecutionSimulator::new(exec),
            alerts: Vec::new(),
            counters: RunCounters::default(),
            atr: BTreeMap::new(),
            atr_period,
            order_seq: 0,
            trade_pnls: Vec::new(),
            observer: Box::new(NoopObserver),
            dispatcher: None,
            route: OrderRoute::Simulator,
            outbound: Vec::new(),
            external: BTreeMap::new(),
            resume: None,
            restoring: false,
            strategy,
        }
    }

    pub fn with_observer(mut self, observer: Box<dyn RunObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_dispatcher(mut self, dispatcher: AlertDispatcher) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    /// Continue an interrupted run. Ticks up to `cp` are handled again to
    /// rebuild state, but their events, alerts and progress are not
    /// reported a second time.
    pub fn resume_after(mut self, cp: Checkpoint) -> Self {
        self.resume = Some(cp);
        self
    }

    pub fn with_route(mut self, route: OrderRoute) -> Self {
        self.route = route;
        self
    }

    /// Approved orders waiting for an external venue.
    pub fn take_outbound(&mut self) -> Vec<OrderRequest> {
        std::mem::take(&mut self.outbound)
    }

    /// Drop an external order the venue confirmed cancelled.
    pub fn forget_external(&mut self, order_id: &str) {
        self.external.remove(order_id);
    }

    /// Signed quantity still working for `symbol`.
    pub fn resting(&self, symbol: &str) -> f64 {
        let external: f64 = self.external.values().filter(|(s, _)| s == symbol).map(|(_, q)| q).sum();
        self.sim.resting_signed(symbol) + external
    }

    fn next_order_id(&mut self, symbol: &str) -> String {
        self.order_seq += 1;
        format!("{symbol}-{}", self.order_seq)
    }

    fn market_order(&mut self, symbol: &str, signed_qty: f64, reduce_only: bool) -> OrderRequest {
        OrderRequest {
            order_id: self.next_order_id(symbol),
            symbol: symbol.to_string(),
            side: Side::from_signed(signed_qty),
            qty: signed_qty.abs(),
            order_type: OrderType::Market,
            reduce_only,
        }
    }

    pub fn on_tick(&mut self, ts: Timestamp, tick: &Tick, out: &mut Outbox) {
        self.counters.ticks += 1;
        self.portfolio.mark(&tick.symbol, tick.price);
        if self.portfolio.equity_curve.is_empty() {
            self.portfolio.record_equity(ts);
        }
        if let Some(bar) = &tick.bar {
            self.risk.observe_close(&tick.symbol, bar.c);
            let period = self.atr_period;
            self.atr.entry(tick.symbol.clone()).or_insert_with(|| Atr::new(period)).update(bar.h, bar.l, bar.c);
        }
        if let Some(alert) = self.risk.evaluate(ts, self.portfolio.equity()) {
            self.raise(ts, alert, out);
        }

        for fill in self.sim.on_tick(tick) {
            out.emit(Event::Fill(fill));
        }

        if tick.bar.is_some() {
            self.portfolio.record_equity(ts);
            if let Some(change) = self.regime.observe(&tick.symbol, ts, tick.price) {
                out.emit(Event::RegimeChange(change));
            }
        }
        if let Some(update) = self.signals.on_tick(ts, tick) {
            out.emit(Event::Signal(update));
        }
        self.check_exits(ts, tick, out);
    }

    /// Stop loss, take profit and holding-time exits, checked on every tick
    /// so intrabar extremes can trigger them.
    fn check_exits(&mut self, ts: Timestamp, tick: &Tick, out: &mut Outbox) {
        if self.risk.is_killed() || self.resting(&tick.symbol) != 0.0 {
            return;
        }
        let Some(pos) = self.portfolio.position(&tick.symbol) else {
            return;
        };
        let (qty, entry, opened) = (pos.qty, pos.avg_entry, pos.opened_ts);
        if entry <= 0.0 {
            return;
        }
        let ret = (tick.price / entry - 1.0) * qty.signum();
        let exit = &self.strategy.exit;
        let reason = if exit.stop_loss.map_or(false, |sl| ret <= -sl) {
            "stop_loss"
        } else if exit.take_profit.map_or(false, |tp| ret >= tp) {
            "take_profit"
        } else if exit.max_holding_ms.map_or(false, |mh| ts.saturating_sub(opened) >= mh) {
            "max_holding"
        } else {
            return;
        };
        log(
            Level::Info,
            Domain::Signal,
            "exit_triggered",
            obj(&[("symbol", v_str(&tick.symbol)), ("reason", v_str(reason)), ("return", v_num(ret))]),
        );
        let order = self.market_order(&tick.symbol, -qty, true);
        out.emit(Event::OrderRequest(order));
    }

    /// Turn an aggregated signal into at most one order. Enters when flat
    /// or on a strong opposite signal; exits on a weak or opposite signal.
    pub fn on_signal(&mut self, update: &SignalUpdate, out: &mut Outbox) {
        self.counters.signals += 1;
        if self.risk.is_killed() {
            return;
        }
        let symbol = update.symbol.as_str();
        let Some(price) = self.portfolio.mark_price(symbol) else {
            return;
        };
        if self.resting(symbol) != 0.0 {
            return;
        }
        let current = self.portfolio.position_qty(symbol);
        let conf = update.effective_confidence();
        let regime = self.regime.current(symbol);
        let entry = &self.strategy.entry;
        let wants_entry = conf.abs() >= entry.min_confidence
            && conf != 0.0
            && (conf > 0.0 || entry.allow_short)
            && self.strategy.regime_allowed(regime.map(|r| r.label));
        let opposed = conf * current < 0.0;

        let target = if wants_entry {
            if current != 0.0 && !opposed {
                return;
            }
            let stats = match self.strategy.sizing {
                SizingPolicy::FractionalKelly { .. } => TradeStats::from_pnls(&self.trade_pnls),
                _ => TradeStats::default(),
            };
            let input = SizingInput {
                equity: self.portfolio.equity(),
                price,
                confidence: conf,
                atr: self.atr.get(symbol).map_or(0.0, |a| a.get()),
                regime,
                stats,
                risk_scale: self.risk.size_scale(),
                max_position_size: self.risk.limits().max_position_size,
                lot_size: self.strategy.instrument.lot_size,
            };
            conf.signum() * self.sizer.size(symbol, &input).qty
        } else if current != 0.0 && (opposed || conf.abs() < self.strategy.exit.exit_confidence) {
            0.0
        } else {
            return;
        };

        let delta = target - current;
        let qty = round_to_lot(delta.abs(), self.strategy.instrument.lot_size);
        if qty <= 0.0 {
            return;
        }
        let reduce_only = target * current >= 0.0 && target.abs() < current.abs();
        let order = self.market_order(symbol, delta.signum() * qty, reduce_only);
        out.emit(Event::OrderRequest(order));
    }

    pub fn on_order(&mut self, ts: Timestamp, order: &OrderRequest, out: &mut Outbox) {
        let equity = self.portfolio.equity();
        let book = BookView {
            position: self.portfolio.position_qty(&order.symbol),
            price: self.portfolio.mark_price(&order.symbol).unwrap_or(0.0),
            equity,
        };
        match self.risk.check_order(ts, order, book) {
            Ok(()) => {
                self.counters.orders_submitted += 1;
                match self.route {
                    OrderRoute::Simulator => self.sim.submit(order),
                    OrderRoute::External => {
                        self.external.insert(order.order_id.clone(), (order.symbol.clone(), order.signed_qty()));
                        self.outbound.push(order.clone());
                    }
                }
            }
            Err(rejection) => {
                self.counters.orders_rejected += 1;
                out.emit(Event::RiskAlert(rejection.to_alert(&order.order_id, equity)));
            }
        }
    }

    pub fn on_fill(&mut self, ts: Timestamp, fill: &Fill, out: &mut Outbox) {
        if let Some((_, remaining)) = self.external.get_mut(&fill.order_id) {
            *remaining -= fill.signed_qty();
            if !fill.is_executed() || remaining.abs() < 1e-12 {
                self.external.remove(&fill.order_id);
            }
        }
        if !fill.is_executed() {
            self.counters.rejected_fills += 1;
            return;
        }
        self.counters.fills += 1;
        let outcome = self.portfolio.apply_fill(ts, fill);
        if let Some(trade) = &outcome.trade {
            self.risk.on_trade_closed(trade.pnl);
            self.trade_pnls.push(trade.pnl);
        }
        // The curve is sampled at bar closes; a fill on the sampled tick
        // refreshes that point instead of adding an off-bar one.
        if self.portfolio.equity_curve.last().map_or(false, |p| p.ts == ts) {
            self.portfolio.record_equity(ts);
        }
        if let Some(alert) = self.risk.evaluate(ts, self.portfolio.equity()) {
            self.raise(ts, alert, out);
        }
    }

    pub fn on_alert(&mut self, alert: &RiskAlert) {
        if let Some(d) = self.dispatcher.as_ref().filter(|_| !self.restoring) {
            d.dispatch(alert);
        }
        self.alerts.push(alert.clone());
    }

    fn raise(&mut self, ts: Timestamp, alert: RiskAlert, out: &mut Outbox) {
        if alert.is_kill() {
            self.on_kill(ts, out);
        }
        out.emit(Event::RiskAlert(alert));
    }

    fn on_kill(&mut self, ts: Timestamp, out: &mut Outbox) {
        let flatten = self.risk.limits().auto_flatten;
        let canceled = if flatten { self.sim.cancel_all() } else { self.sim.cancel_opening() };
        log(
            Level::Error,
            Domain::Risk,
            "kill_halt",
            obj(&[("canceled", v_num(canceled.len() as f64)), ("auto_flatten", serde_json::Value::Bool(flatten))]),
        );
        if flatten {
            let positions = self.portfolio.open_positions();
            for order in self.risk.flatten_orders(ts, &positions) {
                out.emit(Event::OrderRequest(order));
            }
        }
    }

    fn observe(&mut self, env: &Envelope) {
        if let Event::RegimeChange(_) = env.event {
            self.counters.regime_changes += 1;
        }
        if !self.restoring {
            self.observer.on_event(env);
        }
    }
}

/// Register the session handlers on a bus.
pub fn wire(bus: &mut EventBus<Session>) {
    bus.subscribe(EventKind::Tick, "session.tick", |s: &mut Session, env, out| {
        if let Event::Tick(t) = &env.event {
            s.on_tick(env.ts, t, out);
        }
        Ok(())
    });
    bus.subscribe(EventKind::Signal, "session.signal", |s: &mut Session, env, out| {
        if let Event::Signal(u) = &env.event {
            s.on_signal(u, out);
        }
        Ok(())
    });
    bus.subscribe(EventKind::OrderRequest, "session.order", |s: &mut Session, env, out| {
        if let Event::OrderRequest(o) = &env.event {
            s.on_order(env.ts, o, out);
        }
        Ok(())
    });
    bus.subscribe(EventKind::Fill, "session.fill", |s: &mut Session, env, out| {
        if let Event::Fill(f) = &env.event {
            s.on_fill(env.ts, f, out);
        }
        Ok(())
    });
    bus.subscribe(EventKind::RiskAlert, "session.alert", |s: &mut Session, env, _out| {
        if let Event::RiskAlert(a) = &env.event {
            s.on_alert(a);
        }
        Ok(())
    });
    for kind in [EventKind::Signal, EventKind::Fill, EventKind::RiskAlert, EventKind::RegimeChange] {
        bus.subscribe(kind, "observer", |s: &mut Session, env, _out| {
            s.observe(env);
            Ok(())
        });
    }
}

// =============================================================================
// Runs
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub strategy: String,
    pub symbols: Vec<String>,
    pub initial_capital: f64,
    pub final_equity: f64,
    pub metrics: PerformanceMetrics,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<ValidationResult>,
    pub trades: Vec<TradeRecord>,
    pub equity_curve: Vec<EquityPoint>,
    pub alerts: Vec<RiskAlert>,
    pub risk_state: String,
    pub killed: bool,
    pub counters: RunCounters,
    pub events: u64,
    pub gap_filled_bars: u64,
    pub data_fingerprints: BTreeMap<String, String>,
    pub trade_log_sha256: String,
    pub equity_sha256: String,
}

/// SHA-256 of the JSON encoding of `items`.
pub fn fingerprint<T: Serialize>(items: &[T]) -> String {
    let mut hasher = Sha256::new();
    for item in items {
        hasher.update(serde_json::to_vec(item).unwrap_or_default());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

fn intersect(a: TimeRange, b: TimeRange) -> TimeRange {
    let start = match (a.start, b.start) {
        (Some(x), Some(y)) => Some(x.max(y)),
        (x, y) => x.or(y),
    };
    let end = match (a.end, b.end) {
        (Some(x), Some(y)) => Some(x.min(y)),
        (x, y) => x.or(y),
    };
    TimeRange { start, end }
}

/// The finished state of one simulation, before reporting.
pub struct Simulation {
    pub session: Session,
    pub journal: Vec<Envelope>,
    pub events: u64,
    pub gap_filled_bars: u64,
    pub interval_ms: u64,
}

/// Replay `symbols` over `range` through a fresh session.
#[allow(clippy::too_many_arguments)]
pub fn simulate(
    strategy: &StrategyConfig,
    req: &BacktestRequest,
    symbols: &[String],
    range: TimeRange,
    source: &dyn BarSource,
    settings: &EngineSettings,
    cancel: &CancelToken,
    session: Option<Session>,
) -> EngineResult<Simulation> {
    let exec = req.execution.apply(&settings.exec);
    let limits = req.risk.clone().unwrap_or_else(|| settings.risk.clone());
    let mut session =
        session.unwrap_or_else(|| Session::new(strategy.clone(), req.initial_capital, settings, exec, limits));

    let interval_ms = source.interval_ms();
    let replay_cfg = ReplayConfig {
        lookahead: settings.lookahead,
        gap_fill_tolerance: settings.gap_fill_tolerance,
        interval_ms,
    };
    let mut replayer = Replayer::new(&replay_cfg);
    for symbol in symbols {
        replayer.add_stream(symbol, source.open(symbol, range)?, &replay_cfg);
    }
    if let Some(cp) = session.resume.take() {
        log(Level::Info, Domain::Job, "run_resuming", obj(&[("ts", v_num(cp.ts as f64)), ("seq", v_num(cp.seq as f64))]));
        replayer.resume_from(cp);
    }

    let mut bus: EventBus<Session> = EventBus::new(settings.bus.clone());
    wire(&mut bus);

    let mut last: Option<Timestamp> = None;
    for item in replayer.by_ref() {
        let item = item?;
        session.restoring = item.restoring;
        bus.publish(item.ts, Event::Tick(item.tick))?;
        if let RunOutcome::Cancelled { .. } = bus.run_until_idle(&mut session, cancel) {
            return Err(EngineError::Cancelled);
        }
        last = Some(item.ts);
        if item.restoring {
            continue;
        }
        if session.counters.ticks % PROGRESS_EVERY == 0 {
            session.observer.on_progress(session.counters.ticks, item.ts);
        }
        if item.seq % CHECKPOINT_EVERY == 0 {
            session.observer.on_checkpoint(Checkpoint { ts: item.ts, seq: item.seq });
        }
    }
    session.restoring = false;
    let Some(last_ts) = last else {
        return Err(DataError::Empty { symbol: symbols.join(",") }.into());
    };

    if req.close_at_end && !session.risk.is_killed() {
        session.sim.cancel_all();
        for (symbol, qty) in session.portfolio.open_positions() {
            let Some(price) = session.portfolio.mark_price(&symbol) else {
                continue;
            };
            let mut order = session.market_order(&symbol, -qty, true);
            order.order_id = format!("close-{}", order.order_id);
            let fill = session.sim.liquidation_fill(&order, price);
            bus.publish(last_ts, Event::Fill(fill))?;
        }
        if let RunOutcome::Cancelled { .. } = bus.run_until_idle(&mut session, cancel) {
            return Err(EngineError::Cancelled);
        }
    }
    session.portfolio.record_equity(last_ts);
    session.observer.on_progress(session.counters.ticks, last_ts);

    Ok(Simulation {
        events: bus.stats().dispatched,
        journal: bus.take_journal(),
        gap_filled_bars: replayer.gap_filled_bars(),
        interval_ms,
        session,
    })
}

fn resolve_symbols(req: &BacktestRequest, source: &dyn BarSource) -> Result<Vec<String>, ValidationError> {
    let mut symbols = if req.symbols.is_empty() { source.symbols() } else { req.symbols.clone() };
    symbols.sort();
    symbols.dedup();
    if symbols.is_empty() {
        return Err(ValidationError::invalid("symbols", "no symbols requested and none available"));
    }
    Ok(symbols)
}

/// Validate, simulate, score and (optionally) validate statistically.
pub fn run_backtest(
    run_id: &str,
    req: &BacktestRequest,
    source: &dyn BarSource,
    settings: &EngineSettings,
    cancel: &CancelToken,
    session_hook: impl FnOnce(Session) -> Session,
) -> EngineResult<RunReport> {
    req.validate()?;
    let symbols = resolve_symbols(req, source)?;
    let strategy = req.strategy.resolved(&BTreeMap::new())?;
    let exec = req.execution.apply(&settings.exec);
    let limits = req.risk.clone().unwrap_or_else(|| settings.risk.clone());
    let session = session_hook(Session::new(strategy.clone(), req.initial_capital, settings, exec, limits));

    log(
        Level::Info,
        Domain::Job,
        "run_started",
        obj(&[("run_id", v_str(run_id)), ("strategy", v_str(&strategy.name)), ("symbols", v_str(&symbols.join(",")))]),
    );
    let sim = simulate(&strategy, req, &symbols, req.range, source, settings, cancel, Some(session))?;
    let periods = settings.metrics.periods_for(sim.interval_ms);
    let s = &sim.session;
    let metrics = PerformanceMetrics::compute(&s.portfolio.equity_curve, &s.portfolio.trades, periods);

    let validation = match &req.validation {
        Some(vcfg) => Some(validate_run(&strategy, req, &symbols, source, settings, cancel, vcfg, &metrics, s)?),
        None => None,
    };

    let mut fingerprints = BTreeMap::new();
    for symbol in &symbols {
        fingerprints.insert(symbol.clone(), source.fingerprint(symbol)?);
    }
    let trade_log_sha256 = fingerprint(&s.portfolio.trades);
    let equity_sha256 = fingerprint(&s.portfolio.equity_curve);
    log_audit(run_id, &trade_log_sha256, &equity_sha256, sim.events);

    Ok(RunReport {
        run_id: run_id.to_string(),
        strategy: strategy.name.clone(),
        symbols,
        initial_capital: req.initial_capital,
        final_equity: s.portfolio.equity(),
        metrics,
        validation,
        trades: s.portfolio.trades.clone(),
        equity_curve: s.portfolio.equity_curve.clone(),
        alerts: s.alerts.clone(),
        risk_state: s.risk.state().as_str().to_string(),
        killed: s.risk.is_killed(),
        counters: s.counters.clone(),
        events: sim.events,
        gap_filled_bars: sim.gap_filled_bars,
        data_fingerprints: fingerprints,
        trade_log_sha256,
        equity_sha256,
    })
}

#[allow(clippy::too_many_arguments)]
fn validate_run(
    strategy: &StrategyConfig,
    req: &BacktestRequest,
    symbols: &[String],
    source: &dyn BarSource,
    settings: &EngineSettings,
    cancel: &CancelToken,
    vcfg: &ValidationConfig,
    metrics: &PerformanceMetrics,
    session: &Session,
) -> EngineResult<ValidationResult> {
    let timestamps: Vec<Timestamp> =
        source.open(&symbols[0], req.range)?.map(|b| b.map(|b| b.ts)).collect::<Result<_, DataError>>()?;

    let eval = |cfg: &StrategyConfig, window: TimeRange| -> EngineResult<PerformanceMetrics> {
        let range = intersect(req.range, window);
        let sub = simulate(cfg, req, symbols, range, source, settings, cancel, None)?;
        let p = &sub.session.portfolio;
        Ok(PerformanceMetrics::compute(&p.equity_curve, &p.trades, settings.metrics.periods_for(sub.interval_ms)))
    };
    let wf = match walk_forward::run(&timestamps, strategy, vcfg.windows, vcfg.train_fraction, eval) {
        Ok(report) => Some(report),
        Err(EngineError::Validation(e)) => {
            log(Level::Warn, Domain::Validation, "walk_forward_skipped", obj(&[("reason", v_str(&e.to_string()))]));
            None
        }
        Err(e) => return Err(e),
    };

    let pnls: Vec<f64> = session.portfolio.trades.iter().map(|t| t.pnl).collect();
    let mc = validation::bootstrap(&pnls, req.initial_capital, vcfg.mc_paths, vcfg.seed, settings.workers)?;
    Ok(validation::assess(metrics.clone(), wf, Some(mc), vcfg))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::HistoryCache;
    use crate::events::{Bar, FillStatus, TickPhase};

    fn flat_bars(n: u64, price: f64) -> Vec<Bar> {
        (0..n).map(|i| Bar { ts: i * 60_000, interval_ms: 60_000, o: price, h: price, l: price, c: price, v: 100.0 }).collect()
    }

    #[test]
    fn equity_is_sampled_at_bar_closes_only() {
        let settings = EngineSettings::default();
        let mut s = Session::new(StrategyConfig::default(), 10_000.0, &settings, ExecConfig::instant(), RiskLimits::default());
        let mut bus: EventBus<Session> = EventBus::new(settings.bus.clone());
        wire(&mut bus);
        let cancel = CancelToken::new();
        let bar = Bar { ts: 0, interval_ms: 60_000, o: 100.0, h: 100.0, l: 100.0, c: 100.0, v: 10.0 };
        let close = Tick { symbol: "BTC".into(), price: 100.0, volume: 10.0, phase: TickPhase::Close, bar: Some(bar) };
        let fill = |id: &str| Fill {
            fill_id: id.into(),
            order_id: id.into(),
            symbol: "BTC".into(),
            side: Side::Buy,
            qty: 1.0,
            price: 100.0,
            fee: 1.0,
            status: FillStatus::Executed,
            reason: None,
            reduce_only: false,
        };

        bus.publish(59_999, Event::Tick(close)).unwrap();
        bus.run_until_idle(&mut s, &cancel);
        assert_eq!(s.portfolio.equity_curve, vec![EquityPoint { ts: 59_999, equity: 10_000.0 }]);

        // Same tick as the sample: the point takes the fee.
        bus.publish(59_999, Event::Fill(fill("a"))).unwrap();
        bus.run_until_idle(&mut s, &cancel);
        assert_eq!(s.portfolio.equity_curve, vec![EquityPoint { ts: 59_999, equity: 9_999.0 }]);

        // Between bar closes: no new point.
        bus.publish(70_000, Event::Fill(fill("b"))).unwrap();
        bus.run_until_idle(&mut s, &cancel);
        assert_eq!(s.portfolio.equity_curve.len(), 1);
        assert_eq!(s.portfolio.equity(), 9_998.0);
    }

    #[test]
    fn request_defaults_from_json() {
        let req: BacktestRequest = serde_json::from_str(r#"{"strategy": {"name": "m"}}"#).unwrap();
        assert_eq!(req.initial_capital, 10_000.0);
        assert!(req.close_at_end);
        assert!(req.validate().is_ok());
    }

    #[test]
    fn invalid_request_is_refused_before_simulation() {
        let mut req = BacktestRequest::new(StrategyConfig::default());
        req.initial_capital = 0.0;
        let cache = HistoryCache::new(60_000);
        let err = run_backtest("r", &req, &cache, &EngineSettings::default(), &CancelToken::new(), |s| s).unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[test]
    fn exec_model_overrides_only_given_fields() {
        let model = ExecModel { fee_rate: Some(0.0), ..ExecModel::default() };
        let cfg = model.apply(&ExecConfig::taker());
        assert_eq!(cfg.fee_rate, 0.0);
        assert_eq!(cfg.half_spread, ExecConfig::taker().half_spread);
    }

    #[test]
    fn cancelled_run_reports_cancellation() {
        let cache = HistoryCache::new(60_000);
        cache.insert("BTC", flat_bars(50, 100.0));
        let cancel = CancelToken::new();
        cancel.cancel();
        let req = BacktestRequest::new(StrategyConfig::default());
        let err = run_backtest("r", &req, &cache, &EngineSettings::default(), &cancel, |s| s).unwrap_err();
        assert!(matches!(err, EngineError::Cancelled));
    }

    #[test]
    fn flat_market_trades_nothing() {
        let cache = HistoryCache::new(60_000);
        cache.insert("BTC", flat_bars(250, 100.0));
        let req = BacktestRequest::new(StrategyConfig::default());
        let report = run_backtest("flat", &req, &cache, &EngineSettings::default(), &CancelToken::new(), |s| s).unwrap();
        assert_eq!(report.counters.ticks, 1_000);
        assert_eq!(report.counters.orders_submitted, 0);
        assert!(report.trades.is_empty());
        assert_eq!(report.final_equity, 10_000.0);
        assert_eq!(report.metrics.total_return, 0.0);
        assert_eq!(report.data_fingerprints.len(), 1);
    }

    #[test]
    fn intersect_takes_the_tighter_bounds() {
        let a = TimeRange { start: Some(10), end: None };
        let b = TimeRange { start: Some(5), end: Some(50) };
        assert_eq!(intersect(a, b), TimeRange { start: Some(10), end: Some(50) });
    }
}
