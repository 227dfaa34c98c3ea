//! Paper trading against a live tick feed.
//!
//! Trade prints are rolled into bars so the same session logic that runs
//! backtests sees closing ticks. Approved orders leave the session through
//! its outbound queue, go to the venue via `ExecutionAdapter`, and come
//! back as `Fill`/`RiskAlert` events on the bus.

use std::sync::Arc;
use std::time::Duration;

use crate::bus::{self, BusConfig, BusMode, CancelToken, EventBus, RunOutcome};
use crate::data::MarketDataSource;
use crate::engine::{wire, EngineSettings, OrderRoute, Session};
use crate::error::{EngineError, EngineResult};
use crate::events::{Bar, Event, Tick, TickPhase, Timestamp};
use crate::execution::{ExecutionAdapter, PaperVenue, Placement, RetryPolicy};
use crate::logging::{log, obj, v_num, v_str, Domain, Level};
use crate::strategy::StrategyConfig;

/// Rolls trade prints into fixed-interval bars, per symbol.
pub struct BarBuilder {
    interval_ms: u64,
    open: std::collections::BTreeMap<String, Bar>,
}

impl BarBuilder {
    pub fn new(interval_ms: u64) -> Self {
        Self { interval_ms: interval_ms.max(1), open: Default::default() }
    }

    /// Ticks to publish for one trade print: the closing tick of the bar
    /// the print rolled over (stamped `ts`, the clock never goes back), then
    /// the print itself.
    pub fn push(&mut self, ts: Timestamp, tick: Tick) -> Vec<(Timestamp, Tick)> {
        let bucket = ts - ts % self.interval_ms;
        let mut out = Vec::with_capacity(2);
        match self.open.get_mut(&tick.symbol) {
            Some(bar) if bar.ts == bucket => {
                bar.h = bar.h.max(tick.price);
                bar.l = bar.l.min(tick.price);
                bar.c = tick.price;
                bar.v += tick.volume;
            }
            _ => {
                let fresh = Bar {
                    ts: bucket,
                    interval_ms: self.interval_ms,
                    o: tick.price,
                    h: tick.price,
                    l: tick.price,
                    c: tick.price,
                    v: tick.volume,
                };
                if let Some(done) = self.open.insert(tick.symbol.clone(), fresh) {
                    out.push((
                        ts,
                        Tick { symbol: tick.symbol.clone(), price: done.c, volume: 0.0, phase: TickPhase::Close, bar: Some(done) },
                    ));
                }
            }
        }
        out.push((ts, tick));
        out
    }
}

pub struct PaperTrader {
    bus: EventBus<Session>,
    session: Session,
    adapter: ExecutionAdapter,
    venue: Arc<PaperVenue>,
    bars: BarBuilder,
    cancel: CancelToken,
    halted: bool,
}

impl PaperTrader {
    pub fn new(strategy: StrategyConfig, capital: f64, settings: &EngineSettings, retry: RetryPolicy, interval_ms: u64) -> Self {
        let venue = Arc::new(PaperVenue::new(settings.exec.clone(), capital));
        let ack = Duration::from_millis(settings.exec.ack_timeout_ms);
        let adapter = ExecutionAdapter::new(venue.clone(), retry, ack);
        let session = Session::new(strategy, capital, settings, settings.exec.clone(), settings.risk.clone())
            .with_route(OrderRoute::External);
        let mut bus = EventBus::new(settings.bus.clone());
        wire(&mut bus);
        Self { bus, session, adapter, venue, bars: BarBuilder::new(interval_ms), cancel: CancelToken::new(), halted: false }
    }

    /// Forward kill-switch alerts to external sinks.
    pub fn with_dispatcher(mut self, dispatcher: crate::notify::AlertDispatcher) -> Self {
        self.session = self.session.with_dispatcher(dispatcher);
        self
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub async fn on_tick(&mut self, ts: Timestamp, tick: Tick) -> EngineResult<()> {
        // The venue matches orders placed on earlier ticks first.
        self.venue.on_tick(ts, &tick).await;
        for (t, tk) in self.bars.push(ts, tick) {
            self.bus.publish(t, Event::Tick(tk))?;
        }
        self.settle(ts).await
    }

    /// Run the bus dry, forwarding orders and feeding venue responses back
    /// until nothing new arrives.
    async fn settle(&mut self, ts: Timestamp) -> EngineResult<()> {
        loop {
            if let RunOutcome::Cancelled { .. } = self.bus.run_until_idle(&mut self.session, &self.cancel) {
                return Err(EngineError::Cancelled);
            }
            if self.session.risk.is_killed() && !self.halted {
                self.halt(ts).await;
            }
            let mut published = false;
            for order in self.session.take_outbound() {
                match self.adapter.place(ts, &order).await {
                    Placement::Acked { .. } => {}
                    Placement::Rejected(fill) => {
                        self.bus.publish(ts, Event::Fill(fill))?;
                        published = true;
                    }
                    Placement::Unknown(alert) => {
                        self.bus.publish(ts, Event::RiskAlert(alert))?;
                        published = true;
                    }
                }
            }
            match self.adapter.poll_fills(ts).await {
                Ok(fills) => {
                    for fill in fills {
                        self.bus.publish(ts, Event::Fill(fill))?;
                        published = true;
                    }
                }
                Err(e) => log(Level::Warn, Domain::Exec, "poll_fills_failed", obj(&[("error", v_str(&e.to_string()))])),
            }
            if !published {
                return Ok(());
            }
        }
    }

    /// Cancel working opening orders at the venue once the kill switch is
    /// engaged. Reduce-only orders keep working.
    async fn halt(&mut self, ts: Timestamp) {
        self.halted = true;
        let opening: Vec<String> =
            self.adapter.orders().live().filter(|o| !o.request.reduce_only).map(|o| o.id().to_string()).collect();
        for id in opening {
            match self.adapter.cancel(ts, &id).await {
                Ok(()) => self.session.forget_external(&id),
                Err(e) => log(
                    Level::Error,
                    Domain::Exec,
                    "halt_cancel_failed",
                    obj(&[("order_id", v_str(&id)), ("error", v_str(&e.to_string()))]),
                ),
            }
        }
    }
}

/// Feed live ticks into `trader` until the feed ends or the trader's
/// cancel token fires. Ticks cross a live-mode ingress: inter-arrival
/// telemetry is shed when the trader falls behind, ticks never are.
pub async fn run_paper(
    feed: &dyn MarketDataSource,
    symbols: &[String],
    trader: &mut PaperTrader,
    bus_cfg: &BusConfig,
) -> anyhow::Result<()> {
    let mut feed_rx = feed.subscribe(symbols).await?;
    let (ingress, mut rx) = bus::ingress(&BusConfig { mode: BusMode::Live, ..bus_cfg.clone() });
    let forward = tokio::spawn(async move {
        let mut last: Option<Timestamp> = None;
        while let Some((ts, tick)) = feed_rx.recv().await {
            let gap = last.map_or(0, |p| ts.saturating_sub(p));
            last = Some(ts);
            let gauge = Event::Telemetry { name: "feed_gap_ms".into(), value: gap as f64 };
            if ingress.offer(ts, gauge).await.is_err() || ingress.offer(ts, Event::Tick(tick)).await.is_err() {
                break;
            }
        }
        ingress.dropped()
    });

    let cancel = trader.cancel_token();
    let mut ticks = 0u64;
    while let Some((ts, event)) = rx.recv().await {
        if cancel.is_cancelled() {
            break;
        }
        match event {
            Event::Tick(tick) => {
                trader.on_tick(ts, tick).await?;
                ticks += 1;
                if ticks % 1_000 == 0 {
                    let s = trader.session();
                    log(
                        Level::Info,
                        Domain::Portfolio,
                        "paper_status",
                        obj(&[
                            ("ticks", v_num(ticks as f64)),
                            ("equity", v_num(s.portfolio.equity())),
                            ("risk_state", v_str(s.risk.state().as_str())),
                        ]),
                    );
                }
            }
            Event::Telemetry { name, value } => {
                log(Level::Trace, Domain::Bus, "telemetry", obj(&[("name", v_str(&name)), ("value", v_num(value))]))
            }
            _ => {}
        }
    }
    if cancel.is_cancelled() {
        forward.abort();
    }
    drop(rx);
    let dropped = forward.await.unwrap_or(0);
    log(
        Level::Info,
        Domain::System,
        "paper_stopped",
        obj(&[("ticks", v_num(ticks as f64)), ("telemetry_dropped", v_num(dropped as f64))]),
    );
    Ok(())
}
