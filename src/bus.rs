//! Event bus with deterministic ordering.
//!
//! Delivery order is `(ts, seq)`: earliest timestamp first, ties broken by
//! publish order. Handlers run synchronously against a caller-owned context
//! `C`, so one run mutates its state from exactly one place.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio::sync::mpsc;

use crate::config::{env_flag, env_or};
use crate::error::BusError;
use crate::events::{Envelope, Event, EventKind, HandlerError, HandlerFailure, Timestamp};
use crate::logging::{log, obj, v_num, v_str, Domain, Level};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusMode {
    /// Producers block on a full ingress; nothing is ever dropped.
    Backtest,
    /// Telemetry is dropped on a full ingress; critical events wait.
    Live,
}

impl std::str::FromStr for BusMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "backtest" => Ok(Self::Backtest),
            "live" => Ok(Self::Live),
            other => Err(format!("unknown bus mode {other}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BusConfig {
    pub mode: BusMode,
    pub handler_timeout_ms: u64,
    pub ingress_capacity: usize,
    /// Keep every dispatched envelope (needed for replay comparisons).
    pub journal: bool,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self { mode: BusMode::Backtest, handler_timeout_ms: 5_000, ingress_capacity: 1_024, journal: false }
    }
}

impl BusConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            mode: env_or("BUS_MODE", d.mode),
            handler_timeout_ms: env_or("BUS_HANDLER_TIMEOUT_MS", d.handler_timeout_ms),
            ingress_capacity: env_or("BUS_INGRESS_CAP", d.ingress_capacity),
            journal: env_flag("BUS_JOURNAL", d.journal),
        }
    }
}

/// Run-level cancellation. Cloned into whatever needs to observe or trigger it.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct SubscriptionId(u64);

/// Events produced by a handler, published after it returns.
#[derive(Debug, Default)]
pub struct Outbox {
    now: Timestamp,
    events: Vec<(Timestamp, Event)>,
}

impl Outbox {
    fn new(now: Timestamp) -> Self {
        Self { now, events: Vec::new() }
    }

    /// Emit at the triggering event's timestamp.
    pub fn emit(&mut self, event: Event) {
        self.events.push((self.now, event));
    }

    /// Emit at a later timestamp; earlier stamps are raised to `now`.
    pub fn emit_at(&mut self, ts: Timestamp, event: Event) {
        self.events.push((ts.max(self.now), event));
    }

    pub fn now(&self) -> Timestamp {
        self.now
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

pub type HandlerFn<C> = Box<dyn FnMut(&mut C, &Envelope, &mut Outbox) -> Result<(), String> + Send>;

struct Subscription<C> {
    id: SubscriptionId,
    kind: EventKind,
    name: String,
    handler: HandlerFn<C>,
}

struct Queued(Envelope);

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.0.ts == other.0.ts && self.0.seq == other.0.seq
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reversed for a min-heap: earliest ts, then lowest seq.
        match other.0.ts.cmp(&self.0.ts) {
            CmpOrdering::Equal => other.0.seq.cmp(&self.0.seq),
            ord => ord,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BusStats {
    pub published: u64,
    pub dispatched: u64,
    pub handler_failures: u64,
    pub handler_timeouts: u64,
    pub dropped_on_cancel: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Idle,
    Cancelled { dropped: u64 },
}

pub struct EventBus<C> {
    cfg: BusConfig,
    queue: BinaryHeap<Queued>,
    seq_counter: u64,
    now: Option<Timestamp>,
    subs: Vec<Subscription<C>>,
    sub_counter: u64,
    closed: bool,
    journal: Vec<Envelope>,
    stats: BusStats,
}

impl<C> EventBus<C> {
    pub fn new(cfg: BusConfig) -> Self {
        Self {
            cfg,
            queue: BinaryHeap::new(),
            seq_counter: 0,
            now: None,
            subs: Vec::new(),
            sub_counter: 0,
            closed: false,
            journal: Vec::new(),
            stats: BusStats::default(),
        }
    }

    pub fn subscribe<F>(&mut self, kind: EventKind, name: &str, handler: F) -> SubscriptionId
    where
        F: FnMut(&mut C, &Envelope, &mut Outbox) -> Result<(), String> + Send + 'static,
    {
        self.sub_counter += 1;
        let id = SubscriptionId(self.sub_counter);
        self.subs.push(Subscription { id, kind, name: name.to_string(), handler: Box::new(handler) });
        id
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.subs.len();
        self.subs.retain(|s| s.id != id);
        self.subs.len() != before
    }

    /// Enqueue an event. Returns its sequence number.
    pub fn publish(&mut self, ts: Timestamp, event: Event) -> Result<u64, BusError> {
        if self.closed {
            return Err(BusError::Closed);
        }
        if let Some(now) = self.now {
            if ts < now {
                log(
                    Level::Fatal,
                    Domain::Bus,
                    "non_monotonic_clock",
                    obj(&[("last", v_num(now as f64)), ("ts", v_num(ts as f64))]),
                );
                return Err(BusError::NonMonotonicClock { last: now, ts });
            }
        }
        self.seq_counter += 1;
        self.stats.published += 1;
        self.queue.push(Queued(Envelope { seq: self.seq_counter, ts, event }));
        Ok(self.seq_counter)
    }

    /// Stop accepting new events.
    pub fn close(&mut self) {
        self.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn now(&self) -> Option<Timestamp> {
        self.now
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn stats(&self) -> &BusStats {
        &self.stats
    }

    pub fn journal(&self) -> &[Envelope] {
        &self.journal
    }

    pub fn take_journal(&mut self) -> Vec<Envelope> {
        std::mem::take(&mut self.journal)
    }

    /// Dispatch the earliest queued event to its subscribers.
    pub fn step(&mut self, ctx: &mut C) -> Option<u64> {
        let Queued(env) = self.queue.pop()?;
        self.now = Some(env.ts);
        self.stats.dispatched += 1;
        let kind = env.event.kind();
        let budget_ms = self.cfg.handler_timeout_ms;
        let mut produced: Vec<(Timestamp, Event)> = Vec::new();

        for sub in self.subs.iter_mut().filter(|s| s.kind == kind) {
            let mut outbox = Outbox::new(env.ts);
            let started = Instant::now();
            let result = (sub.handler)(ctx, &env, &mut outbox);
            let elapsed_ms = started.elapsed().as_millis() as u64;

            let failure = match result {
                Err(message) => {
                    self.stats.handler_failures += 1;
                    Some(HandlerFailure::Failed { message })
                }
                Ok(()) if elapsed_ms > budget_ms => {
                    self.stats.handler_timeouts += 1;
                    Some(HandlerFailure::Timeout { elapsed_ms, budget_ms })
                }
                Ok(()) => None,
            };
            match failure {
                None => produced.extend(outbox.events),
                Some(failure) => {
                    log(
                        Level::Error,
                        Domain::Bus,
                        "handler_error",
                        obj(&[
                            ("handler", v_str(&sub.name)),
                            ("event_seq", v_num(env.seq as f64)),
                            ("failure", serde_json::to_value(&failure).unwrap_or_default()),
                        ]),
                    );
                    // A failing error handler must not feed itself.
                    if kind != EventKind::HandlerError {
                        produced.push((
                            env.ts,
                            Event::HandlerError(HandlerError {
                                handler: sub.name.clone(),
                                event_seq: env.seq,
                                failure,
                            }),
                        ));
                    }
                }
            }
        }

        let seq = env.seq;
        if self.cfg.journal {
            self.journal.push(env);
        }
        for (ts, event) in produced {
            // Outbox stamps are never earlier than `now`, and a closed bus
            // still accepts follow-ups of the in-flight event.
            self.seq_counter += 1;
            self.stats.published += 1;
            self.queue.push(Queued(Envelope { seq: self.seq_counter, ts, event }));
        }
        Some(seq)
    }

    /// Dispatch until the queue is empty or the token fires.
    ///
    /// On cancellation the bus closes, the in-flight event has already been
    /// fully handled, and whatever is still queued is discarded.
    pub fn run_until_idle(&mut self, ctx: &mut C, cancel: &CancelToken) -> RunOutcome {
        loop {
            if cancel.is_cancelled() {
                return self.cancel_now();
            }
            if self.step(ctx).is_none() {
                return RunOutcome::Idle;
            }
        }
    }

    fn cancel_now(&mut self) -> RunOutcome {
        self.close();
        let dropped = self.queue.len() as u64;
        self.queue.clear();
        self.stats.dropped_on_cancel += dropped;
        log(
            Level::Warn,
            Domain::Bus,
            "cancelled",
            obj(&[("dropped", v_num(dropped as f64))]),
        );
        RunOutcome::Cancelled { dropped }
    }

    /// Move everything currently waiting in the ingress onto the bus.
    pub fn pump(&mut self, rx: &mut IngressReceiver) -> Result<usize, BusError> {
        let mut moved = 0;
        loop {
            match rx.rx.try_recv() {
                Ok((ts, event)) => {
                    self.publish(ts, event)?;
                    moved += 1;
                }
                Err(mpsc::error::TryRecvError::Empty) => return Ok(moved),
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    return if moved > 0 { Ok(moved) } else { Err(BusError::Disconnected) };
                }
            }
        }
    }
}

// =============================================================================
// Ingress: bounded front door for producers on other threads/tasks
// =============================================================================

#[derive(Clone)]
pub struct Ingress {
    tx: mpsc::Sender<(Timestamp, Event)>,
    mode: BusMode,
    dropped: Arc<AtomicU64>,
}

pub struct IngressReceiver {
    rx: mpsc::Receiver<(Timestamp, Event)>,
}

impl IngressReceiver {
    /// Wait for the next event (live loop).
    pub async fn recv(&mut self) -> Option<(Timestamp, Event)> {
        self.rx.recv().await
    }
}

pub fn ingress(cfg: &BusConfig) -> (Ingress, IngressReceiver) {
    let (tx, rx) = mpsc::channel(cfg.ingress_capacity.max(1));
    (
        Ingress { tx, mode: cfg.mode, dropped: Arc::new(AtomicU64::new(0)) },
        IngressReceiver { rx },
    )
}

impl Ingress {
    /// Blocking send for producer threads outside any async runtime.
    /// Backtest mode never drops; live mode drops full-queue telemetry.
    pub fn send_blocking(&self, ts: Timestamp, event: Event) -> Result<bool, BusError> {
        if self.mode == BusMode::Live && !event.is_critical() {
            return self.try_drop_telemetry(ts, event);
        }
        self.tx.blocking_send((ts, event)).map_err(|_| BusError::Disconnected)?;
        Ok(true)
    }

    /// Async send. Returns `Ok(false)` when a telemetry event was dropped.
    pub async fn offer(&self, ts: Timestamp, event: Event) -> Result<bool, BusError> {
        if self.mode == BusMode::Live && !event.is_critical() {
            return self.try_drop_telemetry(ts, event);
        }
        self.tx.send((ts, event)).await.map_err(|_| BusError::Disconnected)?;
        Ok(true)
    }

    fn try_drop_telemetry(&self, ts: Timestamp, event: Event) -> Result<bool, BusError> {
        match self.tx.try_send((ts, event)) {
            Ok(()) => Ok(true),
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                Ok(false)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(BusError::Disconnected),
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
