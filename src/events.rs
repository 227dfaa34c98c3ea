//! Typed events carried by the bus.
//!
//! Every variant has a fixed schema; handlers match exhaustively over
//! `Event` instead of probing loosely-typed payloads.

use serde::{Deserialize, Serialize};

use crate::regime::{RegimeLabel, RegimeState};

/// Epoch milliseconds.
pub type Timestamp = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn sign(&self) -> f64 {
        match self {
            Side::Buy => 1.0,
            Side::Sell => -1.0,
        }
    }

    pub fn from_signed(qty: f64) -> Self {
        if qty >= 0.0 {
            Side::Buy
        } else {
            Side::Sell
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }
}

/// OHLCV bar. `ts` is the bar open time, `interval_ms` its length.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub ts: Timestamp,
    pub interval_ms: u64,
    pub o: f64,
    pub h: f64,
    pub l: f64,
    pub c: f64,
    pub v: f64,
}

impl Bar {
    pub fn close_ts(&self) -> Timestamp {
        self.ts + self.interval_ms.saturating_sub(1)
    }
}

/// Position of a tick inside its source bar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TickPhase {
    Open,
    High,
    Low,
    Close,
    /// Live trade print with no bar context.
    Trade,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub symbol: String,
    pub price: f64,
    /// Volume available to trade against at this tick.
    pub volume: f64,
    pub phase: TickPhase,
    /// The completed bar, present on the closing tick only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bar: Option<Bar>,
}

/// One source's raw contribution, kept for transparency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceReading {
    pub source: String,
    pub value: f64,
    pub weight: f64,
    pub ts: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalUpdate {
    pub symbol: String,
    /// Normalized confidence in [-1, 1]; sign is direction.
    pub confidence: f64,
    pub conflicted: bool,
    pub divergence: f64,
    pub inputs: Vec<SourceReading>,
    /// Sources discarded as stale during this aggregation.
    pub expired: Vec<String>,
}

impl SignalUpdate {
    /// Confidence as sizing should see it.
    pub fn effective_confidence(&self) -> f64 {
        if self.conflicted {
            0.0
        } else {
            self.confidence
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OrderType {
    Market,
    Limit { price: f64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub order_id: String,
    pub symbol: String,
    pub side: Side,
    pub qty: f64,
    pub order_type: OrderType,
    /// Only allowed to shrink an existing position (auto-flatten, exits).
    #[serde(default)]
    pub reduce_only: bool,
}

impl OrderRequest {
    pub fn signed_qty(&self) -> f64 {
        self.side.sign() * self.qty
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FillStatus {
    Executed,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fill {
    pub fill_id: String,
    pub order_id: String,
    pub symbol: String,
    pub side: Side,
    /// Unsigned executed quantity; zero on rejection.
    pub qty: f64,
    pub price: f64,
    pub fee: f64,
    pub status: FillStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default)]
    pub reduce_only: bool,
}

impl Fill {
    pub fn signed_qty(&self) -> f64 {
        self.side.sign() * self.qty
    }

    pub fn is_executed(&self) -> bool {
        self.status == FillStatus::Executed && self.qty > 0.0
    }

    pub fn rejected(order: &OrderRequest, reason: impl Into<String>) -> Self {
        Self {
            fill_id: format!("{}-rej", order.order_id),
            order_id: order.order_id.clone(),
            symbol: order.symbol.clone(),
            side: order.side,
            qty: 0.0,
            price: 0.0,
            fee: 0.0,
            status: FillStatus::Rejected,
            reason: Some(reason.into()),
            reduce_only: order.reduce_only,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AlertKind {
    /// Risk state machine moved between states.
    StateTransition { from: String, to: String },
    /// Pre-trade check refused an order.
    OrderRejected { order_id: String, code: String },
    /// Venue never acknowledged; needs a human.
    ManualReconciliation { order_id: String },
    LimitsTightened,
    Reset,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskAlert {
    pub level: AlertLevel,
    pub kind: AlertKind,
    /// All triggered reason codes, primary first.
    pub reasons: Vec<String>,
    pub equity: f64,
    pub message: String,
}

impl RiskAlert {
    pub fn is_kill(&self) -> bool {
        matches!(&self.kind, AlertKind::StateTransition { to, .. } if to == "killed")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegimeChange {
    pub symbol: String,
    pub from: Option<RegimeLabel>,
    pub state: RegimeState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HandlerFailure {
    Timeout { elapsed_ms: u64, budget_ms: u64 },
    Failed { message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandlerError {
    pub handler: String,
    pub event_seq: u64,
    pub failure: HandlerFailure,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Event {
    Tick(Tick),
    Signal(SignalUpdate),
    OrderRequest(OrderRequest),
    Fill(Fill),
    RiskAlert(RiskAlert),
    RegimeChange(RegimeChange),
    HandlerError(HandlerError),
    /// Non-critical gauges; the only events a live bus may drop.
    Telemetry { name: String, value: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Tick,
    Signal,
    OrderRequest,
    Fill,
    RiskAlert,
    RegimeChange,
    HandlerError,
    Telemetry,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Tick(_) => EventKind::Tick,
            Event::Signal(_) => EventKind::Signal,
            Event::OrderRequest(_) => EventKind::OrderRequest,
            Event::Fill(_) => EventKind::Fill,
            Event::RiskAlert(_) => EventKind::RiskAlert,
            Event::RegimeChange(_) => EventKind::RegimeChange,
            Event::HandlerError(_) => EventKind::HandlerError,
            Event::Telemetry { .. } => EventKind::Telemetry,
        }
    }

    pub fn is_critical(&self) -> bool {
        !matches!(self, Event::Telemetry { .. })
    }

    pub fn symbol(&self) -> Option<&str> {
        match self {
            Event::Tick(t) => Some(&t.symbol),
            Event::Signal(s) => Some(&s.symbol),
            Event::OrderRequest(o) => Some(&o.symbol),
            Event::Fill(f) => Some(&f.symbol),
            Event::RegimeChange(r) => Some(&r.symbol),
            Event::RiskAlert(_) | Event::HandlerError(_) | Event::Telemetry { .. } => None,
        }
    }
}

/// An event as delivered: immutable once sequenced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub seq: u64,
    pub ts: Timestamp,
    pub event: Event,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn telemetry_is_the_only_droppable_event() {
        let tel = Event::Telemetry { name: "queue_depth".into(), value: 3.0 };
        assert!(!tel.is_critical());
        let order = Event::OrderRequest(OrderRequest {
            order_id: "o-1".into(),
            symbol: "BTC".into(),
            side: Side::Buy,
            qty: 1.0,
            order_type: OrderType::Market,
            reduce_only: false,
        });
        assert!(order.is_critical());
        assert_eq!(order.kind(), EventKind::OrderRequest);
    }

    #[test]
    fn conflicted_signal_has_zero_effective_confidence() {
        let s = SignalUpdate {
            symbol: "BTC".into(),
            confidence: 0.7,
            conflicted: true,
            divergence: 0.9,
            inputs: vec![],
            expired: vec![],
        };
        assert_eq!(s.effective_confidence(), 0.0);
    }

    #[test]
    fn envelope_serializes_tagged() {
        let env = Envelope {
            seq: 1,
            ts: 1000,
            event: Event::Telemetry { name: "x".into(), value: 1.0 },
        };
        let v = serde_json::to_value(&env).unwrap();
        assert_eq!(v["event"]["type"], "telemetry");
    }
}
