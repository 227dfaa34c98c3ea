//! Streaming protocol: one JSON envelope shape for requests, responses and
//! pushed events.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::events::{Envelope, Event, Timestamp};

pub const BACKTEST_PROGRESS: &str = "backtest.progress";
pub const BACKTEST_COMPLETE: &str = "backtest.complete";
pub const SIGNAL_NEW: &str = "signal.new";
pub const SIGNAL_EXPIRED: &str = "signal.expired";
pub const TRADE_EXECUTED: &str = "trade.executed";
pub const KILLSWITCH_TRIGGERED: &str = "killswitch.triggered";
pub const REGIME_CHANGED: &str = "regime.changed";

pub const BACKTEST_RUN: &str = "backtest.run";
pub const BACKTEST_CANCEL: &str = "backtest.cancel";
pub const SIGNALS_SUBSCRIBE: &str = "signals.subscribe";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Request,
    Response,
    Event,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub method: String,
    #[serde(default)]
    pub payload: Value,
    pub timestamp: Timestamp,
}

impl Message {
    pub fn event(id: impl Into<String>, method: &str, payload: Value, timestamp: Timestamp) -> Self {
        Self { id: id.into(), kind: MessageType::Event, method: method.to_string(), payload, timestamp }
    }

    /// A response echoes the request id and method.
    pub fn response(req: &Message, payload: Value, timestamp: Timestamp) -> Self {
        Self { id: req.id.clone(), kind: MessageType::Response, method: req.method.clone(), payload, timestamp }
    }

    pub fn error(req_id: &str, method: &str, message: &str, timestamp: Timestamp) -> Self {
        Self {
            id: req_id.to_string(),
            kind: MessageType::Error,
            method: method.to_string(),
            payload: json!({ "error": message }),
            timestamp,
        }
    }

    /// The job a pushed message belongs to, when it carries one.
    pub fn job_id(&self) -> Option<&str> {
        self.payload.get("job_id").and_then(Value::as_str)
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

fn with_job(job_id: &str, body: Value) -> Value {
    json!({ "job_id": job_id, "data": body })
}

/// Map a delivered run event onto protocol messages. Events with no public
/// counterpart (ticks, orders, ordinary alerts) map to nothing; a signal
/// that dropped stale sources also reports them as `signal.expired`.
pub fn from_envelope(job_id: &str, env: &Envelope) -> Vec<Message> {
    let id = format!("{job_id}-{}", env.seq);
    let mut out = Vec::new();
    let mut push = |id: String, method: &str, body: Option<Value>| {
        if let Some(body) = body {
            out.push(Message::event(id, method, with_job(job_id, body), env.ts));
        }
    };
    match &env.event {
        Event::Signal(u) => {
            push(id.clone(), SIGNAL_NEW, serde_json::to_value(u).ok());
            if !u.expired.is_empty() {
                let body = json!({ "symbol": u.symbol, "sources": u.expired });
                push(format!("{id}-expired"), SIGNAL_EXPIRED, Some(body));
            }
        }
        Event::Fill(f) if f.is_executed() => push(id, TRADE_EXECUTED, serde_json::to_value(f).ok()),
        Event::RiskAlert(a) if a.is_kill() => push(id, KILLSWITCH_TRIGGERED, serde_json::to_value(a).ok()),
        Event::RegimeChange(r) => push(id, REGIME_CHANGED, serde_json::to_value(r).ok()),
        _ => {}
    }
    out
}

pub fn progress(job_id: &str, ticks: u64, ts: Timestamp) -> Message {
    Message::event(
        format!("{job_id}-progress-{ticks}"),
        BACKTEST_PROGRESS,
        json!({ "job_id": job_id, "ticks": ticks, "ts": ts }),
        ts,
    )
}

pub fn complete(job_id: &str, status: &str, reason: Option<&str>, ts: Timestamp) -> Message {
    Message::event(
        format!("{job_id}-complete"),
        BACKTEST_COMPLETE,
        json!({ "job_id": job_id, "status": status, "reason": reason }),
        ts,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{AlertKind, AlertLevel, RiskAlert};

    #[test]
    fn envelope_field_names() {
        let m = progress("job-3", 1_000, 42);
        let v: Value = serde_json::from_str(&m.to_json()).unwrap();
        assert_eq!(v["type"], "event");
        assert_eq!(v["method"], BACKTEST_PROGRESS);
        assert_eq!(v["timestamp"], 42);
        assert_eq!(v["payload"]["ticks"], 1_000);
        assert_eq!(m.job_id(), Some("job-3"));
    }

    #[test]
    fn kill_alert_maps_to_killswitch() {
        let alert = RiskAlert {
            level: AlertLevel::Critical,
            kind: AlertKind::StateTransition { from: "warning".into(), to: "killed".into() },
            reasons: vec!["daily_loss".into()],
            equity: 9_400.0,
            message: "kill".into(),
        };
        let env = Envelope { seq: 7, ts: 100, event: Event::RiskAlert(alert) };
        let msgs = from_envelope("j", &env);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].method, KILLSWITCH_TRIGGERED);
        assert_eq!(msgs[0].id, "j-7");

        let quiet = Envelope { seq: 8, ts: 100, event: Event::Telemetry { name: "x".into(), value: 0.0 } };
        assert!(from_envelope("j", &quiet).is_empty());
    }

    #[test]
    fn requests_parse_without_payload() {
        let m: Message =
            serde_json::from_str(r#"{"id":"1","type":"request","method":"backtest.cancel","timestamp":0}"#).unwrap();
        assert_eq!(m.kind, MessageType::Request);
        assert_eq!(m.payload, Value::Null);
    }
}
