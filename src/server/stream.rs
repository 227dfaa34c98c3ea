//! WebSocket stream: job progress, completion and run events pushed to
//! every client; `backtest.run`, `backtest.cancel` and `signals.subscribe`
//! accepted as requests.

use std::collections::BTreeSet;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::engine::BacktestRequest;
use crate::jobs::JobManager;
use crate::logging::{log, obj, ts_epoch_ms, v_num, v_str, Domain, Level};
use crate::protocol::{self, Message, MessageType};

/// Per-connection filter. Signal messages are only sent after
/// `signals.subscribe`; everything else goes to every client.
#[derive(Debug, Clone, Default)]
pub struct Subscription {
    /// `None` until subscribed; an empty set means every symbol.
    signals: Option<BTreeSet<String>>,
}

impl Subscription {
    pub fn wants(&self, msg: &Message) -> bool {
        if msg.method != protocol::SIGNAL_NEW && msg.method != protocol::SIGNAL_EXPIRED {
            return true;
        }
        let Some(symbols) = &self.signals else {
            return false;
        };
        if symbols.is_empty() {
            return true;
        }
        let symbol = msg.payload["data"]["symbol"].as_str().unwrap_or_default();
        symbols.contains(symbol)
    }
}

#[derive(Debug, Deserialize)]
struct CancelPayload {
    job_id: String,
}

#[derive(Debug, Default, Deserialize)]
struct SubscribePayload {
    #[serde(default)]
    symbols: Vec<String>,
}

/// Answer one client request.
pub fn handle_request(jobs: &JobManager, text: &str, sub: &mut Subscription) -> Message {
    let now = ts_epoch_ms();
    let req: Message = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => return Message::error("", "", &format!("malformed message: {e}"), now),
    };
    if req.kind != MessageType::Request {
        return Message::error(&req.id, &req.method, "expected a request", now);
    }
    let result: Result<Value, String> = match req.method.as_str() {
        protocol::BACKTEST_RUN => serde_json::from_value::<BacktestRequest>(req.payload.clone())
            .map_err(|e| e.to_string())
            .and_then(|r| jobs.submit(r).map_err(|e| e.to_string()))
            .map(|id| json!({ "job_id": id, "status": "queued" })),
        protocol::BACKTEST_CANCEL => serde_json::from_value::<CancelPayload>(req.payload.clone())
            .map_err(|e| e.to_string())
            .map(|p| json!({ "job_id": p.job_id, "cancelled": jobs.cancel(&p.job_id) })),
        protocol::SIGNALS_SUBSCRIBE => {
            let p: SubscribePayload = serde_json::from_value(req.payload.clone()).unwrap_or_default();
            sub.signals = Some(p.symbols.iter().cloned().collect());
            Ok(json!({ "symbols": p.symbols }))
        }
        other => Err(format!("unknown method {other}")),
    };
    match result {
        Ok(payload) => Message::response(&req, payload, now),
        Err(e) => Message::error(&req.id, &req.method, &e, now),
    }
}

pub async fn serve(addr: &str, jobs: Arc<JobManager>) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    log(Level::Info, Domain::System, "ws_listening", obj(&[("addr", v_str(&listener.local_addr()?.to_string()))]));
    loop {
        let (stream, peer) = listener.accept().await?;
        let jobs = Arc::clone(&jobs);
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, jobs).await {
                log(Level::Warn, Domain::System, "ws_connection_error", obj(&[("peer", v_str(&peer.to_string())), ("error", v_str(&e.to_string()))]));
            }
        });
    }
}

async fn handle_connection(stream: TcpStream, jobs: Arc<JobManager>) -> anyhow::Result<()> {
    let ws = tokio_tungstenite::accept_async(stream).await?;
    let (mut sink, mut source) = ws.split();
    let mut updates = jobs.subscribe();
    let mut sub = Subscription::default();
    loop {
        tokio::select! {
            incoming = source.next() => match incoming {
                Some(Ok(WsMessage::Text(text))) => {
                    let reply = handle_request(&jobs, &text, &mut sub);
                    sink.send(WsMessage::Text(reply.to_json())).await?;
                }
                Some(Ok(WsMessage::Ping(p))) => sink.send(WsMessage::Pong(p)).await?,
                Some(Ok(WsMessage::Close(_))) | None => return Ok(()),
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
            },
            update = updates.recv() => match update {
                Ok(msg) => {
                    if sub.wants(&msg) {
                        sink.send(WsMessage::Text(msg.to_json())).await?;
                    }
                }
                Err(RecvError::Lagged(n)) => {
                    log(Level::Warn, Domain::System, "ws_client_lagged", obj(&[("skipped", v_num(n as f64))]));
                }
                Err(RecvError::Closed) => return Ok(()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::data::HistoryCache;
    use crate::engine::EngineSettings;
    use crate::storage::MemoryStore;

    fn jobs() -> JobManager {
        let pool = PoolConfig { workers: 1, queue_capacity: 2 };
        JobManager::new(&pool, Arc::new(HistoryCache::new(60_000)), EngineSettings::default(), Arc::new(MemoryStore::new()), None)
    }

    fn request(method: &str, payload: Value) -> String {
        json!({ "id": "r1", "type": "request", "method": method, "payload": payload, "timestamp": 0 }).to_string()
    }

    #[test]
    fn signals_need_a_subscription() {
        let jm = jobs();
        let mut sub = Subscription::default();
        let signal = Message::event("e", protocol::SIGNAL_NEW, json!({ "job_id": "j", "data": { "symbol": "ETH" } }), 0);
        let done = protocol::complete("j", "completed", None, 0);
        assert!(!sub.wants(&signal));
        assert!(sub.wants(&done));

        let reply = handle_request(&jm, &request(protocol::SIGNALS_SUBSCRIBE, json!({ "symbols": ["BTC"] })), &mut sub);
        assert_eq!(reply.kind, MessageType::Response);
        assert_eq!(reply.id, "r1");
        assert!(!sub.wants(&signal));
        handle_request(&jm, &request(protocol::SIGNALS_SUBSCRIBE, json!({})), &mut sub);
        assert!(sub.wants(&signal));
    }

    #[test]
    fn bad_requests_get_error_replies() {
        let jm = jobs();
        let mut sub = Subscription::default();
        assert_eq!(handle_request(&jm, "not json", &mut sub).kind, MessageType::Error);
        let unknown = handle_request(&jm, &request("nope", Value::Null), &mut sub);
        assert_eq!(unknown.kind, MessageType::Error);
        let invalid = handle_request(&jm, &request(protocol::BACKTEST_RUN, json!({ "strategy": { "name": "" } })), &mut sub);
        assert_eq!(invalid.kind, MessageType::Error);
        let cancel = handle_request(&jm, &request(protocol::BACKTEST_CANCEL, json!({ "job_id": "job-9" })), &mut sub);
        assert_eq!(cancel.payload["cancelled"], false);
    }
}
