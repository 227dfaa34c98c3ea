use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use crate::data::{MarketDataSource, TimeRange};
use crate::error::DataError;
use crate::events::{Bar, Tick, TickPhase, Timestamp};
use crate::execution::retry::RetryPolicy;
use crate::logging::{log, obj, ts_epoch_ms, v_num, v_str, Domain, Level};

/// `{"symbol": "BTCUSDT", "price": 64000.5, "volume": 0.3, "ts": 1700000000000}`.
/// `volume` and `ts` are optional; a missing `ts` is stamped on receipt.
#[derive(Debug, Deserialize)]
struct WireTick {
    symbol: String,
    price: f64,
    #[serde(default)]
    volume: f64,
    #[serde(default)]
    ts: Option<u64>,
}

pub fn parse_tick_message(text: &str, now_ms: Timestamp) -> Option<(Timestamp, Tick)> {
    let w: WireTick = serde_json::from_str(text).ok()?;
    if !w.price.is_finite() || w.price <= 0.0 || w.volume < 0.0 {
        return None;
    }
    Some((
        w.ts.unwrap_or(now_ms),
        Tick { symbol: w.symbol, price: w.price, volume: w.volume, phase: TickPhase::Trade, bar: None },
    ))
}

/// Live trade prints over WebSocket. On connect sends
/// `{"method":"subscribe","symbols":[...]}`, then reads ticks until the
/// socket drops, reconnecting with the retry policy's backoff.
pub struct WsTickFeed {
    url: String,
    retry: RetryPolicy,
    capacity: usize,
}

impl WsTickFeed {
    pub fn new(url: &str, retry: RetryPolicy) -> Self {
        Self { url: url.to_string(), retry, capacity: 1024 }
    }
}

async fn pump(url: &str, symbols: &[String], tx: &mpsc::Sender<(Timestamp, Tick)>, last_ts: &mut Timestamp) -> Result<(), String> {
    let (ws, _) = tokio_tungstenite::connect_async(url).await.map_err(|e| e.to_string())?;
    let (mut write, mut read) = ws.split();
    let sub = serde_json::json!({ "method": "subscribe", "symbols": symbols });
    write.send(Message::Text(sub.to_string())).await.map_err(|e| e.to_string())?;
    log(Level::Info, Domain::Data, "feed_connected", obj(&[("url", v_str(url)), ("symbols", v_num(symbols.len() as f64))]));

    while let Some(msg) = read.next().await {
        let msg = msg.map_err(|e| e.to_string())?;
        let text = match msg {
            Message::Text(t) => t,
            Message::Ping(p) => {
                let _ = write.send(Message::Pong(p)).await;
                continue;
            }
            Message::Close(_) => break,
            _ => continue,
        };
        let Some((ts, tick)) = parse_tick_message(&text, ts_epoch_ms()) else {
            continue;
        };
        if !symbols.is_empty() && !symbols.iter().any(|s| *s == tick.symbol) {
            continue;
        }
        // The bus rejects time going backwards; venue clocks can jitter.
        *last_ts = (*last_ts).max(ts);
        if tx.send((*last_ts, tick)).await.is_err() {
            return Ok(());
        }
    }
    Err("feed closed".to_string())
}

#[async_trait]
impl MarketDataSource for WsTickFeed {
    fn name(&self) -> &str {
        "ws"
    }

    async fn bars(&self, _symbol: &str, _range: TimeRange) -> Result<Vec<Bar>, DataError> {
        Err(DataError::Source("ws feed has no history".to_string()))
    }

    async fn subscribe(&self, symbols: &[String]) -> Result<mpsc::Receiver<(Timestamp, Tick)>, DataError> {
        let (tx, rx) = mpsc::channel(self.capacity);
        let url = self.url.clone();
        let symbols = symbols.to_vec();
        let retry = self.retry.clone();
        tokio::spawn(async move {
            let mut last_ts = 0;
            let mut attempt = 0u32;
            loop {
                match pump(&url, &symbols, &tx, &mut last_ts).await {
                    Ok(()) => return,
                    Err(e) => {
                        if tx.is_closed() {
                            return;
                        }
                        let delay = retry.delay_for_attempt(attempt.min(10));
                        attempt += 1;
                        log(
                            Level::Warn,
                            Domain::Data,
                            "feed_reconnect",
                            obj(&[("error", v_str(&e)), ("delay_ms", v_num(delay.as_millis() as f64))]),
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        });
        Ok(rx)
    }
}
