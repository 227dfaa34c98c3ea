//! The venue seam for live execution, and a paper venue behind it.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::ExecutionError;
use crate::events::{Fill, OrderRequest, Side, Tick, Timestamp};

use super::simulator::{ExecConfig, ExecutionSimulator};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VenueAck {
    pub order_id: String,
    pub venue_order_id: String,
}

/// A fill as the venue reports it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VenueFill {
    pub fill_id: String,
    pub order_id: String,
    pub symbol: String,
    pub side: Side,
    pub qty: f64,
    pub price: f64,
    pub fee: f64,
    pub ts: Timestamp,
}

impl From<Fill> for VenueFill {
    fn from(f: Fill) -> Self {
        Self {
            fill_id: f.fill_id,
            order_id: f.order_id,
            symbol: f.symbol,
            side: f.side,
            qty: f.qty,
            price: f.price,
            fee: f.fee,
            ts: 0,
        }
    }
}

#[async_trait]
pub trait ExecutionVenue: Send + Sync {
    fn name(&self) -> &str;
    async fn place(&self, order: &OrderRequest) -> Result<VenueAck, ExecutionError>;
    async fn cancel(&self, order_id: &str) -> Result<(), ExecutionError>;
    /// Fills since the venue started; callers deduplicate by fill id.
    async fn fills(&self) -> Result<Vec<VenueFill>, ExecutionError>;
    async fn balances(&self) -> Result<BTreeMap<String, f64>, ExecutionError>;
    async fn positions(&self) -> Result<BTreeMap<String, f64>, ExecutionError>;
}

struct PaperBook {
    sim: ExecutionSimulator,
    fills: Vec<VenueFill>,
    positions: BTreeMap<String, f64>,
    cash: f64,
    seq: u64,
}

/// Simulator-backed venue for paper trading and adapter tests.
pub struct PaperVenue {
    book: Mutex<PaperBook>,
    ack_delay: Duration,
    reject_all: Option<String>,
}

impl PaperVenue {
    pub fn new(cfg: ExecConfig, cash: f64) -> Self {
        Self {
            book: Mutex::new(PaperBook {
                sim: ExecutionSimulator::new(cfg),
                fills: Vec::new(),
                positions: BTreeMap::new(),
                cash,
                seq: 0,
            }),
            ack_delay: Duration::ZERO,
            reject_all: None,
        }
    }

    /// Delay every acknowledgement, to exercise adapter timeouts.
    pub fn with_ack_delay(mut self, delay: Duration) -> Self {
        self.ack_delay = delay;
        self
    }

    /// Refuse every placement with `reason`.
    pub fn rejecting(mut self, reason: &str) -> Self {
        self.reject_all = Some(reason.to_string());
        self
    }

    /// Drive the simulator with a market tick.
    pub async fn on_tick(&self, ts: Timestamp, tick: &Tick) {
        let mut book = self.book.lock().await;
        let fills = book.sim.on_tick(tick);
        for f in fills {
            *book.positions.entry(f.symbol.clone()).or_insert(0.0) += f.signed_qty();
            book.cash -= f.signed_qty() * f.price + f.fee;
            let mut vf = VenueFill::from(f);
            vf.ts = ts;
            book.fills.push(vf);
        }
        book.positions.retain(|_, q| q.abs() > 1e-12);
    }
}

#[async_trait]
impl ExecutionVenue for PaperVenue {
    fn name(&self) -> &str {
        "paper"
    }

    async fn place(&self, order: &OrderRequest) -> Result<VenueAck, ExecutionError> {
        if !self.ack_delay.is_zero() {
            tokio::time::sleep(self.ack_delay).await;
        }
        if let Some(reason) = &self.reject_all {
            return Err(ExecutionError::Rejected { order_id: order.order_id.clone(), reason: reason.clone() });
        }
        let mut book = self.book.lock().await;
        book.seq += 1;
        book.sim.submit(order);
        Ok(VenueAck { order_id: order.order_id.clone(), venue_order_id: format!("paper-{}", book.seq) })
    }

    async fn cancel(&self, order_id: &str) -> Result<(), ExecutionError> {
        let mut book = self.book.lock().await;
        if book.sim.cancel(order_id) {
            Ok(())
        } else {
            Err(ExecutionError::UnknownOrder(order_id.to_string()))
        }
    }

    async fn fills(&self) -> Result<Vec<VenueFill>, ExecutionError> {
        Ok(self.book.lock().await.fills.clone())
    }

    async fn balances(&self) -> Result<BTreeMap<String, f64>, ExecutionError> {
        let mut out = BTreeMap::new();
        out.insert("cash".to_string(), self.book.lock().await.cash);
        Ok(out)
    }

    async fn positions(&self) -> Result<BTreeMap<String, f64>, ExecutionError> {
        Ok(self.book.lock().await.positions.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{OrderType, TickPhase};

    #[tokio::test]
    async fn paper_venue_fills_on_tick() {
        let venue = PaperVenue::new(ExecConfig::instant(), 1_000.0);
        let order = OrderRequest {
            order_id: "o".into(),
            symbol: "BTC".into(),
            side: Side::Buy,
            qty: 2.0,
            order_type: OrderType::Market,
            reduce_only: false,
        };
        let ack = venue.place(&order).await.unwrap();
        assert_eq!(ack.venue_order_id, "paper-1");
        let tick = Tick { symbol: "BTC".into(), price: 100.0, volume: 1.0, phase: TickPhase::Trade, bar: None };
        venue.on_tick(7, &tick).await;
        let fills = venue.fills().await.unwrap();
        assert_eq!(fills.len(), 1);
        assert_eq!(fills[0].ts, 7);
        assert_eq!(venue.positions().await.unwrap()["BTC"], 2.0);
        assert_eq!(venue.balances().await.unwrap()["cash"], 800.0);
        assert!(venue.cancel("o").await.is_err());
    }
}
