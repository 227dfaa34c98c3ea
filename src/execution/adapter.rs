//! Live execution: forwards orders to a venue and turns venue fills into
//! the same `Fill` events the simulator produces.
//!
//! Placement is awaited under `ack_timeout`. A placement that times out is
//! marked `unknown` and raised for manual reconciliation; it is never
//! re-sent.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use crate::error::ExecutionError;
use crate::events::{AlertKind, AlertLevel, Fill, FillStatus, OrderRequest, RiskAlert, Timestamp};
use crate::logging::{log, obj, v_num, v_str, Domain, Level};
use crate::order::{Order, OrderBook, OrderEvent, OrderStatus};

use super::retry::{CallKind, RetryPolicy};
use super::venue::{ExecutionVenue, VenueFill};

#[derive(Debug, Clone, PartialEq)]
pub enum Placement {
    Acked { venue_order_id: String },
    /// Venue refused; carries the rejected fill for the bus.
    Rejected(Fill),
    /// No acknowledgement in time; carries the reconciliation alert.
    Unknown(RiskAlert),
}

pub struct ExecutionAdapter {
    venue: Arc<dyn ExecutionVenue>,
    retry: RetryPolicy,
    ack_timeout: Duration,
    orders: OrderBook,
    seen_fills: BTreeSet<String>,
}

impl ExecutionAdapter {
    pub fn new(venue: Arc<dyn ExecutionVenue>, retry: RetryPolicy, ack_timeout: Duration) -> Self {
        Self { venue, retry, ack_timeout, orders: OrderBook::new(), seen_fills: BTreeSet::new() }
    }

    pub fn orders(&self) -> &OrderBook {
        &self.orders
    }

    /// Apply a placement outcome to the book. A refused transition leaves
    /// the order as it was and is logged.
    fn transition(&mut self, order_id: &str, ts: Timestamp, event: OrderEvent) -> bool {
        let name = format!("{event:?}");
        match self.orders.apply(order_id, ts, event) {
            Ok(applied) => applied,
            Err(e) => {
                log(
                    Level::Warn,
                    Domain::Exec,
                    "order_transition_refused",
                    obj(&[("order_id", v_str(order_id)), ("event", v_str(&name)), ("error", v_str(&e.to_string()))]),
                );
                false
            }
        }
    }

    pub async fn place(&mut self, ts: Timestamp, order: &OrderRequest) -> Placement {
        self.orders.insert(Order::new(order.clone(), ts));
        let venue = self.venue.clone();
        let call = self.retry.run(CallKind::Write, "place", || venue.place(order));

        match tokio::time::timeout(self.ack_timeout, call).await {
            Ok(Ok(ack)) => {
                log(
                    Level::Info,
                    Domain::Exec,
                    "order_acked",
                    obj(&[("order_id", v_str(&order.order_id)), ("venue_order_id", v_str(&ack.venue_order_id))]),
                );
                self.transition(&order.order_id, ts, OrderEvent::Ack);
                Placement::Acked { venue_order_id: ack.venue_order_id }
            }
            Ok(Err(e)) => {
                let reason = match &e {
                    ExecutionError::Rejected { reason, .. } => reason.clone(),
                    other => other.to_string(),
                };
                log(
                    Level::Warn,
                    Domain::Exec,
                    "order_rejected",
                    obj(&[("order_id", v_str(&order.order_id)), ("reason", v_str(&reason))]),
                );
                self.transition(&order.order_id, ts, OrderEvent::Reject { reason: reason.clone() });
                Placement::Rejected(Fill::rejected(order, reason))
            }
            Err(_) => {
                let timeout_ms = self.ack_timeout.as_millis() as u64;
                log(
                    Level::Error,
                    Domain::Exec,
                    "ack_timeout",
                    obj(&[("order_id", v_str(&order.order_id)), ("timeout_ms", v_num(timeout_ms as f64))]),
                );
                self.transition(&order.order_id, ts, OrderEvent::AckTimeout);
                let err = ExecutionError::AckTimeout { order_id: order.order_id.clone(), timeout_ms };
                Placement::Unknown(RiskAlert {
                    level: AlertLevel::Critical,
                    kind: AlertKind::ManualReconciliation { order_id: order.order_id.clone() },
                    reasons: vec!["ack_timeout".to_string()],
                    equity: 0.0,
                    message: err.to_string(),
                })
            }
        }
    }

    pub async fn cancel(&mut self, ts: Timestamp, order_id: &str) -> Result<(), ExecutionError> {
        let venue = self.venue.clone();
        self.retry.run(CallKind::Write, "cancel", || venue.cancel(order_id)).await?;
        self.orders.apply(order_id, ts, OrderEvent::Cancel).map(|_| ())
    }

    /// New venue fills as bus fills. Duplicates and fills for orders this
    /// adapter never placed are dropped; an overfill is reported and skipped.
    pub async fn poll_fills(&mut self, ts: Timestamp) -> Result<Vec<Fill>, ExecutionError> {
        let venue = self.venue.clone();
        let raw = self.retry.run(CallKind::Read, "fills", || venue.fills()).await?;
        let mut out = Vec::new();
        for vf in raw {
            if self.seen_fills.contains(&vf.fill_id) {
                continue;
            }
            match self.reconcile(ts, &vf) {
                Ok(Some(fill)) => {
                    self.seen_fills.insert(vf.fill_id.clone());
                    out.push(fill);
                }
                Ok(None) => {
                    self.seen_fills.insert(vf.fill_id.clone());
                }
                Err(e) => {
                    log(Level::Error, Domain::Exec, "fill_rejected", obj(&[("fill_id", v_str(&vf.fill_id)), ("error", v_str(&e.to_string()))]));
                    self.seen_fills.insert(vf.fill_id.clone());
                }
            }
        }
        Ok(out)
    }

    fn reconcile(&mut self, ts: Timestamp, vf: &VenueFill) -> Result<Option<Fill>, ExecutionError> {
        let Some(order) = self.orders.get(&vf.order_id) else {
            return Ok(None);
        };
        let reduce_only = order.request.reduce_only;
        let applied = self.orders.apply(
            &vf.order_id,
            ts,
            OrderEvent::Fill { fill_id: vf.fill_id.clone(), qty: vf.qty, price: vf.price },
        )?;
        if !applied {
            return Ok(None);
        }
        Ok(Some(Fill {
            fill_id: vf.fill_id.clone(),
            order_id: vf.order_id.clone(),
            symbol: vf.symbol.clone(),
            side: vf.side,
            qty: vf.qty,
            price: vf.price,
            fee: vf.fee,
            status: FillStatus::Executed,
            reason: None,
            reduce_only,
        }))
    }

    pub async fn positions(&self) -> Result<std::collections::BTreeMap<String, f64>, ExecutionError> {
        let venue = self.venue.clone();
        self.retry.run(CallKind::Read, "positions", || venue.positions()).await
    }

    pub async fn balances(&self) -> Result<std::collections::BTreeMap<String, f64>, ExecutionError> {
        let venue = self.venue.clone();
        self.retry.run(CallKind::Read, "balances", || venue.balances()).await
    }

    pub fn unknown_orders(&self) -> Vec<String> {
        self.orders.with_status(OrderStatus::Unknown).map(|o| o.id().to_string()).collect()
    }
}
