//! Order lifecycle.
//!
//! `open → partially_filled → filled | canceled | rejected`, plus `unknown`
//! for placements the venue never acknowledged. Terminal orders never
//! change again, fills are deduplicated by id, and an overfill is an error.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::ExecutionError;
use crate::events::{OrderRequest, Timestamp};

const QTY_EPS: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Open,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
    /// No acknowledgement within the timeout; awaiting reconciliation.
    Unknown,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Filled | OrderStatus::Canceled | OrderStatus::Rejected)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Open => "open",
            OrderStatus::PartiallyFilled => "partially_filled",
            OrderStatus::Filled => "filled",
            OrderStatus::Canceled => "canceled",
            OrderStatus::Rejected => "rejected",
            OrderStatus::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum OrderEvent {
    /// Venue accepted the order (also resolves `unknown`).
    Ack,
    Fill { fill_id: String, qty: f64, price: f64 },
    Cancel,
    Reject { reason: String },
    AckTimeout,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub request: OrderRequest,
    pub status: OrderStatus,
    pub filled_qty: f64,
    pub avg_fill_price: f64,
    pub created_ts: Timestamp,
    pub updated_ts: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip)]
    seen_fills: BTreeSet<String>,
}

impl Order {
    pub fn new(request: OrderRequest, ts: Timestamp) -> Self {
        Self {
            request,
            status: OrderStatus::Open,
            filled_qty: 0.0,
            avg_fill_price: 0.0,
            created_ts: ts,
            updated_ts: ts,
            reason: None,
            seen_fills: BTreeSet::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.request.order_id
    }

    pub fn remaining(&self) -> f64 {
        (self.request.qty - self.filled_qty).max(0.0)
    }

    /// Apply one lifecycle event. `Ok(false)` means it was a no-op
    /// (a duplicate fill or a repeated cancel).
    pub fn apply(&mut self, ts: Timestamp, event: OrderEvent) -> Result<bool, ExecutionError> {
        if let OrderEvent::Fill { fill_id, .. } = &event {
            if self.seen_fills.contains(fill_id) {
                return Ok(false);
            }
        }
        if self.status.is_terminal() {
            if matches!(event, OrderEvent::Cancel) && self.status == OrderStatus::Canceled {
                return Ok(false);
            }
            return Err(ExecutionError::Terminal(self.id().to_string()));
        }

        match event {
            OrderEvent::Ack => {
                if self.status == OrderStatus::Unknown {
                    self.status = if self.filled_qty > 0.0 { OrderStatus::PartiallyFilled } else { OrderStatus::Open };
                }
            }
            OrderEvent::Fill { fill_id, qty, price } => {
                if qty <= 0.0 || !qty.is_finite() {
                    return Ok(false);
                }
                if self.filled_qty + qty > self.request.qty + QTY_EPS {
                    return Err(ExecutionError::Overfill {
                        order_id: self.id().to_string(),
                        fill_id,
                        filled: self.filled_qty,
                        qty,
                        requested: self.request.qty,
                    });
                }
                let total = self.filled_qty + qty;
                self.avg_fill_price = (self.avg_fill_price * self.filled_qty + price * qty) / total;
                self.filled_qty = total;
                self.seen_fills.insert(fill_id);
                self.status = if self.remaining() <= QTY_EPS { OrderStatus::Filled } else { OrderStatus::PartiallyFilled };
            }
            OrderEvent::Cancel => self.status = OrderStatus::Canceled,
            OrderEvent::Reject { reason } => {
                self.status = OrderStatus::Rejected;
                self.reason = Some(reason);
            }
            OrderEvent::AckTimeout => self.status = OrderStatus::Unknown,
        }
        self.updated_ts = ts;
        Ok(true)
    }
}

/// All orders of one session, by id.
#[derive(Debug, Default)]
pub struct OrderBook {
    orders: BTreeMap<String, Order>,
}

impl OrderBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, order: Order) {
        self.orders.insert(order.id().to_string(), order);
    }

    pub fn get(&self, id: &str) -> Option<&Order> {
        self.orders.get(id)
    }

    pub fn apply(&mut self, id: &str, ts: Timestamp, event: OrderEvent) -> Result<bool, ExecutionError> {
        let order = self.orders.get_mut(id).ok_or_else(|| ExecutionError::UnknownOrder(id.to_string()))?;
        order.apply(ts, event)
    }

    pub fn live(&self) -> impl Iterator<Item = &Order> {
        self.orders.values().filter(|o| !o.status.is_terminal())
    }

    pub fn with_status(&self, status: OrderStatus) -> impl Iterator<Item = &Order> {
        self.orders.values().filter(move |o| o.status == status)
    }

    pub fn len(&self) -> usize {
        self.orders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{OrderType, Side};

    fn order(qty: f64) -> Order {
        Order::new(
            OrderRequest {
                order_id: "o-1".into(),
                symbol: "BTC".into(),
                side: Side::Buy,
                qty,
                order_type: OrderType::Market,
                reduce_only: false,
            },
            0,
        )
    }

    fn fill(id: &str, qty: f64, price: f64) -> OrderEvent {
        OrderEvent::Fill { fill_id: id.into(), qty, price }
    }

    #[test]
    fn partial_then_full() {
        let mut o = order(2.0);
        assert!(o.apply(1, fill("f1", 0.5, 100.0)).unwrap());
        assert_eq!(o.status, OrderStatus::PartiallyFilled);
        assert!(o.apply(2, fill("f2", 1.5, 104.0)).unwrap());
        assert_eq!(o.status, OrderStatus::Filled);
        assert!((o.avg_fill_price - 103.0).abs() < 1e-12);
    }

    #[test]
    fn duplicate_fills_are_ignored() {
        let mut o = order(2.0);
        o.apply(1, fill("f1", 1.0, 100.0)).unwrap();
        assert!(!o.apply(2, fill("f1", 1.0, 100.0)).unwrap());
        assert_eq!(o.filled_qty, 1.0);
    }

    #[test]
    fn overfill_is_an_error() {
        let mut o = order(1.0);
        o.apply(1, fill("f1", 0.8, 100.0)).unwrap();
        let err = o.apply(2, fill("f2", 0.5, 100.0)).unwrap_err();
        assert!(matches!(err, ExecutionError::Overfill { .. }));
        assert_eq!(o.filled_qty, 0.8);
    }

    #[test]
    fn terminal_states_are_immutable() {
        let mut o = order(1.0);
        o.apply(1, OrderEvent::Reject { reason: "no".into() }).unwrap();
        assert!(matches!(o.apply(2, fill("f", 1.0, 1.0)), Err(ExecutionError::Terminal(_))));
        assert!(matches!(o.apply(2, OrderEvent::Ack), Err(ExecutionError::Terminal(_))));
        assert_eq!(o.status, OrderStatus::Rejected);
    }

    #[test]
    fn timeout_goes_unknown_and_ack_resolves() {
        let mut o = order(1.0);
        o.apply(1, OrderEvent::AckTimeout).unwrap();
        assert_eq!(o.status, OrderStatus::Unknown);
        assert!(!o.status.is_terminal());
        o.apply(2, OrderEvent::Ack).unwrap();
        assert_eq!(o.status, OrderStatus::Open);
    }

    #[test]
    fn book_routes_by_id() {
        let mut book = OrderBook::new();
        book.insert(order(1.0));
        book.apply("o-1", 1, OrderEvent::Cancel).unwrap();
        assert_eq!(book.live().count(), 0);
        assert!(matches!(book.apply("nope", 1, OrderEvent::Cancel), Err(ExecutionError::UnknownOrder(_))));
    }
}
