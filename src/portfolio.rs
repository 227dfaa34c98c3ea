//! Portfolio accounting.
//!
//! Positions carry a volume-weighted entry price. Realized PnL comes only
//! from the closing part of a fill; a fill that flips the position opens
//! the remainder at the fill price. At every step
//! `cash + Σ qty·mark == initial + realized + unrealized − fees`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::events::{Envelope, Event, Fill, Side, Timestamp};
use crate::logging::log_fill;

const QTY_EPS: f64 = 1e-9;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    /// Signed.
    pub qty: f64,
    pub avg_entry: f64,
    pub realized_pnl: f64,
    pub last_mark: f64,
    pub opened_ts: Timestamp,
    /// Fees paid on the still-open quantity, released pro rata on close.
    pub open_fees: f64,
}

impl Position {
    pub fn unrealized(&self) -> f64 {
        self.qty * (self.last_mark - self.avg_entry)
    }

    pub fn market_value(&self) -> f64 {
        self.qty * self.last_mark
    }
}

/// One round trip (or the closed part of one).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub symbol: String,
    /// Direction of the position that was closed.
    pub side: Side,
    pub entry_ts: Timestamp,
    pub exit_ts: Timestamp,
    pub qty: f64,
    pub entry_price: f64,
    pub exit_price: f64,
    /// Net of the entry and exit fees attributable to `qty`.
    pub pnl: f64,
    pub fees: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EquityPoint {
    pub ts: Timestamp,
    pub equity: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FillOutcome {
    pub realized: f64,
    pub closed_qty: f64,
    pub trade: Option<TradeRecord>,
}

/// State that must survive a replay bit for bit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioSnapshot {
    pub cash: f64,
    pub positions: BTreeMap<String, Position>,
    pub realized_pnl: f64,
    pub fees: f64,
    pub equity: f64,
    pub trades: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Portfolio {
    pub initial_capital: f64,
    pub cash: f64,
    pub positions: BTreeMap<String, Position>,
    pub equity_curve: Vec<EquityPoint>,
    pub peak_equity: f64,
    pub realized_pnl: f64,
    pub fees: f64,
    pub trades: Vec<TradeRecord>,
    marks: BTreeMap<String, f64>,
}

impl Portfolio {
    pub fn new(initial_capital: f64) -> Self {
        Self {
            initial_capital,
            cash: initial_capital,
            positions: BTreeMap::new(),
            equity_curve: Vec::new(),
            peak_equity: initial_capital,
            realized_pnl: 0.0,
            fees: 0.0,
            trades: Vec::new(),
            marks: BTreeMap::new(),
        }
    }

    pub fn position_qty(&self, symbol: &str) -> f64 {
        self.positions.get(symbol).map_or(0.0, |p| p.qty)
    }

    pub fn position(&self, symbol: &str) -> Option<&Position> {
        self.positions.get(symbol)
    }

    pub fn mark_price(&self, symbol: &str) -> Option<f64> {
        self.marks.get(symbol).copied()
    }

    pub fn unrealized(&self) -> f64 {
        self.positions.values().map(Position::unrealized).sum()
    }

    pub fn equity(&self) -> f64 {
        self.cash + self.positions.values().map(Position::market_value).sum::<f64>()
    }

    pub fn drawdown(&self) -> f64 {
        if self.peak_equity > 0.0 {
            (self.peak_equity - self.equity()).max(0.0) / self.peak_equity
        } else {
            0.0
        }
    }

    /// Open positions as `(symbol, signed qty)`.
    pub fn open_positions(&self) -> Vec<(String, f64)> {
        self.positions.values().map(|p| (p.symbol.clone(), p.qty)).collect()
    }

    /// Gap between the two sides of the accounting identity.
    pub fn conservation_error(&self) -> f64 {
        let lhs = self.equity();
        let rhs = self.initial_capital + self.realized_pnl + self.unrealized() - self.fees;
        (lhs - rhs).abs()
    }

    pub fn mark(&mut self, symbol: &str, price: f64) {
        self.marks.insert(symbol.to_string(), price);
        if let Some(p) = self.positions.get_mut(symbol) {
            p.last_mark = price;
        }
    }

    /// Append `(ts, equity)`, replacing the last point if it has the same ts.
    pub fn record_equity(&mut self, ts: Timestamp) -> f64 {
        let equity = self.equity();
        if equity > self.peak_equity {
            self.peak_equity = equity;
        }
        match self.equity_curve.last_mut() {
            Some(last) if last.ts == ts => last.equity = equity,
            _ => self.equity_curve.push(EquityPoint { ts, equity }),
        }
        equity
    }

    /// Apply an executed fill. Rejected or empty fills change nothing.
    pub fn apply_fill(&mut self, ts: Timestamp, fill: &Fill) -> FillOutcome {
        if !fill.is_executed() {
            return FillOutcome::default();
        }
        let signed = fill.signed_qty();
        let price = fill.price;
        self.cash -= signed * price + fill.fee;
        self.fees += fill.fee;
        self.marks.insert(fill.symbol.clone(), price);

        let pos = self.positions.entry(fill.symbol.clone()).or_insert_with(|| Position {
            symbol: fill.symbol.clone(),
            qty: 0.0,
            avg_entry: price,
            realized_pnl: 0.0,
            last_mark: price,
            opened_ts: ts,
            open_fees: 0.0,
        });
        pos.last_mark = price;

        let prev = pos.qty;
        let mut outcome = FillOutcome::default();

        if prev.abs() <= QTY_EPS || prev.signum() == signed.signum() {
            let total = prev.abs() + signed.abs();
            pos.avg_entry = (pos.avg_entry * prev.abs() + price * signed.abs()) / total;
            if prev.abs() <= QTY_EPS {
                pos.opened_ts = ts;
            }
            pos.qty = prev + signed;
            pos.open_fees += fill.fee;
        } else {
            let close_qty = signed.abs().min(prev.abs());
            let realized = (price - pos.avg_entry) * close_qty * prev.signum();
            let exit_fee = fill.fee * close_qty / signed.abs();
            let entry_fee = pos.open_fees * close_qty / prev.abs();
            pos.open_fees -= entry_fee;
            pos.realized_pnl += realized;
            pos.qty = prev + signed;

            let trade = TradeRecord {
                symbol: fill.symbol.clone(),
                side: if prev > 0.0 { Side::Buy } else { Side::Sell },
                entry_ts: pos.opened_ts,
                exit_ts: ts,
                qty: close_qty,
                entry_price: pos.avg_entry,
                exit_price: price,
                pnl: realized - entry_fee - exit_fee,
                fees: entry_fee + exit_fee,
            };

            if pos.qty.abs() > QTY_EPS && pos.qty.signum() != prev.signum() {
                // Flipped: the remainder opens fresh at the fill price.
                pos.avg_entry = price;
                pos.opened_ts = ts;
                pos.open_fees = fill.fee - exit_fee;
            }
            self.realized_pnl += realized;
            self.trades.push(trade.clone());
            outcome = FillOutcome { realized, closed_qty: close_qty, trade: Some(trade) };
        }

        if pos.qty.abs() <= QTY_EPS {
            // Closing out: sweep float dust into cash so the identity holds.
            let dust = pos.qty;
            self.cash += dust * price;
            self.positions.remove(&fill.symbol);
        }

        log_fill(&fill.order_id, &fill.symbol, price, signed, fill.fee, outcome.realized);
        outcome
    }

    pub fn snapshot(&self) -> PortfolioSnapshot {
        PortfolioSnapshot {
            cash: self.cash,
            positions: self.positions.clone(),
            realized_pnl: self.realized_pnl,
            fees: self.fees,
            equity: self.equity(),
            trades: self.trades.len(),
        }
    }

    /// Rebuild a portfolio from an event log: ticks mark, fills apply.
    pub fn replay(initial_capital: f64, log: &[Envelope]) -> Portfolio {
        let mut p = Portfolio::new(initial_capital);
        for env in log {
            match &env.event {
                Event::Tick(t) => p.mark(&t.symbol, t.price),
                Event::Fill(f) => {
                    p.apply_fill(env.ts, f);
                }
                _ => {}
            }
        }
        p
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::FillStatus;

    fn fill(id: &str, side: Side, qty: f64, price: f64, fee: f64) -> Fill {
        Fill {
            fill_id: id.into(),
            order_id: id.into(),
            symbol: "BTC".into(),
            side,
            qty,
            price,
            fee,
            status: FillStatus::Executed,
            reason: None,
            reduce_only: false,
        }
    }

    #[test]
    fn vwap_entry_and_partial_close() {
        let mut p = Portfolio::new(10_000.0);
        p.apply_fill(1, &fill("a", Side::Buy, 1.0, 100.0, 0.0));
        p.apply_fill(2, &fill("b", Side::Buy, 1.0, 110.0, 0.0));
        assert!((p.position("BTC").unwrap().avg_entry - 105.0).abs() < 1e-12);

        let out = p.apply_fill(3, &fill("c", Side::Sell, 1.5, 120.0, 0.0));
        assert!((out.realized - 22.5).abs() < 1e-12);
        let pos = p.position("BTC").unwrap();
        assert!((pos.qty - 0.5).abs() < 1e-12);
        assert!((pos.avg_entry - 105.0).abs() < 1e-12);
        assert!(p.conservation_error() < 1e-9);
    }

    #[test]
    fn flip_reopens_at_fill_price() {
        let mut p = Portfolio::new(10_000.0);
        p.apply_fill(1, &fill("a", Side::Buy, 1.0, 100.0, 1.0));
        let out = p.apply_fill(2, &fill("b", Side::Sell, 3.0, 90.0, 3.0));
        assert!((out.realized + 10.0).abs() < 1e-12);
        let trade = out.trade.unwrap();
        // Entry fee 1 plus a third of the exit fee.
        assert!((trade.fees - 2.0).abs() < 1e-12);
        assert!((trade.pnl + 12.0).abs() < 1e-12);
        let pos = p.position("BTC").unwrap();
        assert!((pos.qty + 2.0).abs() < 1e-12);
        assert_eq!(pos.avg_entry, 90.0);
        assert!((pos.open_fees - 2.0).abs() < 1e-12);
        assert!(p.conservation_error() < 1e-9);
    }

    #[test]
    fn closing_removes_position() {
        let mut p = Portfolio::new(1_000.0);
        p.apply_fill(1, &fill("a", Side::Sell, 2.0, 50.0, 0.5));
        p.mark("BTC", 40.0);
        assert!((p.unrealized() - 20.0).abs() < 1e-12);
        p.apply_fill(2, &fill("b", Side::Buy, 2.0, 40.0, 0.5));
        assert!(p.position("BTC").is_none());
        assert!((p.realized_pnl - 20.0).abs() < 1e-12);
        assert!((p.equity() - 1_019.0).abs() < 1e-9);
        assert_eq!(p.trades.len(), 1);
        assert!((p.trades[0].pnl - 19.0).abs() < 1e-12);
    }

    #[test]
    fn rejected_fills_change_nothing() {
        let mut p = Portfolio::new(1_000.0);
        let mut f = fill("a", Side::Buy, 1.0, 10.0, 0.0);
        f.status = FillStatus::Rejected;
        p.apply_fill(1, &f);
        assert_eq!(p.cash, 1_000.0);
        assert!(p.positions.is_empty());
    }

    #[test]
    fn equity_curve_keeps_one_point_per_ts() {
        let mut p = Portfolio::new(100.0);
        p.record_equity(1);
        p.record_equity(1);
        p.record_equity(2);
        assert_eq!(p.equity_curve.len(), 2);
    }

    #[test]
    fn replay_reproduces_state() {
        let mut p = Portfolio::new(5_000.0);
        let events = vec![
            Envelope { seq: 1, ts: 1, event: Event::Fill(fill("a", Side::Buy, 2.0, 100.0, 0.2)) },
            Envelope {
                seq: 2,
                ts: 2,
                event: Event::Tick(crate::events::Tick {
                    symbol: "BTC".into(),
                    price: 101.0,
                    volume: 1.0,
                    phase: crate::events::TickPhase::Trade,
                    bar: None,
                }),
            },
            Envelope { seq: 3, ts: 3, event: Event::Fill(fill("b", Side::Sell, 1.0, 102.0, 0.1)) },
        ];
        p.apply_fill(1, &fill("a", Side::Buy, 2.0, 100.0, 0.2));
        p.mark("BTC", 101.0);
        p.apply_fill(3, &fill("b", Side::Sell, 1.0, 102.0, 0.1));
        assert_eq!(Portfolio::replay(5_000.0, &events).snapshot(), p.snapshot());
    }
}
