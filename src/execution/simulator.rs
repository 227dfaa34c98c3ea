//! Backtest fills.
//!
//! Market impact is square-root in participation plus a fixed half spread,
//! both as price fractions. An order larger than `max_participation` of a
//! tick's volume fills partially and the rest waits for later ticks.
//! Orders never fill on the tick that produced them.

use std::collections::BTreeMap;

use crate::config::env_or;
use crate::events::{Fill, FillStatus, OrderRequest, OrderType, Side, Tick};
use crate::indicators::ReturnVol;
use crate::logging::{log, obj, v_num, v_str, Domain, Level};

#[derive(Debug, Clone, PartialEq)]
pub struct ExecConfig {
    pub fee_rate: f64,
    pub half_spread: f64,
    pub impact_k: f64,
    /// Max share of a tick's volume one order may take. Infinite disables
    /// the volume constraint.
    pub max_participation: f64,
    /// Extra ticks an order waits before it may fill.
    pub latency_ticks: u32,
    pub vol_window: usize,
    /// Cap on total impact.
    pub max_impact: f64,
    /// Live adapter acknowledgement budget.
    pub ack_timeout_ms: u64,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self::taker()
    }
}

impl ExecConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            fee_rate: env_or("FEE_RATE", d.fee_rate),
            half_spread: env_or("HALF_SPREAD", d.half_spread),
            impact_k: env_or("IMPACT_K", d.impact_k),
            max_participation: env_or("MAX_PARTICIPATION", d.max_participation),
            latency_ticks: env_or("LATENCY_TICKS", d.latency_ticks),
            vol_window: env_or("EXEC_VOL_WINDOW", d.vol_window),
            max_impact: env_or("MAX_IMPACT", d.max_impact),
            ack_timeout_ms: env_or("ACK_TIMEOUT_MS", d.ack_timeout_ms),
        }
    }

    /// No costs, no volume constraint (for fast testing)
    pub fn instant() -> Self {
        Self {
            fee_rate: 0.0,
            half_spread: 0.0,
            impact_k: 0.0,
            max_participation: f64::INFINITY,
            latency_ticks: 0,
            vol_window: 20,
            max_impact: 0.0,
            ack_timeout_ms: 2_000,
        }
    }

    /// Market orders, taker fees
    pub fn taker() -> Self {
        Self {
            fee_rate: 0.001,
            half_spread: 0.0002,
            impact_k: 0.1,
            max_participation: 0.1,
            latency_ticks: 0,
            vol_window: 50,
            max_impact: 0.05,
            ack_timeout_ms: 2_000,
        }
    }

    /// Impact as a price fraction for `qty` against `volume`.
    pub fn impact(&self, qty: f64, volume: f64, sigma: f64) -> f64 {
        let size = if self.impact_k > 0.0 && volume > 0.0 { self.impact_k * sigma * (qty / volume).sqrt() } else { 0.0 };
        (self.half_spread + size).min(self.max_impact.max(self.half_spread))
    }
}

#[derive(Debug, Clone)]
struct Resting {
    order: OrderRequest,
    remaining: f64,
    wait_ticks: u32,
    fills: u32,
}

pub struct ExecutionSimulator {
    cfg: ExecConfig,
    resting: Vec<Resting>,
    vol: BTreeMap<String, ReturnVol>,
}

impl ExecutionSimulator {
    pub fn new(cfg: ExecConfig) -> Self {
        Self { cfg, resting: Vec::new(), vol: BTreeMap::new() }
    }

    pub fn config(&self) -> &ExecConfig {
        &self.cfg
    }

    pub fn submit(&mut self, order: &OrderRequest) {
        self.resting.push(Resting {
            order: order.clone(),
            remaining: order.qty,
            wait_ticks: self.cfg.latency_ticks,
            fills: 0,
        });
    }

    pub fn resting(&self) -> usize {
        self.resting.len()
    }

    pub fn resting_qty(&self, order_id: &str) -> Option<f64> {
        self.resting.iter().find(|r| r.order.order_id == order_id).map(|r| r.remaining)
    }

    /// Signed quantity still waiting to fill for `symbol`.
    pub fn resting_signed(&self, symbol: &str) -> f64 {
        self.resting.iter().filter(|r| r.order.symbol == symbol).map(|r| r.order.side.sign() * r.remaining).sum()
    }

    pub fn cancel(&mut self, order_id: &str) -> bool {
        let before = self.resting.len();
        self.resting.retain(|r| r.order.order_id != order_id);
        before != self.resting.len()
    }

    pub fn cancel_all(&mut self) -> Vec<String> {
        self.resting.drain(..).map(|r| r.order.order_id).collect()
    }

    /// Cancel everything except reduce-only orders. Returns canceled ids.
    pub fn cancel_opening(&mut self) -> Vec<String> {
        let mut canceled = Vec::new();
        self.resting.retain(|r| {
            if r.order.reduce_only {
                true
            } else {
                canceled.push(r.order.order_id.clone());
                false
            }
        });
        canceled
    }

    /// Close `order` in one piece at `price`, paying spread and fees but no
    /// volume constraint. Used to liquidate at the end of the data.
    pub fn liquidation_fill(&self, order: &OrderRequest, price: f64) -> Fill {
        let price = price * (1.0 + order.side.sign() * self.cfg.half_spread);
        Fill {
            fill_id: format!("{}-f1", order.order_id),
            order_id: order.order_id.clone(),
            symbol: order.symbol.clone(),
            side: order.side,
            qty: order.qty,
            price,
            fee: self.cfg.fee_rate * order.qty * price,
            status: FillStatus::Executed,
            reason: None,
            reduce_only: order.reduce_only,
        }
    }

    /// Match resting orders for `tick.symbol` in submission order.
    pub fn on_tick(&mut self, tick: &Tick) -> Vec<Fill> {
        let window = self.cfg.vol_window;
        let vol = self.vol.entry(tick.symbol.clone()).or_insert_with(|| ReturnVol::new(window));
        vol.update(tick.price);
        let sigma = vol.get();

        let unlimited = self.cfg.max_participation.is_infinite();
        let mut available = if unlimited { f64::INFINITY } else { self.cfg.max_participation * tick.volume };
        let mut fills = Vec::new();

        for r in self.resting.iter_mut().filter(|r| r.order.symbol == tick.symbol) {
            if r.wait_ticks > 0 {
                r.wait_ticks -= 1;
                continue;
            }
            if available <= 0.0 {
                break;
            }
            let qty = r.remaining.min(available);
            let impact = self.cfg.impact(qty, tick.volume, sigma);
            let price = tick.price * (1.0 + r.order.side.sign() * impact);
            if let OrderType::Limit { price: limit } = r.order.order_type {
                let crosses = match r.order.side {
                    Side::Buy => price <= limit,
                    Side::Sell => price >= limit,
                };
                if !crosses {
                    continue;
                }
            }
            available -= qty;
            r.remaining -= qty;
            r.fills += 1;
            let fee = self.cfg.fee_rate * qty * price;
            log(
                Level::Debug,
                Domain::Exec,
                "sim_fill",
                obj(&[
                    ("order_id", v_str(&r.order.order_id)),
                    ("qty", v_num(qty)),
                    ("price", v_num(price)),
                    ("impact", v_num(impact)),
                    ("remaining", v_num(r.remaining)),
                ]),
            );
            fills.push(Fill {
                fill_id: format!("{}-f{}", r.order.order_id, r.fills),
                order_id: r.order.order_id.clone(),
                symbol: r.order.symbol.clone(),
                side: r.order.side,
                qty,
                price,
                fee,
                status: FillStatus::Executed,
                reason: None,
                reduce_only: r.order.reduce_only,
            });
        }
        self.resting.retain(|r| r.remaining > 1e-12);
        fills
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::TickPhase;

    fn tick(price: f64, volume: f64) -> Tick {
        Tick { symbol: "BTC".into(), price, volume, phase: TickPhase::Trade, bar: None }
    }

    fn market(id: &str, side: Side, qty: f64) -> OrderRequest {
        OrderRequest {
            order_id: id.into(),
            symbol: "BTC".into(),
            side,
            qty,
            order_type: OrderType::Market,
            reduce_only: false,
        }
    }

    #[test]
    fn instant_fills_on_next_tick_at_price() {
        let mut sim = ExecutionSimulator::new(ExecConfig::instant());
        sim.submit(&market("o", Side::Buy, 2.0));
        let fills = sim.on_tick(&tick(100.0, 0.0));
        assert_eq!(fills.len(), 1);
        assert_eq!(fills[0].price, 100.0);
        assert_eq!(fills[0].qty, 2.0);
        assert_eq!(fills[0].fee, 0.0);
        assert_eq!(sim.resting(), 0);
    }

    #[test]
    fn partial_fills_rest_until_volume_arrives() {
        let cfg = ExecConfig { max_participation: 0.1, impact_k: 0.0, half_spread: 0.0, ..ExecConfig::taker() };
        let mut sim = ExecutionSimulator::new(cfg);
        sim.submit(&market("o", Side::Buy, 3.0));
        let f1 = sim.on_tick(&tick(100.0, 20.0));
        assert!((f1[0].qty - 2.0).abs() < 1e-12);
        assert_eq!(sim.resting_qty("o"), Some(1.0));
        let f2 = sim.on_tick(&tick(101.0, 20.0));
        assert!((f2[0].qty - 1.0).abs() < 1e-12);
        assert_eq!(f2[0].fill_id, "o-f2");
        assert_eq!(sim.resting(), 0);
    }

    #[test]
    fn impact_grows_with_size_and_direction() {
        let cfg = ExecConfig::taker();
        let small = cfg.impact(1.0, 100.0, 0.01);
        let large = cfg.impact(25.0, 100.0, 0.01);
        assert!(large > small);
        assert!((small - (0.0002 + 0.1 * 0.01 * 0.1)).abs() < 1e-12);

        let mut sim = ExecutionSimulator::new(ExecConfig { max_participation: f64::INFINITY, ..cfg });
        sim.submit(&market("s", Side::Sell, 1.0));
        let f = sim.on_tick(&tick(100.0, 10.0));
        assert!(f[0].price < 100.0);
        assert!((f[0].fee - 0.001 * f[0].price).abs() < 1e-9);
    }

    #[test]
    fn latency_delays_fills() {
        let mut sim = ExecutionSimulator::new(ExecConfig { latency_ticks: 2, ..ExecConfig::instant() });
        sim.submit(&market("o", Side::Buy, 1.0));
        assert!(sim.on_tick(&tick(100.0, 1.0)).is_empty());
        assert!(sim.on_tick(&tick(100.0, 1.0)).is_empty());
        assert_eq!(sim.on_tick(&tick(100.0, 1.0)).len(), 1);
    }

    #[test]
    fn limit_orders_wait_for_price() {
        let mut sim = ExecutionSimulator::new(ExecConfig::instant());
        let mut o = market("l", Side::Buy, 1.0);
        o.order_type = OrderType::Limit { price: 95.0 };
        sim.submit(&o);
        assert!(sim.on_tick(&tick(100.0, 1.0)).is_empty());
        assert_eq!(sim.on_tick(&tick(94.0, 1.0))[0].price, 94.0);
    }

    #[test]
    fn cancel_opening_keeps_reduce_only() {
        let mut sim = ExecutionSimulator::new(ExecConfig::instant());
        sim.submit(&market("a", Side::Buy, 1.0));
        let mut flat = market("b", Side::Sell, 1.0);
        flat.reduce_only = true;
        sim.submit(&flat);
        assert_eq!(sim.resting_signed("BTC"), 0.0);
        assert_eq!(sim.cancel_opening(), vec!["a".to_string()]);
        assert_eq!(sim.resting(), 1);
        assert_eq!(sim.resting_signed("BTC"), -1.0);
    }

    #[test]
    fn liquidation_pays_spread_and_fee() {
        let sim = ExecutionSimulator::new(ExecConfig::taker());
        let mut close = market("x", Side::Sell, 2.0);
        close.reduce_only = true;
        let f = sim.liquidation_fill(&close, 100.0);
        assert!((f.price - 99.98).abs() < 1e-9);
        assert!((f.fee - 0.001 * 2.0 * f.price).abs() < 1e-12);
        assert!(f.reduce_only);
    }
}
