//! Pre-trade checks and the kill-switch state machine.
//!
//! Everything here is synchronous and reads only the state passed in, so a
//! rejection is immediate and replays identically. `Killed` is sticky: only
//! `reset()` leaves it.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::config::{env_flag, env_or};
use crate::error::ValidationError;
use crate::events::{AlertKind, AlertLevel, OrderRequest, OrderType, RiskAlert, Side, Timestamp};
use crate::indicators::ReturnVol;
use crate::logging::{log, log_order_decision, log_risk_transition, obj, v_num, v_str, Domain, Level};

const DAY_MS: u64 = 86_400_000;

/// Alert message carried by the transition into `Killed`.
pub const KILLSWITCH_TRIGGERED: &str = "killswitch.triggered";

// =============================================================================
// Limits
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskLimits {
    /// Currency, measured from the equity at the start of the UTC day.
    pub max_daily_loss: f64,
    /// Currency, from the start of the UTC week (Monday).
    pub max_weekly_loss: f64,
    /// Absolute quantity per symbol.
    pub max_position_size: f64,
    /// Position notional over equity.
    pub max_concentration: f64,
    /// Fraction of peak equity.
    pub max_drawdown: f64,
    pub max_orders_per_window: usize,
    pub order_window_ms: u64,
    pub max_consecutive_losses: u32,
    /// A bar return larger than this many standard deviations kills.
    pub volatility_spike_mult: f64,
    pub volatility_window: usize,
    pub warning_fraction: f64,
    /// Size scale applied while in `Warning`.
    pub warning_size_factor: f64,
    pub auto_flatten: bool,
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            max_daily_loss: 5_000.0,
            max_weekly_loss: 10_000.0,
            max_position_size: 1_000.0,
            max_concentration: 0.5,
            max_drawdown: 0.2,
            max_orders_per_window: 60,
            order_window_ms: 60_000,
            max_consecutive_losses: 8,
            volatility_spike_mult: 8.0,
            volatility_window: 50,
            warning_fraction: 0.7,
            warning_size_factor: 0.5,
            auto_flatten: false,
        }
    }
}

impl RiskLimits {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            max_daily_loss: env_or("RISK_MAX_DAILY_LOSS", d.max_daily_loss),
            max_weekly_loss: env_or("RISK_MAX_WEEKLY_LOSS", d.max_weekly_loss),
            max_position_size: env_or("RISK_MAX_POSITION", d.max_position_size),
            max_concentration: env_or("RISK_MAX_CONCENTRATION", d.max_concentration),
            max_drawdown: env_or("RISK_MAX_DRAWDOWN", d.max_drawdown),
            max_orders_per_window: env_or("RISK_MAX_ORDERS", d.max_orders_per_window),
            order_window_ms: env_or("RISK_ORDER_WINDOW_MS", d.order_window_ms),
            max_consecutive_losses: env_or("RISK_MAX_CONSEC_LOSSES", d.max_consecutive_losses),
            volatility_spike_mult: env_or("RISK_VOL_SPIKE_MULT", d.volatility_spike_mult),
            volatility_window: env_or("RISK_VOL_WINDOW", d.volatility_window),
            warning_fraction: env_or("RISK_WARNING_FRACTION", d.warning_fraction),
            warning_size_factor: env_or("RISK_WARNING_SIZE_FACTOR", d.warning_size_factor),
            auto_flatten: env_flag("RISK_AUTO_FLATTEN", d.auto_flatten),
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        let positive = [
            ("max_daily_loss", self.max_daily_loss),
            ("max_weekly_loss", self.max_weekly_loss),
            ("max_position_size", self.max_position_size),
            ("max_concentration", self.max_concentration),
            ("volatility_spike_mult", self.volatility_spike_mult),
        ];
        for (name, v) in positive {
            if v.is_nan() || v <= 0.0 {
                return Err(ValidationError::invalid(name, "must be > 0"));
            }
        }
        let fractions = [
            ("max_drawdown", self.max_drawdown),
            ("warning_fraction", self.warning_fraction),
            ("warning_size_factor", self.warning_size_factor),
        ];
        for (name, v) in fractions {
            if !(v > 0.0 && v <= 1.0) {
                return Err(ValidationError::invalid(name, "must be in (0, 1]"));
            }
        }
        if self.max_orders_per_window == 0 || self.order_window_ms == 0 {
            return Err(ValidationError::invalid("max_orders_per_window", "window and count must be > 0"));
        }
        if self.max_consecutive_losses == 0 {
            return Err(ValidationError::invalid("max_consecutive_losses", "must be > 0"));
        }
        if self.volatility_window < 2 {
            return Err(ValidationError::invalid("volatility_window", "must be >= 2"));
        }
        Ok(())
    }

    /// Every field of `other` must be at least as strict as ours.
    fn check_tighter(&self, other: &RiskLimits) -> Result<(), ValidationError> {
        fn lower(name: &str, current: f64, requested: f64) -> Result<(), ValidationError> {
            if requested > current {
                return Err(ValidationError::LimitLoosened { name: name.to_string(), current, requested });
            }
            Ok(())
        }
        lower("max_daily_loss", self.max_daily_loss, other.max_daily_loss)?;
        lower("max_weekly_loss", self.max_weekly_loss, other.max_weekly_loss)?;
        lower("max_position_size", self.max_position_size, other.max_position_size)?;
        lower("max_concentration", self.max_concentration, other.max_concentration)?;
        lower("max_drawdown", self.max_drawdown, other.max_drawdown)?;
        lower("max_orders_per_window", self.max_orders_per_window as f64, other.max_orders_per_window as f64)?;
        lower("max_consecutive_losses", self.max_consecutive_losses as f64, other.max_consecutive_losses as f64)?;
        lower("volatility_spike_mult", self.volatility_spike_mult, other.volatility_spike_mult)?;
        lower("warning_fraction", self.warning_fraction, other.warning_fraction)?;
        lower("warning_size_factor", self.warning_size_factor, other.warning_size_factor)?;
        // A longer window with the same count is stricter.
        if other.order_window_ms < self.order_window_ms {
            return Err(ValidationError::LimitLoosened {
                name: "order_window_ms".into(),
                current: self.order_window_ms as f64,
                requested: other.order_window_ms as f64,
            });
        }
        if self.auto_flatten && !other.auto_flatten {
            return Err(ValidationError::LimitLoosened { name: "auto_flatten".into(), current: 1.0, requested: 0.0 });
        }
        Ok(())
    }
}

// =============================================================================
// State machine
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RiskState {
    Normal,
    Warning { reasons: Vec<String> },
    Killed { reasons: Vec<String> },
}

impl RiskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskState::Normal => "normal",
            RiskState::Warning { .. } => "warning",
            RiskState::Killed { .. } => "killed",
        }
    }

    pub fn is_killed(&self) -> bool {
        matches!(self, RiskState::Killed { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectCode {
    KillSwitchActive,
    InvalidOrder,
    OrderRateExceeded,
    PositionLimitExceeded,
    ConcentrationExceeded,
}

impl RejectCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectCode::KillSwitchActive => "kill_switch_active",
            RejectCode::InvalidOrder => "invalid_order",
            RejectCode::OrderRateExceeded => "order_rate_exceeded",
            RejectCode::PositionLimitExceeded => "position_limit_exceeded",
            RejectCode::ConcentrationExceeded => "concentration_exceeded",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Rejection {
    pub code: RejectCode,
    pub message: String,
}

impl Rejection {
    fn new(code: RejectCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }

    pub fn to_alert(&self, order_id: &str, equity: f64) -> RiskAlert {
        RiskAlert {
            level: AlertLevel::Warning,
            kind: AlertKind::OrderRejected { order_id: order_id.to_string(), code: self.code.as_str().to_string() },
            reasons: vec![self.code.as_str().to_string()],
            equity,
            message: self.message.clone(),
        }
    }
}

/// What the pre-trade check needs to know about the book.
#[derive(Debug, Clone, Copy)]
pub struct BookView {
    /// Signed quantity currently held in the order's symbol.
    pub position: f64,
    pub price: f64,
    pub equity: f64,
}

pub struct RiskManager {
    limits: RiskLimits,
    state: RiskState,
    order_times: VecDeque<Timestamp>,
    day: Option<u64>,
    day_start_equity: f64,
    week: Option<u64>,
    week_start_equity: f64,
    peak_equity: f64,
    last_equity: f64,
    consecutive_losses: u32,
    vol: BTreeMap<String, ReturnVol>,
    pending_spike: Option<String>,
    flatten_ids: BTreeSet<String>,
}

impl RiskManager {
    pub fn new(limits: RiskLimits, initial_equity: f64) -> Self {
        Self {
            limits,
            state: RiskState::Normal,
            order_times: VecDeque::new(),
            day: None,
            day_start_equity: initial_equity,
            week: None,
            week_start_equity: initial_equity,
            peak_equity: initial_equity,
            last_equity: initial_equity,
            consecutive_losses: 0,
            vol: BTreeMap::new(),
            pending_spike: None,
            flatten_ids: BTreeSet::new(),
        }
    }

    pub fn limits(&self) -> &RiskLimits {
        &self.limits
    }

    pub fn state(&self) -> &RiskState {
        &self.state
    }

    pub fn is_killed(&self) -> bool {
        self.state.is_killed()
    }

    pub fn consecutive_losses(&self) -> u32 {
        self.consecutive_losses
    }

    /// Multiplier the sizer applies to every target.
    pub fn size_scale(&self) -> f64 {
        match self.state {
            RiskState::Normal => 1.0,
            RiskState::Warning { .. } => self.limits.warning_size_factor,
            RiskState::Killed { .. } => 0.0,
        }
    }

    // -------------------------------------------------------------------------
    // Pre-trade
    // -------------------------------------------------------------------------

    /// Checks in fixed order: kill state, validity, rate, size, concentration.
    /// An approved order counts toward the rate window.
    pub fn check_order(&mut self, ts: Timestamp, order: &OrderRequest, book: BookView) -> Result<(), Rejection> {
        let result = self.run_checks(ts, order, book);
        match &result {
            Ok(()) => {
                self.order_times.push_back(ts);
                log_order_decision(&order.order_id, &order.symbol, order.signed_qty(), "approved", "");
            }
            Err(r) => log_order_decision(&order.order_id, &order.symbol, order.signed_qty(), "rejected", r.code.as_str()),
        }
        result
    }

    fn run_checks(&mut self, ts: Timestamp, order: &OrderRequest, book: BookView) -> Result<(), Rejection> {
        if self.is_killed() && !self.flatten_ids.contains(&order.order_id) {
            return Err(Rejection::new(RejectCode::KillSwitchActive, "trading halted by kill switch"));
        }

        if order.symbol.is_empty() || !order.qty.is_finite() || order.qty <= 0.0 {
            return Err(Rejection::new(RejectCode::InvalidOrder, format!("bad quantity {}", order.qty)));
        }
        if let OrderType::Limit { price } = order.order_type {
            if !price.is_finite() || price <= 0.0 {
                return Err(Rejection::new(RejectCode::InvalidOrder, format!("bad limit price {price}")));
            }
        }
        let after = book.position + order.signed_qty();
        let reduces = after.abs() < book.position.abs() + 1e-12 && after * book.position >= -1e-12;
        if order.reduce_only && !reduces {
            return Err(Rejection::new(RejectCode::InvalidOrder, "reduce-only order would grow the position"));
        }
        if reduces {
            // Shrinking exposure is never blocked by size or concentration.
            return self.check_rate(ts);
        }

        self.check_rate(ts)?;

        if after.abs() > self.limits.max_position_size + 1e-12 {
            return Err(Rejection::new(
                RejectCode::PositionLimitExceeded,
                format!("position {:.6} exceeds {:.6}", after.abs(), self.limits.max_position_size),
            ));
        }

        let concentration = if book.equity > 0.0 { after.abs() * book.price / book.equity } else { f64::INFINITY };
        if concentration > self.limits.max_concentration + 1e-12 {
            return Err(Rejection::new(
                RejectCode::ConcentrationExceeded,
                format!("concentration {:.4} exceeds {:.4}", concentration, self.limits.max_concentration),
            ));
        }
        Ok(())
    }

    fn check_rate(&mut self, ts: Timestamp) -> Result<(), Rejection> {
        let window = self.limits.order_window_ms;
        while self.order_times.front().map_or(false, |t| ts.saturating_sub(*t) >= window) {
            self.order_times.pop_front();
        }
        if self.order_times.len() >= self.limits.max_orders_per_window {
            return Err(Rejection::new(
                RejectCode::OrderRateExceeded,
                format!("{} orders within {}ms", self.order_times.len(), self.limits.order_window_ms),
            ));
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Post-event
    // -------------------------------------------------------------------------

    /// Feed closing prices for the volatility-spike detector.
    pub fn observe_close(&mut self, symbol: &str, price: f64) {
        let window = self.limits.volatility_window;
        let vol = self.vol.entry(symbol.to_string()).or_insert_with(|| ReturnVol::new(window));
        let prior = vol.get();
        let ready = vol.is_ready();
        vol.update(price);
        let r = vol.last_return();
        if ready && prior > 0.0 && r.abs() > self.limits.volatility_spike_mult * prior {
            log(
                Level::Warn,
                Domain::Risk,
                "volatility_spike",
                obj(&[("symbol", v_str(symbol)), ("return", v_num(r)), ("sigma", v_num(prior))]),
            );
            self.pending_spike = Some(symbol.to_string());
        }
    }

    /// Closed-trade outcome for the consecutive-loss counter.
    pub fn on_trade_closed(&mut self, pnl: f64) {
        if pnl < 0.0 {
            self.consecutive_losses += 1;
        } else {
            self.consecutive_losses = 0;
        }
    }

    /// Re-evaluate the hard and soft limits against current equity.
    /// Returns the alert for a state transition, if any.
    pub fn evaluate(&mut self, ts: Timestamp, equity: f64) -> Option<RiskAlert> {
        self.roll_periods(ts);
        self.last_equity = equity;
        if equity > self.peak_equity {
            self.peak_equity = equity;
        }
        let spike = self.pending_spike.take();
        if self.is_killed() {
            return None;
        }

        let daily_loss = self.day_start_equity - equity;
        let weekly_loss = self.week_start_equity - equity;
        let drawdown = if self.peak_equity > 0.0 { (self.peak_equity - equity) / self.peak_equity } else { 0.0 };
        let l = &self.limits;

        // Tightest first: loss limits by configured amount, then the fixed tail.
        let mut losses = vec![
            (l.max_daily_loss, 0, daily_loss >= l.max_daily_loss, "daily_loss_exceeded"),
            (l.max_weekly_loss, 1, weekly_loss >= l.max_weekly_loss, "weekly_loss_exceeded"),
        ];
        losses.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
        let mut hard: Vec<String> = losses.iter().filter(|x| x.2).map(|x| x.3.to_string()).collect();
        if drawdown >= l.max_drawdown {
            hard.push("max_drawdown_exceeded".into());
        }
        if self.consecutive_losses >= l.max_consecutive_losses {
            hard.push("consecutive_losses_exceeded".into());
        }
        if let Some(sym) = spike {
            hard.push(format!("volatility_spike:{sym}"));
        }

        if !hard.is_empty() {
            return Some(self.transition(RiskState::Killed { reasons: hard }, equity));
        }

        // Warnings need a loss strictly beyond the warning fraction.
        let mut soft = Vec::new();
        if drawdown > l.warning_fraction * l.max_drawdown {
            soft.push("drawdown_warning".to_string());
        }
        if daily_loss > l.warning_fraction * l.max_daily_loss {
            soft.push("daily_loss_warning".to_string());
        }
        if weekly_loss > l.warning_fraction * l.max_weekly_loss {
            soft.push("weekly_loss_warning".to_string());
        }

        let warning = matches!(self.state, RiskState::Warning { .. });
        match (warning, soft.is_empty()) {
            (false, false) => Some(self.transition(RiskState::Warning { reasons: soft }, equity)),
            (true, true) => Some(self.transition(RiskState::Normal, equity)),
            _ => None,
        }
    }

    fn roll_periods(&mut self, ts: Timestamp) {
        let day = ts / DAY_MS;
        // Epoch day 0 is a Thursday; shift so weeks start on Monday.
        let week = (day + 3) / 7;
        if self.day != Some(day) {
            if self.day.is_some() {
                self.day_start_equity = self.last_equity;
            }
            self.day = Some(day);
        }
        if self.week != Some(week) {
            if self.week.is_some() {
                self.week_start_equity = self.last_equity;
            }
            self.week = Some(week);
        }
    }

    fn transition(&mut self, to: RiskState, equity: f64) -> RiskAlert {
        let from = self.state.as_str();
        let reasons = match &to {
            RiskState::Killed { reasons } | RiskState::Warning { reasons } => reasons.clone(),
            RiskState::Normal => Vec::new(),
        };
        let (level, message) = match &to {
            RiskState::Killed { .. } => (AlertLevel::Critical, KILLSWITCH_TRIGGERED.to_string()),
            RiskState::Warning { .. } => (AlertLevel::Warning, "risk.warning".to_string()),
            RiskState::Normal => (AlertLevel::Info, "risk.normal".to_string()),
        };
        log_risk_transition(from, to.as_str(), &reasons, equity);
        let alert = RiskAlert {
            level,
            kind: AlertKind::StateTransition { from: from.to_string(), to: to.as_str().to_string() },
            reasons,
            equity,
            message,
        };
        self.state = to;
        alert
    }

    /// Reduce-only market orders closing every open position. Only these
    /// ids pass the kill check.
    pub fn flatten_orders(&mut self, ts: Timestamp, positions: &[(String, f64)]) -> Vec<OrderRequest> {
        let mut out = Vec::new();
        for (symbol, qty) in positions {
            if qty.abs() <= 0.0 {
                continue;
            }
            let order = OrderRequest {
                order_id: format!("flatten-{ts}-{symbol}"),
                symbol: symbol.clone(),
                side: if *qty > 0.0 { Side::Sell } else { Side::Buy },
                qty: qty.abs(),
                order_type: OrderType::Market,
                reduce_only: true,
            };
            self.flatten_ids.insert(order.order_id.clone());
            out.push(order);
        }
        out
    }

    // -------------------------------------------------------------------------
    // Operator actions
    // -------------------------------------------------------------------------

    /// Replace the limits with stricter ones. Any loosening is refused.
    pub fn tighten(&mut self, new: RiskLimits) -> Result<RiskAlert, ValidationError> {
        new.validate()?;
        self.limits.check_tighter(&new)?;
        self.limits = new;
        log(Level::Info, Domain::Risk, "limits_tightened", obj(&[("state", v_str(self.state.as_str()))]));
        Ok(RiskAlert {
            level: AlertLevel::Info,
            kind: AlertKind::LimitsTightened,
            reasons: Vec::new(),
            equity: self.last_equity,
            message: "risk.limits_tightened".to_string(),
        })
    }

    /// The only way out of `Killed`. Loss baselines restart from current
    /// equity; new limits, if given, may be looser.
    pub fn reset(&mut self, limits: Option<RiskLimits>) -> Result<RiskAlert, ValidationError> {
        if let Some(l) = limits {
            l.validate()?;
            self.limits = l;
        }
        let from = self.state.as_str();
        self.state = RiskState::Normal;
        self.consecutive_losses = 0;
        self.pending_spike = None;
        self.flatten_ids.clear();
        self.order_times.clear();
        self.peak_equity = self.last_equity;
        self.day_start_equity = self.last_equity;
        self.week_start_equity = self.last_equity;
        log_risk_transition(from, "normal", &["reset".to_string()], self.last_equity);
        Ok(RiskAlert {
            level: AlertLevel::Info,
            kind: AlertKind::Reset,
            reasons: vec!["reset".to_string()],
            equity: self.last_equity,
            message: "risk.reset".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order(id: &str, side: Side, qty: f64) -> OrderRequest {
        OrderRequest {
            order_id: id.into(),
            symbol: "BTC".into(),
            side,
            qty,
            order_type: OrderType::Market,
            reduce_only: false,
        }
    }

    fn book(position: f64) -> BookView {
        BookView { position, price: 100.0, equity: 10_000.0 }
    }

    fn limits() -> RiskLimits {
        RiskLimits { max_concentration: 0.2, max_daily_loss: 500.0, ..RiskLimits::default() }
    }

    #[test]
    fn concentration_limit_rejects() {
        let mut rm = RiskManager::new(limits(), 10_000.0);
        // 25 units at 100 on 10k equity = 25%.
        let err = rm.check_order(0, &order("o1", Side::Buy, 25.0), book(0.0)).unwrap_err();
        assert_eq!(err.code, RejectCode::ConcentrationExceeded);
        assert!(rm.check_order(0, &order("o2", Side::Buy, 20.0), book(0.0)).is_ok());
    }

    #[test]
    fn reducing_orders_skip_size_checks() {
        let mut rm = RiskManager::new(limits(), 10_000.0);
        // Already over the limit, selling is still allowed.
        assert!(rm.check_order(0, &order("o1", Side::Sell, 10.0), book(40.0)).is_ok());
        let flip = order("o2", Side::Sell, 70.0);
        assert_eq!(rm.check_order(0, &flip, book(40.0)).unwrap_err().code, RejectCode::ConcentrationExceeded);
    }

    #[test]
    fn invalid_and_reduce_only_checks() {
        let mut rm = RiskManager::new(limits(), 10_000.0);
        assert_eq!(rm.check_order(0, &order("o", Side::Buy, 0.0), book(0.0)).unwrap_err().code, RejectCode::InvalidOrder);
        let mut ro = order("r", Side::Buy, 1.0);
        ro.reduce_only = true;
        assert_eq!(rm.check_order(0, &ro, book(0.0)).unwrap_err().code, RejectCode::InvalidOrder);
    }

    #[test]
    fn order_rate_window() {
        let l = RiskLimits { max_orders_per_window: 2, order_window_ms: 1000, ..limits() };
        let mut rm = RiskManager::new(l, 10_000.0);
        assert!(rm.check_order(0, &order("a", Side::Buy, 1.0), book(0.0)).is_ok());
        assert!(rm.check_order(10, &order("b", Side::Buy, 1.0), book(1.0)).is_ok());
        let err = rm.check_order(20, &order("c", Side::Buy, 1.0), book(2.0)).unwrap_err();
        assert_eq!(err.code, RejectCode::OrderRateExceeded);
        assert!(rm.check_order(1001, &order("d", Side::Buy, 1.0), book(2.0)).is_ok());
    }

    #[test]
    fn daily_loss_kills_and_blocks_orders() {
        let mut rm = RiskManager::new(limits(), 10_000.0);
        assert!(rm.evaluate(1, 9_700.0).is_none());
        let alert = rm.evaluate(2, 9_499.0).unwrap();
        assert!(alert.is_kill());
        assert_eq!(alert.message, KILLSWITCH_TRIGGERED);
        assert_eq!(alert.reasons[0], "daily_loss_exceeded");
        let err = rm.check_order(3, &order("o", Side::Buy, 1.0), book(0.0)).unwrap_err();
        assert_eq!(err.code, RejectCode::KillSwitchActive);

        // Recovery does not revert.
        assert!(rm.evaluate(4, 20_000.0).is_none());
        assert!(rm.is_killed());

        rm.reset(None).unwrap();
        assert!(!rm.is_killed());
        assert!(rm.check_order(5, &order("p", Side::Buy, 1.0), book(0.0)).is_ok());
    }

    #[test]
    fn warning_scales_size_and_clears() {
        let mut rm = RiskManager::new(RiskLimits { max_drawdown: 0.1, ..RiskLimits::default() }, 10_000.0);
        let alert = rm.evaluate(1, 9_250.0).unwrap();
        assert_eq!(alert.kind, AlertKind::StateTransition { from: "normal".into(), to: "warning".into() });
        assert_eq!(rm.size_scale(), 0.5);
        assert!(rm.evaluate(2, 9_950.0).is_some());
        assert_eq!(rm.state(), &RiskState::Normal);
    }

    #[test]
    fn warning_starts_strictly_above_the_fraction() {
        let l = RiskLimits { max_daily_loss: 1_000.0, max_weekly_loss: 5_000.0, max_drawdown: 0.5, ..RiskLimits::default() };
        let mut rm = RiskManager::new(l, 10_000.0);
        // Exactly 70% of the daily limit.
        assert!(rm.evaluate(1, 9_300.0).is_none());
        assert_eq!(rm.state(), &RiskState::Normal);
        let alert = rm.evaluate(2, 9_299.0).unwrap();
        assert_eq!(alert.reasons, vec!["daily_loss_warning"]);
    }

    #[test]
    fn simultaneous_limits_put_tightest_first() {
        let l = RiskLimits { max_daily_loss: 800.0, max_weekly_loss: 600.0, max_drawdown: 0.05, ..RiskLimits::default() };
        let mut rm = RiskManager::new(l, 10_000.0);
        let alert = rm.evaluate(1, 9_000.0).unwrap();
        assert_eq!(alert.reasons, vec!["weekly_loss_exceeded", "daily_loss_exceeded", "max_drawdown_exceeded"]);
    }

    #[test]
    fn consecutive_losses_kill() {
        let l = RiskLimits { max_consecutive_losses: 3, ..RiskLimits::default() };
        let mut rm = RiskManager::new(l, 10_000.0);
        rm.on_trade_closed(-1.0);
        rm.on_trade_closed(-1.0);
        rm.on_trade_closed(2.0);
        rm.on_trade_closed(-1.0);
        rm.on_trade_closed(-1.0);
        assert!(rm.evaluate(1, 10_000.0).is_none());
        rm.on_trade_closed(-1.0);
        assert!(rm.evaluate(2, 10_000.0).unwrap().is_kill());
    }

    #[test]
    fn volatility_spike_kills() {
        let l = RiskLimits { volatility_window: 10, volatility_spike_mult: 6.0, ..RiskLimits::default() };
        let mut rm = RiskManager::new(l, 10_000.0);
        for i in 0..30 {
            rm.observe_close("BTC", 100.0 + if i % 2 == 0 { 0.1 } else { -0.1 });
            assert!(rm.evaluate(i, 10_000.0).is_none());
        }
        rm.observe_close("BTC", 130.0);
        let alert = rm.evaluate(31, 10_000.0).unwrap();
        assert_eq!(alert.reasons, vec!["volatility_spike:BTC"]);
    }

    #[test]
    fn tighten_refuses_loosening() {
        let mut rm = RiskManager::new(RiskLimits::default(), 10_000.0);
        let tighter = RiskLimits { max_daily_loss: 1_000.0, ..RiskLimits::default() };
        assert!(rm.tighten(tighter.clone()).is_ok());
        let looser = RiskLimits { max_daily_loss: 2_000.0, ..RiskLimits::default() };
        assert!(matches!(rm.tighten(looser.clone()), Err(ValidationError::LimitLoosened { .. })));
        assert_eq!(rm.limits().max_daily_loss, 1_000.0);
        rm.reset(Some(looser)).unwrap();
        assert_eq!(rm.limits().max_daily_loss, 2_000.0);
    }

    #[test]
    fn flatten_orders_pass_kill_check() {
        let mut rm = RiskManager::new(limits(), 10_000.0);
        rm.evaluate(1, 9_000.0);
        assert!(rm.is_killed());
        let orders = rm.flatten_orders(2, &[("BTC".into(), 3.0), ("ETH".into(), 0.0)]);
        assert_eq!(orders.len(), 1);
        assert!(orders[0].reduce_only);
        assert!(rm.check_order(2, &orders[0], book(3.0)).is_ok());
    }

    #[test]
    fn day_rollover_resets_daily_baseline() {
        let l = RiskLimits { max_daily_loss: 500.0, max_weekly_loss: 100_000.0, max_drawdown: 0.5, ..RiskLimits::default() };
        let mut rm = RiskManager::new(l, 10_000.0);
        rm.evaluate(1_000, 9_600.0);
        // Next day the baseline is 9_600, so -700 overall is only -300 today.
        rm.evaluate(DAY_MS + 1, 9_300.0);
        assert!(!rm.is_killed());
    }
}
