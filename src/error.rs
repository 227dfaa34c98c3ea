//! Error taxonomy for replay runs.
//!
//! Risk violations are deliberately absent: they are first-class
//! `RiskAlert` events handled by the risk state machine, not errors.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How bad an error is for the run that hit it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Recoverable,
    Fatal,
}

/// Missing or corrupt market data.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DataError {
    #[error("gap of {missing_bars} bars for {symbol} between {start_ts} and {end_ts} exceeds tolerance {tolerance}")]
    Gap {
        symbol: String,
        start_ts: u64,
        end_ts: u64,
        missing_bars: u64,
        tolerance: u64,
    },
    #[error("corrupt row {line}: {reason}")]
    Corrupt { line: usize, reason: String },
    #[error("non-monotonic timestamp for {symbol}: {prev} then {current}")]
    NonMonotonic { symbol: String, prev: u64, current: u64 },
    #[error("no data for {symbol}")]
    Empty { symbol: String },
    #[error("data source: {0}")]
    Source(String),
}

/// Malformed configuration, rejected before any simulation work starts.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("invalid parameter {name}: {reason}")]
    InvalidParameter { name: String, reason: String },
    #[error("missing field: {0}")]
    Missing(String),
    #[error("risk limit {name} may only be tightened (current {current}, requested {requested})")]
    LimitLoosened { name: String, current: f64, requested: f64 },
}

impl ValidationError {
    pub fn invalid(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidParameter { name: name.into(), reason: reason.into() }
    }
}

/// Venue rejection or timeout.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExecutionError {
    #[error("venue rejected order {order_id}: {reason}")]
    Rejected { order_id: String, reason: String },
    #[error("venue did not acknowledge order {order_id} within {timeout_ms}ms")]
    AckTimeout { order_id: String, timeout_ms: u64 },
    #[error("venue call {call} failed: {reason}")]
    Venue { call: String, reason: String },
    #[error("fill {fill_id} would overfill order {order_id} ({filled} + {qty} > {requested})")]
    Overfill { order_id: String, fill_id: String, filled: f64, qty: f64, requested: f64 },
    #[error("order {0} is in a terminal state")]
    Terminal(String),
    #[error("unknown order {0}")]
    UnknownOrder(String),
}

/// Bus-level failures.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BusError {
    #[error("non-monotonic clock: event at {ts} after {last}")]
    NonMonotonicClock { last: u64, ts: u64 },
    #[error("bus is closed")]
    Closed,
    #[error("ingress disconnected")]
    Disconnected,
}

impl BusError {
    pub fn severity(&self) -> Severity {
        match self {
            BusError::NonMonotonicClock { .. } => Severity::Fatal,
            BusError::Closed | BusError::Disconnected => Severity::Recoverable,
        }
    }
}

/// Everything that can end a run early.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Data(#[from] DataError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Execution(#[from] ExecutionError),
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error("run cancelled")]
    Cancelled,
    #[error("internal: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn severity(&self) -> Severity {
        match self {
            EngineError::Bus(e) => e.severity(),
            EngineError::Internal(_) => Severity::Fatal,
            _ => Severity::Recoverable,
        }
    }
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;
