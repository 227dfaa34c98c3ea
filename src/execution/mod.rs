//! Order execution: the backtest simulator, the live venue seam and the
//! adapter that reconciles venue fills, sharing one retry policy.

pub mod adapter;
pub mod retry;
pub mod simulator;
pub mod venue;

pub use adapter::{ExecutionAdapter, Placement};
pub use retry::{CallKind, RetryPolicy};
pub use simulator::{ExecConfig, ExecutionSimulator};
pub use venue::{ExecutionVenue, PaperVenue, VenueAck, VenueFill};
