//! Network market data sources.
//!
//! Both speak a small venue-neutral JSON schema, so any upstream that can be
//! mapped onto it (including another `replayfx serve`) can feed the engine.

pub mod rest;
pub mod ws;

pub use rest::RestHistorySource;
pub use ws::{parse_tick_message, WsTickFeed};
