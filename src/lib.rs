//! Deterministic, replayable event-driven trading simulation.
//!
//! A run replays bars as ticks through one event bus; signals, sizing, risk
//! and execution react to events and never share state across runs.

pub mod bus;
pub mod config;
pub mod data;
pub mod engine;
pub mod error;
pub mod events;
pub mod execution;
pub mod feed;
pub mod indicators;
pub mod jobs;
pub mod live;
pub mod logging;
pub mod metrics;
pub mod notify;
pub mod order;
pub mod portfolio;
pub mod protocol;
pub mod regime;
pub mod risk;
pub mod server;
pub mod signals;
pub mod sizing;
pub mod storage;
pub mod strategy;
pub mod validation;
