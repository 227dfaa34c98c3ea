//! HTTP report API.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;

use crate::data::TimeRange;
use crate::engine::BacktestRequest;
use crate::events::Bar;
use crate::jobs::{JobManager, SubmitError};
use crate::logging::{log, obj, v_str, Domain, Level};

#[derive(Debug, Default, Deserialize)]
pub struct HistoryQuery {
    pub start: Option<u64>,
    pub end: Option<u64>,
}

fn error(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

pub fn router(jobs: Arc<JobManager>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/symbols", get(symbols))
        .route("/history/:symbol", get(history))
        .route("/backtest/run", post(run))
        .route("/backtest/:id", get(job))
        .route("/backtest/:id/trades", get(trades))
        .with_state(jobs)
}

pub async fn serve(addr: &str, jobs: Arc<JobManager>) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    log(Level::Info, Domain::System, "http_listening", obj(&[("addr", v_str(&listener.local_addr()?.to_string()))]));
    axum::serve(listener, router(jobs)).await?;
    Ok(())
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok", "service": "replayfx", "version": env!("CARGO_PKG_VERSION") }))
}

async fn symbols(State(jobs): State<Arc<JobManager>>) -> impl IntoResponse {
    Json(jobs.source().symbols())
}

async fn history(
    State(jobs): State<Arc<JobManager>>,
    Path(symbol): Path<String>,
    Query(q): Query<HistoryQuery>,
) -> Response {
    let range = TimeRange { start: q.start, end: q.end };
    let bars = jobs.source().open(&symbol, range).and_then(|it| it.collect::<Result<Vec<Bar>, _>>());
    match bars {
        Ok(bars) => Json(bars).into_response(),
        Err(e) => error(StatusCode::NOT_FOUND, &e.to_string()),
    }
}

async fn run(State(jobs): State<Arc<JobManager>>, Json(req): Json<BacktestRequest>) -> Response {
    match jobs.submit(req) {
        Ok(id) => (StatusCode::ACCEPTED, Json(json!({ "job_id": id, "status": "queued" }))).into_response(),
        Err(e @ SubmitError::Invalid(_)) => error(StatusCode::BAD_REQUEST, &e.to_string()),
        Err(e @ (SubmitError::QueueFull | SubmitError::ShutDown)) => error(StatusCode::SERVICE_UNAVAILABLE, &e.to_string()),
        Err(e @ SubmitError::Store(_)) => error(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
}

async fn job(State(jobs): State<Arc<JobManager>>, Path(id): Path<String>) -> Response {
    match jobs.status(&id) {
        Some(record) => Json(json!({ "job": record, "report": jobs.report(&id) })).into_response(),
        None => error(StatusCode::NOT_FOUND, "unknown job"),
    }
}

async fn trades(State(jobs): State<Arc<JobManager>>, Path(id): Path<String>) -> Response {
    if jobs.status(&id).is_none() {
        return error(StatusCode::NOT_FOUND, "unknown job");
    }
    match jobs.store().trades(&id) {
        Ok(trades) => Json(trades).into_response(),
        Err(e) => error(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
}
