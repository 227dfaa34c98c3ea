//! Structured JSON-lines logging.
//!
//! Every record carries a run id, a process-wide sequence number, level,
//! domain and a `data` object. Records at debug/trace go to `trace.jsonl`,
//! everything else to `events.jsonl`, both under `LOG_DIR/<run_id>/`.
//! Stdout echo is on unless `LOG_STDOUT=0`.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fs::{create_dir_all, File};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};

// =============================================================================
// Log Levels
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Trace = 0,
    Debug = 1,
    Info = 2,
    Warn = 3,
    Error = 4,
    Fatal = 5,
}

impl Level {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "trace" => Some(Level::Trace),
            "debug" => Some(Level::Debug),
            "info" => Some(Level::Info),
            "warn" => Some(Level::Warn),
            "error" => Some(Level::Error),
            "fatal" => Some(Level::Fatal),
            _ => None,
        }
    }

    pub fn from_env() -> Self {
        std::env::var("LOG_LEVEL")
            .ok()
            .and_then(|v| Self::parse(&v))
            .unwrap_or(Level::Info)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Trace => "trace",
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
            Level::Fatal => "fatal",
        }
    }
}

// =============================================================================
// Log Domains
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    Bus,        // Dispatch, handler timeouts, backpressure drops
    Data,       // Loader, gap fills, checkpoints
    Regime,     // Classifier fits and transitions
    Signal,     // Source values, aggregation, conflicts
    Sizing,     // Sizer decisions
    Risk,       // Pre-trade checks, state machine
    Exec,       // Order lifecycle, venue calls
    Portfolio,  // Fills applied, equity marks
    Validation, // Walk-forward, Monte Carlo
    Job,        // Pool and job status
    System,     // Startup, shutdown, servers
    Audit,      // Fingerprints for replay verification
}

impl Domain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Bus => "bus",
            Domain::Data => "data",
            Domain::Regime => "regime",
            Domain::Signal => "signal",
            Domain::Sizing => "sizing",
            Domain::Risk => "risk",
            Domain::Exec => "exec",
            Domain::Portfolio => "portfolio",
            Domain::Validation => "validation",
            Domain::Job => "job",
            Domain::System => "system",
            Domain::Audit => "audit",
        }
    }

    pub fn is_enabled(&self) -> bool {
        // LOG_DOMAINS: comma-separated list or "all"
        match filters().domains.as_deref() {
            None => true,
            Some(list) => list.iter().any(|d| d == self.as_str()),
        }
    }
}

// =============================================================================
// Run context
// =============================================================================

static LOG_SEQ: AtomicU64 = AtomicU64::new(0);
static RUN_CONTEXT: OnceLock<RunContext> = OnceLock::new();
static FILTERS: OnceLock<Filters> = OnceLock::new();

struct Filters {
    min_level: Level,
    domains: Option<Vec<String>>,
    stdout: bool,
}

fn filters() -> &'static Filters {
    FILTERS.get_or_init(|| Filters {
        min_level: Level::from_env(),
        domains: match std::env::var("LOG_DOMAINS").as_deref() {
            Ok("all") | Err(_) => None,
            Ok(list) => Some(list.split(',').map(|d| d.trim().to_string()).collect()),
        },
        stdout: std::env::var("LOG_STDOUT").as_deref() != Ok("0"),
    })
}

fn next_seq() -> u64 {
    LOG_SEQ.fetch_add(1, Ordering::SeqCst)
}

struct RunContext {
    run_id: String,
    events: Option<Mutex<BufWriter<File>>>,
    trace: Option<Mutex<BufWriter<File>>>,
}

fn open_sink(path: PathBuf) -> Option<Mutex<BufWriter<File>>> {
    match File::create(&path) {
        Ok(f) => Some(Mutex::new(BufWriter::new(f))),
        Err(err) => {
            eprintln!("[log] failed to create {}: {}", path.display(), err);
            None
        }
    }
}

fn ensure_run_context() -> &'static RunContext {
    RUN_CONTEXT.get_or_init(|| {
        let run_id = std::env::var("RUN_ID")
            .unwrap_or_else(|_| format!("r-{}-{}", ts_epoch_ms(), process::id()));
        let base = match std::env::var("LOG_DIR") {
            Ok(dir) if dir == "off" => None,
            Ok(dir) => Some(PathBuf::from(dir)),
            Err(_) => Some(PathBuf::from("out/runs")),
        };
        let Some(mut run_dir) = base else {
            return RunContext { run_id, events: None, trace: None };
        };
        run_dir.push(&run_id);
        if let Err(err) = create_dir_all(&run_dir) {
            eprintln!("[log] failed to create run dir: {}", err);
            return RunContext { run_id, events: None, trace: None };
        }
        let _ = std::fs::write(
            run_dir.join("manifest.json"),
            json!({
                "run_id": run_id,
                "ts": ts_now(),
                "pid": process::id(),
                "log_dir": run_dir.to_string_lossy(),
            })
            .to_string(),
        );
        RunContext {
            events: open_sink(run_dir.join("events.jsonl")),
            trace: open_sink(run_dir.join("trace.jsonl")),
            run_id,
        }
    })
}

fn sanitize_fields(mut fields: Map<String, Value>) -> Map<String, Value> {
    let redacted = Value::String("[REDACTED]".to_string());
    for key in ["authorization", "Authorization", "api_key", "api_secret", "signature", "token"] {
        if fields.contains_key(key) {
            fields.insert(key.to_string(), redacted.clone());
        }
    }
    fields
}

fn split_fields(mut fields: Map<String, Value>) -> (Map<String, Value>, Map<String, Value>) {
    let mut top = Map::new();
    for key in ["job_id", "order_id", "symbol", "msg"] {
        if let Some(value) = fields.remove(key) {
            top.insert(key.to_string(), value);
        }
    }
    (top, fields)
}

fn write_line(writer: &Option<Mutex<BufWriter<File>>>, line: &str) {
    if let Some(writer) = writer {
        if let Ok(mut w) = writer.lock() {
            let _ = writeln!(w, "{}", line);
        }
    }
}

// =============================================================================
// Core logging functions
// =============================================================================

/// RFC3339 timestamp with milliseconds
pub fn ts_now() -> String {
    Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Epoch milliseconds
pub fn ts_epoch_ms() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

/// Emit a structured log entry
pub fn log(level: Level, domain: Domain, event: &str, fields: Map<String, Value>) {
    if level < filters().min_level || !domain.is_enabled() {
        return;
    }
    emit_record(level, domain.as_str(), event, fields);
}

/// Build the JSON record without writing it.
pub fn render_record(level: Level, component: &str, event: &str, fields: Map<String, Value>) -> Value {
    let ctx = ensure_run_context();
    let (mut top, data) = split_fields(sanitize_fields(fields));
    let msg = top.remove("msg").unwrap_or(Value::String(String::new()));
    let mut entry = Map::new();
    entry.insert("ts".to_string(), json!(ts_now()));
    entry.insert("run_id".to_string(), json!(ctx.run_id.clone()));
    entry.insert("seq".to_string(), json!(next_seq()));
    entry.insert("lvl".to_string(), json!(level.as_str().to_uppercase()));
    entry.insert("component".to_string(), json!(component));
    entry.insert("event".to_string(), json!(event));
    entry.insert("msg".to_string(), msg);
    for (k, v) in top {
        entry.insert(k, v);
    }
    entry.insert("data".to_string(), Value::Object(data));
    Value::Object(entry)
}

fn emit_record(level: Level, component: &str, event: &str, fields: Map<String, Value>) {
    let line = render_record(level, component, event, fields).to_string();
    let ctx = ensure_run_context();
    match level {
        Level::Trace | Level::Debug => write_line(&ctx.trace, &line),
        _ => write_line(&ctx.events, &line),
    }
    if filters().stdout {
        println!("{}", line);
    }
}

/// Flush buffered sinks (called on shutdown and at job completion).
pub fn flush() {
    let ctx = ensure_run_context();
    for sink in [&ctx.events, &ctx.trace].into_iter().flatten() {
        if let Ok(mut w) = sink.lock() {
            let _ = w.flush();
        }
    }
}

// =============================================================================
// Domain helpers
// =============================================================================

pub fn log_order_decision(order_id: &str, symbol: &str, qty: f64, result: &str, reason: &str) {
    log(
        Level::Debug,
        Domain::Risk,
        "order_check",
        obj(&[
            ("order_id", v_str(order_id)),
            ("symbol", v_str(symbol)),
            ("qty", v_num(qty)),
            ("result", v_str(result)),
            ("reason", v_str(reason)),
        ]),
    );
}

pub fn log_risk_transition(from: &str, to: &str, reasons: &[String], equity: f64) {
    let level = if to == "killed" { Level::Error } else { Level::Warn };
    log(
        level,
        Domain::Risk,
        "state_transition",
        obj(&[
            ("from", v_str(from)),
            ("to", v_str(to)),
            ("reasons", Value::Array(reasons.iter().map(|r| v_str(r)).collect())),
            ("equity", v_num(equity)),
        ]),
    );
}

pub fn log_fill(order_id: &str, symbol: &str, price: f64, qty: f64, fee: f64, realized_pnl: f64) {
    log(
        Level::Info,
        Domain::Portfolio,
        "fill",
        obj(&[
            ("order_id", v_str(order_id)),
            ("symbol", v_str(symbol)),
            ("price", v_num(price)),
            ("qty", v_num(qty)),
            ("fee", v_num(fee)),
            ("realized_pnl", v_num(realized_pnl)),
        ]),
    );
}

pub fn log_regime_change(symbol: &str, from: &str, to: &str, confidence: f64) {
    log(
        Level::Info,
        Domain::Regime,
        "regime_change",
        obj(&[
            ("symbol", v_str(symbol)),
            ("from", v_str(from)),
            ("to", v_str(to)),
            ("confidence", v_num(confidence)),
        ]),
    );
}

pub fn log_job_status(job_id: &str, status: &str, reason: Option<&str>) {
    log(
        Level::Info,
        Domain::Job,
        "job_status",
        obj(&[
            ("job_id", v_str(job_id)),
            ("status", v_str(status)),
            ("reason", reason.map(v_str).unwrap_or(Value::Null)),
        ]),
    );
}

/// Log a replay fingerprint so two runs can be compared from logs alone.
pub fn log_audit(job_id: &str, trade_log_sha256: &str, equity_sha256: &str, events: u64) {
    log(
        Level::Info,
        Domain::Audit,
        "run_fingerprint",
        obj(&[
            ("job_id", v_str(job_id)),
            ("trade_log_sha256", v_str(trade_log_sha256)),
            ("equity_sha256", v_str(equity_sha256)),
            ("events", json!(events)),
        ]),
    );
}

// =============================================================================
// Utility Functions
// =============================================================================

pub fn obj(pairs: &[(&str, Value)]) -> Map<String, Value> {
    let mut map = Map::new();
    for (k, v) in pairs {
        map.insert((*k).to_string(), v.clone());
    }
    map
}

pub fn v_str(s: &str) -> Value {
    Value::String(s.to_string())
}

pub fn v_num(n: f64) -> Value {
    json!(n)
}
