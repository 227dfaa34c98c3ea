//! Append-only persistence for jobs, reports, trades and run events, plus
//! what an interrupted job needs to continue: its request and its last
//! checkpoint.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use rusqlite::{params, Connection, OptionalExtension};

use crate::data::Checkpoint;
use crate::engine::{BacktestRequest, RunReport};
use crate::events::Envelope;
use crate::jobs::{JobRecord, JobStatus};
use crate::portfolio::TradeRecord;

pub trait DataStore: Send + Sync {
    /// Insert or update a job's status row.
    fn put_job(&self, job: &JobRecord) -> Result<()>;
    fn job(&self, job_id: &str) -> Result<Option<JobRecord>>;
    fn jobs(&self) -> Result<Vec<JobRecord>>;
    fn save_report(&self, job_id: &str, report: &RunReport) -> Result<()>;
    fn report(&self, job_id: &str) -> Result<Option<RunReport>>;
    fn trades(&self, job_id: &str) -> Result<Vec<TradeRecord>>;
    fn append_events(&self, job_id: &str, events: &[Envelope]) -> Result<usize>;
    fn events(&self, job_id: &str) -> Result<Vec<Envelope>>;
    fn put_request(&self, job_id: &str, request: &BacktestRequest) -> Result<()>;
    fn request(&self, job_id: &str) -> Result<Option<BacktestRequest>>;
    /// Replace the job's checkpoint. Events up to it are already appended.
    fn put_checkpoint(&self, job_id: &str, cp: Checkpoint) -> Result<()>;
    fn checkpoint(&self, job_id: &str) -> Result<Option<Checkpoint>>;
}

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &str) -> Result<Self> {
        let store = Self { conn: Mutex::new(Connection::open(path)?) };
        store.init()?;
        Ok(store)
    }

    pub fn in_memory() -> Result<Self> {
        let store = Self { conn: Mutex::new(Connection::open_in_memory()?) };
        store.init()?;
        Ok(store)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| anyhow!("store lock poisoned"))
    }

    fn init(&self) -> Result<()> {
        self.lock()?.execute_batch(
            "BEGIN;
            CREATE TABLE IF NOT EXISTS jobs (
                job_id TEXT PRIMARY KEY,
                strategy TEXT NOT NULL,
                status TEXT NOT NULL,
                reason TEXT,
                submitted_ms INTEGER NOT NULL,
                updated_ms INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS results (
                job_id TEXT PRIMARY KEY,
                final_equity REAL NOT NULL,
                sharpe REAL NOT NULL,
                trade_log_sha256 TEXT NOT NULL,
                report_json TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS trades (
                job_id TEXT NOT NULL,
                idx INTEGER NOT NULL,
                symbol TEXT NOT NULL,
                entry_ts INTEGER NOT NULL,
                exit_ts INTEGER NOT NULL,
                pnl REAL NOT NULL,
                trade_json TEXT NOT NULL,
                PRIMARY KEY (job_id, idx)
            );
            CREATE TABLE IF NOT EXISTS events (
                job_id TEXT NOT NULL,
                seq INTEGER NOT NULL,
                ts INTEGER NOT NULL,
                event_json TEXT NOT NULL,
                PRIMARY KEY (job_id, seq)
            );
            CREATE TABLE IF NOT EXISTS requests (
                job_id TEXT PRIMARY KEY,
                request_json TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS checkpoints (
                job_id TEXT PRIMARY KEY,
                ts INTEGER NOT NULL,
                seq INTEGER NOT NULL
            );
            COMMIT;",
        )?;
        Ok(())
    }
}

fn job_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<(String, String, String, Option<String>, i64, i64)> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?, row.get(5)?))
}

fn to_record((job_id, strategy, status, reason, submitted, updated): (String, String, String, Option<String>, i64, i64)) -> Result<JobRecord> {
    let status = JobStatus::parse(&status).ok_or_else(|| anyhow!("unknown job status {status}"))?;
    Ok(JobRecord { job_id, strategy, status, reason, submitted_ms: submitted as u64, updated_ms: updated as u64 })
}

impl DataStore for SqliteStore {
    fn put_job(&self, job: &JobRecord) -> Result<()> {
        self.lock()?.execute(
            "INSERT INTO jobs (job_id, strategy, status, reason, submitted_ms, updated_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(job_id) DO UPDATE SET status = ?3, reason = ?4, updated_ms = ?6",
            params![
                job.job_id,
                job.strategy,
                job.status.as_str(),
                job.reason,
                job.submitted_ms as i64,
                job.updated_ms as i64
            ],
        )?;
        Ok(())
    }

    fn job(&self, job_id: &str) -> Result<Option<JobRecord>> {
        let row = self
            .lock()?
            .query_row(
                "SELECT job_id, strategy, status, reason, submitted_ms, updated_ms FROM jobs WHERE job_id = ?1",
                params![job_id],
                job_from_row,
            )
            .optional()?;
        row.map(to_record).transpose()
    }

    fn jobs(&self) -> Result<Vec<JobRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT job_id, strategy, status, reason, submitted_ms, updated_ms FROM jobs ORDER BY submitted_ms, job_id",
        )?;
        let rows = stmt.query_map([], job_from_row)?.collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(to_record).collect()
    }

    fn save_report(&self, job_id: &str, report: &RunReport) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO results (job_id, final_equity, sharpe, trade_log_sha256, report_json)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                job_id,
                report.final_equity,
                report.metrics.sharpe,
                report.trade_log_sha256,
                serde_json::to_string(report)?
            ],
        )?;
        for (idx, t) in report.trades.iter().enumerate() {
            tx.execute(
                "INSERT INTO trades (job_id, idx, symbol, entry_ts, exit_ts, pnl, trade_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    job_id,
                    idx as i64,
                    t.symbol,
                    t.entry_ts as i64,
                    t.exit_ts as i64,
                    t.pnl,
                    serde_json::to_string(t)?
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn report(&self, job_id: &str) -> Result<Option<RunReport>> {
        let json: Option<String> = self
            .lock()?
            .query_row("SELECT report_json FROM results WHERE job_id = ?1", params![job_id], |r| r.get(0))
            .optional()?;
        Ok(json.map(|j| serde_json::from_str(&j)).transpose()?)
    }

    fn trades(&self, job_id: &str) -> Result<Vec<TradeRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT trade_json FROM trades WHERE job_id = ?1 ORDER BY idx")?;
        let rows = stmt.query_map(params![job_id], |r| r.get::<_, String>(0))?.collect::<rusqlite::Result<Vec<_>>>()?;
        rows.iter().map(|j| Ok(serde_json::from_str(j)?)).collect()
    }

    fn append_events(&self, job_id: &str, events: &[Envelope]) -> Result<usize> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        for env in events {
            tx.execute(
                "INSERT INTO events (job_id, seq, ts, event_json) VALUES (?1, ?2, ?3, ?4)",
                params![job_id, env.seq as i64, env.ts as i64, serde_json::to_string(env)?],
            )?;
        }
        tx.commit()?;
        Ok(events.len())
    }

    fn events(&self, job_id: &str) -> Result<Vec<Envelope>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT event_json FROM events WHERE job_id = ?1 ORDER BY seq")?;
        let rows = stmt.query_map(params![job_id], |r| r.get::<_, String>(0))?.collect::<rusqlite::Result<Vec<_>>>()?;
        rows.iter().map(|j| Ok(serde_json::from_str(j)?)).collect()
    }

    fn put_request(&self, job_id: &str, request: &BacktestRequest) -> Result<()> {
        self.lock()?.execute(
            "INSERT OR REPLACE INTO requests (job_id, request_json) VALUES (?1, ?2)",
            params![job_id, serde_json::to_string(request)?],
        )?;
        Ok(())
    }

    fn request(&self, job_id: &str) -> Result<Option<BacktestRequest>> {
        let json: Option<String> = self
            .lock()?
            .query_row("SELECT request_json FROM requests WHERE job_id = ?1", params![job_id], |r| r.get(0))
            .optional()?;
        match json {
            Some(j) => Ok(Some(serde_json::from_str(&j)?)),
            None => Ok(None),
        }
    }

    fn put_checkpoint(&self, job_id: &str, cp: Checkpoint) -> Result<()> {
        self.lock()?.execute(
            "INSERT OR REPLACE INTO checkpoints (job_id, ts, seq) VALUES (?1, ?2, ?3)",
            params![job_id, cp.ts as i64, cp.seq as i64],
        )?;
        Ok(())
    }

    fn checkpoint(&self, job_id: &str) -> Result<Option<Checkpoint>> {
        let row: Option<(i64, i64)> = self
            .lock()?
            .query_row("SELECT ts, seq FROM checkpoints WHERE job_id = ?1", params![job_id], |r| Ok((r.get(0)?, r.get(1)?)))
            .optional()?;
        Ok(row.map(|(ts, seq)| Checkpoint { ts: ts as u64, seq: seq as u64 }))
    }
}

#[derive(Default)]
struct Tables {
    jobs: Vec<JobRecord>,
    reports: HashMap<String, RunReport>,
    events: HashMap<String, Vec<Envelope>>,
    requests: HashMap<String, BacktestRequest>,
    checkpoints: HashMap<String, Checkpoint>,
}

/// Volatile store with the same semantics as `SqliteStore`.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Tables>> {
        self.inner.lock().map_err(|_| anyhow!("store lock poisoned"))
    }
}

impl DataStore for MemoryStore {
    fn put_job(&self, job: &JobRecord) -> Result<()> {
        let mut t = self.lock()?;
        match t.jobs.iter_mut().find(|j| j.job_id == job.job_id) {
            Some(existing) => {
                existing.status = job.status;
                existing.reason = job.reason.clone();
                existing.updated_ms = job.updated_ms;
            }
            None => t.jobs.push(job.clone()),
        }
        Ok(())
    }

    fn job(&self, job_id: &str) -> Result<Option<JobRecord>> {
        Ok(self.lock()?.jobs.iter().find(|j| j.job_id == job_id).cloned())
    }

    fn jobs(&self) -> Result<Vec<JobRecord>> {
        Ok(self.lock()?.jobs.clone())
    }

    fn save_report(&self, job_id: &str, report: &RunReport) -> Result<()> {
        let mut t = self.lock()?;
        if t.reports.contains_key(job_id) {
            return Err(anyhow!("report for {job_id} already stored"));
        }
        t.reports.insert(job_id.to_string(), report.clone());
        Ok(())
    }

    fn report(&self, job_id: &str) -> Result<Option<RunReport>> {
        Ok(self.lock()?.reports.get(job_id).cloned())
    }

    fn trades(&self, job_id: &str) -> Result<Vec<TradeRecord>> {
        Ok(self.lock()?.reports.get(job_id).map(|r| r.trades.clone()).unwrap_or_default())
    }

    fn append_events(&self, job_id: &str, events: &[Envelope]) -> Result<usize> {
        self.lock()?.events.entry(job_id.to_string()).or_default().extend_from_slice(events);
        Ok(events.len())
    }

    fn events(&self, job_id: &str) -> Result<Vec<Envelope>> {
        Ok(self.lock()?.events.get(job_id).cloned().unwrap_or_default())
    }

    fn put_request(&self, job_id: &str, request: &BacktestRequest) -> Result<()> {
        self.lock()?.requests.insert(job_id.to_string(), request.clone());
        Ok(())
    }

    fn request(&self, job_id: &str) -> Result<Option<BacktestRequest>> {
        Ok(self.lock()?.requests.get(job_id).cloned())
    }

    fn put_checkpoint(&self, job_id: &str, cp: Checkpoint) -> Result<()> {
        self.lock()?.checkpoints.insert(job_id.to_string(), cp);
        Ok(())
    }

    fn checkpoint(&self, job_id: &str) -> Result<Option<Checkpoint>> {
        Ok(self.lock()?.checkpoints.get(job_id).copied())
    }
}
