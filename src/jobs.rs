//! Backtest jobs on a bounded pool of OS threads.
//!
//! Each job owns its run state outright; the only shared pieces are the
//! read-only bar source, the result store (one writer lock) and the
//! broadcast channel for streaming updates. A panic inside a run is caught
//! and recorded as `failed:internal-error`; the worker survives it.
//!
//! Runs persist their events in batches, each followed by a checkpoint.
//! After a crash, `recover` puts unfinished jobs back on the queue and they
//! continue from their last checkpoint.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::bus::CancelToken;
use crate::config::PoolConfig;
use crate::data::{BarSource, Checkpoint};
use crate::engine::{run_backtest, BacktestRequest, EngineSettings, RunObserver, RunReport};
use crate::error::{EngineError, ValidationError};
use crate::events::{Envelope, Timestamp};
use crate::logging::{log, log_job_status, obj, ts_epoch_ms, v_num, v_str, Domain, Level};
use crate::notify::AlertDispatcher;
use crate::protocol::{self, Message};
use crate::storage::DataStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    #[serde(rename = "queued")]
    Queued,
    #[serde(rename = "running")]
    Running,
    #[serde(rename = "completed")]
    Completed,
    #[serde(rename = "cancelled")]
    Cancelled,
    #[serde(rename = "failed:data-gap")]
    FailedDataGap,
    #[serde(rename = "failed:risk-violation")]
    FailedRiskViolation,
    #[serde(rename = "failed:internal-error")]
    FailedInternal,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Cancelled => "cancelled",
            JobStatus::FailedDataGap => "failed:data-gap",
            JobStatus::FailedRiskViolation => "failed:risk-violation",
            JobStatus::FailedInternal => "failed:internal-error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        [
            JobStatus::Queued,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Cancelled,
            JobStatus::FailedDataGap,
            JobStatus::FailedRiskViolation,
            JobStatus::FailedInternal,
        ]
        .into_iter()
        .find(|st| st.as_str() == s)
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Queued | JobStatus::Running)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: String,
    pub strategy: String,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub submitted_ms: u64,
    pub updated_ms: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error(transparent)]
    Invalid(#[from] ValidationError),
    #[error("job queue is full")]
    QueueFull,
    #[error("job pool is shut down")]
    ShutDown,
    #[error("store: {0}")]
    Store(String),
}

/// Terminal status and reason for a finished run.
pub fn classify(result: &Result<RunReport, EngineError>, fail_on_kill: bool) -> (JobStatus, Option<String>) {
    match result {
        Ok(r) if r.killed && fail_on_kill => {
            let reason = match r.alerts.iter().rev().find(|a| a.is_kill()) {
                Some(alert) => alert.reasons.join(","),
                None => "kill switch engaged".to_string(),
            };
            (JobStatus::FailedRiskViolation, Some(reason))
        }
        Ok(_) => (JobStatus::Completed, None),
        Err(EngineError::Cancelled) => (JobStatus::Cancelled, None),
        Err(EngineError::Data(e)) => (JobStatus::FailedDataGap, Some(e.to_string())),
        Err(e) => (JobStatus::FailedInternal, Some(e.to_string())),
    }
}

/// Forwards a run's public events to the stream and keeps them for the
/// store until the next checkpoint.
struct JobObserver {
    job_id: String,
    stream: broadcast::Sender<Message>,
    store: Arc<dyn DataStore>,
    kept: Arc<Mutex<Vec<Envelope>>>,
}

impl RunObserver for JobObserver {
    fn on_event(&mut self, env: &Envelope) {
        for msg in protocol::from_envelope(&self.job_id, env) {
            let _ = self.stream.send(msg);
        }
        if let Ok(mut kept) = self.kept.lock() {
            kept.push(env.clone());
        }
    }

    fn on_progress(&mut self, ticks: u64, ts: Timestamp) {
        let _ = self.stream.send(protocol::progress(&self.job_id, ticks, ts));
    }

    fn on_checkpoint(&mut self, cp: Checkpoint) {
        let batch = match self.kept.lock() {
            Ok(mut kept) => std::mem::take(&mut *kept),
            Err(_) => return,
        };
        let saved = self.store.append_events(&self.job_id, &batch).and_then(|_| self.store.put_checkpoint(&self.job_id, cp));
        if let Err(e) = saved {
            log(Level::Error, Domain::Job, "checkpoint_failed", obj(&[("job_id", v_str(&self.job_id)), ("error", v_str(&e.to_string()))]));
        }
    }
}

struct Job {
    id: String,
    request: BacktestRequest,
    cancel: CancelToken,
    submitted_ms: u64,
    resume: Option<Checkpoint>,
}

struct Shared {
    source: Arc<dyn BarSource>,
    settings: EngineSettings,
    store: Arc<dyn DataStore>,
    stream: broadcast::Sender<Message>,
    dispatcher: Option<AlertDispatcher>,
    tokens: Mutex<HashMap<String, CancelToken>>,
}

pub struct JobManager {
    shared: Arc<Shared>,
    tx: Mutex<Option<SyncSender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    next_id: AtomicU64,
}

impl JobManager {
    pub fn new(
        pool: &PoolConfig,
        source: Arc<dyn BarSource>,
        settings: EngineSettings,
        store: Arc<dyn DataStore>,
        dispatcher: Option<AlertDispatcher>,
    ) -> Self {
        let (stream, _) = broadcast::channel(1_024);
        let shared = Arc::new(Shared {
            source,
            settings,
            store,
            stream,
            dispatcher,
            tokens: Mutex::new(HashMap::new()),
        });
        let (tx, rx) = mpsc::sync_channel::<Job>(pool.queue_capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));
        let workers = (0..pool.workers.max(1))
            .map(|i| {
                let shared = Arc::clone(&shared);
                let rx = Arc::clone(&rx);
                std::thread::Builder::new()
                    .name(format!("replayfx-worker-{i}"))
                    .spawn(move || worker_loop(&shared, &rx))
            })
            .filter_map(|h| match h {
                Ok(h) => Some(h),
                Err(e) => {
                    log(Level::Error, Domain::Job, "worker_spawn_failed", obj(&[("error", v_str(&e.to_string()))]));
                    None
                }
            })
            .collect::<Vec<_>>();
        log(Level::Info, Domain::Job, "pool_started", obj(&[("workers", v_num(workers.len() as f64))]));
        Self { shared, tx: Mutex::new(Some(tx)), workers: Mutex::new(workers), next_id: AtomicU64::new(0) }
    }

    /// Updates of every job, as protocol messages.
    pub fn subscribe(&self) -> broadcast::Receiver<Message> {
        self.shared.stream.subscribe()
    }

    pub fn source(&self) -> &Arc<dyn BarSource> {
        &self.shared.source
    }

    pub fn store(&self) -> &Arc<dyn DataStore> {
        &self.shared.store
    }

    /// Validate synchronously, then queue. Invalid requests never reach a
    /// worker.
    pub fn submit(&self, request: BacktestRequest) -> Result<String, SubmitError> {
        request.validate()?;
        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let id = format!("job-{n}");
        let now = ts_epoch_ms();
        let record = JobRecord {
            job_id: id.clone(),
            strategy: request.strategy.name.clone(),
            status: JobStatus::Queued,
            reason: None,
            submitted_ms: now,
            updated_ms: now,
        };
        self.shared.store.put_job(&record).map_err(|e| SubmitError::Store(e.to_string()))?;
        self.shared.store.put_request(&id, &request).map_err(|e| SubmitError::Store(e.to_string()))?;
        self.enqueue(Job { id: id.clone(), request, cancel: CancelToken::new(), submitted_ms: now, resume: None })?;
        Ok(id)
    }

    /// Queue again every stored job that never reached a terminal status,
    /// resuming each from its last checkpoint. Call once at startup.
    pub fn recover(&self) -> Result<Vec<String>, SubmitError> {
        let jobs = self.shared.store.jobs().map_err(|e| SubmitError::Store(e.to_string()))?;
        let highest = jobs.iter().filter_map(|j| j.job_id.strip_prefix("job-")?.parse::<u64>().ok()).max().unwrap_or(0);
        self.next_id.fetch_max(highest, Ordering::SeqCst);

        let mut recovered = Vec::new();
        for rec in jobs.into_iter().filter(|j| !j.status.is_terminal()) {
            let store = &self.shared.store;
            let request = store.request(&rec.job_id).map_err(|e| SubmitError::Store(e.to_string()))?;
            let Some(request) = request else {
                self.finish(&rec.job_id, &rec.strategy, rec.submitted_ms, JobStatus::FailedInternal, Some("request not stored".into()));
                continue;
            };
            let resume = store.checkpoint(&rec.job_id).map_err(|e| SubmitError::Store(e.to_string()))?;
            log(
                Level::Info,
                Domain::Job,
                "job_recovered",
                obj(&[("job_id", v_str(&rec.job_id)), ("seq", v_num(resume.map_or(0.0, |cp| cp.seq as f64)))]),
            );
            record_status(&self.shared, &rec.job_id, &rec.strategy, rec.submitted_ms, JobStatus::Queued, None);
            self.enqueue(Job {
                id: rec.job_id.clone(),
                request,
                cancel: CancelToken::new(),
                submitted_ms: rec.submitted_ms,
                resume,
            })?;
            recovered.push(rec.job_id);
        }
        Ok(recovered)
    }

    fn enqueue(&self, job: Job) -> Result<(), SubmitError> {
        let (id, strategy, submitted_ms) = (job.id.clone(), job.request.strategy.name.clone(), job.submitted_ms);
        if let Ok(mut tokens) = self.shared.tokens.lock() {
            tokens.insert(id.clone(), job.cancel.clone());
        }
        let sent = {
            let guard = self.tx.lock().map_err(|_| SubmitError::ShutDown)?;
            match guard.as_ref() {
                Some(tx) => tx.try_send(job),
                None => Err(TrySendError::Disconnected(job)),
            }
        };
        match sent {
            Ok(()) => {
                log_job_status(&id, JobStatus::Queued.as_str(), None);
                Ok(())
            }
            Err(err) => {
                let (e, reason) = match err {
                    TrySendError::Full(_) => (SubmitError::QueueFull, "queue full"),
                    TrySendError::Disconnected(_) => (SubmitError::ShutDown, "pool shut down"),
                };
                forget(&self.shared, &id);
                self.finish(&id, &strategy, submitted_ms, JobStatus::FailedInternal, Some(reason.to_string()));
                Err(e)
            }
        }
    }

    /// Request cancellation. Returns false for unknown or finished jobs.
    pub fn cancel(&self, job_id: &str) -> bool {
        match self.shared.tokens.lock().ok().and_then(|t| t.get(job_id).cloned()) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn status(&self, job_id: &str) -> Option<JobRecord> {
        self.shared.store.job(job_id).ok().flatten()
    }

    pub fn report(&self, job_id: &str) -> Option<RunReport> {
        self.shared.store.report(job_id).ok().flatten()
    }

    /// Poll until the job is terminal or `timeout` passes.
    pub fn wait(&self, job_id: &str, timeout: Duration) -> Option<JobRecord> {
        let deadline = Instant::now() + timeout;
        loop {
            let rec = self.status(job_id);
            if rec.as_ref().map_or(false, |r| r.status.is_terminal()) || Instant::now() >= deadline {
                return rec;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    fn finish(&self, id: &str, strategy: &str, submitted_ms: u64, status: JobStatus, reason: Option<String>) {
        record_status(&self.shared, id, strategy, submitted_ms, status, reason);
    }

    /// Stop accepting jobs, let queued ones drain, and join the workers.
    pub fn shutdown(&self) {
        if let Ok(mut tx) = self.tx.lock() {
            tx.take();
        }
        let handles: Vec<_> = self.workers.lock().map(|mut w| w.drain(..).collect()).unwrap_or_default();
        for h in handles {
            let _ = h.join();
        }
    }
}

impl Drop for JobManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn record_status(shared: &Shared, id: &str, strategy: &str, submitted_ms: u64, status: JobStatus, reason: Option<String>) {
    let record = JobRecord {
        job_id: id.to_string(),
        strategy: strategy.to_string(),
        status,
        reason: reason.clone(),
        submitted_ms,
        updated_ms: ts_epoch_ms(),
    };
    if let Err(e) = shared.store.put_job(&record) {
        log(Level::Error, Domain::Job, "store_failed", obj(&[("job_id", v_str(id)), ("error", v_str(&e.to_string()))]));
    }
    log_job_status(id, status.as_str(), reason.as_deref());
    if status.is_terminal() {
        let _ = shared.stream.send(protocol::complete(id, status.as_str(), reason.as_deref(), ts_epoch_ms()));
    }
}

fn worker_loop(shared: &Shared, rx: &Mutex<Receiver<Job>>) {
    loop {
        let job = match rx.lock() {
            Ok(guard) => guard.recv(),
            Err(_) => return,
        };
        let Ok(job) = job else {
            return;
        };
        run_job(shared, job);
    }
}

fn run_job(shared: &Shared, job: Job) {
    let strategy = job.request.strategy.name.clone();
    if job.cancel.is_cancelled() {
        record_status(shared, &job.id, &strategy, job.submitted_ms, JobStatus::Cancelled, None);
        forget(shared, &job.id);
        return;
    }
    record_status(shared, &job.id, &strategy, job.submitted_ms, JobStatus::Running, None);

    let kept = Arc::new(Mutex::new(Vec::new()));
    let observer = JobObserver {
        job_id: job.id.clone(),
        stream: shared.stream.clone(),
        store: Arc::clone(&shared.store),
        kept: Arc::clone(&kept),
    };
    let dispatcher = shared.dispatcher.clone();
    let outcome = catch_unwind(AssertUnwindSafe(|| {
        run_backtest(&job.id, &job.request, shared.source.as_ref(), &shared.settings, &job.cancel, |s| {
            let mut s = s.with_observer(Box::new(observer));
            if let Some(cp) = job.resume {
                s = s.resume_after(cp);
            }
            match dispatcher {
                Some(d) => s.with_dispatcher(d),
                None => s,
            }
        })
    }));

    let (status, reason) = match outcome {
        Ok(result) => {
            let (status, reason) = classify(&result, job.request.fail_on_kill);
            if let Ok(report) = &result {
                if let Err(e) = shared.store.save_report(&job.id, report) {
                    log(Level::Error, Domain::Job, "store_failed", obj(&[("job_id", v_str(&job.id)), ("error", v_str(&e.to_string()))]));
                }
                let events = kept.lock().map(|k| k.clone()).unwrap_or_default();
                if let Err(e) = shared.store.append_events(&job.id, &events) {
                    log(Level::Error, Domain::Job, "store_failed", obj(&[("job_id", v_str(&job.id)), ("error", v_str(&e.to_string()))]));
                }
            }
            (status, reason)
        }
        Err(panic) => {
            let msg = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "panic".to_string());
            (JobStatus::FailedInternal, Some(msg))
        }
    };
    record_status(shared, &job.id, &strategy, job.submitted_ms, status, reason);
    forget(shared, &job.id);
}

fn forget(shared: &Shared, id: &str) {
    if let Ok(mut tokens) = shared.tokens.lock() {
        tokens.remove(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::HistoryCache;
    use crate::error::DataError;
    use crate::events::Bar;
    use crate::storage::MemoryStore;
    use crate::strategy::StrategyConfig;

    fn manager(workers: usize, cache: HistoryCache) -> JobManager {
        let pool = PoolConfig { workers, queue_capacity: 8 };
        JobManager::new(&pool, Arc::new(cache), EngineSettings::default(), Arc::new(MemoryStore::new()), None)
    }

    fn bars(n: u64) -> Vec<Bar> {
        (0..n)
            .map(|i| {
                let c = 100.0 + (i as f64 * 0.3).sin();
                Bar { ts: i * 60_000, interval_ms: 60_000, o: c, h: c + 0.5, l: c - 0.5, c, v: 1_000.0 }
            })
            .collect()
    }

    #[test]
    fn status_strings_round_trip() {
        for s in ["queued", "running", "completed", "cancelled", "failed:data-gap", "failed:risk-violation", "failed:internal-error"] {
            assert_eq!(JobStatus::parse(s).unwrap().as_str(), s);
        }
        assert!(JobStatus::parse("done").is_none());
    }

    #[test]
    fn classify_maps_errors() {
        let gap = Err(EngineError::Data(DataError::Empty { symbol: "X".into() }));
        assert_eq!(classify(&gap, false).0, JobStatus::FailedDataGap);
        assert_eq!(classify(&Err(EngineError::Cancelled), false).0, JobStatus::Cancelled);
        assert_eq!(classify(&Err(EngineError::Internal("x".into())), false).0, JobStatus::FailedInternal);
    }

    #[test]
    fn invalid_request_is_refused_synchronously() {
        let jm = manager(1, HistoryCache::new(60_000));
        let mut req = BacktestRequest::new(StrategyConfig::default());
        req.strategy.name = " ".into();
        assert!(matches!(jm.submit(req), Err(SubmitError::Invalid(_))));
    }

    #[test]
    fn jobs_complete_and_store_reports() {
        let cache = HistoryCache::new(60_000);
        cache.insert("BTC", bars(300));
        let jm = manager(2, cache);
        let ids: Vec<String> =
            (0..3).map(|_| jm.submit(BacktestRequest::new(StrategyConfig::default())).unwrap()).collect();
        for id in &ids {
            let rec = jm.wait(id, Duration::from_secs(30)).unwrap();
            assert_eq!(rec.status, JobStatus::Completed, "{:?}", rec.reason);
        }
        let hashes: Vec<String> = ids.iter().map(|id| jm.report(id).unwrap().trade_log_sha256).collect();
        assert!(hashes.windows(2).all(|w| w[0] == w[1]));
    }

    #[test]
    fn interrupted_jobs_resume_from_their_checkpoint() {
        let cache = HistoryCache::new(60_000);
        cache.insert("BTC", bars(300));
        let store: Arc<dyn DataStore> = Arc::new(MemoryStore::new());
        let req = BacktestRequest::new(StrategyConfig::default());
        let record = |id: &str, status| JobRecord {
            job_id: id.into(),
            strategy: req.strategy.name.clone(),
            status,
            reason: None,
            submitted_ms: 1,
            updated_ms: 1,
        };
        store.put_job(&record("job-7", JobStatus::Running)).unwrap();
        store.put_request("job-7", &req).unwrap();
        // Tick 500 is the close of bar 124.
        store.put_checkpoint("job-7", Checkpoint { ts: 124 * 60_000 + 59_999, seq: 500 }).unwrap();
        store.put_job(&record("job-8", JobStatus::Queued)).unwrap();
        store.put_job(&record("job-3", JobStatus::Completed)).unwrap();

        let pool = PoolConfig { workers: 1, queue_capacity: 8 };
        let jm = JobManager::new(&pool, Arc::new(cache), EngineSettings::default(), Arc::clone(&store), None);
        assert_eq!(jm.recover().unwrap(), vec!["job-7".to_string()]);
        let rec = jm.wait("job-7", Duration::from_secs(30)).unwrap();
        assert_eq!(rec.status, JobStatus::Completed, "{:?}", rec.reason);
        assert_eq!(jm.status("job-8").unwrap().status, JobStatus::FailedInternal);
        assert_eq!(jm.status("job-3").unwrap().status, JobStatus::Completed);

        let fresh = jm.submit(req).unwrap();
        assert_eq!(fresh, "job-9");
        jm.wait(&fresh, Duration::from_secs(30));
        assert_eq!(jm.report("job-7").unwrap().trade_log_sha256, jm.report(&fresh).unwrap().trade_log_sha256);
        assert!(store.checkpoint(&fresh).unwrap().is_some());
    }

    #[test]
    fn missing_data_fails_as_data_gap() {
        let jm = manager(1, HistoryCache::new(60_000));
        let mut req = BacktestRequest::new(StrategyConfig::default());
        req.symbols = vec!["NOPE".into()];
        let id = jm.submit(req).unwrap();
        let rec = jm.wait(&id, Duration::from_secs(10)).unwrap();
        assert_eq!(rec.status, JobStatus::FailedDataGap);
        assert!(jm.report(&id).is_none());
    }

    #[test]
    fn stream_carries_completion() {
        let cache = HistoryCache::new(60_000);
        cache.insert("BTC", bars(100));
        let jm = manager(1, cache);
        let mut rx = jm.subscribe();
        let id = jm.submit(BacktestRequest::new(StrategyConfig::default())).unwrap();
        jm.wait(&id, Duration::from_secs(10));
        let mut saw_complete = false;
        let deadline = Instant::now() + Duration::from_secs(5);
        while !saw_complete && Instant::now() < deadline {
            match rx.try_recv() {
                Ok(m) => saw_complete = m.method == protocol::BACKTEST_COMPLETE && m.job_id() == Some(id.as_str()),
                Err(broadcast::error::TryRecvError::Lagged(_)) => {}
                Err(_) => std::thread::sleep(Duration::from_millis(5)),
            }
        }
        assert!(saw_complete);
    }
}
