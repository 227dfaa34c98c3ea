//! Market data: CSV bars, replay, fingerprints and the shared history cache.

pub mod csv;
pub mod replay;

use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;

use crate::error::DataError;
use crate::events::{Bar, Tick, Timestamp};

pub use self::csv::{inspect_csv, parse_bar_line, CsvBars, DatasetManifest, Gap, EXPECTED_COLUMNS};
pub use self::replay::{expand_bar, BarIter, Checkpoint, GapFilled, ReplayConfig, ReplayItem, Replayer};

/// Inclusive timestamp bounds; `None` means open-ended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TimeRange {
    pub start: Option<Timestamp>,
    pub end: Option<Timestamp>,
}

impl TimeRange {
    pub fn contains(&self, ts: Timestamp) -> bool {
        self.start.map_or(true, |s| ts >= s) && self.end.map_or(true, |e| ts <= e)
    }
}

fn clip(bars: BarIter, range: TimeRange) -> BarIter {
    Box::new(bars.filter(move |b| match b {
        Ok(bar) => range.contains(bar.ts),
        Err(_) => true,
    }))
}

/// Synchronous bar access for deterministic runs.
pub trait BarSource: Send + Sync {
    fn symbols(&self) -> Vec<String>;
    fn open(&self, symbol: &str, range: TimeRange) -> Result<BarIter, DataError>;
    /// Stable content hash of the symbol's full dataset.
    fn fingerprint(&self, symbol: &str) -> Result<String, DataError>;
    fn interval_ms(&self) -> u64;
}

/// Historical and live market data, consumed asynchronously.
#[async_trait]
pub trait MarketDataSource: Send + Sync {
    fn name(&self) -> &str;

    async fn bars(&self, symbol: &str, range: TimeRange) -> Result<Vec<Bar>, DataError>;

    async fn subscribe(&self, symbols: &[String]) -> Result<mpsc::Receiver<(Timestamp, Tick)>, DataError> {
        let _ = symbols;
        Err(DataError::Source(format!("{} has no live feed", self.name())))
    }
}

// =============================================================================
// Fingerprints
// =============================================================================

pub fn file_sha256(path: &Path) -> Result<String, DataError> {
    let mut file = File::open(path).map_err(|e| DataError::Source(format!("{}: {e}", path.display())))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf).map_err(|e| DataError::Source(e.to_string()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

pub fn bars_sha256(bars: &[Bar]) -> String {
    let mut hasher = Sha256::new();
    for b in bars {
        hasher.update(format!("{},{},{},{},{},{}\n", b.ts, b.o, b.h, b.l, b.c, b.v).as_bytes());
    }
    hex::encode(hasher.finalize())
}

// =============================================================================
// CSV directory
// =============================================================================

/// `<dir>/<SYMBOL>.csv` files.
#[derive(Debug, Clone)]
pub struct CsvDir {
    dir: PathBuf,
    interval_ms: u64,
}

impl CsvDir {
    pub fn new(dir: impl Into<PathBuf>, interval_ms: u64) -> Self {
        Self { dir: dir.into(), interval_ms }
    }

    pub fn path(&self, symbol: &str) -> PathBuf {
        self.dir.join(format!("{symbol}.csv"))
    }

    pub fn manifest(&self, symbol: &str) -> Result<DatasetManifest, DataError> {
        inspect_csv(&self.path(symbol), self.interval_ms)
    }
}

impl BarSource for CsvDir {
    fn symbols(&self) -> Vec<String> {
        let mut out: Vec<String> = std::fs::read_dir(&self.dir)
            .map(|rd| {
                rd.filter_map(|e| e.ok())
                    .filter_map(|e| {
                        let p = e.path();
                        if p.extension().and_then(|x| x.to_str()) == Some("csv") {
                            p.file_stem().and_then(|s| s.to_str()).map(str::to_string)
                        } else {
                            None
                        }
                    })
                    .collect()
            })
            .unwrap_or_default();
        out.sort();
        out
    }

    fn open(&self, symbol: &str, range: TimeRange) -> Result<BarIter, DataError> {
        let path = self.path(symbol);
        if !path.exists() {
            return Err(DataError::Empty { symbol: symbol.to_string() });
        }
        Ok(clip(Box::new(CsvBars::open(&path, self.interval_ms)?), range))
    }

    fn fingerprint(&self, symbol: &str) -> Result<String, DataError> {
        file_sha256(&self.path(symbol))
    }

    fn interval_ms(&self) -> u64 {
        self.interval_ms
    }
}

#[async_trait]
impl MarketDataSource for CsvDir {
    fn name(&self) -> &str {
        "csv"
    }

    async fn bars(&self, symbol: &str, range: TimeRange) -> Result<Vec<Bar>, DataError> {
        self.open(symbol, range)?.collect()
    }
}

// =============================================================================
// History cache
// =============================================================================

/// Read-mostly bar cache shared across runs. Entries are immutable once
/// inserted; readers clone the `Arc`.
#[derive(Clone, Default)]
pub struct HistoryCache {
    inner: Arc<RwLock<HashMap<String, Arc<Vec<Bar>>>>>,
    interval_ms: u64,
}

impl HistoryCache {
    pub fn new(interval_ms: u64) -> Self {
        Self { inner: Arc::default(), interval_ms }
    }

    pub fn insert(&self, symbol: &str, bars: Vec<Bar>) {
        if let Ok(mut map) = self.inner.write() {
            map.insert(symbol.to_string(), Arc::new(bars));
        }
    }

    pub fn get(&self, symbol: &str) -> Option<Arc<Vec<Bar>>> {
        self.inner.read().ok().and_then(|m| m.get(symbol).cloned())
    }

    /// Fetch from `source` unless the symbol is already cached.
    pub async fn load(&self, source: &dyn MarketDataSource, symbol: &str) -> Result<Arc<Vec<Bar>>, DataError> {
        if let Some(hit) = self.get(symbol) {
            return Ok(hit);
        }
        let bars = source.bars(symbol, TimeRange::default()).await?;
        if bars.is_empty() {
            return Err(DataError::Empty { symbol: symbol.to_string() });
        }
        self.insert(symbol, bars);
        self.get(symbol).ok_or_else(|| DataError::Source("cache lock poisoned".to_string()))
    }

    /// Load a symbol straight from a sync source.
    pub fn load_sync(&self, source: &dyn BarSource, symbol: &str) -> Result<Arc<Vec<Bar>>, DataError> {
        if let Some(hit) = self.get(symbol) {
            return Ok(hit);
        }
        let bars: Vec<Bar> = source.open(symbol, TimeRange::default())?.collect::<Result<_, _>>()?;
        self.insert(symbol, bars);
        self.get(symbol).ok_or_else(|| DataError::Source("cache lock poisoned".to_string()))
    }
}

impl BarSource for HistoryCache {
    fn symbols(&self) -> Vec<String> {
        let mut out: Vec<String> = self.inner.read().map(|m| m.keys().cloned().collect()).unwrap_or_default();
        out.sort();
        out
    }

    fn open(&self, symbol: &str, range: TimeRange) -> Result<BarIter, DataError> {
        let bars = self.get(symbol).ok_or_else(|| DataError::Empty { symbol: symbol.to_string() })?;
        let iter = (0..bars.len()).map(move |i| Ok::<Bar, DataError>(bars[i]));
        Ok(clip(Box::new(iter), range))
    }

    fn fingerprint(&self, symbol: &str) -> Result<String, DataError> {
        let bars = self.get(symbol).ok_or_else(|| DataError::Empty { symbol: symbol.to_string() })?;
        Ok(bars_sha256(&bars))
    }

    fn interval_ms(&self) -> u64 {
        self.interval_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_csv(dir: &Path, symbol: &str, rows: &[&str]) {
        let mut out = EXPECTED_COLUMNS.join(",");
        out.push('\n');
        for r in rows {
            out.push_str(r);
            out.push('\n');
        }
        std::fs::write(dir.join(format!("{symbol}.csv")), out).unwrap();
    }

    #[test]
    fn csv_dir_lists_and_opens() {
        let tmp = tempfile::TempDir::new().unwrap();
        write_csv(tmp.path(), "ETH", &["0,1,2,1,1.5,3", "60000,1,2,1,1.5,3"]);
        write_csv(tmp.path(), "BTC", &["0,1,2,1,1.5,3"]);
        let src = CsvDir::new(tmp.path(), 60_000);
        assert_eq!(src.symbols(), vec!["BTC".to_string(), "ETH".to_string()]);
        let range = TimeRange { start: Some(60_000), end: None };
        let bars: Vec<Bar> = src.open("ETH", range).unwrap().map(|b| b.unwrap()).collect();
        assert_eq!(bars.len(), 1);
        assert!(matches!(src.open("SOL", TimeRange::default()), Err(DataError::Empty { .. })));
    }

    #[test]
    fn fingerprint_changes_with_content() {
        let tmp = tempfile::TempDir::new().unwrap();
        write_csv(tmp.path(), "BTC", &["0,1,2,1,1.5,3"]);
        let src = CsvDir::new(tmp.path(), 60_000);
        let a = src.fingerprint("BTC").unwrap();
        write_csv(tmp.path(), "BTC", &["0,1,2,1,1.6,3"]);
        assert_ne!(a, src.fingerprint("BTC").unwrap());
    }

    #[test]
    fn cache_shares_one_copy() {
        let tmp = tempfile::TempDir::new().unwrap();
        write_csv(tmp.path(), "BTC", &["0,1,2,1,1.5,3", "60000,1,2,1,1.5,3"]);
        let src = CsvDir::new(tmp.path(), 60_000);
        let cache = HistoryCache::new(60_000);
        let a = cache.load_sync(&src, "BTC").unwrap();
        let b = cache.clone().load_sync(&src, "BTC").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.open("BTC", TimeRange::default()).unwrap().count(), 2);
        assert_eq!(cache.fingerprint("BTC").unwrap(), bars_sha256(&a));
    }

    #[tokio::test]
    async fn csv_dir_serves_async_bars() {
        let tmp = tempfile::TempDir::new().unwrap();
        write_csv(tmp.path(), "BTC", &["0,1,2,1,1.5,3"]);
        let src = CsvDir::new(tmp.path(), 60_000);
        let bars = MarketDataSource::bars(&src, "BTC", TimeRange::default()).await.unwrap();
        assert_eq!(bars.len(), 1);
        assert!(src.subscribe(&["BTC".to_string()]).await.is_err());
    }
}
