//! Lazy CSV bar reading.
//!
//! Format: optional `ts,open,high,low,close,volume[,...]` header, `#` comments,
//! one bar per row. `ts` is the bar open time in epoch milliseconds. Extra
//! columns are ignored.

use std::fs::File;
use std::io::{BufRead, BufReader, Lines};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::DataError;
use crate::events::Bar;

pub const EXPECTED_COLUMNS: [&str; 6] = ["ts", "open", "high", "low", "close", "volume"];

/// Parse one data row. `line_no` is only used for error context.
pub fn parse_bar_line(line: &str, line_no: usize, interval_ms: u64) -> Result<Bar, DataError> {
    let parts: Vec<&str> = line.split(',').map(str::trim).collect();
    if parts.len() < 6 {
        return Err(DataError::Corrupt {
            line: line_no,
            reason: format!("expected 6+ columns, got {}", parts.len()),
        });
    }
    let num = |i: usize, name: &str| -> Result<f64, DataError> {
        let v: f64 = parts[i].parse().map_err(|_| DataError::Corrupt {
            line: line_no,
            reason: format!("bad {name}: {:?}", parts[i]),
        })?;
        if !v.is_finite() {
            return Err(DataError::Corrupt { line: line_no, reason: format!("non-finite {name}") });
        }
        Ok(v)
    };
    let ts: u64 = parts[0].parse().map_err(|_| DataError::Corrupt {
        line: line_no,
        reason: format!("bad ts: {:?}", parts[0]),
    })?;
    let bar = Bar {
        ts,
        interval_ms,
        o: num(1, "open")?,
        h: num(2, "high")?,
        l: num(3, "low")?,
        c: num(4, "close")?,
        v: num(5, "volume")?,
    };
    if bar.l > bar.h || bar.o > bar.h || bar.o < bar.l || bar.c > bar.h || bar.c < bar.l || bar.v < 0.0 {
        return Err(DataError::Corrupt { line: line_no, reason: "inconsistent ohlcv".to_string() });
    }
    if bar.l <= 0.0 {
        return Err(DataError::Corrupt { line: line_no, reason: "non-positive price".to_string() });
    }
    Ok(bar)
}

/// Streams bars from a CSV file one line at a time.
pub struct CsvBars {
    lines: Lines<BufReader<File>>,
    line_no: usize,
    interval_ms: u64,
    failed: bool,
}

impl CsvBars {
    pub fn open(path: &Path, interval_ms: u64) -> Result<Self, DataError> {
        let file = File::open(path).map_err(|e| DataError::Source(format!("{}: {e}", path.display())))?;
        Ok(Self { lines: BufReader::new(file).lines(), line_no: 0, interval_ms, failed: false })
    }
}

impl Iterator for CsvBars {
    type Item = Result<Bar, DataError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            let line = match self.lines.next()? {
                Ok(l) => l,
                Err(e) => {
                    self.failed = true;
                    return Some(Err(DataError::Source(e.to_string())));
                }
            };
            self.line_no += 1;
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            if trimmed.to_lowercase().starts_with("ts,") {
                continue;
            }
            let parsed = parse_bar_line(trimmed, self.line_no, self.interval_ms);
            if parsed.is_err() {
                self.failed = true;
            }
            return Some(parsed);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Gap {
    pub start_ts: u64,
    pub end_ts: u64,
    pub missing_bars: u64,
}

/// Summary of one dataset file, without loading it into memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetManifest {
    pub path: String,
    pub hash_sha256: String,
    pub row_count: u64,
    pub bad_rows: u64,
    pub ts_min: Option<u64>,
    pub ts_max: Option<u64>,
    pub interval_ms: u64,
    pub gaps: Vec<Gap>,
    pub warnings: Vec<String>,
}

pub fn inspect_csv(path: &Path, interval_ms: u64) -> Result<DatasetManifest, DataError> {
    let hash = super::file_sha256(path)?;
    let file = File::open(path).map_err(|e| DataError::Source(e.to_string()))?;
    let mut m = DatasetManifest {
        path: path.display().to_string(),
        hash_sha256: hash,
        row_count: 0,
        bad_rows: 0,
        ts_min: None,
        ts_max: None,
        interval_ms,
        gaps: Vec::new(),
        warnings: Vec::new(),
    };
    let mut prev: Option<u64> = None;
    for (i, line) in BufReader::new(file).lines().map_while(Result::ok).enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.to_lowercase().starts_with("ts,") {
            continue;
        }
        match parse_bar_line(trimmed, i + 1, interval_ms) {
            Ok(bar) => {
                m.row_count += 1;
                m.ts_min = Some(m.ts_min.map_or(bar.ts, |v| v.min(bar.ts)));
                m.ts_max = Some(m.ts_max.map_or(bar.ts, |v| v.max(bar.ts)));
                if let Some(p) = prev {
                    if bar.ts <= p {
                        m.warnings.push(format!("non_monotonic_ts: prev={p} current={}", bar.ts));
                    } else if interval_ms > 0 && bar.ts - p > interval_ms {
                        m.gaps.push(Gap { start_ts: p, end_ts: bar.ts, missing_bars: (bar.ts - p) / interval_ms - 1 });
                    }
                }
                prev = Some(bar.ts);
            }
            Err(e) => {
                m.bad_rows += 1;
                m.warnings.push(format!("bad_row: {e}"));
            }
        }
    }
    Ok(m)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_row_with_extra_columns() {
        let bar = parse_bar_line("1700000000000,100,101,99,100.5,12,0.0001", 1, 60_000).unwrap();
        assert_eq!(bar.ts, 1_700_000_000_000);
        assert_eq!(bar.c, 100.5);
        assert_eq!(bar.interval_ms, 60_000);
    }

    #[test]
    fn rejects_inconsistent_rows() {
        let err = parse_bar_line("1000,100,99,101,100,1", 7, 60_000).unwrap_err();
        assert!(matches!(err, DataError::Corrupt { line: 7, .. }));
        assert!(parse_bar_line("1000,100,101", 1, 60_000).is_err());
        assert!(parse_bar_line("1000,abc,101,99,100,1", 1, 60_000).is_err());
    }

    #[test]
    fn reader_stops_after_corrupt_row() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("BTC.csv");
        std::fs::write(&path, "ts,open,high,low,close,volume\n# comment\n60000,1,2,1,1.5,3\nbroken\n180000,1,2,1,1.5,3\n").unwrap();
        let items: Vec<_> = CsvBars::open(&path, 60_000).unwrap().collect();
        assert_eq!(items.len(), 2);
        assert!(items[0].is_ok());
        assert!(matches!(items[1], Err(DataError::Corrupt { line: 4, .. })));
    }

    #[test]
    fn inspect_reports_gaps() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("ETH.csv");
        std::fs::write(&path, "ts,open,high,low,close,volume\n60000,1,2,1,1.5,3\n240000,1,2,1,1.5,3\n").unwrap();
        let m = inspect_csv(&path, 60_000).unwrap();
        assert_eq!(m.row_count, 2);
        assert_eq!(m.gaps.len(), 1);
        assert_eq!(m.gaps[0].missing_bars, 2);
        assert_eq!(m.hash_sha256.len(), 64);
    }
}
