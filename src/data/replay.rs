//! Ordered tick replay over one or more bar streams.
//!
//! Bars are expanded into four intrabar ticks so fills can happen inside a
//! bar. Symbols are merged by `(ts, symbol)`; at most `lookahead` ticks are
//! buffered ahead of the consumer regardless of dataset length.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::error::DataError;
use crate::events::{Bar, Tick, TickPhase, Timestamp};
use crate::logging::{log, obj, v_num, v_str, Domain, Level};

pub type BarIter = Box<dyn Iterator<Item = Result<Bar, DataError>> + Send>;

/// Last delivered position of a replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub ts: Timestamp,
    pub seq: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReplayItem {
    pub seq: u64,
    pub ts: Timestamp,
    pub tick: Tick,
    /// At or before the resume checkpoint: already delivered once.
    pub restoring: bool,
}

#[derive(Debug, Clone)]
pub struct ReplayConfig {
    pub lookahead: usize,
    pub gap_fill_tolerance: u64,
    pub interval_ms: u64,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self { lookahead: 256, gap_fill_tolerance: 2, interval_ms: 60_000 }
    }
}

/// The four ticks of one bar: open, then the extreme the path reaches
/// first, then the other extreme, then close. Up bars dip first.
pub fn expand_bar(symbol: &str, bar: &Bar) -> [(Timestamp, Tick); 4] {
    let iv = bar.interval_ms;
    let offsets = if iv >= 4 { [0, iv / 4, iv / 2, iv - 1] } else { [0, 0, 0, iv.saturating_sub(1)] };
    let (first, second) = if bar.c >= bar.o {
        ((bar.l, TickPhase::Low), (bar.h, TickPhase::High))
    } else {
        ((bar.h, TickPhase::High), (bar.l, TickPhase::Low))
    };
    let vol = bar.v / 4.0;
    let tick = |price: f64, phase: TickPhase, closing: bool| Tick {
        symbol: symbol.to_string(),
        price,
        volume: vol,
        phase,
        bar: if closing { Some(*bar) } else { None },
    };
    [
        (bar.ts + offsets[0], tick(bar.o, TickPhase::Open, false)),
        (bar.ts + offsets[1], tick(first.0, first.1, false)),
        (bar.ts + offsets[2], tick(second.0, second.1, false)),
        (bar.ts + offsets[3], tick(bar.c, TickPhase::Close, true)),
    ]
}

// =============================================================================
// Gap handling
// =============================================================================

/// Validates ordering and forward-fills short gaps with flat bars.
pub struct GapFilled {
    symbol: String,
    inner: BarIter,
    interval_ms: u64,
    tolerance: u64,
    prev: Option<Bar>,
    pending: VecDeque<Bar>,
    failed: bool,
    filled: u64,
}

impl GapFilled {
    pub fn new(symbol: &str, inner: BarIter, interval_ms: u64, tolerance: u64) -> Self {
        Self {
            symbol: symbol.to_string(),
            inner,
            interval_ms,
            tolerance,
            prev: None,
            pending: VecDeque::new(),
            failed: false,
            filled: 0,
        }
    }

    pub fn filled(&self) -> u64 {
        self.filled
    }

    fn fail(&mut self, e: DataError) -> Option<Result<Bar, DataError>> {
        self.failed = true;
        log(Level::Error, Domain::Data, "data_error", obj(&[("symbol", v_str(&self.symbol)), ("error", v_str(&e.to_string()))]));
        Some(Err(e))
    }
}

impl Iterator for GapFilled {
    type Item = Result<Bar, DataError>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(bar) = self.pending.pop_front() {
            self.prev = Some(bar);
            return Some(Ok(bar));
        }
        if self.failed {
            return None;
        }
        let bar = match self.inner.next()? {
            Ok(b) => b,
            Err(e) => return self.fail(e),
        };
        let Some(prev) = self.prev else {
            self.prev = Some(bar);
            return Some(Ok(bar));
        };
        if bar.ts <= prev.ts {
            let e = DataError::NonMonotonic { symbol: self.symbol.clone(), prev: prev.ts, current: bar.ts };
            return self.fail(e);
        }
        let diff = bar.ts - prev.ts;
        if self.interval_ms > 0 && diff > self.interval_ms {
            let missing = diff / self.interval_ms - 1;
            if missing > self.tolerance {
                let e = DataError::Gap {
                    symbol: self.symbol.clone(),
                    start_ts: prev.ts,
                    end_ts: bar.ts,
                    missing_bars: missing,
                    tolerance: self.tolerance,
                };
                return self.fail(e);
            }
            if missing > 0 {
                log(
                    Level::Warn,
                    Domain::Data,
                    "gap_filled",
                    obj(&[
                        ("symbol", v_str(&self.symbol)),
                        ("start_ts", v_num(prev.ts as f64)),
                        ("missing_bars", v_num(missing as f64)),
                    ]),
                );
            }
            for i in 1..=missing {
                self.pending.push_back(Bar {
                    ts: prev.ts + i * self.interval_ms,
                    interval_ms: self.interval_ms,
                    o: prev.c,
                    h: prev.c,
                    l: prev.c,
                    c: prev.c,
                    v: 0.0,
                });
                self.filled += 1;
            }
        }
        self.pending.push_back(bar);
        self.next()
    }
}

// =============================================================================
// Merge + look-ahead
// =============================================================================

struct SymbolStream {
    symbol: String,
    bars: GapFilled,
    ticks: VecDeque<(Timestamp, Tick)>,
    exhausted: bool,
}

impl SymbolStream {
    /// Make sure a front tick is available if the stream has more.
    fn prime(&mut self) -> Result<(), DataError> {
        while self.ticks.is_empty() && !self.exhausted {
            match self.bars.next() {
                Some(Ok(bar)) => self.ticks.extend(expand_bar(&self.symbol, &bar)),
                Some(Err(e)) => {
                    self.exhausted = true;
                    return Err(e);
                }
                None => self.exhausted = true,
            }
        }
        Ok(())
    }
}

pub struct Replayer {
    streams: Vec<SymbolStream>,
    buffer: VecDeque<ReplayItem>,
    lookahead: usize,
    seq: u64,
    last: Option<Checkpoint>,
    resume: Option<Checkpoint>,
    error: Option<DataError>,
    done: bool,
}

impl Replayer {
    pub fn new(cfg: &ReplayConfig) -> Self {
        Self {
            streams: Vec::new(),
            buffer: VecDeque::new(),
            lookahead: cfg.lookahead.max(1),
            seq: 0,
            last: None,
            resume: None,
            error: None,
            done: false,
        }
    }

    /// Add a symbol's bars. Streams are kept sorted by symbol.
    pub fn add_stream(&mut self, symbol: &str, bars: BarIter, cfg: &ReplayConfig) {
        let stream = SymbolStream {
            symbol: symbol.to_string(),
            bars: GapFilled::new(symbol, bars, cfg.interval_ms, cfg.gap_fill_tolerance),
            ticks: VecDeque::new(),
            exhausted: false,
        };
        let at = self.streams.partition_point(|s| s.symbol.as_str() < symbol);
        self.streams.insert(at, stream);
    }

    /// Mark everything up to and including `cp` as `restoring`, so a
    /// stateful consumer can rebuild without emitting twice. The tick at
    /// `cp.seq` must carry `cp.ts`.
    pub fn resume_from(&mut self, cp: Checkpoint) {
        self.resume = Some(cp);
    }

    pub fn checkpoint(&self) -> Option<Checkpoint> {
        self.last
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn gap_filled_bars(&self) -> u64 {
        self.streams.iter().map(|s| s.bars.filled()).sum()
    }

    fn next_merged(&mut self) -> Result<Option<(Timestamp, Tick)>, DataError> {
        for s in self.streams.iter_mut() {
            s.prime()?;
        }
        let pick = self
            .streams
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.ticks.front().map(|(ts, _)| (*ts, i)))
            .min();
        Ok(pick.and_then(|(_, i)| self.streams[i].ticks.pop_front()))
    }

    fn fill(&mut self) {
        while !self.done && self.error.is_none() && self.buffer.len() < self.lookahead {
            match self.next_merged() {
                Ok(Some((ts, tick))) => {
                    self.seq += 1;
                    self.buffer.push_back(ReplayItem { seq: self.seq, ts, tick, restoring: false });
                }
                Ok(None) => self.done = true,
                Err(e) => self.error = Some(e),
            }
        }
    }
}

impl Iterator for Replayer {
    type Item = Result<ReplayItem, DataError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() {
            self.fill();
        }
        let Some(mut item) = self.buffer.pop_front() else {
            if let Some(e) = self.error.take() {
                return Some(Err(e));
            }
            return self.resume.take().map(|cp| {
                Err(DataError::Source(format!("checkpoint seq {} is past the end of the data", cp.seq)))
            });
        };
        if let Some(cp) = self.resume {
            if item.seq == cp.seq {
                self.resume = None;
                if item.ts != cp.ts {
                    return Some(Err(DataError::Source(format!(
                        "checkpoint mismatch at seq {}: expected ts {}, found {}",
                        cp.seq, cp.ts, item.ts
                    ))));
                }
            }
            item.restoring = true;
        }
        self.last = Some(Checkpoint { ts: item.ts, seq: item.seq });
        Some(Ok(item))
    }
}
