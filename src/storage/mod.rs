//! Persistence layer.
//!
//! Cycle records are kept in an append-only JSON-lines file (one
//! `CycleRecord` per line). The only in-place change ever made is the
//! scenario back-fill of the sequence that just closed, which rewrites the
//! file through a temp file + rename. Alerts go to a JSON-lines log and/or
//! the tracing subscriber.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::types::{Bar, CycleRecord, GaleError, Scenario};

/// Default record file path.
pub const DEFAULT_RECORD_FILE: &str = "gale_records.jsonl";

// ---------------------------------------------------------------------------
// Record store
// ---------------------------------------------------------------------------

/// Append-only store of cycle records.
pub trait RecordStore: Send + Sync {
    fn append(&mut self, record: &CycleRecord) -> Result<()>;

    /// Back-fill `scenario` onto every row of `sequence_id`. Returns rows tagged.
    fn tag_scenario(&mut self, sequence_id: &str, scenario: Scenario) -> Result<usize>;

    /// The last `n` records, oldest first.
    fn recent(&self, n: usize) -> Vec<CycleRecord>;

    fn by_instrument(&self, instrument: &str) -> Vec<CycleRecord>;

    fn all(&self) -> Vec<CycleRecord>;
}

fn tag_rows(records: &mut [CycleRecord], sequence_id: &str, scenario: Scenario) -> usize {
    let mut tagged = 0;
    for record in records.iter_mut().filter(|r| r.sequence_id == sequence_id) {
        record.scenario = Some(scenario);
        tagged += 1;
    }
    tagged
}

fn tail(records: &[CycleRecord], n: usize) -> Vec<CycleRecord> {
    records[records.len().saturating_sub(n)..].to_vec()
}

/// In-memory store for tests and backtests.
#[derive(Debug, Default, Clone)]
pub struct MemoryRecordStore {
    records: Vec<CycleRecord>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RecordStore for MemoryRecordStore {
    fn append(&mut self, record: &CycleRecord) -> Result<()> {
        self.records.push(record.clone());
        Ok(())
    }

    fn tag_scenario(&mut self, sequence_id: &str, scenario: Scenario) -> Result<usize> {
        Ok(tag_rows(&mut self.records, sequence_id, scenario))
    }

    fn recent(&self, n: usize) -> Vec<CycleRecord> {
        tail(&self.records, n)
    }

    fn by_instrument(&self, instrument: &str) -> Vec<CycleRecord> {
        self.records
            .iter()
            .filter(|r| r.instrument == instrument)
            .cloned()
            .collect()
    }

    fn all(&self) -> Vec<CycleRecord> {
        self.records.clone()
    }
}

/// JSON-lines file store. Keeps a copy of every row in memory.
#[derive(Debug)]
pub struct JsonlRecordStore {
    path: PathBuf,
    records: Vec<CycleRecord>,
}

impl JsonlRecordStore {
    /// Open (or start) a record file. Unparseable lines are skipped with a warning.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut records = Vec::new();

        if path.exists() {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read records from {}", path.display()))?;
            for (lineno, line) in text.lines().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<CycleRecord>(line) {
                    Ok(record) => records.push(record),
                    Err(e) => warn!(
                        path = %path.display(),
                        line = lineno + 1,
                        error = %e,
                        "Skipping malformed record"
                    ),
                }
            }
            info!(path = %path.display(), records = records.len(), "Record store loaded");
        } else {
            info!(path = %path.display(), "No record file found, starting fresh");
        }

        Ok(Self { path, records })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn rewrite(&self) -> Result<()> {
        let tmp = self.path.with_extension("jsonl.tmp");
        let mut body = String::new();
        for record in &self.records {
            body.push_str(&serde_json::to_string(record).context("Failed to serialise record")?);
            body.push('\n');
        }
        std::fs::write(&tmp, body).with_context(|| format!("Failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;
        Ok(())
    }
}

impl RecordStore for JsonlRecordStore {
    fn append(&mut self, record: &CycleRecord) -> Result<()> {
        let line = serde_json::to_string(record).context("Failed to serialise record")?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open {}", self.path.display()))?;
        writeln!(file, "{line}").with_context(|| format!("Failed to append to {}", self.path.display()))?;

        self.records.push(record.clone());
        debug!(sequence_id = %record.sequence_id, level = %record.level_label, "Record appended");
        Ok(())
    }

    fn tag_scenario(&mut self, sequence_id: &str, scenario: Scenario) -> Result<usize> {
        let tagged = tag_rows(&mut self.records, sequence_id, scenario);
        if tagged > 0 {
            self.rewrite()?;
        }
        debug!(sequence_id, scenario = scenario.code(), rows = tagged, "Scenario tagged");
        Ok(tagged)
    }

    fn recent(&self, n: usize) -> Vec<CycleRecord> {
        tail(&self.records, n)
    }

    fn by_instrument(&self, instrument: &str) -> Vec<CycleRecord> {
        self.records
            .iter()
            .filter(|r| r.instrument == instrument)
            .cloned()
            .collect()
    }

    fn all(&self) -> Vec<CycleRecord> {
        self.records.clone()
    }
}

// ---------------------------------------------------------------------------
// Bars
// ---------------------------------------------------------------------------

/// Load a JSON array of bars, sorted oldest→newest.
pub fn load_bars(path: impl AsRef<Path>) -> Result<Vec<Bar>> {
    let path = path.as_ref();
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read bars from {}", path.display()))?;
    let mut bars: Vec<Bar> = serde_json::from_str(&json)
        .with_context(|| format!("Failed to parse bars from {}", path.display()))?;
    if bars.is_empty() {
        return Err(GaleError::Storage(format!("no bars in {}", path.display())).into());
    }
    if let Some(bad) = bars.iter().find(|b| DateTime::<Utc>::from_timestamp(b.time, 0).is_none()) {
        return Err(GaleError::Storage(format!(
            "bar time {} out of range in {}",
            bad.time,
            path.display()
        ))
        .into());
    }
    bars.sort_by_key(|b| b.time);
    if let Some(pair) = bars.windows(2).find(|w| w[0].time == w[1].time) {
        return Err(GaleError::Storage(format!(
            "duplicate bar time {} in {}",
            pair[0].time,
            path.display()
        ))
        .into());
    }
    debug!(path = %path.display(), bars = bars.len(), "Bars loaded");
    Ok(bars)
}

// ---------------------------------------------------------------------------
// Alerts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertKind {
    StopLoss,
    TotalLoss,
    LossStreak,
    Warning,
    Info,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub timestamp: DateTime<Utc>,
    pub kind: AlertKind,
    pub message: String,
    pub data: serde_json::Value,
}

/// Destination for guard and session alerts. Delivery is best-effort.
pub trait AlertSink: Send + Sync {
    fn log_alert(&self, kind: AlertKind, message: &str, data: serde_json::Value);
}

/// Emits alerts as tracing events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAlertSink;

impl AlertSink for TracingAlertSink {
    fn log_alert(&self, kind: AlertKind, message: &str, data: serde_json::Value) {
        match kind {
            AlertKind::Info => info!(kind = ?kind, data = %data, "{message}"),
            _ => warn!(kind = ?kind, data = %data, "{message}"),
        }
    }
}

/// Appends alerts to a JSON-lines file and mirrors them to tracing.
#[derive(Debug, Clone)]
pub struct JsonAlertLog {
    path: PathBuf,
}

impl JsonAlertLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn write(&self, alert: &Alert) -> Result<()> {
        let line = serde_json::to_string(alert).context("Failed to serialise alert")?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open {}", self.path.display()))?;
        writeln!(file, "{line}")?;
        Ok(())
    }
}

impl AlertSink for JsonAlertLog {
    fn log_alert(&self, kind: AlertKind, message: &str, data: serde_json::Value) {
        let alert = Alert {
            timestamp: Utc::now(),
            kind,
            message: message.to_string(),
            data,
        };
        if let Err(e) = self.write(&alert) {
            error!(path = %self.path.display(), error = %e, "Failed to write alert");
        }
        TracingAlertSink.log_alert(kind, message, alert.data);
    }
}

/// Collects alerts in memory.
#[derive(Debug, Default)]
pub struct MemoryAlertSink {
    alerts: Mutex<Vec<Alert>>,
}

impl MemoryAlertSink {
    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().map(|a| a.clone()).unwrap_or_default()
    }

    pub fn count(&self, kind: AlertKind) -> usize {
        self.alerts
            .lock()
            .map(|a| a.iter().filter(|alert| alert.kind == kind).count())
            .unwrap_or(0)
    }
}

impl AlertSink for MemoryAlertSink {
    fn log_alert(&self, kind: AlertKind, message: &str, data: serde_json::Value) {
        if let Ok(mut alerts) = self.alerts.lock() {
            alerts.push(Alert {
                timestamp: Utc::now(),
                kind,
                message: message.to_string(),
                data,
            });
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
