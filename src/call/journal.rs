//! Crash-safe append-only journal: one JSON `CallRecord` per line.

use crate::call::record::CallRecord;
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::warn;

pub struct Journal {
    path: PathBuf,
    writer: parking_lot::Mutex<std::fs::File>,
}

impl Journal {
    pub fn open(store_dir: &Path) -> std::io::Result<Self> {
        std::fs::create_dir_all(store_dir)?;
        let path = store_dir.join("calls.jsonl");
        let writer = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        Ok(Self {
            path,
            writer: parking_lot::Mutex::new(writer),
        })
    }

    /// Append one record mutation. The journal is append-only; the latest
    /// line per `call_id` wins on replay.
    pub fn append(&self, record: &CallRecord) -> std::io::Result<()> {
        let line = serde_json::to_string(record).map_err(std::io::Error::other)?;
        let mut writer = self.writer.lock();
        writeln!(writer, "{line}")?;
        writer.flush()
    }

    /// Scan the whole file, keeping the last record per `call_id`.
    pub fn read_all(&self) -> std::io::Result<HashMap<String, CallRecord>> {
        read_all(&self.path)
    }
}

fn read_all(path: &Path) -> std::io::Result<HashMap<String, CallRecord>> {
    let mut latest: HashMap<String, CallRecord> = HashMap::new();
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(latest),
        Err(e) => return Err(e),
    };

    for line in contents.lines() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<CallRecord>(line) {
            Ok(record) => {
                latest.insert(record.call_id.clone(), record);
            }
            Err(e) => warn!("skipping unparseable journal line: {e}"),
        }
    }
    Ok(latest)
}

/// Result of applying startup recovery to one loaded record.
pub enum Recovered {
    /// Younger non-terminal record, reload into the active map.
    Active(CallRecord),
    /// Stale non-terminal record, rewritten as `error` and re-appended.
    StaleRewritten(CallRecord),
    /// Terminal record, skipped.
    Skipped,
}

pub fn recover_record(
    mut record: CallRecord,
    now_ms: i64,
    stale_age_ms: i64,
) -> Recovered {
    if record.state.is_terminal() {
        return Recovered::Skipped;
    }
    let age_ms = now_ms - record.started_at;
    if age_ms > stale_age_ms {
        record.apply_transition(crate::call::record::CallState::Error, now_ms, Some("error"));
        Recovered::StaleRewritten(record)
    } else {
        Recovered::Active(record)
    }
}
