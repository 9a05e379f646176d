use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};

pub type EventPayload = Map<String, Value>;

pub const RUN_STARTED: &str = "run_started";
pub const STAGE_STARTED: &str = "stage_started";
pub const STAGE_COMPLETED: &str = "stage_completed";
pub const CHECKPOINT_RESTORED: &str = "checkpoint_restored";
pub const FURNITURE_SKIPPED: &str = "furniture_skipped";
pub const VARIANT_COMPLETED: &str = "variant_completed";
pub const VARIANT_FAILED: &str = "variant_failed";
pub const RUN_CANCELLED: &str = "run_cancelled";
pub const RUN_FINISHED: &str = "run_finished";

/// Append-only writer for a run's `events.jsonl`.
///
/// - default fields are `type`, `run_id`, `seq`, `ts`
/// - caller payload is merged last and can override defaults
/// - one compact JSON object per line
///
/// Clones share the same file lock and sequence counter, so stages running on worker
/// threads can emit through their own handle.
#[derive(Debug, Clone)]
pub struct EventWriter {
    inner: Arc<EventWriterInner>,
}

#[derive(Debug)]
struct EventWriterInner {
    path: PathBuf,
    run_id: String,
    seq: AtomicU64,
    lock: Mutex<()>,
}

impl EventWriter {
    pub fn new(path: impl Into<PathBuf>, run_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(EventWriterInner {
                path: path.into(),
                run_id: run_id.into(),
                seq: AtomicU64::new(0),
                lock: Mutex::new(()),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn run_id(&self) -> &str {
        &self.inner.run_id
    }

    pub fn emit(&self, event_type: &str, payload: EventPayload) -> anyhow::Result<Value> {
        if let Some(parent) = self.inner.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let _guard = self
            .inner
            .lock
            .lock()
            .map_err(|_| anyhow::anyhow!("event writer lock poisoned"))?;
        let seq = self.inner.seq.fetch_add(1, Ordering::SeqCst);

        let mut event = Map::new();
        event.insert("type".to_string(), Value::String(event_type.to_string()));
        event.insert(
            "run_id".to_string(),
            Value::String(self.inner.run_id.clone()),
        );
        event.insert("seq".to_string(), Value::Number(seq.into()));
        event.insert("ts".to_string(), Value::String(now_utc_iso()));
        for (key, value) in payload {
            event.insert(key, value);
        }

        let line = serde_json::to_string(&event)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.inner.path)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;

        Ok(Value::Object(event))
    }
}

/// Reads every well-formed event line back, skipping lines that do not parse.
pub fn read_events(path: &Path) -> anyhow::Result<Vec<Value>> {
    let raw = std::fs::read_to_string(path)?;
    Ok(raw
        .lines()
        .filter_map(|line| serde_json::from_str::<Value>(line).ok())
        .collect())
}

pub fn event_types(events: &[Value]) -> Vec<String> {
    events
        .iter()
        .filter_map(|row| row.get("type").and_then(Value::as_str).map(str::to_string))
        .collect()
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use chrono::DateTime;

    use super::*;

    #[test]
    fn emit_writes_compact_jsonl_line() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("events.jsonl");
        let writer = EventWriter::new(&path, "run-123");

        let mut payload = EventPayload::new();
        payload.insert("source".to_string(), Value::String("/tmp/room.jpg".to_string()));
        let emitted = writer.emit(RUN_STARTED, payload)?;

        let content = fs::read_to_string(&path)?;
        let line = content.lines().next().unwrap_or("");
        let parsed: Value = serde_json::from_str(line)?;

        assert_eq!(parsed, emitted);
        assert_eq!(parsed["type"], Value::String("run_started".to_string()));
        assert_eq!(parsed["run_id"], Value::String("run-123".to_string()));
        assert_eq!(parsed["seq"], Value::from(0));
        assert_eq!(parsed["source"], Value::String("/tmp/room.jpg".to_string()));

        let ts = parsed["ts"].as_str().unwrap_or("");
        DateTime::parse_from_rfc3339(ts)?;
        Ok(())
    }

    #[test]
    fn payload_can_override_default_keys() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let writer = EventWriter::new(temp.path().join("events.jsonl"), "run-123");

        let mut payload = EventPayload::new();
        payload.insert("type".to_string(), Value::String("override".to_string()));
        payload.insert(
            "run_id".to_string(),
            Value::String("override-run".to_string()),
        );
        let emitted = writer.emit(RUN_STARTED, payload)?;

        assert_eq!(emitted["type"], Value::String("override".to_string()));
        assert_eq!(emitted["run_id"], Value::String("override-run".to_string()));
        Ok(())
    }

    #[test]
    fn clones_share_sequence_and_append_in_order() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("nested").join("events.jsonl");
        let writer = EventWriter::new(&path, "run-123");
        let worker_handle = writer.clone();

        writer.emit(STAGE_STARTED, EventPayload::new())?;
        worker_handle.emit(STAGE_COMPLETED, EventPayload::new())?;
        writer.emit(RUN_FINISHED, EventPayload::new())?;

        let events = read_events(&path)?;
        assert_eq!(
            event_types(&events),
            vec!["stage_started", "stage_completed", "run_finished"]
        );
        let seqs: Vec<u64> = events
            .iter()
            .filter_map(|row| row.get("seq").and_then(Value::as_u64))
            .collect();
        assert_eq!(seqs, vec![0, 1, 2]);
        Ok(())
    }

    #[test]
    fn read_events_skips_garbage_lines() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("events.jsonl");
        fs::write(&path, "{\"type\":\"a\"}\nnot json\n{\"type\":\"b\"}\n")?;

        let events = read_events(&path)?;
        assert_eq!(event_types(&events), vec!["a", "b"]);
        Ok(())
    }
}
