use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One saved stage output. `fingerprint` identifies the inputs that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointEntry {
    pub fingerprint: String,
    pub image_path: String,
    pub created_at: String,
}

/// JSON manifest (`checkpoint.json`) of saved stage outputs, keyed by stage name.
///
/// Reads always refresh from disk and writes merge only the keys this instance touched,
/// so two runs sharing a checkpoint directory do not clobber each other's entries.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
    payload: Option<Map<String, Value>>,
    dirty_keys: Vec<String>,
}

impl CheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            payload: None,
            dirty_keys: Vec::new(),
        }
    }

    pub fn in_dir(dir: &Path) -> Self {
        Self::new(dir.join("checkpoint.json"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn dir(&self) -> &Path {
        self.path.parent().unwrap_or_else(|| Path::new("."))
    }

    pub fn get(&mut self, key: &str) -> Option<CheckpointEntry> {
        let payload = self.refresh();
        payload
            .get(key)
            .cloned()
            .and_then(|value| serde_json::from_value(value).ok())
    }

    /// Returns the entry only when it was produced from the same inputs.
    pub fn get_matching(&mut self, key: &str, fingerprint: &str) -> Option<CheckpointEntry> {
        self.get(key)
            .filter(|entry| entry.fingerprint == fingerprint)
    }

    pub fn set(&mut self, key: &str, entry: &CheckpointEntry) -> anyhow::Result<()> {
        let snapshot = serde_json::to_value(entry)?;
        let payload = self.refresh();
        if payload.get(key) == Some(&snapshot) {
            return Ok(());
        }
        payload.insert(key.to_string(), snapshot);
        if !self.dirty_keys.iter().any(|existing| existing == key) {
            self.dirty_keys.push(key.to_string());
        }
        self.flush()
    }

    pub fn flush(&mut self) -> anyhow::Result<()> {
        if self.dirty_keys.is_empty() {
            return Ok(());
        }
        let Some(payload) = &self.payload else {
            return Ok(());
        };

        let mut on_disk = read_json_object(&self.path).unwrap_or_default();
        for key in &self.dirty_keys {
            if let Some(value) = payload.get(key) {
                on_disk.insert(key.clone(), value.clone());
            }
        }
        write_json_object(&self.path, &on_disk)?;
        self.payload = Some(on_disk);
        self.dirty_keys.clear();
        Ok(())
    }

    fn refresh(&mut self) -> &mut Map<String, Value> {
        let mut fresh = read_json_object(&self.path).unwrap_or_default();
        if let Some(previous) = self.payload.take() {
            for key in &self.dirty_keys {
                if let Some(value) = previous.get(key) {
                    fresh.insert(key.clone(), value.clone());
                }
            }
        }
        self.payload.insert(fresh)
    }
}

fn read_json_object(path: &Path) -> Option<Map<String, Value>> {
    let raw = std::fs::read_to_string(path).ok()?;
    let parsed: Value = serde_json::from_str(&raw).ok()?;
    parsed.as_object().cloned()
}

fn write_json_object(path: &Path, payload: &Map<String, Value>) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(
        path,
        serde_json::to_string_pretty(&Value::Object(payload.clone()))?,
    )?;
    Ok(())
}
