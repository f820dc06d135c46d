use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};

pub type EventPayload = Map<String, Value>;

/// Append-only writer for `events.jsonl`.
///
/// One compact JSON object per line. Default fields are `type`, `run_id`
/// and `ts`; the caller payload is merged last and can override them. The
/// file handle is opened once and shared behind a lock, so clones of one
/// writer hand the same ordered stream to every pipeline stage.
#[derive(Debug, Clone)]
pub struct EventWriter {
    inner: Arc<EventWriterInner>,
}

#[derive(Debug)]
struct EventWriterInner {
    path: PathBuf,
    run_id: String,
    file: Mutex<File>,
}

impl EventWriter {
    pub fn create(path: impl Into<PathBuf>, run_id: impl Into<String>) -> anyhow::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            inner: Arc::new(EventWriterInner {
                path,
                run_id: run_id.into(),
                file: Mutex::new(file),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn run_id(&self) -> &str {
        &self.inner.run_id
    }

    pub fn emit(&self, event_type: &str, payload: EventPayload) -> anyhow::Result<Value> {
        let mut event = Map::new();
        event.insert("type".to_string(), Value::String(event_type.to_string()));
        event.insert(
            "run_id".to_string(),
            Value::String(self.inner.run_id.clone()),
        );
        event.insert(
            "ts".to_string(),
            Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)),
        );
        for (key, value) in payload {
            event.insert(key, value);
        }

        let line = serde_json::to_string(&event)?;
        let mut file = self
            .inner
            .file
            .lock()
            .map_err(|_| anyhow::anyhow!("event writer lock poisoned"))?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;

        Ok(Value::Object(event))
    }
}
