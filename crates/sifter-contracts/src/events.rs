use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};

pub type EventPayload = Map<String, Value>;

/// Append-only JSONL log of pipeline events.
///
/// - default fields are `type`, `invocation_id`, `ts`
/// - caller payload is merged last and can override defaults
/// - one compact JSON object per line
/// - a writer without a path still builds events but writes nothing
#[derive(Debug, Clone)]
pub struct EventWriter {
    inner: Arc<EventWriterInner>,
}

#[derive(Debug)]
struct EventWriterInner {
    path: Option<PathBuf>,
    invocation_id: String,
    lock: Mutex<()>,
}

impl EventWriter {
    pub fn new(path: impl Into<PathBuf>, invocation_id: impl Into<String>) -> Self {
        Self::build(Some(path.into()), invocation_id.into())
    }

    pub fn disabled(invocation_id: impl Into<String>) -> Self {
        Self::build(None, invocation_id.into())
    }

    fn build(path: Option<PathBuf>, invocation_id: String) -> Self {
        Self {
            inner: Arc::new(EventWriterInner {
                path,
                invocation_id,
                lock: Mutex::new(()),
            }),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.inner.path.as_deref()
    }

    pub fn invocation_id(&self) -> &str {
        &self.inner.invocation_id
    }

    /// Same destination, new invocation id.
    pub fn for_invocation(&self, invocation_id: impl Into<String>) -> Self {
        Self::build(self.inner.path.clone(), invocation_id.into())
    }

    pub fn emit(&self, event_type: &str, payload: EventPayload) -> anyhow::Result<Value> {
        let mut event = Map::new();
        event.insert("type".to_string(), Value::String(event_type.to_string()));
        event.insert(
            "invocation_id".to_string(),
            Value::String(self.inner.invocation_id.clone()),
        );
        event.insert("ts".to_string(), Value::String(now_utc_iso()));
        for (key, value) in payload {
            event.insert(key, value);
        }

        let Some(path) = self.inner.path.as_ref() else {
            return Ok(Value::Object(event));
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let line = serde_json::to_string(&event)?;
        let _guard = self
            .inner
            .lock
            .lock()
            .map_err(|_| anyhow::anyhow!("event writer lock poisoned"))?;
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;

        Ok(Value::Object(event))
    }
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}
