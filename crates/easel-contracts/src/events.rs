use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;

/// Something that happened to the gallery, as journaled in `activity.jsonl`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActivityEvent {
    GalleryLoaded {
        schema: String,
        source: String,
        count: usize,
        rewritten: bool,
    },
    /// A malformed stored value was copied aside; only its digest is journaled.
    GalleryRecovered {
        recovery_key: String,
        bytes: usize,
        sha256: String,
    },
    ImageGenerated {
        ticket: u64,
        image_id: String,
        payload: String,
        model: String,
    },
    GenerationFailed {
        ticket: u64,
        error: String,
    },
    ImageDeleted {
        image_id: String,
    },
    StorageWriteFailed {
        key: String,
        error: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        bytes: Option<usize>,
    },
}

impl ActivityEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::GalleryLoaded { .. } => "gallery_loaded",
            Self::GalleryRecovered { .. } => "gallery_recovered",
            Self::ImageGenerated { .. } => "image_generated",
            Self::GenerationFailed { .. } => "generation_failed",
            Self::ImageDeleted { .. } => "image_deleted",
            Self::StorageWriteFailed { .. } => "storage_write_failed",
        }
    }
}

#[derive(Serialize)]
struct JournalLine<'a> {
    ts: String,
    session_id: &'a str,
    #[serde(flatten)]
    event: &'a ActivityEvent,
}

/// Append-only journal shared by every holder of a clone.
///
/// The file is opened on the first event, so a session that never changes anything
/// leaves no trace on disk.
#[derive(Debug, Clone)]
pub struct ActivityLog {
    inner: Arc<Journal>,
}

#[derive(Debug)]
struct Journal {
    path: PathBuf,
    session_id: String,
    file: Mutex<Option<File>>,
}

impl ActivityLog {
    pub fn new(path: impl Into<PathBuf>, session_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Journal {
                path: path.into(),
                session_id: session_id.into(),
                file: Mutex::new(None),
            }),
        }
    }

    pub fn record(&self, event: &ActivityEvent) -> anyhow::Result<()> {
        self.record_at(Utc::now(), event)
    }

    fn record_at(&self, at: DateTime<Utc>, event: &ActivityEvent) -> anyhow::Result<()> {
        let mut line = serde_json::to_string(&JournalLine {
            ts: at.to_rfc3339_opts(SecondsFormat::Millis, true),
            session_id: &self.inner.session_id,
            event,
        })?;
        line.push('\n');

        let mut file = self
            .inner
            .file
            .lock()
            .map_err(|_| anyhow::anyhow!("activity journal lock poisoned"))?;
        if file.is_none() {
            if let Some(parent) = self.inner.path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            *file = Some(
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&self.inner.path)?,
            );
        }
        if let Some(file) = file.as_mut() {
            file.write_all(line.as_bytes())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use serde_json::{json, Value};

    use super::{ActivityEvent, ActivityLog};

    fn lines(path: &std::path::Path) -> anyhow::Result<Vec<Value>> {
        Ok(std::fs::read_to_string(path)?
            .lines()
            .map(serde_json::from_str::<Value>)
            .collect::<Result<Vec<Value>, _>>()?)
    }

    #[test]
    fn recovered_value_is_journaled_by_digest() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("activity.jsonl");
        let log = ActivityLog::new(&path, "session-7");
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).single().unwrap();

        log.record_at(
            at,
            &ActivityEvent::GalleryRecovered {
                recovery_key: "generated-images-recovery-1709294400000".to_string(),
                bytes: 14,
                sha256: "ab12".to_string(),
            },
        )?;

        assert_eq!(
            lines(&path)?,
            vec![json!({
                "ts": "2024-03-01T12:00:00.000Z",
                "session_id": "session-7",
                "type": "gallery_recovered",
                "recovery_key": "generated-images-recovery-1709294400000",
                "bytes": 14,
                "sha256": "ab12",
            })]
        );
        Ok(())
    }

    #[test]
    fn clones_share_one_journal_in_order() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("nested").join("activity.jsonl");
        let log = ActivityLog::new(&path, "s");
        assert!(!path.exists());

        log.record(&ActivityEvent::ImageDeleted {
            image_id: "a".to_string(),
        })?;
        log.clone().record(&ActivityEvent::StorageWriteFailed {
            key: "openai-api-key".to_string(),
            error: "quota".to_string(),
            bytes: None,
        })?;

        let rows = lines(&path)?;
        let kinds = rows
            .iter()
            .filter_map(|row| row["type"].as_str())
            .collect::<Vec<&str>>();
        assert_eq!(kinds, vec!["image_deleted", "storage_write_failed"]);
        assert!(rows[1].get("bytes").is_none());
        Ok(())
    }

    #[test]
    fn kind_matches_serialized_tag() -> anyhow::Result<()> {
        let event = ActivityEvent::GenerationFailed {
            ticket: 3,
            error: "Incorrect API key provided.".to_string(),
        };
        assert_eq!(serde_json::to_value(&event)?["type"], json!(event.kind()));
        Ok(())
    }
}
