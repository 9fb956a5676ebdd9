use easel_contracts::events::{ActivityEvent, ActivityLog};
use easel_contracts::gallery::{
    decode_gallery, example_images, first_run, migrate, new_record_id, recovery_key,
    GeneratedImage, Migration, Notice, StoredGallery, API_KEY_KEY, GALLERY_KEY,
    RECOVERY_KEY_PREFIX,
};
use easel_contracts::store::{KeyValueStore, StoreError};
use sha2::{Digest, Sha256};

/// Where the stored gallery value was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GallerySource {
    Primary,
    Legacy,
    Empty,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedGallery {
    pub images: Vec<GeneratedImage>,
    pub notice: Option<Notice>,
    pub source: GallerySource,
}

/// Persisted state of the client: the gallery collection and the credential.
///
/// `primary` is the higher-capacity store that holds the current schema. `legacy`, when
/// configured, is the plain key/value store an earlier version wrote to; it is read
/// once when `primary` has nothing, and never written.
pub struct LocalState {
    primary: Box<dyn KeyValueStore>,
    legacy: Option<Box<dyn KeyValueStore>>,
    activity: Option<ActivityLog>,
}

impl LocalState {
    pub fn new(primary: impl KeyValueStore + 'static) -> Self {
        Self {
            primary: Box::new(primary),
            legacy: None,
            activity: None,
        }
    }

    pub fn with_legacy(mut self, legacy: impl KeyValueStore + 'static) -> Self {
        self.legacy = Some(Box::new(legacy));
        self
    }

    pub fn with_activity(mut self, activity: ActivityLog) -> Self {
        self.activity = Some(activity);
        self
    }

    pub fn load_gallery(&mut self) -> LoadedGallery {
        let (raw, source) = match self.read_stored_gallery() {
            Ok(found) => found,
            Err(err) => return self.unreadable_gallery(err),
        };
        let stored = raw.as_deref().map(decode_gallery);
        let schema = stored
            .as_ref()
            .map(StoredGallery::schema_name)
            .unwrap_or("none");
        if let Some(StoredGallery::Corrupt { reason, .. }) = &stored {
            tracing::warn!(%reason, "stored gallery is malformed; falling back to example images");
        }

        let migration = match stored {
            Some(stored) => migrate(stored, new_record_id),
            None => first_run(new_record_id),
        };
        if matches!(migration.notice, Some(Notice::MigratedLegacyUrls { .. })) {
            tracing::warn!("legacy locator list detected; filling missing prompts with placeholders");
        }
        let Migration {
            images,
            mut notice,
            recovery_raw,
            mut rewrite,
        } = migration;

        if let Some(raw) = recovery_raw {
            match self.preserve_corrupt_value(&raw) {
                Ok(key) => notice = Some(Notice::Corrupted { recovery_key: Some(key) }),
                Err(err) => {
                    tracing::warn!(error = %err, "could not copy malformed gallery to a recovery slot");
                    notice = Some(Notice::Corrupted { recovery_key: None });
                    // Overwriting now would destroy the only copy.
                    rewrite = false;
                }
            }
        }
        // A value found only in the legacy store is copied forward even when already current.
        if source == GallerySource::Legacy {
            rewrite = true;
        }

        if rewrite {
            if let Err(err) = self.save_gallery(&images) {
                notice = notice.or(Some(Notice::StorageWriteFailed {
                    detail: err.to_string(),
                }));
            }
        }

        self.log(&ActivityEvent::GalleryLoaded {
            schema: schema.to_string(),
            source: format!("{source:?}").to_ascii_lowercase(),
            count: images.len(),
            rewritten: rewrite,
        });
        LoadedGallery {
            images,
            notice,
            source,
        }
    }

    /// The primary store exists but cannot be parsed: show examples and write nothing.
    fn unreadable_gallery(&self, err: StoreError) -> LoadedGallery {
        tracing::warn!(error = %err, "could not read stored gallery; showing examples without saving");
        let images = example_images(new_record_id);
        self.log(&ActivityEvent::GalleryLoaded {
            schema: "unreadable".to_string(),
            source: "primary".to_string(),
            count: images.len(),
            rewritten: false,
        });
        LoadedGallery {
            images,
            notice: Some(Notice::StorageReadFailed {
                detail: err.to_string(),
            }),
            source: GallerySource::Primary,
        }
    }

    pub fn save_gallery(&mut self, images: &[GeneratedImage]) -> Result<(), StoreError> {
        let serialized = serde_json::to_string(images)?;
        let result = self.primary.set(GALLERY_KEY, &serialized);
        if let Err(err) = &result {
            tracing::warn!(error = %err, count = images.len(), "gallery write failed");
            self.log(&ActivityEvent::StorageWriteFailed {
                key: GALLERY_KEY.to_string(),
                error: err.to_string(),
                bytes: Some(serialized.len()),
            });
        }
        result
    }

    /// The stored credential, or an empty string when absent or unreadable.
    pub fn load_api_key(&self) -> String {
        match self.primary.get(API_KEY_KEY) {
            Ok(value) => value.unwrap_or_default(),
            Err(err) => {
                tracing::warn!(error = %err, "could not read stored API key");
                String::new()
            }
        }
    }

    pub fn save_api_key(&mut self, value: &str) -> Result<(), StoreError> {
        let result = self.primary.set(API_KEY_KEY, value);
        if let Err(err) = &result {
            tracing::warn!(error = %err, "API key write failed");
            self.log(&ActivityEvent::StorageWriteFailed {
                key: API_KEY_KEY.to_string(),
                error: err.to_string(),
                bytes: None,
            });
        }
        result
    }

    /// Recovery slots holding unreadable gallery values, oldest first.
    pub fn recovery_keys(&self) -> Result<Vec<String>, StoreError> {
        let mut keys = self
            .primary
            .keys()?
            .into_iter()
            .filter_map(|key| {
                let stamp = key.strip_prefix(RECOVERY_KEY_PREFIX)?.parse::<i64>().ok()?;
                Some((stamp, key))
            })
            .collect::<Vec<(i64, String)>>();
        keys.sort();
        Ok(keys.into_iter().map(|(_, key)| key).collect())
    }

    pub fn recovery_value(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.primary.get(key)
    }

    /// An empty stored value counts as nothing stored.
    fn read_stored_gallery(&self) -> Result<(Option<String>, GallerySource), StoreError> {
        let present = |raw: Option<String>| raw.filter(|raw| !raw.trim().is_empty());
        if let Some(raw) = present(self.primary.get(GALLERY_KEY)?) {
            return Ok((Some(raw), GallerySource::Primary));
        }
        let Some(legacy) = self.legacy.as_ref() else {
            return Ok((None, GallerySource::Empty));
        };
        match legacy.get(GALLERY_KEY) {
            Ok(raw) => Ok(match present(raw) {
                Some(raw) => (Some(raw), GallerySource::Legacy),
                None => (None, GallerySource::Empty),
            }),
            Err(err) => {
                tracing::warn!(error = %err, "could not read legacy gallery store");
                Ok((None, GallerySource::Empty))
            }
        }
    }

    fn preserve_corrupt_value(&mut self, raw: &str) -> Result<String, StoreError> {
        let mut stamp = chrono::Utc::now().timestamp_millis();
        while self.primary.get(&recovery_key(stamp))?.is_some() {
            stamp += 1;
        }
        let key = recovery_key(stamp);
        self.primary.set(&key, raw)?;
        self.log(&ActivityEvent::GalleryRecovered {
            recovery_key: key.clone(),
            bytes: raw.len(),
            sha256: hex::encode(Sha256::digest(raw.as_bytes())),
        });
        Ok(key)
    }

    pub(crate) fn log(&self, event: &ActivityEvent) {
        let Some(activity) = self.activity.as_ref() else {
            return;
        };
        if let Err(err) = activity.record(event) {
            tracing::debug!(error = %err, kind = event.kind(), "activity log write failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use easel_contracts::events::ActivityLog;
    use easel_contracts::gallery::{
        GeneratedImage, ImagePayload, Notice, API_KEY_KEY, GALLERY_KEY,
        LEGACY_ORIGINAL_PROMPT_PLACEHOLDER, RECOVERY_KEY_PREFIX,
    };
    use easel_contracts::store::{FileStore, KeyValueStore, MemoryStore};
    use serde_json::Value;

    use super::{GallerySource, LocalState};

    fn sample(prompt: &str) -> GeneratedImage {
        GeneratedImage::new(
            ImagePayload::embedded("image/png", prompt.as_bytes()),
            prompt,
            Some(format!("{prompt}, revised")),
        )
    }

    #[test]
    fn first_run_seeds_and_persists_examples() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("storage.json");
        let mut state = LocalState::new(FileStore::new(&path));

        let loaded = state.load_gallery();
        assert_eq!(loaded.images.len(), 3);
        assert_eq!(loaded.notice, Some(Notice::FirstRun));
        assert_eq!(loaded.source, GallerySource::Empty);

        let reloaded = LocalState::new(FileStore::new(&path)).load_gallery();
        assert_eq!(reloaded.images, loaded.images);
        assert_eq!(reloaded.notice, None);
        Ok(())
    }

    #[test]
    fn empty_stored_value_is_a_first_run() -> anyhow::Result<()> {
        let mut state = LocalState::new(MemoryStore::new().with_entry(GALLERY_KEY, ""));

        let loaded = state.load_gallery();
        assert_eq!(loaded.notice, Some(Notice::FirstRun));
        assert_eq!(loaded.images.len(), 3);
        assert_eq!(loaded.source, GallerySource::Empty);
        assert!(state.recovery_keys()?.is_empty());
        assert_eq!(state.load_gallery().images, loaded.images);
        Ok(())
    }

    #[test]
    fn unreadable_store_is_reported_and_left_alone() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("storage.json");
        std::fs::write(&path, "{broken")?;

        let loaded = LocalState::new(FileStore::new(&path)).load_gallery();
        assert!(matches!(
            loaded.notice,
            Some(Notice::StorageReadFailed { .. })
        ));
        assert_eq!(loaded.images.len(), 3);
        assert_eq!(std::fs::read_to_string(&path)?, "{broken");
        Ok(())
    }

    #[test]
    fn saved_collection_round_trips() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("storage.json");
        let images = vec![sample("boat"), sample("bear"), sample("valley")];
        LocalState::new(FileStore::new(&path)).save_gallery(&images)?;

        let loaded = LocalState::new(FileStore::new(&path)).load_gallery();
        assert_eq!(loaded.images, images);
        assert_eq!(loaded.notice, None);
        assert_eq!(loaded.source, GallerySource::Primary);
        Ok(())
    }

    #[test]
    fn legacy_string_list_is_migrated_and_written_back() -> anyhow::Result<()> {
        let store = MemoryStore::new().with_entry(GALLERY_KEY, r#"["https://x.test/old.png"]"#);
        let mut state = LocalState::new(store);

        let loaded = state.load_gallery();
        assert_eq!(loaded.images.len(), 4);
        assert_eq!(
            loaded.images[0].payload,
            ImagePayload::remote("https://x.test/old.png")
        );
        assert_eq!(
            loaded.images[0].original_prompt,
            LEGACY_ORIGINAL_PROMPT_PLACEHOLDER
        );
        assert_eq!(
            loaded.notice,
            Some(Notice::MigratedLegacyUrls { count: 1 })
        );

        let again = state.load_gallery();
        assert_eq!(again.images, loaded.images);
        assert_eq!(again.notice, None);
        Ok(())
    }

    #[test]
    fn malformed_value_is_preserved_in_a_recovery_slot() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("storage.json");
        let activity_path = temp.path().join("activity.jsonl");
        let mut store = FileStore::new(&path);
        store.set(GALLERY_KEY, "{definitely not json")?;

        let mut state =
            LocalState::new(FileStore::new(&path)).with_activity(ActivityLog::new(&activity_path, "t"));
        let loaded = state.load_gallery();
        assert_eq!(loaded.images.len(), 3);

        let keys = state.recovery_keys()?;
        assert_eq!(keys.len(), 1);
        assert!(keys[0].starts_with(RECOVERY_KEY_PREFIX));
        assert_eq!(
            state.recovery_value(&keys[0])?,
            Some("{definitely not json".to_string())
        );
        assert_eq!(
            loaded.notice,
            Some(Notice::Corrupted {
                recovery_key: Some(keys[0].clone())
            })
        );

        // The collection itself was replaced by the example set.
        let reloaded = LocalState::new(FileStore::new(&path)).load_gallery();
        assert_eq!(reloaded.images, loaded.images);

        let types = std::fs::read_to_string(&activity_path)?
            .lines()
            .filter_map(|line| serde_json::from_str::<Value>(line).ok())
            .filter_map(|row| row.get("type").and_then(Value::as_str).map(str::to_string))
            .collect::<Vec<String>>();
        assert_eq!(types, vec!["gallery_recovered", "gallery_loaded"]);
        Ok(())
    }

    #[test]
    fn corrupt_value_is_not_overwritten_when_recovery_copy_fails() -> anyhow::Result<()> {
        let raw = "[1, 2, 3]";
        // Only the corrupt value itself fits; a second copy does not.
        let capacity = GALLERY_KEY.len() + raw.len();
        let store = MemoryStore::with_capacity(capacity).with_entry(GALLERY_KEY, raw);
        let mut state = LocalState::new(store);

        let loaded = state.load_gallery();
        assert_eq!(
            loaded.notice,
            Some(Notice::Corrupted { recovery_key: None })
        );
        assert_eq!(loaded.images.len(), 3);
        assert!(state.recovery_keys()?.is_empty());

        let again = state.load_gallery();
        assert!(matches!(again.notice, Some(Notice::Corrupted { .. })));
        Ok(())
    }

    #[test]
    fn legacy_store_is_imported_but_left_untouched() -> anyhow::Result<()> {
        let legacy_value = r#"[{"id":"a","imageUrl":"https://x.test/a","originalPrompt":"p","revisedPrompt":"r"}]"#;
        let temp = tempfile::tempdir()?;
        let legacy_path = temp.path().join("legacy.json");
        let mut legacy = FileStore::new(&legacy_path);
        legacy.set(GALLERY_KEY, legacy_value)?;

        let primary_path = temp.path().join("storage.json");
        let mut state =
            LocalState::new(FileStore::new(&primary_path)).with_legacy(FileStore::new(&legacy_path));
        let loaded = state.load_gallery();
        assert_eq!(loaded.source, GallerySource::Legacy);
        assert_eq!(loaded.images.len(), 1);
        assert_eq!(loaded.images[0].id, "a");

        assert_eq!(legacy.get(GALLERY_KEY)?, Some(legacy_value.to_string()));
        let primary = LocalState::new(FileStore::new(&primary_path)).load_gallery();
        assert_eq!(primary.source, GallerySource::Primary);
        assert_eq!(primary.images, loaded.images);
        Ok(())
    }

    #[test]
    fn write_failure_is_reported_not_raised() {
        let mut state = LocalState::new(MemoryStore::with_capacity(10));
        let loaded = state.load_gallery();
        // Examples load in memory even though they could not be stored.
        assert_eq!(loaded.images.len(), 3);
        assert_eq!(loaded.notice, Some(Notice::FirstRun));
        assert!(state.save_gallery(&loaded.images).is_err());
    }

    #[test]
    fn api_key_round_trips_as_plaintext() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("storage.json");
        let mut state = LocalState::new(FileStore::new(&path));
        assert_eq!(state.load_api_key(), "");
        state.save_api_key("sk-test")?;

        let store = FileStore::new(&path);
        assert_eq!(store.get(API_KEY_KEY)?, Some("sk-test".to_string()));
        assert_eq!(LocalState::new(store).load_api_key(), "sk-test");
        Ok(())
    }
}
