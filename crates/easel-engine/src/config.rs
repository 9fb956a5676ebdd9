use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use easel_contracts::events::ActivityLog;
use easel_contracts::store::{FileStore, MemoryStore};

use crate::generator::{
    default_generator_registry, ImageGenerator, ResponseFormat, DEFAULT_API_BASE, DEFAULT_MODEL,
};
use crate::state::LocalState;
use crate::view::GalleryView;

pub const STORAGE_FILE: &str = "storage.json";
pub const ACTIVITY_FILE: &str = "activity.jsonl";

/// Resolved runtime settings for a client session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EaselConfig {
    /// `None` keeps everything in memory for the lifetime of the process.
    pub data_dir: Option<PathBuf>,
    /// Read-only store written by an earlier version of the client.
    pub legacy_store: Option<PathBuf>,
    pub provider: String,
    pub model: String,
    pub response_format: ResponseFormat,
    pub api_base: String,
    pub capacity_bytes: Option<usize>,
}

impl Default for EaselConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            legacy_store: None,
            provider: "openai".to_string(),
            model: DEFAULT_MODEL.to_string(),
            response_format: ResponseFormat::default(),
            api_base: DEFAULT_API_BASE.to_string(),
            capacity_bytes: None,
        }
    }
}

impl EaselConfig {
    pub fn storage_path(&self) -> Option<PathBuf> {
        self.data_dir.as_deref().map(|dir| dir.join(STORAGE_FILE))
    }

    pub fn activity_path(&self) -> Option<PathBuf> {
        self.data_dir.as_deref().map(|dir| dir.join(ACTIVITY_FILE))
    }

    pub fn open_state(&self) -> LocalState {
        let mut state = match self.data_dir.as_deref() {
            Some(dir) => {
                let store = FileStore::new(dir.join(STORAGE_FILE)).with_capacity(self.capacity_bytes);
                let session_id = uuid::Uuid::new_v4().to_string();
                LocalState::new(store)
                    .with_activity(ActivityLog::new(dir.join(ACTIVITY_FILE), session_id))
            }
            None => match self.capacity_bytes {
                Some(capacity) => LocalState::new(MemoryStore::with_capacity(capacity)),
                None => LocalState::new(MemoryStore::new()),
            },
        };
        if let Some(legacy) = self.legacy_store.as_deref() {
            state = state.with_legacy(FileStore::new(legacy));
        }
        state
    }

    /// Loads the gallery and applies the model settings.
    pub fn open_view(&self) -> GalleryView {
        GalleryView::init(self.open_state())
            .with_model(self.model.clone())
            .with_response_format(self.response_format)
    }

    pub fn generator(&self) -> Result<Box<dyn ImageGenerator>> {
        let mut registry = default_generator_registry(&self.api_base);
        let names = registry.names();
        match registry.take(self.provider.trim()) {
            Some(generator) => Ok(generator),
            None => bail!(
                "unknown provider '{}' (available: {})",
                self.provider,
                names.join(", ")
            ),
        }
    }
}

/// `<platform data dir>/easel`, falling back to the working directory.
pub fn default_data_dir(platform_data_dir: Option<&Path>) -> PathBuf {
    platform_data_dir
        .map(|dir| dir.join("easel"))
        .unwrap_or_else(|| PathBuf::from(".easel"))
}
