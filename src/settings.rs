//! Persisted user preferences.
//!
//! Volume, mute, playback rate and pitch preservation survive across
//! sessions in a small JSON document. Writes are debounced: a volume
//! slider emits dozens of updates per second, and flushing each one to
//! storage would thrash it for no benefit. The last value wins after
//! half a second of quiet.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::Result;

/// Debounce interval before a changed document hits storage.
const WRITE_DEBOUNCE: Duration = Duration::from_millis(500);

/// File name of the settings document.
pub const SETTINGS_FILE: &str = "kinema_settings.json";

/// The persisted document.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistedSettings {
    pub volume: f32,
    pub muted: bool,
    pub playback_rate: f64,
    pub preserve_pitch: bool,
}

impl Default for PersistedSettings {
    fn default() -> Self {
        Self {
            volume: 1.0,
            muted: false,
            playback_rate: 1.0,
            preserve_pitch: true,
        }
    }
}

/// Settings storage with debounced writes.
pub struct SettingsStore {
    path: PathBuf,
    current: Arc<Mutex<PersistedSettings>>,
    writer: Arc<Mutex<Option<tokio::task::JoinHandle<()>>>>,
}

impl SettingsStore {
    /// Opens the store in `dir`, reading the existing document when one
    /// is present. A missing or unreadable document falls back to
    /// defaults; settings are a convenience, not session state.
    pub async fn open(dir: impl AsRef<Path>) -> Self {
        let path = dir.as_ref().join(SETTINGS_FILE);
        let current = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                warn!("settings file unreadable, using defaults: {e}");
                PersistedSettings::default()
            }),
            Err(_) => PersistedSettings::default(),
        };

        Self {
            path,
            current: Arc::new(Mutex::new(current)),
            writer: Arc::new(Mutex::new(None)),
        }
    }

    /// A snapshot of the current settings.
    pub async fn get(&self) -> PersistedSettings {
        *self.current.lock().await
    }

    /// Applies a mutation and schedules a debounced write.
    ///
    /// Rapid successive updates collapse into one write of the final
    /// value.
    pub async fn update(&self, mutate: impl FnOnce(&mut PersistedSettings)) {
        {
            let mut current = self.current.lock().await;
            mutate(&mut current);
        }

        let mut writer = self.writer.lock().await;
        if let Some(pending) = writer.take() {
            pending.abort();
        }

        let path = self.path.clone();
        let current = Arc::clone(&self.current);
        *writer = Some(tokio::spawn(async move {
            tokio::time::sleep(WRITE_DEBOUNCE).await;
            let snapshot = *current.lock().await;
            if let Err(e) = write_document(&path, snapshot).await {
                warn!("failed to persist settings: {e}");
            }
        }));
    }

    /// Writes the current document immediately (destroy path).
    ///
    /// # Errors
    ///
    /// Returns error if serialization or the write fails.
    pub async fn flush(&self) -> Result<()> {
        let mut writer = self.writer.lock().await;
        if let Some(pending) = writer.take() {
            pending.abort();
        }
        let snapshot = *self.current.lock().await;
        write_document(&self.path, snapshot).await
    }
}

async fn write_document(path: &Path, settings: PersistedSettings) -> Result<()> {
    let json = serde_json::to_vec_pretty(&settings)?;
    tokio::fs::write(path, json).await?;
    trace!("settings persisted to {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn defaults_when_no_document_exists() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::open(dir.path()).await;
        assert_eq!(store.get().await, PersistedSettings::default());
    }

    #[tokio::test]
    async fn flush_round_trips_the_document() {
        let dir = tempfile::tempdir().unwrap();

        let store = SettingsStore::open(dir.path()).await;
        store
            .update(|s| {
                s.volume = 0.4;
                s.muted = true;
                s.playback_rate = 1.5;
            })
            .await;
        store.flush().await.unwrap();

        let reopened = SettingsStore::open(dir.path()).await;
        let settings = reopened.get().await;
        assert_eq!(settings.volume, 0.4);
        assert!(settings.muted);
        assert_eq!(settings.playback_rate, 1.5);
        assert!(settings.preserve_pitch);
    }

    #[tokio::test]
    async fn rapid_updates_collapse_into_the_final_value() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::open(dir.path()).await;

        for volume in [0.1, 0.2, 0.3, 0.8] {
            store.update(|s| s.volume = volume).await;
        }

        tokio::time::sleep(WRITE_DEBOUNCE + Duration::from_millis(100)).await;
        let reopened = SettingsStore::open(dir.path()).await;
        assert_eq!(reopened.get().await.volume, 0.8);
    }

    #[tokio::test]
    async fn corrupt_document_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join(SETTINGS_FILE), b"{not json")
            .await
            .unwrap();

        let store = SettingsStore::open(dir.path()).await;
        assert_eq!(store.get().await, PersistedSettings::default());
    }
}
