use arc_swap::ArcSwap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

use super::AppConfig;
use crate::error::Result;

/// Configuration store backed by a JSON file
///
/// Uses `ArcSwap` for lock-free reads; the pipeline reads settings on hot paths.
#[derive(Clone)]
pub struct ConfigStore {
    path: PathBuf,
    /// Lock-free cache
    cache: Arc<ArcSwap<AppConfig>>,
    change_tx: broadcast::Sender<ConfigChange>,
}

/// Configuration change event
#[derive(Debug, Clone)]
pub struct ConfigChange {
    /// Top-level section that changed, or "app_config" for a full replace
    pub key: String,
}

impl ConfigStore {
    /// Open the store, writing defaults if the file does not exist yet
    pub async fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let config = match tokio::fs::read_to_string(path).await {
            Ok(json) => serde_json::from_str(&json)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No config at {}, writing defaults", path.display());
                let config = AppConfig::default();
                Self::write_file(path, &config).await?;
                config
            }
            Err(e) => return Err(e.into()),
        };

        let (change_tx, _) = broadcast::channel(16);

        Ok(Self {
            path: path.to_path_buf(),
            cache: Arc::new(ArcSwap::from_pointee(config)),
            change_tx,
        })
    }

    /// Store that lives only in memory (nothing is written)
    pub fn in_memory(config: AppConfig) -> Self {
        let (change_tx, _) = broadcast::channel(16);
        Self {
            path: PathBuf::new(),
            cache: Arc::new(ArcSwap::from_pointee(config)),
            change_tx,
        }
    }

    /// Write via a temp file and rename so a crash never leaves half a config
    async fn write_file(path: &Path, config: &AppConfig) -> Result<()> {
        let json = serde_json::to_string_pretty(config)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, path).await?;
        debug!("Config written to {}", path.display());
        Ok(())
    }

    async fn persist(&self, config: &AppConfig) -> Result<()> {
        if self.path.as_os_str().is_empty() {
            return Ok(());
        }
        Self::write_file(&self.path, config).await
    }

    /// Get current configuration (lock-free)
    pub fn get(&self) -> Arc<AppConfig> {
        self.cache.load_full()
    }

    /// Replace the entire configuration
    pub async fn set(&self, config: AppConfig) -> Result<()> {
        self.persist(&config).await?;
        self.cache.store(Arc::new(config));
        let _ = self.change_tx.send(ConfigChange {
            key: "app_config".to_string(),
        });
        Ok(())
    }

    /// Read-modify-write with a closure; last write wins
    ///
    /// Subscribers get one change event per top-level section that differs.
    pub async fn update<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut AppConfig),
    {
        let current = self.cache.load_full();
        let mut config = (*current).clone();
        f(&mut config);

        if config == *current {
            return Ok(());
        }

        self.persist(&config).await?;
        self.cache.store(Arc::new(config.clone()));

        for key in changed_sections(&current, &config) {
            let _ = self.change_tx.send(ConfigChange {
                key: key.to_string(),
            });
        }
        Ok(())
    }

    /// Re-read the file after an outside edit
    ///
    /// Sends the same per-section change events as [`Self::update`]. A file
    /// that no longer parses is reported and the cached config is kept.
    pub async fn reload(&self) -> Result<()> {
        if self.path.as_os_str().is_empty() {
            return Ok(());
        }
        let json = tokio::fs::read_to_string(&self.path).await?;
        let config: AppConfig = serde_json::from_str(&json)?;

        let current = self.cache.load_full();
        let changed = changed_sections(&current, &config);
        if changed.is_empty() {
            debug!("Config reload: nothing changed");
            return Ok(());
        }
        info!("Config reloaded, changed: {}", changed.join(", "));
        self.cache.store(Arc::new(config));
        for key in changed {
            let _ = self.change_tx.send(ConfigChange {
                key: key.to_string(),
            });
        }
        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConfigChange> {
        self.change_tx.subscribe()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn changed_sections(old: &AppConfig, new: &AppConfig) -> Vec<&'static str> {
    let mut keys = Vec::new();
    if old.stream != new.stream {
        keys.push("stream");
    }
    if old.encoder != new.encoder {
        keys.push("encoder");
    }
    if old.connection != new.connection {
        keys.push("connection");
    }
    if old.quality != new.quality {
        keys.push("quality");
    }
    if old.pipeline != new.pipeline {
        keys.push("pipeline");
    }
    keys
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_config_store() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("livepush.json");

        let store = ConfigStore::new(&path).await.unwrap();
        assert!(path.exists());
        assert_eq!(store.get().stream.fps, 30);

        let mut rx = store.subscribe();
        store
            .update(|c| {
                c.stream.fps = 25;
                c.quality.enabled = true;
            })
            .await
            .unwrap();

        assert_eq!(rx.recv().await.unwrap().key, "stream");
        assert_eq!(rx.recv().await.unwrap().key, "quality");
        assert_eq!(store.get().stream.fps, 25);

        // A new instance reads what was persisted
        let store2 = ConfigStore::new(&path).await.unwrap();
        assert_eq!(store2.get().stream.fps, 25);
        assert!(store2.get().quality.enabled);
    }

    #[tokio::test]
    async fn test_reload_picks_up_outside_edits() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("livepush.json");
        let store = ConfigStore::new(&path).await.unwrap();
        let mut rx = store.subscribe();

        let mut edited = (*store.get()).clone();
        edited.stream.video_bitrate_kbps = 4000;
        tokio::fs::write(&path, serde_json::to_string(&edited).unwrap())
            .await
            .unwrap();
        store.reload().await.unwrap();
        assert_eq!(rx.recv().await.unwrap().key, "stream");
        assert_eq!(store.get().stream.video_bitrate_kbps, 4000);

        // unchanged file, no event
        store.reload().await.unwrap();
        assert!(rx.try_recv().is_err());

        // broken file keeps the cached config
        tokio::fs::write(&path, "{oops").await.unwrap();
        assert!(store.reload().await.is_err());
        assert_eq!(store.get().stream.video_bitrate_kbps, 4000);
    }

    #[tokio::test]
    async fn test_noop_update_sends_nothing() {
        let store = ConfigStore::in_memory(AppConfig::default());
        let mut rx = store.subscribe();
        store.update(|_| {}).await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_invalid_json_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.json");
        tokio::fs::write(&path, "{not json").await.unwrap();
        assert!(ConfigStore::new(&path).await.is_err());
    }
}
