use arc_swap::ArcSwap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

use super::AppConfig;
use crate::error::{AppError, Result};

/// Configuration store backed by a TOML file
///
/// Uses `ArcSwap` for lock-free reads; writes go to disk first and then
/// replace the cached value.
#[derive(Clone)]
pub struct ConfigStore {
    path: PathBuf,
    /// Lock-free cache using ArcSwap for zero-cost reads
    cache: Arc<ArcSwap<AppConfig>>,
}

impl ConfigStore {
    /// Open the store, writing a default file if none exists
    pub async fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let config = Self::load_config(path).await?;
        let cache = Arc::new(ArcSwap::from_pointee(config));

        Ok(Self {
            path: path.to_path_buf(),
            cache,
        })
    }

    async fn load_config(path: &Path) -> Result<AppConfig> {
        match tokio::fs::read_to_string(path).await {
            Ok(text) => {
                let config: AppConfig = toml::from_str(&text)
                    .map_err(|e| AppError::Config(format!("{}: {}", path.display(), e)))?;
                config.validate()?;
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("Config file {} not found, writing defaults", path.display());
                let config = AppConfig::default();
                Self::save_config_to_file(path, &config).await?;
                Ok(config)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn save_config_to_file(path: &Path, config: &AppConfig) -> Result<()> {
        let text = toml::to_string_pretty(config)
            .map_err(|e| AppError::Config(format!("Failed to encode config: {}", e)))?;
        tokio::fs::write(path, text).await?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Get current configuration (lock-free)
    pub fn get(&self) -> Arc<AppConfig> {
        self.cache.load_full()
    }

    /// Replace the configuration
    pub async fn set(&self, config: AppConfig) -> Result<()> {
        config.validate()?;
        Self::save_config_to_file(&self.path, &config).await?;
        self.cache.store(Arc::new(config));
        info!("Config saved to {}", self.path.display());
        Ok(())
    }

    /// Update configuration with a closure
    ///
    /// Read-modify-write; concurrent updates are last-write-wins.
    pub async fn update<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut AppConfig),
    {
        let current = self.cache.load();
        let mut config = (**current).clone();
        f(&mut config);
        self.set(config).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_config_store() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("liveclass.toml");

        let store = ConfigStore::new(&path).await.unwrap();
        assert!(path.exists());
        assert_eq!(store.get().identity.display_name, "Guest");

        store
            .update(|c| {
                c.identity.display_name = "Mr. Okafor".to_string();
                c.fallback.placeholder_peers = 5;
            })
            .await
            .unwrap();
        assert_eq!(store.get().fallback.placeholder_peers, 5);

        // Reload from disk
        let store2 = ConfigStore::new(&path).await.unwrap();
        assert_eq!(store2.get().identity.display_name, "Mr. Okafor");
    }

    #[tokio::test]
    async fn test_invalid_update_is_not_stored() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("liveclass.toml");
        let store = ConfigStore::new(&path).await.unwrap();

        let result = store
            .update(|c| c.signaling.url = "ftp://nowhere".to_string())
            .await;
        assert!(matches!(result, Err(AppError::Config(_))));
        assert!(store.get().signaling.url.starts_with("ws://"));
    }

    #[tokio::test]
    async fn test_malformed_file_is_config_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        tokio::fs::write(&path, "[signaling\nurl = ").await.unwrap();
        assert!(matches!(
            ConfigStore::new(&path).await,
            Err(AppError::Config(_))
        ));
    }
}
