//! JSON file persistence for the registry document

use std::path::{Path, PathBuf};

use tracing::debug;

use super::RegistryData;
use crate::error::Result;

pub struct RegistryStore {
    path: PathBuf,
    first_port: u16,
}

impl RegistryStore {
    pub fn new(path: impl Into<PathBuf>, first_port: u16) -> Self {
        Self {
            path: path.into(),
            first_port,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the document. A missing file yields an empty registry whose port
    /// counter starts at the configured first child port.
    pub async fn load(&self) -> Result<RegistryData> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => Ok(serde_json::from_str(&raw)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No registry at {}, starting empty", self.path.display());
                Ok(RegistryData::new(self.first_port))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Replace the document. Written to a sibling temp file and renamed so a
    /// crash never leaves a half-written registry behind.
    pub async fn save(&self, data: &RegistryData) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let json = serde_json::to_string_pretty(data)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn test_missing_file_is_empty_registry() {
        let dir = tempfile::tempdir().unwrap();
        let store = RegistryStore::new(dir.path().join("registry.json"), 5000);
        let data = store.load().await.unwrap();
        assert!(data.agents.is_empty());
        assert_eq!(data.next_port, 5000);
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = RegistryStore::new(dir.path().join("nested/registry.json"), 4097);

        let mut data = store.load().await.unwrap();
        data.create("Chef Bot", None, Utc::now()).unwrap();
        store.save(&data).await.unwrap();

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded, data);
        assert!(!dir.path().join("nested/registry.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");
        std::fs::write(&path, "{ not json").unwrap();
        let store = RegistryStore::new(path, 4097);
        let err = store.load().await.unwrap_err();
        assert_eq!(err.kind(), "serialization_error");
    }
}
