use std::sync::Arc;

use camino::Utf8PathBuf;
use serde::Deserialize;

use crate::error::Error;
use crate::store::{Inventory, LocalStore, MemoryStore};

/// Configuration for a local content store, selected by its `type` field.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum StoreConfig {
    /// Keep content in memory.
    Memory,

    /// Keep content in an OCI image layout directory.
    Local {
        /// Layout directory, created if missing.
        path: Utf8PathBuf,
    },
}

impl StoreConfig {
    /// Open the configured store.
    #[tracing::instrument]
    pub async fn build(self) -> Result<Arc<dyn Inventory>, Error> {
        let store: Arc<dyn Inventory> = match self {
            StoreConfig::Memory => Arc::new(MemoryStore::new()),
            StoreConfig::Local { path } => Arc::new(LocalStore::open(path).await?),
        };
        Ok(store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::Target;

    #[test]
    fn deserialize() {
        let config: StoreConfig = serde_json::from_str(r#"{"type": "memory"}"#).unwrap();
        assert!(matches!(config, StoreConfig::Memory));

        let config: StoreConfig =
            serde_json::from_str(r#"{"type": "local", "path": "/var/lib/layout"}"#).unwrap();
        assert!(matches!(config, StoreConfig::Local { path } if path == "/var/lib/layout"));

        assert!(serde_json::from_str::<StoreConfig>(r#"{"path": "/var/lib/layout"}"#).is_err());
    }

    #[tokio::test]
    async fn build_local() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().join("store")).unwrap();
        let store = StoreConfig::Local { path: path.clone() }.build().await.unwrap();
        assert_eq!(store.name(), path.as_str());
        assert!(path.join("index.json").exists());
    }
}
