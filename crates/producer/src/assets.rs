use std::path::{Path, PathBuf};

use snafu::ResultExt;

use super::error::{CreateAssetDirectorySnafu, ProducerResult, WriteAssetSnafu};

/// Directory a media producer writes its downloaded payloads into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetDirectory {
    root: PathBuf,
    extension: &'static str,
}

impl AssetDirectory {
    pub fn new(root: impl Into<PathBuf>, extension: &'static str) -> Self {
        Self {
            root: root.into(),
            extension,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, asset_name: &str) -> PathBuf {
        self.root.join(format!("{asset_name}.{}", self.extension))
    }

    /// Writes `bytes` under `asset_name` and returns the written path as the content reference.
    pub async fn write(&self, asset_name: &str, bytes: &[u8]) -> ProducerResult<String> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .context(CreateAssetDirectorySnafu {
                stage: "asset-create-directory",
                path: self.root.display().to_string(),
            })?;

        let path = self.path_for(asset_name);
        tokio::fs::write(&path, bytes).await.context(WriteAssetSnafu {
            stage: "asset-write",
            path: path.display().to_string(),
        })?;

        tracing::debug!(path = %path.display(), size_bytes = bytes.len(), "asset written");
        Ok(path.display().to_string())
    }
}
