use anyhow::{Result, Context};
use async_trait::async_trait;
use std::path::PathBuf;
use tracing::debug;

/// Storage for generated media such as thumbnails
#[async_trait]
pub trait MediaStorage: Send + Sync {
    /// Store the bytes under `key` and return where they ended up
    async fn store(&self, key: &str, content: &[u8]) -> Result<String>;
}

/// Media storage on the local filesystem
pub struct FileSystemMediaStorage {
    root: PathBuf,
}

impl FileSystemMediaStorage {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }
}

#[async_trait]
impl MediaStorage for FileSystemMediaStorage {
    async fn store(&self, key: &str, content: &[u8]) -> Result<String> {
        // Keys may not escape the storage root
        let file_name: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' { c } else { '_' })
            .collect();
        let path = self.root.join(file_name);

        tokio::fs::create_dir_all(&self.root)
            .await
            .context(format!("Failed to create media directory: {}", self.root.display()))?;

        tokio::fs::write(&path, content)
            .await
            .context(format!("Failed to write media file: {}", path.display()))?;

        debug!("Stored {} bytes of media at {}", content.len(), path.display());

        Ok(path.display().to_string())
    }
}
