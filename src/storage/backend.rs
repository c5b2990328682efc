use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;

/// Durable key-value area shared by every context.
///
/// Values are whole JSON documents, one per key. A save replaces the
/// previous document for that key; there is no field-level merge here.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    async fn load(&self, key: &str) -> Result<Option<Value>>;

    async fn save(&self, key: &str, value: &Value) -> Result<()>;
}

/// Volatile backend, used by tests and by stores that opt out of persistence
#[derive(Debug, Default)]
pub struct MemoryBackend {
    entries: Mutex<HashMap<String, Value>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn load(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    async fn save(&self, key: &str, value: &Value) -> Result<()> {
        self.entries.lock().insert(key.to_string(), value.clone());
        Ok(())
    }
}

/// Stores each key as `<dir>/<key>.json`.
///
/// Writes go to a temp file in the same directory which is then renamed over
/// the target, so a crash mid-write never leaves a truncated document.
#[derive(Debug, Clone)]
pub struct FileBackend {
    dir: PathBuf,
}

impl FileBackend {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", key))
    }
}

#[async_trait]
impl StorageBackend for FileBackend {
    async fn load(&self, key: &str) -> Result<Option<Value>> {
        let path = self.path_for(key);

        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read storage file: {:?}", path));
            }
        };

        let value = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse storage file: {:?}", path))?;
        Ok(Some(value))
    }

    async fn save(&self, key: &str, value: &Value) -> Result<()> {
        let dir = self.dir.clone();
        let path = self.path_for(key);
        let contents = serde_json::to_vec_pretty(value).context("Failed to serialize value")?;

        tokio::task::spawn_blocking(move || {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create storage directory: {:?}", dir))?;

            let mut file = tempfile::NamedTempFile::new_in(&dir)
                .with_context(|| format!("Failed to create temp file in {:?}", dir))?;
            file.write_all(&contents)
                .context("Failed to write storage temp file")?;
            file.persist(&path)
                .map_err(|e| e.error)
                .with_context(|| format!("Failed to replace storage file: {:?}", path))?;

            Ok::<(), anyhow::Error>(())
        })
        .await
        .context("spawn_blocking failed")??;

        Ok(())
    }
}
