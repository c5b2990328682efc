use crate::capture::Blob;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

pub type VideoId = u64;

/// Where finished recordings end up.
#[async_trait]
pub trait VideoStore: Send + Sync {
    async fn add_video(&self, blob: &Blob) -> Result<VideoId>;

    /// URL of a stored recording, `None` when the id is unknown
    async fn get_video(&self, id: VideoId) -> Result<Option<String>>;

    async fn get_latest_video(&self) -> Result<Option<String>>;
}

/// Keeps recordings as `video-000001.webm` style files with auto-increment ids.
pub struct FileVideoStore {
    dir: PathBuf,
    // Serializes id allocation
    add_lock: Mutex<()>,
}

impl FileVideoStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            add_lock: Mutex::new(()),
        }
    }

    async fn list(&self) -> Result<Vec<(VideoId, PathBuf)>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to read videos directory: {:?}", self.dir));
            }
        };

        let mut videos = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .context("Failed to list videos directory")?
        {
            let path = entry.path();
            if let Some(id) = parse_video_id(&path) {
                videos.push((id, path));
            }
        }
        videos.sort_by_key(|(id, _)| *id);
        Ok(videos)
    }
}

#[async_trait]
impl VideoStore for FileVideoStore {
    async fn add_video(&self, blob: &Blob) -> Result<VideoId> {
        let _guard = self.add_lock.lock().await;

        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("Failed to create videos directory: {:?}", self.dir))?;

        let id = self.list().await?.last().map_or(1, |(id, _)| id + 1);
        let path = self
            .dir
            .join(format!("video-{:06}.{}", id, extension_for(&blob.mime)));

        tokio::fs::write(&path, &blob.bytes)
            .await
            .with_context(|| format!("Failed to write video: {:?}", path))?;

        tracing::info!("Video saved: {:?} ({} bytes)", path, blob.len());
        Ok(id)
    }

    async fn get_video(&self, id: VideoId) -> Result<Option<String>> {
        let found = self.list().await?.into_iter().find(|(video, _)| *video == id);
        match found {
            Some((_, path)) => Ok(Some(file_url(&path))),
            None => {
                tracing::debug!("Video {} not found", id);
                Ok(None)
            }
        }
    }

    async fn get_latest_video(&self) -> Result<Option<String>> {
        Ok(self.list().await?.last().map(|(_, path)| file_url(path)))
    }
}

fn parse_video_id(path: &Path) -> Option<VideoId> {
    path.file_stem()?
        .to_str()?
        .strip_prefix("video-")?
        .parse()
        .ok()
}

fn extension_for(mime: &str) -> &'static str {
    match mime {
        "video/webm" => "webm",
        "video/mp4" => "mp4",
        "image/png" => "png",
        _ => "bin",
    }
}

fn file_url(path: &Path) -> String {
    let absolute = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    format!("file://{}", absolute.display())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ids_increment_and_latest_follows() {
        let temp = tempfile::tempdir().unwrap();
        let store = FileVideoStore::new(temp.path().join("videos"));

        assert_eq!(store.get_latest_video().await.unwrap(), None);

        let first = store.add_video(&Blob::webm(vec![1, 2, 3])).await.unwrap();
        let second = store.add_video(&Blob::webm(vec![4, 5])).await.unwrap();
        assert_eq!((first, second), (1, 2));

        let latest = store.get_latest_video().await.unwrap().unwrap();
        assert!(latest.starts_with("file://"));
        assert!(latest.ends_with("video-000002.webm"));

        let bytes = std::fs::read(temp.path().join("videos").join("video-000001.webm")).unwrap();
        assert_eq!(bytes, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_unknown_video_is_none() {
        let temp = tempfile::tempdir().unwrap();
        let store = FileVideoStore::new(temp.path());

        store.add_video(&Blob::webm(vec![0])).await.unwrap();
        assert_eq!(store.get_video(42).await.unwrap(), None);
        assert!(store.get_video(1).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_ids_continue_after_restart() {
        let temp = tempfile::tempdir().unwrap();
        FileVideoStore::new(temp.path())
            .add_video(&Blob::webm(vec![9]))
            .await
            .unwrap();

        let reopened = FileVideoStore::new(temp.path());
        let id = reopened.add_video(&Blob::webm(vec![8])).await.unwrap();
        assert_eq!(id, 2);
    }

    #[test]
    fn test_parse_video_id_ignores_other_files() {
        assert_eq!(parse_video_id(Path::new("/tmp/video-000012.webm")), Some(12));
        assert_eq!(parse_video_id(Path::new("/tmp/notes.txt")), None);
        assert_eq!(parse_video_id(Path::new("/tmp/video-abc.webm")), None);
    }
}
