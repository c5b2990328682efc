mod area;
mod backend;
pub mod videos;

pub use area::{StorageArea, StorageChange};
pub use backend::{FileBackend, MemoryBackend, StorageBackend};
pub use videos::{FileVideoStore, VideoId, VideoStore};
