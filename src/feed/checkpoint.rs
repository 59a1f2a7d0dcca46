//! Durable resume tokens

use super::Position;
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::sync::Mutex;

/// Where a tailer records the last fully dispatched position
#[async_trait]
pub trait Checkpoint: Send + Sync {
    async fn load(&self) -> Result<Option<Position>>;
    async fn save(&self, position: Position) -> Result<()>;
}

#[derive(Debug, Serialize, Deserialize)]
struct Saved {
    position: Position,
}

/// A checkpoint stored as a small JSON file, replaced atomically
#[derive(Debug, Clone)]
pub struct FileCheckpoint {
    path: PathBuf,
}

impl FileCheckpoint {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl Checkpoint for FileCheckpoint {
    async fn load(&self) -> Result<Option<Position>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => {
                let saved: Saved = serde_json::from_slice(&bytes)?;
                Ok(Some(saved.position))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, position: Position) -> Result<()> {
        let tmp = self.path.with_extension("tmp");
        let bytes = serde_json::to_vec(&Saved { position })?;
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

/// A process-local checkpoint, for tests and embedding
#[derive(Debug, Default)]
pub struct MemoryCheckpoint {
    position: Mutex<Option<Position>>,
}

impl MemoryCheckpoint {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Checkpoint for MemoryCheckpoint {
    async fn load(&self) -> Result<Option<Position>> {
        Ok(*self.position.lock().await)
    }

    async fn save(&self, position: Position) -> Result<()> {
        *self.position.lock().await = Some(position);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_file_checkpoint() {
        let tmp = TempDir::new().unwrap();
        let checkpoint = FileCheckpoint::new(tmp.path().join("feed.json"));

        assert_eq!(checkpoint.load().await.unwrap(), None);
        checkpoint.save(Position(41)).await.unwrap();
        checkpoint.save(Position(42)).await.unwrap();
        assert_eq!(checkpoint.load().await.unwrap(), Some(Position(42)));

        let reopened = FileCheckpoint::new(tmp.path().join("feed.json"));
        assert_eq!(reopened.load().await.unwrap(), Some(Position(42)));
    }

    #[tokio::test]
    async fn test_corrupt_file_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("feed.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(FileCheckpoint::new(path).load().await.is_err());
    }
}
