//! Persistent cursors of interrupted cleanup passes.
//!
//! One file per collection:
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │ MAGIC "RSCK" (4) │ VERSION u32 (4)  │
//! ├─────────────────────────────────────┤
//! │ bincode(CleanupCheckpoint)          │
//! ├─────────────────────────────────────┤
//! │ CRC32 of everything above (4)       │
//! └─────────────────────────────────────┘
//! ```
//!
//! Writes go to a `.tmp` sibling that is synced and renamed into place.

use crate::error::{Error, Result};
use crate::metadata::ChunkRange;
use crate::types::{CollectionId, ShardKey};
use crc::{Crc, CRC_32_ISCSI};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

const MAGIC: [u8; 4] = [b'R', b'S', b'C', b'K'];

const VERSION: u32 = 1;

const EXTENSION: &str = "ckpt";

/// Progress of one cleanup pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupCheckpoint {
    /// Collection being cleaned.
    pub collection: CollectionId,
    /// Bounds of the pass.
    pub bounds: ChunkRange,
    /// Last key examined.
    pub cursor: Option<ShardKey>,
    /// Documents examined so far.
    pub scanned: u64,
    /// Documents deleted so far.
    pub deleted: u64,
}

/// Directory of cleanup checkpoints.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

fn file_stem(collection: &str) -> String {
    collection.bytes().map(|b| format!("{:02x}", b)).collect()
}

fn encode(checkpoint: &CleanupCheckpoint) -> Result<Vec<u8>> {
    let body = bincode::serialize(checkpoint)?;
    let mut buf = Vec::with_capacity(body.len() + 12);
    buf.extend_from_slice(&MAGIC);
    buf.extend_from_slice(&VERSION.to_le_bytes());
    buf.extend_from_slice(&body);
    let crc = CRC32.checksum(&buf);
    buf.extend_from_slice(&crc.to_le_bytes());
    Ok(buf)
}

fn decode(buf: &[u8]) -> Result<CleanupCheckpoint> {
    if buf.len() < 12 || buf[..4] != MAGIC {
        return Err(Error::Storage("bad checkpoint magic".into()));
    }
    let (payload, trailer) = buf.split_at(buf.len() - 4);
    let mut crc = [0u8; 4];
    crc.copy_from_slice(trailer);
    if CRC32.checksum(payload) != u32::from_le_bytes(crc) {
        return Err(Error::Storage("checkpoint checksum mismatch".into()));
    }
    let mut version = [0u8; 4];
    version.copy_from_slice(&payload[4..8]);
    let version = u32::from_le_bytes(version);
    if version != VERSION {
        return Err(Error::Storage(format!("unsupported checkpoint version {}", version)));
    }
    Ok(bincode::deserialize(&payload[8..])?)
}

impl CheckpointStore {
    /// Open `dir`, creating it and removing leftovers of interrupted writes.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;
        let mut entries = fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "tmp") {
                tracing::debug!(path = %path.display(), "Removing orphaned temp file");
                if let Err(e) = fs::remove_file(&path).await {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to remove temp file");
                }
            }
        }
        Ok(Self { dir })
    }

    /// Directory holding the checkpoints.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, collection: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", file_stem(collection), EXTENSION))
    }

    /// Atomically replace the checkpoint of `checkpoint.collection`.
    pub async fn save(&self, checkpoint: &CleanupCheckpoint) -> Result<()> {
        let path = self.path_for(&checkpoint.collection);
        let tmp = path.with_extension("tmp");
        let buf = encode(checkpoint)?;

        let mut file = fs::File::create(&tmp).await?;
        file.write_all(&buf).await?;
        file.sync_all().await?;
        drop(file);

        if let Err(e) = fs::rename(&tmp, &path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    /// Checkpoint of `collection`, if any.
    pub async fn load(&self, collection: &str) -> Result<Option<CleanupCheckpoint>> {
        match fs::read(self.path_for(collection)).await {
            Ok(buf) => decode(&buf).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove the checkpoint of `collection`.
    pub async fn remove(&self, collection: &str) -> Result<()> {
        match fs::remove_file(self.path_for(collection)).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    /// Every readable checkpoint. Corrupt files are logged and skipped.
    pub async fn list(&self) -> Result<Vec<CleanupCheckpoint>> {
        let mut out = Vec::new();
        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !path.extension().is_some_and(|ext| ext == EXTENSION) {
                continue;
            }
            match fs::read(&path).await.map_err(Error::from).and_then(|b| decode(&b)) {
                Ok(checkpoint) => out.push(checkpoint),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable cleanup checkpoint");
                }
            }
        }
        out.sort_by(|a, b| a.collection.cmp(&b.collection));
        Ok(out)
    }
}
