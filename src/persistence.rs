//! Persistence adapter (C8): the thin contract to the external snapshot
//! collaborator described in §6. The real RDB reader/writer is explicitly
//! out of scope; `FileSnapshotStore` is a small, working, self-contained
//! stand-in with its own versioned binary framing so `SAVE`/`KEYS` are
//! exercisable end to end.

use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::error::RedpointError;

const MAGIC: &[u8; 4] = b"RPD1";
const VERSION: u8 = 1;

/// One key's worth of data handed to `save`: key, raw value bytes, and the
/// number of milliseconds remaining on its PX deadline (if any) as of the
/// moment the snapshot was taken.
pub struct Snapshot {
    pub entries: Vec<(String, Vec<u8>, Option<u64>)>,
}

#[async_trait::async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn save(
        &self,
        dir: &Path,
        dbfilename: &str,
        snapshot: &Snapshot,
    ) -> Result<(), RedpointError>;

    async fn load_keys(&self, dir: &Path, dbfilename: &str) -> Result<Vec<String>, RedpointError>;
}

#[derive(Clone, Default)]
pub struct FileSnapshotStore;

impl FileSnapshotStore {
    fn path(dir: &Path, dbfilename: &str) -> PathBuf {
        dir.join(dbfilename)
    }

    fn encode(snapshot: &Snapshot) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(MAGIC);
        out.push(VERSION);
        out.extend_from_slice(&(snapshot.entries.len() as u32).to_le_bytes());
        for (key, value, ttl_ms) in &snapshot.entries {
            let key_bytes = key.as_bytes();
            out.extend_from_slice(&(key_bytes.len() as u32).to_le_bytes());
            out.extend_from_slice(key_bytes);
            out.extend_from_slice(&(value.len() as u32).to_le_bytes());
            out.extend_from_slice(value);
            out.extend_from_slice(&ttl_ms.unwrap_or(0).to_le_bytes());
            out.push(ttl_ms.is_some() as u8);
        }
        out
    }

    fn decode_keys(bytes: &[u8]) -> Result<Vec<String>, RedpointError> {
        if bytes.len() < 5 || &bytes[0..4] != MAGIC {
            return Err(RedpointError::Persistence("bad snapshot magic".into()));
        }
        let version = bytes[4];
        if version != VERSION {
            return Err(RedpointError::Persistence(format!(
                "unsupported snapshot version {version}"
            )));
        }
        let mut pos = 5;
        let count = u32::from_le_bytes(
            bytes
                .get(pos..pos + 4)
                .ok_or_else(|| RedpointError::Persistence("truncated snapshot".into()))?
                .try_into()
                .unwrap(),
        );
        pos += 4;
        let mut keys = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let klen = u32::from_le_bytes(bytes[pos..pos + 4].try_into().unwrap()) as usize;
            pos += 4;
            let key = String::from_utf8_lossy(&bytes[pos..pos + klen]).into_owned();
            pos += klen;
            let vlen = u32::from_le_bytes(bytes[pos..pos + 4].try_into().unwrap()) as usize;
            pos += 4 + vlen;
            pos += 8 + 1; // ttl_ms + has_ttl
            keys.push(key);
        }
        Ok(keys)
    }
}

#[async_trait::async_trait]
impl SnapshotStore for FileSnapshotStore {
    async fn save(
        &self,
        dir: &Path,
        dbfilename: &str,
        snapshot: &Snapshot,
    ) -> Result<(), RedpointError> {
        fs::create_dir_all(dir)
            .await
            .map_err(|e| RedpointError::Persistence(e.to_string()))?;
        let final_path = Self::path(dir, dbfilename);
        let tmp_path = final_path.with_extension("tmp");
        let bytes = Self::encode(snapshot);
        {
            let mut f = fs::File::create(&tmp_path)
                .await
                .map_err(|e| RedpointError::Persistence(e.to_string()))?;
            f.write_all(&bytes)
                .await
                .map_err(|e| RedpointError::Persistence(e.to_string()))?;
            f.flush()
                .await
                .map_err(|e| RedpointError::Persistence(e.to_string()))?;
        }
        fs::rename(&tmp_path, &final_path)
            .await
            .map_err(|e| RedpointError::Persistence(e.to_string()))?;
        Ok(())
    }

    async fn load_keys(&self, dir: &Path, dbfilename: &str) -> Result<Vec<String>, RedpointError> {
        let path = Self::path(dir, dbfilename);
        let bytes = match fs::read(&path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(RedpointError::Persistence(e.to_string())),
        };
        Self::decode_keys(&bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn save_then_load_keys_round_trips() {
        let dir = TempDir::new().unwrap();
        let store = FileSnapshotStore;
        let snapshot = Snapshot {
            entries: vec![
                ("a".to_string(), b"1".to_vec(), None),
                ("b".to_string(), b"2".to_vec(), Some(1000)),
            ],
        };
        store
            .save(dir.path(), "dump.rdb", &snapshot)
            .await
            .unwrap();
        let mut keys = store.load_keys(dir.path(), "dump.rdb").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn load_keys_on_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = FileSnapshotStore;
        let keys = store.load_keys(dir.path(), "nope.rdb").await.unwrap();
        assert!(keys.is_empty());
    }
}
