//! Keyspace (C2): the in-memory mapping from keys to typed values, with
//! millisecond expirations. Shared process-wide state behind one mutex,
//! held only for the duration of a single operation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use crate::error::RedpointError;
use crate::value::Value;

struct Entry {
    value: Value,
    /// `None` means the key never expires.
    expires_at: Option<Instant>,
}

#[derive(Default)]
pub struct Keyspace {
    inner: Mutex<HashMap<String, Entry>>,
}

impl Keyspace {
    pub fn new() -> Arc<Keyspace> {
        Arc::new(Keyspace::default())
    }

    /// Removes `key` if it is present and its deadline has passed. Must be
    /// called while already holding the map lock.
    fn sweep_locked(map: &mut HashMap<String, Entry>, key: &str) {
        let expired = matches!(map.get(key), Some(e) if matches!(e.expires_at, Some(d) if d <= Instant::now()));
        if expired {
            map.remove(key);
        }
    }

    pub async fn get(&self, key: &str) -> Option<Value> {
        let mut map = self.inner.lock().await;
        Self::sweep_locked(&mut map, key);
        map.get(key).map(|e| e.value.clone())
    }

    /// Unconditional replace (also replaces a stream-typed value). When
    /// `px` is given, schedules the key to expire at `now + px` millis and
    /// spawns the deferred deletion task.
    pub async fn set(self: &Arc<Self>, key: String, value: Value, px: Option<u64>) {
        let expires_at = px.map(|ms| Instant::now() + Duration::from_millis(ms));
        {
            let mut map = self.inner.lock().await;
            map.insert(
                key.clone(),
                Entry {
                    value,
                    expires_at,
                },
            );
        }
        if let Some(deadline) = expires_at {
            self.schedule_expiry(key, deadline);
        }
    }

    /// Spawns the background deletion task for a PX-bearing key. The
    /// deadline identity is re-checked before deleting so a key that was
    /// overwritten by a later SET (with a different or no deadline) in the
    /// meantime survives.
    fn schedule_expiry(self: &Arc<Self>, key: String, deadline: Instant) {
        let keyspace = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline.into()).await;
            let mut map = keyspace.inner.lock().await;
            if let Some(entry) = map.get(&key) {
                if entry.expires_at == Some(deadline) {
                    map.remove(&key);
                }
            }
        });
    }

    pub async fn del(&self, key: &str) -> bool {
        let mut map = self.inner.lock().await;
        Self::sweep_locked(&mut map, key);
        map.remove(key).is_some()
    }

    pub async fn exists(&self, key: &str) -> bool {
        let mut map = self.inner.lock().await;
        Self::sweep_locked(&mut map, key);
        map.contains_key(key)
    }

    pub async fn type_of(&self, key: &str) -> &'static str {
        let mut map = self.inner.lock().await;
        Self::sweep_locked(&mut map, key);
        map.get(key).map(|e| e.value.type_name()).unwrap_or("None")
    }

    /// All live (non-expired) keys, sweeping any expired ones found along
    /// the way.
    pub async fn keys(&self) -> Vec<String> {
        let mut map = self.inner.lock().await;
        let expired: Vec<String> = map
            .iter()
            .filter(|(_, e)| matches!(e.expires_at, Some(d) if d <= Instant::now()))
            .map(|(k, _)| k.clone())
            .collect();
        for k in expired {
            map.remove(&k);
        }
        map.keys().cloned().collect()
    }

    /// INCR: missing key initializes to 1; an existing non-integer string
    /// is a semantic error; a stream-typed key is a wrong-type error.
    pub async fn incr(&self, key: &str) -> Result<i64, RedpointError> {
        let mut map = self.inner.lock().await;
        Self::sweep_locked(&mut map, key);
        let next = match map.get(key) {
            None => 1,
            Some(entry) => match &entry.value {
                Value::String(bytes) => {
                    let s = std::str::from_utf8(bytes).map_err(|_| RedpointError::NotAnInteger)?;
                    let n: i64 = s.parse().map_err(|_| RedpointError::NotAnInteger)?;
                    n.checked_add(1).ok_or(RedpointError::NotAnInteger)?
                }
                Value::Stream(_) => return Err(RedpointError::WrongType),
            },
        };
        map.insert(
            key.to_string(),
            Entry {
                value: Value::String(next.to_string().into_bytes()),
                expires_at: None,
            },
        );
        Ok(next)
    }

    /// Applies `f` to the stream stored at `key`, creating an empty one if
    /// absent, under the single keyspace lock. Returns a wrong-type error
    /// if the key holds a string.
    pub async fn with_stream_mut<R>(
        &self,
        key: &str,
        f: impl FnOnce(&mut crate::stream::StreamLog) -> Result<R, RedpointError>,
    ) -> Result<R, RedpointError> {
        let mut map = self.inner.lock().await;
        Self::sweep_locked(&mut map, key);
        let entry = map.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::Stream(crate::stream::StreamLog::default()),
            expires_at: None,
        });
        match &mut entry.value {
            Value::Stream(log) => f(log),
            Value::String(_) => Err(RedpointError::WrongType),
        }
    }

    /// Read-only access to the stream stored at `key`, if any.
    pub async fn with_stream<R>(
        &self,
        key: &str,
        f: impl FnOnce(Option<&crate::stream::StreamLog>) -> R,
    ) -> Result<R, RedpointError> {
        let mut map = self.inner.lock().await;
        Self::sweep_locked(&mut map, key);
        match map.get(key) {
            None => Ok(f(None)),
            Some(entry) => match &entry.value {
                Value::Stream(log) => Ok(f(Some(log))),
                Value::String(_) => Err(RedpointError::WrongType),
            },
        }
    }

    /// Snapshot of non-stream keys and their absolute expiry, for the
    /// persistence collaborator.
    pub async fn snapshot_strings(&self) -> Vec<(String, Vec<u8>, Option<u64>)> {
        let map = self.inner.lock().await;
        let now = Instant::now();
        map.iter()
            .filter_map(|(k, e)| match &e.value {
                Value::String(bytes) => {
                    let remaining_ms = e.expires_at.map(|d| {
                        d.saturating_duration_since(now).as_millis() as u64
                    });
                    Some((k.clone(), bytes.clone(), remaining_ms))
                }
                Value::Stream(_) => None,
            })
            .collect()
    }
}
