//! Per-key serialization on top of any [`StorageAdapter`].
//!
//! The adapters themselves never lock: a `put` racing a `get` or `del` on the
//! same key is left to the filesystem. `KeyLocked` gives every key its own
//! async read/write lock. Writers (`put`, `del`) run alone, readers share.
//! A handle returned by `get` or `peek` keeps its read lock until it is
//! dropped, so a writer on that key waits for the reader to finish. Drop the
//! handle before writing the same key from the same task.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use futures::stream::BoxStream;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

use crate::error::StoreError;
use crate::storage::{ShardBody, ShardHandle, StorageAdapter};

type KeyLock = Arc<RwLock<()>>;
type KeyLocks = Arc<Mutex<HashMap<String, KeyLock>>>;

pub struct KeyLocked<S> {
    inner: S,
    locks: KeyLocks,
}

#[derive(Debug)]
enum Held {
    Read(#[allow(dead_code)] OwnedRwLockReadGuard<()>),
    Write(#[allow(dead_code)] OwnedRwLockWriteGuard<()>),
}

/// Holds (or waits for) the lock of one key. Dropping it, including when the
/// operation is cancelled, forgets the key once nobody else refers to it.
#[derive(Debug)]
pub(crate) struct KeyGuard {
    locks: KeyLocks,
    key: String,
    lock: Option<KeyLock>,
    held: Option<Held>,
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        self.held.take();
        self.lock.take();
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if locks
            .get(&self.key)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.key);
        }
    }
}

impl<S: StorageAdapter> KeyLocked<S> {
    pub fn new(inner: S) -> Self {
        KeyLocked {
            inner,
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Number of keys with an operation in flight, waiting, or an open handle.
    pub fn locked_keys(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    async fn acquire(&self, key: &str, write: bool) -> KeyGuard {
        let lock = self
            .locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key.to_string())
            .or_default()
            .clone();

        let mut guard = KeyGuard {
            locks: self.locks.clone(),
            key: key.to_string(),
            lock: Some(lock.clone()),
            held: None,
        };
        guard.held = Some(if write {
            Held::Write(lock.write_owned().await)
        } else {
            Held::Read(lock.read_owned().await)
        });
        tracing::trace!(key, write, "acquired shard lock");
        guard
    }

    async fn read_handle<F>(&self, key: &str, op: F) -> Result<ShardHandle, StoreError>
    where
        F: Future<Output = Result<ShardHandle, StoreError>>,
    {
        let guard = self.acquire(key, false).await;
        Ok(op.await?.with_guard(guard))
    }

    async fn with_key<T, F>(&self, key: &str, write: bool, op: F) -> T
    where
        F: Future<Output = T>,
    {
        let _guard = self.acquire(key, write).await;
        op.await
    }
}

#[async_trait::async_trait]
impl<S: StorageAdapter> StorageAdapter for KeyLocked<S> {
    async fn get(&self, key: &str) -> Result<ShardHandle, StoreError> {
        self.read_handle(key, self.inner.get(key)).await
    }

    async fn peek(&self, key: &str) -> Result<ShardHandle, StoreError> {
        self.read_handle(key, self.inner.peek(key)).await
    }

    async fn put(&self, key: &str, shard: ShardBody) -> Result<(), StoreError> {
        self.with_key(key, true, self.inner.put(key, shard)).await
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        self.with_key(key, true, self.inner.del(key)).await
    }

    async fn flush(&self) -> Result<(), StoreError> {
        self.inner.flush().await
    }

    async fn size(&self, key: Option<&str>) -> Result<u64, StoreError> {
        match key {
            Some(key) => self.with_key(key, false, self.inner.size(Some(key))).await,
            None => self.inner.size(None).await,
        }
    }

    fn keys(&self) -> BoxStream<'static, Result<String, StoreError>> {
        self.inner.keys()
    }
}
