//! A storage adapter that keeps content-addressed shards on the local
//! filesystem, one regular file per key directly under a root directory.
//!
//! ```no_run
//! use shardfs::{FileStorageAdapter, StorageAdapter};
//!
//! # async fn demo() -> Result<(), shardfs::StoreError> {
//! let store = FileStorageAdapter::new("/var/lib/shardfs")?;
//! store.put("abc123", "test".into()).await?;
//! let mut shard = store.get("abc123").await?;
//! assert_eq!(shard.read_to_vec().await?, b"test");
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod storage;
pub mod utils;

pub use config::{Config, StoreArgs, open_storage};
pub use error::StoreError;
pub use storage::driver::filesystem::{FileStorageAdapter, WriteMode};
pub use storage::locked::KeyLocked;
pub use storage::{ShardBody, ShardHandle, StorageAdapter};
