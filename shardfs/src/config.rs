use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use crate::error::StoreError;
use crate::storage::StorageAdapter;
use crate::storage::driver::filesystem::{FileStorageAdapter, WriteMode};
use crate::storage::locked::KeyLocked;

/// Storage options, settable by flag or environment. Host binaries can
/// `#[command(flatten)]` this into their own argument parser.
#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
pub struct StoreArgs {
    /// Shard storage root path
    #[arg(long, env = "SHARD_STORE_ROOTDIR", default_value = "/var/lib/shardfs")]
    pub root: PathBuf,

    /// Storage backend type
    #[arg(long, env = "SHARD_STORE_BACKEND", default_value = "FILESYSTEM")]
    pub storage: String,

    /// Write shards to an upload file first and rename them into place
    #[arg(long, env = "SHARD_STORE_ATOMIC_WRITES", default_value_t = false)]
    pub atomic_writes: bool,

    /// Serialize operations on the same key
    #[arg(long, env = "SHARD_STORE_LOCK_KEYS", default_value_t = false)]
    pub lock_keys: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StorageBackend {
    Filesystem,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub backend: StorageBackend,
    pub root_dir: PathBuf,
    pub write_mode: WriteMode,
    pub lock_keys: bool,
}

impl Config {
    pub fn from_args(args: &StoreArgs) -> Result<Self, StoreError> {
        let backend = match args.storage.to_ascii_uppercase().as_str() {
            "FILESYSTEM" => StorageBackend::Filesystem,
            _ => return Err(StoreError::UnsupportedBackend(args.storage.clone())),
        };
        let write_mode = if args.atomic_writes {
            WriteMode::Atomic
        } else {
            WriteMode::Overwrite
        };

        Ok(Config {
            backend,
            root_dir: args.root.clone(),
            write_mode,
            lock_keys: args.lock_keys,
        })
    }
}

/// Builds the storage adapter described by `config`, creating its root.
pub fn open_storage(config: &Config) -> Result<Arc<dyn StorageAdapter>, StoreError> {
    let storage: Arc<dyn StorageAdapter> = match config.backend {
        StorageBackend::Filesystem => {
            let adapter = FileStorageAdapter::with_options(&config.root_dir, config.write_mode)?;
            if config.lock_keys {
                Arc::new(KeyLocked::new(adapter))
            } else {
                Arc::new(adapter)
            }
        }
    };

    tracing::info!(
        backend = ?config.backend,
        root = %config.root_dir.display(),
        write_mode = ?config.write_mode,
        lock_keys = config.lock_keys,
        "opened shard storage"
    );
    Ok(storage)
}
