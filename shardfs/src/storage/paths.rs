// PathManager maps shard keys to paths under the storage root.
//
// The layout is flat, one regular file per key:
//
//	<root>
//	├── <key>
//	├── <key>
//	└── .uploads
//	    └── <uuid>
//
// `.uploads` only exists when atomic writes are enabled. It holds in-flight
// uploads that are renamed onto `<root>/<key>` once fully written, so it must
// sit on the same filesystem as the shards.

use std::path::{Path, PathBuf};

pub const UPLOADS_DIR: &str = ".uploads";

#[derive(Clone, Debug)]
pub struct PathManager {
    root_path: PathBuf,
}

impl PathManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        PathManager {
            root_path: root.into(),
        }
    }

    /// Returns the storage root, (e.g. `<root>`).
    pub fn root_path(&self) -> &Path {
        &self.root_path
    }

    /// Returns the path to a single shard, (e.g. `<root>/<key>`).
    ///
    /// The key must already have passed `is_valid_key`.
    pub fn shard_path(&self, key: &str) -> PathBuf {
        self.root_path.join(key)
    }

    /// Returns the path to the root of uploads, (e.g. `<root>/.uploads`).
    pub fn uploads_path(&self) -> PathBuf {
        self.root_path.join(UPLOADS_DIR)
    }

    /// Returns the path to a single upload, (e.g. `<root>/.uploads/<id>`).
    pub fn upload_path(&self, id: &str) -> PathBuf {
        self.uploads_path().join(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flat_layout() {
        let paths = PathManager::new("/var/lib/shardfs");
        assert_eq!(
            paths.shard_path("abc123"),
            PathBuf::from("/var/lib/shardfs/abc123")
        );
        assert_eq!(
            paths.upload_path("0000"),
            PathBuf::from("/var/lib/shardfs/.uploads/0000")
        );
        assert_eq!(paths.shard_path("abc123").parent(), Some(paths.root_path()));
    }
}
