//! Abstractions for filesystem access to enable testing and mocking.
//!
//! The `FileSystem` trait allows the samplers, the quota writer and the
//! exit-file watcher to work against both the real `/sys/fs/cgroup` and
//! `/proc` hierarchies on Linux and an in-memory mock in tests.

use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Abstraction for filesystem operations.
///
/// Reads cover the cgroup and proc surfaces; `write` covers the two quota
/// files arbiter owns. `group_owner` and `modified` exist for the exit-file
/// watcher, which triggers on mtime changes of a group-owned file.
pub trait FileSystem: Send + Sync {
    /// Reads the entire contents of a file as a string.
    fn read_to_string(&self, path: &Path) -> io::Result<String>;

    /// Writes a string to a file, truncating any previous content.
    fn write(&self, path: &Path, contents: &str) -> io::Result<()>;

    /// Checks if a path exists.
    fn exists(&self, path: &Path) -> bool;

    /// Lists entries in a directory.
    fn read_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>>;

    /// Returns the gid owning the path.
    fn group_owner(&self, path: &Path) -> io::Result<u32>;

    /// Returns the modification time of the path.
    fn modified(&self, path: &Path) -> io::Result<SystemTime>;
}

/// Real filesystem implementation that delegates to `std::fs`.
#[derive(Debug, Default, Clone, Copy)]
pub struct RealFs;

impl RealFs {
    /// Creates a new `RealFs` instance.
    pub fn new() -> Self {
        Self
    }
}

impl FileSystem for RealFs {
    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        std::fs::read_to_string(path)
    }

    fn write(&self, path: &Path, contents: &str) -> io::Result<()> {
        std::fs::write(path, contents)
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>> {
        let entries = std::fs::read_dir(path)?;
        let mut paths = Vec::new();
        for entry in entries {
            paths.push(entry?.path());
        }
        Ok(paths)
    }

    #[cfg(unix)]
    fn group_owner(&self, path: &Path) -> io::Result<u32> {
        use std::os::unix::fs::MetadataExt;
        Ok(std::fs::metadata(path)?.gid())
    }

    #[cfg(not(unix))]
    fn group_owner(&self, _path: &Path) -> io::Result<u32> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "group ownership is only available on unix",
        ))
    }

    fn modified(&self, path: &Path) -> io::Result<SystemTime> {
        std::fs::metadata(path)?.modified()
    }
}
