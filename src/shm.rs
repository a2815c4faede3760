//! Named shared-memory segments.
//!
//! Segments are plain files under a configurable directory (normally a
//! tmpfs such as `/dev/shm`), truncated to size and mapped read-write.
//! Names follow the rendezvous convention: `/jack-engine` for the engine
//! control block, `/jack-c-<client>` per external client, `/jck-[<type>]`
//! per port type. The leading slash is part of the name, not the path.

use memmap2::MmapMut;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum ShmError {
    #[error("cannot create segment {name}: {source}")]
    Create {
        name: String,
        source: std::io::Error,
    },
    #[error("cannot attach segment {name}: {source}")]
    Attach {
        name: String,
        source: std::io::Error,
    },
    #[error("cannot resize segment {name} to {len} bytes: {source}")]
    Resize {
        name: String,
        len: usize,
        source: std::io::Error,
    },
}

/// A named, mapped shared segment. Dropping unmaps but does not unlink;
/// [`SharedSegment::destroy`] removes the backing file.
pub struct SharedSegment {
    name: String,
    path: PathBuf,
    file: File,
    map: MmapMut,
    len: usize,
}

fn backing_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(name.trim_start_matches('/'))
}

impl SharedSegment {
    /// Create (or truncate) a named segment of `len` bytes, zero-filled.
    pub fn create(dir: &Path, name: &str, len: usize) -> Result<Self, ShmError> {
        let path = backing_path(dir, name);
        let err = |source| ShmError::Create {
            name: name.to_string(),
            source,
        };
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(err)?;
        file.set_len(len as u64).map_err(err)?;
        // SAFETY: the file is open read-write and sized; the mapping lives
        // as long as `self`, which also owns the file handle.
        let map = unsafe { MmapMut::map_mut(&file) }.map_err(err)?;
        Ok(Self {
            name: name.to_string(),
            path,
            file,
            map,
            len,
        })
    }

    /// Attach to an existing named segment created by another process (or
    /// another handle in this one).
    pub fn attach(dir: &Path, name: &str) -> Result<Self, ShmError> {
        let path = backing_path(dir, name);
        let err = |source| ShmError::Attach {
            name: name.to_string(),
            source,
        };
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(err)?;
        let len = file.metadata().map_err(err)?.len() as usize;
        // SAFETY: as in `create`; the mapping is tied to this handle.
        let map = unsafe { MmapMut::map_mut(&file) }.map_err(err)?;
        Ok(Self {
            name: name.to_string(),
            path,
            file,
            map,
            len,
        })
    }

    /// Grow or shrink the segment in place. The old mapping is dropped
    /// before the file is remapped, so raw pointers into the segment are
    /// invalidated; callers re-derive them from `as_ptr`.
    pub fn resize(&mut self, len: usize) -> Result<(), ShmError> {
        let err = |source| ShmError::Resize {
            name: self.name.clone(),
            len,
            source,
        };
        self.file.set_len(len as u64).map_err(err)?;
        // SAFETY: file handle stays open across the remap.
        self.map = unsafe { MmapMut::map_mut(&self.file) }.map_err(err)?;
        self.len = len;
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.map.as_ptr() as *mut u8
    }

    /// Zero a byte range of the segment.
    pub fn zero_range(&self, offset: usize, len: usize) {
        assert!(offset + len <= self.len);
        // SAFETY: bounds asserted above; shared readers tolerate torn
        // zeroes the same way they tolerate in-flight sample data.
        unsafe { self.as_ptr().add(offset).write_bytes(0, len) }
    }

    /// Remove the backing file. The mapping stays valid until drop.
    pub fn destroy(&self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(name = %self.name, error = %e, "cannot unlink segment");
            }
        }
    }
}

// SAFETY: the mapping is valid for the lifetime of the handle and all
// cross-thread access goes through atomics or volatile copies in the
// layout types (`control`, `buffer`).
unsafe impl Send for SharedSegment {}
unsafe impl Sync for SharedSegment {}

/// Delete stale rendezvous files (`jack-*`, `jack_*`) left behind by an
/// earlier instance. Subsequent startups probe these names to decide
/// whether a server is already running, so this must run before any
/// socket is bound.
pub fn cleanup_server_dir(dir: &Path) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!(dir = %dir.display(), error = %e, "cannot open server directory");
            return;
        }
    };

    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with("jack-") || name.starts_with("jack_") {
            if let Err(e) = std::fs::remove_file(entry.path()) {
                tracing::warn!(file = %name, error = %e, "cannot remove stale file");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_attach_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let seg = SharedSegment::create(dir.path(), "/jack-engine", 4096).unwrap();
        assert_eq!(seg.len(), 4096);

        // creation zero-fills
        let bytes = unsafe { std::slice::from_raw_parts(seg.as_ptr(), 16) };
        assert!(bytes.iter().all(|b| *b == 0));

        unsafe { seg.as_ptr().write(0xAB) };
        let other = SharedSegment::attach(dir.path(), "/jack-engine").unwrap();
        assert_eq!(other.len(), 4096);
        assert_eq!(unsafe { other.as_ptr().read() }, 0xAB);
    }

    #[test]
    fn test_resize_grows() {
        let dir = tempfile::tempdir().unwrap();
        let mut seg = SharedSegment::create(dir.path(), "/jck-[audio]", 1024).unwrap();
        seg.resize(8192).unwrap();
        assert_eq!(seg.len(), 8192);
        seg.zero_range(0, 8192);
    }

    #[test]
    fn test_cleanup_matches_prefixes() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["jack_0", "jack-ack-fifo-1", "keepme", "jackpot"] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }
        cleanup_server_dir(dir.path());
        let left: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert!(left.contains(&"keepme".to_string()));
        assert!(left.contains(&"jackpot".to_string()));
        assert_eq!(left.len(), 2);
    }

    #[test]
    fn test_destroy_unlinks() {
        let dir = tempfile::tempdir().unwrap();
        let seg = SharedSegment::create(dir.path(), "/jack-c-test", 64).unwrap();
        seg.destroy();
        assert!(SharedSegment::attach(dir.path(), "/jack-c-test").is_err());
    }
}
