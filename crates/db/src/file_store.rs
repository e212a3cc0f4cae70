//! File-backed [`BlobStore`].
//!
//! Each blob is one file under the data directory. Writes go to a uniquely
//! named temp file in the same directory, are fsynced, then renamed over the
//! destination, so a reader sees either the old blob or the new one.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use tankalarm_core::error::{CoreError, CoreResult};
use tankalarm_core::persist::{BlobKey, BlobStore};

/// Blobs larger than this are refused on read.
const MAX_BLOB_BYTES: u64 = 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum FileStoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Blob {path} is {size} bytes, limit is {MAX_BLOB_BYTES}")]
    TooLarge { path: PathBuf, size: u64 },
}

impl From<FileStoreError> for CoreError {
    fn from(e: FileStoreError) -> Self {
        CoreError::Persistence(e.to_string())
    }
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> FileStoreError + '_ {
    move |source| FileStoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[derive(Debug)]
pub struct FileBlobStore {
    dir: PathBuf,
    seq: AtomicU64,
}

impl FileBlobStore {
    /// Open (creating if needed) a blob directory.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, FileStoreError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(io_err(&dir))?;
        tracing::info!(dir = %dir.display(), "Blob store opened");
        Ok(Self {
            dir,
            seq: AtomicU64::new(0),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, key: BlobKey) -> PathBuf {
        self.dir.join(key.name())
    }

    fn read_file(&self, path: &Path) -> Result<Option<Vec<u8>>, FileStoreError> {
        let mut file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_err(path)(e)),
        };
        let size = file.metadata().map_err(io_err(path))?.len();
        if size > MAX_BLOB_BYTES {
            return Err(FileStoreError::TooLarge {
                path: path.to_path_buf(),
                size,
            });
        }
        let mut buf = Vec::with_capacity(size as usize);
        file.read_to_end(&mut buf).map_err(io_err(path))?;
        Ok(Some(buf))
    }

    fn atomic_write(&self, dest: &Path, data: &[u8]) -> Result<(), FileStoreError> {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let tmp = dest.with_extension(format!("tmp.{}.{seq}", std::process::id()));

        let written = (|| {
            let mut f = OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&tmp)?;
            f.write_all(data)?;
            f.sync_all()?;
            fs::rename(&tmp, dest)
        })();

        if let Err(e) = written {
            let _ = fs::remove_file(&tmp);
            return Err(io_err(dest)(e));
        }
        Ok(())
    }
}

impl BlobStore for FileBlobStore {
    fn read(&self, key: BlobKey) -> CoreResult<Option<Vec<u8>>> {
        Ok(self.read_file(&self.path_for(key))?)
    }

    fn write(&self, key: BlobKey, bytes: &[u8]) -> CoreResult<()> {
        let path = self.path_for(key);
        self.atomic_write(&path, bytes)?;
        tracing::debug!(blob = key.name(), bytes = bytes.len(), "Blob written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn missing_blob_reads_as_none() {
        let tmp = TempDir::new().expect("tmpdir");
        let store = FileBlobStore::open(tmp.path()).expect("open");
        assert_eq!(store.read(BlobKey::Config).expect("read"), None);
    }

    #[test]
    fn write_then_read_and_overwrite() {
        let tmp = TempDir::new().expect("tmpdir");
        let store = FileBlobStore::open(tmp.path().join("nested")).expect("open");
        store.write(BlobKey::Heartbeat, b"{\"a\":1}").expect("write");
        store.write(BlobKey::Heartbeat, b"{\"a\":2}").expect("overwrite");
        assert_eq!(
            store.read(BlobKey::Heartbeat).expect("read"),
            Some(b"{\"a\":2}".to_vec())
        );
        assert_eq!(store.read(BlobKey::Config).expect("read"), None);
    }

    #[test]
    fn no_temp_files_left_behind() {
        let tmp = TempDir::new().expect("tmpdir");
        let store = FileBlobStore::open(tmp.path()).expect("open");
        for i in 0..5 {
            store.write(BlobKey::Config, format!("{i}").as_bytes()).expect("write");
        }
        let names: Vec<String> = fs::read_dir(tmp.path())
            .expect("list")
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec![BlobKey::Config.name().to_string()]);
    }

    #[test]
    fn failed_write_keeps_previous_blob() {
        let tmp = TempDir::new().expect("tmpdir");
        let store = FileBlobStore::open(tmp.path()).expect("open");
        store.write(BlobKey::Config, b"v1").expect("write");

        // A directory at the destination makes the rename fail.
        let blocked = store.path_for(BlobKey::Heartbeat);
        fs::create_dir(&blocked).expect("mkdir");
        fs::write(blocked.join("keep"), b"x").expect("fill");
        assert_matches!(
            store.write(BlobKey::Heartbeat, b"v2"),
            Err(CoreError::Persistence(_))
        );
        assert_eq!(store.read(BlobKey::Config).expect("read"), Some(b"v1".to_vec()));
    }

    #[test]
    fn oversized_blob_is_refused() {
        let tmp = TempDir::new().expect("tmpdir");
        let store = FileBlobStore::open(tmp.path()).expect("open");
        let big = vec![b'x'; MAX_BLOB_BYTES as usize + 1];
        fs::write(store.path_for(BlobKey::Config), big).expect("seed");
        assert_matches!(store.read(BlobKey::Config), Err(CoreError::Persistence(_)));
    }
}
