//! Checksum and safe file utilities used by the archive codec and restore
//! engine: streaming SHA-256, bounded extraction, durable copies, and the
//! path-traversal guard.

use sha2::{Digest, Sha256};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};

use crate::error::{BackupError, Result};

/// Largest entry the extractor will accept: 1 GiB.
pub const MAX_EXTRACT_SIZE: u64 = 1024 * 1024 * 1024;

const COPY_BUF_SIZE: usize = 64 * 1024;

/// Directory mode for directories the engine creates.
#[cfg(unix)]
const DIR_MODE: u32 = 0o750;

/// Compute the SHA-256 of a whole file, streaming, lowercase hex.
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    sha256_reader(&mut file)
}

/// Compute the SHA-256 of everything a reader yields, lowercase hex.
pub fn sha256_reader<R: Read>(reader: &mut R) -> Result<String> {
    let mut hasher = Sha256::new();
    let mut buf = [0u8; COPY_BUF_SIZE];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Reader adapter that hashes every byte it passes through, so a single pass
/// both writes an archive entry and produces its checksum.
pub struct HashingReader<R> {
    inner: R,
    hasher: Sha256,
    bytes_read: u64,
}

impl<R: Read> HashingReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            bytes_read: 0,
        }
    }

    /// Lowercase hex digest of everything read so far, consuming the reader.
    pub fn finalize(self) -> (String, u64) {
        (format!("{:x}", self.hasher.finalize()), self.bytes_read)
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        self.bytes_read += n as u64;
        Ok(n)
    }
}

/// Create a directory (and parents) with the engine's directory mode.
pub fn create_dir_restricted(path: &Path) -> Result<()> {
    fs::create_dir_all(path)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(DIR_MODE))?;
    }
    Ok(())
}

/// Copy `src` to `dst`, creating the destination's parent directory, flushing
/// to stable storage before closing. The destination is removed on any error.
pub fn copy_file(src: &Path, dst: &Path) -> Result<u64> {
    if let Some(parent) = dst.parent() {
        create_dir_restricted(parent)?;
    }

    let result = (|| -> Result<u64> {
        let mut reader = File::open(src)?;
        let mut writer = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(dst)?;
        let copied = io::copy(&mut reader, &mut writer)?;
        writer.flush()?;
        writer.sync_all()?;
        Ok(copied)
    })();

    if result.is_err() {
        let _ = fs::remove_file(dst);
    }
    result
}

/// Extract up to `declared_size` bytes from `reader` into `dst`.
///
/// Rejects entries declaring more than [`MAX_EXTRACT_SIZE`]. Reading is capped
/// at `declared_size + 1` bytes so a lying archive cannot expand into a
/// decompression bomb; yielding more bytes than declared is an error. The
/// destination is removed on any failure.
pub fn extract_file<R: Read>(reader: &mut R, dst: &Path, declared_size: u64) -> Result<u64> {
    if declared_size > MAX_EXTRACT_SIZE {
        return Err(BackupError::Archive(format!(
            "archive entry too large: {} bytes (limit {})",
            declared_size, MAX_EXTRACT_SIZE
        )));
    }

    if let Some(parent) = dst.parent() {
        create_dir_restricted(parent)?;
    }

    let result = (|| -> Result<u64> {
        let mut limited = reader.take(declared_size + 1);
        let mut writer = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(dst)?;
        let written = io::copy(&mut limited, &mut writer)?;
        if written > declared_size {
            return Err(BackupError::Archive(format!(
                "archive entry exceeded its declared size of {} bytes",
                declared_size
            )));
        }
        writer.flush()?;
        writer.sync_all()?;
        Ok(written)
    })();

    if result.is_err() {
        let _ = fs::remove_file(dst);
    }
    result
}

/// Resolve an archive-relative name under `root`, rejecting anything that
/// would escape it.
///
/// Absolute names, `..` components, and drive prefixes all fail with
/// `invalid file path in archive`; the returned path is always strictly below
/// the cleaned root.
pub fn safe_join(root: &Path, name: &str) -> Result<PathBuf> {
    let candidate = Path::new(name);
    if candidate.as_os_str().is_empty() {
        return Err(BackupError::InvalidArchivePath);
    }

    let mut joined = root.to_path_buf();
    for component in candidate.components() {
        match component {
            Component::Normal(part) => joined.push(part),
            // CurDir is harmless; everything else escapes or re-roots.
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(BackupError::InvalidArchivePath);
            }
        }
    }

    if joined == root || !joined.starts_with(root) {
        return Err(BackupError::InvalidArchivePath);
    }
    Ok(joined)
}

/// Write bytes to `path` with owner-only permissions, atomically when the
/// filesystem allows a same-directory rename.
pub fn write_file_private(path: &Path, data: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| BackupError::Io(io::Error::other("path has no parent directory")))?;

    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    tmp.write_all(data)?;
    tmp.flush()?;
    tmp.as_file().sync_all()?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tmp.as_file()
            .set_permissions(fs::Permissions::from_mode(0o600))?;
    }

    if tmp.persist(path).is_err() {
        // Cross-device rename can fail; fall back to a direct overwrite.
        fs::write(path, data)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
        }
    }
    Ok(())
}
