//! Tar archive codec. Streams files in and out of `.tar`, `.tar.gz`, and
//! `.tar.zst` containers, hashing every entry in the same pass that writes it.

use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression as GzCompression;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

use crate::config::{CompressionAlgorithm, CompressionConfig};
use crate::error::{BackupError, Result};
use crate::fsutil::HashingReader;
use crate::types::BackupFile;

/// Archive directory holding the database file and WAL.
pub const DATABASE_DIR: &str = "database";

/// Archive directory holding configuration.
pub const CONFIG_DIR: &str = "config";

/// Archive entry carrying the sanitized configuration.
pub const CONFIG_ENTRY: &str = "config/config.json";

/// Archive entry carrying the serialized backup record. Always written last.
pub const METADATA_ENTRY: &str = "backup-metadata.json";

const ENTRY_MODE: u32 = 0o600;

/// Write half of the codec: compression encoder stack under a tar builder.
enum ArchiveEncoder {
    Plain(BufWriter<File>),
    Gzip(GzEncoder<BufWriter<File>>),
    Zstd(zstd::stream::write::Encoder<'static, BufWriter<File>>),
}

impl Write for ArchiveEncoder {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            ArchiveEncoder::Plain(w) => w.write(buf),
            ArchiveEncoder::Gzip(w) => w.write(buf),
            ArchiveEncoder::Zstd(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            ArchiveEncoder::Plain(w) => w.flush(),
            ArchiveEncoder::Gzip(w) => w.flush(),
            ArchiveEncoder::Zstd(w) => w.flush(),
        }
    }
}

impl ArchiveEncoder {
    /// Finish the compression stream, returning the underlying file writer.
    fn finish(self) -> io::Result<BufWriter<File>> {
        match self {
            ArchiveEncoder::Plain(w) => Ok(w),
            ArchiveEncoder::Gzip(w) => w.finish(),
            ArchiveEncoder::Zstd(w) => w.finish(),
        }
    }
}

/// Streaming archive writer. Entries are appended with archive-relative names;
/// directories are never emitted. `finish` releases the tar writer, the
/// compression encoder, and the file handle in that order.
pub struct ArchiveWriter {
    builder: tar::Builder<ArchiveEncoder>,
}

impl std::fmt::Debug for ArchiveWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveWriter").finish_non_exhaustive()
    }
}

impl ArchiveWriter {
    /// Open a new archive at `path` with the given compression settings.
    pub fn create(path: &Path, compression: &CompressionConfig) -> Result<Self> {
        if compression.enabled && !(1..=9).contains(&compression.level) {
            return Err(BackupError::Configuration(format!(
                "compression.level must be 1-9, got {}",
                compression.level
            )));
        }

        let file = BufWriter::new(File::create(path)?);
        let encoder = if !compression.enabled {
            ArchiveEncoder::Plain(file)
        } else {
            match compression.algorithm {
                CompressionAlgorithm::Gzip => ArchiveEncoder::Gzip(GzEncoder::new(
                    file,
                    GzCompression::new(compression.level),
                )),
                CompressionAlgorithm::Zstd => ArchiveEncoder::Zstd(
                    zstd::stream::write::Encoder::new(file, compression.level as i32)
                        .map_err(|e| BackupError::Archive(e.to_string()))?,
                ),
            }
        };

        Ok(Self {
            builder: tar::Builder::new(encoder),
        })
    }

    /// Stream an on-disk file into the archive under `name`, hashing the
    /// content in the same pass. Returns the per-entry record.
    pub fn append_path(&mut self, name: &str, source: &Path) -> Result<BackupFile> {
        let meta = std::fs::metadata(source)?;
        let modified_at = meta.modified().ok().map(DateTime::<Utc>::from);

        let mut header = tar::Header::new_gnu();
        header.set_size(meta.len());
        header.set_mode(ENTRY_MODE);
        header.set_mtime(
            modified_at
                .map(|t| t.timestamp().max(0) as u64)
                .unwrap_or(0),
        );

        let mut reader = HashingReader::new(File::open(source)?);
        self.builder
            .append_data(&mut header, name, &mut reader)
            .map_err(|e| BackupError::Archive(format!("failed to append {}: {}", name, e)))?;
        let (checksum, size) = reader.finalize();

        Ok(BackupFile {
            name: name.to_string(),
            source_path: source.display().to_string(),
            size,
            modified_at,
            checksum,
        })
    }

    /// Append an in-memory payload under `name`.
    pub fn append_bytes(&mut self, name: &str, data: &[u8]) -> Result<BackupFile> {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(ENTRY_MODE);
        header.set_mtime(Utc::now().timestamp().max(0) as u64);

        let mut reader = HashingReader::new(data);
        self.builder
            .append_data(&mut header, name, &mut reader)
            .map_err(|e| BackupError::Archive(format!("failed to append {}: {}", name, e)))?;
        let (checksum, size) = reader.finalize();

        Ok(BackupFile {
            name: name.to_string(),
            source_path: String::new(),
            size,
            modified_at: Some(Utc::now()),
            checksum,
        })
    }

    /// Close the archive, flushing every layer to stable storage. Returns the
    /// first error encountered while unwinding the writer stack.
    pub fn finish(self) -> Result<()> {
        let encoder = self
            .builder
            .into_inner()
            .map_err(|e| BackupError::Archive(format!("failed to finish tar stream: {}", e)))?;
        let mut writer = encoder.finish()?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    }
}

/// Read half of the codec: decompression stack under a tar archive reader.
pub enum ArchiveSource {
    Plain(BufReader<File>),
    Gzip(GzDecoder<BufReader<File>>),
    Zstd(zstd::stream::read::Decoder<'static, BufReader<File>>),
}

impl Read for ArchiveSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            ArchiveSource::Plain(r) => r.read(buf),
            ArchiveSource::Gzip(r) => r.read(buf),
            ArchiveSource::Zstd(r) => r.read(buf),
        }
    }
}

/// Open an archive for sequential reading, chaining a decoder chosen by the
/// filename extension.
pub fn open_archive(path: &Path) -> Result<tar::Archive<ArchiveSource>> {
    let file = BufReader::new(File::open(path)?);
    let name = path.to_string_lossy();

    let source = if name.ends_with(".gz") {
        ArchiveSource::Gzip(GzDecoder::new(file))
    } else if name.ends_with(".zst") {
        ArchiveSource::Zstd(
            zstd::stream::read::Decoder::with_buffer(file)
                .map_err(|e| BackupError::Archive(e.to_string()))?,
        )
    } else {
        ArchiveSource::Plain(file)
    };

    Ok(tar::Archive::new(source))
}

/// List the entry names of an archive in order, skipping directories.
pub fn list_entries(path: &Path) -> Result<Vec<String>> {
    let mut archive = open_archive(path)?;
    let mut names = Vec::new();
    for entry in archive
        .entries()
        .map_err(|e| BackupError::Archive(e.to_string()))?
    {
        let entry = entry.map_err(|e| BackupError::Archive(e.to_string()))?;
        if entry.header().entry_type().is_dir() {
            continue;
        }
        let name = entry
            .path()
            .map_err(|e| BackupError::Archive(e.to_string()))?
            .to_string_lossy()
            .to_string();
        names.push(name);
    }
    Ok(names)
}
