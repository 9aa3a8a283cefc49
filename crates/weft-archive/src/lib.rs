//! Streaming tar+gzip codec for weft artifacts (models, predictions).
//!
//! Both directions operate on `std::io` streams so neither the archive nor
//! any file it contains is ever buffered in full.  Async call sites bridge
//! with `tokio_util::io::SyncIoBridge` inside `spawn_blocking`.

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};
use std::time::UNIX_EPOCH;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use thiserror::Error;
use walkdir::WalkDir;

/// Mode stamped on every packed file entry, matching the platform's
/// artifact convention.
const ENTRY_MODE: u32 = 0o664;

/// Errors produced while packing or unpacking an archive.
#[derive(Debug, Error)]
pub enum ArchiveError {
    /// An I/O failure on the named path or the underlying stream.
    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// An entry tried to escape the unpack root (`..` or absolute path).
    #[error("archive entry escapes destination: {path}")]
    UnsafePath { path: PathBuf },

    /// Directory traversal failed while packing.
    #[error("walking {path}: {source}")]
    Walk {
        path: PathBuf,
        #[source]
        source: walkdir::Error,
    },
}

impl ArchiveError {
    fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        ArchiveError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Pack a directory into a gzipped tar stream written to `sink`.
///
/// Files are visited in deterministic lexicographic, depth-first order.
/// Every regular file becomes one entry named by its path relative to
/// `dir`, with mode 0664 and the source file's mtime.  Directories are not
/// emitted; entry names carry the full relative path.
pub fn pack_dir(dir: &Path, sink: impl Write) -> Result<(), ArchiveError> {
    let gz = GzEncoder::new(sink, Compression::default());
    let mut builder = tar::Builder::new(gz);

    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.map_err(|e| ArchiveError::Walk {
            path: dir.to_path_buf(),
            source: e,
        })?;
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let rel = path
            .strip_prefix(dir)
            .expect("walkdir yields paths under its root");
        append_file(&mut builder, path, rel)?;
    }

    finish(builder, dir)
}

/// Pack a single file into a gzipped tar stream written to `sink`.
///
/// The entry is named by the file's basename.
pub fn pack_file(path: &Path, sink: impl Write) -> Result<(), ArchiveError> {
    let gz = GzEncoder::new(sink, Compression::default());
    let mut builder = tar::Builder::new(gz);

    let name = path
        .file_name()
        .map(PathBuf::from)
        .ok_or_else(|| ArchiveError::UnsafePath {
            path: path.to_path_buf(),
        })?;
    append_file(&mut builder, path, &name)?;

    finish(builder, path)
}

fn append_file<W: Write>(
    builder: &mut tar::Builder<W>,
    path: &Path,
    entry_name: &Path,
) -> Result<(), ArchiveError> {
    let mut file = File::open(path).map_err(|e| ArchiveError::io(path, e))?;
    let meta = file.metadata().map_err(|e| ArchiveError::io(path, e))?;

    let mtime = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0);

    let mut header = tar::Header::new_gnu();
    header.set_size(meta.len());
    header.set_mode(ENTRY_MODE);
    header.set_mtime(mtime);

    builder
        .append_data(&mut header, entry_name, &mut file)
        .map_err(|e| ArchiveError::io(path, e))
}

/// Flush the tar and gzip layers explicitly so sink errors propagate
/// instead of being swallowed by a Drop impl.
fn finish<W: Write>(builder: tar::Builder<GzEncoder<W>>, context: &Path) -> Result<(), ArchiveError> {
    let gz = builder
        .into_inner()
        .map_err(|e| ArchiveError::io(context, e))?;
    gz.finish().map_err(|e| ArchiveError::io(context, e))?;
    Ok(())
}

/// Unpack a gzipped tar stream into `dir`.
///
/// Entry names are joined onto `dir`; absolute names and names containing
/// `..` are rejected.  Regular files are written with the entry's mode,
/// truncating anything already present; directories are created as needed.
pub fn unpack(source: impl Read, dir: &Path) -> Result<(), ArchiveError> {
    let mut archive = tar::Archive::new(GzDecoder::new(source));

    let entries = archive
        .entries()
        .map_err(|e| ArchiveError::io(dir, e))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| ArchiveError::io(dir, e))?;
        let name = entry
            .path()
            .map_err(|e| ArchiveError::io(dir, e))?
            .into_owned();
        let dest = safe_join(dir, &name)?;

        let header = entry.header();
        let mode = header.mode().unwrap_or(ENTRY_MODE);

        if header.entry_type().is_dir() {
            create_dir_with_mode(&dest, mode)?;
            continue;
        }
        if !header.entry_type().is_file() {
            // Links and special files are not part of the artifact contract.
            continue;
        }

        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ArchiveError::io(parent, e))?;
        }
        let mut file = File::create(&dest).map_err(|e| ArchiveError::io(&dest, e))?;
        io::copy(&mut entry, &mut file).map_err(|e| ArchiveError::io(&dest, e))?;
        set_mode(&dest, mode)?;
    }

    Ok(())
}

/// Join an entry name onto the unpack root, refusing traversal.
fn safe_join(root: &Path, name: &Path) -> Result<PathBuf, ArchiveError> {
    let mut dest = root.to_path_buf();
    for component in name.components() {
        match component {
            Component::Normal(part) => dest.push(part),
            Component::CurDir => {}
            _ => {
                return Err(ArchiveError::UnsafePath {
                    path: name.to_path_buf(),
                })
            }
        }
    }
    Ok(dest)
}

fn create_dir_with_mode(path: &Path, mode: u32) -> Result<(), ArchiveError> {
    std::fs::create_dir_all(path).map_err(|e| ArchiveError::io(path, e))?;
    set_mode(path, mode)
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<(), ArchiveError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .map_err(|e| ArchiveError::io(path, e))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> Result<(), ArchiveError> {
    Ok(())
}
