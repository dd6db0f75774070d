//! Backup export and import for gateway state.
//!
//! Export streams a gzip-compressed tar of the state and workspace
//! directories without buffering it. When both directories live under the
//! data volume the archive gets the stable two-entry layout (`state/`,
//! `workspace/`) that import expects; otherwise each directory is archived
//! by its full path. Import never deletes anything and refuses entries
//! that try to escape the restore root.

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use http_body_util::{BodyExt, StreamBody};
use hyper::body::{Bytes, Frame};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::dirs::StateDirectories;
use crate::error::GateBody;

/// What one import run did.
#[derive(Debug, Clone, Serialize)]
pub struct ImportSummary {
    pub entries_written: u64,
    pub entries_skipped: u64,
}

/// Stream a backup archive of both runtime directories.
///
/// The tar is produced on a blocking task and chunked through a channel,
/// so multi-gigabyte workspaces never sit in memory. A client that hangs
/// up mid-download tears the producer down through the channel.
pub fn export_archive(dirs: StateDirectories, data_volume: String) -> GateBody {
    let roots = entry_roots(&dirs, Path::new(&data_volume));
    let (tx, rx) = mpsc::channel::<Bytes>(8);

    tokio::task::spawn_blocking(move || {
        let writer = ChannelWriter { tx };
        let encoder = GzEncoder::new(writer, Compression::default());
        let mut builder = tar::Builder::new(encoder);

        if let Err(e) = append_roots(&mut builder, &roots) {
            warn!(error = %e, "Backup export aborted mid-stream");
            return;
        }
        match builder.into_inner() {
            Ok(encoder) => {
                if let Err(e) = encoder.finish() {
                    warn!(error = %e, "Failed to finish backup archive");
                }
            }
            Err(e) => warn!(error = %e, "Failed to finalize backup archive"),
        }
    });

    let stream = futures::stream::unfold(rx, |mut rx| async move {
        rx.recv()
            .await
            .map(|chunk| (Ok::<_, std::io::Error>(Frame::data(chunk)), rx))
    });
    StreamBody::new(stream).boxed()
}

/// Restore an uploaded archive under the data volume.
///
/// Unsafe entries are skipped with an audit line and extraction continues.
/// Existing files are overwritten in place, nothing is deleted first.
pub async fn import_archive(archive: Bytes, data_volume: PathBuf) -> Result<ImportSummary> {
    tokio::task::spawn_blocking(move || extract_archive(&archive, &data_volume))
        .await
        .context("Import task panicked")?
}

/// Archive entry names mapped to their source directories.
fn entry_roots(dirs: &StateDirectories, data_volume: &Path) -> Vec<(PathBuf, PathBuf)> {
    let under_volume =
        dirs.state_dir.starts_with(data_volume) && dirs.workspace_dir.starts_with(data_volume);

    let name_for = |dir: &Path| -> PathBuf {
        if under_volume {
            dir.strip_prefix(data_volume)
                .map(Path::to_path_buf)
                .unwrap_or_else(|_| dir.to_path_buf())
        } else {
            // Full-path layout; tar entry names are always relative
            dir.components()
                .filter(|c| !matches!(c, std::path::Component::RootDir))
                .collect()
        }
    };

    vec![
        (name_for(&dirs.state_dir), dirs.state_dir.clone()),
        (name_for(&dirs.workspace_dir), dirs.workspace_dir.clone()),
    ]
}

fn append_roots<W: Write>(
    builder: &mut tar::Builder<W>,
    roots: &[(PathBuf, PathBuf)],
) -> Result<()> {
    for (name, path) in roots {
        if !path.is_dir() {
            debug!(path = %path.display(), "Skipping missing directory in backup");
            continue;
        }
        append_dir_recursive(builder, name, path)
            .with_context(|| format!("Failed to archive {}", path.display()))?;
    }
    builder.finish().context("Failed to finish tar stream")?;
    Ok(())
}

/// Walk one directory in sorted order so the archive layout is stable
/// across runs. Symlinks and special files are skipped.
fn append_dir_recursive<W: Write>(
    builder: &mut tar::Builder<W>,
    name: &Path,
    dir: &Path,
) -> Result<()> {
    builder.append_dir(name, dir)?;

    let mut entries: Vec<_> = std::fs::read_dir(dir)?.filter_map(|e| e.ok()).collect();
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let src = entry.path();
        let entry_name = name.join(entry.file_name());
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            append_dir_recursive(builder, &entry_name, &src)?;
        } else if file_type.is_file() {
            builder.append_path_with_name(&src, &entry_name)?;
        } else {
            debug!(path = %src.display(), "Skipping special file in backup");
        }
    }
    Ok(())
}

/// io::Write adapter that pushes chunks into the response body channel.
struct ChannelWriter {
    tx: mpsc::Sender<Bytes>,
}

impl Write for ChannelWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.tx
            .blocking_send(Bytes::copy_from_slice(buf))
            .map_err(|_| {
                std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "backup download receiver dropped",
                )
            })?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn extract_archive(archive: &[u8], data_volume: &Path) -> Result<ImportSummary> {
    // Stage through a private temp file, the extractor reads it back
    // instead of holding a second copy of the upload.
    let mut staged = tempfile::NamedTempFile::new().context("Failed to create staging file")?;
    staged
        .write_all(archive)
        .context("Failed to stage uploaded archive")?;
    let file = staged.reopen().context("Failed to reopen staged archive")?;

    std::fs::create_dir_all(data_volume)
        .with_context(|| format!("Failed to create {}", data_volume.display()))?;

    let mut tar = tar::Archive::new(GzDecoder::new(file));
    let mut written = 0u64;
    let mut skipped = 0u64;

    for entry in tar.entries().context("Failed to read archive")? {
        let mut entry = entry.context("Failed to read archive entry")?;
        let path = match entry.path() {
            Ok(p) => p.into_owned(),
            Err(e) => {
                skipped += 1;
                warn!(target: "audit", error = %e, "Skipped archive entry with unreadable path");
                continue;
            }
        };

        if !entry_path_is_safe(&path) {
            skipped += 1;
            warn!(target: "audit", entry = %path.display(), "Skipped unsafe archive entry");
            continue;
        }

        match entry.unpack_in(data_volume) {
            Ok(true) => written += 1,
            Ok(false) => {
                skipped += 1;
                warn!(target: "audit", entry = %path.display(), "Archive entry refused by extraction root");
            }
            Err(e) => {
                skipped += 1;
                warn!(entry = %path.display(), error = %e, "Failed to extract archive entry");
            }
        }
    }

    info!(written, skipped, "Backup import finished");
    Ok(ImportSummary {
        entries_written: written,
        entries_skipped: skipped,
    })
}

/// Reject absolute paths, parent traversal and Windows drive prefixes.
/// Both separator conventions are checked so an archive written elsewhere
/// cannot smuggle a `..\` past a Unix host.
pub fn entry_path_is_safe(path: &Path) -> bool {
    let raw = path.to_string_lossy();
    if raw.is_empty() {
        return false;
    }
    if raw.starts_with('/') || raw.starts_with('\\') {
        return false;
    }
    let bytes = raw.as_bytes();
    if bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' {
        return false;
    }
    if raw
        .split(|c| c == '/' || c == '\\')
        .any(|segment| segment == "..")
    {
        return false;
    }
    true
}
