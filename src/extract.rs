//! Concurrent tar extraction.
//!
//! The tar stream itself is strictly sequential, so the entry walk runs on
//! one blocking thread; regular-file bodies are buffered and handed to a
//! bounded pool of async writer tasks. Hard links stop the world: every
//! outstanding write is drained first, because the link target might still
//! be mid-write.

use std::fs::Permissions;
use std::io::{self, Read};
use std::os::unix::fs::{chown, lchown, symlink, DirBuilderExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tar::{Archive, EntryType};
use tokio::io::AsyncWriteExt;
use tokio::runtime::Handle;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::warn;

use crate::config::Config;
use crate::error::FetchError;

/// Extract a tar stream into `dir`, which must already exist.
pub fn extract_tar<R: Read>(
    stream: R,
    dir: &Path,
    config: &Config,
    handle: Handle,
) -> Result<(), FetchError> {
    let writer_tokens = Arc::new(Semaphore::new(config.write_workers));
    let mut pending: Vec<JoinHandle<Result<(), FetchError>>> = Vec::new();
    let mut archive = Archive::new(stream);

    let progress = indicatif::ProgressBar::new_spinner();
    progress.set_style(
        indicatif::ProgressStyle::default_spinner()
            .template("{spinner:.cyan} {msg} | {elapsed_precise} elapsed")
            .unwrap(),
    );
    progress.enable_steady_tick(Duration::from_millis(100));

    let mut entry_count = 0u64;
    for entry in archive.entries()? {
        let mut entry = entry?;
        let header = entry.header();
        let entry_type = header.entry_type();

        let raw_name = entry.path()?.into_owned();
        let raw_link = entry.link_name()?.map(|link| link.into_owned());
        let mode = header.mode()?;
        let uid = header.uid()? as u32;
        let gid = header.gid()? as u32;

        let Some(name) = strip_components(&raw_name, config.strip_components) else {
            continue;
        };
        let link_name = raw_link
            .as_deref()
            .and_then(|link| strip_components(link, config.strip_components));

        entry_count += 1;
        if entry_count <= 10 || entry_count % 100 == 0 {
            progress.set_message(format!(
                "Extracting: {} entries | {}",
                entry_count,
                name.display()
            ));
        }

        let path = dir.join(&name);
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::DirBuilder::new()
                    .recursive(true)
                    .mode(0o755)
                    .create(parent)?;
            }
        }

        match entry_type {
            EntryType::Directory => {
                // Created synchronously since a later entry may depend on it.
                if !path.is_dir() {
                    std::fs::DirBuilder::new()
                        .recursive(true)
                        .mode(mode)
                        .create(&path)?;
                }
                let _ = std::fs::set_permissions(&path, Permissions::from_mode(mode));
                let _ = chown(&path, Some(uid), Some(gid));
            }
            EntryType::Regular => {
                // The tar stream cannot be read out of order, so buffer the
                // body before handing it to a background writer.
                let mut buf = Vec::with_capacity(entry.size() as usize);
                entry.read_to_end(&mut buf)?;
                let permit = acquire_writer(&handle, &writer_tokens);
                pending.push(handle.spawn(write_file(
                    path,
                    buf,
                    mode,
                    uid,
                    gid,
                    config.overwrite,
                    permit,
                )));
            }
            EntryType::Link => {
                // Barrier: the link target may still be in the writer pool.
                drain_writers(&handle, &mut pending)?;
                let target = dir.join(link_name.ok_or_else(|| malformed_link(&name))?);
                if config.overwrite && path.symlink_metadata().is_ok() {
                    let _ = std::fs::remove_file(&path);
                }
                std::fs::hard_link(&target, &path)?;
                let _ = chown(&path, Some(uid), Some(gid));
            }
            EntryType::Symlink => {
                // No barrier needed; the target does not have to exist.
                let target = link_name.ok_or_else(|| malformed_link(&name))?;
                if config.overwrite && path.symlink_metadata().is_ok() {
                    let _ = std::fs::remove_file(&path);
                }
                symlink(&target, &path)?;
                let _ = lchown(&path, Some(uid), Some(gid));
            }
            // Metadata entries the tar reader has already folded into
            // `path()`/`link_name()`.
            EntryType::XHeader
            | EntryType::XGlobalHeader
            | EntryType::GNULongName
            | EntryType::GNULongLink => {}
            other => {
                if config.ignore_node_files {
                    warn!(
                        "Skipping tar entry {} with unknown type {:#x}",
                        name.display(),
                        other.as_byte()
                    );
                } else {
                    return Err(FetchError::UnsupportedEntry {
                        type_byte: other.as_byte(),
                        name: name.display().to_string(),
                    });
                }
            }
        }
    }

    // Don't exit before the last few files finish writing.
    drain_writers(&handle, &mut pending)?;
    progress.finish_with_message(format!(
        "Extracted {} entries to {}",
        entry_count,
        dir.display()
    ));
    Ok(())
}

/// Drop `count` leading components; `None` when nothing is left.
fn strip_components(path: &Path, count: usize) -> Option<PathBuf> {
    if count == 0 {
        return (!path.as_os_str().is_empty()).then(|| path.to_path_buf());
    }
    let stripped: PathBuf = path.components().skip(count).collect();
    if stripped.as_os_str().is_empty() {
        None
    } else {
        Some(stripped)
    }
}

fn acquire_writer(handle: &Handle, tokens: &Arc<Semaphore>) -> OwnedSemaphorePermit {
    handle
        .block_on(Arc::clone(tokens).acquire_owned())
        .expect("writer semaphore is never closed")
}

fn drain_writers(
    handle: &Handle,
    pending: &mut Vec<JoinHandle<Result<(), FetchError>>>,
) -> Result<(), FetchError> {
    for task in pending.drain(..) {
        handle
            .block_on(task)
            .map_err(|err| io::Error::other(format!("writer task failed: {err}")))??;
    }
    Ok(())
}

async fn write_file(
    path: PathBuf,
    buf: Vec<u8>,
    mode: u32,
    uid: u32,
    gid: u32,
    overwrite: bool,
    _permit: OwnedSemaphorePermit,
) -> Result<(), FetchError> {
    if overwrite && tokio::fs::metadata(&path).await.is_ok() {
        let _ = tokio::fs::remove_file(&path).await;
    }
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .truncate(true)
        .write(true)
        .mode(mode)
        .open(&path)
        .await?;
    file.write_all(&buf).await?;
    file.flush().await?;
    drop(file);
    let _ = tokio::fs::set_permissions(&path, Permissions::from_mode(mode)).await;
    let _ = chown(&path, Some(uid), Some(gid));
    Ok(())
}

fn malformed_link(name: &Path) -> FetchError {
    FetchError::Io(io::Error::other(format!(
        "link entry {} has no target",
        name.display()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_exactly_the_leading_components() {
        let strip = |p: &str, n| strip_components(Path::new(p), n);
        assert_eq!(strip("a/b/c", 0), Some(PathBuf::from("a/b/c")));
        assert_eq!(strip("a/b/c", 1), Some(PathBuf::from("b/c")));
        assert_eq!(strip("a/b/c", 2), Some(PathBuf::from("c")));
        assert_eq!(strip("a/b/c", 3), None);
        assert_eq!(strip("a", 1), None);
        assert_eq!(strip("./a/b", 1), Some(PathBuf::from("a/b")));
        // Relative link targets survive untouched when no stripping is asked.
        assert_eq!(strip("../shared/x", 0), Some(PathBuf::from("../shared/x")));
    }
}
