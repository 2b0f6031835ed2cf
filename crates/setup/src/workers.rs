//! The on-disk worker fleet: cleaning, worker 0 preparation and replication.

use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use camino::Utf8PathBuf;
use tracing::{debug, info};

use crate::config::WorkerLayout;
use crate::errors::{ProvisionError, Result};

/// One worker disk image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerImage {
    pub index: i64,
    pub path: Utf8PathBuf,
}

fn clean_error(path: &Path, source: io::Error) -> ProvisionError {
    ProvisionError::Clean {
        path: path.to_path_buf(),
        source,
    }
}

/// Make everything under `path` owner-writable so it can be unlinked.
fn clear_readonly(path: &Path) -> io::Result<()> {
    let meta = fs::symlink_metadata(path)?;
    if meta.file_type().is_symlink() {
        return Ok(());
    }
    let mut perms = meta.permissions();
    if perms.mode() & 0o200 == 0 {
        perms.set_mode(perms.mode() | 0o700);
        fs::set_permissions(path, perms)?;
    }
    if meta.is_dir() {
        for entry in fs::read_dir(path)? {
            clear_readonly(&entry?.path())?;
        }
    }
    Ok(())
}

fn remove_tree(path: &Path) -> io::Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
            debug!("Clearing read-only bits under {}", path.display());
            clear_readonly(path)?;
            fs::remove_dir_all(path)
        }
        Err(e) => Err(e),
    }
}

/// Remove prior state.
///
/// With `complete` the whole workers directory goes, base image included;
/// otherwise only the `win7*` images are deleted. A missing directory is
/// not an error.
pub fn clean(layout: &WorkerLayout, complete: bool) -> Result<()> {
    let dir = layout.dir().as_std_path();
    if complete {
        info!("Cleaning all files...");
        return remove_tree(dir).map_err(|e| clean_error(dir, e));
    }

    info!("Cleaning worker images...");
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(clean_error(dir, e)),
    };
    for entry in entries {
        let entry = entry.map_err(|e| clean_error(dir, e))?;
        let name = entry.file_name();
        let is_worker = name
            .to_str()
            .is_some_and(|n| n.starts_with(WorkerLayout::WORKER_PREFIX));
        if !is_worker {
            continue;
        }
        let path = entry.path();
        debug!("Removing {}", path.display());
        let r = if entry.file_type().map_err(|e| clean_error(&path, e))?.is_dir() {
            remove_tree(&path)
        } else {
            fs::remove_file(&path)
        };
        r.map_err(|e| clean_error(&path, e))?;
    }
    Ok(())
}

fn copy_image(layout: &WorkerLayout, index: i64) -> Result<WorkerImage> {
    let path = layout.worker_image(index);
    fs::copy(layout.base_image(), &path)
        .map_err(|source| ProvisionError::Replication { index, source })?;
    Ok(WorkerImage { index, path })
}

/// Create `win7-0.qcow2` from the base image, overwriting any previous one.
pub fn prepare_worker0(layout: &WorkerLayout) -> Result<WorkerImage> {
    info!("Creating worker image 0...");
    copy_image(layout, 0)
}

/// Copy the snapshotted worker 0 into workers `1..count`.
///
/// Copies are byte-for-byte, so every worker carries the `agent` snapshot.
/// The returned fleet includes worker 0 itself; `count <= 0` yields an
/// empty fleet and no copies.
pub fn replicate(layout: &WorkerLayout, count: i64) -> Result<Vec<WorkerImage>> {
    let source = layout.worker_image(0);
    if count <= 0 {
        return Ok(Vec::new());
    }
    fs::metadata(&source).map_err(|source| ProvisionError::Replication { index: 0, source })?;
    let mut r = vec![WorkerImage {
        index: 0,
        path: source.clone(),
    }];
    for index in 1..count {
        info!("Creating worker image {index}...");
        let path = layout.worker_image(index);
        fs::copy(&source, &path)
            .map_err(|source| ProvisionError::Replication { index, source })?;
        r.push(WorkerImage { index, path });
    }
    Ok(r)
}
