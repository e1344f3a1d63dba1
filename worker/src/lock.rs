use buildfarm_common::errors::*;
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::PathBuf;
use tokio::task;

/// Process-wide lock serializing repository regeneration.
///
/// This is an advisory `flock` on a file, so other processes that honour the same
/// lock file are serialized as well. Every acquisition opens its own file handle,
/// which also makes tasks of the same process exclude each other.
#[derive(Debug, Clone)]
pub struct RegenLock {
    path: PathBuf,
}

impl RegenLock {
    pub fn new<P: Into<PathBuf>>(path: P) -> RegenLock {
        RegenLock { path: path.into() }
    }

    pub async fn acquire(&self) -> Result<RegenGuard> {
        let path = self.path.clone();
        debug!("Waiting for regeneration lock {:?}", path);
        let file = task::spawn_blocking(move || -> Result<File> {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(&path)
                .with_context(|| anyhow!("Failed to open lock file {:?}", path))?;
            FileExt::lock_exclusive(&file)
                .with_context(|| anyhow!("Failed to lock {:?}", path))?;
            Ok(file)
        }).await??;
        debug!("Acquired regeneration lock {:?}", self.path);
        Ok(RegenGuard { file })
    }
}

/// Releases the lock when dropped
#[derive(Debug)]
pub struct RegenGuard {
    file: File,
}

impl Drop for RegenGuard {
    fn drop(&mut self) {
        if let Err(err) = FileExt::unlock(&self.file) {
            warn!("Failed to release regeneration lock: {:#}", err);
        }
    }
}
