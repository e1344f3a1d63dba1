use buildfarm_common::errors::*;
use chrono::prelude::*;
use std::path::{Path, PathBuf};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;

/// Per-worker diagnostic log, `<worker_logdir>/worker-<group>-<ordinal>.log`
#[derive(Debug, Clone, Default)]
pub struct WorkerLog {
    path: Option<PathBuf>,
}

impl WorkerLog {
    pub fn new(logdir: &Path, group_id: u32, ordinal: u64) -> WorkerLog {
        WorkerLog {
            path: Some(logdir.join(format!("worker-{}-{}.log", group_id, ordinal))),
        }
    }

    /// A log that only forwards to the process logger
    pub fn disabled() -> WorkerLog {
        WorkerLog::default()
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub async fn log<M: AsRef<str>>(&self, msg: M) {
        let msg = msg.as_ref();
        debug!("{}", msg);

        let Some(path) = &self.path else {
            return;
        };
        if let Err(err) = append(path, msg).await {
            error!("Could not write to logfile {:?} - {:#}", path, err);
        }
    }
}

async fn append(path: &Path, msg: &str) -> Result<()> {
    let line = format!("{}: {}\n", Local::now().format("%F %T"), msg);
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(line.as_bytes()).await?;
    file.flush().await?;
    Ok(())
}
