use buildfarm_common::errors::*;
use buildfarm_common::events::Event;
use std::path::PathBuf;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

/// The single consumer of the event channel, appends every event to the backend log
pub struct EventLog {
    path: PathBuf,
    file: File,
    verbose: bool,
}

impl EventLog {
    /// Open the logfile up front, a dispatcher without its event log must not start
    pub async fn open(path: PathBuf, verbose: bool) -> Result<EventLog> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| anyhow!("Failed to create log directory {:?}", parent))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| anyhow!("Failed to open logfile {:?}", path))?;

        let mut log = EventLog { path, file, verbose };
        log.record(&Event::new("logger", "Logger initiated")).await;
        Ok(log)
    }

    /// Drain the channel until every producer is gone
    pub async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Event>) -> Result<()> {
        while let Some(event) = rx.recv().await {
            self.record(&event).await;
        }

        debug!("Event channel closed, stopping event log");
        Ok(())
    }

    async fn record(&mut self, event: &Event) {
        let line = event.format();
        if self.verbose {
            info!("{}", line);
        } else {
            debug!("{}", line);
        }

        let res = async {
            self.file.write_all(line.as_bytes()).await?;
            self.file.write_all(b"\n").await?;
            self.file.flush().await
        }.await;
        if let Err(err) = res {
            error!("Could not write to logfile {:?} - {:#}", self.path, err);
        }
    }
}
