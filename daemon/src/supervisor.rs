use buildfarm_common::config::{self, GroupConfig, Overrides, SharedConfig};
use buildfarm_common::errors::*;
use buildfarm_common::events::{EventSender, EventSource};
use buildfarm_common::queue::{QueueBackend, TaskQueue};
use buildfarm_worker::worker::{Services, Worker};
use futures_util::FutureExt;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time;

/// Starts the task that runs a single worker
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self, group: &GroupConfig, ordinal: u64, static_addr: Option<String>) -> JoinHandle<Result<()>>;
}

/// Spawns real workers, each with its own connection to the group queue
pub struct QueueWorkerSpawner {
    config: SharedConfig,
    backend: Arc<dyn QueueBackend>,
    services: Services,
    events: EventSender,
}

impl QueueWorkerSpawner {
    pub fn new(config: SharedConfig, backend: Arc<dyn QueueBackend>, services: Services, events: EventSender) -> QueueWorkerSpawner {
        QueueWorkerSpawner {
            config,
            backend,
            services,
            events,
        }
    }
}

impl WorkerSpawner for QueueWorkerSpawner {
    fn spawn(&self, group: &GroupConfig, ordinal: u64, static_addr: Option<String>) -> JoinHandle<Result<()>> {
        let group = group.clone();
        let config = self.config.clone();
        let backend = self.backend.clone();
        let services = self.services.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let queue = backend.open(group.id).await?;
            let worker = Worker::new(group, ordinal, static_addr, config, queue, services, &events);
            worker.run().await
        })
    }
}

struct WorkerHandle {
    ordinal: u64,
    static_addr: Option<String>,
    handle: JoinHandle<Result<()>>,
}

/// Keeps the configured number of workers alive for every build group
pub struct Supervisor {
    config_path: Option<PathBuf>,
    overrides: Overrides,
    config: SharedConfig,
    queues: HashMap<u32, Arc<dyn TaskQueue>>,
    spawner: Arc<dyn WorkerSpawner>,
    events: EventSource,
    workers: HashMap<u32, Vec<WorkerHandle>>,
    /// last ordinal handed out per group, ordinals are never reused
    ordinals: HashMap<u32, u64>,
    terminating: bool,
}

impl Supervisor {
    pub fn new(
        config_path: Option<PathBuf>,
        overrides: Overrides,
        config: SharedConfig,
        queues: HashMap<u32, Arc<dyn TaskQueue>>,
        spawner: Arc<dyn WorkerSpawner>,
        events: EventSource,
    ) -> Supervisor {
        Supervisor {
            config_path,
            overrides,
            config,
            queues,
            spawner,
            events,
            workers: HashMap::new(),
            ordinals: HashMap::new(),
            terminating: false,
        }
    }

    pub fn live_workers(&self, group_id: u32) -> usize {
        self.workers.get(&group_id).map(Vec::len).unwrap_or(0)
    }

    /// Swap in a fresh config snapshot, a broken file keeps the one that's in effect
    fn reload(&self) {
        let Some(path) = &self.config_path else {
            return;
        };
        match config::load(path) {
            Ok(mut config) => {
                config.apply(self.overrides);
                self.config.replace(config);
            }
            Err(err) => {
                self.events.emit(format!("Failed to reload config, keeping previous one: {:#}", err));
            }
        }
    }

    pub async fn run(&mut self) -> Result<()> {
        while !self.terminating {
            self.cycle().await?;
            let sleeptime = self.config.snapshot().sleeptime;
            time::sleep(Duration::from_secs(sleeptime)).await;
        }
        Ok(())
    }

    pub async fn cycle(&mut self) -> Result<()> {
        self.reload();
        let config = self.config.snapshot();

        for group in &config.groups {
            let Some(queue) = self.queues.get(&group.id) else {
                self.events.emit(format!("Build group {} ({}) has no task queue, restart to enable it",
                    group.id, group.name));
                continue;
            };
            match queue.length().await {
                Ok(len) => self.events.emit(format!("# jobs in {} queue: {}", group.name, len)),
                Err(err) => self.events.emit(format!("Failed to read length of {} queue: {:#}", group.name, err)),
            }

            let workers = self.workers.entry(group.id).or_default();
            let quota = group.quota();
            if workers.len() < quota {
                self.events.emit("Spinning up more workers");
                for _ in workers.len()..quota {
                    let ordinal = self.ordinals.entry(group.id).or_insert(0);
                    *ordinal += 1;

                    let static_addr = group.static_addrs.iter()
                        .find(|addr| !workers.iter().any(|w| w.static_addr.as_ref() == Some(*addr)))
                        .cloned();
                    debug!("Starting worker {} for group {} (static_addr={:?})", ordinal, group.id, static_addr);
                    let handle = self.spawner.spawn(group, *ordinal, static_addr.clone());
                    workers.push(WorkerHandle {
                        ordinal: *ordinal,
                        static_addr,
                        handle,
                    });
                }
                self.events.emit("Finished starting worker processes");
            }

            let (dead, alive): (Vec<_>, Vec<_>) = workers.drain(..)
                .partition(|w| w.handle.is_finished());
            *workers = alive;

            for worker in dead {
                let reason = match worker.handle.now_or_never() {
                    Some(Ok(Ok(()))) => "exited".to_string(),
                    Some(Ok(Err(err))) => format!("{:#}", err),
                    Some(Err(err)) => err.to_string(),
                    None => "unknown".to_string(),
                };
                self.events.emit(format!("Worker {} died unexpectedly: {}", worker.ordinal, reason));
                if config.exit_on_worker {
                    bail!("Worker died unexpectedly, exiting");
                }
            }
        }

        Ok(())
    }

    /// Kill every worker and drop everything that is still queued
    pub async fn shutdown(&mut self) {
        self.terminating = true;

        for (group_id, workers) in self.workers.drain() {
            for worker in workers {
                debug!("Terminating worker {} of group {}", worker.ordinal, group_id);
                worker.handle.abort();
                let _ = worker.handle.await;
            }
        }

        for queue in self.queues.values() {
            match queue.purge().await {
                Ok(n) => debug!("Purged {} jobs from {:?}", n, queue.name()),
                Err(err) => self.events.emit(format!("Failed to purge {}: {:#}", queue.name(), err)),
            }
        }
    }
}
