use crate::actions::ActionProcessor;
use crate::eventlog::EventLog;
use crate::grabber::JobGrabber;
use crate::supervisor::{QueueWorkerSpawner, Supervisor};
use buildfarm_common::api;
use buildfarm_common::config::{self, Config, Overrides, SharedConfig};
use buildfarm_common::errors::*;
use buildfarm_common::events;
use buildfarm_common::queue::{QueueBackend, RedisBackend, TaskQueue};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::signal::unix::{signal, SignalKind};
use tokio::time;

pub mod actions;
pub mod eventlog;
pub mod grabber;
pub mod supervisor;

/// How long the event log gets to write out what's left during shutdown
const EVENTLOG_DRAIN_TIMEOUT: u64 = 5;

/// Connect one queue per build group, every group has to be reachable
pub async fn connect_queues(backend: &dyn QueueBackend, config: &Config) -> Result<HashMap<u32, Arc<dyn TaskQueue>>> {
    let mut queues = HashMap::new();
    for group in &config.groups {
        let queue = backend.open(group.id)
            .await
            .context("Could not connect to a task queue, is redis running?")?;
        queues.insert(group.id, queue);
    }
    Ok(queues)
}

/// Jobs left over from a previous run are never resumed
pub async fn purge_queues(queues: &HashMap<u32, Arc<dyn TaskQueue>>) -> Result<usize> {
    let mut total = 0;
    for queue in queues.values() {
        let n = queue.purge()
            .await
            .with_context(|| anyhow!("Failed to purge task queue {:?}", queue.name()))?;
        if n > 0 {
            info!("Dropped {} stale jobs from {:?}", n, queue.name());
        }
        total += n;
    }
    Ok(total)
}

async fn shutdown_signal() -> Result<()> {
    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => res?,
        _ = sigterm.recv() => (),
    }
    Ok(())
}

pub async fn run(config_path: PathBuf, overrides: Overrides) -> Result<()> {
    let mut config = config::load(&config_path)?;
    config.apply(overrides);

    let backend: Arc<dyn QueueBackend> = Arc::new(RedisBackend::new(&config.queue_url)?);
    let queues = connect_queues(backend.as_ref(), &config).await?;
    purge_queues(&queues).await?;

    let (events, rx) = events::channel();
    let eventlog = EventLog::open(config.logfile.clone(), config.verbose).await?;
    let eventlog = tokio::spawn(eventlog.run(rx));

    fs::create_dir_all(&config.worker_logdir)
        .await
        .with_context(|| anyhow!("Failed to create worker log directory {:?}", config.worker_logdir))?;

    let shared = SharedConfig::new(config.clone());
    let frontend = Arc::new(api::Client::new(&config)?);
    let services = buildfarm_worker::services(&config, frontend.clone());

    events.emit("main", "Starting up Job Grabber");
    let actions = ActionProcessor::new(shared.clone(), frontend.clone(), services.indexer.clone(), events.source("action"));
    let grabber = JobGrabber::new(shared.clone(), frontend, queues.clone(), actions, events.source("jobgrab"));
    let grabber = tokio::spawn(grabber.run());

    let spawner = Arc::new(QueueWorkerSpawner::new(shared.clone(), backend, services, events.clone()));
    let mut supervisor = Supervisor::new(Some(config_path), overrides, shared, queues, spawner, events.source("main"));

    let res = tokio::select! {
        res = supervisor.run() => res,
        res = shutdown_signal() => {
            res?;
            events.emit("main", "Received shutdown signal");
            Ok(())
        }
    };

    events.emit("main", "Shutting down");
    grabber.abort();
    let _ = grabber.await;
    supervisor.shutdown().await;

    // the event log stops once every producer is gone
    drop(supervisor);
    drop(events);
    match time::timeout(Duration::from_secs(EVENTLOG_DRAIN_TIMEOUT), eventlog).await {
        Ok(Ok(Ok(()))) => (),
        Ok(Ok(Err(err))) => error!("Event log failed: {:#}", err),
        Ok(Err(err)) => error!("Event log task failed: {:#}", err),
        Err(_) => warn!("Event log didn't finish in time"),
    }

    res
}
