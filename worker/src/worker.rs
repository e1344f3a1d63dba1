use crate::build::{self, RemoteBuilder};
use crate::createrepo::RepoIndexer;
use crate::job::Job;
use crate::provision::{self, Provisioner};
use crate::report;
use crate::worklog::WorkerLog;
use buildfarm_common::api::{BuildOutcome, FrontendApi, UpdateRequest};
use buildfarm_common::config::{Config, GroupConfig, SharedConfig, FRONTEND_RETRIES, FRONTEND_RETRY_DELAY, SPAWN_ATTEMPTS};
use buildfarm_common::errors::*;
use buildfarm_common::events::{EventSender, EventSource};
use buildfarm_common::queue::TaskQueue;
use buildfarm_common::utils;
use chrono::Utc;
use futures_util::FutureExt;
use std::any::Any;
use std::io;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::time;

pub fn worker_name(group_id: u32, ordinal: u64) -> String {
    format!("worker-{}-{}", group_id, ordinal)
}

/// External collaborators a worker drives, shared by all workers of the dispatcher
#[derive(Clone)]
pub struct Services {
    pub frontend: Arc<dyn FrontendApi>,
    pub provisioner: Arc<dyn Provisioner>,
    pub builder: Arc<dyn RemoteBuilder>,
    pub indexer: Arc<dyn RepoIndexer>,
}

pub struct Worker {
    group: GroupConfig,
    static_addr: Option<String>,
    config: SharedConfig,
    queue: Arc<dyn TaskQueue>,
    services: Services,
    events: EventSource,
    log: WorkerLog,
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        msg
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg
    } else {
        "unknown panic"
    }
}

async fn save_descriptor(path: &Path, descriptor: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    fs::write(path, descriptor).await?;
    Ok(())
}

impl Worker {
    pub fn new(
        group: GroupConfig,
        ordinal: u64,
        static_addr: Option<String>,
        config: SharedConfig,
        queue: Arc<dyn TaskQueue>,
        services: Services,
        events: &EventSender,
    ) -> Worker {
        let log = WorkerLog::new(&config.snapshot().worker_logdir, group.id, ordinal);
        Worker {
            events: events.source(worker_name(group.id, ordinal)),
            group,
            static_addr,
            config,
            queue,
            services,
            log,
        }
    }

    pub fn name(&self) -> &str {
        self.events.who()
    }

    /// Serve jobs from the group queue until something unexpected happens
    pub async fn run(self) -> Result<()> {
        match &self.static_addr {
            Some(addr) => self.events.emit(format!("creating worker: static ip {}", addr)),
            None => self.events.emit("creating worker: dynamic ip"),
        }
        if let Some(logdir) = self.log.path().and_then(Path::parent) {
            if let Err(err) = fs::create_dir_all(logdir).await {
                warn!("Failed to create worker log directory {:?}: {:#}", logdir, err);
            }
        }

        loop {
            self.run_once().await?;
        }
    }

    /// Claim one job from the queue and drive it to completion
    pub async fn run_once(&self) -> Result<()> {
        let descriptor = self.queue.dequeue()
            .await
            .with_context(|| anyhow!("Failed to read from task queue {:?}", self.queue.name()))?;
        let config = self.config.snapshot();

        let job = match Job::parse(&descriptor, &config) {
            Ok(job) => job,
            Err(err) => {
                self.events.emit(format!("Discarding malformed job descriptor: {:#}", err));
                self.log.log(format!("malformed job descriptor: {:?}", descriptor)).await;
                time::sleep(Duration::from_secs(config.sleeptime)).await;
                return Ok(());
            }
        };

        self.process(&config, job, &descriptor).await?;
        Ok(())
    }

    /// Provision, build, report and tear down for a single job.
    ///
    /// Teardown runs whenever an instance was provisioned, also if reporting failed.
    pub async fn process(&self, config: &Config, mut job: Job, descriptor: &str) -> Result<BuildOutcome> {
        let group = config.group(self.group.id).unwrap_or(&self.group);
        self.events.emit(format!("got job {} for {}", job.task_id, job.chroot));

        let descriptor_path = job.descriptor_path(&config.jobsdir);
        if let Err(err) = save_descriptor(&descriptor_path, descriptor).await {
            self.events.emit(format!("Failed to write job descriptor {:?}: {:#}", descriptor_path, err));
        }

        let addr = match &self.static_addr {
            Some(addr) => Some(addr.clone()),
            None => {
                let delay = Duration::from_secs(config.sleeptime);
                match provision::provision(self.services.provisioner.as_ref(), group, SPAWN_ATTEMPTS, delay, &self.log).await {
                    Ok(addr) => Some(addr),
                    Err(err) => {
                        self.events.emit(format!("job {}: {}", job.task_id, err));
                        None
                    }
                }
            }
        };

        // a panic while building must not skip the teardown below
        let task_id = job.task_id.clone();
        let res = AssertUnwindSafe(self.execute(&mut job, addr.as_deref(), &descriptor_path))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(anyhow!("job {} panicked: {}", task_id, panic_message(&*panic))));

        if let (Some(addr), None) = (&addr, &self.static_addr) {
            self.log.log(format!("terminating instance {}", addr)).await;
            if let Err(err) = self.services.provisioner.terminate(group, addr).await {
                self.events.emit(format!("Failed to terminate instance {}: {:#}", addr, err));
            }
        }

        res
    }

    async fn report(&self, update: UpdateRequest) -> Result<()> {
        report::post_with_retry(
            self.services.frontend.as_ref(),
            &update,
            FRONTEND_RETRIES,
            Duration::from_secs(FRONTEND_RETRY_DELAY),
            &self.log,
        ).await
    }

    async fn execute(&self, job: &mut Job, addr: Option<&str>, descriptor_path: &Path) -> Result<BuildOutcome> {
        job.started_on = Some(Utc::now().timestamp());
        self.report(UpdateRequest::build(job.started_update()))
            .await
            .with_context(|| anyhow!("Failed to report job {} as started", job.task_id))?;

        let outcome = match addr {
            Some(addr) => {
                self.events.emit(format!("job {} building on {}", job.task_id, addr));
                self.build(job, addr).await
            }
            None => BuildOutcome::Failed,
        };

        job.status = Some(outcome);
        job.ended_on = Some(Utc::now().timestamp());
        self.report(UpdateRequest::build(job.finished_update()))
            .await
            .with_context(|| anyhow!("Failed to report job {} as finished", job.task_id))?;

        match fs::remove_file(descriptor_path).await {
            Ok(()) => (),
            Err(err) if err.kind() == io::ErrorKind::NotFound => (),
            Err(err) => self.events.emit(format!("Failed to remove job descriptor {:?}: {:#}", descriptor_path, err)),
        }

        let duration = job.ended_on.unwrap_or_default() - job.started_on.unwrap_or_default();
        self.events.emit(format!("job {} finished: {:?} after {}", job.task_id, outcome, utils::secs_to_human(duration)));
        Ok(outcome)
    }

    async fn build(&self, job: &Job, addr: &str) -> BuildOutcome {
        let mut outcome = BuildOutcome::Succeeded;

        let chroot_dir = job.chroot_dir();
        if let Err(err) = fs::create_dir_all(&chroot_dir).await {
            self.events.emit(format!("Failed to create results directory {:?}: {:#}", chroot_dir, err));
            return BuildOutcome::Failed;
        }

        match self.services.builder.build(addr, job).await {
            Ok(outcomes) => {
                if !build::all_succeeded(&outcomes) {
                    self.events.emit(format!("job {}: some packages failed", job.task_id));
                    outcome = BuildOutcome::Failed;
                }
                if build::any_succeeded(&outcomes) {
                    if let Err(err) = self.services.indexer
                        .regenerate_conditional(&job.owner, &job.project, &job.chroot, &chroot_dir)
                        .await
                    {
                        self.events.emit(format!("Failed to regenerate repository {:?}: {:#}", chroot_dir, err));
                    }
                }
            }
            Err(err) => {
                self.events.emit(format!("job {}: build failed: {:#}", job.task_id, err));
                outcome = BuildOutcome::Failed;
            }
        }

        outcome
    }
}
