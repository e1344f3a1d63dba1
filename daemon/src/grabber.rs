use crate::actions::ActionProcessor;
use buildfarm_common::api::FrontendApi;
use buildfarm_common::config::{Config, SharedConfig};
use buildfarm_common::errors::*;
use buildfarm_common::events::EventSource;
use buildfarm_common::queue::TaskQueue;
use buildfarm_common::utils;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PollStats {
    pub builds: usize,
    pub queued: usize,
    pub dropped: usize,
    pub actions: usize,
}

/// Polls the control plane, routes builds into group queues and runs actions inline
pub struct JobGrabber {
    config: SharedConfig,
    frontend: Arc<dyn FrontendApi>,
    queues: HashMap<u32, Arc<dyn TaskQueue>>,
    actions: ActionProcessor,
    events: EventSource,
    /// task ids handed out during the lifetime of this process
    seen: HashSet<String>,
    dropped_total: u64,
}

fn task_id(task: &Value) -> Option<String> {
    match task.get("task_id")? {
        Value::String(id) => Some(id.clone()),
        Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}

impl JobGrabber {
    pub fn new(
        config: SharedConfig,
        frontend: Arc<dyn FrontendApi>,
        queues: HashMap<u32, Arc<dyn TaskQueue>>,
        actions: ActionProcessor,
        events: EventSource,
    ) -> JobGrabber {
        JobGrabber {
            config,
            frontend,
            queues,
            actions,
            events,
            seen: HashSet::new(),
            dropped_total: 0,
        }
    }

    pub async fn run(mut self) -> Result<()> {
        loop {
            self.poll_once().await;
            let sleeptime = self.config.snapshot().sleeptime;
            time::sleep(Duration::from_secs(sleeptime)).await;
        }
    }

    pub async fn poll_once(&mut self) -> PollStats {
        let config = self.config.snapshot();
        let mut stats = PollStats::default();

        let waiting = match self.frontend.waiting().await {
            Ok(waiting) => waiting,
            Err(err) => {
                self.events.emit(format!("Error retrieving jobs from {}: {:#}", config.frontend_url, err));
                return stats;
            }
        };

        if !waiting.builds.is_empty() {
            stats.builds = waiting.builds.len();
            self.events.emit(format!("{} jobs returned", waiting.builds.len()));
            for task in waiting.builds {
                self.route(&config, task, &mut stats).await;
            }
            if stats.queued > 0 {
                self.events.emit(format!("New jobs: {}", stats.queued));
            }
        }

        if !waiting.actions.is_empty() {
            stats.actions = waiting.actions.len();
            self.events.emit(format!("{} actions returned", waiting.actions.len()));
            for action in waiting.actions {
                self.actions.process_raw(action).await;
            }
        }

        stats
    }

    async fn route(&mut self, config: &Config, task: Value, stats: &mut PollStats) {
        let Some(id) = task_id(&task) else {
            self.events.emit("Ignoring build task without task_id");
            return;
        };
        if self.seen.contains(&id) {
            trace!("Task {:?} was already queued", id);
            return;
        }

        let chroot = task.get("chroot").and_then(Value::as_str).unwrap_or_default();
        let group = utils::chroot_arch(chroot)
            .and_then(|arch| config.group_for_arch(arch));
        let Some(group) = group else {
            self.seen.insert(id.clone());
            self.dropped_total += 1;
            stats.dropped += 1;
            warn!("No build group for task {:?} (chroot {:?}), dropped {} tasks so far", id, chroot, self.dropped_total);
            self.events.emit(format!("Dropping task {} with unsupported chroot {:?} ({} dropped in total)",
                id, chroot, self.dropped_total));
            return;
        };

        let Some(queue) = self.queues.get(&group.id) else {
            self.events.emit(format!("No queue for build group {} ({}), task {} stays pending until restart",
                group.id, group.name, id));
            return;
        };

        match queue.enqueue(&task.to_string()).await {
            Ok(()) => {
                debug!("Queued task {:?} into {:?}", id, queue.name());
                self.seen.insert(id);
                stats.queued += 1;
            }
            Err(err) => {
                self.events.emit(format!("Failed to queue task {}: {:#}", id, err));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use buildfarm_common::api::{UpdateRequest, Waiting};
    use buildfarm_common::config;
    use buildfarm_common::events;
    use buildfarm_common::queue::MemoryQueue;
    use buildfarm_worker::createrepo::RepoIndexer;
    use serde_json::json;
    use std::path::Path;
    use std::sync::Mutex;

    struct FakeFrontend {
        waiting: Mutex<Option<Value>>,
        updates: Mutex<Vec<UpdateRequest>>,
    }

    #[async_trait]
    impl FrontendApi for FakeFrontend {
        async fn waiting(&self) -> Result<Waiting> {
            let value = self.waiting.lock().unwrap().clone()
                .ok_or_else(|| anyhow!("connection refused"))?;
            Ok(serde_json::from_value(value)?)
        }

        async fn update(&self, update: &UpdateRequest) -> Result<()> {
            self.updates.lock().unwrap().push(update.clone());
            Ok(())
        }

        async fn auto_createrepo(&self, _owner: &str, _project: &str) -> Result<Option<bool>> {
            Ok(None)
        }
    }

    struct NoopIndexer;

    #[async_trait]
    impl RepoIndexer for NoopIndexer {
        async fn regenerate(&self, _path: &Path) -> Result<()> {
            Ok(())
        }

        async fn regenerate_conditional(&self, _owner: &str, _project: &str, _chroot: &str, _path: &Path) -> Result<()> {
            Ok(())
        }
    }

    fn build(task_id: &str, chroot: &str) -> Value {
        json!({
            "task_id": task_id,
            "id": 42,
            "pkgs": "http://example.com/a-1-1.src.rpm",
            "chroot": chroot,
            "timeout": 0,
            "copr": {"id": 7, "name": "foo", "owner": {"name": "alice"}},
        })
    }

    fn setup(waiting: Option<Value>) -> (JobGrabber, Arc<FakeFrontend>, Arc<MemoryQueue>, Arc<MemoryQueue>) {
        let config = config::from_str(r#"
        [backend]
        destdir = "/srv/results"

        [[group]]
        id = 0
        name = "PC"
        archs = ["i386", "x86_64"]

        [[group]]
        id = 1
        name = "ARM"
        archs = ["armhfp", "x86_64"]
        "#).unwrap();
        let shared = SharedConfig::new(config);
        let frontend = Arc::new(FakeFrontend {
            waiting: Mutex::new(waiting),
            updates: Mutex::new(Vec::new()),
        });
        let pc = Arc::new(MemoryQueue::new("buildfarm-group-0"));
        let arm = Arc::new(MemoryQueue::new("buildfarm-group-1"));
        let mut queues = HashMap::<u32, Arc<dyn TaskQueue>>::new();
        queues.insert(0, pc.clone());
        queues.insert(1, arm.clone());

        let (events, _rx) = events::channel();
        let actions = ActionProcessor::new(shared.clone(), frontend.clone(), Arc::new(NoopIndexer), events.source("action"));
        let grabber = JobGrabber::new(shared, frontend.clone(), queues, actions, events.source("jobgrab"));
        (grabber, frontend, pc, arm)
    }

    #[tokio::test]
    async fn test_route_by_arch_first_match() {
        let (mut grabber, _, pc, arm) = setup(Some(json!({
            "builds": [
                build("42-fedora-30-x86_64", "fedora-30-x86_64"),
                build("43-fedora-30-armhfp", "fedora-30-armhfp"),
                build("44-fedora-30-i386", "fedora-30-i386"),
            ],
        })));

        let stats = grabber.poll_once().await;
        assert_eq!(stats.queued, 3);
        assert_eq!(pc.length().await.unwrap(), 2);
        assert_eq!(arm.length().await.unwrap(), 1);

        let first: Value = serde_json::from_str(&pc.snapshot()[0]).unwrap();
        assert_eq!(first["task_id"], "42-fedora-30-x86_64");
        assert_eq!(first["timeout"], 0);
    }

    #[tokio::test]
    async fn test_dedup_across_polls() {
        let (mut grabber, _, pc, _) = setup(Some(json!({
            "builds": [
                build("42-fedora-30-x86_64", "fedora-30-x86_64"),
                build("42-fedora-30-x86_64", "fedora-30-x86_64"),
            ],
        })));

        assert_eq!(grabber.poll_once().await.queued, 1);
        assert_eq!(grabber.poll_once().await.queued, 0);
        assert_eq!(pc.length().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_unroutable_tasks_are_counted() {
        let (mut grabber, _, pc, arm) = setup(Some(json!({
            "builds": [
                build("45-fedora-30-s390x", "fedora-30-s390x"),
                build("46-broken", "broken"),
                {"chroot": "fedora-30-x86_64"},
            ],
        })));

        let stats = grabber.poll_once().await;
        assert_eq!(stats.dropped, 2);
        assert_eq!(stats.queued, 0);
        assert_eq!(grabber.dropped_total, 2);

        // already counted, not reported twice
        assert_eq!(grabber.poll_once().await.dropped, 0);
        assert_eq!(pc.length().await.unwrap() + arm.length().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_poll_failure_skips_cycle() {
        let (mut grabber, _, pc, _) = setup(None);
        assert_eq!(grabber.poll_once().await, PollStats::default());
        assert_eq!(pc.length().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_actions_run_inline() {
        let (mut grabber, frontend, _, _) = setup(Some(json!({
            "actions": [
                {"id": 1, "action_type": 2},
                {"id": 2, "action_type": 0, "object_type": "copr", "old_value": "alice/gone"},
            ],
        })));

        let stats = grabber.poll_once().await;
        assert_eq!(stats.actions, 2);
        let updates = frontend.updates.lock().unwrap();
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[1].actions[0].id, 2);
    }
}
