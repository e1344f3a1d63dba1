use buildfarm_common::api::{ActionTask, ActionUpdate, FrontendApi, UpdateRequest, ACTION_FAILURE, ACTION_SUCCESS};
use buildfarm_common::config::SharedConfig;
use buildfarm_common::errors::*;
use buildfarm_common::events::EventSource;
use buildfarm_common::utils;
use buildfarm_worker::createrepo::RepoIndexer;
use buildfarm_worker::job::package_name;
use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;

pub const ACTION_DELETE: i32 = 0;
pub const ACTION_RENAME: i32 = 1;
pub const ACTION_LEGAL_FLAG: i32 = 2;
pub const ACTION_CREATEREPO: i32 = 3;

/// Marker a failed build leaves in its package directory
const FAIL_MARKER: &str = "fail";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildState {
    Succeeded,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    DeleteProject {
        project: String,
    },
    DeleteBuild {
        project: String,
        owner: String,
        name: String,
        pkgs: Vec<String>,
        state: BuildState,
        build_id: Option<i64>,
    },
    Rename {
        old: String,
        new: String,
    },
    LegalFlag,
    CreateRepo {
        owner: String,
        name: String,
        chroots: Vec<String>,
    },
}

#[derive(Debug, Deserialize)]
struct BuildData {
    username: String,
    projectname: String,
    #[serde(default)]
    pkgs: String,
}

#[derive(Debug, Deserialize)]
struct CreateRepoData {
    username: String,
    projectname: String,
    chroots: Vec<String>,
}

fn parse_data<'a, T: Deserialize<'a>>(task: &'a ActionTask) -> Result<T> {
    let data = task.data.as_deref()
        .ok_or_else(|| format_err!("Action {} is missing its data payload", task.id))?;
    serde_json::from_str(data)
        .with_context(|| anyhow!("Invalid data payload for action {}", task.id))
}

fn required(value: &Option<String>, field: &str) -> Result<String> {
    value.clone()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| format_err!("Action is missing {:?}", field))
}

impl Action {
    /// Returns `None` for action types this backend doesn't know about
    pub fn from_task(task: &ActionTask) -> Result<Option<Action>> {
        let action = match task.action_type {
            ACTION_DELETE => {
                let project = required(&task.old_value, "old_value")?;
                match task.object_type.as_deref() {
                    Some("copr") => Action::DeleteProject { project },
                    Some(object_type @ ("build-succeeded" | "build-skipped" | "build-failed")) => {
                        let data = parse_data::<BuildData>(task)?;
                        let state = match object_type {
                            "build-succeeded" => BuildState::Succeeded,
                            "build-skipped" => BuildState::Skipped,
                            _ => BuildState::Failed,
                        };
                        Action::DeleteBuild {
                            project,
                            owner: data.username,
                            name: data.projectname,
                            pkgs: data.pkgs.split_whitespace()
                                .map(package_name)
                                .collect(),
                            state,
                            build_id: task.object_id,
                        }
                    }
                    other => bail!("Can't delete object of type {:?}", other),
                }
            }
            ACTION_RENAME => Action::Rename {
                old: required(&task.old_value, "old_value")?,
                new: required(&task.new_value, "new_value")?,
            },
            ACTION_LEGAL_FLAG => Action::LegalFlag,
            ACTION_CREATEREPO => {
                let data = parse_data::<CreateRepoData>(task)?;
                Action::CreateRepo {
                    owner: data.username,
                    name: data.projectname,
                    chroots: data.chroots,
                }
            }
            _ => return Ok(None),
        };
        Ok(Some(action))
    }
}

fn within(root: &Path, relative: &str) -> Result<PathBuf> {
    utils::join_within(root, relative)
        .ok_or_else(|| format_err!("Path {:?} is outside of the results directory", relative))
}

fn is_plain_name(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains('/')
}

async fn exists(path: &Path) -> Result<bool> {
    match fs::metadata(path).await {
        Ok(_) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err.into()),
    }
}

/// Executes maintenance actions inline in the job grabber loop
pub struct ActionProcessor {
    config: SharedConfig,
    frontend: Arc<dyn FrontendApi>,
    indexer: Arc<dyn RepoIndexer>,
    events: EventSource,
}

impl ActionProcessor {
    pub fn new(config: SharedConfig, frontend: Arc<dyn FrontendApi>, indexer: Arc<dyn RepoIndexer>, events: EventSource) -> ActionProcessor {
        ActionProcessor {
            config,
            frontend,
            indexer,
            events,
        }
    }

    pub async fn process_raw(&self, raw: Value) -> Option<ActionUpdate> {
        match serde_json::from_value::<ActionTask>(raw) {
            Ok(task) => self.process(&task).await,
            Err(err) => {
                self.events.emit(format!("Ignoring malformed action: {:#}", err));
                None
            }
        }
    }

    /// Run the action and report its outcome, returns what was reported
    pub async fn process(&self, task: &ActionTask) -> Option<ActionUpdate> {
        let res = match Action::from_task(task) {
            Ok(Some(action)) => self.execute(action).await,
            Ok(None) => {
                self.events.emit(format!("Unknown action type {} for action {}, ignoring", task.action_type, task.id));
                return None;
            }
            Err(err) => Err(err),
        };

        let update = match res {
            Ok(()) => ActionUpdate {
                id: task.id,
                result: ACTION_SUCCESS,
                message: None,
                job_ended_on: Utc::now().timestamp(),
            },
            Err(err) => {
                self.events.emit(format!("Action {} failed: {:#}", task.id, err));
                ActionUpdate {
                    id: task.id,
                    result: ACTION_FAILURE,
                    message: Some(format!("{:#}", err)),
                    job_ended_on: Utc::now().timestamp(),
                }
            }
        };

        // best effort, the control plane offers unreported actions again
        if let Err(err) = self.frontend.update(&UpdateRequest::action(update.clone())).await {
            self.events.emit(format!("Failed to report result of action {}: {:#}", task.id, err));
        }
        Some(update)
    }

    pub async fn execute(&self, action: Action) -> Result<()> {
        let destdir = self.config.snapshot().destdir.clone();
        match action {
            Action::DeleteProject { project } => self.delete_project(&destdir, &project).await,
            Action::DeleteBuild { project, owner, name, pkgs, state, build_id } => {
                self.delete_build(&destdir, &project, &owner, &name, &pkgs, state, build_id).await
            }
            Action::Rename { old, new } => self.rename(&destdir, &old, &new).await,
            Action::LegalFlag => {
                self.events.emit("Action legal-flag: ignoring");
                Ok(())
            }
            Action::CreateRepo { owner, name, chroots } => self.createrepo(&destdir, &owner, &name, &chroots).await,
        }
    }

    async fn delete_project(&self, destdir: &Path, project: &str) -> Result<()> {
        self.events.emit("Action delete project");
        let path = within(destdir, project)?;
        if exists(&path).await? {
            self.events.emit(format!("Removing project {:?}", path));
            fs::remove_dir_all(&path)
                .await
                .with_context(|| anyhow!("Failed to remove {:?}", path))?;
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn delete_build(
        &self,
        destdir: &Path,
        project: &str,
        owner: &str,
        name: &str,
        pkgs: &[String],
        state: BuildState,
        build_id: Option<i64>,
    ) -> Result<()> {
        self.events.emit("Action delete build");
        let path = within(destdir, project)?;
        self.events.emit(format!("Packages to delete {}", pkgs.join(" ")));

        let mut entries = match fs::read_dir(&path).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err).with_context(|| anyhow!("Failed to list {:?}", path)),
        };

        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let chroot_path = entry.path();
            let chroot = entry.file_name().to_string_lossy().into_owned();

            let mut altered = false;
            for pkg in pkgs.iter().filter(|pkg| is_plain_name(pkg)) {
                let pkg_path = chroot_path.join(pkg);
                // a failed build only owns the directory if it left its marker behind,
                // otherwise it could belong to a later successful rebuild
                if state == BuildState::Failed && !exists(&pkg_path.join(FAIL_MARKER)).await? {
                    continue;
                }

                if fs::metadata(&pkg_path).await.map(|m| m.is_dir()).unwrap_or(false) {
                    self.events.emit(format!("Removing build {:?}", pkg_path));
                    fs::remove_dir_all(&pkg_path)
                        .await
                        .with_context(|| anyhow!("Failed to remove {:?}", pkg_path))?;
                    altered = true;
                } else {
                    self.events.emit(format!("Package {} dir not found in chroot {}", pkg, chroot));
                }
            }

            if altered {
                self.events.emit("Running createrepo");
                if let Err(err) = self.indexer.regenerate_conditional(owner, name, &chroot, &chroot_path).await {
                    self.events.emit(format!("Error making local repo: {:#}", err));
                }
            }

            if let Some(build_id) = build_id {
                let log_path = chroot_path.join(format!("build-{}.log", build_id));
                match fs::remove_file(&log_path).await {
                    Ok(()) => self.events.emit(format!("Removed log {:?}", log_path)),
                    Err(err) if err.kind() == io::ErrorKind::NotFound => (),
                    Err(err) => return Err(err).with_context(|| anyhow!("Failed to remove {:?}", log_path)),
                }
            }
        }

        Ok(())
    }

    async fn rename(&self, destdir: &Path, old: &str, new: &str) -> Result<()> {
        self.events.emit("Action rename");
        let old_path = within(destdir, old)?;
        let new_path = within(destdir, new)?;

        if !exists(&old_path).await? {
            return Ok(());
        }
        if exists(&new_path).await? {
            bail!("Destination directory already exist.");
        }
        if let Some(parent) = new_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::rename(&old_path, &new_path)
            .await
            .with_context(|| anyhow!("Failed to move {:?} to {:?}", old_path, new_path))?;
        Ok(())
    }

    async fn createrepo(&self, destdir: &Path, owner: &str, name: &str, chroots: &[String]) -> Result<()> {
        self.events.emit("Action create repo");
        let mut failed = Vec::new();
        for chroot in chroots {
            self.events.emit(format!("Creating repo for: {}/{}/{}", owner, name, chroot));
            let res = match within(destdir, &format!("{}/{}/{}", owner, name, chroot)) {
                Ok(path) => self.indexer.regenerate(&path).await,
                Err(err) => Err(err),
            };
            if let Err(err) = res {
                self.events.emit(format!("Error making local repo: {:#}", err));
                failed.push(chroot.as_str());
            }
        }

        if !failed.is_empty() {
            bail!("Failed to regenerate repository for {}", failed.join(", "));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use buildfarm_common::api::Waiting;
    use buildfarm_common::config;
    use buildfarm_common::events;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeFrontend {
        updates: Mutex<Vec<ActionUpdate>>,
    }

    #[async_trait]
    impl FrontendApi for FakeFrontend {
        async fn waiting(&self) -> Result<Waiting> {
            Ok(Waiting::default())
        }

        async fn update(&self, update: &UpdateRequest) -> Result<()> {
            self.updates.lock().unwrap().extend(update.actions.iter().cloned());
            Ok(())
        }

        async fn auto_createrepo(&self, _owner: &str, _project: &str) -> Result<Option<bool>> {
            Ok(None)
        }
    }

    #[derive(Default)]
    struct FakeIndexer {
        unconditional: Mutex<Vec<PathBuf>>,
        conditional: Mutex<Vec<PathBuf>>,
    }

    #[async_trait]
    impl RepoIndexer for FakeIndexer {
        async fn regenerate(&self, path: &Path) -> Result<()> {
            if !path.is_dir() {
                bail!("{:?} does not exist", path);
            }
            self.unconditional.lock().unwrap().push(path.to_path_buf());
            Ok(())
        }

        async fn regenerate_conditional(&self, _owner: &str, _project: &str, _chroot: &str, path: &Path) -> Result<()> {
            self.conditional.lock().unwrap().push(path.to_path_buf());
            Ok(())
        }
    }

    struct Harness {
        dir: tempfile::TempDir,
        frontend: Arc<FakeFrontend>,
        indexer: Arc<FakeIndexer>,
        processor: ActionProcessor,
    }

    impl Harness {
        fn results(&self) -> PathBuf {
            self.dir.path().join("results")
        }

        fn mkdir(&self, path: &str) {
            std::fs::create_dir_all(self.results().join(path)).unwrap();
        }

        fn touch(&self, path: &str) {
            std::fs::write(self.results().join(path), path).unwrap();
        }

        async fn run(&self, task: Value) -> Option<ActionUpdate> {
            self.processor.process_raw(task).await
        }
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let config = config::from_str(&format!(r#"
        [backend]
        destdir = "{}/results"
        "#, dir.path().display())).unwrap();
        let frontend = Arc::new(FakeFrontend::default());
        let indexer = Arc::new(FakeIndexer::default());
        let (events, _rx) = events::channel();
        let processor = ActionProcessor::new(SharedConfig::new(config), frontend.clone(), indexer.clone(), events.source("action"));
        Harness {
            dir,
            frontend,
            indexer,
            processor,
        }
    }

    fn delete_build(object_type: &str) -> Value {
        json!({
            "id": 5,
            "action_type": ACTION_DELETE,
            "object_type": object_type,
            "old_value": "alice/foo",
            "object_id": 42,
            "data": json!({
                "username": "alice",
                "projectname": "foo",
                "pkgs": "http://example.com/a-1-1.src.rpm",
            }).to_string(),
        })
    }

    #[tokio::test]
    async fn test_delete_project_is_idempotent() {
        let h = harness();
        h.mkdir("alice/foo/fedora-30-x86_64/a-1-1");
        let task = json!({"id": 1, "action_type": ACTION_DELETE, "object_type": "copr", "old_value": "alice/foo"});

        let update = h.run(task.clone()).await.unwrap();
        assert_eq!(update.result, ACTION_SUCCESS);
        assert!(!h.results().join("alice/foo").exists());
        assert!(h.results().join("alice").exists());

        let update = h.run(task).await.unwrap();
        assert_eq!(update.result, ACTION_SUCCESS);
        assert_eq!(h.frontend.updates.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_delete_failed_build_requires_marker() {
        let h = harness();
        h.mkdir("alice/foo/fedora-30-x86_64/a-1-1");
        h.touch("alice/foo/fedora-30-x86_64/a-1-1/fail");
        h.touch("alice/foo/fedora-30-x86_64/build-42.log");
        // same package rebuilt successfully later, no marker
        h.mkdir("alice/foo/fedora-31-x86_64/a-1-1");
        h.touch("alice/foo/fedora-31-x86_64/build-42.log");

        let update = h.run(delete_build("build-failed")).await.unwrap();
        assert_eq!(update.result, ACTION_SUCCESS);

        assert!(!h.results().join("alice/foo/fedora-30-x86_64/a-1-1").exists());
        assert!(h.results().join("alice/foo/fedora-31-x86_64/a-1-1").exists());
        assert!(!h.results().join("alice/foo/fedora-30-x86_64/build-42.log").exists());
        assert!(!h.results().join("alice/foo/fedora-31-x86_64/build-42.log").exists());
        assert_eq!(*h.indexer.conditional.lock().unwrap(), vec![h.results().join("alice/foo/fedora-30-x86_64")]);
    }

    #[tokio::test]
    async fn test_delete_succeeded_build() {
        let h = harness();
        h.mkdir("alice/foo/fedora-30-x86_64/a-1-1");
        h.mkdir("alice/foo/fedora-30-x86_64/b-1-1");
        h.mkdir("alice/foo/fedora-31-x86_64/a-1-1");

        let update = h.run(delete_build("build-succeeded")).await.unwrap();
        assert_eq!(update.result, ACTION_SUCCESS);
        assert!(!h.results().join("alice/foo/fedora-30-x86_64/a-1-1").exists());
        assert!(!h.results().join("alice/foo/fedora-31-x86_64/a-1-1").exists());
        assert!(h.results().join("alice/foo/fedora-30-x86_64/b-1-1").exists());
        assert_eq!(h.indexer.conditional.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_delete_build_of_missing_project() {
        let h = harness();
        let update = h.run(delete_build("build-skipped")).await.unwrap();
        assert_eq!(update.result, ACTION_SUCCESS);
        assert!(h.indexer.conditional.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rename_onto_existing_destination() {
        let h = harness();
        h.mkdir("alice/foo/fedora-30-x86_64");
        h.touch("alice/foo/fedora-30-x86_64/build-1.log");
        h.mkdir("alice/bar");

        let update = h.run(json!({"id": 2, "action_type": ACTION_RENAME, "old_value": "alice/foo", "new_value": "alice/bar"}))
            .await
            .unwrap();
        assert_eq!(update.result, ACTION_FAILURE);
        assert_eq!(update.message.as_deref(), Some("Destination directory already exist."));
        let content = std::fs::read_to_string(h.results().join("alice/foo/fedora-30-x86_64/build-1.log")).unwrap();
        assert_eq!(content, "alice/foo/fedora-30-x86_64/build-1.log");
    }

    #[tokio::test]
    async fn test_rename() {
        let h = harness();
        h.mkdir("alice/foo/fedora-30-x86_64");

        let update = h.run(json!({"id": 2, "action_type": ACTION_RENAME, "old_value": "alice/foo", "new_value": "bob/foo"}))
            .await
            .unwrap();
        assert_eq!(update.result, ACTION_SUCCESS);
        assert!(!h.results().join("alice/foo").exists());
        assert!(h.results().join("bob/foo/fedora-30-x86_64").is_dir());

        // source is gone now, nothing to do
        let update = h.run(json!({"id": 3, "action_type": ACTION_RENAME, "old_value": "alice/foo", "new_value": "carol/foo"}))
            .await
            .unwrap();
        assert_eq!(update.result, ACTION_SUCCESS);
        assert!(!h.results().join("carol").exists());
    }

    #[tokio::test]
    async fn test_reject_escaping_paths() {
        let h = harness();
        let update = h.run(json!({"id": 4, "action_type": ACTION_DELETE, "object_type": "copr", "old_value": "../.."}))
            .await
            .unwrap();
        assert_eq!(update.result, ACTION_FAILURE);
        assert!(update.message.unwrap().contains("outside of the results directory"));
        assert!(h.dir.path().exists());
    }

    #[tokio::test]
    async fn test_createrepo() {
        let h = harness();
        h.mkdir("alice/foo/fedora-30-x86_64");
        h.mkdir("alice/foo/epel-7-x86_64");
        let task = json!({
            "id": 6,
            "action_type": ACTION_CREATEREPO,
            "data": json!({
                "username": "alice",
                "projectname": "foo",
                "chroots": ["fedora-30-x86_64", "epel-7-x86_64"],
            }).to_string(),
        });

        let update = h.run(task).await.unwrap();
        assert_eq!(update.result, ACTION_SUCCESS);
        assert_eq!(h.indexer.unconditional.lock().unwrap().len(), 2);

        let task = json!({
            "id": 7,
            "action_type": ACTION_CREATEREPO,
            "data": json!({
                "username": "alice",
                "projectname": "foo",
                "chroots": ["fedora-30-x86_64", "fedora-rawhide-x86_64"],
            }).to_string(),
        });
        let update = h.run(task).await.unwrap();
        assert_eq!(update.result, ACTION_FAILURE);
        assert!(update.message.unwrap().contains("fedora-rawhide-x86_64"));
    }

    #[tokio::test]
    async fn test_legal_flag_and_unknown_actions() {
        let h = harness();
        let update = h.run(json!({"id": 8, "action_type": ACTION_LEGAL_FLAG})).await.unwrap();
        assert_eq!(update.result, ACTION_SUCCESS);

        assert!(h.run(json!({"id": 9, "action_type": 42})).await.is_none());
        assert!(h.run(json!({"action_type": "bogus"})).await.is_none());
        assert_eq!(h.frontend.updates.lock().unwrap().len(), 1);
    }
}
