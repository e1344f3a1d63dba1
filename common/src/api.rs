use crate::config::Config;
use crate::errors::*;
use crate::http;
use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

pub const STATUS_FAILED: i32 = 0;
pub const STATUS_SUCCEEDED: i32 = 1;
pub const STATUS_RUNNING: i32 = 3;

pub const ACTION_SUCCESS: i32 = 1;
pub const ACTION_FAILURE: i32 = 2;

/// The control plane authenticates the backend with a fixed user name and a shared secret
pub const BACKEND_USER: &str = "user";

/// Terminal outcome of a build job, there is no partial success
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildOutcome {
    Succeeded,
    Failed,
}

impl BuildOutcome {
    pub fn code(self) -> i32 {
        match self {
            BuildOutcome::Succeeded => STATUS_SUCCEEDED,
            BuildOutcome::Failed => STATUS_FAILED,
        }
    }
}

/// Everything the control plane wants us to do right now.
///
/// Entries are kept as raw json so a single malformed task can't poison the whole batch.
#[derive(Debug, Default, Deserialize)]
pub struct Waiting {
    #[serde(default, deserialize_with = "null_as_default")]
    pub builds: Vec<Value>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub actions: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildTask {
    #[serde(deserialize_with = "string_or_number")]
    pub task_id: String,
    pub id: i64,
    pub pkgs: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub repos: String,
    pub chroot: String,
    #[serde(default)]
    pub buildroot_pkgs: Option<String>,
    #[serde(default)]
    pub memory_reqs: Option<i64>,
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub user_id: Option<i64>,
    #[serde(rename = "copr")]
    pub project: ProjectRef,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectRef {
    pub id: i64,
    pub name: String,
    pub owner: OwnerRef,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OwnerRef {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionTask {
    pub id: i64,
    pub action_type: i32,
    #[serde(default)]
    pub object_type: Option<String>,
    #[serde(default)]
    pub old_value: Option<String>,
    #[serde(default)]
    pub new_value: Option<String>,
    /// json encoded payload, its shape depends on the action type
    #[serde(default)]
    pub data: Option<String>,
    #[serde(default)]
    pub object_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BuildUpdate {
    pub id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_on: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_on: Option<i64>,
    pub status: i32,
    pub chroot: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub results: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActionUpdate {
    pub id: i64,
    pub result: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub job_ended_on: i64,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct UpdateRequest {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub builds: Vec<BuildUpdate>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<ActionUpdate>,
}

impl UpdateRequest {
    pub fn build(update: BuildUpdate) -> UpdateRequest {
        UpdateRequest {
            builds: vec![update],
            ..Default::default()
        }
    }

    pub fn action(update: ActionUpdate) -> UpdateRequest {
        UpdateRequest {
            actions: vec![update],
            ..Default::default()
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ProjectDetails {
    #[serde(default)]
    detail: ProjectDetail,
}

#[derive(Debug, Default, Deserialize)]
struct ProjectDetail {
    auto_createrepo: Option<bool>,
}

fn string_or_number<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<String, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!("expected string or number, got {}", other))),
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
    where D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// The parts of the control plane the backend talks to
#[async_trait]
pub trait FrontendApi: Send + Sync {
    /// Fetch waiting builds and pending actions
    async fn waiting(&self) -> Result<Waiting>;

    /// Push build status or action results
    async fn update(&self, update: &UpdateRequest) -> Result<()>;

    /// Whether the project wants its repository metadata regenerated after every build,
    /// `None` if the project doesn't say
    async fn auto_createrepo(&self, owner: &str, project: &str) -> Result<Option<bool>>;
}

pub struct Client {
    frontend_url: String,
    frontend_base_url: String,
    auth: String,
    client: http::Client,
}

impl Client {
    pub fn new(config: &Config) -> Result<Client> {
        debug!("setting frontend endpoint to {:?}", config.frontend_url);
        let client = http::client()?;
        Ok(Client {
            frontend_url: config.frontend_url.clone(),
            frontend_base_url: config.frontend_base_url.clone(),
            auth: config.frontend_auth.clone(),
            client,
        })
    }

    fn get(&self, url: String) -> http::RequestBuilder {
        self.client.get(url)
            .basic_auth(BACKEND_USER, Some(&self.auth))
    }

    fn post(&self, url: String) -> http::RequestBuilder {
        self.client.post(url)
            .basic_auth(BACKEND_USER, Some(&self.auth))
    }
}

#[async_trait]
impl FrontendApi for Client {
    async fn waiting(&self) -> Result<Waiting> {
        let waiting = self.get(format!("{}/waiting/", self.frontend_url))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(waiting)
    }

    async fn update(&self, update: &UpdateRequest) -> Result<()> {
        self.post(format!("{}/update/", self.frontend_url))
            .json(update)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn auto_createrepo(&self, owner: &str, project: &str) -> Result<Option<bool>> {
        let url = format!("{}/api/coprs/{}/{}/detail/", self.frontend_base_url, owner, project);
        let details = self.client.get(url)
            .send()
            .await?
            .error_for_status()?
            .json::<ProjectDetails>()
            .await?;
        Ok(details.detail.auto_createrepo)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_waiting() {
        let waiting: Waiting = serde_json::from_value(json!({
            "builds": [{"task_id": "42-fedora-30-x86_64"}],
            "actions": null,
        })).unwrap();
        assert_eq!(waiting.builds.len(), 1);
        assert!(waiting.actions.is_empty());

        let waiting: Waiting = serde_json::from_value(json!({})).unwrap();
        assert!(waiting.builds.is_empty());
    }

    #[test]
    fn test_parse_build_task() {
        let task: BuildTask = serde_json::from_value(json!({
            "task_id": 42,
            "id": 42,
            "pkgs": "http://example.com/a-1-1.src.rpm",
            "repos": null,
            "chroot": "fedora-30-x86_64",
            "buildroot_pkgs": "",
            "memory_reqs": 2048,
            "timeout": 0,
            "user_id": 3,
            "copr": {
                "id": 7,
                "name": "foo",
                "owner": {"name": "alice"},
            },
        })).unwrap();
        assert_eq!(task.task_id, "42");
        assert_eq!(task.repos, "");
        assert_eq!(task.timeout, Some(0));
        assert_eq!(task.project.owner.name, "alice");
    }

    #[test]
    fn test_serialize_build_started() {
        let update = UpdateRequest::build(BuildUpdate {
            id: 42,
            started_on: Some(1500000000),
            ended_on: None,
            status: STATUS_RUNNING,
            chroot: "fedora-30-x86_64".to_string(),
            results: Some("http://results/alice/foo/".to_string()),
        });
        let value = serde_json::to_value(&update).unwrap();
        assert_eq!(value, json!({
            "builds": [{
                "id": 42,
                "started_on": 1500000000,
                "status": 3,
                "chroot": "fedora-30-x86_64",
                "results": "http://results/alice/foo/",
            }],
        }));
    }

    #[test]
    fn test_serialize_action_result() {
        let update = UpdateRequest::action(ActionUpdate {
            id: 9,
            result: ACTION_FAILURE,
            message: Some("Destination directory already exist.".to_string()),
            job_ended_on: 1500000000,
        });
        let value = serde_json::to_value(&update).unwrap();
        assert_eq!(value, json!({
            "actions": [{
                "id": 9,
                "result": 2,
                "message": "Destination directory already exist.",
                "job_ended_on": 1500000000,
            }],
        }));
    }

    #[test]
    fn test_parse_project_details() {
        let details: ProjectDetails = serde_json::from_value(json!({
            "detail": {"auto_createrepo": false},
        })).unwrap();
        assert_eq!(details.detail.auto_createrepo, Some(false));

        let details: ProjectDetails = serde_json::from_value(json!({"detail": {}})).unwrap();
        assert_eq!(details.detail.auto_createrepo, None);
    }
}
