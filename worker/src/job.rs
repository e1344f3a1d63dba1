use buildfarm_common::api::{BuildOutcome, BuildTask, BuildUpdate, STATUS_RUNNING};
use buildfarm_common::config::Config;
use buildfarm_common::errors::*;
use buildfarm_common::utils;
use std::path::{Path, PathBuf};

/// One package build, owned by the worker that claimed it
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub task_id: String,
    pub build_id: i64,
    pub pkgs: Vec<String>,
    pub repos: Vec<String>,
    pub chroot: String,
    pub arch: String,
    pub buildroot_pkgs: Vec<String>,
    pub memory_reqs: Option<i64>,
    /// seconds, already resolved against the configured default
    pub timeout: u64,
    pub owner: String,
    pub project: String,
    pub project_id: i64,
    pub user_id: Option<i64>,
    /// `<destdir>/<owner>/<project>`
    pub destdir: PathBuf,
    /// `<results_baseurl>/<owner>/<project>/`
    pub results: String,
    pub vendor: String,
    pub started_on: Option<i64>,
    pub ended_on: Option<i64>,
    pub status: Option<BuildOutcome>,
}

fn split_list(s: &str) -> Vec<String> {
    s.split_whitespace()
        .map(String::from)
        .collect()
}

/// `http://example.com/foo-1.0-1.src.rpm` -> `foo-1.0-1`
pub fn package_name(pkg: &str) -> String {
    let pkg = pkg.trim_end_matches('/');
    let basename = pkg.rsplit('/').next().unwrap_or(pkg);
    basename.strip_suffix(".src.rpm")
        .unwrap_or(basename)
        .to_string()
}

impl Job {
    pub fn parse(descriptor: &str, config: &Config) -> Result<Job> {
        let task = serde_json::from_str::<BuildTask>(descriptor)
            .context("Failed to deserialize job descriptor")?;
        Job::from_task(task, config)
    }

    pub fn from_task(task: BuildTask, config: &Config) -> Result<Job> {
        let arch = utils::chroot_arch(&task.chroot)
            .ok_or_else(|| format_err!("Invalid chroot: {:?}", task.chroot))?
            .to_string();

        let owner = task.project.owner.name;
        let project = task.project.name;
        if owner.is_empty() || project.is_empty() || owner.contains('/') || project.contains('/') {
            bail!("Invalid project coordinates: {:?}/{:?}", owner, project);
        }
        let destdir = utils::join_within(&config.destdir, &format!("{}/{}", owner, project))
            .ok_or_else(|| format_err!("Project {:?}/{:?} escapes the results directory", owner, project))?;
        utils::join_within(&destdir, &task.chroot)
            .filter(|dir| dir.parent() == Some(destdir.as_path()))
            .ok_or_else(|| format_err!("Invalid chroot: {:?}", task.chroot))?;

        let pkgs = split_list(&task.pkgs);
        if pkgs.is_empty() {
            bail!("Job {:?} has no packages", task.task_id);
        }

        let timeout = match task.timeout {
            Some(0) | None => config.build.timeout,
            Some(timeout) => timeout,
        };

        Ok(Job {
            task_id: task.task_id,
            build_id: task.id,
            pkgs,
            repos: split_list(&task.repos),
            chroot: task.chroot,
            arch,
            buildroot_pkgs: task.buildroot_pkgs.as_deref()
                .map(split_list)
                .unwrap_or_default(),
            memory_reqs: task.memory_reqs,
            timeout,
            results: format!("{}/{}/{}/", config.results_baseurl, owner, project),
            owner,
            project,
            project_id: task.project.id,
            user_id: task.user_id,
            destdir,
            vendor: config.vendor.clone(),
            started_on: None,
            ended_on: None,
            status: None,
        })
    }

    pub fn chroot_dir(&self) -> PathBuf {
        self.destdir.join(&self.chroot)
    }

    pub fn log_file(&self) -> PathBuf {
        self.chroot_dir().join(format!("build-{}.log", self.build_id))
    }

    /// Location of the claimed descriptor inside the jobs directory
    pub fn descriptor_path(&self, jobsdir: &Path) -> PathBuf {
        jobsdir.join(format!("{}.json", utils::sanitize_filename(&self.task_id)))
    }

    /// Extra repositories plus this chroot's own results, so later packages can use earlier ones
    pub fn effective_repos(&self) -> Vec<String> {
        let mut repos = self.repos.clone();
        repos.push(format!("{}{}", self.results, self.chroot));
        repos
    }

    pub fn macros(&self) -> Vec<(String, String)> {
        vec![
            ("buildfarm_owner".to_string(), self.owner.clone()),
            ("buildfarm_project".to_string(), self.project.clone()),
            ("vendor".to_string(), format!("{} ({}/{})", self.vendor, self.owner, self.project)),
        ]
    }

    pub fn started_update(&self) -> BuildUpdate {
        BuildUpdate {
            id: self.build_id,
            started_on: self.started_on,
            ended_on: None,
            status: STATUS_RUNNING,
            chroot: self.chroot.clone(),
            results: Some(self.results.clone()),
        }
    }

    pub fn finished_update(&self) -> BuildUpdate {
        let status = self.status.unwrap_or(BuildOutcome::Failed);
        BuildUpdate {
            id: self.build_id,
            started_on: None,
            ended_on: self.ended_on,
            status: status.code(),
            chroot: self.chroot.clone(),
            results: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use buildfarm_common::api::{STATUS_FAILED, STATUS_SUCCEEDED};
    use buildfarm_common::config;
    use serde_json::json;

    fn config() -> Config {
        config::from_str(r#"
        [backend]
        destdir = "/srv/results"
        results_baseurl = "http://results.example.com/"
        vendor = "Example Builds"
        "#).unwrap()
    }

    fn descriptor(chroot: &str, timeout: u64) -> String {
        json!({
            "task_id": "42-fedora-30-x86_64",
            "id": 42,
            "pkgs": "http://example.com/a-1-1.src.rpm http://example.com/b-2-1.src.rpm",
            "repos": "http://repo.example.com/extra  ",
            "chroot": chroot,
            "buildroot_pkgs": "make gcc",
            "memory_reqs": null,
            "timeout": timeout,
            "user_id": 3,
            "copr": {"id": 7, "name": "foo", "owner": {"name": "alice"}},
        }).to_string()
    }

    #[test]
    fn test_parse_job() {
        let job = Job::parse(&descriptor("fedora-30-x86_64", 3600), &config()).unwrap();
        assert_eq!(job.task_id, "42-fedora-30-x86_64");
        assert_eq!(job.arch, "x86_64");
        assert_eq!(job.pkgs.len(), 2);
        assert_eq!(job.repos, vec!["http://repo.example.com/extra"]);
        assert_eq!(job.buildroot_pkgs, vec!["make", "gcc"]);
        assert_eq!(job.timeout, 3600);
        assert_eq!(job.destdir, PathBuf::from("/srv/results/alice/foo"));
        assert_eq!(job.results, "http://results.example.com/alice/foo/");
        assert_eq!(job.log_file(), PathBuf::from("/srv/results/alice/foo/fedora-30-x86_64/build-42.log"));
        assert_eq!(job.descriptor_path(Path::new("/var/lib/jobs")),
            PathBuf::from("/var/lib/jobs/42-fedora-30-x86_64.json"));
    }

    #[test]
    fn test_zero_timeout_uses_default() {
        let job = Job::parse(&descriptor("fedora-30-x86_64", 0), &config()).unwrap();
        assert_eq!(job.timeout, 1800);
    }

    #[test]
    fn test_effective_repos_and_macros() {
        let job = Job::parse(&descriptor("fedora-30-x86_64", 0), &config()).unwrap();
        assert_eq!(job.effective_repos(), vec![
            "http://repo.example.com/extra".to_string(),
            "http://results.example.com/alice/foo/fedora-30-x86_64".to_string(),
        ]);
        assert_eq!(job.macros()[2], ("vendor".to_string(), "Example Builds (alice/foo)".to_string()));
    }

    #[test]
    fn test_reject_bad_descriptors() {
        assert!(Job::parse("{", &config()).is_err());
        assert!(Job::parse(&descriptor("fedora", 0), &config()).is_err());
        assert!(Job::parse(&descriptor("../../etc-x-y", 0), &config()).is_err());
    }

    #[test]
    fn test_status_updates() {
        let mut job = Job::parse(&descriptor("fedora-30-x86_64", 0), &config()).unwrap();
        job.started_on = Some(100);
        let started = job.started_update();
        assert_eq!(started.status, STATUS_RUNNING);
        assert_eq!(started.results.as_deref(), Some("http://results.example.com/alice/foo/"));

        job.ended_on = Some(200);
        assert_eq!(job.finished_update().status, STATUS_FAILED);
        job.status = Some(BuildOutcome::Succeeded);
        let finished = job.finished_update();
        assert_eq!(finished.status, STATUS_SUCCEEDED);
        assert_eq!(finished.ended_on, Some(200));
        assert_eq!(finished.started_on, None);
    }

    #[test]
    fn test_package_name() {
        assert_eq!(package_name("http://example.com/foo-1.0-1.src.rpm"), "foo-1.0-1");
        assert_eq!(package_name("foo-1.0-1.src.rpm"), "foo-1.0-1");
        assert_eq!(package_name("https://example.com/git/foo"), "foo");
    }
}
