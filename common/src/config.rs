use crate::errors::*;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use url::Url;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/buildfarm/backend.toml";

pub const DEFAULT_SLEEPTIME: u64 = 10;
pub const DEFAULT_BUILD_TIMEOUT: u64 = 1800;
pub const DEFAULT_MAX_WORKERS: usize = 8;

/// Status updates about builds are retried this many times before the worker gives up
pub const FRONTEND_RETRIES: usize = 10;
pub const FRONTEND_RETRY_DELAY: u64 = 5;
/// Number of times the spawn playbook is invoked before provisioning is considered failed
pub const SPAWN_ATTEMPTS: usize = 4;

pub fn load<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    debug!("loading config file {:?}", path);
    let buf = fs::read_to_string(path)
        .with_context(|| anyhow!("Failed to read config file: {:?}", path))?;
    from_str(&buf)
        .with_context(|| anyhow!("Failed to load config file: {:?}", path))
}

pub fn from_str(buf: &str) -> Result<Config> {
    let file = toml::from_str::<ConfigFile>(buf)
        .context("Failed to parse config")?;
    Config::resolve(file)
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub backend: BackendSection,
    #[serde(default)]
    pub builder: BuilderSection,
    #[serde(default, rename = "group")]
    pub groups: Vec<GroupSection>,
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct BackendSection {
    pub destdir: Option<String>,
    pub results_baseurl: Option<String>,
    pub frontend_url: Option<String>,
    pub frontend_base_url: Option<String>,
    pub frontend_auth: Option<String>,
    pub sleeptime: Option<u64>,
    #[serde(default)]
    pub exit_on_worker: bool,
    pub logfile: Option<String>,
    pub worker_logdir: Option<String>,
    pub jobsdir: Option<String>,
    pub queue_url: Option<String>,
    pub lockfile: Option<String>,
    #[serde(default)]
    pub verbose: bool,
    pub ansible_playbook: Option<String>,
    pub createrepo: Option<String>,
    pub vendor: Option<String>,
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct BuilderSection {
    pub timeout: Option<u64>,
    pub script: Option<String>,
    pub continue_on_failure: Option<bool>,
    pub max_log_bytes: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GroupSection {
    pub id: u32,
    pub name: Option<String>,
    pub archs: Option<Vec<String>>,
    pub spawn_playbook: Option<String>,
    pub terminate_playbook: Option<String>,
    pub max_workers: Option<usize>,
    #[serde(default)]
    pub static_addrs: Vec<String>,
}

/// Command line flags that take precedence over the config file
#[derive(Debug, Default, Clone, Copy)]
pub struct Overrides {
    pub exit_on_worker: bool,
    pub verbose: bool,
}

/// Immutable snapshot of the dispatcher configuration
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Config {
    pub destdir: PathBuf,
    pub results_baseurl: String,
    pub frontend_url: String,
    pub frontend_base_url: String,
    pub frontend_auth: String,
    pub sleeptime: u64,
    pub exit_on_worker: bool,
    pub logfile: PathBuf,
    pub worker_logdir: PathBuf,
    pub jobsdir: PathBuf,
    pub queue_url: String,
    pub lockfile: PathBuf,
    pub verbose: bool,
    pub ansible_playbook: PathBuf,
    pub createrepo: PathBuf,
    pub vendor: String,
    pub build: BuildConfig,
    pub groups: Vec<GroupConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BuildConfig {
    pub timeout: u64,
    pub script: PathBuf,
    pub continue_on_failure: bool,
    pub max_log_bytes: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupConfig {
    pub id: u32,
    pub name: String,
    pub archs: Vec<String>,
    pub spawn_playbook: PathBuf,
    pub terminate_playbook: PathBuf,
    pub max_workers: usize,
    pub static_addrs: Vec<String>,
}

impl GroupConfig {
    fn resolve(section: GroupSection) -> Result<GroupConfig> {
        let name = section.name.unwrap_or_else(|| "PC".to_string());
        let spawn_playbook = section.spawn_playbook
            .unwrap_or_else(|| format!("/srv/buildfarm/provision/builderpb-{}.yml", name));
        let terminate_playbook = section.terminate_playbook
            .unwrap_or_else(|| format!("/srv/buildfarm/provision/terminatepb-{}.yml", name));

        let archs = section.archs
            .unwrap_or_else(|| vec!["i386".to_string(), "x86_64".to_string()]);
        if archs.is_empty() {
            bail!("Build group {} has no architectures configured", section.id);
        }

        Ok(GroupConfig {
            id: section.id,
            name,
            archs,
            spawn_playbook: expand_path(&spawn_playbook)?,
            terminate_playbook: expand_path(&terminate_playbook)?,
            max_workers: section.max_workers.unwrap_or(DEFAULT_MAX_WORKERS),
            static_addrs: section.static_addrs,
        })
    }

    pub fn default_group() -> Result<GroupConfig> {
        GroupConfig::resolve(GroupSection {
            id: 0,
            name: None,
            archs: None,
            spawn_playbook: None,
            terminate_playbook: None,
            max_workers: None,
            static_addrs: Vec::new(),
        })
    }

    /// The number of workers this group should keep alive
    pub fn quota(&self) -> usize {
        if self.static_addrs.is_empty() {
            self.max_workers
        } else {
            self.max_workers.min(self.static_addrs.len())
        }
    }

    pub fn supports_arch(&self, arch: &str) -> bool {
        self.archs.iter().any(|a| a == arch)
    }
}

impl Config {
    pub fn resolve(file: ConfigFile) -> Result<Config> {
        let backend = file.backend;

        let destdir = backend.destdir
            .ok_or_else(|| format_err!("Incomplete config - must specify destdir in configuration"))?;
        let destdir = expand_path(&destdir)?;

        let frontend_url = backend.frontend_url
            .unwrap_or_else(|| "http://localhost/backend".to_string());
        Url::parse(&frontend_url)
            .with_context(|| anyhow!("Invalid frontend_url: {:?}", frontend_url))?;
        let frontend_base_url = backend.frontend_base_url
            .unwrap_or_else(|| "http://localhost/".to_string());
        Url::parse(&frontend_base_url)
            .with_context(|| anyhow!("Invalid frontend_base_url: {:?}", frontend_base_url))?;

        let lockfile = match backend.lockfile {
            Some(path) => expand_path(&path)?,
            None => destdir.join(".regenerate.lock"),
        };

        let mut groups = Vec::new();
        let mut seen = HashSet::new();
        for section in file.groups {
            if !seen.insert(section.id) {
                bail!("Build group id {} is configured more than once", section.id);
            }
            groups.push(GroupConfig::resolve(section)?);
        }
        if groups.is_empty() {
            groups.push(GroupConfig::default_group()?);
        }

        let builder = file.builder;
        let build = BuildConfig {
            timeout: builder.timeout.unwrap_or(DEFAULT_BUILD_TIMEOUT),
            script: expand_path(builder.script.as_deref()
                .unwrap_or("/usr/libexec/buildfarm/remote-build"))?,
            continue_on_failure: builder.continue_on_failure.unwrap_or(true),
            max_log_bytes: builder.max_log_bytes,
        };

        Ok(Config {
            destdir,
            results_baseurl: backend.results_baseurl
                .unwrap_or_else(|| "http://localhost/results".to_string())
                .trim_end_matches('/')
                .to_string(),
            frontend_url: frontend_url.trim_end_matches('/').to_string(),
            frontend_base_url: frontend_base_url.trim_end_matches('/').to_string(),
            frontend_auth: backend.frontend_auth.unwrap_or_default(),
            sleeptime: backend.sleeptime.unwrap_or(DEFAULT_SLEEPTIME),
            exit_on_worker: backend.exit_on_worker,
            logfile: expand_path(backend.logfile.as_deref()
                .unwrap_or("/var/log/buildfarm/backend.log"))?,
            worker_logdir: expand_path(backend.worker_logdir.as_deref()
                .unwrap_or("/var/log/buildfarm/workers/"))?,
            jobsdir: expand_path(backend.jobsdir.as_deref()
                .unwrap_or("/var/lib/buildfarm/jobs"))?,
            queue_url: backend.queue_url
                .unwrap_or_else(|| "redis://127.0.0.1/".to_string()),
            lockfile,
            verbose: backend.verbose,
            ansible_playbook: expand_path(backend.ansible_playbook.as_deref()
                .unwrap_or("/usr/bin/ansible-playbook"))?,
            createrepo: expand_path(backend.createrepo.as_deref()
                .unwrap_or("/usr/bin/createrepo_c"))?,
            vendor: backend.vendor
                .unwrap_or_else(|| "Package Build Service".to_string()),
            build,
            groups,
        })
    }

    pub fn apply(&mut self, overrides: Overrides) {
        if overrides.exit_on_worker {
            self.exit_on_worker = true;
        }
        if overrides.verbose {
            self.verbose = true;
        }
    }

    /// Returns the first group that accepts the given architecture
    pub fn group_for_arch(&self, arch: &str) -> Option<&GroupConfig> {
        self.groups.iter().find(|group| group.supports_arch(arch))
    }

    pub fn group(&self, id: u32) -> Option<&GroupConfig> {
        self.groups.iter().find(|group| group.id == id)
    }
}

fn expand_path(path: &str) -> Result<PathBuf> {
    let path = if let Some(rest) = path.strip_prefix('~') {
        let home = dirs_next::home_dir()
            .ok_or_else(|| format_err!("Failed to find home directory"))?;
        home.join(rest.trim_start_matches('/'))
    } else {
        PathBuf::from(path)
    };

    let path = if path.is_absolute() {
        path
    } else {
        env::current_dir()?.join(path)
    };

    Ok(crate::utils::normalize_path(&path))
}

/// Handle to the configuration snapshot that is currently in effect.
///
/// Readers always get a complete `Config`; a reload swaps the whole snapshot at once.
#[derive(Debug, Clone)]
pub struct SharedConfig {
    inner: Arc<RwLock<Arc<Config>>>,
}

impl SharedConfig {
    pub fn new(config: Config) -> SharedConfig {
        SharedConfig {
            inner: Arc::new(RwLock::new(Arc::new(config))),
        }
    }

    pub fn snapshot(&self) -> Arc<Config> {
        let guard = self.inner.read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.clone()
    }

    pub fn replace(&self, config: Config) {
        let mut guard = self.inner.write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = Arc::new(config);
    }
}
