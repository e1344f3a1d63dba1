use crate::job::Job;
use crate::proc;
use async_trait::async_trait;
use buildfarm_common::config::BuildConfig;
use buildfarm_common::errors::*;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PkgOutcome {
    pub pkg: String,
    pub success: bool,
}

pub fn all_succeeded(outcomes: &[PkgOutcome]) -> bool {
    !outcomes.is_empty() && outcomes.iter().all(|o| o.success)
}

pub fn any_succeeded(outcomes: &[PkgOutcome]) -> bool {
    outcomes.iter().any(|o| o.success)
}

/// The subsystem that actually builds packages on a provisioned machine
#[async_trait]
pub trait RemoteBuilder: Send + Sync {
    /// Build every package of the job on `addr`.
    ///
    /// An `Err` means the builder couldn't be invoked at all, failed packages are reported
    /// through the returned outcomes.
    async fn build(&self, addr: &str, job: &Job) -> Result<Vec<PkgOutcome>>;
}

/// Runs the configured build script once per package
pub struct ScriptBuilder {
    script: PathBuf,
    continue_on_failure: bool,
    max_log_bytes: Option<usize>,
}

impl ScriptBuilder {
    pub fn new(config: &BuildConfig) -> ScriptBuilder {
        ScriptBuilder {
            script: config.script.clone(),
            continue_on_failure: config.continue_on_failure,
            max_log_bytes: config.max_log_bytes,
        }
    }

    pub fn args(addr: &str, job: &Job, pkg: &str) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "--builder".into(),
            addr.into(),
            "--chroot".into(),
            job.chroot.as_str().into(),
            "--destdir".into(),
            job.chroot_dir().into_os_string(),
            "--timeout".into(),
            job.timeout.to_string().into(),
        ];
        for repo in job.effective_repos() {
            args.push("--repo".into());
            args.push(repo.into());
        }
        for pkg in &job.buildroot_pkgs {
            args.push("--buildroot-pkg".into());
            args.push(pkg.into());
        }
        for (key, value) in job.macros() {
            args.push("--macro".into());
            args.push(format!("{}={}", key, value).into());
        }
        args.push(pkg.into());
        args
    }
}

async fn append_log(path: &Path, data: &[u8]) -> Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .with_context(|| anyhow!("Failed to open build log {:?}", path))?;
    file.write_all(data).await?;
    file.flush().await?;
    Ok(())
}

#[async_trait]
impl RemoteBuilder for ScriptBuilder {
    async fn build(&self, addr: &str, job: &Job) -> Result<Vec<PkgOutcome>> {
        let log_file = job.log_file();
        if let Some(parent) = log_file.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut outcomes = Vec::new();
        let mut failed = false;
        for pkg in &job.pkgs {
            if failed && !self.continue_on_failure {
                append_log(&log_file, format!("=== {} ===\nskipped after previous failure\n", pkg).as_bytes()).await?;
                outcomes.push(PkgOutcome {
                    pkg: pkg.clone(),
                    success: false,
                });
                continue;
            }

            info!("Building {:?} for {:?} on {}", pkg, job.chroot, addr);
            append_log(&log_file, format!("=== {} ===\n", pkg).as_bytes()).await?;
            let output = proc::run(&self.script, Self::args(addr, job, pkg), proc::Options {
                timeout: Some(Duration::from_secs(job.timeout)),
                size_limit: self.max_log_bytes,
                envs: Default::default(),
            }).await?;
            append_log(&log_file, &output.log).await?;

            if !output.success {
                warn!("Build of {:?} failed (timed_out={})", pkg, output.timed_out);
                failed = true;
            }
            outcomes.push(PkgOutcome {
                pkg: pkg.clone(),
                success: output.success,
            });
        }

        Ok(outcomes)
    }
}
