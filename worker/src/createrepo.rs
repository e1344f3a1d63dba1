use crate::lock::RegenLock;
use crate::proc;
use async_trait::async_trait;
use buildfarm_common::api::FrontendApi;
use buildfarm_common::errors::*;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;

/// Staging index that is maintained when a project opted out of automatic regeneration
pub const DEVEL_DIR: &str = "devel";

/// Builds the argument list for the repository metadata tool
pub fn createrepo_args(path: &Path, dest_dir: Option<&str>, base_url: Option<&str>) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![
        "--database".into(),
        "--ignore-lock".into(),
    ];
    if path.join("repodata/repomd.xml").exists() {
        args.push("--update".into());
    }
    if path.to_string_lossy().contains("epel-5") {
        args.extend(["-s", "sha", "--checksum", "md5"].map(OsString::from));
    }
    if let Some(dest_dir) = dest_dir {
        args.push("--outputdir".into());
        args.push(path.join(dest_dir).into_os_string());
    }
    if let Some(base_url) = base_url {
        args.push("--baseurl".into());
        args.push(base_url.into());
    }
    args.push(path.as_os_str().to_os_string());
    args
}

/// Keeps repository metadata of result directories up to date
#[async_trait]
pub trait RepoIndexer: Send + Sync {
    /// Regenerate the index of `path` in place
    async fn regenerate(&self, path: &Path) -> Result<()>;

    /// Regenerate honoring the project's auto-createrepo preference.
    ///
    /// Projects that opted out only get their `devel` staging index refreshed.
    async fn regenerate_conditional(&self, owner: &str, project: &str, chroot: &str, path: &Path) -> Result<()>;
}

pub struct Regenerator {
    createrepo: PathBuf,
    lock: RegenLock,
    results_baseurl: String,
    frontend: Arc<dyn FrontendApi>,
}

impl Regenerator {
    pub fn new(createrepo: PathBuf, lock: RegenLock, results_baseurl: String, frontend: Arc<dyn FrontendApi>) -> Regenerator {
        Regenerator {
            createrepo,
            lock,
            results_baseurl,
            frontend,
        }
    }

    async fn run(&self, path: &Path, dest_dir: Option<&str>, base_url: Option<&str>) -> Result<()> {
        if let Some(dest_dir) = dest_dir {
            fs::create_dir_all(path.join(dest_dir)).await?;
        }

        let output = {
            let _guard = self.lock.acquire().await?;
            let args = createrepo_args(path, dest_dir, base_url);
            proc::run(&self.createrepo, args, proc::Options::default()).await?
        };

        if !output.success {
            bail!("createrepo failed for {:?}: {}", path, output.text().trim());
        }
        info!("Regenerated repository metadata for {:?}", path);
        Ok(())
    }

    async fn auto_createrepo(&self, owner: &str, project: &str) -> bool {
        match self.frontend.auto_createrepo(owner, project).await {
            Ok(Some(enabled)) => enabled,
            Ok(None) => true,
            Err(err) => {
                warn!("Failed to query auto_createrepo for {}/{}, assuming enabled: {:#}", owner, project, err);
                true
            }
        }
    }
}

#[async_trait]
impl RepoIndexer for Regenerator {
    async fn regenerate(&self, path: &Path) -> Result<()> {
        self.run(path, None, None).await
    }

    async fn regenerate_conditional(&self, owner: &str, project: &str, chroot: &str, path: &Path) -> Result<()> {
        if self.auto_createrepo(owner, project).await {
            self.run(path, None, None).await
        } else {
            let base_url = format!("{}/{}/{}/{}", self.results_baseurl, owner, project, chroot);
            self.run(path, Some(DEVEL_DIR), Some(&base_url)).await
        }
    }
}
