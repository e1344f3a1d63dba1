pub mod build;
pub mod createrepo;
pub mod job;
pub mod lock;
pub mod proc;
pub mod provision;
pub mod report;
pub mod worker;
pub mod worklog;

use buildfarm_common::api::FrontendApi;
use buildfarm_common::config::Config;
use std::sync::Arc;

/// Wire up the production implementations of everything a worker talks to
pub fn services(config: &Config, frontend: Arc<dyn FrontendApi>) -> worker::Services {
    let indexer = createrepo::Regenerator::new(
        config.createrepo.clone(),
        lock::RegenLock::new(&config.lockfile),
        config.results_baseurl.clone(),
        frontend.clone(),
    );
    worker::Services {
        frontend,
        provisioner: Arc::new(provision::PlaybookProvisioner::new(config.ansible_playbook.clone())),
        builder: Arc::new(build::ScriptBuilder::new(&config.build)),
        indexer: Arc::new(indexer),
    }
}
