use crate::args::{Args, SubCommand};
use buildfarm_common::api;
use buildfarm_common::config;
use buildfarm_common::errors::*;
use buildfarm_common::events;
use buildfarm_common::queue::MemoryQueue;
use buildfarm_worker::createrepo::RepoIndexer;
use buildfarm_worker::job::Job;
use buildfarm_worker::worker::Worker;
use clap::Parser;
use env_logger::Env;
use std::sync::Arc;
use tokio::fs;

pub mod args;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let logging = match args.verbose {
        0 => "info",
        1 => "info,buildfarm=debug",
        2 => "debug",
        _ => "trace",
    };

    env_logger::init_from_env(Env::default()
        .default_filter_or(logging));

    let path = args.config
        .unwrap_or_else(|| config::DEFAULT_CONFIG_PATH.into());
    let config = config::load(&path)
        .context("Failed to load config file")?;

    match args.subcommand {
        // this is only really for debugging
        SubCommand::Build(build) => {
            let group = config.group(build.group)
                .cloned()
                .ok_or_else(|| anyhow!("No build group with id {} configured", build.group))?;
            let descriptor = fs::read_to_string(&build.descriptor)
                .await
                .with_context(|| anyhow!("Failed to read job descriptor {:?}", build.descriptor))?;
            let job = Job::parse(&descriptor, &config)?;

            let frontend = Arc::new(api::Client::new(&config)?);
            let services = buildfarm_worker::services(&config, frontend);
            let (events, mut rx) = events::channel();
            tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    info!("{}", event.format());
                }
            });

            let queue = Arc::new(MemoryQueue::new(format!("oneshot-{}", group.id)));
            let shared = config::SharedConfig::new(config.clone());
            let worker = Worker::new(group, 0, build.addr, shared, queue, services, &events);
            let outcome = worker.process(&config, job, &descriptor).await?;
            info!("Job finished: {:?}", outcome);
        },
        SubCommand::Createrepo(createrepo) => {
            let frontend = Arc::new(api::Client::new(&config)?);
            let services = buildfarm_worker::services(&config, frontend);
            services.indexer.regenerate(&createrepo.path).await?;
        },
        SubCommand::CheckConfig => {
            let json = serde_json::to_string_pretty(&config)?;
            println!("{}", json);
        },
    }

    Ok(())
}
