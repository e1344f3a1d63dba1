use clap::{ArgAction, Parser};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(version)]
pub struct Args {
    /// Verbose logging
    #[arg(short, long, global = true, action(ArgAction::Count))]
    pub verbose: u8,
    #[arg(short, long, global = true, env = "BUILDFARM_CONFIG")]
    pub config: Option<PathBuf>,
    #[command(subcommand)]
    pub subcommand: SubCommand,
}

#[derive(Debug, Parser)]
pub enum SubCommand {
    /// Run a single job descriptor through provisioning, build, reporting and teardown
    Build(Build),
    /// Regenerate the repository metadata of a results directory
    Createrepo(Createrepo),
    /// Load and print a config
    CheckConfig,
}

#[derive(Debug, Parser)]
pub struct Build {
    /// Path to the json job descriptor
    pub descriptor: PathBuf,
    /// Build group the job is executed for
    #[arg(short, long, default_value = "0")]
    pub group: u32,
    /// Use an existing builder instead of provisioning one
    #[arg(long)]
    pub addr: Option<String>,
}

#[derive(Debug, Parser)]
pub struct Createrepo {
    pub path: PathBuf,
}
