use buildfarm_common::config::{Overrides, DEFAULT_CONFIG_PATH};
use clap::{ArgAction, Parser};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(version)]
pub struct Args {
    /// Verbose logging, also mirrors every event to stderr
    #[arg(short, long, action(ArgAction::Count))]
    pub verbose: u8,
    /// Exit when a worker dies unexpectedly instead of replacing it
    #[arg(short = 'x', long)]
    pub exit_on_worker: bool,
    /// Load and print a config
    #[arg(long)]
    pub check_config: bool,
    /// Configuration file path
    #[arg(short, long, env = "BUILDFARM_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,
}

impl Args {
    pub fn overrides(&self) -> Overrides {
        Overrides {
            exit_on_worker: self.exit_on_worker,
            verbose: self.verbose > 0,
        }
    }
}
