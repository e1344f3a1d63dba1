mod args;

use crate::args::Args;
use buildfarm_common::config;
use buildfarm_common::errors::*;
use clap::Parser;
use env_logger::Env;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let logging = match args.verbose {
        0 => "info",
        1 => "buildfarm=debug,buildfarm_common=debug,buildfarm_worker=debug,info",
        2 => "debug",
        3 => "buildfarm=trace,buildfarm_common=trace,buildfarm_worker=trace,debug",
        _ => "trace",
    };

    env_logger::init_from_env(Env::default().default_filter_or(logging));

    if args.check_config {
        let mut config = config::load(&args.config)?;
        config.apply(args.overrides());
        println!("{:#?}", config);
    } else {
        buildfarm::run(args.config.clone(), args.overrides()).await?;
    }
    Ok(())
}
