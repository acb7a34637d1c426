use std::{path::PathBuf, sync::OnceLock};

use clap::Parser;

/// Builds, deploys and routes applications on a Docker swarm.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Path to the config file.
    #[arg(short, long, default_value = "wharf.toml")]
    pub config: PathBuf,
    /// Path to the variables substituted into the config file.
    #[arg(long, default_value = "wharf.vars.toml")]
    pub vars: PathBuf,
    /// Issue self-signed certificates instead of ordering them over ACME.
    #[arg(long)]
    pub simulate: bool,
}

static ARGS: OnceLock<Args> = OnceLock::new();

pub fn get_cli_args() -> &'static Args {
    ARGS.get_or_init(Args::parse)
}
