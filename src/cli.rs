use clap::{ArgAction, Parser};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "vcnest")]
#[command(about = "Reconcile virtual-cluster node membership across a host fleet")]
#[command(version)]
pub struct Args {
    /// Enable verbose logging output (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,

    /// Path to a .env file with agent credentials and overrides
    #[arg(long, value_name = "FILE")]
    pub env_file: Option<PathBuf>,

    /// YAML document seeding the host-port pool
    #[arg(long, value_name = "FILE")]
    pub port_pool: Option<PathBuf>,

    /// Run one reconcile sweep and exit instead of looping
    #[arg(long)]
    pub once: bool,
}
