use clap::Parser;

use std::path::PathBuf;

use crate::config;

/// Multipath egress load balancer reconciliation daemon.
///
/// Takes no required arguments: it starts, runs until signaled, and exits
/// 0 after cleanup. The flags below only let an operator relocate the
/// configuration file; all actual behavior is controlled by that file (see
/// the configuration surface).
#[derive(Clone, Debug, Parser)]
#[command(version)]
pub struct Cli {
    /// Configuration file path.
    #[arg(short, long, env = config::ENV_VAR, default_value = config::DEFAULT_PATH)]
    pub config_path: PathBuf,
}

pub fn parse() -> Cli {
    Cli::parse()
}
