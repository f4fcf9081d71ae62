use std::path::PathBuf;

use chainplan_deploy::LOCALHOST_NETWORK;
use clap::{Args, Parser, Subcommand};
use tracing::level_filters::LevelFilter;

#[derive(Parser)]
#[command(name = "chainplan")]
#[command(
    author,
    version,
    about = "Deploy interdependent smart contracts in dependency order, once each"
)]
pub struct Cli {
    /// The verbosity level.
    #[arg(short, long, global = true, env = "CHAINPLAN_VERBOSITY", default_value_t = LevelFilter::INFO)]
    pub verbosity: LevelFilter,

    /// Path to the project configuration file, or to the directory holding `Chainplan.toml`.
    #[arg(short, long, global = true, alias = "conf", env = "CHAINPLAN_CONFIG", default_value = ".")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Deploy a module on a network, reusing what is already deployed.
    Run(RunArgs),

    /// Validate a module and print its deployment order. Does not touch the chain.
    Plan {
        /// Module file, or name of a module under the modules directory.
        module: String,
    },

    /// Print what the ledger knows about a module on a network.
    Status {
        /// Module file, or name of a module under the modules directory.
        module: String,

        #[arg(short, long, env = "CHAINPLAN_NETWORK", default_value = LOCALHOST_NETWORK)]
        network: String,
    },
}

#[derive(Args)]
pub struct RunArgs {
    /// Module file, or name of a module under the modules directory.
    pub module: String,

    /// Name of the target network in the configuration.
    #[arg(short, long, env = "CHAINPLAN_NETWORK", default_value = LOCALHOST_NETWORK)]
    pub network: String,

    /// Deploy everything again, ignoring confirmed ledger entries.
    #[arg(long, env = "CHAINPLAN_REDEPLOY", default_value_t = false)]
    pub redeploy: bool,

    /// Maximum number of deployments in flight. Overrides the configuration.
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Seconds to wait for a deployment receipt. Overrides the configuration.
    #[arg(long, value_name = "SECS")]
    pub receipt_timeout: Option<u64>,
}
