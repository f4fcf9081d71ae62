//! chainplan deploys modules of interdependent contracts and keeps track of what
//! is already on chain.

mod cli;

use std::{collections::BTreeMap, ffi::OsString, process::ExitCode};

use anyhow::{Context, Result};
use chainplan_deploy::{
    ChainClient, DeployContext, DeploymentGraph, FileLedger, HardhatArtifacts, Ledger, Module,
    Network, ProjectConfig, RpcChainClient, Scheduler, Shutdown,
};
use clap::Parser;
use comfy_table::{Table, presets::UTF8_FULL_CONDENSED};

use cli::{Cli, Command, RunArgs};

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    // Initialize the logger.
    tracing_subscriber::fmt()
        .with_max_level(cli.verbosity)
        .init();

    let config = ProjectConfig::load(&cli.config)?;

    match cli.command {
        Command::Run(args) => run(&config, args).await,
        Command::Plan { module } => plan(&config, &module),
        Command::Status { module, network } => status(&config, &module, &network),
    }
}

fn load_module(config: &ProjectConfig, module: &str) -> Result<Module> {
    let path = config.module_path(module)?;
    Module::load_from_file(&path)
}

/// Values for `env` arguments: the network's table, overlaid by the process environment.
fn deploy_env(
    network_env: &BTreeMap<String, String>,
    process_env: impl IntoIterator<Item = (String, String)>,
) -> BTreeMap<String, String> {
    let mut env = network_env.clone();
    env.extend(process_env);
    env
}

/// Process variables representable as UTF-8; the others cannot be constructor arguments.
fn utf8_env(
    vars: impl IntoIterator<Item = (OsString, OsString)>,
) -> impl Iterator<Item = (String, String)> {
    vars.into_iter().filter_map(|(name, value)| {
        match (name.into_string(), value.into_string()) {
            (Ok(name), Ok(value)) => Some((name, value)),
            (name, _) => {
                tracing::debug!(name = ?name, "Ignoring non UTF-8 environment variable");
                None
            }
        }
    })
}

async fn run(config: &ProjectConfig, args: RunArgs) -> Result<ExitCode> {
    let module = load_module(config, &args.module)?;
    let network_config = config.network(&args.network)?;

    let mut scheduler_config = config.scheduler.clone();
    scheduler_config.redeploy |= args.redeploy;
    if let Some(concurrency) = args.concurrency {
        scheduler_config.concurrency = concurrency;
    }
    if let Some(secs) = args.receipt_timeout {
        scheduler_config.receipt_timeout_secs = secs;
    }

    let chain = RpcChainClient::new(&network_config.url, scheduler_config.poll_interval())?;
    let chain_id = chain
        .chain_id()
        .await
        .with_context(|| format!("Failed to query chain id from {}", network_config.url))?;
    anyhow::ensure!(
        chain_id == network_config.chain_id,
        "Network `{}` expects chain id {} but the node at {} reports {}",
        args.network,
        network_config.chain_id,
        network_config.url,
        chain_id
    );

    let network = Network {
        name: args.network.clone(),
        chain_id,
    };
    let env = deploy_env(&network_config.env, utf8_env(std::env::vars_os()));
    let artifacts = HardhatArtifacts::new(config.artifacts.clone());
    let mut ledger = FileLedger::open(&config.ledger, chain_id)
        .with_context(|| format!("Failed to open ledger under {}", config.ledger.display()))?;

    let (trigger, shutdown) = Shutdown::channel();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Received Ctrl-C, waiting for in-flight deployments...");
            trigger.cancel();
        }
    });

    let report = Scheduler::new(scheduler_config)
        .with_shutdown(shutdown)
        .run(
            &module,
            DeployContext {
                network: &network,
                env: &env,
                ledger: &mut ledger,
                chain: &chain,
                artifacts: &artifacts,
            },
        )
        .await?;

    println!("{}", report.to_table());

    if report.is_success() {
        tracing::info!(
            module = %report.module,
            ledger = %ledger.dir().display(),
            "Deployment complete"
        );
        Ok(ExitCode::SUCCESS)
    } else {
        tracing::error!(
            module = %report.module,
            incomplete = report.failures().count(),
            "Deployment incomplete, run again to resume"
        );
        Ok(ExitCode::FAILURE)
    }
}

fn plan(config: &ProjectConfig, module: &str) -> Result<ExitCode> {
    let module = load_module(config, module)?;
    let graph = DeploymentGraph::build(&module)?;

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL_CONDENSED)
        .set_header(vec!["#", "Deployment", "Contract", "Signer", "Depends on"]);

    for (step, &index) in graph.order().iter().enumerate() {
        let spec = &module.deployments[index];
        let dependencies = graph
            .dependencies(index)
            .iter()
            .map(|&dep| module.deployments[dep].name.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        table.add_row(vec![
            (step + 1).to_string(),
            spec.name.clone(),
            spec.contract.clone(),
            spec.signer.to_string(),
            dependencies,
        ]);
    }

    println!("{table}");
    Ok(ExitCode::SUCCESS)
}

fn status(config: &ProjectConfig, module: &str, network: &str) -> Result<ExitCode> {
    let module = load_module(config, module)?;
    let chain_id = config.network(network)?.chain_id;
    let ledger = FileLedger::open(&config.ledger, chain_id)
        .with_context(|| format!("Failed to open ledger under {}", config.ledger.display()))?;

    let entries: BTreeMap<_, _> = ledger
        .entries(chain_id, &module.name)?
        .into_iter()
        .map(|entry| (entry.spec.clone(), entry))
        .collect();

    let mut table = Table::new();
    table.load_preset(UTF8_FULL_CONDENSED).set_header(vec![
        "Deployment",
        "Contract",
        "Status",
        "Address",
        "Transaction",
        "Updated",
    ]);

    for spec in &module.deployments {
        let row = match entries.get(&spec.name) {
            Some(entry) => vec![
                spec.name.clone(),
                entry.contract.clone(),
                entry.status.to_string(),
                entry.address.map(|a| a.to_string()).unwrap_or_default(),
                entry.tx_hash.map(|h| h.to_string()).unwrap_or_default(),
                chrono::DateTime::from_timestamp(entry.updated_at, 0)
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_default(),
            ],
            None => vec![
                spec.name.clone(),
                spec.contract.clone(),
                "not deployed".to_string(),
                String::new(),
                String::new(),
                String::new(),
            ],
        };
        table.add_row(row);
    }

    println!("{table}");
    Ok(ExitCode::SUCCESS)
}
