//! proxmox-deploy - provision cloud-init VMs on Proxmox VE over SSH
//!
//! Focused on:
//! - One deployment file per VM
//! - Rolling back partially created VMs and volumes
//! - Working with nothing but SSH access to the host

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{Level, error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use proxmox_deploy_rs::config::{ConfigLoader, DeployConfig, Overrides};
use proxmox_deploy_rs::orchestrator::DeploymentOrchestrator;
use proxmox_deploy_rs::remote::SshSession;
use proxmox_deploy_rs::seed::{META_DATA_FILE, USER_DATA_FILE};

#[derive(Parser)]
#[command(name = "proxmox-deploy")]
#[command(author, version, about = "Deploy cloud-init enabled VMs to Proxmox VE", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Deployment file
    #[arg(short, long, env = "PROXMOX_DEPLOY_CONFIG")]
    config: PathBuf,

    /// Cluster host to connect to
    #[arg(long, env = "PROXMOX_HOST", global = true)]
    host: Option<String>,

    /// SSH user on the cluster host
    #[arg(long, env = "PROXMOX_USER", global = true)]
    user: Option<String>,

    /// Directory holding cloud images
    #[arg(long, global = true)]
    images_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the VM described by the deployment file
    Deploy {
        /// Start the VM once configured
        #[arg(long, conflicts_with = "no_start")]
        start: bool,
        /// Leave the VM stopped
        #[arg(long)]
        no_start: bool,
        /// Override the VM name
        #[arg(long)]
        name: Option<String>,
    },
    /// Print the rendered meta-data and user-data
    RenderSeed,
    /// Package the seed image into a local file
    BuildSeed {
        /// Where to write the image
        output: PathBuf,
    },
    /// Validate the deployment file and print the plan
    Check,
}

fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .expect("Failed to set tracing subscriber");
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut overrides = Overrides {
        host: cli.host,
        user: cli.user,
        images_dir: cli.images_dir,
        ..Default::default()
    };

    match cli.command {
        Commands::Deploy {
            start,
            no_start,
            name,
        } => {
            overrides.name = name;
            overrides.auto_start = match (start, no_start) {
                (true, _) => Some(true),
                (_, true) => Some(false),
                _ => None,
            };
            let config = load(&cli.config, overrides, false).await?;
            deploy(config).await
        }
        Commands::RenderSeed => {
            let config = load(&cli.config, overrides, true).await?;
            let files = config.seed_builder().await?.render(&config.deployment)?;
            println!("--- {} ---\n{}", META_DATA_FILE, files.meta_data);
            println!("--- {} ---\n{}", USER_DATA_FILE, files.user_data);
            Ok(())
        }
        Commands::BuildSeed { output } => {
            let config = load(&cli.config, overrides, true).await?;
            let seed = config.seed_builder().await?.build(&config.deployment).await?;
            seed.persist(&output)
                .await
                .with_context(|| format!("failed to write {}", output.display()))?;
            println!("Wrote {} seed image to {}", seed.format(), output.display());
            Ok(())
        }
        Commands::Check => {
            let config = load(&cli.config, overrides, true).await?;
            print_plan(&config);
            if !config.deployment.base_image.is_file() {
                bail!(
                    "base image {} does not exist",
                    config.deployment.base_image.display()
                );
            }
            Ok(())
        }
    }
}

async fn load(path: &Path, overrides: Overrides, offline: bool) -> Result<DeployConfig> {
    let mut loader = ConfigLoader::new().with_path(path).with_overrides(overrides);
    if offline {
        loader = loader.offline();
    }
    loader
        .load()
        .await
        .with_context(|| format!("failed to load deployment file {}", path.display()))
}

/// Resolves on the first Ctrl-C
async fn interrupted() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => warn!("Interrupted, rolling back"),
        Err(e) => {
            warn!("Cannot listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await
        }
    }
}

async fn deploy(config: DeployConfig) -> Result<()> {
    let builder = config.seed_builder().await?;
    let session = Arc::new(SshSession::connect(config.ssh_options()).await?);

    let orchestrator = DeploymentOrchestrator::new(session.clone())
        .with_seed_builder(builder)
        .with_uploader(config.uploader())
        .with_provisioner(config.provisioner())
        .with_storage_timeout(config.command_timeout());

    let outcome = orchestrator.run_until(&config.deployment, interrupted()).await;
    drop(orchestrator);

    if let Ok(session) = Arc::try_unwrap(session) {
        if let Err(e) = session.close().await {
            warn!("{}", e);
        }
    }

    match outcome {
        Ok(deployment) => {
            if let Some(e) = &deployment.start_error {
                warn!("VM is defined but not running: {}", e);
            }
            info!(
                "'{}' is {} ({})",
                config.deployment.name, deployment.handle, deployment.state
            );
            println!("{}", deployment.handle.vmid);
            Ok(())
        }
        Err(failure) => bail!("{}", failure),
    }
}

fn print_plan(config: &DeployConfig) {
    let spec = &config.deployment;
    let vmid = spec
        .vmid
        .map(|id| id.to_string())
        .unwrap_or_else(|| "next free".to_string());

    println!("host:         {}@{}", config.connection.user, config.connection.host);
    println!("vm:           {} (id {}) on {}", spec.name, vmid, spec.node);
    println!("storage:      {}", spec.storage);
    println!("cpu:          {} x {}", spec.cpu, spec.cpu_family);
    println!("memory:       {} MiB", spec.memory);
    println!("disk:         {}", spec.disk_size);
    println!("base image:   {}", spec.base_image.display());
    println!("seed format:  {}", spec.seed_format);
    println!("start:        {}", spec.auto_start);
}
