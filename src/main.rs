use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use mineclifford::configuration::ConfigurationExecutor;
use mineclifford::container::ContainerRuntimeClient;
use mineclifford::deploy::{DeploymentRequest, PipelineEvent};
use mineclifford::provisioning::ProvisioningExecutor;
use mineclifford::runner::{CommandRunner, ProcessRunner};
use mineclifford::{DeployerConfig, Deployment, DeploymentHandle, DeploymentOrchestrator};

/// Deploy Minecraft servers to cloud machines or the local container engine
#[derive(Parser)]
#[command(name = "mineclifford")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Deploy the server group described by a JSON request file
    Deploy {
        #[arg(long)]
        request: PathBuf,
    },
    /// Destroy the infrastructure of a cloud deployment
    Destroy {
        #[arg(long)]
        request: PathBuf,
    },
    /// Manage local server containers
    Containers {
        #[command(subcommand)]
        action: ContainerAction,
    },
}

#[derive(Subcommand)]
enum ContainerAction {
    /// List server containers
    List {
        /// Include stopped containers
        #[arg(long)]
        all: bool,
    },
    Start { id: String },
    Stop { id: String },
    Restart { id: String },
    /// Force-remove a container
    Remove { id: String },
    /// Print container logs
    Logs {
        id: String,
        #[arg(long)]
        tail: Option<usize>,
        #[arg(short, long)]
        follow: bool,
    },
    /// Run a command inside a container
    Exec {
        id: String,
        #[arg(trailing_var_arg = true, required = true)]
        cmd: Vec<String>,
    },
    /// Pull the configured server image
    Pull,
}

#[tokio::main]
async fn main() -> Result<()> {
    // stdout carries the event stream; logs go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Command::Deploy { request } => deploy(&config, &request).await,
        Command::Destroy { request } => destroy(&config, &request).await,
        Command::Containers { action } => containers(&config, action).await,
    }
}

fn load_config(path: Option<&Path>) -> Result<DeployerConfig> {
    match path.map(Path::to_path_buf).or_else(DeployerConfig::default_path) {
        Some(path) => {
            info!(path = %path.display(), "Loading configuration");
            DeployerConfig::load(&path)
        }
        None => Ok(DeployerConfig::default()),
    }
}

fn read_request(path: &Path) -> Result<DeploymentRequest> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}

async fn build_orchestrator(config: &DeployerConfig, local: bool) -> DeploymentOrchestrator {
    let runner: Arc<dyn CommandRunner> = Arc::new(ProcessRunner::new(config.terminate_grace()));
    let containers = if local {
        ContainerRuntimeClient::connect(config.container.clone()).await
    } else {
        ContainerRuntimeClient::unavailable(config.container.clone(), "not connected for cloud runs")
    };

    DeploymentOrchestrator::new(
        ProvisioningExecutor::new(runner.clone(), config),
        ConfigurationExecutor::new(runner, config),
        Arc::new(containers),
        config,
    )
}

async fn deploy(config: &DeployerConfig, path: &Path) -> Result<()> {
    let request = read_request(path)?;
    let orchestrator = build_orchestrator(config, request.is_local()).await;

    match orchestrator.deploy(request).await? {
        Deployment::Local(outcome) => {
            print_json(&outcome)?;
            if let Some(error) = outcome.error() {
                bail!("Local deployment failed: {}", error);
            }
            Ok(())
        }
        Deployment::Cloud(handle) => stream_events(handle, &orchestrator).await,
    }
}

async fn destroy(config: &DeployerConfig, path: &Path) -> Result<()> {
    let request = read_request(path)?;
    let orchestrator = build_orchestrator(config, false).await;
    let handle = orchestrator.destroy(request)?;
    stream_events(handle, &orchestrator).await
}

/// Print events as JSON lines until the run ends; Ctrl-C cancels it
async fn stream_events(
    mut handle: DeploymentHandle,
    orchestrator: &DeploymentOrchestrator,
) -> Result<()> {
    info!(request_id = handle.id(), "Streaming pipeline events");
    let mut failure = None;

    loop {
        tokio::select! {
            event = handle.next_event() => {
                let Some(event) = event else { break };
                print_json(&event)?;
                if let PipelineEvent::Error(error) = &event {
                    failure = Some(error.message.clone());
                }
            }
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupted, cancelling run");
                orchestrator.shutdown();
            }
        }
    }

    match failure {
        Some(message) => bail!("{}", message),
        None => Ok(()),
    }
}

async fn containers(config: &DeployerConfig, action: ContainerAction) -> Result<()> {
    let client = ContainerRuntimeClient::connect(config.container.clone()).await;

    match action {
        ContainerAction::List { all } => {
            for container in client.list_containers(all).await? {
                print_json(&container)?;
            }
        }
        ContainerAction::Start { id } => client.start_container(&id).await?,
        ContainerAction::Stop { id } => client.stop_container(&id).await?,
        ContainerAction::Restart { id } => client.restart_container(&id).await?,
        ContainerAction::Remove { id } => client.remove_container(&id).await?,
        ContainerAction::Logs { id, tail, follow } => {
            if follow {
                let mut lines = client.stream_logs(&id)?;
                while let Some(line) = lines.recv().await {
                    println!("{}", line?);
                }
            } else {
                print!("{}", client.logs(&id, tail).await?);
            }
        }
        ContainerAction::Exec { id, cmd } => {
            let result = client.exec(&id, &cmd).await?;
            print!("{}", result.output);
            if result.exit_code != 0 {
                bail!("Command exited with code {}", result.exit_code);
            }
        }
        ContainerAction::Pull => {
            let (tx, mut rx) = mpsc::channel::<String>(64);
            let printer = tokio::spawn(async move {
                while let Some(line) = rx.recv().await {
                    println!("{}", line);
                }
            });
            let settings = &config.container;
            let pulled = client.pull_image(&settings.image, &settings.tag, Some(&tx)).await;
            drop(tx);
            printer.await?;
            pulled?;
        }
    }

    Ok(())
}
