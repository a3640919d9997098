use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions, LogOutput,
    LogsOptions, RemoveContainerOptions, RestartContainerOptions, StartContainerOptions,
    StopContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::{ContainerSummary, HostConfig, PortBinding};
use bollard::Docker;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{LocalOutcome, LocalRuntime};
use crate::config::ContainerSettings;
use crate::deploy::{DeploymentRequest, DeploymentResult};
use crate::error::{DeployError, DeployResult};

/// Label every managed container carries
pub const SERVER_LABEL: &str = "minecraft";
const NAME_PREFIX: &str = "mineclifford-";
const LOG_BUFFER: usize = 256;

/// Summary of one managed container
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub status: String,
    pub image: String,
}

impl From<ContainerSummary> for ContainerInfo {
    fn from(summary: ContainerSummary) -> Self {
        let id = summary.id.unwrap_or_default();
        Self {
            id: id.chars().take(12).collect(),
            name: summary
                .names
                .and_then(|names| names.into_iter().next())
                .map(|name| name.trim_start_matches('/').to_string())
                .unwrap_or_default(),
            status: summary.state.or(summary.status).unwrap_or_default(),
            image: summary.image.unwrap_or_else(|| "unknown".into()),
        }
    }
}

/// Result of a command run inside a container
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecOutput {
    pub exit_code: i64,
    pub output: String,
}

enum Engine {
    Connected(Docker),
    Unavailable(String),
}

/// How far a server launch got before it stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LaunchStep {
    Pulling,
    Creating,
    Created,
}

impl LaunchStep {
    /// Whether a launch that stopped here may have left a container behind.
    /// A create the engine rejected made nothing; one abandoned mid-request may have.
    fn needs_cleanup(self, timed_out: bool) -> bool {
        match self {
            LaunchStep::Pulling => false,
            LaunchStep::Creating => timed_out,
            LaunchStep::Created => true,
        }
    }
}

/// Docker Engine client for the local deployment path and container management
pub struct ContainerRuntimeClient {
    engine: Engine,
    settings: ContainerSettings,
}

impl ContainerRuntimeClient {
    /// Connect over the local socket; an unreachable engine is remembered,
    /// not returned as an error.
    pub async fn connect(settings: ContainerSettings) -> Self {
        let engine = match Docker::connect_with_local_defaults() {
            Ok(docker) => match docker.ping().await {
                Ok(_) => {
                    debug!("Container engine reachable");
                    Engine::Connected(docker)
                }
                Err(e) => {
                    warn!(error = %e, "Container engine did not answer ping");
                    Engine::Unavailable(e.to_string())
                }
            },
            Err(e) => {
                warn!(error = %e, "Failed to connect to container engine");
                Engine::Unavailable(e.to_string())
            }
        };
        Self { engine, settings }
    }

    /// Use an already configured engine connection, e.g. a non-default socket
    pub fn with_docker(docker: Docker, settings: ContainerSettings) -> Self {
        Self {
            engine: Engine::Connected(docker),
            settings,
        }
    }

    /// A client whose engine is known to be unreachable
    pub fn unavailable(settings: ContainerSettings, reason: impl Into<String>) -> Self {
        Self {
            engine: Engine::Unavailable(reason.into()),
            settings,
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self.engine, Engine::Connected(_))
    }

    fn engine(&self) -> DeployResult<&Docker> {
        match &self.engine {
            Engine::Connected(docker) => Ok(docker),
            Engine::Unavailable(reason) => Err(DeployError::EngineUnavailable(reason.clone())),
        }
    }

    pub async fn ping(&self) -> DeployResult<()> {
        self.engine()?
            .ping()
            .await
            .map_err(|e| DeployError::EngineUnavailable(e.to_string()))?;
        Ok(())
    }

    /// Containers labelled as game servers; `all` includes stopped ones
    pub async fn list_containers(&self, all: bool) -> DeployResult<Vec<ContainerInfo>> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![SERVER_LABEL.to_string()]);
        let options = ListContainersOptions {
            all,
            filters,
            ..Default::default()
        };
        let containers = self
            .engine()?
            .list_containers(Some(options))
            .await
            .map_err(engine_error)?;
        Ok(containers.into_iter().map(ContainerInfo::from).collect())
    }

    pub async fn start_container(&self, id: &str) -> DeployResult<()> {
        self.engine()?
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(engine_error)?;
        info!(container = id, "Container started");
        Ok(())
    }

    pub async fn stop_container(&self, id: &str) -> DeployResult<()> {
        let options = StopContainerOptions {
            t: self.settings.stop_timeout_secs,
        };
        self.engine()?
            .stop_container(id, Some(options))
            .await
            .map_err(engine_error)?;
        info!(container = id, "Container stopped");
        Ok(())
    }

    pub async fn restart_container(&self, id: &str) -> DeployResult<()> {
        let options = RestartContainerOptions {
            t: self.settings.stop_timeout_secs as isize,
        };
        self.engine()?
            .restart_container(id, Some(options))
            .await
            .map_err(engine_error)?;
        info!(container = id, "Container restarted");
        Ok(())
    }

    pub async fn remove_container(&self, id: &str) -> DeployResult<()> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        self.engine()?
            .remove_container(id, Some(options))
            .await
            .map_err(engine_error)?;
        info!(container = id, "Container removed");
        Ok(())
    }

    /// Last `tail` log lines (the configured default when `None`)
    pub async fn logs(&self, id: &str, tail: Option<usize>) -> DeployResult<String> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            tail: tail.unwrap_or(self.settings.log_tail).to_string(),
            ..Default::default()
        };
        let mut stream = Box::pin(self.engine()?.logs(id, Some(options)));
        let mut text = String::new();
        while let Some(chunk) = stream.next().await {
            text.push_str(&log_text(chunk.map_err(engine_error)?));
        }
        Ok(text)
    }

    /// Follow the log until the container exits or the receiver is dropped
    pub fn stream_logs(&self, id: &str) -> DeployResult<mpsc::Receiver<DeployResult<String>>> {
        let docker = self.engine()?.clone();
        let id = id.to_string();
        let (tx, rx) = mpsc::channel(LOG_BUFFER);

        tokio::spawn(async move {
            let options = LogsOptions::<String> {
                follow: true,
                stdout: true,
                stderr: true,
                ..Default::default()
            };
            let mut stream = Box::pin(docker.logs(&id, Some(options)));
            while let Some(chunk) = stream.next().await {
                let line = chunk
                    .map(|output| log_text(output).trim_end().to_string())
                    .map_err(engine_error);
                if tx.send(line).await.is_err() {
                    debug!(container = %id, "Log consumer went away");
                    break;
                }
            }
        });

        Ok(rx)
    }

    /// Run a command inside a running container and capture its output
    pub async fn exec(&self, id: &str, cmd: &[String]) -> DeployResult<ExecOutput> {
        let docker = self.engine()?;
        let options = CreateExecOptions {
            cmd: Some(cmd.to_vec()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };
        let exec = docker.create_exec(id, options).await.map_err(engine_error)?;

        let mut output = String::new();
        if let StartExecResults::Attached { output: mut stream, .. } =
            docker.start_exec(&exec.id, None).await.map_err(engine_error)?
        {
            while let Some(chunk) = stream.next().await {
                output.push_str(&log_text(chunk.map_err(engine_error)?));
            }
        }

        let inspect = docker.inspect_exec(&exec.id).await.map_err(engine_error)?;
        Ok(ExecOutput {
            exit_code: inspect.exit_code.unwrap_or(-1),
            output,
        })
    }

    /// Pull an image, forwarding progress lines to `progress` when given
    pub async fn pull_image(
        &self,
        image: &str,
        tag: &str,
        progress: Option<&mpsc::Sender<String>>,
    ) -> DeployResult<()> {
        let options = CreateImageOptions {
            from_image: image.to_string(),
            tag: tag.to_string(),
            ..Default::default()
        };
        info!(image, tag, "Pulling image");
        let mut stream = Box::pin(self.engine()?.create_image(Some(options), None, None));
        while let Some(item) = stream.next().await {
            let info = item.map_err(engine_error)?;
            if let Some(error) = info.error {
                return Err(DeployError::Container(error));
            }
            let line = match (info.status, info.progress) {
                (Some(status), Some(bar)) => format!("{} {}", status, bar),
                (Some(status), None) => status,
                _ => continue,
            };
            debug!(image, "{}", line);
            if let Some(tx) = progress {
                let _ = tx.send(line).await;
            }
        }
        Ok(())
    }

    /// Pull, create, start and inspect a server container for `request`
    pub async fn create_server_container(&self, request: &DeploymentRequest) -> LocalOutcome {
        let docker = match self.engine() {
            Ok(docker) => docker,
            Err(e) => {
                return LocalOutcome::Unavailable {
                    error: e.to_string(),
                }
            }
        };

        let limit = Duration::from_secs(self.settings.launch_timeout_secs);
        let mut step = LaunchStep::Pulling;
        let launched = tokio::time::timeout(limit, self.launch(docker, request, &mut step)).await;
        let timed_out = launched.is_err();

        let outcome = match launched {
            Ok(Ok(result)) => LocalOutcome::Running(result),
            Ok(Err(DeployError::EngineUnavailable(reason))) => {
                LocalOutcome::Unavailable { error: reason }
            }
            Ok(Err(e)) => {
                warn!(request_id = %request.id, error = %e, "Local deployment failed");
                LocalOutcome::Failed {
                    error: e.to_string(),
                }
            }
            Err(_) => {
                warn!(request_id = %request.id, "Local deployment timed out");
                LocalOutcome::Failed {
                    error: format!(
                        "container did not start within {}s",
                        self.settings.launch_timeout_secs
                    ),
                }
            }
        };

        if !outcome.is_running() && step.needs_cleanup(timed_out) {
            self.discard(&container_name(&request.id)).await;
        }
        outcome
    }

    /// Force-remove a container a failed launch left behind; the name frees
    /// up for a retry of the same request
    async fn discard(&self, name: &str) {
        match self.remove_container(name).await {
            Ok(()) => info!(container = name, "Removed container of failed launch"),
            Err(e) => warn!(container = name, error = %e, "Failed to remove container of failed launch"),
        }
    }

    async fn launch(
        &self,
        docker: &Docker,
        request: &DeploymentRequest,
        step: &mut LaunchStep,
    ) -> DeployResult<DeploymentResult> {
        let settings = &self.settings;
        self.pull_image(&settings.image, &settings.tag, None).await?;

        let name = container_name(&request.id);
        let port_key = port_key(settings.container_port);

        let mut exposed_ports = HashMap::new();
        exposed_ports.insert(port_key.clone(), HashMap::new());
        let mut port_bindings = HashMap::new();
        port_bindings.insert(
            port_key.clone(),
            Some(vec![PortBinding {
                host_ip: Some(settings.host_ip.clone()),
                host_port: None,
            }]),
        );

        let config = Config {
            image: Some(settings.image_ref()),
            env: Some(server_env(request)),
            labels: Some(server_labels(request)),
            exposed_ports: Some(exposed_ports),
            host_config: Some(HostConfig {
                port_bindings: Some(port_bindings),
                ..Default::default()
            }),
            ..Default::default()
        };
        let options = CreateContainerOptions {
            name: name.clone(),
            platform: None,
        };

        *step = LaunchStep::Creating;
        let created = docker
            .create_container(Some(options), config)
            .await
            .map_err(engine_error)?;
        *step = LaunchStep::Created;
        for warning in &created.warnings {
            warn!(container = %name, "{}", warning);
        }

        self.start_container(&created.id).await?;

        let inspect = docker
            .inspect_container(&created.id, None::<InspectContainerOptions>)
            .await
            .map_err(engine_error)?;
        let ports = inspect
            .network_settings
            .and_then(|network| network.ports)
            .unwrap_or_default();
        let host_port = assigned_host_port(&ports, &port_key).ok_or_else(|| {
            DeployError::Container(format!("no host port assigned to {}", port_key))
        })?;

        info!(container = %name, host_port, "Local server running");
        Ok(
            DeploymentResult::local(created.id, settings.advertised_address.clone(), host_port)
                .with_message(format!("Container {} started", name)),
        )
    }
}

#[async_trait]
impl LocalRuntime for ContainerRuntimeClient {
    async fn create_server_container(&self, request: &DeploymentRequest) -> LocalOutcome {
        ContainerRuntimeClient::create_server_container(self, request).await
    }
}

/// Transport failures mean the engine is gone; anything the engine answered
/// is a container error
fn engine_error(err: bollard::errors::Error) -> DeployError {
    if is_transport_error(&err) {
        DeployError::EngineUnavailable(err.to_string())
    } else {
        DeployError::Container(err.to_string())
    }
}

fn is_transport_error(err: &bollard::errors::Error) -> bool {
    use bollard::errors::Error;

    matches!(
        err,
        Error::IOError { .. }
            | Error::HyperLegacyError { .. }
            | Error::HyperResponseError { .. }
            | Error::SocketNotFoundError(_)
            | Error::RequestTimeoutError
    )
}

fn log_text(output: LogOutput) -> String {
    String::from_utf8_lossy(&output.into_bytes()).into_owned()
}

/// Container name for a request id, restricted to characters the engine accepts
pub fn container_name(request_id: &str) -> String {
    let id: String = request_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-' {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    format!("{}{}", NAME_PREFIX, id)
}

fn port_key(container_port: u16) -> String {
    format!("{}/tcp", container_port)
}

/// Environment understood by the server image
pub fn server_env(request: &DeploymentRequest) -> Vec<String> {
    let server = &request.server;
    let version = server
        .version
        .as_deref()
        .filter(|v| !v.eq_ignore_ascii_case("latest"))
        .unwrap_or("LATEST");

    let mut env = vec![
        "EULA=TRUE".to_string(),
        format!("TYPE={}", server.server_type.image_type()),
        format!("VERSION={}", version),
        format!("MEMORY={}", server.memory.as_deref().unwrap_or("2G")),
        format!("MAX_PLAYERS={}", server.max_players.unwrap_or(20)),
        format!("MODE={}", server.gamemode.unwrap_or_default().as_str()),
        format!("DIFFICULTY={}", server.difficulty.unwrap_or_default().as_str()),
        format!("MOTD=Mineclifford {}", request.name),
    ];
    if let Some(tz) = &server.timezone {
        env.push(format!("TZ={}", tz));
    }
    if let Some(password) = &server.rcon_password {
        env.push("ENABLE_RCON=true".to_string());
        env.push(format!("RCON_PASSWORD={}", password));
    }
    env
}

pub fn server_labels(request: &DeploymentRequest) -> HashMap<String, String> {
    let mut labels = HashMap::new();
    labels.insert(SERVER_LABEL.to_string(), "true".to_string());
    labels.insert("mineclifford.request_id".to_string(), request.id.clone());
    labels.insert("mineclifford.name".to_string(), request.name.clone());
    labels
}

/// First non-zero host port bound to `key` in an inspect port map
pub fn assigned_host_port(
    ports: &HashMap<String, Option<Vec<PortBinding>>>,
    key: &str,
) -> Option<u16> {
    ports
        .get(key)?
        .as_ref()?
        .iter()
        .filter_map(|binding| binding.host_port.as_deref())
        .filter_map(|port| port.parse::<u16>().ok())
        .find(|port| *port > 0)
}
