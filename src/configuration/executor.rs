use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::PlaybookVars;
use crate::config::DeployerConfig;
use crate::deploy::{ConfigurationEvent, ConfigurationStatus, DeploymentRequest, ProgressEvent};
use crate::error::{DeployError, DeployResult};
use crate::runner::{emit, stream_stage, CommandRunner, CommandSpec};

/// Renders playbook variables, probes hosts and runs the swarm playbook
pub struct ConfigurationExecutor {
    runner: Arc<dyn CommandRunner>,
    ansible_bin: String,
    ansible_playbook_bin: String,
    ansible_dir: PathBuf,
    playbook: String,
    inventory: PathBuf,
    vars_dir: PathBuf,
    require_reachable_hosts: bool,
}

impl ConfigurationExecutor {
    pub fn new(runner: Arc<dyn CommandRunner>, config: &DeployerConfig) -> Self {
        Self {
            runner,
            ansible_bin: config.ansible_bin.clone(),
            ansible_playbook_bin: config.ansible_playbook_bin.clone(),
            ansible_dir: config.ansible_dir(),
            playbook: config.playbook.clone(),
            inventory: config.inventory(),
            vars_dir: config.vars_dir(),
            require_reachable_hosts: config.require_reachable_hosts,
        }
    }

    /// Inventory used when the caller does not name one
    pub fn default_inventory(&self) -> &Path {
        &self.inventory
    }

    /// Transient variables file for a request
    pub fn vars_path(&self, request_id: &str) -> PathBuf {
        let safe_id: String = request_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.vars_dir.join(format!("minecraft_vars_{}.yml", safe_id))
    }

    /// Render and write the variables document, returning its path
    pub async fn write_vars(&self, request: &DeploymentRequest) -> DeployResult<PathBuf> {
        tokio::fs::create_dir_all(&self.vars_dir).await?;
        let path = self.vars_path(&request.id);
        PlaybookVars::from_request(request).write_to(&path).await?;
        Ok(path)
    }

    fn command(&self, program: &str) -> CommandSpec {
        CommandSpec::new(program)
            .cwd(&self.ansible_dir)
            .env("ANSIBLE_HOST_KEY_CHECKING", "False")
            .env("ANSIBLE_FORCE_COLOR", "true")
            .env("PYTHONIOENCODING", "utf-8")
    }

    /// One ping against every host in the inventory
    pub fn connectivity_command(&self, inventory: &Path) -> CommandSpec {
        self.command(&self.ansible_bin)
            .arg("-i")
            .arg(inventory.display().to_string())
            .args(["all", "-m", "ping"])
    }

    pub fn playbook_command(
        &self,
        inventory: &Path,
        vars_file: &Path,
        extra_vars: &BTreeMap<String, String>,
    ) -> CommandSpec {
        let mut spec = self
            .command(&self.ansible_playbook_bin)
            .arg("-i")
            .arg(inventory.display().to_string())
            .arg(self.ansible_dir.join(&self.playbook).display().to_string())
            .arg("-e")
            .arg(format!("@{}", vars_file.display()));
        for (key, value) in extra_vars {
            spec = spec.arg("-e").arg(format!("{}={}", key, value));
        }
        spec
    }

    /// Configure the swarm on hosts listed in `inventory` (or the default).
    ///
    /// The inventory has to exist already; it is a provisioning byproduct.
    /// On success the variables file is removed, on failure it is kept for
    /// inspection. Exactly one SUCCESS or ERROR event ends the stream.
    pub async fn deploy_swarm(
        &self,
        request: &DeploymentRequest,
        inventory: Option<&Path>,
        events: mpsc::Sender<ConfigurationEvent>,
        cancel: CancellationToken,
    ) -> DeployResult<()> {
        let inventory = inventory.unwrap_or(self.inventory.as_path());
        info!(request_id = %request.id, inventory = %inventory.display(), "Starting configuration");

        let mut logs = Vec::new();
        let mut vars_file = None;
        let result = self
            .run_swarm(request, inventory, &mut vars_file, &mut logs, &events, &cancel)
            .await;

        match result {
            Ok(()) => {
                if let Some(path) = vars_file {
                    if let Err(e) = tokio::fs::remove_file(&path).await {
                        warn!(path = %path.display(), error = %e, "Failed to remove vars file");
                    }
                }
                let event = ProgressEvent::new(
                    ConfigurationStatus::Success,
                    "Ansible deployment completed successfully",
                );
                emit(&events, event, &cancel).await
            }
            Err(e) => {
                error!(request_id = %request.id, error = %e, "Configuration failed");
                let message = match &e {
                    DeployError::MissingPrerequisite(reason) => reason.clone(),
                    other => format!("Ansible deployment failed: {}", other),
                };
                let _ = events
                    .send(ProgressEvent::failure(message, e.to_string(), logs))
                    .await;
                Err(e)
            }
        }
    }

    async fn run_swarm(
        &self,
        request: &DeploymentRequest,
        inventory: &Path,
        vars_file: &mut Option<PathBuf>,
        logs: &mut Vec<String>,
        events: &mpsc::Sender<ConfigurationEvent>,
        cancel: &CancellationToken,
    ) -> DeployResult<()> {
        if !tokio::fs::try_exists(inventory).await.unwrap_or(false) {
            return Err(DeployError::MissingPrerequisite(format!(
                "Inventory file not found: {}. Provisioning must run first to generate the inventory.",
                inventory.display()
            )));
        }

        let preparing = ConfigurationStatus::Preparing;
        emit(events, ProgressEvent::new(preparing, "Preparing Ansible variables..."), cancel).await?;
        let path = self.write_vars(request).await?;
        *vars_file = Some(path.clone());

        emit(events, ProgressEvent::new(preparing, "Testing connectivity to hosts..."), cancel).await?;
        let probe = self.connectivity_command(inventory);
        match stream_stage(self.runner.as_ref(), &probe, preparing, logs, events, cancel).await {
            Ok(()) => {}
            Err(DeployError::ExternalCommand { code, .. }) if !self.require_reachable_hosts => {
                warn!(code, "Connectivity check failed, continuing");
            }
            Err(e) => return Err(e),
        }

        logs.clear();
        let running = ConfigurationStatus::Running;
        emit(events, ProgressEvent::new(running, "Executing Ansible playbook..."), cancel).await?;
        let playbook = self.playbook_command(inventory, &path, &request.playbook_vars);
        stream_stage(self.runner.as_ref(), &playbook, running, logs, events, cancel).await
    }
}
