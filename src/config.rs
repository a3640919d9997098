use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::provisioning::InstanceIpKeys;

/// Local container settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerSettings {
    pub image: String,
    pub tag: String,
    /// Port the server listens on inside the container
    pub container_port: u16,
    /// Host interface the dynamic port is bound on
    pub host_ip: String,
    /// Address reported back to the caller
    pub advertised_address: String,
    pub stop_timeout_secs: i64,
    pub log_tail: usize,
    /// Upper bound for pull, create and start of a local server
    pub launch_timeout_secs: u64,
}

impl Default for ContainerSettings {
    fn default() -> Self {
        Self {
            image: "itzg/minecraft-server".into(),
            tag: "latest".into(),
            container_port: 25565,
            host_ip: "0.0.0.0".into(),
            advertised_address: "127.0.0.1".into(),
            stop_timeout_secs: 10,
            log_tail: 100,
            launch_timeout_secs: 300,
        }
    }
}

impl ContainerSettings {
    pub fn image_ref(&self) -> String {
        format!("{}:{}", self.image, self.tag)
    }
}

/// Deployer configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeployerConfig {
    /// Repository holding the terraform and ansible trees
    pub project_root: PathBuf,
    pub terraform_bin: String,
    pub ansible_bin: String,
    pub ansible_playbook_bin: String,
    /// Defaults to `<project_root>/terraform`
    pub terraform_dir: Option<PathBuf>,
    /// Defaults to `<project_root>/deployment/ansible`
    pub ansible_dir: Option<PathBuf>,
    /// Inventory written by provisioning; defaults to `<project_root>/static_ip.ini`
    pub inventory: Option<PathBuf>,
    /// Playbook file inside the ansible dir
    pub playbook: String,
    /// Where rendered variable files go; defaults to the system temp dir
    pub vars_dir: Option<PathBuf>,
    pub plan_file: String,
    /// Output names searched for instance addresses, in order
    pub ip_output_keys: InstanceIpKeys,
    /// Game port reported for cloud deployments
    pub server_port: u16,
    /// Capacity of every event channel
    pub event_buffer: usize,
    /// Fail configuration when the connectivity probe fails
    pub require_reachable_hosts: bool,
    /// Seconds between SIGTERM and SIGKILL on cancellation
    pub terminate_grace_secs: u64,
    pub container: ContainerSettings,
}

impl Default for DeployerConfig {
    fn default() -> Self {
        Self {
            project_root: PathBuf::from("."),
            terraform_bin: "terraform".into(),
            ansible_bin: "ansible".into(),
            ansible_playbook_bin: "ansible-playbook".into(),
            terraform_dir: None,
            ansible_dir: None,
            inventory: None,
            playbook: "swarm_setup.yml".into(),
            vars_dir: None,
            plan_file: "tfplan".into(),
            ip_output_keys: InstanceIpKeys::default(),
            server_port: 25565,
            event_buffer: 64,
            require_reachable_hosts: true,
            terminate_grace_secs: 5,
            container: ContainerSettings::default(),
        }
    }
}

impl DeployerConfig {
    /// Default config file location
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("mineclifford").join("config.json"))
    }

    /// Load from a JSON file; a missing file gives the defaults.
    ///
    /// Settings may sit at the top level or under a `"deployer"` key.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let value: serde_json::Value = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;

        let section = value.get("deployer").cloned().unwrap_or(value);
        serde_json::from_value(section).context("Failed to parse deployer config")
    }

    pub fn terraform_dir(&self) -> PathBuf {
        self.terraform_dir
            .clone()
            .unwrap_or_else(|| self.project_root.join("terraform"))
    }

    pub fn ansible_dir(&self) -> PathBuf {
        self.ansible_dir
            .clone()
            .unwrap_or_else(|| self.project_root.join("deployment").join("ansible"))
    }

    pub fn inventory(&self) -> PathBuf {
        self.inventory
            .clone()
            .unwrap_or_else(|| self.project_root.join("static_ip.ini"))
    }

    pub fn vars_dir(&self) -> PathBuf {
        self.vars_dir.clone().unwrap_or_else(std::env::temp_dir)
    }

    pub fn terminate_grace(&self) -> Duration {
        Duration::from_secs(self.terminate_grace_secs)
    }
}
