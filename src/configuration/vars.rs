use std::path::Path;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::deploy::DeploymentRequest;
use crate::error::{DeployError, DeployResult};

const DEFAULT_VERSION: &str = "latest";
const DEFAULT_MEMORY: &str = "2G";
const DEFAULT_MAX_PLAYERS: u32 = 20;
const DEFAULT_TIMEZONE: &str = "America/Sao_Paulo";

/// Variables document handed to the swarm playbook
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaybookVars {
    pub minecraft_java_version: String,
    pub minecraft_java_memory: String,
    pub minecraft_java_gamemode: String,
    pub minecraft_java_difficulty: String,
    pub minecraft_java_motd: String,
    pub minecraft_java_max_players: u32,
    pub minecraft_java_allow_nether: bool,
    pub minecraft_java_enable_command_block: bool,
    pub minecraft_java_spawn_protection: u32,
    pub minecraft_java_view_distance: u32,

    pub minecraft_bedrock_enabled: bool,
    pub minecraft_bedrock_version: String,
    pub minecraft_bedrock_memory: String,
    pub minecraft_bedrock_gamemode: String,
    pub minecraft_bedrock_difficulty: String,
    pub minecraft_bedrock_server_name: String,
    pub minecraft_bedrock_allow_cheats: bool,

    pub rcon_password: String,
    pub grafana_password: String,
    pub timezone: String,

    pub server_names: Vec<String>,
    /// True when the swarm has exactly one node
    pub single_node_swarm: bool,
}

fn generated_password() -> String {
    Uuid::new_v4().simple().to_string()
}

impl PlaybookVars {
    /// Translate a request into playbook variable names, filling defaults
    pub fn from_request(request: &DeploymentRequest) -> Self {
        let server = &request.server;
        let version = server
            .version
            .clone()
            .unwrap_or_else(|| DEFAULT_VERSION.to_string());
        let gamemode = server.gamemode.unwrap_or_default().as_str().to_string();
        let difficulty = server.difficulty.unwrap_or_default().as_str().to_string();

        Self {
            minecraft_java_version: version.clone(),
            minecraft_java_memory: server
                .memory
                .clone()
                .unwrap_or_else(|| DEFAULT_MEMORY.to_string()),
            minecraft_java_gamemode: gamemode.clone(),
            minecraft_java_difficulty: difficulty.clone(),
            minecraft_java_motd: format!("Mineclifford {}", request.name),
            minecraft_java_max_players: server.max_players.unwrap_or(DEFAULT_MAX_PLAYERS),
            minecraft_java_allow_nether: true,
            minecraft_java_enable_command_block: true,
            minecraft_java_spawn_protection: 0,
            minecraft_java_view_distance: 10,

            minecraft_bedrock_enabled: server.enable_bedrock,
            minecraft_bedrock_version: version,
            minecraft_bedrock_memory: "1G".into(),
            minecraft_bedrock_gamemode: gamemode,
            minecraft_bedrock_difficulty: difficulty,
            minecraft_bedrock_server_name: format!("Mineclifford {}", request.name),
            minecraft_bedrock_allow_cheats: false,

            rcon_password: server
                .rcon_password
                .clone()
                .unwrap_or_else(generated_password),
            grafana_password: server
                .grafana_password
                .clone()
                .unwrap_or_else(generated_password),
            timezone: server
                .timezone
                .clone()
                .unwrap_or_else(|| DEFAULT_TIMEZONE.to_string()),

            server_names: request.server_names.clone(),
            single_node_swarm: request.is_single_node(),
        }
    }

    pub fn to_yaml(&self) -> DeployResult<String> {
        serde_yaml::to_string(self).map_err(|e| DeployError::parse("playbook variables", e))
    }

    pub async fn write_to(&self, path: &Path) -> DeployResult<()> {
        tokio::fs::write(path, self.to_yaml()?).await?;
        Ok(())
    }
}
