use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{DeployError, DeployResult};

/// ローカルのコンテナ経路を選ぶプロバイダ名
pub const LOCAL_PROVIDER: &str = "local";

/// プロビジョニングしたマシンのオーケストレーション方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OrchestrationMode {
    /// プロビジョニング後に playbook で構成する Docker Swarm
    #[default]
    Swarm,
    /// マネージドクラスタ (インフラツール自身が構成する)
    #[serde(alias = "k8s")]
    Kubernetes,
}

impl OrchestrationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Swarm => "swarm",
            Self::Kubernetes => "kubernetes",
        }
    }

    /// プロビジョニング後に構成 playbook が必要か
    pub fn needs_configuration(&self) -> bool {
        matches!(self, Self::Swarm)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ServerType {
    #[default]
    Vanilla,
    Paper,
    Spigot,
    Forge,
    Fabric,
}

impl ServerType {
    /// サーバーイメージの `TYPE` 変数に渡す値
    pub fn image_type(&self) -> &'static str {
        match self {
            Self::Vanilla => "VANILLA",
            Self::Paper => "PAPER",
            Self::Spigot => "SPIGOT",
            Self::Forge => "FORGE",
            Self::Fabric => "FABRIC",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum GameMode {
    #[default]
    Survival,
    Creative,
    Adventure,
    Spectator,
}

impl GameMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Survival => "survival",
            Self::Creative => "creative",
            Self::Adventure => "adventure",
            Self::Spectator => "spectator",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Difficulty {
    Peaceful,
    Easy,
    #[default]
    Normal,
    Hard,
}

impl Difficulty {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Peaceful => "peaceful",
            Self::Easy => "easy",
            Self::Normal => "normal",
            Self::Hard => "hard",
        }
    }
}

/// サーバーごとの設定 (未指定の項目は描画時にデフォルト値)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default)]
    pub server_type: ServerType,
    /// Minecraft のバージョン (未指定なら "latest")
    #[serde(default)]
    pub version: Option<String>,
    /// JVM のメモリサイズ (例: "2G")
    #[serde(default)]
    pub memory: Option<String>,
    #[serde(default)]
    pub max_players: Option<u32>,
    #[serde(default)]
    pub gamemode: Option<GameMode>,
    #[serde(default)]
    pub difficulty: Option<Difficulty>,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub enable_bedrock: bool,
    #[serde(default)]
    pub rcon_password: Option<String>,
    #[serde(default)]
    pub grafana_password: Option<String>,
}

/// Minecraft サーバー群のデプロイ要求
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentRequest {
    #[serde(default = "generate_request_id")]
    pub id: String,
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub orchestration: OrchestrationMode,
    /// インスタンス名 (順序あり、1 つ以上、重複なし)
    pub server_names: Vec<String>,
    #[serde(default)]
    pub server: ServerSettings,
    /// plan/destroy に渡す追加変数
    #[serde(default)]
    pub provisioning_vars: BTreeMap<String, serde_json::Value>,
    /// playbook への追加指定 (`-e key=value`)
    #[serde(default)]
    pub playbook_vars: BTreeMap<String, String>,
}

fn generate_request_id() -> String {
    let uuid = Uuid::new_v4().simple().to_string();
    format!("deploy-{}", &uuid[..8])
}

fn default_name() -> String {
    "Server".into()
}

fn default_provider() -> String {
    LOCAL_PROVIDER.into()
}

impl DeploymentRequest {
    /// ID を生成し、デフォルト設定で要求を作成
    pub fn new(
        provider: impl Into<String>,
        orchestration: OrchestrationMode,
        server_names: Vec<String>,
    ) -> Self {
        Self {
            id: generate_request_id(),
            name: default_name(),
            provider: provider.into(),
            orchestration,
            server_names,
            server: ServerSettings::default(),
            provisioning_vars: BTreeMap::new(),
            playbook_vars: BTreeMap::new(),
        }
    }

    pub fn is_local(&self) -> bool {
        self.provider.eq_ignore_ascii_case(LOCAL_PROVIDER)
    }

    /// サーバーが 1 台ならシングルノードの swarm
    pub fn is_single_node(&self) -> bool {
        self.server_names.len() == 1
    }

    /// パイプラインが前提とする条件を検証
    pub fn validate(&self) -> DeployResult<()> {
        if self.id.trim().is_empty() {
            return Err(DeployError::InvalidRequest("request id is empty".into()));
        }
        if self.provider.trim().is_empty() {
            return Err(DeployError::InvalidRequest("provider is empty".into()));
        }
        if self.server_names.is_empty() {
            return Err(DeployError::InvalidRequest(
                "at least one server name is required".into(),
            ));
        }

        let mut seen = HashSet::new();
        for name in &self.server_names {
            if name.trim().is_empty() {
                return Err(DeployError::InvalidRequest("server name is blank".into()));
            }
            if !seen.insert(name.as_str()) {
                return Err(DeployError::InvalidRequest(format!(
                    "duplicate server name: {}",
                    name
                )));
            }
        }

        if let Some(max_players) = self.server.max_players {
            if !(1..=1000).contains(&max_players) {
                return Err(DeployError::InvalidRequest(format!(
                    "max_players must be between 1 and 1000, got {}",
                    max_players
                )));
            }
        }

        Ok(())
    }
}
