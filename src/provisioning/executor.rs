use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::{InstanceIpKeys, ProvisioningOutputs};
use crate::config::DeployerConfig;
use crate::deploy::{OrchestrationMode, ProgressEvent, ProvisioningEvent, ProvisioningStatus};
use crate::error::DeployResult;
use crate::runner::{emit, stream_stage, CommandRunner, CommandSpec, OutputLines};

/// Which infra tree a run works against
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProvisioningTarget {
    pub provider: String,
    pub orchestration: OrchestrationMode,
}

impl ProvisioningTarget {
    pub fn new(provider: impl Into<String>, orchestration: OrchestrationMode) -> Self {
        Self {
            provider: provider.into(),
            orchestration,
        }
    }
}

/// Variables handed to plan/destroy
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProvisioningVars {
    pub server_names: Vec<String>,
    pub extra: BTreeMap<String, Value>,
}

impl ProvisioningVars {
    pub fn new(server_names: Vec<String>) -> Self {
        Self {
            server_names,
            extra: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_extra(mut self, extra: BTreeMap<String, Value>) -> Self {
        self.extra = extra;
        self
    }

    /// `-var name=value` pairs; `server_names` always comes first
    fn to_args(&self) -> Vec<String> {
        let mut args = vec![
            "-var".to_string(),
            var_assignment("server_names", &Value::from(self.server_names.clone())),
        ];
        for (name, value) in &self.extra {
            args.push("-var".into());
            args.push(var_assignment(name, value));
        }
        args
    }
}

/// Lists and maps travel as JSON text; scalars as their literal
fn var_assignment(name: &str, value: &Value) -> String {
    let rendered = match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    };
    format!("{}={}", name, rendered)
}

/// Drives the infra tool's init -> plan -> apply -> output lifecycle
pub struct ProvisioningExecutor {
    runner: Arc<dyn CommandRunner>,
    terraform_bin: String,
    terraform_dir: PathBuf,
    plan_file: String,
    ip_keys: InstanceIpKeys,
}

impl ProvisioningExecutor {
    pub fn new(runner: Arc<dyn CommandRunner>, config: &DeployerConfig) -> Self {
        Self {
            runner,
            terraform_bin: config.terraform_bin.clone(),
            terraform_dir: config.terraform_dir(),
            plan_file: config.plan_file.clone(),
            ip_keys: config.ip_output_keys.clone(),
        }
    }

    /// Working directory for a provider/mode pair
    pub fn working_dir(&self, target: &ProvisioningTarget) -> PathBuf {
        let base = self.terraform_dir.join(&target.provider);
        match target.orchestration {
            OrchestrationMode::Kubernetes => base.join("kubernetes"),
            OrchestrationMode::Swarm => base,
        }
    }

    fn command(&self, target: &ProvisioningTarget) -> CommandSpec {
        CommandSpec::new(&self.terraform_bin)
            .cwd(self.working_dir(target))
            .env("TF_IN_AUTOMATION", "1")
    }

    pub fn init_command(&self, target: &ProvisioningTarget) -> CommandSpec {
        self.command(target).args(["init", "-no-color"])
    }

    pub fn plan_command(&self, target: &ProvisioningTarget, vars: &ProvisioningVars) -> CommandSpec {
        self.command(target)
            .args(["plan", "-no-color"])
            .arg(format!("-out={}", self.plan_file))
            .args(vars.to_args())
    }

    pub fn apply_command(&self, target: &ProvisioningTarget) -> CommandSpec {
        self.command(target)
            .args(["apply", "-no-color", "-auto-approve"])
            .arg(&self.plan_file)
    }

    pub fn destroy_command(&self, target: &ProvisioningTarget, vars: &ProvisioningVars) -> CommandSpec {
        self.command(target)
            .args(["destroy", "-no-color", "-auto-approve"])
            .args(vars.to_args())
    }

    /// The JSON document is read from stdout alone; warnings on stderr are logged
    pub fn output_command(&self, target: &ProvisioningTarget) -> CommandSpec {
        self.command(target).args(["output", "-json"]).stdout_only()
    }

    pub fn init(&self, target: &ProvisioningTarget, cancel: CancellationToken) -> DeployResult<OutputLines> {
        self.runner.spawn(&self.init_command(target), cancel)
    }

    pub fn plan(
        &self,
        target: &ProvisioningTarget,
        vars: &ProvisioningVars,
        cancel: CancellationToken,
    ) -> DeployResult<OutputLines> {
        self.runner.spawn(&self.plan_command(target, vars), cancel)
    }

    pub fn apply(&self, target: &ProvisioningTarget, cancel: CancellationToken) -> DeployResult<OutputLines> {
        self.runner.spawn(&self.apply_command(target), cancel)
    }

    pub fn destroy(
        &self,
        target: &ProvisioningTarget,
        vars: &ProvisioningVars,
        cancel: CancellationToken,
    ) -> DeployResult<OutputLines> {
        self.runner.spawn(&self.destroy_command(target, vars), cancel)
    }

    /// Run `output -json` and parse the result
    pub async fn outputs(
        &self,
        target: &ProvisioningTarget,
        cancel: CancellationToken,
    ) -> DeployResult<ProvisioningOutputs> {
        let lines = self
            .runner
            .spawn(&self.output_command(target), cancel)?
            .collect_lines()
            .await?;
        ProvisioningOutputs::from_json(&lines.join("\n"))
    }

    /// Instance addresses found in `outputs` under the configured names
    pub fn extract_instance_ips(&self, outputs: &ProvisioningOutputs) -> BTreeMap<String, String> {
        self.ip_keys.extract(outputs)
    }

    /// init -> plan -> apply -> output as one staged pipeline.
    ///
    /// Emits a starting event before each stage and one event per output
    /// line. Ends with exactly one SUCCESS (carrying the outputs) or one
    /// ERROR event; stages after a failure never run.
    pub async fn deploy_full(
        &self,
        target: &ProvisioningTarget,
        vars: &ProvisioningVars,
        events: mpsc::Sender<ProvisioningEvent>,
        cancel: CancellationToken,
    ) -> DeployResult<ProvisioningOutputs> {
        info!(provider = %target.provider, mode = target.orchestration.as_str(), "Starting provisioning");
        let mut logs = Vec::new();
        let result = self.run_deploy(target, vars, &mut logs, &events, &cancel).await;
        self.finish(result, "Infrastructure deployed successfully", logs, &events, &cancel)
            .await
    }

    async fn run_deploy(
        &self,
        target: &ProvisioningTarget,
        vars: &ProvisioningVars,
        logs: &mut Vec<String>,
        events: &mpsc::Sender<ProvisioningEvent>,
        cancel: &CancellationToken,
    ) -> DeployResult<ProvisioningOutputs> {
        let stages = [
            (ProvisioningStatus::Initializing, "Initializing Terraform...", self.init_command(target)),
            (ProvisioningStatus::Planning, "Creating execution plan...", self.plan_command(target, vars)),
            (ProvisioningStatus::Applying, "Applying infrastructure changes...", self.apply_command(target)),
        ];

        for (status, message, spec) in stages {
            logs.clear();
            emit(events, ProgressEvent::new(status, message), cancel).await?;
            stream_stage(self.runner.as_ref(), &spec, status, logs, events, cancel).await?;
        }

        logs.clear();
        self.outputs(target, cancel.clone()).await
    }

    /// init -> destroy, reported the same way as [`Self::deploy_full`].
    ///
    /// Nothing is rolled back on failure; the tool's own state decides what
    /// a retry will do.
    pub async fn destroy_full(
        &self,
        target: &ProvisioningTarget,
        vars: &ProvisioningVars,
        events: mpsc::Sender<ProvisioningEvent>,
        cancel: CancellationToken,
    ) -> DeployResult<ProvisioningOutputs> {
        info!(provider = %target.provider, mode = target.orchestration.as_str(), "Starting destroy");
        let mut logs = Vec::new();
        let result = self
            .run_destroy(target, vars, &mut logs, &events, &cancel)
            .await
            .map(|()| ProvisioningOutputs::default());
        self.finish(result, "Infrastructure destroyed", logs, &events, &cancel)
            .await
    }

    async fn run_destroy(
        &self,
        target: &ProvisioningTarget,
        vars: &ProvisioningVars,
        logs: &mut Vec<String>,
        events: &mpsc::Sender<ProvisioningEvent>,
        cancel: &CancellationToken,
    ) -> DeployResult<()> {
        let stages = [
            (ProvisioningStatus::Initializing, "Initializing Terraform...", self.init_command(target)),
            (ProvisioningStatus::Destroying, "Destroying infrastructure...", self.destroy_command(target, vars)),
        ];

        for (status, message, spec) in stages {
            logs.clear();
            emit(events, ProgressEvent::new(status, message), cancel).await?;
            stream_stage(self.runner.as_ref(), &spec, status, logs, events, cancel).await?;
        }
        Ok(())
    }

    async fn finish(
        &self,
        result: DeployResult<ProvisioningOutputs>,
        success_message: &str,
        logs: Vec<String>,
        events: &mpsc::Sender<ProvisioningEvent>,
        cancel: &CancellationToken,
    ) -> DeployResult<ProvisioningOutputs> {
        match result {
            Ok(outputs) => {
                info!(outputs = outputs.len(), "{}", success_message);
                let event = ProgressEvent::new(ProvisioningStatus::Success, success_message)
                    .with_outputs(outputs.clone());
                emit(events, event, cancel).await?;
                Ok(outputs)
            }
            Err(e) => {
                error!(error = %e, "Provisioning failed");
                let event = ProgressEvent::failure(format!("Deployment failed: {}", e), e.to_string(), logs);
                // best effort: the receiver may be the reason we failed
                let _ = events.send(event).await;
                Err(e)
            }
        }
    }
}
