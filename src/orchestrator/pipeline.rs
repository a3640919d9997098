use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{error, info, warn};

use super::WorkdirLocks;
use crate::config::DeployerConfig;
use crate::configuration::ConfigurationExecutor;
use crate::container::{LocalOutcome, LocalRuntime};
use crate::deploy::{
    DeploymentRequest, DeploymentResult, ErrorEvent, PipelineEvent, ProgressEvent, Stage,
    StageStatus,
};
use crate::error::{DeployError, DeployResult};
use crate::provisioning::{ProvisioningExecutor, ProvisioningOutputs, ProvisioningTarget, ProvisioningVars};

/// What `deploy` started
pub enum Deployment {
    /// Local runs finish before `deploy` returns
    Local(LocalOutcome),
    /// Cloud runs stream their progress through the handle
    Cloud(DeploymentHandle),
}

/// Consumer side of a running cloud pipeline. Dropping it cancels the run.
pub struct DeploymentHandle {
    id: String,
    events: mpsc::Receiver<PipelineEvent>,
    cancel: CancellationToken,
    _cancel_on_drop: DropGuard,
}

impl DeploymentHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Next event; `None` once the terminal event has been delivered
    pub async fn next_event(&mut self) -> Option<PipelineEvent> {
        self.events.recv().await
    }

    /// Stop the run; the running tool's process group is terminated
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Drain every remaining event
    pub async fn collect(mut self) -> Vec<PipelineEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.events.recv().await {
            events.push(event);
        }
        events
    }
}

#[derive(Debug, Clone, Copy)]
enum RunKind {
    Deploy,
    Destroy,
}

struct Inner {
    provisioning: ProvisioningExecutor,
    configuration: ConfigurationExecutor,
    local: Arc<dyn LocalRuntime>,
    locks: WorkdirLocks,
    shutdown: CancellationToken,
    server_port: u16,
    event_buffer: usize,
}

/// Routes requests to the local runtime or the provision/configure pipeline
#[derive(Clone)]
pub struct DeploymentOrchestrator {
    inner: Arc<Inner>,
}

impl DeploymentOrchestrator {
    pub fn new(
        provisioning: ProvisioningExecutor,
        configuration: ConfigurationExecutor,
        local: Arc<dyn LocalRuntime>,
        config: &DeployerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                provisioning,
                configuration,
                local,
                locks: WorkdirLocks::new(),
                shutdown: CancellationToken::new(),
                server_port: config.server_port,
                event_buffer: config.event_buffer.max(1),
            }),
        }
    }

    /// Start a deployment.
    ///
    /// Invalid requests and a shut-down orchestrator are the only errors;
    /// everything that goes wrong later is reported as a value or an event.
    pub async fn deploy(&self, request: DeploymentRequest) -> DeployResult<Deployment> {
        self.admit(&request)?;

        if request.is_local() {
            info!(request_id = %request.id, "Starting local deployment");
            let outcome = self.inner.local.create_server_container(&request).await;
            return Ok(Deployment::Local(outcome));
        }

        Ok(Deployment::Cloud(self.spawn_run(RunKind::Deploy, request)))
    }

    /// Tear down the infrastructure of a cloud deployment
    pub fn destroy(&self, request: DeploymentRequest) -> DeployResult<DeploymentHandle> {
        self.admit(&request)?;
        if request.is_local() {
            return Err(DeployError::InvalidRequest(
                "local deployments are removed through the container client".into(),
            ));
        }
        Ok(self.spawn_run(RunKind::Destroy, request))
    }

    /// Cancel every run in flight and refuse new ones
    pub fn shutdown(&self) {
        info!("Shutting down orchestrator");
        self.inner.shutdown.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    fn admit(&self, request: &DeploymentRequest) -> DeployResult<()> {
        if self.is_shut_down() {
            return Err(DeployError::ShuttingDown);
        }
        request.validate()
    }

    fn spawn_run(&self, kind: RunKind, request: DeploymentRequest) -> DeploymentHandle {
        let cancel = self.inner.shutdown.child_token();
        let (tx, rx) = mpsc::channel(self.inner.event_buffer);

        let inner = self.inner.clone();
        let run_cancel = cancel.clone();
        let id = request.id.clone();
        tokio::spawn(async move {
            inner.run(kind, request, tx, run_cancel).await;
        });

        DeploymentHandle {
            id,
            events: rx,
            _cancel_on_drop: cancel.clone().drop_guard(),
            cancel,
        }
    }
}

impl Inner {
    async fn run(
        &self,
        kind: RunKind,
        request: DeploymentRequest,
        tx: mpsc::Sender<PipelineEvent>,
        cancel: CancellationToken,
    ) {
        let _workdir = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                warn!(request_id = %request.id, "Cancelled while waiting for working directory");
                let err = DeployError::Cancelled;
                let event = ErrorEvent::new(Stage::Provisioning, "Deployment cancelled", err.to_string());
                let _ = tx.send(PipelineEvent::Error(event)).await;
                return;
            }
            guard = self.locks.acquire(&request.provider, request.orchestration) => guard,
        };

        info!(
            request_id = %request.id,
            provider = %request.provider,
            mode = request.orchestration.as_str(),
            ?kind,
            "Pipeline started"
        );
        let outcome = match kind {
            RunKind::Deploy => self.deploy(&request, &tx, &cancel).await,
            RunKind::Destroy => self.destroy(&request, &tx, &cancel).await,
        };

        let terminal = match outcome {
            Ok(result) => {
                info!(request_id = %request.id, ip = %result.ip_address, "Pipeline complete");
                PipelineEvent::Complete(result)
            }
            Err(failure) => {
                error!(
                    request_id = %request.id,
                    stage = failure.failed_stage.as_str(),
                    error = %failure.error,
                    "Pipeline failed"
                );
                PipelineEvent::Error(failure)
            }
        };
        let _ = tx.send(terminal).await;
    }

    async fn deploy(
        &self,
        request: &DeploymentRequest,
        tx: &mpsc::Sender<PipelineEvent>,
        cancel: &CancellationToken,
    ) -> Result<DeploymentResult, ErrorEvent> {
        let target = target(request);
        let vars = vars(request);
        let (events, receiver) = mpsc::channel(self.event_buffer);
        let run = self
            .provisioning
            .deploy_full(&target, &vars, events, cancel.clone());
        let forwarded = forward(receiver, tx, Stage::Provisioning, PipelineEvent::Provisioning, cancel);
        let (result, failure) = tokio::join!(run, forwarded);
        let outputs = stage_result(Stage::Provisioning, result, failure)?;

        let ips = self.provisioning.extract_instance_ips(&outputs);
        if ips.is_empty() {
            warn!(request_id = %request.id, "No instance addresses in provisioning outputs");
        }

        if request.orchestration.needs_configuration() {
            let (events, receiver) = mpsc::channel(self.event_buffer);
            let run = self
                .configuration
                .deploy_swarm(request, None, events, cancel.clone());
            let forwarded =
                forward(receiver, tx, Stage::Configuration, PipelineEvent::Configuration, cancel);
            let (result, failure) = tokio::join!(run, forwarded);
            stage_result(Stage::Configuration, result, failure)?;
        }

        Ok(DeploymentResult::cloud(
            request.orchestration.into(),
            ips,
            self.server_port,
        ))
    }

    async fn destroy(
        &self,
        request: &DeploymentRequest,
        tx: &mpsc::Sender<PipelineEvent>,
        cancel: &CancellationToken,
    ) -> Result<DeploymentResult, ErrorEvent> {
        let target = target(request);
        let vars = vars(request);
        let (events, receiver) = mpsc::channel(self.event_buffer);
        let run = self
            .provisioning
            .destroy_full(&target, &vars, events, cancel.clone());
        let forwarded = forward(receiver, tx, Stage::Provisioning, PipelineEvent::Provisioning, cancel);
        let (result, failure) = tokio::join!(run, forwarded);
        stage_result(Stage::Provisioning, result, failure)?;

        Ok(DeploymentResult::cloud(request.orchestration.into(), BTreeMap::new(), self.server_port)
            .with_message("Infrastructure destroyed"))
    }
}

fn target(request: &DeploymentRequest) -> ProvisioningTarget {
    ProvisioningTarget::new(request.provider.to_ascii_lowercase(), request.orchestration)
}

fn vars(request: &DeploymentRequest) -> ProvisioningVars {
    ProvisioningVars::new(request.server_names.clone()).with_extra(request.provisioning_vars.clone())
}

/// Relay stage events to the consumer. The stage's own ERROR event is held
/// back and returned so the run can end with a single terminal event.
async fn forward<S: StageStatus>(
    mut events: mpsc::Receiver<ProgressEvent<S>>,
    out: &mpsc::Sender<PipelineEvent>,
    stage: Stage,
    wrap: fn(ProgressEvent<S>) -> PipelineEvent,
    cancel: &CancellationToken,
) -> Option<ErrorEvent> {
    let mut failure = None;
    while let Some(event) = events.recv().await {
        if event.is_error() {
            failure = Some(ErrorEvent::from_progress(stage, event));
            continue;
        }
        if out.send(wrap(event)).await.is_err() {
            cancel.cancel();
            break;
        }
    }
    failure
}

fn stage_result<T>(
    stage: Stage,
    result: DeployResult<T>,
    failure: Option<ErrorEvent>,
) -> Result<T, ErrorEvent> {
    result.map_err(|e| {
        failure.unwrap_or_else(|| {
            ErrorEvent::new(stage, format!("{} failed: {}", stage.as_str(), e), e.to_string())
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::LocalOutcome;
    use crate::deploy::{
        ConfigurationStatus, DeploymentType, OrchestrationMode, ProvisioningStatus, UNKNOWN_ADDRESS,
    };
    use crate::runner::testing::ScriptedRunner;
    use async_trait::async_trait;
    use tempfile::TempDir;

    const OUTPUTS: &str =
        r#"{"instance_public_ips":{"value":{"i1":"1.2.3.4","i2":"5.6.7.8"},"type":"map","sensitive":false}}"#;

    struct FakeLocal(LocalOutcome);

    #[async_trait]
    impl LocalRuntime for FakeLocal {
        async fn create_server_container(&self, _request: &DeploymentRequest) -> LocalOutcome {
            self.0.clone()
        }
    }

    struct Fixture {
        _dir: TempDir,
        runner: Arc<ScriptedRunner>,
        orchestrator: DeploymentOrchestrator,
    }

    fn fixture(runner: ScriptedRunner, with_inventory: bool) -> Fixture {
        let dir = TempDir::new().unwrap();
        if with_inventory {
            std::fs::write(dir.path().join("static_ip.ini"), "[swarm]\n1.2.3.4\n5.6.7.8\n").unwrap();
        }
        let config = DeployerConfig {
            project_root: dir.path().to_path_buf(),
            vars_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        let runner = Arc::new(runner);
        let local = Arc::new(FakeLocal(LocalOutcome::Unavailable {
            error: "not used".into(),
        }));
        let orchestrator = DeploymentOrchestrator::new(
            ProvisioningExecutor::new(runner.clone(), &config),
            ConfigurationExecutor::new(runner.clone(), &config),
            local,
            &config,
        );
        Fixture {
            _dir: dir,
            runner,
            orchestrator,
        }
    }

    fn terraform_ok() -> ScriptedRunner {
        ScriptedRunner::new()
            .on("terraform init", &["Terraform has been successfully initialized!"], 0)
            .on("terraform plan", &["Plan: 2 to add, 0 to change, 0 to destroy."], 0)
            .on("terraform apply", &["aws_instance.i1: Creating...", "Apply complete!"], 0)
            .on("terraform output", &[OUTPUTS], 0)
            .on("terraform destroy", &["Destroy complete! Resources: 2 destroyed."], 0)
    }

    fn request(provider: &str, mode: OrchestrationMode) -> DeploymentRequest {
        DeploymentRequest::new(provider, mode, vec!["i1".into(), "i2".into()])
    }

    async fn run_cloud(orchestrator: &DeploymentOrchestrator, req: DeploymentRequest) -> Vec<PipelineEvent> {
        match orchestrator.deploy(req).await.unwrap() {
            Deployment::Cloud(handle) => handle.collect().await,
            Deployment::Local(_) => panic!("expected a cloud run"),
        }
    }

    fn provisioning_statuses(events: &[PipelineEvent]) -> Vec<ProvisioningStatus> {
        events
            .iter()
            .filter_map(|e| match e {
                PipelineEvent::Provisioning(p) => Some(p.status),
                _ => None,
            })
            .collect()
    }

    fn configuration_statuses(events: &[PipelineEvent]) -> Vec<ConfigurationStatus> {
        events
            .iter()
            .filter_map(|e| match e {
                PipelineEvent::Configuration(c) => Some(c.status),
                _ => None,
            })
            .collect()
    }

    fn dedup<T: PartialEq + Clone>(items: &[T]) -> Vec<T> {
        let mut out: Vec<T> = items.to_vec();
        out.dedup();
        out
    }

    fn assert_single_terminal_last(events: &[PipelineEvent]) {
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
        assert!(events.last().unwrap().is_terminal());
    }

    // ========================================
    // Cloud pipeline
    // ========================================

    #[tokio::test]
    async fn test_swarm_pipeline_end_to_end() {
        let f = fixture(terraform_ok().on("ansible", &["1.2.3.4 | SUCCESS"], 0), true);

        let events = run_cloud(&f.orchestrator, request("aws", OrchestrationMode::Swarm)).await;

        let provisioning = provisioning_statuses(&events);
        assert!(provisioning.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(
            dedup(&provisioning),
            vec![
                ProvisioningStatus::Initializing,
                ProvisioningStatus::Planning,
                ProvisioningStatus::Applying,
                ProvisioningStatus::Success,
            ]
        );
        let success = events
            .iter()
            .find_map(|e| match e {
                PipelineEvent::Provisioning(p) if p.status == ProvisioningStatus::Success => Some(p),
                _ => None,
            })
            .unwrap();
        assert!(success.outputs.as_ref().unwrap().contains("instance_public_ips"));

        assert_eq!(
            dedup(&configuration_statuses(&events)),
            vec![
                ConfigurationStatus::Preparing,
                ConfigurationStatus::Running,
                ConfigurationStatus::Success,
            ]
        );

        let first_config = events
            .iter()
            .position(|e| e.stage() == Stage::Configuration)
            .unwrap();
        assert!(events[..first_config]
            .iter()
            .all(|e| e.stage() == Stage::Provisioning));

        assert_single_terminal_last(&events);
        match events.last().unwrap() {
            PipelineEvent::Complete(result) => {
                assert!(["1.2.3.4", "5.6.7.8"].contains(&result.ip_address.as_str()));
                assert_eq!(result.all_ips.len(), 2);
                assert_eq!(result.all_ips["i2"], "5.6.7.8");
                assert_eq!(result.port, 25565);
                assert_eq!(result.deployment_type, DeploymentType::Swarm);
            }
            other => panic!("unexpected terminal event: {:?}", other),
        }

        assert!(f.runner.invoked("ansible -i"));
        assert!(f.runner.invoked("ansible-playbook"));
    }

    #[tokio::test]
    async fn test_kubernetes_skips_configuration() {
        let f = fixture(terraform_ok(), false);

        let events = run_cloud(&f.orchestrator, request("aws", OrchestrationMode::Kubernetes)).await;

        assert!(configuration_statuses(&events).is_empty());
        assert!(!f.runner.invoked("ansible"));
        assert!(!f.runner.invoked("ansible-playbook"));
        match events.last().unwrap() {
            PipelineEvent::Complete(result) => {
                assert_eq!(result.deployment_type, DeploymentType::Kubernetes);
                assert_eq!(result.all_ips.len(), 2);
            }
            other => panic!("unexpected terminal event: {:?}", other),
        }
        let plan_dir = f
            .runner
            .invocations()
            .into_iter()
            .find(|spec| spec.args.first().map(String::as_str) == Some("plan"))
            .and_then(|spec| spec.cwd)
            .unwrap();
        assert!(plan_dir.ends_with("aws/kubernetes"));
    }

    #[tokio::test]
    async fn test_provisioning_failure_ends_with_one_error() {
        let runner = ScriptedRunner::new().on("terraform plan", &["Error: invalid credentials"], 1);
        let f = fixture(runner, true);

        let events = run_cloud(&f.orchestrator, request("aws", OrchestrationMode::Swarm)).await;

        assert_single_terminal_last(&events);
        assert!(!provisioning_statuses(&events).contains(&ProvisioningStatus::Applying));
        assert!(configuration_statuses(&events).is_empty());
        match events.last().unwrap() {
            PipelineEvent::Error(failure) => {
                assert_eq!(failure.failed_stage, Stage::Provisioning);
                assert!(failure.error.contains("exit code 1"));
                assert_eq!(failure.logs, vec!["Error: invalid credentials"]);
            }
            other => panic!("unexpected terminal event: {:?}", other),
        }
        assert!(!f.runner.invoked("terraform apply"));
        assert!(!f.runner.invoked("ansible-playbook"));
    }

    #[tokio::test]
    async fn test_missing_inventory_fails_configuration_stage() {
        let f = fixture(terraform_ok(), false);

        let events = run_cloud(&f.orchestrator, request("aws", OrchestrationMode::Swarm)).await;

        assert_single_terminal_last(&events);
        match events.last().unwrap() {
            PipelineEvent::Error(failure) => {
                assert_eq!(failure.failed_stage, Stage::Configuration);
                assert!(failure.message.contains("Inventory file not found"));
            }
            other => panic!("unexpected terminal event: {:?}", other),
        }
        assert!(!f.runner.invoked("ansible"));
    }

    #[tokio::test]
    async fn test_missing_ip_outputs_use_placeholder() {
        let runner = ScriptedRunner::new().on("terraform output", &["{}"], 0);
        let f = fixture(runner, false);

        let events = run_cloud(&f.orchestrator, request("gcp", OrchestrationMode::Kubernetes)).await;

        match events.last().unwrap() {
            PipelineEvent::Complete(result) => {
                assert_eq!(result.ip_address, UNKNOWN_ADDRESS);
                assert!(result.all_ips.is_empty());
            }
            other => panic!("unexpected terminal event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_destroy_pipeline() {
        let f = fixture(terraform_ok(), false);

        let handle = f
            .orchestrator
            .destroy(request("aws", OrchestrationMode::Swarm))
            .unwrap();
        let events = handle.collect().await;

        assert_eq!(
            dedup(&provisioning_statuses(&events)),
            vec![
                ProvisioningStatus::Initializing,
                ProvisioningStatus::Destroying,
                ProvisioningStatus::Success,
            ]
        );
        assert_single_terminal_last(&events);
        assert!(matches!(events.last(), Some(PipelineEvent::Complete(r)) if r.all_ips.is_empty()));
        assert!(f.runner.invoked("terraform destroy"));
        assert!(!f.runner.invoked("terraform apply"));
    }

    #[tokio::test]
    async fn test_cancel_before_start_runs_nothing() {
        let f = fixture(terraform_ok(), true);

        let handle = match f
            .orchestrator
            .deploy(request("aws", OrchestrationMode::Swarm))
            .await
            .unwrap()
        {
            Deployment::Cloud(handle) => handle,
            Deployment::Local(_) => panic!("expected a cloud run"),
        };
        handle.cancel();
        let events = handle.collect().await;

        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], PipelineEvent::Error(e) if e.error == "deployment cancelled"));
        assert!(f.runner.invocations().is_empty());
    }

    /// Orchestrator over real processes whose `init` step prints a line,
    /// sleeps, then touches `marker`
    #[cfg(unix)]
    struct SlowTool {
        _dir: TempDir,
        marker: std::path::PathBuf,
        orchestrator: DeploymentOrchestrator,
    }

    #[cfg(unix)]
    fn slow_tool() -> SlowTool {
        use crate::runner::{CommandRunner, ProcessRunner};
        use std::time::Duration;

        let dir = TempDir::new().unwrap();
        let workdir = dir.path().join("terraform").join("aws");
        std::fs::create_dir_all(&workdir).unwrap();
        let marker = dir.path().join("marker");
        // `sh init -no-color` runs this file as the init step
        let script = format!("echo started\nsleep 2\ntouch {}\n", marker.display());
        std::fs::write(workdir.join("init"), script).unwrap();

        let config = DeployerConfig {
            project_root: dir.path().to_path_buf(),
            vars_dir: Some(dir.path().to_path_buf()),
            terraform_bin: "sh".into(),
            ..Default::default()
        };
        let runner: Arc<dyn CommandRunner> = Arc::new(ProcessRunner::new(Duration::from_millis(200)));
        let orchestrator = DeploymentOrchestrator::new(
            ProvisioningExecutor::new(runner.clone(), &config),
            ConfigurationExecutor::new(runner, &config),
            Arc::new(FakeLocal(LocalOutcome::Unavailable {
                error: "not used".into(),
            })),
            &config,
        );
        SlowTool {
            _dir: dir,
            marker,
            orchestrator,
        }
    }

    /// Deploy and wait until the tool has printed its first line
    #[cfg(unix)]
    async fn started(orchestrator: &DeploymentOrchestrator) -> DeploymentHandle {
        use std::time::Duration;

        let mut handle = match orchestrator
            .deploy(request("aws", OrchestrationMode::Swarm))
            .await
            .unwrap()
        {
            Deployment::Cloud(handle) => handle,
            Deployment::Local(_) => panic!("expected a cloud run"),
        };
        loop {
            let event = tokio::time::timeout(Duration::from_secs(10), handle.next_event())
                .await
                .unwrap()
                .expect("run ended before the tool started");
            if let PipelineEvent::Provisioning(p) = &event {
                if p.logs.iter().any(|line| line == "started") {
                    return handle;
                }
            }
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_dropping_handle_mid_stage_kills_tool() {
        let tool = slow_tool();
        let handle = started(&tool.orchestrator).await;

        drop(handle);

        tokio::time::sleep(std::time::Duration::from_secs(3)).await;
        assert!(!tool.marker.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancelling_handle_mid_stage_kills_tool() {
        let tool = slow_tool();
        let handle = started(&tool.orchestrator).await;

        handle.cancel();
        let events = handle.collect().await;

        let terminal: Vec<_> = events.iter().filter(|e| e.is_terminal()).collect();
        assert_eq!(terminal.len(), 1);
        assert!(matches!(events.last(), Some(PipelineEvent::Error(_))));

        tokio::time::sleep(std::time::Duration::from_secs(3)).await;
        assert!(!tool.marker.exists());
    }

    // ========================================
    // Routing and lifecycle
    // ========================================

    #[tokio::test]
    async fn test_local_provider_uses_container_runtime() {
        let runner = Arc::new(ScriptedRunner::new());
        let config = DeployerConfig::default();
        let result = DeploymentResult::local("c0ffee", "127.0.0.1", 49153);
        let orchestrator = DeploymentOrchestrator::new(
            ProvisioningExecutor::new(runner.clone(), &config),
            ConfigurationExecutor::new(runner.clone(), &config),
            Arc::new(FakeLocal(LocalOutcome::Running(result.clone()))),
            &config,
        );

        let req = DeploymentRequest::new("LOCAL", OrchestrationMode::Swarm, vec!["mc".into()]);
        match orchestrator.deploy(req).await.unwrap() {
            Deployment::Local(LocalOutcome::Running(r)) => {
                assert_eq!(r.port, 49153);
                assert_eq!(r.container_id.as_deref(), Some("c0ffee"));
            }
            _ => panic!("expected a running local server"),
        }
        assert!(runner.invocations().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_request_is_rejected() {
        let f = fixture(terraform_ok(), true);
        let req = DeploymentRequest::new("aws", OrchestrationMode::Swarm, vec![]);

        let result = f.orchestrator.deploy(req).await;

        assert!(matches!(result, Err(DeployError::InvalidRequest(_))));
        assert!(f.runner.invocations().is_empty());
    }

    #[tokio::test]
    async fn test_destroy_rejects_local_provider() {
        let f = fixture(terraform_ok(), true);
        let req = DeploymentRequest::new("local", OrchestrationMode::Swarm, vec!["mc".into()]);
        assert!(matches!(
            f.orchestrator.destroy(req),
            Err(DeployError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_shutdown_refuses_new_runs() {
        let f = fixture(terraform_ok(), true);
        f.orchestrator.shutdown();

        assert!(f.orchestrator.is_shut_down());
        let result = f
            .orchestrator
            .deploy(request("aws", OrchestrationMode::Swarm))
            .await;
        assert!(matches!(result, Err(DeployError::ShuttingDown)));
    }

    #[tokio::test]
    async fn test_concurrent_runs_on_same_workdir_do_not_interleave() {
        let f = fixture(terraform_ok(), false);
        let first = request("aws", OrchestrationMode::Kubernetes);
        let second = request("aws", OrchestrationMode::Kubernetes);

        let a = run_cloud(&f.orchestrator, first);
        let b = run_cloud(&f.orchestrator, second);
        let (a, b) = tokio::join!(a, b);

        assert!(matches!(a.last(), Some(PipelineEvent::Complete(_))));
        assert!(matches!(b.last(), Some(PipelineEvent::Complete(_))));

        let programs: Vec<String> = f
            .runner
            .invocations()
            .iter()
            .map(|spec| spec.args[0].clone())
            .collect();
        assert_eq!(
            programs,
            vec!["init", "plan", "apply", "output", "init", "plan", "apply", "output"]
        );
    }
}
