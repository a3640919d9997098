mod event;
mod request;

pub use event::{
    ConfigurationEvent, ConfigurationStatus, DeploymentResult, DeploymentType, ErrorEvent,
    PipelineEvent, ProgressEvent, ProvisioningEvent, ProvisioningStatus, ResultStatus, Stage,
    StageStatus, UNKNOWN_ADDRESS,
};
pub use request::{
    DeploymentRequest, Difficulty, GameMode, OrchestrationMode, ServerSettings, ServerType,
    LOCAL_PROVIDER,
};
