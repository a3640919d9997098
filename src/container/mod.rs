mod client;
mod runtime;

pub use client::{
    assigned_host_port, container_name, server_env, server_labels, ContainerInfo,
    ContainerRuntimeClient, ExecOutput, SERVER_LABEL,
};
pub use runtime::{LocalOutcome, LocalRuntime};
