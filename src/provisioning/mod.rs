mod executor;
mod outputs;

pub use executor::{ProvisioningExecutor, ProvisioningTarget, ProvisioningVars};
pub use outputs::{extract_instance_ips, InstanceIpKeys, OutputValue, ProvisioningOutputs};
