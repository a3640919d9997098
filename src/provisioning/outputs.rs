use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{DeployError, DeployResult};

/// One entry of `output -json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputValue {
    #[serde(default)]
    pub value: Value,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<Value>,
    #[serde(default)]
    pub sensitive: bool,
}

impl OutputValue {
    pub fn new(value: Value) -> Self {
        Self {
            value,
            kind: None,
            sensitive: false,
        }
    }
}

/// Parsed outputs of the infra tool, keyed by output name
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProvisioningOutputs(BTreeMap<String, OutputValue>);

impl ProvisioningOutputs {
    /// Parse the machine-readable output; blank output means no outputs
    pub fn from_json(raw: &str) -> DeployResult<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_str(raw).map_err(|e| DeployError::parse("provisioning outputs", e))
    }

    pub fn get(&self, name: &str) -> Option<&OutputValue> {
        self.0.get(name)
    }

    pub fn insert(&mut self, name: impl Into<String>, value: Value) {
        self.0.insert(name.into(), OutputValue::new(value));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Output names that hold an instance id -> IP map, one per provider
/// convention, searched in order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceIpKeys(Vec<String>);

impl Default for InstanceIpKeys {
    fn default() -> Self {
        Self(vec![
            // aws
            "instance_public_ips".into(),
            // azure
            "vm_public_ips".into(),
        ])
    }
}

impl InstanceIpKeys {
    pub fn new<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(keys.into_iter().map(Into::into).collect())
    }

    /// Add a convention after the existing ones
    #[must_use]
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.0.push(key.into());
        self
    }

    pub fn keys(&self) -> &[String] {
        &self.0
    }

    /// First known IP map present in `outputs`; empty when none match
    pub fn extract(&self, outputs: &ProvisioningOutputs) -> BTreeMap<String, String> {
        self.0
            .iter()
            .filter_map(|key| outputs.get(key))
            .find_map(|output| match &output.value {
                Value::Object(map) => Some(
                    map.iter()
                        .filter_map(|(id, ip)| ip.as_str().map(|ip| (id.clone(), ip.to_string())))
                        .collect(),
                ),
                _ => None,
            })
            .unwrap_or_default()
    }
}

/// Instance addresses using the built-in provider conventions
pub fn extract_instance_ips(outputs: &ProvisioningOutputs) -> BTreeMap<String, String> {
    InstanceIpKeys::default().extract(outputs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn outputs(value: Value) -> ProvisioningOutputs {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_extract_aws_ips() {
        let ips = extract_instance_ips(&outputs(json!({
            "instance_public_ips": { "value": { "i1": "1.2.3.4" } }
        })));
        assert_eq!(ips.len(), 1);
        assert_eq!(ips["i1"], "1.2.3.4");
    }

    #[test]
    fn test_extract_azure_ips() {
        let ips = extract_instance_ips(&outputs(json!({
            "vm_public_ips": { "value": { "i1": "5.6.7.8" } }
        })));
        assert_eq!(ips.len(), 1);
        assert_eq!(ips["i1"], "5.6.7.8");
    }

    #[test]
    fn test_extract_empty_outputs() {
        assert!(extract_instance_ips(&outputs(json!({}))).is_empty());
    }

    #[test]
    fn test_unknown_output_names_yield_nothing() {
        let found = outputs(json!({ "droplet_ips": { "value": { "d1": "9.9.9.9" } } }));
        assert!(extract_instance_ips(&found).is_empty());

        let keys = InstanceIpKeys::default().with_key("droplet_ips");
        assert_eq!(keys.extract(&found)["d1"], "9.9.9.9");
    }

    #[test]
    fn test_first_convention_wins() {
        let ips = extract_instance_ips(&outputs(json!({
            "vm_public_ips": { "value": { "vm": "5.6.7.8" } },
            "instance_public_ips": { "value": { "ec2": "1.2.3.4" } }
        })));
        assert_eq!(ips.len(), 1);
        assert_eq!(ips["ec2"], "1.2.3.4");
    }

    #[test]
    fn test_non_map_value_is_skipped() {
        let ips = extract_instance_ips(&outputs(json!({
            "instance_public_ips": { "value": ["1.2.3.4"] },
            "vm_public_ips": { "value": { "vm": "5.6.7.8" } }
        })));
        assert_eq!(ips["vm"], "5.6.7.8");
    }

    #[test]
    fn test_from_json_parses_tool_output() {
        let raw = r#"{
            "instance_public_ips": {
                "sensitive": false,
                "type": ["map", "string"],
                "value": { "i1": "1.2.3.4", "i2": "5.6.7.8" }
            }
        }"#;
        let parsed = ProvisioningOutputs::from_json(raw).unwrap();
        assert!(parsed.contains("instance_public_ips"));
        assert!(!parsed.get("instance_public_ips").unwrap().sensitive);
        assert_eq!(extract_instance_ips(&parsed).len(), 2);
    }

    #[test]
    fn test_from_json_blank_and_malformed() {
        assert!(ProvisioningOutputs::from_json("  \n").unwrap().is_empty());
        let err = ProvisioningOutputs::from_json("{ nope").unwrap_err();
        assert!(matches!(err, DeployError::Parse { .. }));
    }
}
