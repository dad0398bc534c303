use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::{OperatorError, Result};

#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(group = "liftbridge.io", version = "v1alpha1", kind = "LiftbridgeCluster")]
#[kube(namespaced, status = "LiftbridgeClusterStatus")]
#[kube(
    shortname = "lbc",
    scale = r#"{"specReplicasPath":".spec.replicas","statusReplicasPath":".status.replicas","labelSelectorPath":".status.selector"}"#,
    printcolumn = r#"{"name":"Version","type":"string","jsonPath":".spec.version"}"#,
    printcolumn = r#"{"name":"Desired","type":"integer","jsonPath":".spec.replicas"}"#,
    printcolumn = r#"{"name":"Current","type":"integer","jsonPath":".status.replicas"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct LiftbridgeClusterSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
    pub nats: LiftbridgeClusterNatsSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paused: Option<bool>,
    pub replicas: i32,
    pub storage: LiftbridgeClusterStorageSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<LiftbridgeClusterTlsSpec>,
    pub version: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LiftbridgeClusterNatsSpec {
    #[serde(default)]
    pub servers: Vec<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LiftbridgeClusterStorageSpec {
    #[serde(rename = "sizeGB")]
    pub size_gb: i32,
    #[serde(default)]
    pub storage_class_name: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LiftbridgeClusterTlsSpec {
    pub secret_name: String,
}

/// Observed state, shaped for the scale subresource.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LiftbridgeClusterStatus {
    #[serde(default)]
    pub replicas: i32,
    #[serde(default)]
    pub selector: String,
}

impl LiftbridgeClusterSpec {
    pub fn validate(&self) -> Result<()> {
        if self.replicas < 0 {
            return Err(OperatorError::invalid_spec(format!(
                "replicas must not be negative, got {}",
                self.replicas
            )));
        }
        if self.storage.size_gb <= 0 {
            return Err(OperatorError::invalid_spec(format!(
                "storage.sizeGB must be positive, got {}",
                self.storage.size_gb
            )));
        }
        if self.version.trim().is_empty() {
            return Err(OperatorError::invalid_spec("version must not be empty"));
        }
        if self.nats.servers.iter().any(|s| s.trim().is_empty()) {
            return Err(OperatorError::invalid_spec(
                "nats.servers must not contain empty entries",
            ));
        }
        if let Some(tls) = &self.tls {
            if tls.secret_name.trim().is_empty() {
                return Err(OperatorError::invalid_spec(
                    "tls.secretName must not be empty when tls is set",
                ));
            }
        }
        Ok(())
    }

    pub fn is_paused(&self) -> bool {
        self.paused.unwrap_or(false)
    }

    pub fn tls_enabled(&self) -> bool {
        self.tls.is_some()
    }
}

impl LiftbridgeClusterStatus {
    pub fn new(replicas: i32, selector: impl Into<String>) -> Self {
        Self {
            replicas,
            selector: selector.into(),
        }
    }

    /// Label selector matching the pods of the cluster called `name`.
    pub fn selector_for(name: &str) -> String {
        format!(
            "app.kubernetes.io/name=liftbridge,app.kubernetes.io/instance={}",
            name
        )
    }
}
