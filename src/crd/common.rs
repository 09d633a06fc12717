//! Types shared by several custom resources.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Affinity, EnvVar, LocalObjectReference, ResourceRequirements, Toleration, Volume as PodVolume,
    VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::tomlconfig::TomlConfig;

/// Pod-level settings every set shares.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PodSet {
    /// Desired number of pods.
    #[serde(default)]
    pub replicas: i32,

    /// Full image reference; defaults to `<imageRepository>:<version>` of the cluster.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,

    /// Configuration merged on top of the operator defaults.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<TomlConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_selector: Option<BTreeMap<String, String>>,

    /// Topology keys pods are spread evenly across.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub topology_spread: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_policy: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overlay: Option<Overlay>,

    /// Expose metrics to Prometheus through pod annotations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub export_to_prometheus: Option<bool>,

    /// Database version of the image, used for version gates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub semantic_version: Option<String>,
}

/// Free-form additions applied to the generated pod template.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Overlay {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<PodVolume>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_mounts: Vec<VolumeMount>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub pod_labels: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub pod_annotations: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tolerations: Vec<Toleration>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affinity: Option<Affinity>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub image_pull_secrets: Vec<LocalObjectReference>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub termination_grace_period_seconds: Option<i64>,
}

/// A persistent volume request.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Volume {
    pub size: Quantity,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class_name: Option<String>,
}

/// Local caches in front of shared storage.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SharedStorageCache {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_cache_size: Option<Quantity>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_cache_size: Option<Quantity>,
}

/// Where shared data lives. Exactly one provider must be set.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SharedStorageProvider {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s3: Option<S3Provider>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_system: Option<FileSystemProvider>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FileSystemProvider {
    pub path: String,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum S3ProviderType {
    #[default]
    #[serde(rename = "aws")]
    Aws,
    #[serde(rename = "minio")]
    Minio,
}

impl S3ProviderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            S3ProviderType::Aws => "aws",
            S3ProviderType::Minio => "minio",
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum RetentionPolicy {
    #[default]
    Delete,
    Retain,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct S3Provider {
    /// `<bucket>/<prefix>`.
    pub path: String,

    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub provider_type: Option<S3ProviderType>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,

    /// Secret holding `AWS_ACCESS_KEY_ID` and `AWS_SECRET_ACCESS_KEY`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<LocalObjectReference>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate_ref: Option<CertificateRef>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s3_retention_policy: Option<RetentionPolicy>,
}

impl S3Provider {
    pub fn provider_type(&self) -> S3ProviderType {
        self.provider_type.unwrap_or_default()
    }

    /// Splits `path` into bucket and key prefix.
    pub fn bucket_and_prefix(&self) -> (&str, &str) {
        let path = self.path.trim_start_matches('/');
        match path.split_once('/') {
            Some((bucket, prefix)) => (bucket, prefix.trim_end_matches('/')),
            None => (path, ""),
        }
    }

    pub fn endpoint(&self) -> &str {
        self.endpoint.as_deref().unwrap_or_default()
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CertificateRef {
    pub name: String,
    #[serde(default)]
    pub files: Vec<String>,
}

/// Reference to a LogSet, possibly in another namespace.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LogSetRef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl LogSetRef {
    pub fn namespace_or<'a>(&'a self, default: &'a str) -> &'a str {
        self.namespace.as_deref().unwrap_or(default)
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Deps {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_set: Option<LogSetRef>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum StorePhase {
    Up,
    Down,
}

/// One store as seen by the failover tracker.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Store {
    pub pod_name: String,
    pub phase: StorePhase,
    pub last_transition: Time,
}

/// Partition of a set's stores into available and failed.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FailoverStatus {
    #[serde(default)]
    pub available_stores: Vec<Store>,
    #[serde(default)]
    pub failed_stores: Vec<Store>,
}

/// The part of every status that carries conditions.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConditionalStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl ConditionalStatus {
    pub fn is_ready(&self) -> bool {
        crate::common::conditions::is_true(&self.conditions, crate::common::conditions::CONDITION_READY)
    }

    pub fn is_synced(&self) -> bool {
        crate::common::conditions::is_true(&self.conditions, crate::common::conditions::CONDITION_SYNCED)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_and_prefix() {
        let s3 = S3Provider {
            path: "test-bucket/mo".to_string(),
            ..Default::default()
        };
        assert_eq!(s3.bucket_and_prefix(), ("test-bucket", "mo"));
        let s3 = S3Provider {
            path: "/only-bucket".to_string(),
            ..Default::default()
        };
        assert_eq!(s3.bucket_and_prefix(), ("only-bucket", ""));
    }
}
