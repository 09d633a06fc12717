use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube_derive::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::common::{ConditionalStatus, Deps, PodSet, SharedStorageCache, Volume};

pub const POD_MANAGEMENT_POOLING: &str = "Pooling";
pub const DEFAULT_STORE_DRAIN_TIMEOUT: &str = "5m";

#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, PartialEq, Default, JsonSchema)]
#[kube(
    group = "core.matrixorigin.io",
    version = "v1alpha1",
    kind = "CNSet",
    status = "CNSetStatus",
    shortname = "cn",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct CNSetSpec {
    #[serde(flatten)]
    pub pod_set: PodSet,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_port: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_volume: Option<Volume>,

    #[serde(default)]
    pub shared_storage_cache: SharedStorageCache,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<CNRole>,

    /// Labels reported to HAKeeper to steer query routing.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cn_labels: Vec<CNLabel>,

    /// `Pooling` when the set is managed by a CNPool.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_management_policy: Option<String>,

    #[serde(default)]
    pub scaling_config: ScalingConfig,

    #[serde(default)]
    pub update_strategy: RollingUpdateStrategy,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub termination_policy: Option<TerminationPolicy>,

    /// Freeze template rollouts; only in-place-safe fields keep syncing.
    #[serde(default)]
    pub pause_update: bool,

    /// Pods to delete on the next scale-in, chosen by the pool.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pods_to_delete: Vec<String>,

    #[serde(default)]
    pub deps: Deps,
}

impl CNSetSpec {
    pub fn is_pooling(&self) -> bool {
        self.pod_management_policy.as_deref() == Some(POD_MANAGEMENT_POOLING)
    }

    pub fn role(&self) -> CNRole {
        self.role.unwrap_or_default()
    }

    pub fn drains(&self) -> bool {
        self.scaling_config.store_drain_enabled.unwrap_or(false)
    }
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum CNRole {
    #[default]
    TP,
    AP,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub struct CNLabel {
    pub key: String,
    #[serde(default)]
    pub values: Vec<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ScalingConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store_drain_enabled: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store_drain_timeout: Option<String>,

    /// Minimum seconds a pod must be Ready before it counts as available.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_delay_seconds: Option<i32>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RollingUpdateStrategy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_surge: Option<IntOrString>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_unavailable: Option<IntOrString>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum TerminationPolicy {
    Drain,
    Delete,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum CNStoreState {
    #[default]
    Unknown,
    Up,
    Draining,
    Down,
}

impl CNStoreState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CNStoreState::Unknown => "Unknown",
            CNStoreState::Up => "Up",
            CNStoreState::Draining => "Draining",
            CNStoreState::Down => "Down",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "Up" => CNStoreState::Up,
            "Draining" => CNStoreState::Draining,
            "Down" => CNStoreState::Down,
            _ => CNStoreState::Unknown,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CNStore {
    pub uuid: String,
    pub pod_name: String,
    pub state: CNStoreState,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CNSetStatus {
    #[serde(flatten)]
    pub conditional: ConditionalStatus,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stores: Vec<CNStore>,

    #[serde(default)]
    pub replicas: i32,

    #[serde(default)]
    pub ready_replicas: i32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_selector: Option<String>,

    /// In-cluster SQL endpoint of the set's service.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<i32>,
}
