use std::collections::BTreeMap;

use kube_derive::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::cnset::CNSetSpec;
use super::common::{ConditionalStatus, Deps};

pub const DEFAULT_RECLAIM_TIMEOUT: &str = "5m";

/// A warm buffer of CN pods waiting to be claimed.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, PartialEq, Default, JsonSchema)]
#[kube(
    group = "core.matrixorigin.io",
    version = "v1alpha1",
    kind = "CNPool",
    status = "CNPoolStatus",
    shortname = "cnp",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct CNPoolSpec {
    /// Template of the backing CNSets; `replicas` is ignored.
    pub template: CNSetSpec,

    /// Labels added to every pool pod. Changing them never rolls pods.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub pod_labels: BTreeMap<String, String>,

    #[serde(default)]
    pub deps: Deps,

    #[serde(default)]
    pub strategy: PoolStrategy,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PoolStrategy {
    #[serde(default)]
    pub update_strategy: PoolUpdateStrategy,

    #[serde(default)]
    pub scale_strategy: PoolScaleStrategy,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PoolUpdateStrategy {
    /// Upper bound on how long a released pod may drain before it is recycled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reclaim_timeout: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PoolScaleStrategy {
    /// Idle pods kept on top of current demand.
    #[serde(default)]
    pub max_idle: i32,

    /// Hard cap on pods across every revision of the pool.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_pods: Option<i32>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CNPoolStatus {
    #[serde(flatten)]
    pub conditional: ConditionalStatus,

    /// Name of the CNSet matching the current template.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_cn_set: Option<String>,

    #[serde(default)]
    pub idle: i32,

    #[serde(default)]
    pub in_use: i32,

    #[serde(default)]
    pub pending_claims: i32,

    #[serde(default)]
    pub legacy_cn_sets: i32,
}

impl CNPool {
    pub fn reclaim_timeout(&self) -> crate::errors::Result<std::time::Duration> {
        crate::common::duration_or(
            self.spec.strategy.update_strategy.reclaim_timeout.as_deref(),
            crate::common::parse_duration(DEFAULT_RECLAIM_TIMEOUT)?,
        )
    }
}

/// Phase label carried by every pool pod.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CNPodPhase {
    Unknown,
    Idle,
    Bound,
    Draining,
    Terminating,
}

impl CNPodPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            CNPodPhase::Unknown => "Unknown",
            CNPodPhase::Idle => "Idle",
            CNPodPhase::Bound => "Bound",
            CNPodPhase::Draining => "Draining",
            CNPodPhase::Terminating => "Terminating",
        }
    }

    /// Missing or unrecognised labels read as `Unknown`.
    pub fn parse(s: Option<&str>) -> Self {
        match s {
            Some("Idle") => CNPodPhase::Idle,
            Some("Bound") => CNPodPhase::Bound,
            Some("Draining") => CNPodPhase::Draining,
            Some("Terminating") => CNPodPhase::Terminating,
            _ => CNPodPhase::Unknown,
        }
    }

    pub fn in_use(&self) -> bool {
        matches!(self, CNPodPhase::Bound | CNPodPhase::Draining)
    }
}
