use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, Time};
use kube_derive::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::cnset::CNLabel;
use super::common::ConditionalStatus;

/// A request for exactly one CN pod out of a pool.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, PartialEq, Default, JsonSchema)]
#[kube(
    group = "core.matrixorigin.io",
    version = "v1alpha1",
    kind = "CNClaim",
    status = "CNClaimStatus",
    shortname = "cnc",
    namespaced,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Pod","type":"string","jsonPath":".spec.podName"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct CNClaimSpec {
    /// Pods of the pool must match this selector to be bound.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<LabelSelector>,

    /// The pool this claim is served from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool_name: Option<String>,

    /// Store labels applied to the bound pod.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cn_labels: Vec<CNLabel>,

    /// Extra pod labels applied to the bound pod.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub additional_pod_labels: BTreeMap<String, String>,

    /// Set once when the claim binds; immutable afterwards.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_name: Option<String>,

    /// Pod whose workload should migrate onto the claimed pod.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_pod: Option<SourcePod>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SourcePod {
    pub pod_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash, JsonSchema)]
pub enum CNClaimPhase {
    #[default]
    Pending,
    Bound,
    Lost,
    Outdated,
}

impl CNClaimPhase {
    /// Phases only ever move forward: Pending, Bound, then Outdated or Lost.
    pub fn can_transition_to(&self, next: CNClaimPhase) -> bool {
        use CNClaimPhase::*;
        matches!(
            (self, next),
            (Pending, Pending)
                | (Pending, Bound)
                | (Bound, Bound)
                | (Bound, Outdated)
                | (Bound, Lost)
                | (Outdated, Outdated)
                | (Outdated, Lost)
                | (Lost, Lost)
        )
    }

    pub fn is_bound(&self) -> bool {
        matches!(self, CNClaimPhase::Bound | CNClaimPhase::Outdated)
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CNClaimStatus {
    #[serde(flatten)]
    pub conditional: ConditionalStatus,

    #[serde(default)]
    pub phase: CNClaimPhase,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store: Option<CNStoreStatus>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bound_time: Option<Time>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub migrate: Option<MigrateStatus>,
}

/// Copy of the bound pod's store identity.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CNStoreStatus {
    pub service_id: String,
    pub pod_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql_address: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<CNLabel>,
    #[serde(default)]
    pub state: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MigrateStatus {
    pub source: Workload,
}

/// Work still attached to a store.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Workload {
    #[serde(default)]
    pub connections: i64,
    #[serde(default)]
    pub pipelines: i64,
    #[serde(default)]
    pub replicas: i64,
}

impl Workload {
    pub fn is_empty(&self) -> bool {
        self.connections == 0 && self.pipelines == 0 && self.replicas == 0
    }
}

impl CNClaim {
    pub fn phase(&self) -> CNClaimPhase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }

    pub fn pod_name(&self) -> Option<&str> {
        self.spec.pod_name.as_deref().filter(|s| !s.is_empty())
    }
}

/// A replicated group of claims.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, PartialEq, Default, JsonSchema)]
#[kube(
    group = "core.matrixorigin.io",
    version = "v1alpha1",
    kind = "CNClaimSet",
    status = "CNClaimSetStatus",
    shortname = "cncs",
    scale = r#"{"specReplicasPath":".spec.replicas", "statusReplicasPath":".status.replicas", "labelSelectorPath":".status.labelSelector"}"#,
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct CNClaimSetSpec {
    #[serde(default)]
    pub replicas: i32,

    pub template: CNClaimTemplate,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<LabelSelector>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CNClaimTemplate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<EmbeddedMetadata>,

    pub spec: CNClaimSpec,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EmbeddedMetadata {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CNClaimSetStatus {
    #[serde(flatten)]
    pub conditional: ConditionalStatus,

    #[serde(default)]
    pub replicas: i32,

    #[serde(default)]
    pub ready_replicas: i32,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub claims: Vec<ClaimSummary>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_selector: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClaimSummary {
    pub claim_name: String,
    pub phase: CNClaimPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_name: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claim_phase_never_moves_backwards() {
        use CNClaimPhase::*;
        assert!(Pending.can_transition_to(Bound));
        assert!(Bound.can_transition_to(Outdated));
        assert!(Bound.can_transition_to(Lost));
        assert!(!Bound.can_transition_to(Pending));
        assert!(!Outdated.can_transition_to(Bound));
        assert!(!Lost.can_transition_to(Bound));
        assert!(!Pending.can_transition_to(Outdated));
    }
}
