use kube_derive::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::common::{ConditionalStatus, Deps, FailoverStatus, PodSet, SharedStorageCache, Volume};

/// The transaction-node set. Named DN for compatibility, TN in the cluster spec.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, PartialEq, Default, JsonSchema)]
#[kube(
    group = "core.matrixorigin.io",
    version = "v1alpha1",
    kind = "DNSet",
    status = "DNSetStatus",
    shortname = "dn",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct DNSetSpec {
    #[serde(flatten)]
    pub pod_set: PodSet,

    /// Local disk cache; the memory/disk cache limits below apply on top.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_volume: Option<Volume>,

    #[serde(default)]
    pub shared_storage_cache: SharedStorageCache,

    #[serde(default)]
    pub deps: Deps,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DNSetStatus {
    #[serde(flatten)]
    pub conditional: ConditionalStatus,

    #[serde(flatten)]
    pub failover: FailoverStatus,
}
