use kube_derive::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::common::{ConditionalStatus, Deps, PodSet};

#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, PartialEq, Default, JsonSchema)]
#[kube(
    group = "core.matrixorigin.io",
    version = "v1alpha1",
    kind = "ProxySet",
    status = "ProxySetStatus",
    shortname = "proxy",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct ProxySetSpec {
    #[serde(flatten)]
    pub pod_set: PodSet,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_port: Option<i32>,

    #[serde(default)]
    pub deps: Deps,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProxySetStatus {
    #[serde(flatten)]
    pub conditional: ConditionalStatus,

    #[serde(default)]
    pub ready_replicas: i32,
}

#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, PartialEq, Default, JsonSchema)]
#[kube(
    group = "core.matrixorigin.io",
    version = "v1alpha1",
    kind = "WebUI",
    status = "WebUIStatus",
    shortname = "webui",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct WebUISpec {
    #[serde(flatten)]
    pub pod_set: PodSet,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_type: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WebUIStatus {
    #[serde(flatten)]
    pub conditional: ConditionalStatus,
}
