use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::LocalObjectReference;
use kube_derive::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::cnset::CNSetSpec;
use super::common::ConditionalStatus;
use super::dnset::DNSetSpec;
use super::logset::LogSetSpec;
use super::proxyset::{ProxySetSpec, WebUISpec};

/// A whole database cluster: log service, one TN set, CN groups and extras.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, PartialEq, Default, JsonSchema)]
#[kube(
    group = "core.matrixorigin.io",
    version = "v1alpha1",
    kind = "MatrixOneCluster",
    status = "MatrixOneClusterStatus",
    shortname = "mo",
    namespaced,
    printcolumn = r#"{"name":"Version","type":"string","jsonPath":".spec.version"}"#,
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct MatrixOneClusterSpec {
    pub log_service: LogSetSpec,

    /// Legacy name of `tn`; exactly one of the two is set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dn: Option<DNSetSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tn: Option<DNSetSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tp: Option<CNSetSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ap: Option<CNSetSpec>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cn_groups: Vec<CNGroup>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<ProxySetSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webui: Option<WebUISpec>,

    /// Database version; also the default image tag.
    pub version: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_repository: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_selector: Option<BTreeMap<String, String>>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub topology_spread: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_policy: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metric_reader_enabled: Option<bool>,
}

impl MatrixOneClusterSpec {
    /// The TN spec, whichever of `tn`/`dn` carries it.
    pub fn tn(&self) -> Option<&DNSetSpec> {
        self.tn.as_ref().or(self.dn.as_ref())
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CNGroup {
    pub name: String,

    #[serde(flatten)]
    pub spec: CNSetSpec,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MatrixOneClusterStatus {
    #[serde(flatten)]
    pub conditional: ConditionalStatus,

    /// Secret holding the root credential of the database.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential_ref: Option<LocalObjectReference>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub components: Vec<ComponentStatus>,

    /// SQL endpoint clients should connect to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<i32>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ComponentStatus {
    pub kind: String,
    pub name: String,
    #[serde(default)]
    pub ready: bool,
    #[serde(default)]
    pub synced: bool,
}
