use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube_derive::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::common::{ConditionalStatus, Overlay, SharedStorageProvider};

#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, PartialEq, Default, JsonSchema)]
#[kube(
    group = "core.matrixorigin.io",
    version = "v1alpha1",
    kind = "BackupJob",
    status = "BackupJobStatus",
    shortname = "bj",
    namespaced,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Backup","type":"string","jsonPath":".status.backup"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct BackupJobSpec {
    pub source: BackupSource,

    /// Where the backup is written.
    pub target: SharedStorageProvider,

    /// How long the job is kept after it ends.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<String>,

    /// Image carrying the backup binary and the command sidecar.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overlay: Option<Overlay>,
}

/// Exactly one of `clusterRef` and `cnSetRef` must be set.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BackupSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_ref: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cn_set_ref: Option<String>,

    /// Credential secret (`username`/`password`) for a CNSet source.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum JobPhase {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobPhase::Completed | JobPhase::Failed)
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BackupJobStatus {
    #[serde(flatten)]
    pub conditional: ConditionalStatus,

    #[serde(default)]
    pub phase: JobPhase,

    /// Name of the Backup produced on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup: Option<String>,
}

/// Immutable record of a finished backup. Cluster scoped; outlives its job.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, PartialEq, Default, JsonSchema)]
#[kube(
    group = "core.matrixorigin.io",
    version = "v1alpha1",
    kind = "Backup",
    printcolumn = r#"{"name":"ID","type":"string","jsonPath":".spec.id"}"#,
    printcolumn = r#"{"name":"At","type":"date","jsonPath":".spec.atTime"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct BackupMeta {
    pub id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub at_time: Option<Time>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub complete_time: Option<Time>,

    /// `<namespace>/<name>` of the source.
    pub source_ref: String,

    pub location: SharedStorageProvider,

    /// Metadata blob printed by the backup binary, fed back on restore.
    pub raw: String,
}

#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, PartialEq, Default, JsonSchema)]
#[kube(
    group = "core.matrixorigin.io",
    version = "v1alpha1",
    kind = "RestoreJob",
    status = "RestoreJobStatus",
    shortname = "rj",
    namespaced,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct RestoreJobSpec {
    pub backup_name: String,

    /// Where the restored data is written.
    pub target: SharedStorageProvider,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overlay: Option<Overlay>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RestoreJobStatus {
    #[serde(flatten)]
    pub conditional: ConditionalStatus,

    #[serde(default)]
    pub phase: JobPhase,
}
