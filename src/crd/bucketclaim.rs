use k8s_openapi::api::core::v1::PodTemplateSpec;
use kube_derive::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::common::{ConditionalStatus, RetentionPolicy, S3Provider};

/// Claim on a shared object-storage location. Cluster scoped.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, PartialEq, Default, JsonSchema)]
#[kube(
    group = "core.matrixorigin.io",
    version = "v1alpha1",
    kind = "BucketClaim",
    status = "BucketClaimStatus",
    shortname = "bucket",
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"BindTo","type":"string","jsonPath":".status.bindTo"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct BucketClaimSpec {
    pub s3: S3Provider,

    /// Template of the pod that reclaims the data; image and resources are taken from it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_set_template: Option<PodTemplateSpec>,
}

impl BucketClaimSpec {
    pub fn retention_policy(&self) -> RetentionPolicy {
        self.s3.s3_retention_policy.unwrap_or_default()
    }
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum BucketState {
    InUse,
    Released,
    Deleting,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BucketClaimStatus {
    #[serde(flatten)]
    pub conditional: ConditionalStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<BucketState>,

    /// `<namespace>/<name>` of the LogSet using the bucket.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bind_to: Option<String>,
}

impl BucketClaim {
    pub fn state(&self) -> Option<BucketState> {
        self.status.as_ref()?.state
    }

    pub fn bind_to(&self) -> Option<&str> {
        self.status.as_ref()?.bind_to.as_deref()
    }
}
