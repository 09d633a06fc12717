use kube_derive::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::common::{
    ConditionalStatus, FailoverStatus, PodSet, RetentionPolicy, SharedStorageProvider, Volume,
};

pub const DEFAULT_STORE_FAILURE_TIMEOUT: &str = "10m";

#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, PartialEq, Default, JsonSchema)]
#[kube(
    group = "core.matrixorigin.io",
    version = "v1alpha1",
    kind = "LogSet",
    status = "LogSetStatus",
    shortname = "log",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct LogSetSpec {
    #[serde(flatten)]
    pub pod_set: PodSet,

    /// Per-replica volume holding the raft log.
    #[serde(default)]
    pub volume: Volume,

    #[serde(default)]
    pub shared_storage: SharedStorageProvider,

    /// Bootstrap parameters; immutable once the HAKeeper quorum is formed.
    #[serde(default)]
    pub initial_config: InitialConfig,

    /// How long a store may stay down before it is replaced.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store_failure_timeout: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pvc_retention_policy: Option<RetentionPolicy>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InitialConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_shards: Option<i32>,

    #[serde(default, rename = "dnShards", skip_serializing_if = "Option::is_none")]
    pub dn_shards: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_shard_replicas: Option<i32>,

    /// Number of HAKeeper members formed at bootstrap.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hakeeper_replicas: Option<i32>,
}

impl InitialConfig {
    pub fn log_shards(&self) -> i32 {
        self.log_shards.unwrap_or(1)
    }

    pub fn dn_shards(&self) -> i32 {
        self.dn_shards.unwrap_or(1)
    }

    pub fn log_shard_replicas(&self, replicas: i32) -> i32 {
        self.log_shard_replicas.unwrap_or_else(|| replicas.min(3))
    }

    pub fn hakeeper_replicas(&self, replicas: i32) -> i32 {
        self.hakeeper_replicas
            .unwrap_or(if replicas >= 3 { 3 } else { 1 })
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LogSetStatus {
    #[serde(flatten)]
    pub conditional: ConditionalStatus,

    #[serde(flatten)]
    pub failover: FailoverStatus,

    /// Published once at least one HAKeeper member is ready.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discovery: Option<LogSetDiscovery>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LogSetDiscovery {
    pub address: String,
    pub port: i32,
}

impl LogSetDiscovery {
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

impl LogSet {
    pub fn discovery(&self) -> Option<&LogSetDiscovery> {
        self.status.as_ref()?.discovery.as_ref()
    }

    pub fn store_failure_timeout(&self) -> crate::errors::Result<std::time::Duration> {
        crate::common::duration_or(
            self.spec.store_failure_timeout.as_deref(),
            crate::common::parse_duration(DEFAULT_STORE_FAILURE_TIMEOUT)?,
        )
    }
}
