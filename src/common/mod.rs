//! Labels, annotations, identities and small helpers shared by every controller.

pub mod conditions;
pub mod hashing;
pub mod identity;
pub mod pod;

use std::collections::BTreeMap;
use std::time::Duration;

use crate::errors::*;

// Labels put on every object a set owns.
pub const LABEL_INSTANCE: &str = "matrixorigin.io/instance";
pub const LABEL_COMPONENT: &str = "matrixorigin.io/component";
pub const LABEL_NAMESPACE: &str = "matrixorigin.io/namespace";
pub const LABEL_CLUSTER: &str = "matrixorigin.io/cluster";
pub const LABEL_BUCKET_UNIQUE_ID: &str = "matrixorigin.io/bucket-unique-id";

// CN pool bookkeeping.
pub const LABEL_CN_PHASE: &str = "pool.matrixorigin.io/phase";
pub const LABEL_CLAIMED_BY: &str = "pool.matrixorigin.io/claimed-by";
pub const LABEL_POOL_NAME: &str = "pool.matrixorigin.io/pool-name";
pub const LABEL_MANAGED_BY: &str = "pool.matrixorigin.io/managed-by";
pub const LABEL_CLAIMSET: &str = "pool.matrixorigin.io/claimset";
pub const LABEL_INSTANCE_ID: &str = "pool.matrixorigin.io/instance-id";

// Kruise lifecycle hook state on pods.
pub const LABEL_KRUISE_LIFECYCLE_STATE: &str = "lifecycle.apps.kruise.io/state";
pub const KRUISE_PREPARING_DELETE: &str = "PreparingDelete";
pub const KRUISE_PREPARING_UPDATE: &str = "PreparingUpdate";

pub const ANN_BOOTSTRAP: &str = "matrixorigin.io/bootstrap";
pub const ANN_CONFIG_SUFFIX: &str = "matrixorigin.io/config-suffix";
pub const ANN_OPERATOR_VERSION: &str = "matrixorigin.io/operator-version";
pub const ANN_ANY_INSTANCE_RUNNING: &str = "matrixorigin.io/any-instance-running";
pub const ANN_CN_STATE: &str = "matrixorigin.io/cn-state";
pub const ANN_CN_LABELS: &str = "matrixorigin.io/cn-labels";
pub const ANN_CONNECTIONS: &str = "matrixorigin.io/connections";
pub const ANN_PIPELINES: &str = "matrixorigin.io/pipelines";
pub const ANN_REPLICAS: &str = "matrixorigin.io/replicas";
pub const ANN_DRAIN_START: &str = "matrixorigin.io/drain-start";
pub const ANN_FORCE_SPECIFIED_DELETE: &str = "matrixorigin.io/force-specified-delete";
pub const ANN_POD_DELETION_COST: &str = "controller.kubernetes.io/pod-deletion-cost";
pub const ANN_RESTARTED_AT: &str = "matrixorigin.io/restarted-at";

pub const FINALIZER_CN_DRAINING: &str = "matrixorigin.io/cn-draining";
pub const FINALIZER_BUCKET_DATA: &str = "matrixorigin.io/bucket-data";
/// Prefix of the per-component finalizers guarding a bucket from reclamation.
pub const FINALIZER_BUCKET_COMPONENT_PREFIX: &str = "matrixorigin.io/";

pub const GATE_CN_STORE: &str = "matrixorigin.io/cn-store";
pub const GATE_CN_POOL: &str = "matrixorigin.io/cn-pool";
pub const GATE_KRUISE_INPLACE: &str = "InPlaceUpdateReady";

// Well known ports of the database processes.
pub const LOG_SERVICE_PORT: i32 = 32000;
pub const LOG_RAFT_PORT: i32 = 32001;
pub const LOG_GOSSIP_PORT: i32 = 32002;
pub const HAKEEPER_PORT: i32 = 32001;
pub const TN_SERVICE_PORT: i32 = 41010;
pub const TN_LOG_TAIL_PORT: i32 = 41011;
pub const CN_SQL_PORT: i32 = 6001;
pub const CN_SERVICE_PORT: i32 = 18000;
pub const CN_DEBUG_PORT: i32 = 6060;
pub const PROXY_PORT: i32 = 6009;
pub const WEBUI_PORT: i32 = 8007;
pub const METRIC_PORT: i32 = 7001;

pub const CONFIG_VOLUME: &str = "config";
pub const CONFIG_PATH: &str = "/etc/matrixone/config";
pub const DATA_VOLUME: &str = "data";
pub const DATA_PATH: &str = "/var/lib/matrixone";
pub const CONFIG_FILE: &str = "config.toml";
pub const ENTRYPOINT_FILE: &str = "start.sh";

/// Label set identifying the children of a set.
pub fn sub_resource_labels(namespace: &str, name: &str, component: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_NAMESPACE.to_string(), namespace.to_string()),
        (LABEL_INSTANCE.to_string(), name.to_string()),
        (LABEL_COMPONENT.to_string(), component.to_string()),
    ])
}

/// Renders a label map as a `key=value,...` selector string.
pub fn selector_string(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

/// Parses a duration field (`10m`, `1h 30m`, `90s`).
pub fn parse_duration(s: &str) -> Result<Duration> {
    Ok(humantime::parse_duration(s.trim())?)
}

/// Parses an optional duration field, falling back to `default`.
pub fn duration_or(s: Option<&str>, default: Duration) -> Result<Duration> {
    match s {
        Some(s) if !s.trim().is_empty() => parse_duration(s),
        _ => Ok(default),
    }
}

pub fn format_duration(d: Duration) -> String {
    humantime::format_duration(d).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selector_string_is_sorted() {
        let labels = sub_resource_labels("ns", "mo", "CNSet");
        assert_eq!(
            selector_string(&labels),
            "matrixorigin.io/component=CNSet,matrixorigin.io/instance=mo,matrixorigin.io/namespace=ns"
        );
    }

    #[test]
    fn test_duration_parsing() {
        assert_eq!(parse_duration("10m").unwrap(), Duration::from_secs(600));
        assert_eq!(parse_duration("1h 30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(
            duration_or(None, Duration::from_secs(5)).unwrap(),
            Duration::from_secs(5)
        );
        assert!(parse_duration("ten minutes").is_err());
        assert_eq!(format_duration(Duration::from_secs(300)), "5m");
    }
}
