//! Defaulting applied on admission, so the stored spec states every intent.

use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use super::quantity;
use crate::crd::cluster::MatrixOneClusterSpec;
use crate::crd::cnset::{CNSetSpec, DEFAULT_STORE_DRAIN_TIMEOUT};
use crate::crd::common::{PodSet, RetentionPolicy, SharedStorageCache, Volume};
use crate::crd::dnset::DNSetSpec;
use crate::crd::logset::{LogSetSpec, DEFAULT_STORE_FAILURE_TIMEOUT};

const MEMORY_CACHE_RATIO: f64 = 0.5;
const DISK_CACHE_RATIO: f64 = 0.9;

pub fn log_set(spec: &mut LogSetSpec) {
    let replicas = spec.pod_set.replicas;
    let init = &mut spec.initial_config;
    init.log_shard_replicas.get_or_insert(replicas.min(3));
    init.log_shards.get_or_insert(1);
    init.dn_shards.get_or_insert(1);
    init.hakeeper_replicas
        .get_or_insert(if replicas >= 3 { 3 } else { 1 });
    if spec.store_failure_timeout.is_none() {
        spec.store_failure_timeout = Some(DEFAULT_STORE_FAILURE_TIMEOUT.to_string());
    }
    match spec.shared_storage.s3.as_mut() {
        Some(s3) => {
            let policy = spec
                .pvc_retention_policy
                .or(s3.s3_retention_policy)
                .unwrap_or(RetentionPolicy::Delete);
            spec.pvc_retention_policy.get_or_insert(policy);
            s3.s3_retention_policy.get_or_insert(policy);
        }
        None => {
            spec.pvc_retention_policy.get_or_insert(RetentionPolicy::Delete);
        }
    }
}

/// Cache sizes derived from the memory request and the cache volume.
fn cache(pod_set: &PodSet, cache_volume: Option<&Volume>, cache: &mut SharedStorageCache) {
    if cache.memory_cache_size.is_none() {
        cache.memory_cache_size = pod_set
            .resources
            .as_ref()
            .and_then(|r| r.requests.as_ref())
            .and_then(|r| r.get("memory"))
            .and_then(|m| quantity::fraction(m, MEMORY_CACHE_RATIO));
    }
    if cache.disk_cache_size.is_none() {
        cache.disk_cache_size = cache_volume.and_then(|v| quantity::fraction(&v.size, DISK_CACHE_RATIO));
    }
}

pub fn dn_set(spec: &mut DNSetSpec) {
    cache(&spec.pod_set, spec.cache_volume.as_ref(), &mut spec.shared_storage_cache);
}

pub fn cn_set(spec: &mut CNSetSpec) {
    spec.service_type.get_or_insert_with(|| "ClusterIP".to_string());
    cache(&spec.pod_set, spec.cache_volume.as_ref(), &mut spec.shared_storage_cache);
    spec.update_strategy.max_surge.get_or_insert(IntOrString::Int(1));
    spec.update_strategy.max_unavailable.get_or_insert(IntOrString::Int(0));
    if spec.drains() && spec.scaling_config.store_drain_timeout.is_none() {
        spec.scaling_config.store_drain_timeout = Some(DEFAULT_STORE_DRAIN_TIMEOUT.to_string());
    }
}

pub fn cluster(spec: &mut MatrixOneClusterSpec) {
    log_set(&mut spec.log_service);
    for tn in [spec.tn.as_mut(), spec.dn.as_mut()].into_iter().flatten() {
        dn_set(tn);
    }
    for cn in [spec.tp.as_mut(), spec.ap.as_mut()].into_iter().flatten() {
        cn_set(cn);
    }
    for group in spec.cn_groups.iter_mut() {
        cn_set(&mut group.spec);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::common::{S3Provider, SharedStorageProvider};
    use k8s_openapi::api::core::v1::ResourceRequirements;
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use std::collections::BTreeMap;

    #[test]
    fn test_log_set_defaults() {
        let mut spec = LogSetSpec::default();
        spec.pod_set.replicas = 1;
        log_set(&mut spec);
        assert_eq!(spec.initial_config.log_shard_replicas, Some(1));
        assert_eq!(spec.initial_config.hakeeper_replicas, Some(1));
        assert_eq!(spec.initial_config.log_shards, Some(1));
        assert_eq!(spec.initial_config.dn_shards, Some(1));
        assert_eq!(spec.store_failure_timeout.as_deref(), Some("10m"));
        assert_eq!(spec.pvc_retention_policy, Some(RetentionPolicy::Delete));

        let mut ha = LogSetSpec::default();
        ha.pod_set.replicas = 5;
        log_set(&mut ha);
        assert_eq!(ha.initial_config.log_shard_replicas, Some(3));
        assert_eq!(ha.initial_config.hakeeper_replicas, Some(3));
    }

    #[test]
    fn test_retention_propagates_from_s3() {
        let mut spec = LogSetSpec {
            shared_storage: SharedStorageProvider {
                s3: Some(S3Provider {
                    path: "bucket/mo".to_string(),
                    s3_retention_policy: Some(RetentionPolicy::Retain),
                    ..Default::default()
                }),
                ..Default::default()
            },
            ..Default::default()
        };
        log_set(&mut spec);
        assert_eq!(spec.pvc_retention_policy, Some(RetentionPolicy::Retain));

        spec.shared_storage.s3.as_mut().unwrap().s3_retention_policy = None;
        spec.pvc_retention_policy = Some(RetentionPolicy::Delete);
        log_set(&mut spec);
        assert_eq!(
            spec.shared_storage.s3.unwrap().s3_retention_policy,
            Some(RetentionPolicy::Delete)
        );
    }

    #[test]
    fn test_cn_set_defaults() {
        let mut spec = CNSetSpec::default();
        spec.pod_set.resources = Some(ResourceRequirements {
            requests: Some(BTreeMap::from([("memory".to_string(), Quantity("8Gi".to_string()))])),
            ..Default::default()
        });
        spec.cache_volume = Some(Volume {
            size: Quantity("100Gi".to_string()),
            storage_class_name: None,
        });
        spec.scaling_config.store_drain_enabled = Some(true);
        cn_set(&mut spec);
        assert_eq!(spec.service_type.as_deref(), Some("ClusterIP"));
        assert_eq!(spec.shared_storage_cache.memory_cache_size, Some(Quantity("4Gi".to_string())));
        assert_eq!(spec.shared_storage_cache.disk_cache_size, Some(Quantity("90Gi".to_string())));
        assert_eq!(spec.update_strategy.max_surge, Some(IntOrString::Int(1)));
        assert_eq!(spec.update_strategy.max_unavailable, Some(IntOrString::Int(0)));
        assert_eq!(spec.scaling_config.store_drain_timeout.as_deref(), Some("5m"));
    }

    #[test]
    fn test_user_values_are_kept() {
        let mut spec = CNSetSpec {
            service_type: Some("NodePort".to_string()),
            ..Default::default()
        };
        spec.shared_storage_cache.memory_cache_size = Some(Quantity("1Gi".to_string()));
        cn_set(&mut spec);
        assert_eq!(spec.service_type.as_deref(), Some("NodePort"));
        assert_eq!(spec.shared_storage_cache.memory_cache_size, Some(Quantity("1Gi".to_string())));
        assert!(spec.scaling_config.store_drain_timeout.is_none());
    }
}
