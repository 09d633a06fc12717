//! Transaction nodes: a stateful set pointed at the log service.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::core::v1::{
    ConfigMap, PersistentVolumeClaim, PersistentVolumeClaimSpec, Service,
    VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::Api;
use kube::ResourceExt;

use super::workload::{self, PodParts, UuidSource, COMPONENT_DNSET};
use super::{bucketclaim, pods_of, resolve_log_set};
use crate::common::conditions::{self, CONDITION_READY, CONDITION_SYNCED};
use crate::common::{sub_resource_labels, DATA_PATH, DATA_VOLUME, TN_LOG_TAIL_PORT, TN_SERVICE_PORT};
use crate::configmap;
use crate::crd::common::Volume;
use crate::crd::dnset::DNSetStatus;
use crate::crd::{DNSet, LogSet};
use crate::errors::*;
use crate::failover;
use crate::kruise::{
    AdvancedStatefulSet, AdvancedStatefulSetSpec, RollingUpdateStatefulSetStrategy,
    StatefulSetUpdateStrategy, POD_MANAGEMENT_PARALLEL, UPDATE_IN_PLACE_IF_POSSIBLE,
};
use crate::kube_utils;
use crate::runtime::{Actor, Context};
use crate::tomlconfig::TomlConfig;
use crate::version;

pub fn set_name(dn: &str) -> String {
    format!("{}-dn", dn)
}

pub fn headless_name(dn: &str) -> String {
    format!("{}-dn-headless", dn)
}

fn config_name(dn: &str) -> String {
    format!("{}-dn-config", dn)
}

fn default_config(dn: &DNSet, log_set: &LogSet, discovery: &str) -> TomlConfig {
    let mut c = TomlConfig::new();
    c.set(&["service-type"], "DN");
    c.set(&["data-dir"], format!("{}/data", DATA_PATH));
    c.set(&["log", "level"], "info");
    c.set(&["log", "format"], "json");
    c.set(&["dn", "uuid"], workload::UUID_PLACEHOLDER);
    c.set(
        &["dn", "listen-address"],
        format!("0.0.0.0:{}", TN_SERVICE_PORT),
    );
    c.set(
        &["dn", "service-address"],
        format!("{}:{}", workload::ADDR_PLACEHOLDER, TN_SERVICE_PORT),
    );
    c.set(
        &["dn", "LogtailServer", "listen-address"],
        format!("0.0.0.0:{}", TN_LOG_TAIL_PORT),
    );
    c.set(
        &["dn", "LogtailServer", "service-address"],
        format!("{}:{}", workload::ADDR_PLACEHOLDER, TN_LOG_TAIL_PORT),
    );
    workload::set_hakeeper_client(&mut c, discovery);
    workload::set_fileservice(
        &mut c,
        &log_set.spec.shared_storage,
        Some(&dn.spec.shared_storage_cache),
    );
    c
}

pub(crate) fn cache_claim(volume: &Volume) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(DATA_VOLUME.to_string()),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            storage_class_name: volume.storage_class_name.clone(),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([("storage".to_string(), volume.size.clone())])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Finalizer holding the bucket of the LogSet while the set runs.
fn bucket_finalizer(key: &str) -> String {
    bucketclaim::component_finalizer("DN", key)
}

pub struct DNSetActor;

#[async_trait]
impl Actor<DNSet> for DNSetActor {
    async fn observe(&self, ctx: &Context<DNSet>) -> Result<Option<Duration>> {
        let dn = ctx.obj.as_ref();
        let name = dn.name_any();
        let namespace = ctx.namespace()?;
        let labels = sub_resource_labels(&namespace, &name, COMPONENT_DNSET);
        let owner = kube_utils::owner_ref(dn);

        let log_set = resolve_log_set(ctx, &dn.spec.deps).await?;
        let discovery = log_set
            .discovery()
            .map(|d| d.endpoint())
            .unwrap_or_default();

        if let Some(s3) = &log_set.spec.shared_storage.s3 {
            if let Some(claim) = bucketclaim::find_claim(&ctx.client, s3).await? {
                bucketclaim::add_component_finalizer(&ctx.client, &claim, &bucket_finalizer(&ctx.key()))
                    .await?;
            }
        }

        let svc_api: Api<Service> = ctx.api();
        kube_utils::ensure(
            &svc_api,
            &workload::headless_service(
                workload::object_meta(&headless_name(&name), &namespace, labels.clone(), owner.clone()),
                &labels,
                &[
                    ("service", TN_SERVICE_PORT, TN_SERVICE_PORT),
                    ("logtail", TN_LOG_TAIL_PORT, TN_LOG_TAIL_PORT),
                ],
            ),
        )
        .await?;

        let template = workload::pod_template(PodParts {
            labels: labels.clone(),
            pod_set: &dn.spec.pod_set,
            headless_service: Some(headless_name(&name)),
            ports: vec![
                workload::tcp_port("service", TN_SERVICE_PORT),
                workload::tcp_port("logtail", TN_LOG_TAIL_PORT),
            ],
            env: workload::storage_env(&log_set.spec.shared_storage),
            mounts: dn
                .spec
                .cache_volume
                .as_ref()
                .map(|_| vec![workload::data_mount()])
                .unwrap_or_default(),
            volumes: vec![],
            readiness_gates: vec![],
        })?;
        let mut sts = AdvancedStatefulSet::new(
            &set_name(&name),
            AdvancedStatefulSetSpec {
                replicas: Some(dn.spec.pod_set.replicas),
                selector: workload::selector(&labels),
                template,
                service_name: headless_name(&name),
                pod_management_policy: Some(POD_MANAGEMENT_PARALLEL.to_string()),
                volume_claim_templates: dn.spec.cache_volume.iter().map(cache_claim).collect(),
                update_strategy: Some(StatefulSetUpdateStrategy {
                    type_: Some("RollingUpdate".to_string()),
                    rolling_update: Some(RollingUpdateStatefulSetStrategy {
                        pod_update_policy: Some(UPDATE_IN_PLACE_IF_POSSIBLE.to_string()),
                        ..Default::default()
                    }),
                }),
                ..Default::default()
            },
        );
        sts.metadata = workload::object_meta(&set_name(&name), &namespace, labels.clone(), owner.clone());

        let sts_api: Api<AdvancedStatefulSet> = ctx.api();
        let live = sts_api.get_opt(&set_name(&name)).await?;
        let pods = pods_of(ctx, &labels).await?;
        let cm_api: Api<ConfigMap> = ctx.api();
        let cm = workload::config_map(
            workload::object_meta(&config_name(&name), &namespace, labels.clone(), owner),
            workload::config_data(
                workload::render_config(default_config(dn, &log_set, &discovery), &dn.spec.pod_set)?,
                workload::start_script(UuidSource::DnsName, ""),
            ),
        );
        configmap::sync(
            &cm_api,
            cm,
            &mut sts.spec.template,
            live.as_ref().map(|s| &s.spec.template),
            &pods,
            version::inplace_configmap_update(&dn.metadata),
        )
        .await?;
        kube_utils::ensure(&sts_api, &sts).await?;

        let now = Utc::now();
        let prev = dn.status.clone().unwrap_or_default();
        let mut status = DNSetStatus {
            conditional: prev.conditional.clone(),
            failover: failover::collect_store_status(&pods, &prev.failover, now),
        };
        let up = status.failover.available_stores.len() as i32;
        let ready = up >= dn.spec.pod_set.replicas;
        conditions::set(
            &mut status.conditional.conditions,
            CONDITION_READY,
            ready,
            if ready { "AllStoresUp" } else { "StoresNotReady" },
            format!("{}/{} stores up", up, dn.spec.pod_set.replicas),
            now,
        );
        conditions::set(&mut status.conditional.conditions, CONDITION_SYNCED, true, "Synced", "", now);
        if Some(&status) != dn.status.as_ref() {
            ctx.patch_status(&status).await?;
        }
        Ok(if ready { None } else { Some(failover::MIN_READY) })
    }

    async fn finalize(&self, ctx: &Context<DNSet>) -> Result<bool> {
        let name = ctx.name();
        let sts_api: Api<AdvancedStatefulSet> = ctx.api();
        if !kube_utils::delete_if_exists(&sts_api, &set_name(&name)).await? {
            return Ok(false);
        }
        let labels = sub_resource_labels(&ctx.namespace()?, &name, COMPONENT_DNSET);
        if !pods_of(ctx, &labels).await?.is_empty() {
            return Ok(false);
        }
        release_bucket(ctx, &ctx.obj.spec.deps, "DN").await?;
        Ok(true)
    }
}

/// Drops the component's hold on the LogSet bucket, if any is left.
pub(crate) async fn release_bucket<K: crate::runtime::Object>(
    ctx: &Context<K>,
    deps: &crate::crd::common::Deps,
    component: &str,
) -> Result<()> {
    let Some(log_ref) = &deps.log_set else {
        return Ok(());
    };
    let namespace = ctx.namespace()?;
    let api: Api<LogSet> = ctx.api_in(log_ref.namespace_or(&namespace));
    let Some(log_set) = api.get_opt(&log_ref.name).await? else {
        return Ok(());
    };
    if let Some(s3) = &log_set.spec.shared_storage.s3 {
        let finalizer = bucketclaim::component_finalizer(component, &ctx.key());
        bucketclaim::remove_component_finalizer(&ctx.client, s3, &finalizer).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::common::{LogSetRef, S3Provider, SharedStorageCache};
    use crate::crd::dnset::DNSetSpec;
    use crate::crd::logset::LogSetSpec;
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use toml::Value;

    #[test]
    fn test_default_config() {
        let mut log_set = LogSet::new("mo", LogSetSpec::default());
        log_set.spec.shared_storage.s3 = Some(S3Provider {
            path: "bucket/mo".to_string(),
            ..Default::default()
        });
        let mut dn = DNSet::new("mo", DNSetSpec::default());
        dn.spec.deps.log_set = Some(LogSetRef {
            name: "mo".to_string(),
            namespace: None,
        });
        dn.spec.shared_storage_cache = SharedStorageCache {
            memory_cache_size: Some(Quantity("1Gi".to_string())),
            disk_cache_size: None,
        };
        let c = default_config(&dn, &log_set, "mo-log-discovery.default:32001");
        assert_eq!(c.get(&["service-type"]), Some(Value::from("DN")));
        assert_eq!(c.get(&["dn", "uuid"]), Some(Value::from(workload::UUID_PLACEHOLDER)));
        let fs = c.get(&["fileservice"]).unwrap();
        assert_eq!(fs[1]["cache"]["memory-capacity"].as_str(), Some("1Gi"));
        assert_eq!(
            c.get(&["hakeeper-client", "service-addresses"]),
            Some(Value::Array(vec![Value::from("mo-log-discovery.default:32001")]))
        );
    }

    #[test]
    fn test_names() {
        assert_eq!(set_name("mo"), "mo-dn");
        assert_eq!(headless_name("mo"), "mo-dn-headless");
        assert!(bucket_finalizer("default/mo").starts_with("matrixorigin.io/DN-"));
    }
}
