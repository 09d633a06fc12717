//! Compute nodes: a clone set with drain hooks and readiness-gated updates.
//!
//! Template changes are classified against the live clone set. Changes that
//! only touch labels, annotations, lifecycle hooks or scaling are patched in
//! place; anything else replaces the spec and rolls pods. `pauseUpdate`
//! freezes the latter but keeps the former flowing.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::core::v1::{ConfigMap, EnvVar, Pod, Service};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::ResourceExt;
use log::{debug, info};
use serde_json::{json, Value};

use super::workload::{self, PodParts, UuidSource, COMPONENT_CNSET};
use super::{bucketclaim, dnset, pods_of, resolve_log_set};
use crate::common::conditions::{self, CONDITION_READY, CONDITION_SYNCED};
use crate::common::{
    identity, pod, selector_string, sub_resource_labels, ANN_CN_LABELS,
    ANN_FORCE_SPECIFIED_DELETE, CN_DEBUG_PORT, CN_SERVICE_PORT, CN_SQL_PORT, DATA_PATH,
    FINALIZER_CN_DRAINING, GATE_CN_POOL, GATE_CN_STORE, GATE_KRUISE_INPLACE,
};
use crate::configmap;
use crate::crd::cnset::{CNRole, CNSetSpec, CNSetStatus, CNStore, TerminationPolicy};
use crate::crd::{CNSet, LogSet};
use crate::errors::*;
use crate::kruise::{
    CloneSet, CloneSetScaleStrategy, CloneSetSpec, CloneSetUpdateStrategy, Lifecycle,
    LifecycleHook, UPDATE_IN_PLACE_IF_POSSIBLE,
};
use crate::kube_utils::{self, json_contains};
use crate::probe::StoreProbe;
use crate::runtime::{Actor, Context};
use crate::tomlconfig::TomlConfig;
use crate::version::{self, MOFeature};
use crate::FIELD_MANAGER;

const DRAIN_POLL: Duration = Duration::from_secs(5);
const ROLLOUT_POLL: Duration = Duration::from_secs(15);

pub fn set_name(cn: &str) -> String {
    format!("{}-cn", cn)
}

pub fn headless_name(cn: &str) -> String {
    format!("{}-cn-headless", cn)
}

/// The SQL service of the set.
pub fn service_name(cn: &str) -> String {
    format!("{}-cn", cn)
}

fn config_name(cn: &str) -> String {
    format!("{}-cn-config", cn)
}

fn role_str(role: CNRole) -> &'static str {
    match role {
        CNRole::TP => "TP",
        CNRole::AP => "AP",
    }
}

fn default_config(spec: &CNSetSpec, log_set: &LogSet, discovery: &str) -> TomlConfig {
    let mut c = TomlConfig::new();
    c.set(&["service-type"], "CN");
    c.set(&["data-dir"], format!("{}/data", DATA_PATH));
    c.set(&["log", "level"], "info");
    c.set(&["log", "format"], "json");
    c.set(&["cn", "uuid"], workload::UUID_PLACEHOLDER);
    c.set(&["cn", "role"], role_str(spec.role()));
    c.set(&["cn", "listen-address"], format!("0.0.0.0:{}", CN_SERVICE_PORT));
    c.set(
        &["cn", "service-address"],
        format!("{}:{}", workload::ADDR_PLACEHOLDER, CN_SERVICE_PORT),
    );
    c.set(
        &["cn", "sql-address"],
        format!("{}:{}", workload::ADDR_PLACEHOLDER, CN_SQL_PORT),
    );
    c.set(&["cn", "frontend", "port"], i64::from(CN_SQL_PORT));
    c.set(&["cn", "frontend", "host"], "0.0.0.0");
    workload::set_hakeeper_client(&mut c, discovery);
    workload::set_fileservice(
        &mut c,
        &log_set.spec.shared_storage,
        Some(&spec.shared_storage_cache),
    );
    c
}

fn drain_hook() -> LifecycleHook {
    LifecycleHook {
        finalizers_handler: vec![FINALIZER_CN_DRAINING.to_string()],
        mark_pod_not_ready: true,
        ..Default::default()
    }
}

/// How the live clone set must change to match the desired one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdatePlan {
    None,
    InPlace,
    Full,
}

/// The fields of a clone set that can change without rolling pods.
fn safe_fields(cs: &CloneSet) -> Value {
    let template_meta = cs.spec.template.metadata.clone().unwrap_or_default();
    json!({
        "metadata": {
            "labels": cs.metadata.labels,
            "annotations": cs.metadata.annotations,
        },
        "spec": {
            "replicas": cs.spec.replicas,
            "scaleStrategy": cs.spec.scale_strategy,
            "lifecycle": cs.spec.lifecycle,
            "template": {
                "metadata": {
                    "labels": template_meta.labels,
                    "annotations": template_meta.annotations,
                },
            },
        },
    })
}

fn without_safe_fields(cs: &CloneSet) -> Result<Value> {
    let mut v = serde_json::to_value(cs)?;
    if let Some(meta) = v.get_mut("metadata").and_then(Value::as_object_mut) {
        meta.remove("labels");
        meta.remove("annotations");
        meta.remove("resourceVersion");
    }
    if let Some(spec) = v.get_mut("spec").and_then(Value::as_object_mut) {
        spec.remove("replicas");
        spec.remove("scaleStrategy");
        spec.remove("lifecycle");
        if let Some(meta) = spec
            .get_mut("template")
            .and_then(|t| t.get_mut("metadata"))
            .and_then(Value::as_object_mut)
        {
            meta.remove("labels");
            meta.remove("annotations");
        }
    }
    if let Some(obj) = v.as_object_mut() {
        obj.remove("status");
    }
    Ok(v)
}

pub fn classify(live: &CloneSet, desired: &CloneSet) -> Result<UpdatePlan> {
    let mut want = serde_json::to_value(desired)?;
    if let Some(obj) = want.as_object_mut() {
        obj.remove("status");
    }
    if json_contains(&want, &serde_json::to_value(live)?) {
        return Ok(UpdatePlan::None);
    }
    if json_contains(&without_safe_fields(desired)?, &without_safe_fields(live)?) {
        return Ok(UpdatePlan::InPlace);
    }
    Ok(UpdatePlan::Full)
}

/// Stores of the set's pods, keyed by their DNS-derived UUID.
pub async fn collect_stores(
    probe: &dyn StoreProbe,
    pods: &[Pod],
    headless: &str,
    namespace: &str,
) -> Result<Vec<CNStore>> {
    let mut stores = Vec::with_capacity(pods.len());
    for p in pods {
        let name = pod::name(p);
        stores.push(CNStore {
            uuid: identity::cn_store_uuid(name, headless, namespace),
            pod_name: name.to_string(),
            state: probe.cn_store_state(p).await?,
        });
    }
    stores.sort_by(|a, b| a.pod_name.cmp(&b.pod_name));
    Ok(stores)
}

pub fn desired_clone_set(
    cn: &CNSet,
    namespace: &str,
    labels: &BTreeMap<String, String>,
    env: Vec<EnvVar>,
) -> Result<CloneSet> {
    let name = cn.name_any();
    let spec = &cn.spec;

    let mut gates = vec![GATE_KRUISE_INPLACE.to_string(), GATE_CN_STORE.to_string()];
    if spec.is_pooling() {
        gates.push(GATE_CN_POOL.to_string());
    }
    let mut template = workload::pod_template(PodParts {
        labels: labels.clone(),
        pod_set: &spec.pod_set,
        headless_service: Some(headless_name(&name)),
        ports: vec![
            workload::tcp_port("sql", CN_SQL_PORT),
            workload::tcp_port("service", CN_SERVICE_PORT),
            workload::tcp_port("debug", CN_DEBUG_PORT),
        ],
        env,
        mounts: spec
            .cache_volume
            .as_ref()
            .map(|_| vec![workload::data_mount()])
            .unwrap_or_default(),
        volumes: vec![],
        readiness_gates: gates,
    })?;
    if !spec.cn_labels.is_empty()
        && version::mo_has(spec.pod_set.semantic_version.as_deref(), MOFeature::CNLabel)
    {
        template
            .metadata
            .get_or_insert_with(Default::default)
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(ANN_CN_LABELS.to_string(), serde_json::to_string(&spec.cn_labels)?);
    }

    let lifecycle = spec.drains().then(|| Lifecycle {
        pre_delete: Some(drain_hook()),
        in_place_update: Some(drain_hook()),
    });
    let mut cs = CloneSet::new(
        &set_name(&name),
        CloneSetSpec {
            replicas: Some(spec.pod_set.replicas),
            selector: workload::selector(labels),
            template,
            volume_claim_templates: spec.cache_volume.iter().map(dnset::cache_claim).collect(),
            scale_strategy: Some(CloneSetScaleStrategy {
                pods_to_delete: spec.pods_to_delete.clone(),
                ..Default::default()
            }),
            update_strategy: Some(CloneSetUpdateStrategy {
                type_: Some(UPDATE_IN_PLACE_IF_POSSIBLE.to_string()),
                max_surge: Some(
                    spec.update_strategy
                        .max_surge
                        .clone()
                        .unwrap_or(IntOrString::Int(1)),
                ),
                max_unavailable: Some(
                    spec.update_strategy
                        .max_unavailable
                        .clone()
                        .unwrap_or(IntOrString::Int(0)),
                ),
                ..Default::default()
            }),
            lifecycle,
            min_ready_seconds: spec.scaling_config.min_delay_seconds,
        },
    );
    cs.metadata = workload::object_meta(
        &set_name(&name),
        namespace,
        labels.clone(),
        kube_utils::owner_ref(cn),
    );
    if spec.is_pooling() {
        cs.metadata.annotations = Some(BTreeMap::from([(
            ANN_FORCE_SPECIFIED_DELETE.to_string(),
            "true".to_string(),
        )]));
    }
    Ok(cs)
}

fn bucket_finalizer(key: &str) -> String {
    bucketclaim::component_finalizer("CN", key)
}

pub struct CNSetActor {
    pub probe: Arc<dyn StoreProbe>,
}

impl CNSetActor {
    async fn sync_clone_set(
        &self,
        ctx: &Context<CNSet>,
        live: Option<CloneSet>,
        desired: CloneSet,
    ) -> Result<CloneSet> {
        let api: Api<CloneSet> = ctx.api();
        let name = desired.name_any();
        let Some(live) = live else {
            info!("creating clone set {}", name);
            return Ok(api.create(&PostParams::default(), &desired).await?);
        };
        match classify(&live, &desired)? {
            UpdatePlan::None => Ok(live),
            UpdatePlan::Full if !ctx.obj.spec.pause_update => {
                info!("rolling clone set {}", name);
                let pp = PatchParams::apply(FIELD_MANAGER).force();
                Ok(api.patch(&name, &pp, &Patch::Apply(&desired)).await?)
            }
            plan => {
                debug!("patching clone set {} in place ({:?})", name, plan);
                kube_utils::cas_merge(&api, &live, safe_fields(&desired)).await
            }
        }
    }
}

#[async_trait]
impl Actor<CNSet> for CNSetActor {
    async fn observe(&self, ctx: &Context<CNSet>) -> Result<Option<Duration>> {
        let cn = ctx.obj.as_ref();
        let name = cn.name_any();
        let namespace = ctx.namespace()?;
        let labels = sub_resource_labels(&namespace, &name, COMPONENT_CNSET);
        let owner = kube_utils::owner_ref(cn);

        let log_set = resolve_log_set(ctx, &cn.spec.deps).await?;
        let discovery = log_set.discovery().map(|d| d.endpoint()).unwrap_or_default();
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
                &[("service", CN_SERVICE_PORT, CN_SERVICE_PORT)],
            ),
        )
        .await?;
        kube_utils::ensure(
            &svc_api,
            &workload::service(
                workload::object_meta(&service_name(&name), &namespace, labels.clone(), owner.clone()),
                &labels,
                &[("sql", CN_SQL_PORT, CN_SQL_PORT)],
                cn.spec.service_type.as_deref(),
                cn.spec.node_port,
            ),
        )
        .await?;

        let cs_api: Api<CloneSet> = ctx.api();
        let live = cs_api.get_opt(&set_name(&name)).await?;
        let pods = pods_of(ctx, &labels).await?;
        let mut desired = desired_clone_set(
            cn,
            &namespace,
            &labels,
            workload::storage_env(&log_set.spec.shared_storage),
        )?;
        let cm_api: Api<ConfigMap> = ctx.api();
        let cm = workload::config_map(
            workload::object_meta(&config_name(&name), &namespace, labels.clone(), owner),
            workload::config_data(
                workload::render_config(default_config(&cn.spec, &log_set, &discovery), &cn.spec.pod_set)?,
                workload::start_script(UuidSource::DnsName, ""),
            ),
        );
        configmap::sync(
            &cm_api,
            cm,
            &mut desired.spec.template,
            live.as_ref().map(|s| &s.spec.template),
            &pods,
            version::inplace_configmap_update(&cn.metadata),
        )
        .await?;
        let cs = self.sync_clone_set(ctx, live, desired).await?;

        let now = Utc::now();
        let prev = cn.status.clone().unwrap_or_default();
        let observed = cs.observed();
        let mut status = CNSetStatus {
            conditional: prev.conditional.clone(),
            stores: collect_stores(self.probe.as_ref(), &pods, &headless_name(&name), &namespace).await?,
            replicas: observed.replicas,
            ready_replicas: observed.ready_replicas,
            label_selector: Some(selector_string(&labels)),
            host: Some(format!("{}.{}", service_name(&name), namespace)),
            port: Some(CN_SQL_PORT),
        };
        let ready = cs.is_rolled_out() && observed.ready_replicas >= cn.spec.pod_set.replicas;
        conditions::set(
            &mut status.conditional.conditions,
            CONDITION_READY,
            ready,
            if ready { "AllReady" } else { "RollingOut" },
            format!("{}/{} ready", observed.ready_replicas, cn.spec.pod_set.replicas),
            now,
        );
        conditions::set(&mut status.conditional.conditions, CONDITION_SYNCED, true, "Synced", "", now);
        if Some(&status) != cn.status.as_ref() {
            ctx.patch_status(&status).await?;
        }
        Ok(if ready { None } else { Some(ROLLOUT_POLL) })
    }

    async fn finalize(&self, ctx: &Context<CNSet>) -> Result<bool> {
        let name = ctx.name();
        let cs_api: Api<CloneSet> = ctx.api();
        if ctx.obj.spec.termination_policy == Some(TerminationPolicy::Drain) {
            if let Some(cs) = cs_api.get_opt(&set_name(&name)).await? {
                if cs.replicas() != 0 {
                    info!("{}: draining before deletion", ctx.key());
                    kube_utils::cas_merge(&cs_api, &cs, json!({ "spec": { "replicas": 0 } })).await?;
                    return Ok(false);
                }
                if cs.observed().replicas > 0 {
                    return Err(resync("waiting for pods to drain", DRAIN_POLL));
                }
            }
        }
        if !kube_utils::delete_if_exists(&cs_api, &set_name(&name)).await? {
            return Ok(false);
        }
        let svc_api: Api<Service> = ctx.api();
        kube_utils::delete_if_exists(&svc_api, &service_name(&name)).await?;
        kube_utils::delete_if_exists(&svc_api, &headless_name(&name)).await?;
        dnset::release_bucket(ctx, &ctx.obj.spec.deps, "CN").await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::cnset::CNLabel;
    use crate::crd::cnset::CNStoreState;
    use crate::probe::MockStoreProbe;

    fn cn_set() -> CNSet {
        let mut cn = CNSet::new("mo-tp", CNSetSpec::default());
        cn.metadata.namespace = Some("default".to_string());
        cn.spec.pod_set.replicas = 2;
        cn.spec.pod_set.image = Some("matrixorigin/matrixone:1.2.0".to_string());
        cn
    }

    fn rendered(cn: &CNSet) -> CloneSet {
        let labels = sub_resource_labels("default", "mo-tp", COMPONENT_CNSET);
        desired_clone_set(cn, "default", &labels, vec![]).unwrap()
    }

    #[test]
    fn test_converged_set_needs_no_write() {
        let cs = rendered(&cn_set());
        assert_eq!(classify(&cs, &cs).unwrap(), UpdatePlan::None);
    }

    #[test]
    fn test_label_and_scale_changes_are_in_place() {
        let live = rendered(&cn_set());
        let mut cn = cn_set();
        cn.spec.pod_set.replicas = 5;
        cn.spec.pods_to_delete = vec!["mo-tp-cn-abcde".to_string()];
        cn.spec.pod_set.overlay = Some(crate::crd::common::Overlay {
            pod_labels: BTreeMap::from([("team".to_string(), "db".to_string())]),
            ..Default::default()
        });
        assert_eq!(classify(&live, &rendered(&cn)).unwrap(), UpdatePlan::InPlace);

        cn.spec.scaling_config.store_drain_enabled = Some(true);
        assert_eq!(classify(&live, &rendered(&cn)).unwrap(), UpdatePlan::InPlace);
    }

    #[test]
    fn test_image_change_rolls() {
        let live = rendered(&cn_set());
        let mut cn = cn_set();
        cn.spec.pod_set.image = Some("matrixorigin/matrixone:1.2.1".to_string());
        assert_eq!(classify(&live, &rendered(&cn)).unwrap(), UpdatePlan::Full);
    }

    #[test]
    fn test_safe_fields_carry_scale_and_hooks() {
        let mut cn = cn_set();
        cn.spec.scaling_config.store_drain_enabled = Some(true);
        let v = safe_fields(&rendered(&cn));
        assert_eq!(v["spec"]["replicas"], 2);
        assert_eq!(
            v["spec"]["lifecycle"]["preDelete"]["finalizersHandler"][0],
            FINALIZER_CN_DRAINING
        );
        assert!(v["spec"].get("template").unwrap()["metadata"].get("labels").is_some());
    }

    #[test]
    fn test_readiness_gates_and_labels() {
        let mut cn = cn_set();
        cn.spec.cn_labels = vec![CNLabel {
            key: "tenant".to_string(),
            values: vec!["a".to_string()],
        }];
        let cs = rendered(&cn);
        let gates: Vec<String> = cs.spec.template.spec.as_ref().unwrap()
            .readiness_gates.as_ref().unwrap()
            .iter().map(|g| g.condition_type.clone()).collect();
        assert_eq!(gates, vec![GATE_KRUISE_INPLACE, GATE_CN_STORE]);
        let ann = cs.spec.template.metadata.as_ref().unwrap().annotations.as_ref().unwrap();
        assert_eq!(ann[ANN_CN_LABELS], r#"[{"key":"tenant","values":["a"]}]"#);

        cn.spec.pod_management_policy = Some("Pooling".to_string());
        cn.spec.pod_set.semantic_version = Some("1.0.0".to_string());
        let cs = rendered(&cn);
        let spec = cs.spec.template.spec.as_ref().unwrap();
        assert_eq!(spec.readiness_gates.as_ref().unwrap().len(), 3);
        assert!(cs.spec.template.metadata.as_ref().unwrap().annotations.as_ref().unwrap().get(ANN_CN_LABELS).is_none());
    }

    #[tokio::test]
    async fn test_collect_stores_uses_dns_uuid() {
        let mut probe = MockStoreProbe::new();
        probe.expect_cn_store_state().returning(|_| Ok(CNStoreState::Up));
        let pods = vec![
            crate::common::pod::testing::pod("mo-tp-cn-b", None),
            crate::common::pod::testing::pod("mo-tp-cn-a", None),
        ];
        let stores = collect_stores(&probe, &pods, "mo-tp-cn-headless", "default").await.unwrap();
        assert_eq!(stores[0].pod_name, "mo-tp-cn-a");
        assert_eq!(
            stores[0].uuid,
            identity::cn_store_uuid("mo-tp-cn-a", "mo-tp-cn-headless", "default")
        );
        assert_eq!(stores[1].state, CNStoreState::Up);
    }
}
