//! SQL proxy in front of the CN sets.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::core::v1::{ConfigMap, Service};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::Api;
use kube::ResourceExt;

use super::workload::{self, PodParts, UuidSource, COMPONENT_PROXYSET};
use super::{pods_of, resolve_log_set};
use crate::common::conditions::{self, CONDITION_READY, CONDITION_SYNCED};
use crate::common::{sub_resource_labels, CN_SQL_PORT, PROXY_PORT};
use crate::configmap;
use crate::crd::proxyset::ProxySetStatus;
use crate::crd::ProxySet;
use crate::errors::*;
use crate::kruise::{CloneSet, CloneSetSpec, CloneSetUpdateStrategy, UPDATE_IN_PLACE_IF_POSSIBLE};
use crate::kube_utils;
use crate::runtime::{Actor, Context};
use crate::tomlconfig::TomlConfig;
use crate::version;

const ROLLOUT_POLL: Duration = Duration::from_secs(15);

pub fn set_name(proxy: &str) -> String {
    format!("{}-proxy", proxy)
}

/// Client-facing service; speaks the MySQL protocol on the CN SQL port.
pub fn service_name(proxy: &str) -> String {
    format!("{}-proxy", proxy)
}

fn headless_name(proxy: &str) -> String {
    format!("{}-proxy-headless", proxy)
}

fn config_name(proxy: &str) -> String {
    format!("{}-proxy-config", proxy)
}

fn default_config(discovery: &str) -> TomlConfig {
    let mut c = TomlConfig::new();
    c.set(&["service-type"], "PROXY");
    c.set(&["log", "level"], "info");
    c.set(&["log", "format"], "json");
    c.set(&["proxy", "uuid"], workload::UUID_PLACEHOLDER);
    c.set(&["proxy", "listen-address"], format!("0.0.0.0:{}", PROXY_PORT));
    workload::set_hakeeper_client(&mut c, discovery);
    c
}

pub struct ProxySetActor;

#[async_trait]
impl Actor<ProxySet> for ProxySetActor {
    async fn observe(&self, ctx: &Context<ProxySet>) -> Result<Option<Duration>> {
        let proxy = ctx.obj.as_ref();
        let name = proxy.name_any();
        let namespace = ctx.namespace()?;
        let labels = sub_resource_labels(&namespace, &name, COMPONENT_PROXYSET);
        let owner = kube_utils::owner_ref(proxy);

        let log_set = resolve_log_set(ctx, &proxy.spec.deps).await?;
        let discovery = log_set.discovery().map(|d| d.endpoint()).unwrap_or_default();

        let svc_api: Api<Service> = ctx.api();
        kube_utils::ensure(
            &svc_api,
            &workload::headless_service(
                workload::object_meta(&headless_name(&name), &namespace, labels.clone(), owner.clone()),
                &labels,
                &[("proxy", PROXY_PORT, PROXY_PORT)],
            ),
        )
        .await?;
        kube_utils::ensure(
            &svc_api,
            &workload::service(
                workload::object_meta(&service_name(&name), &namespace, labels.clone(), owner.clone()),
                &labels,
                &[("sql", CN_SQL_PORT, PROXY_PORT)],
                proxy.spec.service_type.as_deref(),
                proxy.spec.node_port,
            ),
        )
        .await?;

        let template = workload::pod_template(PodParts {
            labels: labels.clone(),
            pod_set: &proxy.spec.pod_set,
            headless_service: Some(headless_name(&name)),
            ports: vec![workload::tcp_port("proxy", PROXY_PORT)],
            env: vec![],
            mounts: vec![],
            volumes: vec![],
            readiness_gates: vec![],
        })?;
        let mut cs = CloneSet::new(
            &set_name(&name),
            CloneSetSpec {
                replicas: Some(proxy.spec.pod_set.replicas),
                selector: workload::selector(&labels),
                template,
                update_strategy: Some(CloneSetUpdateStrategy {
                    type_: Some(UPDATE_IN_PLACE_IF_POSSIBLE.to_string()),
                    max_unavailable: Some(IntOrString::Int(1)),
                    ..Default::default()
                }),
                ..Default::default()
            },
        );
        cs.metadata = workload::object_meta(&set_name(&name), &namespace, labels.clone(), owner.clone());

        let cs_api: Api<CloneSet> = ctx.api();
        let live = cs_api.get_opt(&set_name(&name)).await?;
        let pods = pods_of(ctx, &labels).await?;
        let cm_api: Api<ConfigMap> = ctx.api();
        let cm = workload::config_map(
            workload::object_meta(&config_name(&name), &namespace, labels.clone(), owner),
            workload::config_data(
                workload::render_config(default_config(&discovery), &proxy.spec.pod_set)?,
                workload::start_script(UuidSource::DnsName, ""),
            ),
        );
        configmap::sync(
            &cm_api,
            cm,
            &mut cs.spec.template,
            live.as_ref().map(|s| &s.spec.template),
            &pods,
            version::inplace_configmap_update(&proxy.metadata),
        )
        .await?;
        let cs = kube_utils::ensure(&cs_api, &cs).await?;

        let now = Utc::now();
        let mut status = ProxySetStatus {
            conditional: proxy.status.clone().unwrap_or_default().conditional,
            ready_replicas: cs.observed().ready_replicas,
        };
        let ready = status.ready_replicas >= proxy.spec.pod_set.replicas;
        conditions::set(
            &mut status.conditional.conditions,
            CONDITION_READY,
            ready,
            if ready { "AllReady" } else { "RollingOut" },
            format!("{}/{} ready", status.ready_replicas, proxy.spec.pod_set.replicas),
            now,
        );
        conditions::set(&mut status.conditional.conditions, CONDITION_SYNCED, true, "Synced", "", now);
        if Some(&status) != proxy.status.as_ref() {
            ctx.patch_status(&status).await?;
        }
        Ok((!ready).then_some(ROLLOUT_POLL))
    }
}
