//! The cluster composes one of each set and reports their combined health.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::core::v1::{LocalObjectReference, Secret};
use kube::api::Api;
use kube::ResourceExt;
use log::info;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::workload;
use super::{cnset, proxyset};
use crate::common::conditions::{self, Conditional, CONDITION_READY, CONDITION_SYNCED};
use crate::common::{identity, CN_SQL_PORT, LABEL_CLUSTER};
use crate::crd::cluster::{ComponentStatus, MatrixOneClusterSpec, MatrixOneClusterStatus};
use crate::crd::cnset::{CNRole, CNSetSpec};
use crate::crd::common::{Deps, LogSetRef, PodSet};
use crate::crd::proxyset::{ProxySetSpec, WebUISpec};
use crate::crd::{CNSet, DNSet, LogSet, MatrixOneCluster, ProxySet, WebUI};
use crate::errors::*;
use crate::kube_utils::{self, ScopedApi};
use crate::runtime::{Actor, Context};
use crate::version::{self, MOFeature};

pub const CREDENTIAL_USER_KEY: &str = "username";
pub const CREDENTIAL_PASSWORD_KEY: &str = "password";
const ROOT_USER: &str = "root";
const PASSWORD_LENGTH: usize = 16;
const CONVERGE_POLL: Duration = Duration::from_secs(15);

pub fn credential_name(cluster: &str) -> String {
    format!("{}-credential", cluster)
}

pub fn tp_name(cluster: &str) -> String {
    format!("{}-tp", cluster)
}

pub fn ap_name(cluster: &str) -> String {
    format!("{}-ap", cluster)
}

pub fn group_name(cluster: &str, group: &str) -> String {
    format!("{}-{}", cluster, group)
}

/// Fills the fields a component left unset from the cluster-wide ones.
pub fn inherit(pod_set: &mut PodSet, spec: &MatrixOneClusterSpec, default_repository: &str) {
    if pod_set.image.as_deref().map_or(true, str::is_empty) {
        let repository = spec.image_repository.as_deref().unwrap_or(default_repository);
        pod_set.image = Some(format!("{}:{}", repository, spec.version));
    }
    if pod_set.semantic_version.is_none() {
        pod_set.semantic_version = Some(spec.version.trim_start_matches('v').to_string());
    }
    if pod_set.node_selector.is_none() {
        pod_set.node_selector = spec.node_selector.clone();
    }
    if pod_set.image_pull_policy.is_none() {
        pod_set.image_pull_policy = spec.image_pull_policy.clone();
    }
    if pod_set.topology_spread.is_empty() {
        pod_set.topology_spread = spec.topology_spread.clone();
    }
    if pod_set.export_to_prometheus.is_none() {
        pod_set.export_to_prometheus = spec.metric_reader_enabled;
    }
}

fn log_deps(cluster: &str) -> Deps {
    Deps {
        log_set: Some(LogSetRef {
            name: cluster.to_string(),
            namespace: None,
        }),
    }
}

/// The CN sets of the cluster, by child name.
pub fn cn_sets(
    cluster: &str,
    spec: &MatrixOneClusterSpec,
    default_repository: &str,
) -> Result<BTreeMap<String, CNSetSpec>> {
    let mut sets = BTreeMap::new();
    let mut add = |name: String, mut cn: CNSetSpec, role: Option<CNRole>| -> Result<()> {
        inherit(&mut cn.pod_set, spec, default_repository);
        cn.deps = log_deps(cluster);
        if cn.role.is_none() {
            cn.role = role;
        }
        if sets.insert(name.clone(), cn).is_some() {
            return Err(invariant("DuplicateCNGroup", format!("CN set {} is declared twice", name)));
        }
        Ok(())
    };
    if let Some(tp) = &spec.tp {
        add(tp_name(cluster), tp.clone(), Some(CNRole::TP))?;
    }
    if let Some(ap) = &spec.ap {
        add(ap_name(cluster), ap.clone(), Some(CNRole::AP))?;
    }
    for group in &spec.cn_groups {
        add(group_name(cluster, &group.name), group.spec.clone(), None)?;
    }
    Ok(sets)
}

/// Host and port clients should use: the proxy if any, else the TP CN set.
pub fn sql_endpoint(
    cluster: &str,
    namespace: &str,
    spec: &MatrixOneClusterSpec,
    cn_sets: &BTreeMap<String, CNSetSpec>,
) -> Option<(String, i32)> {
    if spec.proxy.is_some() {
        return Some((format!("{}.{}", proxyset::service_name(cluster), namespace), CN_SQL_PORT));
    }
    let tp = tp_name(cluster);
    let target = if cn_sets.contains_key(&tp) {
        Some(tp)
    } else {
        cn_sets.keys().next().cloned()
    }?;
    Some((format!("{}.{}", cnset::service_name(&target), namespace), CN_SQL_PORT))
}

fn credential_secret(mo: &MatrixOneCluster, namespace: &str) -> Secret {
    let name = credential_name(&mo.name_any());
    Secret {
        metadata: workload::object_meta(
            &name,
            namespace,
            BTreeMap::from([(LABEL_CLUSTER.to_string(), mo.name_any())]),
            kube_utils::owner_ref(mo),
        ),
        string_data: Some(BTreeMap::from([
            (CREDENTIAL_USER_KEY.to_string(), ROOT_USER.to_string()),
            (CREDENTIAL_PASSWORD_KEY.to_string(), identity::random_string(PASSWORD_LENGTH)),
        ])),
        immutable: Some(true),
        ..Default::default()
    }
}

pub struct ClusterActor;

impl ClusterActor {
    /// Applies one child and reports its health.
    async fn apply<K>(
        &self,
        ctx: &Context<MatrixOneCluster>,
        name: &str,
        spec: K::Spec,
    ) -> Result<ComponentStatus>
    where
        K: kube::Resource<DynamicType = ()>
            + ScopedApi
            + Conditional
            + HasSpec
            + Clone
            + std::fmt::Debug
            + Serialize
            + DeserializeOwned,
    {
        let mo = ctx.obj.as_ref();
        let mut child = K::with_spec(name, spec);
        let meta = child.meta_mut();
        meta.namespace = Some(ctx.namespace()?);
        meta.labels = Some(BTreeMap::from([(LABEL_CLUSTER.to_string(), mo.name_any())]));
        meta.owner_references = kube_utils::owner_ref(mo).map(|o| vec![o]);
        let api: Api<K> = ctx.api();
        let existing = api.get_opt(name).await?;
        version::stamp_operator_version(child.meta_mut(), existing.as_ref().map(|e| e.meta()));
        let live = kube_utils::ensure(&api, &child).await?;
        let conds = live.conditions();
        Ok(ComponentStatus {
            kind: K::kind(&()).to_string(),
            name: name.to_string(),
            ready: conditions::is_true(conds, CONDITION_READY),
            synced: conditions::is_true(conds, CONDITION_SYNCED),
        })
    }
}

/// Custom resources built from a name and a spec.
pub trait HasSpec {
    type Spec;
    fn with_spec(name: &str, spec: Self::Spec) -> Self;
}

macro_rules! has_spec {
    ($($kind:ty => $spec:ty),* $(,)?) => {
        $(
            impl HasSpec for $kind {
                type Spec = $spec;
                fn with_spec(name: &str, spec: $spec) -> Self {
                    <$kind>::new(name, spec)
                }
            }
        )*
    };
}

has_spec!(
    LogSet => crate::crd::logset::LogSetSpec,
    DNSet => crate::crd::dnset::DNSetSpec,
    CNSet => CNSetSpec,
    ProxySet => ProxySetSpec,
    WebUI => WebUISpec,
);

#[async_trait]
impl Actor<MatrixOneCluster> for ClusterActor {
    async fn observe(&self, ctx: &Context<MatrixOneCluster>) -> Result<Option<Duration>> {
        let mo = ctx.obj.as_ref();
        let name = mo.name_any();
        let namespace = ctx.namespace()?;
        let spec = &mo.spec;
        let repository = ctx.config.default_image_repository.as_str();

        let tn = match (&spec.tn, &spec.dn) {
            (Some(_), Some(_)) | (None, None) => {
                return Err(invariant("InvalidTN", "exactly one of spec.tn and spec.dn must be set"))
            }
            _ => spec.tn().cloned().unwrap_or_default(),
        };
        if spec.proxy.is_some() && !version::mo_has(Some(&spec.version), MOFeature::ProxySupport) {
            return Err(invariant(
                "ProxyUnsupported",
                format!("version {} does not support the proxy", spec.version),
            ));
        }
        let cn_specs = cn_sets(&name, spec, repository)?;

        let mut status = mo.status.clone().unwrap_or_default();
        let secret_api: Api<Secret> = ctx.api();
        let secret = kube_utils::create_if_missing(&secret_api, &credential_secret(mo, &namespace)).await?;
        status.credential_ref = Some(LocalObjectReference {
            name: secret.name_any(),
        });

        let mut components = vec![];
        let mut log = spec.log_service.clone();
        inherit(&mut log.pod_set, spec, repository);
        components.push(self.apply::<LogSet>(ctx, &name, log).await?);

        let mut tn = tn;
        inherit(&mut tn.pod_set, spec, repository);
        tn.deps = log_deps(&name);
        components.push(self.apply::<DNSet>(ctx, &name, tn).await?);

        for (cn_name, cn) in &cn_specs {
            components.push(self.apply::<CNSet>(ctx, cn_name, cn.clone()).await?);
        }
        let cn_api: Api<CNSet> = ctx.api();
        let labels = BTreeMap::from([(LABEL_CLUSTER.to_string(), name.clone())]);
        let wanted: BTreeSet<&String> = cn_specs.keys().collect();
        for stale in kube_utils::list_labeled(&cn_api, &labels).await? {
            if !wanted.contains(&stale.name_any()) {
                info!("{}: removing CN set {}", ctx.key(), stale.name_any());
                kube_utils::delete_if_exists(&cn_api, &stale.name_any()).await?;
            }
        }

        if let Some(proxy) = &spec.proxy {
            let mut proxy = proxy.clone();
            inherit(&mut proxy.pod_set, spec, repository);
            proxy.deps = log_deps(&name);
            components.push(self.apply::<ProxySet>(ctx, &name, proxy).await?);
        } else {
            let proxy_api: Api<ProxySet> = ctx.api();
            kube_utils::delete_if_exists(&proxy_api, &name).await?;
        }
        if let Some(webui) = &spec.webui {
            let mut webui = webui.clone();
            if webui.pod_set.node_selector.is_none() {
                webui.pod_set.node_selector = spec.node_selector.clone();
            }
            if webui.pod_set.image_pull_policy.is_none() {
                webui.pod_set.image_pull_policy = spec.image_pull_policy.clone();
            }
            components.push(self.apply::<WebUI>(ctx, &name, webui).await?);
        } else {
            let webui_api: Api<WebUI> = ctx.api();
            kube_utils::delete_if_exists(&webui_api, &name).await?;
        }

        let ready = components.iter().all(|c| c.ready);
        let synced = components.iter().all(|c| c.synced);
        let pending: Vec<String> = components
            .iter()
            .filter(|c| !c.ready)
            .map(|c| format!("{}/{}", c.kind, c.name))
            .collect();
        if let Some((host, port)) = sql_endpoint(&name, &namespace, spec, &cn_specs) {
            status.host = Some(host);
            status.port = Some(port);
        }
        status.components = components;
        let now = Utc::now();
        conditions::set(
            &mut status.conditional.conditions,
            CONDITION_READY,
            ready,
            if ready { "AllReady" } else { "ComponentsNotReady" },
            pending.join(", "),
            now,
        );
        conditions::set(
            &mut status.conditional.conditions,
            CONDITION_SYNCED,
            synced,
            if synced { "Synced" } else { "ComponentsNotSynced" },
            "",
            now,
        );
        if Some(&status) != mo.status.as_ref() {
            ctx.patch_status::<MatrixOneClusterStatus>(&status).await?;
        }
        Ok((!ready).then_some(CONVERGE_POLL))
    }
}
