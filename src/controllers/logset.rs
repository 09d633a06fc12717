//! Log service: HAKeeper bootstrap, the replicated stateful set, failover.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, PersistentVolumeClaim, PersistentVolumeClaimSpec, Service,
    Volume as PodVolume, VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::Api;
use kube::ResourceExt;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use toml::Value;

use super::workload::{self, PodParts, UuidSource, COMPONENT_LOGSET};
use super::{bucketclaim, pods_of};
use crate::common::conditions::{self, CONDITION_READY, CONDITION_SYNCED};
use crate::common::{
    identity, sub_resource_labels, ANN_BOOTSTRAP, DATA_PATH, DATA_VOLUME, HAKEEPER_PORT,
    LOG_GOSSIP_PORT, LOG_RAFT_PORT, LOG_SERVICE_PORT,
};
use crate::configmap;
use crate::crd::common::RetentionPolicy;
use crate::crd::logset::{LogSetDiscovery, LogSetStatus};
use crate::crd::LogSet;
use crate::errors::*;
use crate::failover;
use crate::kruise::{
    self, AdvancedStatefulSet, AdvancedStatefulSetSpec, PvcRetentionPolicy,
    RollingUpdateStatefulSetStrategy, StatefulSetUpdateStrategy, POD_MANAGEMENT_PARALLEL,
    UPDATE_IN_PLACE_IF_POSSIBLE,
};
use crate::kube_utils;
use crate::runtime::{Actor, Context};
use crate::tomlconfig::TomlConfig;
use crate::version;

const BOOTSTRAP_PATH: &str = "/etc/matrixone/bootstrap";
const BOOTSTRAP_VOLUME: &str = "bootstrap";
const STORE_CHECK_INTERVAL: Duration = Duration::from_secs(15);

pub const KEY_LOG_SHARDS: &str = "num-of-log-shards";
pub const KEY_DN_SHARDS: &str = "num-of-dn-shards";
pub const KEY_LOG_SHARD_REPLICAS: &str = "num-of-log-shard-replicas";
pub const KEY_HAKEEPER_MEMBERS: &str = "init-hakeeper-members";

pub fn set_name(ls: &str) -> String {
    format!("{}-log", ls)
}

pub fn headless_name(ls: &str) -> String {
    format!("{}-log-headless", ls)
}

pub fn discovery_name(ls: &str) -> String {
    format!("{}-log-discovery", ls)
}

fn config_name(ls: &str) -> String {
    format!("{}-log-config", ls)
}

fn bootstrap_name(ls: &str) -> String {
    format!("{}-log-bootstrap", ls)
}

/// A bootstrap HAKeeper member.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapMember {
    pub ordinal: i32,
    pub replica_id: u64,
    pub uuid: String,
}

/// The bootstrap decision, persisted on the LogSet once taken.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Bootstrap {
    pub log_shards: i32,
    pub dn_shards: i32,
    pub log_shard_replicas: i32,
    pub members: Vec<BootstrapMember>,
}

impl Bootstrap {
    /// Picks the first ordinals as HAKeeper members.
    pub fn plan(ls: &LogSet) -> Result<Self> {
        let replicas = ls.spec.pod_set.replicas;
        let ic = &ls.spec.initial_config;
        let count = ic.hakeeper_replicas(replicas);
        let members = (0..count)
            .map(|ordinal| {
                let replica_id = identity::hakeeper_replica_id(ordinal).ok_or_else(|| {
                    invariant("BootstrapFailed", format!("no replica id for ordinal {}", ordinal))
                })?;
                Ok(BootstrapMember {
                    ordinal,
                    replica_id,
                    uuid: identity::ordinal_uuid(ordinal),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Bootstrap {
            log_shards: ic.log_shards(),
            dn_shards: ic.dn_shards(),
            log_shard_replicas: ic.log_shard_replicas(replicas),
            members,
        })
    }

    /// The persisted decision, or a fresh one when none exists yet.
    ///
    /// A persisted decision that contradicts the initial config means the
    /// config was edited after bootstrap; re-bootstrapping would split the quorum.
    pub fn resolve(ls: &LogSet) -> Result<(Self, bool)> {
        let Some(raw) = ls.annotations().get(ANN_BOOTSTRAP) else {
            return Ok((Self::plan(ls)?, true));
        };
        let persisted: Bootstrap = serde_json::from_str(raw)?;
        let ic = &ls.spec.initial_config;
        let replicas = ls.spec.pod_set.replicas;
        if persisted.log_shards != ic.log_shards()
            || persisted.dn_shards != ic.dn_shards()
            || persisted.log_shard_replicas != ic.log_shard_replicas(replicas)
            || ic
                .hakeeper_replicas
                .map_or(false, |n| n as usize != persisted.members.len())
        {
            return Err(invariant(
                "BootstrapMismatch",
                "initialConfig differs from the bootstrapped cluster and cannot be changed",
            ));
        }
        Ok((persisted, false))
    }

    pub fn config_data(&self) -> BTreeMap<String, String> {
        let members = self
            .members
            .iter()
            .map(|m| format!("\"{}:{}\"", m.replica_id, m.uuid))
            .collect::<Vec<_>>()
            .join(", ");
        BTreeMap::from([
            (KEY_LOG_SHARDS.to_string(), self.log_shards.to_string()),
            (KEY_DN_SHARDS.to_string(), self.dn_shards.to_string()),
            (KEY_LOG_SHARD_REPLICAS.to_string(), self.log_shard_replicas.to_string()),
            (KEY_HAKEEPER_MEMBERS.to_string(), format!("[{}]", members)),
        ])
    }
}

/// Outcome of one failover evaluation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Failover {
    None,
    /// Reserve this ordinal so a replacement starts at a fresh one.
    Reserve(i32),
    /// Too many stores are down to repair without risking the quorum.
    MajorityDown(usize),
}

/// Repairs at most one store at a time and never from a majority failure.
pub fn plan_failover(failed: &[i32], reserved: &[i32], log_shard_replicas: i32) -> Failover {
    let majority = ((log_shard_replicas.max(1) + 1) / 2) as usize;
    if failed.len() >= majority {
        return Failover::MajorityDown(failed.len());
    }
    match failed.iter().find(|o| !reserved.contains(o)) {
        Some(o) => Failover::Reserve(*o),
        None => Failover::None,
    }
}

fn default_config(ls: &LogSet, namespace: &str) -> TomlConfig {
    let name = ls.name_any();
    let headless = headless_name(&name);
    let sts = set_name(&name);
    let replicas = ls.spec.pod_set.replicas.max(1);
    let seeds: Vec<Value> = (0..replicas.min(3))
        .map(|i| {
            Value::String(format!(
                "{}.svc:{}",
                identity::pod_dns_name(&format!("{}-{}", sts, i), &headless, namespace),
                LOG_GOSSIP_PORT
            ))
        })
        .collect();
    let mut c = TomlConfig::new();
    c.set(&["service-type"], "LOG");
    c.set(&["data-dir"], format!("{}/data", DATA_PATH));
    c.set(&["log", "level"], "info");
    c.set(&["log", "format"], "json");
    c.set(&["logservice", "deployment-id"], 1i64);
    c.set(&["logservice", "uuid"], workload::UUID_PLACEHOLDER);
    c.set(&["logservice", "data-dir"], format!("{}/logservice", DATA_PATH));
    c.set(
        &["logservice", "service-address"],
        format!("{}:{}", workload::ADDR_PLACEHOLDER, LOG_SERVICE_PORT),
    );
    c.set(
        &["logservice", "raft-address"],
        format!("{}:{}", workload::ADDR_PLACEHOLDER, LOG_RAFT_PORT),
    );
    c.set(
        &["logservice", "gossip-address"],
        format!("{}:{}", workload::ADDR_PLACEHOLDER, LOG_GOSSIP_PORT),
    );
    c.set(&["logservice", "gossip-seed-addresses"], Value::Array(seeds));
    workload::set_hakeeper_client(
        &mut c,
        &format!("{}.{}.svc:{}", discovery_name(&name), namespace, HAKEEPER_PORT),
    );
    workload::set_fileservice(&mut c, &ls.spec.shared_storage, None);
    c
}

/// Appends `[bootstrap-config]` from the mounted bootstrap map.
fn bootstrap_script() -> String {
    format!(
        r#"if [ -d {dir} ]; then
  {{
    echo ""
    echo "[bootstrap-config]"
    echo "bootstrap-cluster = true"
    echo "num-of-log-shards = $(cat {dir}/{ls})"
    echo "num-of-dn-shards = $(cat {dir}/{dn})"
    echo "num-of-log-shard-replicas = $(cat {dir}/{rep})"
    echo "init-hakeeper-members = $(cat {dir}/{members})"
  }} >> "${{RUN_CONF}}"
fi"#,
        dir = BOOTSTRAP_PATH,
        ls = KEY_LOG_SHARDS,
        dn = KEY_DN_SHARDS,
        rep = KEY_LOG_SHARD_REPLICAS,
        members = KEY_HAKEEPER_MEMBERS,
    )
}

pub struct LogSetActor;

impl LogSetActor {
    async fn persist_bootstrap(&self, ctx: &Context<LogSet>, bootstrap: &Bootstrap) -> Result<()> {
        info!("bootstrapping {} with {} HAKeeper members", ctx.key(), bootstrap.members.len());
        kube_utils::cas_metadata(
            &ctx.self_api(),
            ctx.obj.as_ref(),
            BTreeMap::new(),
            BTreeMap::from([(
                ANN_BOOTSTRAP.to_string(),
                Some(serde_json::to_string(bootstrap)?),
            )]),
        )
        .await?;
        Ok(())
    }

    fn desired_set(
        &self,
        ls: &LogSet,
        namespace: &str,
        labels: &BTreeMap<String, String>,
        reserve: Vec<i32>,
    ) -> Result<AdvancedStatefulSet> {
        let name = ls.name_any();
        let pod_set = &ls.spec.pod_set;
        let template = workload::pod_template(PodParts {
            labels: labels.clone(),
            pod_set,
            headless_service: Some(headless_name(&name)),
            ports: vec![
                workload::tcp_port("service", LOG_SERVICE_PORT),
                workload::tcp_port("raft", LOG_RAFT_PORT),
                workload::tcp_port("gossip", LOG_GOSSIP_PORT),
            ],
            env: workload::storage_env(&ls.spec.shared_storage),
            mounts: vec![
                workload::data_mount(),
                VolumeMount {
                    name: BOOTSTRAP_VOLUME.to_string(),
                    mount_path: BOOTSTRAP_PATH.to_string(),
                    read_only: Some(true),
                    ..Default::default()
                },
            ],
            volumes: vec![PodVolume {
                name: BOOTSTRAP_VOLUME.to_string(),
                config_map: Some(ConfigMapVolumeSource {
                    name: bootstrap_name(&name),
                    ..Default::default()
                }),
                ..Default::default()
            }],
            readiness_gates: vec![],
        })?;
        let pvc_policy = match ls.spec.pvc_retention_policy.unwrap_or(RetentionPolicy::Retain) {
            RetentionPolicy::Retain => "Retain",
            RetentionPolicy::Delete => "Delete",
        };
        let mut sts = AdvancedStatefulSet::new(
            &set_name(&name),
            AdvancedStatefulSetSpec {
                replicas: Some(pod_set.replicas),
                selector: workload::selector(labels),
                template,
                service_name: headless_name(&name),
                pod_management_policy: Some(POD_MANAGEMENT_PARALLEL.to_string()),
                volume_claim_templates: vec![data_claim(ls)],
                reserve_ordinals: reserve,
                update_strategy: Some(StatefulSetUpdateStrategy {
                    type_: Some("RollingUpdate".to_string()),
                    rolling_update: Some(RollingUpdateStatefulSetStrategy {
                        pod_update_policy: Some(UPDATE_IN_PLACE_IF_POSSIBLE.to_string()),
                        ..Default::default()
                    }),
                }),
                persistent_volume_claim_retention_policy: Some(PvcRetentionPolicy {
                    when_deleted: Some(pvc_policy.to_string()),
                    when_scaled: Some("Retain".to_string()),
                }),
            },
        );
        sts.metadata = workload::object_meta(
            &set_name(&name),
            namespace,
            labels.clone(),
            kube_utils::owner_ref(ls),
        );
        Ok(sts)
    }

    async fn sync_bucket(&self, ctx: &Context<LogSet>, any_ready: bool) -> Result<()> {
        let Some(s3) = &ctx.obj.spec.shared_storage.s3 else {
            return Ok(());
        };
        let claim = bucketclaim::acquire(&ctx.client, s3, &ctx.key(), None).await?;
        if any_ready {
            bucketclaim::mark_instance_running(&ctx.client, &claim).await?;
        }
        Ok(())
    }
}

fn data_claim(ls: &LogSet) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(DATA_VOLUME.to_string()),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            storage_class_name: ls.spec.volume.storage_class_name.clone(),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([("storage".to_string(), ls.spec.volume.size.clone())])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[async_trait]
impl Actor<LogSet> for LogSetActor {
    async fn observe(&self, ctx: &Context<LogSet>) -> Result<Option<Duration>> {
        let ls = ctx.obj.as_ref();
        let name = ls.name_any();
        let namespace = ctx.namespace()?;
        let labels = sub_resource_labels(&namespace, &name, COMPONENT_LOGSET);
        let owner = kube_utils::owner_ref(ls);

        let (bootstrap, fresh) = Bootstrap::resolve(ls)?;
        if fresh {
            self.persist_bootstrap(ctx, &bootstrap).await?;
            return Ok(Some(super::REFRESH_DELAY));
        }
        let cm_api: Api<ConfigMap> = ctx.api();
        kube_utils::ensure(
            &cm_api,
            &workload::config_map(
                workload::object_meta(&bootstrap_name(&name), &namespace, labels.clone(), owner.clone()),
                bootstrap.config_data(),
            ),
        )
        .await?;

        let svc_api: Api<Service> = ctx.api();
        let ports = [
            ("service", LOG_SERVICE_PORT, LOG_SERVICE_PORT),
            ("raft", LOG_RAFT_PORT, LOG_RAFT_PORT),
            ("gossip", LOG_GOSSIP_PORT, LOG_GOSSIP_PORT),
        ];
        kube_utils::ensure(
            &svc_api,
            &workload::headless_service(
                workload::object_meta(&headless_name(&name), &namespace, labels.clone(), owner.clone()),
                &labels,
                &ports,
            ),
        )
        .await?;
        kube_utils::ensure(
            &svc_api,
            &workload::service(
                workload::object_meta(&discovery_name(&name), &namespace, labels.clone(), owner.clone()),
                &labels,
                &[("hakeeper", HAKEEPER_PORT, HAKEEPER_PORT)],
                None,
                None,
            ),
        )
        .await?;

        let sts_api: Api<AdvancedStatefulSet> = ctx.api();
        let live = sts_api.get_opt(&set_name(&name)).await?;
        let pods = pods_of(ctx, &labels).await?;

        // failover
        let now = Utc::now();
        let prev = ls.status.clone().unwrap_or_default();
        let stores = failover::collect_store_status(&pods, &prev.failover, now);
        let mut reserve = live
            .as_ref()
            .map(|s| s.spec.reserve_ordinals.clone())
            .unwrap_or_default();
        let failed: Vec<i32> = failover::stores_failed_for(&stores, ls.store_failure_timeout()?, now)
            .iter()
            .filter_map(|s| kruise::pod_ordinal(&set_name(&name), &s.pod_name))
            .collect();
        match plan_failover(&failed, &reserve, bootstrap.log_shard_replicas) {
            Failover::None => {}
            Failover::Reserve(ordinal) => {
                warn!("{}: store {} failed, reserving its ordinal", ctx.key(), ordinal);
                ctx.normal("FailoverStore", format!("replacing log store at ordinal {}", ordinal))
                    .await;
                reserve.push(ordinal);
            }
            Failover::MajorityDown(n) => {
                warn!("{}: {} stores are down, not repairing", ctx.key(), n);
                ctx.warning(
                    "MajorityFailure",
                    format!(
                        "{} log stores are down; repairing would cross the quorum, human intervention required",
                        n
                    ),
                )
                .await;
            }
        }

        let mut sts = self.desired_set(ls, &namespace, &labels, reserve)?;
        let cm = workload::config_map(
            workload::object_meta(&config_name(&name), &namespace, labels.clone(), owner.clone()),
            workload::config_data(
                workload::render_config(default_config(ls, &namespace), &ls.spec.pod_set)?,
                workload::start_script(UuidSource::Ordinal, &bootstrap_script()),
            ),
        );
        configmap::sync(
            &cm_api,
            cm,
            &mut sts.spec.template,
            live.as_ref().map(|s| &s.spec.template),
            &pods,
            version::inplace_configmap_update(&ls.metadata),
        )
        .await?;
        let sts = kube_utils::ensure(&sts_api, &sts).await?;

        let any_ready = pods.iter().any(crate::common::pod::is_ready);
        self.sync_bucket(ctx, any_ready).await?;

        let mut status = LogSetStatus {
            conditional: prev.conditional.clone(),
            failover: stores,
            discovery: prev.discovery.clone(),
        };
        let members: Vec<String> = bootstrap
            .members
            .iter()
            .map(|m| format!("{}-{}", set_name(&name), m.ordinal))
            .collect();
        let hakeeper_up = status
            .failover
            .available_stores
            .iter()
            .any(|s| members.contains(&s.pod_name));
        if hakeeper_up && status.discovery.is_none() {
            info!("{}: HAKeeper is live, publishing discovery", ctx.key());
            status.discovery = Some(LogSetDiscovery {
                address: format!("{}.{}", discovery_name(&name), namespace),
                port: HAKEEPER_PORT,
            });
        }
        let ready = status.failover.available_stores.len() as i32 >= ls.spec.pod_set.replicas
            && sts.observed().ready_replicas >= ls.spec.pod_set.replicas;
        conditions::set(
            &mut status.conditional.conditions,
            CONDITION_READY,
            ready,
            if ready { "AllStoresUp" } else { "StoresNotReady" },
            format!(
                "{}/{} stores up",
                status.failover.available_stores.len(),
                ls.spec.pod_set.replicas
            ),
            now,
        );
        conditions::set(&mut status.conditional.conditions, CONDITION_SYNCED, true, "Synced", "", now);
        if Some(&status) != ls.status.as_ref() {
            debug!("{}: updating status", ctx.key());
            ctx.patch_status(&status).await?;
        }
        // stores age toward the failure timeout even when nothing changes
        Ok(Some(STORE_CHECK_INTERVAL))
    }

    async fn finalize(&self, ctx: &Context<LogSet>) -> Result<bool> {
        let name = ctx.name();
        let sts_api: Api<AdvancedStatefulSet> = ctx.api();
        if !kube_utils::delete_if_exists(&sts_api, &set_name(&name)).await? {
            return Ok(false);
        }
        let namespace = ctx.namespace()?;
        let labels = sub_resource_labels(&namespace, &name, COMPONENT_LOGSET);
        if !pods_of(ctx, &labels).await?.is_empty() {
            return Ok(false);
        }
        if let Some(s3) = &ctx.obj.spec.shared_storage.s3 {
            if let Some(claim) = bucketclaim::find_claim(&ctx.client, s3).await? {
                bucketclaim::release(&ctx.client, &claim, &ctx.key()).await?;
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::logset::{InitialConfig, LogSetSpec};

    fn log_set(replicas: i32) -> LogSet {
        let mut ls = LogSet::new(
            "test",
            LogSetSpec {
                initial_config: InitialConfig {
                    log_shards: Some(1),
                    dn_shards: Some(1),
                    ..Default::default()
                },
                ..Default::default()
            },
        );
        ls.spec.pod_set.replicas = replicas;
        ls.metadata.namespace = Some("default".to_string());
        ls
    }

    #[test]
    fn test_bootstrap_three_members() {
        let ls = log_set(3);
        let (b, fresh) = Bootstrap::resolve(&ls).unwrap();
        assert!(fresh);
        assert_eq!(set_name("test"), "test-log");
        let data = b.config_data();
        assert_eq!(data[KEY_LOG_SHARDS], "1");
        assert_eq!(data[KEY_DN_SHARDS], "1");
        assert_eq!(data[KEY_LOG_SHARD_REPLICAS], "3");
        assert_eq!(
            data[KEY_HAKEEPER_MEMBERS],
            r#"["131072:00000000-0000-0000-0000-000000000000", "131073:00000000-0000-0000-0000-000000000001", "131074:00000000-0000-0000-0000-000000000002"]"#
        );
    }

    #[test]
    fn test_bootstrap_single_member() {
        let (b, _) = Bootstrap::resolve(&log_set(1)).unwrap();
        assert_eq!(b.members.len(), 1);
        assert_eq!(b.log_shard_replicas, 1);
    }

    #[test]
    fn test_persisted_bootstrap_is_reused_and_guarded() {
        let mut ls = log_set(3);
        let (b, _) = Bootstrap::resolve(&ls).unwrap();
        ls.metadata.annotations = Some(BTreeMap::from([(
            ANN_BOOTSTRAP.to_string(),
            serde_json::to_string(&b).unwrap(),
        )]));
        // scaling out does not re-pick members
        ls.spec.pod_set.replicas = 5;
        let (again, fresh) = Bootstrap::resolve(&ls).unwrap();
        assert!(!fresh);
        assert_eq!(again, b);

        ls.spec.initial_config.log_shards = Some(2);
        let err = Bootstrap::resolve(&ls).unwrap_err();
        assert_eq!(err.as_invariant().map(|(r, _)| r), Some("BootstrapMismatch"));
    }

    #[test]
    fn test_minority_failover_reserves_ordinal() {
        assert_eq!(plan_failover(&[0], &[], 3), Failover::Reserve(0));
        // already reserved: the replacement is on its way
        assert_eq!(plan_failover(&[0], &[0], 3), Failover::None);
        assert_eq!(plan_failover(&[], &[], 3), Failover::None);
    }

    #[test]
    fn test_majority_failure_is_not_repaired() {
        assert_eq!(plan_failover(&[0, 1], &[], 3), Failover::MajorityDown(2));
        assert_eq!(plan_failover(&[0], &[], 1), Failover::MajorityDown(1));
        assert_eq!(plan_failover(&[0, 1], &[], 5), Failover::Reserve(0));
        assert_eq!(plan_failover(&[0, 1, 2], &[], 5), Failover::MajorityDown(3));
    }

    #[test]
    fn test_failover_after_timeout_scenario() {
        use crate::common::pod::testing;
        use chrono::Duration as ChronoDuration;

        let ls = log_set(3);
        let t0 = Utc::now();
        let up = Some(t0 - ChronoDuration::hours(1));
        let pods = vec![
            testing::pod("test-log-0", None),
            testing::pod("test-log-1", up),
            testing::pod("test-log-2", up),
        ];
        let first = failover::collect_store_status(&pods, &Default::default(), t0);
        let timeout = ls.store_failure_timeout().unwrap();
        assert!(failover::stores_failed_for(&first, timeout, t0).is_empty());

        let later = t0 + ChronoDuration::from_std(timeout).unwrap() + ChronoDuration::seconds(1);
        let second = failover::collect_store_status(&pods, &first, later);
        let failed: Vec<i32> = failover::stores_failed_for(&second, timeout, later)
            .iter()
            .filter_map(|s| kruise::pod_ordinal("test-log", &s.pod_name))
            .collect();
        assert_eq!(plan_failover(&failed, &[], 3), Failover::Reserve(0));

        let mut ls = ls;
        ls.spec.pod_set.image = Some("matrixorigin/matrixone:1.2.0".to_string());
        let sts = LogSetActor
            .desired_set(&ls, "default", &BTreeMap::new(), vec![0])
            .unwrap();
        assert_eq!(sts.spec.reserve_ordinals, vec![0]);
        assert_eq!(sts.spec.replicas, Some(3));
        // the replacement starts at ordinal 3 with a fresh identity
        assert_eq!(identity::ordinal_uuid(3), "00000000-0000-0000-0000-000000000003");
    }

    #[test]
    fn test_default_config_points_at_discovery() {
        let ls = log_set(3);
        let c = default_config(&ls, "default");
        assert_eq!(c.get(&["service-type"]), Some(Value::from("LOG")));
        assert_eq!(
            c.get(&["hakeeper-client", "service-addresses"]),
            Some(Value::Array(vec![Value::from("test-log-discovery.default.svc:32001")]))
        );
        let seeds = c.get(&["logservice", "gossip-seed-addresses"]).unwrap();
        assert_eq!(
            seeds.as_array().unwrap()[0].as_str(),
            Some("test-log-0.test-log-headless.default.svc:32002")
        );
    }
}
