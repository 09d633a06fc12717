//! Binds a claim to one idle pod of its pool.
//!
//! Binding is two compare-and-swap writes: the pod's phase and
//! `claimed-by` labels first, then the claim's `spec.podName`. A claim that
//! loses either race stays `Pending` and tries again. A pod already labelled
//! for the claim is adopted, which recovers a binding interrupted between
//! the two writes.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::Api;
use kube::ResourceExt;
use log::{debug, info, warn};
use serde_json::json;

use super::cnset;
use crate::common::conditions::{self, CONDITION_READY, CONDITION_SYNCED};
use crate::common::{
    identity, pod, ANN_CN_LABELS, ANN_DRAIN_START, CN_SQL_PORT, LABEL_CLAIMED_BY,
    LABEL_CN_PHASE, LABEL_INSTANCE, LABEL_POOL_NAME,
};
use crate::crd::cnclaim::{CNClaimPhase, CNClaimStatus, CNStoreStatus, MigrateStatus};
use crate::crd::cnpool::CNPodPhase;
use crate::crd::CNClaim;
use crate::errors::*;
use crate::kube_utils;
use crate::probe::StoreProbe;
use crate::runtime::{Actor, Context};

const BIND_RETRY: Duration = Duration::from_secs(5);

/// Chooses the pod to bind: idle, unclaimed and matching the selector.
///
/// Pods on the source pod's node come first so a migration stays local;
/// otherwise the longest-running pod wins.
pub fn pick_pod<'a>(pods: &'a [Pod], claim: &CNClaim) -> Option<&'a Pod> {
    let source_node = claim
        .spec
        .source_pod
        .as_ref()
        .and_then(|s| s.node_name.as_deref());
    let mut candidates: Vec<&Pod> = pods
        .iter()
        .filter(|p| CNPodPhase::parse(pod::label(p, LABEL_CN_PHASE)) == CNPodPhase::Idle)
        .filter(|p| pod::label(p, LABEL_CLAIMED_BY).map_or(true, str::is_empty))
        .filter(|p| !pod::is_terminating(p))
        .filter(|p| {
            claim.spec.selector.as_ref().map_or(true, |s| {
                kube_utils::selector_matches(s, p.metadata.labels.as_ref().unwrap_or(&BTreeMap::new()))
            })
        })
        .collect();
    candidates.sort_by_key(|p| {
        let elsewhere = source_node.map_or(false, |node| {
            p.spec.as_ref().and_then(|s| s.node_name.as_deref()) != Some(node)
        });
        (elsewhere, pod::created_at(p))
    });
    candidates.into_iter().next()
}

/// Label and annotation edits that mark `claim`'s pod as bound.
pub fn bind_edits(
    claim: &CNClaim,
) -> Result<(BTreeMap<String, Option<String>>, BTreeMap<String, Option<String>>)> {
    let mut labels: BTreeMap<String, Option<String>> = claim
        .spec
        .additional_pod_labels
        .iter()
        .map(|(k, v)| (k.clone(), Some(v.clone())))
        .collect();
    labels.insert(LABEL_CN_PHASE.to_string(), Some(CNPodPhase::Bound.as_str().to_string()));
    labels.insert(LABEL_CLAIMED_BY.to_string(), Some(claim.name_any()));
    let mut annotations = BTreeMap::new();
    if !claim.spec.cn_labels.is_empty() {
        annotations.insert(
            ANN_CN_LABELS.to_string(),
            Some(serde_json::to_string(&claim.spec.cn_labels)?),
        );
    }
    Ok((labels, annotations))
}

/// Store identity of a bound pod.
pub fn store_status(p: &Pod, claim: &CNClaim, state: &str) -> CNStoreStatus {
    let name = pod::name(p);
    let namespace = p.metadata.namespace.as_deref().unwrap_or_default();
    let headless = cnset::headless_name(pod::label(p, LABEL_INSTANCE).unwrap_or_default());
    CNStoreStatus {
        service_id: identity::cn_store_uuid(name, &headless, namespace),
        pod_name: name.to_string(),
        sql_address: Some(format!(
            "{}:{}",
            identity::pod_dns_name(name, &headless, namespace),
            CN_SQL_PORT
        )),
        labels: claim.spec.cn_labels.clone(),
        state: state.to_string(),
    }
}

fn is_claimed_by(p: &Pod, claim: &str) -> bool {
    pod::label(p, LABEL_CLAIMED_BY) == Some(claim)
}

pub struct CNClaimActor {
    pub probe: Arc<dyn StoreProbe>,
}

impl CNClaimActor {
    /// Finds or grabs a pod; returns its name once the claim points at it.
    async fn bind(&self, ctx: &Context<CNClaim>) -> Result<Option<String>> {
        let claim = ctx.obj.as_ref();
        let name = claim.name_any();
        let pool = claim
            .spec
            .pool_name
            .as_deref()
            .ok_or_else(|| invariant("PoolMissing", "spec.poolName is required"))?;
        let pods = super::pods_of(
            ctx,
            &BTreeMap::from([(LABEL_POOL_NAME.to_string(), pool.to_string())]),
        )
        .await?;
        let pod_api: Api<Pod> = ctx.api();

        let chosen = match pods.iter().find(|p| is_claimed_by(p, &name)) {
            Some(adopted) => {
                debug!("{}: adopting {}", ctx.key(), pod::name(adopted));
                adopted.clone()
            }
            None => {
                let Some(candidate) = pick_pod(&pods, claim) else {
                    return Ok(None);
                };
                let (labels, annotations) = bind_edits(claim)?;
                match kube_utils::cas_metadata(&pod_api, candidate, labels, annotations).await {
                    Ok(p) => p,
                    Err(e) if e.is_conflict() => {
                        debug!("{}: lost the race for {}", ctx.key(), pod::name(candidate));
                        return Ok(None);
                    }
                    Err(e) => return Err(e),
                }
            }
        };

        let pod_name = pod::name(&chosen).to_string();
        kube_utils::cas_merge(&ctx.self_api(), claim, json!({ "spec": { "podName": pod_name } }))
            .await?;
        info!("{}: bound to {}", ctx.key(), pod_name);
        Ok(Some(pod_name))
    }
}

#[async_trait]
impl Actor<CNClaim> for CNClaimActor {
    async fn observe(&self, ctx: &Context<CNClaim>) -> Result<Option<Duration>> {
        let claim = ctx.obj.as_ref();
        let name = claim.name_any();
        let now = Utc::now();
        let mut status: CNClaimStatus = claim.status.clone().unwrap_or_default();

        let pod_name = match claim.pod_name() {
            Some(p) => Some(p.to_string()),
            None => match self.bind(ctx).await? {
                // status is written from the copy that carries the pod name
                Some(_) => return Ok(Some(super::REFRESH_DELAY)),
                None => None,
            },
        };
        let Some(pod_name) = pod_name else {
            status.phase = CNClaimPhase::Pending;
            conditions::set(
                &mut status.conditional.conditions,
                CONDITION_READY,
                false,
                "NoIdlePod",
                "waiting for an idle pod in the pool",
                now,
            );
            conditions::set(&mut status.conditional.conditions, CONDITION_SYNCED, true, "Synced", "", now);
            if Some(&status) != claim.status.as_ref() {
                ctx.patch_status(&status).await?;
            }
            return Ok(Some(BIND_RETRY));
        };

        let pod_api: Api<Pod> = ctx.api();
        let live = pod_api.get_opt(&pod_name).await?;
        let bound = live.as_ref().filter(|p| is_claimed_by(p, &name) && !pod::is_terminating(p));
        let Some(bound_pod) = bound else {
            if status.phase.can_transition_to(CNClaimPhase::Lost) {
                warn!("{}: pod {} is gone", ctx.key(), pod_name);
                status.phase = CNClaimPhase::Lost;
                conditions::set(
                    &mut status.conditional.conditions,
                    CONDITION_READY,
                    false,
                    "PodLost",
                    format!("pod {} no longer serves this claim", pod_name),
                    now,
                );
                ctx.patch_status(&status).await?;
                return Ok(None);
            }
            // podName was written but the pod was never labelled: retry binding
            return Err(resync(format!("pod {} is not labelled for {}", pod_name, name), BIND_RETRY));
        };

        let (labels, annotations) = bind_edits(claim)?;
        let drifted = labels
            .iter()
            .filter(|(k, _)| k.as_str() != LABEL_CN_PHASE)
            .chain(annotations.iter())
            .any(|(k, v)| {
                let current = pod::label(bound_pod, k).or_else(|| pod::annotation(bound_pod, k));
                current != v.as_deref()
            });
        if drifted {
            let labels = labels.into_iter().filter(|(k, _)| k != LABEL_CN_PHASE).collect();
            kube_utils::cas_metadata(&pod_api, bound_pod, labels, annotations).await?;
        }

        let state = self.probe.cn_store_state(bound_pod).await?;
        if status.phase == CNClaimPhase::Pending {
            status.phase = CNClaimPhase::Bound;
            status.bound_time = Some(Time(now));
        }
        status.store = Some(store_status(bound_pod, claim, state.as_str()));
        if let Some(source) = &claim.spec.source_pod {
            if let Some(src) = pod_api.get_opt(&source.pod_name).await? {
                status.migrate = Some(MigrateStatus {
                    source: self.probe.workload(&src).await?,
                });
            }
        }
        let ready = pod::is_ready(bound_pod);
        conditions::set(
            &mut status.conditional.conditions,
            CONDITION_READY,
            ready,
            if ready { "PodReady" } else { "PodNotReady" },
            format!("bound to {}", pod_name),
            now,
        );
        conditions::set(&mut status.conditional.conditions, CONDITION_SYNCED, true, "Synced", "", now);
        if Some(&status) != claim.status.as_ref() {
            ctx.patch_status(&status).await?;
        }
        Ok(None)
    }

    /// Hands the pod back to the pool for draining.
    async fn finalize(&self, ctx: &Context<CNClaim>) -> Result<bool> {
        let Some(pod_name) = ctx.obj.pod_name() else {
            return Ok(true);
        };
        let pod_api: Api<Pod> = ctx.api();
        let Some(p) = pod_api.get_opt(pod_name).await? else {
            return Ok(true);
        };
        if !is_claimed_by(&p, &ctx.name()) {
            return Ok(true);
        }
        info!("{}: releasing {}", ctx.key(), pod_name);
        kube_utils::cas_metadata(
            &pod_api,
            &p,
            BTreeMap::from([
                (LABEL_CN_PHASE.to_string(), Some(CNPodPhase::Draining.as_str().to_string())),
                (LABEL_CLAIMED_BY.to_string(), None),
            ]),
            BTreeMap::from([(ANN_DRAIN_START.to_string(), Some(Utc::now().to_rfc3339()))]),
        )
        .await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::pod::testing;
    use crate::crd::cnclaim::{CNClaimSpec, SourcePod};
    use crate::crd::cnset::CNLabel;
    use chrono::Duration as ChronoDuration;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;

    fn claim() -> CNClaim {
        let mut c = CNClaim::new(
            "claim-a",
            CNClaimSpec {
                pool_name: Some("pool".to_string()),
                ..Default::default()
            },
        );
        c.metadata.namespace = Some("default".to_string());
        c
    }

    fn pool_pod(name: &str, phase: &str, age_secs: i64) -> Pod {
        let p = testing::pod(name, None);
        let p = testing::created(p, Utc::now() - ChronoDuration::seconds(age_secs));
        let p = testing::with_label(p, LABEL_POOL_NAME, "pool");
        let p = testing::with_label(p, LABEL_INSTANCE, "pool-abc");
        testing::with_label(p, LABEL_CN_PHASE, phase)
    }

    #[test]
    fn test_pick_prefers_oldest_idle_unclaimed() {
        let pods = vec![
            pool_pod("young", "Idle", 10),
            pool_pod("old", "Idle", 1000),
            pool_pod("bound", "Bound", 5000),
            testing::with_label(pool_pod("taken", "Idle", 9000), LABEL_CLAIMED_BY, "other"),
        ];
        assert_eq!(pick_pod(&pods, &claim()).map(pod::name), Some("old"));
    }

    #[test]
    fn test_pick_honours_selector_and_source_node() {
        let mut pods = vec![
            testing::with_label(pool_pod("a", "Idle", 1000), "zone", "x"),
            testing::with_label(pool_pod("b", "Idle", 10), "zone", "y"),
            testing::with_label(pool_pod("c", "Idle", 20), "zone", "y"),
        ];
        if let Some(spec) = pods[2].spec.as_mut() {
            spec.node_name = Some("node-2".to_string());
        }
        let mut c = claim();
        c.spec.selector = Some(LabelSelector {
            match_labels: Some(BTreeMap::from([("zone".to_string(), "y".to_string())])),
            ..Default::default()
        });
        assert_eq!(pick_pod(&pods, &c).map(pod::name), Some("c"));

        c.spec.source_pod = Some(SourcePod {
            pod_name: "old-pod".to_string(),
            node_name: Some("node-1".to_string()),
        });
        assert_eq!(pick_pod(&pods, &c).map(pod::name), Some("b"));

        assert!(pick_pod(&[], &c).is_none());
    }

    #[test]
    fn test_bind_edits() {
        let mut c = claim();
        c.spec.additional_pod_labels.insert("tenant".to_string(), "t1".to_string());
        c.spec.cn_labels = vec![CNLabel {
            key: "account".to_string(),
            values: vec!["acc1".to_string()],
        }];
        let (labels, annotations) = bind_edits(&c).unwrap();
        assert_eq!(labels[LABEL_CN_PHASE].as_deref(), Some("Bound"));
        assert_eq!(labels[LABEL_CLAIMED_BY].as_deref(), Some("claim-a"));
        assert_eq!(labels["tenant"].as_deref(), Some("t1"));
        assert_eq!(
            annotations[ANN_CN_LABELS].as_deref(),
            Some(r#"[{"key":"account","values":["acc1"]}]"#)
        );
    }

    #[test]
    fn test_store_status_of_bound_pod() {
        let p = pool_pod("pool-abc-xyz12", "Bound", 10);
        let s = store_status(&p, &claim(), "Up");
        assert_eq!(s.pod_name, "pool-abc-xyz12");
        assert_eq!(
            s.service_id,
            identity::cn_store_uuid("pool-abc-xyz12", "pool-abc-cn-headless", "default")
        );
        assert_eq!(
            s.sql_address.as_deref(),
            Some("pool-abc-xyz12.pool-abc-cn-headless.default:6001")
        );
    }
}
