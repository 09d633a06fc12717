//! Warm pool of CN pods, one CNSet per template revision.
//!
//! The current revision is sized to `inUse + pending + maxIdle`. Older
//! revisions keep only the pods that are still claimed and vanish once
//! those are gone.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, PostParams};
use kube::ResourceExt;
use log::{debug, info};
use serde_json::json;

use super::pods_of;
use crate::common::conditions::{self, Conditional, CONDITION_READY, CONDITION_SYNCED};
use crate::common::hashing::compute_hash;
use crate::common::{pod, LABEL_CN_PHASE, LABEL_INSTANCE, LABEL_MANAGED_BY, LABEL_POOL_NAME};
use crate::crd::cnclaim::CNClaimPhase;
use crate::crd::cnpool::{CNPodPhase, CNPoolStatus};
use crate::crd::cnset::{CNSetSpec, POD_MANAGEMENT_POOLING};
use crate::crd::{CNClaim, CNPool, CNSet};
use crate::errors::*;
use crate::kube_utils;
use crate::runtime::{Actor, Context};
use crate::version;

/// Delay before growing again once `maxPods` is reached.
const SATURATION_RETRY: Duration = Duration::from_secs(60);
const LEGACY_POLL: Duration = Duration::from_secs(15);

/// The template stripped of everything that can change without a restart.
fn revision_tuple(template: &CNSetSpec) -> CNSetSpec {
    let mut spec = template.clone();
    spec.pod_set.replicas = 0;
    if let Some(overlay) = spec.pod_set.overlay.as_mut() {
        overlay.pod_labels.clear();
        overlay.pod_annotations.clear();
    }
    spec.cn_labels.clear();
    spec.pods_to_delete.clear();
    spec.pause_update = false;
    spec.pod_management_policy = None;
    spec
}

pub fn revision_hash(pool: &CNPool) -> Result<String> {
    compute_hash(&revision_tuple(&pool.spec.template))
}

pub fn managed_by(pool: &str) -> String {
    format!("CNPool-{}", pool)
}

fn set_labels(pool: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_MANAGED_BY.to_string(), managed_by(pool)),
        (LABEL_POOL_NAME.to_string(), pool.to_string()),
    ])
}

/// CNSet spec of the current revision at `replicas`.
pub fn desired_spec(pool: &CNPool, replicas: i32, pods_to_delete: Vec<String>) -> CNSetSpec {
    let mut spec = pool.spec.template.clone();
    spec.pod_set.replicas = replicas;
    spec.pods_to_delete = pods_to_delete;
    spec.pod_management_policy = Some(POD_MANAGEMENT_POOLING.to_string());
    spec.cn_labels.clear();
    if spec.deps.log_set.is_none() {
        spec.deps = pool.spec.deps.clone();
    }
    let overlay = spec.pod_set.overlay.get_or_insert_with(Default::default);
    overlay.pod_labels.extend(pool.spec.pod_labels.clone());
    overlay
        .pod_labels
        .insert(LABEL_POOL_NAME.to_string(), pool.name_any());
    spec
}

fn phase_of(p: &Pod) -> CNPodPhase {
    CNPodPhase::parse(pod::label(p, LABEL_CN_PHASE))
}

fn scale_in_rank(phase: CNPodPhase) -> u8 {
    match phase {
        CNPodPhase::Terminating => 0,
        CNPodPhase::Unknown => 1,
        CNPodPhase::Idle => 2,
        _ => 3,
    }
}

/// Up to `count` pods to remove, cheapest first. Claimed pods never qualify.
pub fn scale_in_victims(pods: &[Pod], count: usize) -> Vec<&Pod> {
    let mut candidates: Vec<&Pod> = pods.iter().filter(|p| !phase_of(p).in_use()).collect();
    candidates.sort_by_key(|p| (scale_in_rank(phase_of(p)), Reverse(pod::created_at(p))));
    candidates.truncate(count);
    candidates
}

#[derive(Debug, Default, PartialEq)]
pub struct CurrentPlan {
    pub replicas: i32,
    pub pods_to_delete: Vec<String>,
    /// Idle or unknown pods to relabel `Terminating` before they go.
    pub terminate: Vec<String>,
    /// Demand exceeded `maxPods`.
    pub saturated: bool,
}

/// Sizes the current revision.
///
/// `cap` is what `maxPods` leaves after the legacy revisions.
pub fn plan_current(
    pods: &[Pod],
    live_replicas: i32,
    pending: i32,
    max_idle: i32,
    cap: Option<i32>,
) -> CurrentPlan {
    let in_use = pods.iter().filter(|p| phase_of(p).in_use()).count() as i32;
    let want = in_use + pending + max_idle;
    let (desired, saturated) = match cap {
        Some(cap) if want > cap => (cap.max(in_use), true),
        _ => (want, false),
    };
    let terminating: Vec<String> = pods
        .iter()
        .filter(|p| phase_of(p) == CNPodPhase::Terminating)
        .map(|p| pod::name(p).to_string())
        .collect();

    if desired >= live_replicas || pending > 0 {
        return CurrentPlan {
            replicas: if pending > 0 { desired.max(live_replicas) } else { desired },
            pods_to_delete: terminating,
            terminate: vec![],
            saturated,
        };
    }

    let shrink = (live_replicas - desired) as usize;
    let missing = (live_replicas as usize).saturating_sub(pods.len()).min(shrink);
    let victims = scale_in_victims(pods, shrink - missing);
    let mut pods_to_delete: BTreeSet<String> = terminating.into_iter().collect();
    pods_to_delete.extend(victims.iter().map(|p| pod::name(p).to_string()));
    CurrentPlan {
        replicas: live_replicas - missing as i32 - victims.len() as i32,
        pods_to_delete: pods_to_delete.into_iter().collect(),
        terminate: victims
            .iter()
            .filter(|p| phase_of(p) != CNPodPhase::Terminating)
            .map(|p| pod::name(p).to_string())
            .collect(),
        saturated,
    }
}

/// Keeps only the claimed pods of a legacy revision.
pub fn plan_legacy(pods: &[Pod]) -> (i32, Vec<String>) {
    let (kept, dropped): (Vec<&Pod>, Vec<&Pod>) = pods.iter().partition(|p| phase_of(p).in_use());
    (
        kept.len() as i32,
        dropped.iter().map(|p| pod::name(p).to_string()).collect(),
    )
}

fn pending_claims(claims: &[CNClaim]) -> i32 {
    claims
        .iter()
        .filter(|c| c.phase() == CNClaimPhase::Pending && c.pod_name().is_none())
        .filter(|c| c.metadata.deletion_timestamp.is_none())
        .count() as i32
}

pub struct CNPoolActor;

impl CNPoolActor {
    async fn set_pods(&self, ctx: &Context<CNPool>, set: &str) -> Result<Vec<Pod>> {
        let labels = BTreeMap::from([
            (LABEL_INSTANCE.to_string(), set.to_string()),
            (LABEL_POOL_NAME.to_string(), ctx.name()),
        ]);
        pods_of(ctx, &labels).await
    }

    /// Shrinks a legacy revision to its claimed pods and marks their claims outdated.
    async fn retire(
        &self,
        ctx: &Context<CNPool>,
        set: &CNSet,
        claims: &[CNClaim],
    ) -> Result<Option<(i32, i32)>> {
        let sets: Api<CNSet> = ctx.api();
        let name = set.name_any();
        let pods = self.set_pods(ctx, &name).await?;
        let observed = set.status.as_ref().map_or(0, |s| s.replicas);
        if set.spec.pod_set.replicas == 0 && observed == 0 && pods.is_empty() {
            info!("{}: removing drained revision {}", ctx.key(), name);
            kube_utils::delete_if_exists(&sets, &name).await?;
            return Ok(None);
        }

        let (replicas, pods_to_delete) = plan_legacy(&pods);
        if replicas != set.spec.pod_set.replicas || pods_to_delete != set.spec.pods_to_delete {
            debug!("{}: legacy {} keeps {} pods", ctx.key(), name, replicas);
            kube_utils::cas_merge(
                &sets,
                set,
                json!({ "spec": { "replicas": replicas, "podsToDelete": pods_to_delete } }),
            )
            .await?;
        }

        let hosted: BTreeSet<&str> = pods
            .iter()
            .filter(|p| phase_of(p).in_use())
            .map(pod::name)
            .collect();
        let claim_api: Api<CNClaim> = ctx.api();
        for claim in claims {
            let on_legacy = claim.pod_name().map_or(false, |p| hosted.contains(p));
            if on_legacy && claim.phase() == CNClaimPhase::Bound {
                info!("{}: claim {} is outdated", ctx.key(), claim.name_any());
                kube_utils::patch_status(
                    &claim_api,
                    claim,
                    &json!({ "phase": CNClaimPhase::Outdated }),
                )
                .await?;
            }
        }
        let idle = pods.iter().filter(|p| phase_of(p) == CNPodPhase::Idle).count() as i32;
        Ok(Some((idle, replicas)))
    }
}

#[async_trait]
impl Actor<CNPool> for CNPoolActor {
    async fn observe(&self, ctx: &Context<CNPool>) -> Result<Option<Duration>> {
        let pool = ctx.obj.as_ref();
        let name = pool.name_any();
        let namespace = ctx.namespace()?;
        let current_name = format!("{}-{}", name, revision_hash(pool)?);

        let sets: Api<CNSet> = ctx.api();
        let owned = kube_utils::list_labeled(&sets, &set_labels(&name)).await?;
        let claims: Vec<CNClaim> = {
            let api: Api<CNClaim> = ctx.api();
            api.list(&Default::default())
                .await?
                .items
                .into_iter()
                .filter(|c| c.spec.pool_name.as_deref() == Some(name.as_str()))
                .collect()
        };
        let pending = pending_claims(&claims);

        let mut idle = 0;
        let mut legacy_pods = 0;
        let mut legacy_sets = 0;
        for set in owned.iter().filter(|s| s.name_any() != current_name) {
            if let Some((legacy_idle, kept)) = self.retire(ctx, set, &claims).await? {
                idle += legacy_idle;
                legacy_pods += kept;
                legacy_sets += 1;
            }
        }

        let live = owned.iter().find(|s| s.name_any() == current_name);
        let pods = self.set_pods(ctx, &current_name).await?;
        let cap = pool
            .spec
            .strategy
            .scale_strategy
            .max_pods
            .map(|m| (m - legacy_pods).max(0));
        let plan = plan_current(
            &pods,
            live.map_or(0, |s| s.spec.pod_set.replicas),
            pending,
            pool.spec.strategy.scale_strategy.max_idle,
            cap,
        );

        let pod_api: Api<Pod> = ctx.api();
        for victim in pods.iter().filter(|p| plan.terminate.iter().any(|n| n == pod::name(p))) {
            kube_utils::cas_metadata(
                &pod_api,
                victim,
                BTreeMap::from([(
                    LABEL_CN_PHASE.to_string(),
                    Some(CNPodPhase::Terminating.as_str().to_string()),
                )]),
                BTreeMap::new(),
            )
            .await?;
        }

        let spec = desired_spec(pool, plan.replicas, plan.pods_to_delete.clone());
        match live {
            None => {
                info!("{}: creating revision {} with {} pods", ctx.key(), current_name, plan.replicas);
                let mut set = CNSet::new(&current_name, spec);
                set.metadata.namespace = Some(namespace.clone());
                set.metadata.labels = Some(set_labels(&name));
                set.metadata.owner_references = kube_utils::owner_ref(pool).map(|o| vec![o]);
                version::stamp_operator_version(&mut set.metadata, None);
                sets.create(&PostParams::default(), &set).await?;
            }
            Some(live) if live.spec != spec => {
                debug!("{}: resizing {} to {}", ctx.key(), current_name, plan.replicas);
                kube_utils::cas_merge(&sets, live, json!({ "spec": spec })).await?;
            }
            Some(_) => {}
        }

        let in_use = pods.iter().filter(|p| phase_of(p).in_use()).count() as i32;
        idle += pods.iter().filter(|p| phase_of(p) == CNPodPhase::Idle).count() as i32;
        let now = Utc::now();
        let mut status = CNPoolStatus {
            conditional: pool.status.clone().unwrap_or_default().conditional,
            current_cn_set: Some(current_name.clone()),
            idle,
            in_use: in_use + legacy_pods,
            pending_claims: pending,
            legacy_cn_sets: legacy_sets,
        };
        let current_ready = live.map_or(false, |s| conditions::is_true(s.conditions(), CONDITION_READY));
        let ready = current_ready && legacy_sets == 0 && !plan.saturated;
        conditions::set(
            &mut status.conditional.conditions,
            CONDITION_READY,
            ready,
            if plan.saturated {
                "MaxPodsReached"
            } else if legacy_sets > 0 {
                "RollingOut"
            } else if ready {
                "PoolReady"
            } else {
                "Scaling"
            },
            format!("{} idle, {} in use, {} pending", idle, status.in_use, pending),
            now,
        );
        conditions::set(&mut status.conditional.conditions, CONDITION_SYNCED, true, "Synced", "", now);
        if Some(&status) != pool.status.as_ref() {
            ctx.patch_status(&status).await?;
        }

        if plan.saturated {
            return Err(resync(
                format!("pool {} reached maxPods with {} pending claims", name, pending),
                SATURATION_RETRY,
            ));
        }
        Ok((legacy_sets > 0).then_some(LEGACY_POLL))
    }

    async fn finalize(&self, ctx: &Context<CNPool>) -> Result<bool> {
        let sets: Api<CNSet> = ctx.api();
        let owned = kube_utils::list_labeled(&sets, &set_labels(&ctx.name())).await?;
        if owned.is_empty() {
            return Ok(true);
        }
        for set in owned.iter().filter(|s| s.metadata.deletion_timestamp.is_none()) {
            info!("{}: deleting {}", ctx.key(), set.name_any());
            kube_utils::delete_if_exists(&sets, &set.name_any()).await?;
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::pod::testing;
    use crate::crd::cnpool::CNPoolSpec;
    use crate::crd::common::Overlay;
    use chrono::Duration as ChronoDuration;

    fn pool() -> CNPool {
        let mut p = CNPool::new("pool", CNPoolSpec::default());
        p.spec.template.pod_set.image = Some("matrixorigin/matrixone:1.2.0".to_string());
        p.spec.strategy.scale_strategy.max_idle = 7;
        p
    }

    fn pool_pod(name: &str, phase: &str, age_secs: i64) -> Pod {
        let p = testing::created(testing::pod(name, None), Utc::now() - ChronoDuration::seconds(age_secs));
        testing::with_label(p, LABEL_CN_PHASE, phase)
    }

    #[test]
    fn test_relabelling_keeps_revision() {
        let a = pool();
        let mut b = pool();
        b.spec.template.pod_set.overlay = Some(Overlay {
            pod_labels: BTreeMap::from([("team".to_string(), "db".to_string())]),
            ..Default::default()
        });
        b.spec.pod_labels.insert("tier".to_string(), "gold".to_string());
        b.spec.template.pod_set.replicas = 4;
        assert_eq!(revision_hash(&a).unwrap(), revision_hash(&b).unwrap());

        let mut c = pool();
        c.spec.template.pod_set.image = Some("matrixorigin/matrixone:1.2.1".to_string());
        assert_ne!(revision_hash(&a).unwrap(), revision_hash(&c).unwrap());
    }

    #[test]
    fn test_explicit_zero_values_roll_pool() {
        let a = pool();
        let mut b = pool();
        b.spec.template.pod_set.overlay = Some(Overlay {
            termination_grace_period_seconds: Some(0),
            ..Default::default()
        });
        assert_ne!(revision_hash(&a).unwrap(), revision_hash(&b).unwrap());

        let mut c = pool();
        c.spec.template.pod_set.export_to_prometheus = Some(false);
        assert_ne!(revision_hash(&a).unwrap(), revision_hash(&c).unwrap());
    }

    #[test]
    fn test_desired_spec_is_pooled() {
        let mut p = pool();
        p.spec.pod_labels.insert("tier".to_string(), "gold".to_string());
        let spec = desired_spec(&p, 3, vec![]);
        assert!(spec.is_pooling());
        assert_eq!(spec.pod_set.replicas, 3);
        let labels = &spec.pod_set.overlay.unwrap().pod_labels;
        assert_eq!(labels[LABEL_POOL_NAME], "pool");
        assert_eq!(labels["tier"], "gold");
    }

    #[test]
    fn test_scale_in_order() {
        let pods = vec![
            pool_pod("idle-old", "Idle", 600),
            pool_pod("idle-new", "Idle", 60),
            pool_pod("bound", "Bound", 30),
            pool_pod("unknown", "Unknown", 100),
            pool_pod("terminating", "Terminating", 900),
            pool_pod("draining", "Draining", 10),
        ];
        let names: Vec<&str> = scale_in_victims(&pods, 10).into_iter().map(pod::name).collect();
        assert_eq!(names, vec!["terminating", "unknown", "idle-new", "idle-old"]);
        assert_eq!(scale_in_victims(&pods, 2).len(), 2);
    }

    #[test]
    fn test_scale_in_is_blocked_by_pending_claims() {
        let pods: Vec<Pod> = (0..5).map(|i| pool_pod(&format!("p{}", i), "Idle", i)).collect();
        let plan = plan_current(&pods, 5, 1, 2, None);
        assert_eq!(plan.replicas, 5);
        assert!(plan.terminate.is_empty());

        let plan = plan_current(&pods, 5, 0, 2, None);
        assert_eq!(plan.replicas, 2);
        assert_eq!(plan.terminate, vec!["p0", "p1", "p2"]);
        assert_eq!(plan.pods_to_delete, vec!["p0", "p1", "p2"]);
    }

    #[test]
    fn test_max_pods_caps_growth() {
        let pods = vec![pool_pod("a", "Bound", 10), pool_pod("b", "Idle", 10)];
        let plan = plan_current(&pods, 2, 4, 2, Some(5));
        assert_eq!(plan.replicas, 5);
        assert!(plan.saturated);

        let plan = plan_current(&pods, 2, 0, 1, Some(5));
        assert_eq!(plan.replicas, 2);
        assert!(!plan.saturated);
    }

    #[test]
    fn test_image_change_rolls_pool() {
        // 10 pods, 3 claimed; after an image change the old revision is legacy
        let mut old: Vec<Pod> = (0..7).map(|i| pool_pod(&format!("old-{}", i), "Idle", 100)).collect();
        old.extend((7..10).map(|i| pool_pod(&format!("old-{}", i), "Bound", 100)));
        let (kept, dropped) = plan_legacy(&old);
        assert_eq!(kept, 3);
        assert_eq!(dropped.len(), 7);
        assert!(dropped.iter().all(|n| !["old-7", "old-8", "old-9"].contains(&n.as_str())));

        let plan = plan_current(&[], 0, 0, 7, Some(10 - kept));
        assert_eq!(plan.replicas, 7);
        assert!(!plan.saturated);
    }

    #[test]
    fn test_missing_pods_shrink_first() {
        let pods = vec![pool_pod("a", "Idle", 10)];
        let plan = plan_current(&pods, 4, 0, 1, None);
        assert_eq!(plan.replicas, 1);
        assert!(plan.terminate.is_empty());
    }
}
