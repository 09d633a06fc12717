//! Per-pod reconciler of CN stores.
//!
//! Opens the store readiness gate once the store registers, walks pool pods
//! through their phases, and holds Kruise lifecycle hooks until the store
//! has drained.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, Patch, PatchParams};
use kube::ResourceExt;
use log::{debug, info};
use serde_json::json;

use crate::common::{
    duration_or, pod, ANN_CN_STATE, ANN_DRAIN_START, FINALIZER_CN_DRAINING, GATE_CN_POOL,
    GATE_CN_STORE, KRUISE_PREPARING_DELETE, KRUISE_PREPARING_UPDATE, LABEL_CN_PHASE,
    LABEL_INSTANCE, LABEL_KRUISE_LIFECYCLE_STATE, LABEL_POOL_NAME,
};
use crate::crd::cnclaim::Workload;
use crate::crd::cnpool::CNPodPhase;
use crate::crd::cnset::{CNStoreState, DEFAULT_STORE_DRAIN_TIMEOUT};
use crate::crd::{CNPool, CNSet};
use crate::errors::*;
use crate::kube_utils;
use crate::probe::StoreProbe;
use crate::runtime::{Actor, Context};
use crate::version::{self, MOFeature};

const DRAIN_POLL: Duration = Duration::from_secs(5);

/// What the owning set and pool say about a pod.
#[derive(Clone, Debug)]
pub struct Settings {
    pub version: Option<String>,
    pub drains: bool,
    pub drain_timeout: Duration,
    /// Set for pool pods only.
    pub reclaim_timeout: Option<Duration>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoreAction {
    OpenStoreGate,
    SetPoolGate(bool),
    SetPhase(CNPodPhase),
    AddHook,
    StartDrain,
    ReleaseHook,
    ClearDrain,
}

/// Whether nothing the store would lose on shutdown is still attached.
///
/// Counters the database version does not export are ignored.
pub fn drained(w: &Workload, version: Option<&str>) -> bool {
    w.connections == 0
        && (!version::mo_has(version, MOFeature::PipelineInfo) || w.pipelines == 0)
        && (!version::mo_has(version, MOFeature::LockMigration) || w.replicas == 0)
}

fn gate_is(p: &Pod, gate: &str, open: bool) -> bool {
    pod::condition(p, gate).map_or(false, |c| (c.status == "True") == open)
}

fn drained_for(p: &Pod, now: DateTime<Utc>) -> Duration {
    pod::annotation(p, ANN_DRAIN_START)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .and_then(|t| now.signed_duration_since(t.with_timezone(&Utc)).to_std().ok())
        .unwrap_or_default()
}

pub fn plan(
    p: &Pod,
    state: CNStoreState,
    workload: &Workload,
    settings: &Settings,
    now: DateTime<Utc>,
) -> Vec<StoreAction> {
    let mut actions = vec![];
    if state == CNStoreState::Up && !gate_is(p, GATE_CN_STORE, true) {
        actions.push(StoreAction::OpenStoreGate);
    }
    let empty = drained(workload, settings.version.as_deref());
    let draining = pod::annotation(p, ANN_CN_STATE) == Some(CNStoreState::Draining.as_str());

    if let Some(reclaim) = settings.reclaim_timeout {
        let phase = CNPodPhase::parse(pod::label(p, LABEL_CN_PHASE));
        match phase {
            CNPodPhase::Unknown if state == CNStoreState::Up => {
                actions.push(StoreAction::SetPhase(CNPodPhase::Idle))
            }
            CNPodPhase::Draining if empty || drained_for(p, now) >= reclaim => {
                actions.push(StoreAction::SetPhase(CNPodPhase::Terminating))
            }
            _ => {}
        }
        let bound = phase == CNPodPhase::Bound;
        if !gate_is(p, GATE_CN_POOL, bound) {
            actions.push(StoreAction::SetPoolGate(bound));
        }
    }

    let hooked = matches!(
        pod::label(p, LABEL_KRUISE_LIFECYCLE_STATE),
        Some(KRUISE_PREPARING_DELETE) | Some(KRUISE_PREPARING_UPDATE)
    );
    let held = pod::has_finalizer(p, FINALIZER_CN_DRAINING);
    if hooked && held {
        if !draining {
            actions.push(StoreAction::StartDrain);
        } else if empty || drained_for(p, now) >= settings.drain_timeout {
            actions.push(StoreAction::ReleaseHook);
        }
    } else if !hooked && !pod::is_terminating(p) {
        if settings.drains && !held {
            actions.push(StoreAction::AddHook);
        }
        if draining && settings.reclaim_timeout.is_none() {
            actions.push(StoreAction::ClearDrain);
        }
    }
    actions
}

async fn set_condition(api: &Api<Pod>, p: &Pod, gate: &str, open: bool) -> Result<Pod> {
    let patch = json!({
        "status": {
            "conditions": [{
                "type": gate,
                "status": if open { "True" } else { "False" },
                "lastTransitionTime": Utc::now().to_rfc3339(),
            }]
        }
    });
    Ok(api
        .patch_status(&p.name_any(), &PatchParams::default(), &Patch::Strategic(&patch))
        .await?)
}

pub struct CNStoreActor {
    pub probe: Arc<dyn StoreProbe>,
}

impl CNStoreActor {
    async fn settings(&self, ctx: &Context<Pod>) -> Result<Option<Settings>> {
        let p = ctx.obj.as_ref();
        let Some(set_name) = pod::label(p, LABEL_INSTANCE) else {
            return Ok(None);
        };
        let sets: Api<CNSet> = ctx.api();
        let Some(cn) = sets.get_opt(set_name).await? else {
            return Ok(None);
        };
        let reclaim_timeout = match pod::label(p, LABEL_POOL_NAME) {
            Some(pool) => {
                let pools: Api<CNPool> = ctx.api();
                match pools.get_opt(pool).await? {
                    Some(pool) => Some(pool.reclaim_timeout()?),
                    None => return Ok(None),
                }
            }
            None => None,
        };
        Ok(Some(Settings {
            version: cn.spec.pod_set.semantic_version.clone(),
            drains: cn.spec.drains(),
            drain_timeout: duration_or(
                cn.spec.scaling_config.store_drain_timeout.as_deref(),
                crate::common::parse_duration(DEFAULT_STORE_DRAIN_TIMEOUT)?,
            )?,
            reclaim_timeout,
        }))
    }
}

#[async_trait]
impl Actor<Pod> for CNStoreActor {
    async fn observe(&self, ctx: &Context<Pod>) -> Result<Option<Duration>> {
        let Some(settings) = self.settings(ctx).await? else {
            return Ok(None);
        };
        let mut current = ctx.obj.as_ref().clone();
        let state = self.probe.cn_store_state(&current).await?;
        let workload = self.probe.workload(&current).await?;
        let now = Utc::now();
        let actions = plan(&current, state, &workload, &settings, now);
        if actions.is_empty() {
            return Ok(None);
        }

        let api: Api<Pod> = ctx.api();
        let mut waiting = false;
        for action in actions {
            debug!("{}: {:?}", ctx.key(), action);
            current = match action {
                StoreAction::OpenStoreGate => set_condition(&api, &current, GATE_CN_STORE, true).await?,
                StoreAction::SetPoolGate(open) => set_condition(&api, &current, GATE_CN_POOL, open).await?,
                StoreAction::SetPhase(phase) => {
                    info!("{}: pool phase -> {}", ctx.key(), phase.as_str());
                    kube_utils::cas_metadata(
                        &api,
                        &current,
                        BTreeMap::from([(LABEL_CN_PHASE.to_string(), Some(phase.as_str().to_string()))]),
                        BTreeMap::new(),
                    )
                    .await?
                }
                StoreAction::AddHook => kube_utils::add_finalizer(&api, &current, FINALIZER_CN_DRAINING).await?,
                StoreAction::StartDrain => {
                    waiting = true;
                    ctx.normal("DrainStarted", format!("draining store of {}", current.name_any()))
                        .await;
                    kube_utils::cas_metadata(
                        &api,
                        &current,
                        BTreeMap::new(),
                        BTreeMap::from([
                            (ANN_CN_STATE.to_string(), Some(CNStoreState::Draining.as_str().to_string())),
                            (ANN_DRAIN_START.to_string(), Some(now.to_rfc3339())),
                        ]),
                    )
                    .await?
                }
                StoreAction::ReleaseHook => {
                    info!("{}: store drained, releasing lifecycle hook", ctx.key());
                    kube_utils::remove_finalizer(&api, &current, FINALIZER_CN_DRAINING).await?
                }
                StoreAction::ClearDrain => {
                    kube_utils::cas_metadata(
                        &api,
                        &current,
                        BTreeMap::new(),
                        BTreeMap::from([
                            (ANN_CN_STATE.to_string(), None),
                            (ANN_DRAIN_START.to_string(), None),
                        ]),
                    )
                    .await?
                }
            };
        }
        let still_draining = pod::annotation(&current, ANN_CN_STATE)
            == Some(CNStoreState::Draining.as_str());
        Ok((waiting || still_draining).then_some(DRAIN_POLL))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::pod::testing;
    use crate::probe::MockStoreProbe;
    use chrono::Duration as ChronoDuration;
    use k8s_openapi::api::core::v1::PodCondition;

    fn settings() -> Settings {
        Settings {
            version: Some("1.2.0".to_string()),
            drains: true,
            drain_timeout: Duration::from_secs(300),
            reclaim_timeout: None,
        }
    }

    fn with_gate(mut p: Pod, gate: &str, open: bool) -> Pod {
        if let Some(conds) = p.status.as_mut().and_then(|s| s.conditions.as_mut()) {
            conds.push(PodCondition {
                type_: gate.to_string(),
                status: if open { "True" } else { "False" }.to_string(),
                ..Default::default()
            });
        }
        p
    }

    fn with_finalizer(mut p: Pod) -> Pod {
        p.metadata.finalizers = Some(vec![FINALIZER_CN_DRAINING.to_string()]);
        p
    }

    #[test]
    fn test_drained_respects_version() {
        let w = Workload {
            connections: 0,
            pipelines: 2,
            replicas: 1,
        };
        assert!(!drained(&w, Some("1.2.0")));
        assert!(drained(&w, Some("1.0.0")));
        let w = Workload {
            connections: 0,
            pipelines: 0,
            replicas: 1,
        };
        assert!(drained(&w, Some("1.1.2")));
        assert!(!drained(&w, None));
    }

    #[test]
    fn test_gate_opens_when_store_is_up() {
        let p = with_finalizer(testing::pod("mo-tp-cn-abcde", None));
        let actions = plan(&p, CNStoreState::Up, &Workload::default(), &settings(), Utc::now());
        assert_eq!(actions, vec![StoreAction::OpenStoreGate]);

        let p = with_gate(p, GATE_CN_STORE, true);
        assert!(plan(&p, CNStoreState::Up, &Workload::default(), &settings(), Utc::now()).is_empty());
    }

    #[test]
    fn test_hook_is_added_when_draining_is_enabled() {
        let p = with_gate(testing::pod("mo-tp-cn-abcde", None), GATE_CN_STORE, true);
        let actions = plan(&p, CNStoreState::Up, &Workload::default(), &settings(), Utc::now());
        assert_eq!(actions, vec![StoreAction::AddHook]);
    }

    #[test]
    fn test_preparing_delete_drains_then_releases() {
        let now = Utc::now();
        let p = with_gate(testing::pod("mo-tp-cn-abcde", Some(now)), GATE_CN_STORE, true);
        let p = with_finalizer(testing::with_label(
            p,
            LABEL_KRUISE_LIFECYCLE_STATE,
            KRUISE_PREPARING_DELETE,
        ));
        let busy = Workload {
            connections: 4,
            ..Default::default()
        };
        assert_eq!(
            plan(&p, CNStoreState::Up, &busy, &settings(), now),
            vec![StoreAction::StartDrain]
        );

        let started = now - ChronoDuration::minutes(1);
        let p = testing::with_annotation(p, ANN_CN_STATE, "Draining");
        let p = testing::with_annotation(p, ANN_DRAIN_START, &started.to_rfc3339());
        assert!(plan(&p, CNStoreState::Draining, &busy, &settings(), now).is_empty());
        assert_eq!(
            plan(&p, CNStoreState::Draining, &Workload::default(), &settings(), now),
            vec![StoreAction::ReleaseHook]
        );
        // timeout wins over a busy store
        let later = now + ChronoDuration::minutes(5);
        assert_eq!(
            plan(&p, CNStoreState::Draining, &busy, &settings(), later),
            vec![StoreAction::ReleaseHook]
        );
    }

    #[test]
    fn test_drain_mark_is_cleared_after_in_place_update() {
        let p = with_gate(testing::pod("mo-tp-cn-abcde", None), GATE_CN_STORE, true);
        let p = with_finalizer(testing::with_annotation(p, ANN_CN_STATE, "Draining"));
        let p = testing::with_label(p, LABEL_KRUISE_LIFECYCLE_STATE, "Normal");
        assert_eq!(
            plan(&p, CNStoreState::Up, &Workload::default(), &settings(), Utc::now()),
            vec![StoreAction::ClearDrain]
        );
    }

    #[test]
    fn test_pool_pod_phases() {
        let now = Utc::now();
        let pooled = Settings {
            drains: false,
            reclaim_timeout: Some(Duration::from_secs(600)),
            ..settings()
        };
        let p = with_gate(testing::pod("pool-abc-xyz12", None), GATE_CN_STORE, true);
        let p = with_gate(p, GATE_CN_POOL, false);
        assert_eq!(
            plan(&p, CNStoreState::Up, &Workload::default(), &pooled, now),
            vec![StoreAction::SetPhase(CNPodPhase::Idle)]
        );

        let bound = testing::with_label(p.clone(), LABEL_CN_PHASE, "Bound");
        assert_eq!(
            plan(&bound, CNStoreState::Up, &Workload::default(), &pooled, now),
            vec![StoreAction::SetPoolGate(true)]
        );

        let busy = Workload {
            connections: 1,
            ..Default::default()
        };
        let draining = testing::with_label(p, LABEL_CN_PHASE, "Draining");
        let draining = testing::with_annotation(draining, ANN_DRAIN_START, &now.to_rfc3339());
        assert!(plan(&draining, CNStoreState::Up, &busy, &pooled, now).is_empty());
        assert_eq!(
            plan(&draining, CNStoreState::Up, &Workload::default(), &pooled, now),
            vec![StoreAction::SetPhase(CNPodPhase::Terminating)]
        );
        assert_eq!(
            plan(&draining, CNStoreState::Up, &busy, &pooled, now + ChronoDuration::minutes(11)),
            vec![StoreAction::SetPhase(CNPodPhase::Terminating)]
        );
    }

    #[tokio::test]
    async fn test_probe_feeds_the_plan() {
        let mut probe = MockStoreProbe::new();
        probe.expect_cn_store_state().returning(|_| Ok(CNStoreState::Up));
        probe.expect_workload().returning(|_| {
            Ok(Workload {
                connections: 2,
                ..Default::default()
            })
        });
        let p = with_finalizer(testing::pod("mo-tp-cn-abcde", None));
        let state = probe.cn_store_state(&p).await.unwrap();
        let workload = probe.workload(&p).await.unwrap();
        let actions = plan(&p, state, &workload, &settings(), Utc::now());
        assert_eq!(actions, vec![StoreAction::OpenStoreGate]);
    }
}
