//! Keeps `replicas` claims alive and migrates the outdated ones.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, PostParams};
use kube::ResourceExt;
use log::info;

use crate::common::conditions::{self, CONDITION_READY, CONDITION_SYNCED};
use crate::common::{identity, pod, selector_string, LABEL_CLAIMSET};
use crate::crd::cnclaim::{CNClaimPhase, CNClaimSetStatus, ClaimSummary, SourcePod};
use crate::crd::{CNClaim, CNClaimSet};
use crate::errors::*;
use crate::kube_utils;
use crate::runtime::{Actor, Context};

const MIGRATION_POLL: Duration = Duration::from_secs(10);

fn claim_labels(set: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(LABEL_CLAIMSET.to_string(), set.to_string())])
}

/// Position of a claim in the scale-in order; lower goes first.
fn deletion_key(
    claim: &CNClaim,
    pods: &BTreeMap<String, Pod>,
) -> (u8, i32, Reverse<Option<DateTime<Utc>>>) {
    let claim_created = claim.metadata.creation_timestamp.as_ref().map(|t| t.0);
    let rank = |r: u8| (r, 0, Reverse(claim_created));
    match claim.phase() {
        CNClaimPhase::Pending => rank(0),
        CNClaimPhase::Lost => rank(1),
        CNClaimPhase::Outdated => rank(2),
        CNClaimPhase::Bound => {
            let Some(p) = claim.pod_name().and_then(|n| pods.get(n)) else {
                return rank(3);
            };
            let newer_first = Reverse(pod::created_at(p));
            if !pod::is_scheduled(p) {
                (3, 0, newer_first)
            } else if pod::phase(p) == "Pending" {
                (4, 0, newer_first)
            } else if pod::phase(p) == "Failed" {
                (5, 0, newer_first)
            } else if !pod::is_ready(p) {
                (6, 0, newer_first)
            } else {
                (7, pod::deletion_cost(p), newer_first)
            }
        }
    }
}

/// The first `count` claims to delete.
pub fn scale_in_order<'a>(
    claims: &[&'a CNClaim],
    pods: &BTreeMap<String, Pod>,
    count: usize,
) -> Vec<&'a CNClaim> {
    let mut ordered: Vec<&CNClaim> = claims.to_vec();
    ordered.sort_by_key(|c| deletion_key(c, pods));
    ordered.truncate(count);
    ordered
}

/// Splits claims into the ones counted against `replicas` and the
/// replacements still waiting for their outdated claim to go.
pub fn partition<'a>(claims: &'a [CNClaim]) -> (Vec<&'a CNClaim>, BTreeMap<String, &'a CNClaim>) {
    let outdated_pods: BTreeSet<&str> = claims
        .iter()
        .filter(|c| c.phase() == CNClaimPhase::Outdated)
        .filter_map(|c| c.pod_name())
        .collect();
    let mut counted = vec![];
    let mut replacements = BTreeMap::new();
    for c in claims.iter().filter(|c| c.metadata.deletion_timestamp.is_none()) {
        match c.spec.source_pod.as_ref() {
            Some(src) if outdated_pods.contains(src.pod_name.as_str()) => {
                replacements.insert(src.pod_name.clone(), c);
            }
            _ => counted.push(c),
        }
    }
    (counted, replacements)
}

fn new_claim(set: &CNClaimSet, namespace: &str, source: Option<SourcePod>) -> CNClaim {
    let name = format!("{}-{}", set.name_any(), identity::random_string(5));
    let template = &set.spec.template;
    let mut spec = template.spec.clone();
    spec.pod_name = None;
    spec.source_pod = source;
    if spec.selector.is_none() {
        spec.selector = set.spec.selector.clone();
    }
    let mut claim = CNClaim::new(&name, spec);
    let meta = template.metadata.clone().unwrap_or_default();
    let mut labels = meta.labels;
    labels.extend(claim_labels(&set.name_any()));
    claim.metadata.namespace = Some(namespace.to_string());
    claim.metadata.labels = Some(labels);
    claim.metadata.annotations = (!meta.annotations.is_empty()).then_some(meta.annotations);
    claim.metadata.owner_references = kube_utils::owner_ref(set).map(|o| vec![o]);
    claim
}

pub struct CNClaimSetActor;

#[async_trait]
impl Actor<CNClaimSet> for CNClaimSetActor {
    async fn observe(&self, ctx: &Context<CNClaimSet>) -> Result<Option<Duration>> {
        let set = ctx.obj.as_ref();
        let name = set.name_any();
        let namespace = ctx.namespace()?;
        let claim_api: Api<CNClaim> = ctx.api();
        let claims = kube_utils::list_labeled(&claim_api, &claim_labels(&name)).await?;
        let pods: BTreeMap<String, Pod> = {
            let pod_api: Api<Pod> = ctx.api();
            let mut pods = BTreeMap::new();
            for pod_name in claims.iter().filter_map(|c| c.pod_name()) {
                if let Some(p) = pod_api.get_opt(pod_name).await? {
                    pods.insert(pod_name.to_string(), p);
                }
            }
            pods
        };

        let (counted, replacements) = partition(&claims);
        let mut migrating = false;
        for outdated in counted.iter().filter(|c| c.phase() == CNClaimPhase::Outdated) {
            let Some(pod_name) = outdated.pod_name() else {
                continue;
            };
            match replacements.get(pod_name) {
                None => {
                    let source = SourcePod {
                        pod_name: pod_name.to_string(),
                        node_name: pods
                            .get(pod_name)
                            .and_then(|p| p.spec.as_ref())
                            .and_then(|s| s.node_name.clone()),
                    };
                    let replacement = new_claim(set, &namespace, Some(source));
                    info!(
                        "{}: migrating {} to {}",
                        ctx.key(),
                        outdated.name_any(),
                        replacement.name_any()
                    );
                    claim_api.create(&PostParams::default(), &replacement).await?;
                    migrating = true;
                }
                Some(r) if r.phase() == CNClaimPhase::Bound => {
                    info!("{}: {} migrated, removing {}", ctx.key(), r.name_any(), outdated.name_any());
                    kube_utils::delete_if_exists(&claim_api, &outdated.name_any()).await?;
                }
                Some(_) => migrating = true,
            }
        }

        let replicas = set.spec.replicas.max(0) as usize;
        if counted.len() < replicas {
            for _ in counted.len()..replicas {
                let claim = new_claim(set, &namespace, None);
                info!("{}: creating claim {}", ctx.key(), claim.name_any());
                claim_api.create(&PostParams::default(), &claim).await?;
            }
        } else if counted.len() > replicas {
            for victim in scale_in_order(&counted, &pods, counted.len() - replicas) {
                info!("{}: scaling in claim {}", ctx.key(), victim.name_any());
                kube_utils::delete_if_exists(&claim_api, &victim.name_any()).await?;
                if let Some(r) = victim.pod_name().and_then(|p| replacements.get(p)) {
                    kube_utils::delete_if_exists(&claim_api, &r.name_any()).await?;
                }
            }
        }

        let mut summaries: Vec<ClaimSummary> = counted
            .iter()
            .map(|c| ClaimSummary {
                claim_name: c.name_any(),
                phase: c.phase(),
                pod_name: c.pod_name().map(str::to_string),
            })
            .collect();
        summaries.sort_by(|a, b| a.claim_name.cmp(&b.claim_name));
        let ready_replicas = counted.iter().filter(|c| c.phase().is_bound()).count() as i32;
        let now = Utc::now();
        let mut status = CNClaimSetStatus {
            conditional: set.status.clone().unwrap_or_default().conditional,
            replicas: counted.len() as i32,
            ready_replicas,
            claims: summaries,
            label_selector: Some(selector_string(&claim_labels(&name))),
        };
        let ready = ready_replicas >= set.spec.replicas && !migrating;
        conditions::set(
            &mut status.conditional.conditions,
            CONDITION_READY,
            ready,
            if migrating { "Migrating" } else if ready { "AllBound" } else { "Binding" },
            format!("{}/{} claims bound", ready_replicas, set.spec.replicas),
            now,
        );
        conditions::set(&mut status.conditional.conditions, CONDITION_SYNCED, true, "Synced", "", now);
        if Some(&status) != set.status.as_ref() {
            ctx.patch_status(&status).await?;
        }
        Ok(migrating.then_some(MIGRATION_POLL))
    }

    /// Done once every claim of the set is gone.
    async fn finalize(&self, ctx: &Context<CNClaimSet>) -> Result<bool> {
        let claim_api: Api<CNClaim> = ctx.api();
        let claims = kube_utils::list_labeled(&claim_api, &claim_labels(&ctx.name())).await?;
        if claims.is_empty() {
            return Ok(true);
        }
        for c in claims.iter().filter(|c| c.metadata.deletion_timestamp.is_none()) {
            kube_utils::delete_if_exists(&claim_api, &c.name_any()).await?;
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::pod::testing;
    use crate::common::ANN_POD_DELETION_COST;
    use crate::crd::cnclaim::{CNClaimSetSpec, CNClaimSpec, CNClaimStatus};
    use chrono::Duration as ChronoDuration;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    fn claim(name: &str, phase: CNClaimPhase, pod_name: Option<&str>, age_secs: i64) -> CNClaim {
        let mut c = CNClaim::new(
            name,
            CNClaimSpec {
                pod_name: pod_name.map(str::to_string),
                ..Default::default()
            },
        );
        c.metadata.creation_timestamp = Some(Time(Utc::now() - ChronoDuration::seconds(age_secs)));
        c.status = Some(CNClaimStatus {
            phase,
            ..Default::default()
        });
        c
    }

    fn pods(list: Vec<Pod>) -> BTreeMap<String, Pod> {
        list.into_iter().map(|p| (pod::name(&p).to_string(), p)).collect()
    }

    #[test]
    fn test_deletion_order() {
        let now = Utc::now();
        let mut unscheduled = testing::pod("p-unscheduled", None);
        unscheduled.spec = None;
        let mut pending = testing::pod("p-pending", None);
        if let Some(s) = pending.status.as_mut() {
            s.phase = Some("Pending".to_string());
        }
        let mut failed = testing::pod("p-failed", None);
        if let Some(s) = failed.status.as_mut() {
            s.phase = Some("Failed".to_string());
        }
        let not_ready = testing::pod("p-not-ready", None);
        let cheap = testing::with_annotation(
            testing::pod("p-cheap", Some(now)),
            ANN_POD_DELETION_COST,
            "-10",
        );
        let ready_old = testing::created(testing::pod("p-ready-old", Some(now)), now - ChronoDuration::hours(2));
        let ready_new = testing::created(testing::pod("p-ready-new", Some(now)), now - ChronoDuration::hours(1));
        let pods = pods(vec![unscheduled, pending, failed, not_ready, cheap, ready_old, ready_new]);

        let claims = vec![
            claim("ready-old", CNClaimPhase::Bound, Some("p-ready-old"), 100),
            claim("ready-new", CNClaimPhase::Bound, Some("p-ready-new"), 100),
            claim("cheap", CNClaimPhase::Bound, Some("p-cheap"), 100),
            claim("not-ready", CNClaimPhase::Bound, Some("p-not-ready"), 100),
            claim("failed", CNClaimPhase::Bound, Some("p-failed"), 100),
            claim("pod-pending", CNClaimPhase::Bound, Some("p-pending"), 100),
            claim("unscheduled", CNClaimPhase::Bound, Some("p-unscheduled"), 100),
            claim("outdated", CNClaimPhase::Outdated, Some("p-gone"), 100),
            claim("lost", CNClaimPhase::Lost, None, 100),
            claim("pending-old", CNClaimPhase::Pending, None, 100),
            claim("pending-new", CNClaimPhase::Pending, None, 10),
        ];
        let refs: Vec<&CNClaim> = claims.iter().collect();
        let order: Vec<String> = scale_in_order(&refs, &pods, 100)
            .into_iter()
            .map(|c| c.name_any())
            .collect();
        assert_eq!(
            order,
            vec![
                "pending-new",
                "pending-old",
                "lost",
                "outdated",
                "unscheduled",
                "pod-pending",
                "failed",
                "not-ready",
                "cheap",
                "ready-new",
                "ready-old",
            ]
        );
    }

    #[test]
    fn test_scale_in_beyond_size_takes_everything() {
        let claims = vec![
            claim("a", CNClaimPhase::Pending, None, 10),
            claim("b", CNClaimPhase::Lost, None, 10),
        ];
        let refs: Vec<&CNClaim> = claims.iter().collect();
        assert_eq!(scale_in_order(&refs, &BTreeMap::new(), 5).len(), 2);
    }

    #[test]
    fn test_replacements_do_not_count() {
        let mut replacement = claim("r", CNClaimPhase::Pending, None, 5);
        replacement.spec.source_pod = Some(SourcePod {
            pod_name: "p-old".to_string(),
            node_name: None,
        });
        let claims = vec![
            claim("a", CNClaimPhase::Outdated, Some("p-old"), 100),
            claim("b", CNClaimPhase::Bound, Some("p-b"), 100),
            replacement,
        ];
        let (counted, replacements) = partition(&claims);
        let names: Vec<String> = counted.iter().map(|c| c.name_any()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(replacements["p-old"].name_any(), "r");
    }

    #[test]
    fn test_new_claim_from_template() {
        let mut set = CNClaimSet::new("tenant", CNClaimSetSpec::default());
        set.spec.template.spec.pool_name = Some("pool".to_string());
        set.spec.template.spec.pod_name = Some("stale".to_string());
        let c = new_claim(&set, "default", None);
        assert!(c.name_any().starts_with("tenant-"));
        assert_eq!(c.name_any().len(), "tenant-".len() + 5);
        assert!(c.spec.pod_name.is_none());
        assert_eq!(c.spec.pool_name.as_deref(), Some("pool"));
        assert_eq!(c.metadata.labels.unwrap()[LABEL_CLAIMSET], "tenant");
    }
}
