//! One `Actor` per kind, plus the builders they share.

pub mod backup;
pub mod bucketclaim;
pub mod cluster;
pub mod cnclaim;
pub mod cnclaimset;
pub mod cnpool;
pub mod cnset;
pub mod cnstore;
pub mod dnset;
pub mod logset;
pub mod proxyset;
pub mod ttl;
pub mod webui;
pub mod workload;

use std::time::Duration;

use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams};

use crate::crd::common::Deps;
use crate::crd::LogSet;
use crate::errors::*;
use crate::runtime::{Context, Object};

/// Delay before looking again at a dependency that is not ready yet.
pub const DEPENDENCY_RETRY: Duration = Duration::from_secs(10);

/// Delay before observing again an object this reconcile just wrote.
///
/// Status patches are guarded by the resource version that was read, so
/// they must wait for the fresh copy.
pub const REFRESH_DELAY: Duration = Duration::from_secs(1);

/// The LogSet a set depends on, once it publishes its discovery address.
pub async fn resolve_log_set<K: Object>(ctx: &Context<K>, deps: &Deps) -> Result<LogSet> {
    let log_ref = deps
        .log_set
        .as_ref()
        .ok_or_else(|| invariant("LogSetMissing", "spec.deps.logSet is required"))?;
    let namespace = ctx.namespace()?;
    let api: Api<LogSet> = ctx.api_in(log_ref.namespace_or(&namespace));
    let log_set = api
        .get_opt(&log_ref.name)
        .await?
        .ok_or_else(|| resync(format!("waiting for LogSet {}", log_ref.name), DEPENDENCY_RETRY))?;
    if log_set.discovery().is_none() {
        return Err(resync(
            format!("waiting for LogSet {} to publish discovery", log_ref.name),
            DEPENDENCY_RETRY,
        ));
    }
    Ok(log_set)
}

/// Pods carrying every label in `labels`, in the namespace of the context.
pub async fn pods_of<K: Object>(
    ctx: &Context<K>,
    labels: &std::collections::BTreeMap<String, String>,
) -> Result<Vec<Pod>> {
    let api: Api<Pod> = ctx.api();
    let lp = ListParams::default().labels(&crate::common::selector_string(labels));
    Ok(api.list(&lp).await?.items)
}
