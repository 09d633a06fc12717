//! Drives `Actor`s from `kube_runtime::Controller` streams.
//!
//! An actor only decides what the world should look like; the runtime owns
//! the finalizer of the kind, maps the error taxonomy onto requeue actions
//! and keeps per-object backoff state.

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::api::Api;
use kube::{Client, Resource, ResourceExt};
use kube_runtime::controller::Action;
use kube_runtime::events::{Event, EventType, Recorder, Reporter};
use log::{debug, info, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;

use crate::common::conditions::{self, Conditional, CONDITION_SYNCED};
use crate::config::OperatorConfig;
use crate::errors::*;
use crate::kube_utils::{self, ScopedApi};

const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(300);
const FINALIZE_RETRY: Duration = Duration::from_secs(5);

/// A kind the runtime can reconcile.
pub trait Object:
    ScopedApi + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Status conditions, when the kind surfaces invariant violations there.
    fn status_conditions(&self) -> Option<&[Condition]> {
        None
    }
}

macro_rules! conditional_object {
    ($($kind:ty),* $(,)?) => {
        $(
            impl Object for $kind {
                fn status_conditions(&self) -> Option<&[Condition]> {
                    Some(Conditional::conditions(self))
                }
            }
        )*
    };
}

conditional_object!(
    crate::crd::MatrixOneCluster,
    crate::crd::LogSet,
    crate::crd::DNSet,
    crate::crd::CNSet,
    crate::crd::ProxySet,
    crate::crd::WebUI,
    crate::crd::CNPool,
    crate::crd::CNClaim,
    crate::crd::CNClaimSet,
    crate::crd::BucketClaim,
    crate::crd::BackupJob,
    crate::crd::RestoreJob,
);

impl Object for k8s_openapi::api::core::v1::Pod {}

/// Business logic of one kind.
#[async_trait]
pub trait Actor<K: Object>: Send + Sync + 'static {
    /// Moves the world one step toward `ctx.obj`. `Some(d)` asks to be
    /// observed again after `d` even if nothing changes.
    async fn observe(&self, ctx: &Context<K>) -> Result<Option<Duration>>;

    /// Cleans up before deletion; `true` releases the finalizer.
    async fn finalize(&self, _ctx: &Context<K>) -> Result<bool> {
        Ok(true)
    }
}

/// Everything an actor sees during one invocation.
pub struct Context<K> {
    pub client: Client,
    pub obj: Arc<K>,
    pub config: Arc<OperatorConfig>,
    recorder: Recorder,
}

impl<K: Object> Context<K> {
    pub fn new(client: Client, obj: Arc<K>, config: Arc<OperatorConfig>, recorder: Recorder) -> Self {
        Context {
            client,
            obj,
            config,
            recorder,
        }
    }

    pub fn name(&self) -> String {
        self.obj.name_any()
    }

    /// Namespace of the object; errors for cluster-scoped kinds.
    pub fn namespace(&self) -> Result<String> {
        kube_utils::namespace_of(self.obj.as_ref())
    }

    pub fn key(&self) -> String {
        kube_utils::key_of(self.obj.as_ref())
    }

    /// Api of the object's own kind.
    pub fn self_api(&self) -> Api<K> {
        K::scoped_api(self.client.clone(), self.obj.meta().namespace.as_deref())
    }

    /// Api of another kind in the object's namespace.
    pub fn api<C: ScopedApi>(&self) -> Api<C> {
        C::scoped_api(self.client.clone(), self.obj.meta().namespace.as_deref())
    }

    pub fn api_in<C: ScopedApi>(&self, namespace: &str) -> Api<C> {
        C::scoped_api(self.client.clone(), Some(namespace))
    }

    pub async fn patch_status<S: Serialize + Send + Sync>(&self, status: &S) -> Result<K> {
        kube_utils::patch_status(&self.self_api(), self.obj.as_ref(), status).await
    }

    pub async fn normal(&self, reason: &str, note: impl Into<String>) {
        self.publish(EventType::Normal, reason, note.into()).await
    }

    pub async fn warning(&self, reason: &str, note: impl Into<String>) {
        self.publish(EventType::Warning, reason, note.into()).await
    }

    async fn publish(&self, type_: EventType, reason: &str, note: String) {
        let event = Event {
            type_,
            reason: reason.to_string(),
            note: Some(note),
            action: "Reconcile".to_string(),
            secondary: None,
        };
        if let Err(e) = self
            .recorder
            .publish(&event, &self.obj.object_ref(&()))
            .await
        {
            warn!("failed to publish event {} on {}: {}", reason, self.key(), e);
        }
    }
}

/// Shared state of one controller: the actor plus runtime bookkeeping.
pub struct Reconciler<K, A> {
    client: Client,
    actor: A,
    config: Arc<OperatorConfig>,
    recorder: Recorder,
    finalizer: Option<String>,
    failures: Mutex<HashMap<String, u32>>,
    _kind: std::marker::PhantomData<fn() -> K>,
}

/// The finalizer the runtime puts on every object of `kind`.
pub fn finalizer_for(kind: &str) -> String {
    format!("matrixorigin.io/finalizer-{}", kind.to_lowercase())
}

impl<K: Object, A: Actor<K>> Reconciler<K, A> {
    /// Reconciler guarding objects with the default finalizer of the kind.
    pub fn new(client: Client, actor: A, config: Arc<OperatorConfig>) -> Self {
        let finalizer = finalizer_for(&K::kind(&()));
        Self::build(client, actor, config, Some(finalizer))
    }

    /// Reconciler that never finalizes, for observers such as garbage collectors.
    pub fn without_finalizer(client: Client, actor: A, config: Arc<OperatorConfig>) -> Self {
        Self::build(client, actor, config, None)
    }

    pub fn with_finalizer(client: Client, actor: A, config: Arc<OperatorConfig>, finalizer: &str) -> Self {
        Self::build(client, actor, config, Some(finalizer.to_string()))
    }

    fn build(client: Client, actor: A, config: Arc<OperatorConfig>, finalizer: Option<String>) -> Self {
        let reporter = Reporter {
            controller: crate::FIELD_MANAGER.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Reconciler {
            recorder: Recorder::new(client.clone(), reporter),
            client,
            actor,
            config,
            finalizer,
            failures: Mutex::new(HashMap::new()),
            _kind: std::marker::PhantomData,
        }
    }

    fn reset_backoff(&self, key: &str) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.remove(key);
        }
    }

    fn next_backoff(&self, key: &str) -> Duration {
        let attempts = match self.failures.lock() {
            Ok(mut failures) => {
                let n = failures.entry(key.to_string()).or_insert(0);
                *n = n.saturating_add(1);
                *n
            }
            Err(_) => 1,
        };
        backoff_delay(attempts)
    }

    async fn surface_invariant(&self, obj: &K, reason: &str, message: &str) -> Result<()> {
        let Some(existing) = obj.status_conditions() else {
            return Ok(());
        };
        let mut conds = existing.to_vec();
        conditions::set(&mut conds, CONDITION_SYNCED, false, reason, message, Utc::now());
        let api = K::scoped_api(self.client.clone(), obj.meta().namespace.as_deref());
        kube_utils::patch_status(&api, obj, &json!({ "conditions": conds })).await?;
        Ok(())
    }
}

/// Delay before the `attempts`-th retry of a failing object.
pub fn backoff_delay(attempts: u32) -> Duration {
    let exp = attempts.saturating_sub(1).min(16);
    BACKOFF_BASE
        .checked_mul(1 << exp)
        .unwrap_or(BACKOFF_MAX)
        .min(BACKOFF_MAX)
}

/// One reconcile of `obj`: finalizer bookkeeping, then observe or finalize.
pub async fn reconcile<K: Object, A: Actor<K>>(
    obj: Arc<K>,
    rec: Arc<Reconciler<K, A>>,
) -> Result<Action> {
    let key = kube_utils::key_of(obj.as_ref());
    let ctx = Context::new(
        rec.client.clone(),
        obj.clone(),
        rec.config.clone(),
        rec.recorder.clone(),
    );
    let api = ctx.self_api();

    let outcome = if obj.meta().deletion_timestamp.is_some() {
        match &rec.finalizer {
            Some(f) if kube_utils::has_finalizer(obj.as_ref(), f) => {
                match rec.actor.finalize(&ctx).await {
                    Ok(true) => {
                        info!("finalized {} {}", K::kind(&()), key);
                        kube_utils::remove_finalizer(&api, obj.as_ref(), f).await?;
                        Ok(Action::await_change())
                    }
                    Ok(false) => Ok(Action::requeue(FINALIZE_RETRY)),
                    Err(e) => Err(e),
                }
            }
            _ => return Ok(Action::await_change()),
        }
    } else {
        match &rec.finalizer {
            Some(f) if !kube_utils::has_finalizer(obj.as_ref(), f) => {
                kube_utils::add_finalizer(&api, obj.as_ref(), f).await?;
                // the patch triggers a fresh event with the new resource version
                return Ok(Action::await_change());
            }
            _ => rec
                .actor
                .observe(&ctx)
                .await
                .map(|after| Action::requeue(after.unwrap_or(rec.config.resync_interval()))),
        }
    };

    match outcome {
        Ok(action) => {
            rec.reset_backoff(&key);
            Ok(action)
        }
        Err(e) => {
            if let Some(after) = e.resync_after() {
                debug!("{} {}: {}", K::kind(&()), key, e);
                rec.reset_backoff(&key);
                return Ok(Action::requeue(after));
            }
            if let Some((reason, message)) = e.as_invariant() {
                warn!("{} {} cannot converge: {}", K::kind(&()), key, e);
                rec.surface_invariant(obj.as_ref(), reason, message).await?;
                ctx.warning(reason, message).await;
                rec.reset_backoff(&key);
                return Ok(Action::await_change());
            }
            Err(e)
        }
    }
}

/// Transient failures: exponential backoff per object.
pub fn error_policy<K: Object, A: Actor<K>>(
    obj: Arc<K>,
    error: &Error,
    rec: Arc<Reconciler<K, A>>,
) -> Action {
    let key = kube_utils::key_of(obj.as_ref());
    let delay = rec.next_backoff(&key);
    warn!(
        "reconcile {} {} failed, retrying in {}s: {}",
        K::kind(&()),
        key,
        delay.as_secs(),
        error
    );
    Action::requeue(delay)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        assert_eq!(backoff_delay(1), Duration::from_secs(1));
        assert_eq!(backoff_delay(2), Duration::from_secs(2));
        assert_eq!(backoff_delay(5), Duration::from_secs(16));
        assert_eq!(backoff_delay(9), Duration::from_secs(256));
        assert_eq!(backoff_delay(10), Duration::from_secs(300));
        assert_eq!(backoff_delay(u32::MAX), Duration::from_secs(300));
    }

    #[test]
    fn test_finalizer_name() {
        assert_eq!(finalizer_for("CNClaimSet"), "matrixorigin.io/finalizer-cnclaimset");
    }
}
