//! Thin helpers over `kube::Api` shared by every controller.

use std::collections::BTreeMap;
use std::fmt::Debug;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ConfigMap, Pod, Secret, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, OwnerReference};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, Resource, ResourceExt};
use log::{debug, info};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};

use crate::crd::{
    Backup, BackupJob, BucketClaim, CNClaim, CNClaimSet, CNPool, CNSet, DNSet, LogSet,
    MatrixOneCluster, ProxySet, RestoreJob, WebUI,
};
use crate::errors::*;
use crate::kruise::{AdvancedStatefulSet, CloneSet};
use crate::FIELD_MANAGER;

/// Builds an `Api` for a kind regardless of its scope.
///
/// Generic code cannot call `Api::namespaced` without knowing the scope of
/// the kind at compile time, so each kind states it here once.
pub trait ScopedApi: Resource<DynamicType = ()> + Sized {
    /// `namespace` is ignored for cluster-scoped kinds; `None` lists across namespaces.
    fn scoped_api(client: Client, namespace: Option<&str>) -> Api<Self>;
}

macro_rules! namespaced {
    ($($kind:ty),* $(,)?) => {
        $(
            impl ScopedApi for $kind {
                fn scoped_api(client: Client, namespace: Option<&str>) -> Api<Self> {
                    match namespace {
                        Some(ns) => Api::namespaced(client, ns),
                        None => Api::all(client),
                    }
                }
            }
        )*
    };
}

macro_rules! cluster_scoped {
    ($($kind:ty),* $(,)?) => {
        $(
            impl ScopedApi for $kind {
                fn scoped_api(client: Client, _namespace: Option<&str>) -> Api<Self> {
                    Api::all(client)
                }
            }
        )*
    };
}

namespaced!(
    MatrixOneCluster,
    LogSet,
    DNSet,
    CNSet,
    ProxySet,
    WebUI,
    CNPool,
    CNClaim,
    CNClaimSet,
    BackupJob,
    RestoreJob,
    Pod,
    ConfigMap,
    Secret,
    Service,
    Job,
    Deployment,
    CloneSet,
    AdvancedStatefulSet,
);

cluster_scoped!(BucketClaim, Backup);

/// `<namespace>/<name>` of an object, or just the name when cluster scoped.
pub fn key_of<K: Resource>(obj: &K) -> String {
    match obj.meta().namespace.as_deref() {
        Some(ns) => format!("{}/{}", ns, obj.name_any()),
        None => obj.name_any(),
    }
}

pub fn namespace_of<K: Resource<DynamicType = ()>>(obj: &K) -> Result<String> {
    obj.meta()
        .namespace
        .clone()
        .ok_or_else(|| ErrorKind::MissingNamespace(K::kind(&()).to_string(), obj.name_any()).into())
}

/// Controller owner reference pointing at `owner`.
pub fn owner_ref<K: Resource<DynamicType = ()>>(owner: &K) -> Option<OwnerReference> {
    owner.controller_owner_ref(&())
}

/// True when every field present in `desired` has the same value in `live`.
///
/// Fields only the server fills in are ignored; arrays must match in length
/// and element-wise.
pub fn json_contains(desired: &Value, live: &Value) -> bool {
    match (desired, live) {
        (Value::Object(d), Value::Object(l)) => d.iter().all(|(k, dv)| match l.get(k) {
            Some(lv) => json_contains(dv, lv),
            None => is_empty_value(dv),
        }),
        (Value::Array(d), Value::Array(l)) => {
            d.len() == l.len() && d.iter().zip(l).all(|(dv, lv)| json_contains(dv, lv))
        }
        (Value::Array(d), Value::Null) => d.is_empty(),
        (d, l) => d == l,
    }
}

fn is_empty_value(v: &Value) -> bool {
    match v {
        Value::Null => true,
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        _ => false,
    }
}

/// Creates `desired` or, if it exists and differs, applies it server side.
///
/// Converged objects are not written.
pub async fn ensure<K>(api: &Api<K>, desired: &K) -> Result<K>
where
    K: Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned,
{
    let name = desired.name_any();
    match api.get_opt(&name).await? {
        None => {
            info!("creating {} {}", K::kind(&()), name);
            Ok(api.create(&PostParams::default(), desired).await?)
        }
        Some(live) => {
            let mut want = serde_json::to_value(desired)?;
            if let Some(obj) = want.as_object_mut() {
                obj.remove("status");
            }
            if json_contains(&want, &serde_json::to_value(&live)?) {
                return Ok(live);
            }
            debug!("updating {} {}", K::kind(&()), name);
            let pp = PatchParams::apply(FIELD_MANAGER).force();
            Ok(api.patch(&name, &pp, &Patch::Apply(desired)).await?)
        }
    }
}

/// Creates `desired` unless an object of that name already exists.
pub async fn create_if_missing<K>(api: &Api<K>, desired: &K) -> Result<K>
where
    K: Resource + Clone + Debug + Serialize + DeserializeOwned,
{
    match api.get_opt(&desired.name_any()).await? {
        Some(live) => Ok(live),
        None => match api.create(&PostParams::default(), desired).await {
            Ok(created) => Ok(created),
            Err(kube::Error::Api(e)) if e.code == 409 => {
                Ok(api.get(&desired.name_any()).await?)
            }
            Err(e) => Err(e.into()),
        },
    }
}

/// Deletes an object, returning true once it is gone.
pub async fn delete_if_exists<K>(api: &Api<K>, name: &str) -> Result<bool>
where
    K: Resource + Clone + Debug + DeserializeOwned,
{
    match api.get_opt(name).await? {
        None => Ok(true),
        Some(obj) if obj.meta().deletion_timestamp.is_some() => Ok(false),
        Some(_) => match api.delete(name, &DeleteParams::background()).await {
            Ok(_) => Ok(false),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(true),
            Err(e) => Err(e.into()),
        },
    }
}

pub async fn list_labeled<K>(api: &Api<K>, labels: &BTreeMap<String, String>) -> Result<Vec<K>>
where
    K: Resource + Clone + Debug + DeserializeOwned,
{
    let lp = ListParams::default().labels(&crate::common::selector_string(labels));
    Ok(api.list(&lp).await?.items)
}

/// Merge patch guarded by the object's resource version.
///
/// Fails with a conflict if the object changed since it was read, which
/// makes the patch a compare-and-swap on everything it touches.
pub async fn cas_merge<K>(api: &Api<K>, obj: &K, mut patch: Value) -> Result<K>
where
    K: Resource + Clone + Debug + DeserializeOwned,
{
    if let Some(rv) = obj.resource_version() {
        patch["metadata"]["resourceVersion"] = json!(rv);
    }
    Ok(api
        .patch(&obj.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
        .await?)
}

/// Status merge patch carrying the resource version `obj` was read at.
pub fn status_patch<K: Resource, S: Serialize>(obj: &K, status: &S) -> Result<Value> {
    let mut patch = json!({ "status": serde_json::to_value(status)? });
    if let Some(rv) = obj.resource_version() {
        patch["metadata"] = json!({ "resourceVersion": rv });
    }
    Ok(patch)
}

/// Merge patch of the status subresource, guarded like `cas_merge`.
///
/// A status computed from a stale read conflicts instead of overwriting
/// what another writer recorded in between.
pub async fn patch_status<K, S>(api: &Api<K>, obj: &K, status: &S) -> Result<K>
where
    K: Resource + Clone + Debug + DeserializeOwned,
    S: Serialize,
{
    let patch = status_patch(obj, status)?;
    Ok(api
        .patch_status(&obj.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
        .await?)
}

/// Label/annotation edits on an object, guarded by its resource version.
pub async fn cas_metadata<K>(
    api: &Api<K>,
    obj: &K,
    labels: BTreeMap<String, Option<String>>,
    annotations: BTreeMap<String, Option<String>>,
) -> Result<K>
where
    K: Resource + Clone + Debug + DeserializeOwned,
{
    let mut meta = json!({});
    if !labels.is_empty() {
        meta["labels"] = json!(labels);
    }
    if !annotations.is_empty() {
        meta["annotations"] = json!(annotations);
    }
    cas_merge(api, obj, json!({ "metadata": meta })).await
}

pub fn has_finalizer<K: Resource>(obj: &K, finalizer: &str) -> bool {
    obj.finalizers().iter().any(|f| f == finalizer)
}

pub async fn add_finalizer<K>(api: &Api<K>, obj: &K, finalizer: &str) -> Result<K>
where
    K: Resource + Clone + Debug + DeserializeOwned,
{
    let mut finalizers = obj.finalizers().to_vec();
    finalizers.push(finalizer.to_string());
    cas_merge(api, obj, json!({ "metadata": { "finalizers": finalizers } })).await
}

pub async fn remove_finalizer<K>(api: &Api<K>, obj: &K, finalizer: &str) -> Result<K>
where
    K: Resource + Clone + Debug + DeserializeOwned,
{
    let finalizers: Vec<&String> = obj.finalizers().iter().filter(|f| *f != finalizer).collect();
    cas_merge(api, obj, json!({ "metadata": { "finalizers": finalizers } })).await
}

/// Evaluates a label selector against a label set.
pub fn selector_matches(selector: &LabelSelector, labels: &BTreeMap<String, String>) -> bool {
    let by_labels = selector
        .match_labels
        .iter()
        .flatten()
        .all(|(k, v)| labels.get(k) == Some(v));
    let by_exprs = selector.match_expressions.iter().flatten().all(|e| {
        let values = e.values.as_deref().unwrap_or_default();
        match e.operator.as_str() {
            "In" => labels.get(&e.key).map_or(false, |v| values.contains(v)),
            "NotIn" => labels.get(&e.key).map_or(true, |v| !values.contains(v)),
            "Exists" => labels.contains_key(&e.key),
            "DoesNotExist" => !labels.contains_key(&e.key),
            _ => false,
        }
    });
    by_labels && by_exprs
}

/// `key=value` selector string of the `matchLabels` part only.
pub fn match_labels_string(selector: &LabelSelector) -> String {
    selector
        .match_labels
        .as_ref()
        .map(crate::common::selector_string)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelectorRequirement;

    #[test]
    fn test_json_contains_ignores_server_fields() {
        let desired = json!({"spec": {"replicas": 3, "template": {"containers": [{"name": "main"}]}}});
        let live = json!({
            "metadata": {"uid": "x"},
            "spec": {"replicas": 3, "template": {"containers": [{"name": "main", "terminationMessagePath": "/dev"}]}},
        });
        assert!(json_contains(&desired, &live));

        let scaled = json!({"spec": {"replicas": 4}});
        assert!(!json_contains(&scaled, &live));

        let more = json!({"spec": {"template": {"containers": [{"name": "main"}, {"name": "side"}]}}});
        assert!(!json_contains(&more, &live));
    }

    #[test]
    fn test_status_patch_carries_read_version() {
        use crate::crd::cnclaim::{CNClaimPhase, CNClaimSpec};
        use crate::crd::CNClaim;

        let mut claim = CNClaim::new("claim-a", CNClaimSpec::default());
        claim.metadata.resource_version = Some("41".to_string());
        let patch = status_patch(&claim, &json!({ "phase": CNClaimPhase::Bound })).unwrap();
        assert_eq!(patch["metadata"]["resourceVersion"], json!("41"));
        assert_eq!(patch["status"]["phase"], json!("Bound"));

        claim.metadata.resource_version = None;
        let patch = status_patch(&claim, &json!({})).unwrap();
        assert!(patch.get("metadata").is_none());
    }

    #[test]
    fn test_json_contains_treats_missing_as_empty() {
        assert!(json_contains(&json!({"a": []}), &json!({})));
        assert!(json_contains(&json!({"a": null}), &json!({})));
        assert!(!json_contains(&json!({"a": 0}), &json!({})));
    }

    #[test]
    fn test_selector_matches() {
        let labels = BTreeMap::from([
            ("tenant".to_string(), "a".to_string()),
            ("tier".to_string(), "gold".to_string()),
        ]);
        let sel = LabelSelector {
            match_labels: Some(BTreeMap::from([("tenant".to_string(), "a".to_string())])),
            match_expressions: Some(vec![LabelSelectorRequirement {
                key: "tier".to_string(),
                operator: "In".to_string(),
                values: Some(vec!["gold".to_string(), "silver".to_string()]),
            }]),
        };
        assert!(selector_matches(&sel, &labels));

        let sel = LabelSelector {
            match_expressions: Some(vec![LabelSelectorRequirement {
                key: "tier".to_string(),
                operator: "DoesNotExist".to_string(),
                values: None,
            }]),
            ..Default::default()
        };
        assert!(!selector_matches(&sel, &labels));
        assert!(selector_matches(&LabelSelector::default(), &labels));
    }
}
