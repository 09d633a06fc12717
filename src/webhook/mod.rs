//! Admission webhook: defaulting and validation of the operator's kinds.
//!
//! Every kind gets `POST /mutate-<kind>` and `POST /validate-<kind>`.
//! Defaulting answers with a JSON patch between the submitted and the
//! defaulted object.

pub mod defaults;
pub mod quantity;
pub mod validation;

use std::net::SocketAddr;

use axum::routing::post;
use axum::{Json, Router};
use axum_server::tls_rustls::RustlsConfig;
use kube::api::DynamicObject;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation};
use kube::Resource;
use log::{debug, info, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

use self::validation::Validate;
use crate::config::OperatorConfig;
use crate::crd::{BackupJob, CNClaim, CNPool, CNSet, DNSet, LogSet, MatrixOneCluster};
use crate::errors::*;
use crate::version;

/// Kinds with admission defaults.
pub trait Defaulted {
    fn apply_defaults(&mut self);
}

impl Defaulted for LogSet {
    fn apply_defaults(&mut self) {
        defaults::log_set(&mut self.spec)
    }
}

impl Defaulted for DNSet {
    fn apply_defaults(&mut self) {
        defaults::dn_set(&mut self.spec)
    }
}

impl Defaulted for CNSet {
    fn apply_defaults(&mut self) {
        defaults::cn_set(&mut self.spec)
    }
}

impl Defaulted for CNPool {
    fn apply_defaults(&mut self) {
        defaults::cn_set(&mut self.spec.template)
    }
}

impl Defaulted for MatrixOneCluster {
    fn apply_defaults(&mut self) {
        defaults::cluster(&mut self.spec)
    }
}

fn typed<K: DeserializeOwned>(obj: &DynamicObject) -> Result<K> {
    Ok(serde_json::from_value(serde_json::to_value(obj)?)?)
}

/// Merge patch turning `before` into `after`.
fn merge_delta(before: &Value, after: &Value) -> Value {
    match (before, after) {
        (Value::Object(b), Value::Object(a)) => {
            let mut delta = Map::new();
            for (k, av) in a {
                match b.get(k) {
                    Some(bv) if bv == av => {}
                    Some(bv) => {
                        delta.insert(k.clone(), merge_delta(bv, av));
                    }
                    None => {
                        delta.insert(k.clone(), av.clone());
                    }
                }
            }
            for k in b.keys().filter(|k| !a.contains_key(*k)) {
                delta.insert(k.clone(), Value::Null);
            }
            Value::Object(delta)
        }
        _ => after.clone(),
    }
}

/// The submitted object with the defaults of `K` applied.
///
/// Defaults are computed on the typed object but laid over the raw one, so
/// fields this operator does not know about are left alone and the patch
/// applies to exactly what the API server sent.
fn defaulted<K>(raw: &Value, stamp: bool) -> Result<Value>
where
    K: Defaulted + Resource + Serialize + DeserializeOwned,
{
    let mut obj: K = serde_json::from_value(raw.clone())?;
    let before = serde_json::to_value(&obj)?;
    obj.apply_defaults();
    if stamp {
        version::stamp_operator_version(obj.meta_mut(), None);
    }
    let mut after = raw.clone();
    json_patch::merge(&mut after, &merge_delta(&before, &serde_json::to_value(&obj)?));
    Ok(after)
}

/// Response carrying the patch that applies the defaults of `K`.
///
/// Creations are also stamped with the operator version.
pub fn mutate_request<K>(req: &AdmissionRequest<DynamicObject>) -> AdmissionResponse
where
    K: Defaulted + Resource + Serialize + DeserializeOwned,
{
    let resp = AdmissionResponse::from(req);
    let Some(obj) = &req.object else {
        return resp;
    };
    let stamp = req.operation == Operation::Create;
    let diffed = serde_json::to_value(obj)
        .map_err(Error::from)
        .and_then(|raw| Ok(json_patch::diff(&raw, &defaulted::<K>(&raw, stamp)?)));
    match diffed {
        Ok(patch) => {
            debug!("defaulting {} {}: {} operations", req.kind.kind, req.name, patch.0.len());
            match resp.with_patch(patch) {
                Ok(r) => r,
                Err(e) => AdmissionResponse::from(req).deny(format!("cannot serialize patch: {}", e)),
            }
        }
        Err(e) => resp.deny(format!("cannot decode {}: {}", req.kind.kind, e)),
    }
}

/// Allows the request unless the object (against its old self) is invalid.
pub fn validate_request<K>(req: &AdmissionRequest<DynamicObject>) -> AdmissionResponse
where
    K: Validate + DeserializeOwned,
{
    let resp = AdmissionResponse::from(req);
    let Some(obj) = &req.object else {
        return resp;
    };
    let checked = typed::<K>(obj).and_then(|new| {
        let old = req.old_object.as_ref().map(typed::<K>).transpose()?;
        Ok(new.validate(old.as_ref()))
    });
    match checked {
        Ok(errs) if errs.is_empty() => resp,
        Ok(errs) => {
            info!("rejecting {} {}: {}", req.kind.kind, req.name, errs.join("; "));
            resp.deny(errs.join("; "))
        }
        Err(e) => resp.deny(format!("cannot decode {}: {}", req.kind.kind, e)),
    }
}

fn respond(
    review: AdmissionReview<DynamicObject>,
    handle: impl FnOnce(&AdmissionRequest<DynamicObject>) -> AdmissionResponse,
) -> Json<AdmissionReview<DynamicObject>> {
    let req: AdmissionRequest<DynamicObject> = match review.try_into() {
        Ok(req) => req,
        Err(e) => {
            warn!("malformed admission review: {}", e);
            return Json(AdmissionResponse::invalid(e.to_string()).into_review());
        }
    };
    Json(handle(&req).into_review())
}

async fn mutate<K>(Json(review): Json<AdmissionReview<DynamicObject>>) -> Json<AdmissionReview<DynamicObject>>
where
    K: Defaulted + Resource + Serialize + DeserializeOwned,
{
    respond(review, mutate_request::<K>)
}

async fn validate<K>(Json(review): Json<AdmissionReview<DynamicObject>>) -> Json<AdmissionReview<DynamicObject>>
where
    K: Validate + DeserializeOwned,
{
    respond(review, validate_request::<K>)
}

fn path<K: Resource<DynamicType = ()>>(verb: &str) -> String {
    format!("/{}-{}", verb, K::kind(&()).to_lowercase())
}

pub fn router() -> Router {
    Router::new()
        .route(&path::<LogSet>("mutate"), post(mutate::<LogSet>))
        .route(&path::<LogSet>("validate"), post(validate::<LogSet>))
        .route(&path::<DNSet>("mutate"), post(mutate::<DNSet>))
        .route(&path::<DNSet>("validate"), post(validate::<DNSet>))
        .route(&path::<CNSet>("mutate"), post(mutate::<CNSet>))
        .route(&path::<CNSet>("validate"), post(validate::<CNSet>))
        .route(&path::<CNPool>("mutate"), post(mutate::<CNPool>))
        .route(&path::<CNPool>("validate"), post(validate::<CNPool>))
        .route(&path::<MatrixOneCluster>("mutate"), post(mutate::<MatrixOneCluster>))
        .route(&path::<MatrixOneCluster>("validate"), post(validate::<MatrixOneCluster>))
        .route(&path::<CNClaim>("validate"), post(validate::<CNClaim>))
        .route(&path::<BackupJob>("validate"), post(validate::<BackupJob>))
}

/// Serves the webhook over TLS until the process exits.
pub async fn serve(config: &OperatorConfig) -> Result<()> {
    let dir = &config.webhook_cert_dir;
    let tls = RustlsConfig::from_pem_file(dir.join("tls.crt"), dir.join("tls.key")).await?;
    let addr = SocketAddr::from(([0, 0, 0, 0], config.webhook_port));
    info!("webhook listening on {}", addr);
    axum_server::bind_rustls(addr, tls)
        .serve(router().into_make_service())
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(kind: &str, object: Value, old: Option<Value>) -> AdmissionRequest<DynamicObject> {
        let review: AdmissionReview<DynamicObject> = serde_json::from_value(json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": {
                "uid": "3f1c",
                "kind": {"group": "core.matrixorigin.io", "version": "v1alpha1", "kind": kind},
                "resource": {"group": "core.matrixorigin.io", "version": "v1alpha1", "resource": format!("{}s", kind.to_lowercase())},
                "operation": if old.is_some() { "UPDATE" } else { "CREATE" },
                "name": "mo",
                "namespace": "default",
                "userInfo": {},
                "dryRun": false,
                "object": object,
                "oldObject": old,
            }
        }))
        .unwrap();
        review.try_into().unwrap()
    }

    fn log_set(replicas: i32, log_shards: Option<i32>) -> Value {
        json!({
            "apiVersion": "core.matrixorigin.io/v1alpha1",
            "kind": "LogSet",
            "metadata": {"name": "mo", "namespace": "default"},
            "spec": {
                "replicas": replicas,
                "image": "matrixorigin/matrixone:1.2.0",
                "volume": {"size": "10Gi"},
                "sharedStorage": {"s3": {"path": "bucket/mo"}},
                "initialConfig": {"logShards": log_shards},
            }
        })
    }

    #[test]
    fn test_defaulting_returns_patch() {
        let resp = mutate_request::<LogSet>(&request("LogSet", log_set(3, None), None));
        assert!(resp.allowed);
        let patch: Value = serde_json::from_slice(&resp.patch.unwrap()).unwrap();
        let paths: Vec<&str> = patch
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|op| op["path"].as_str())
            .collect();
        assert!(paths.iter().any(|p| p.starts_with("/spec/initialConfig")));
        assert!(paths.contains(&"/spec/storeFailureTimeout"));
    }

    fn patched(resp: &AdmissionResponse, mut object: Value) -> Value {
        let ops: json_patch::Patch = serde_json::from_slice(resp.patch.as_ref().unwrap()).unwrap();
        json_patch::patch(&mut object, &ops).unwrap();
        object
    }

    fn cn_set() -> Value {
        json!({
            "apiVersion": "core.matrixorigin.io/v1alpha1",
            "kind": "CNSet",
            "metadata": {"name": "mo", "namespace": "default"},
            "spec": {"replicas": 1, "image": "matrixorigin/matrixone:1.2.0", "futureKnob": true},
        })
    }

    #[test]
    fn test_patch_applies_to_minimal_objects() {
        let resp = mutate_request::<CNSet>(&request("CNSet", cn_set(), None));
        assert!(resp.allowed);
        let obj = patched(&resp, cn_set());
        assert_eq!(obj["spec"]["futureKnob"], json!(true));
        assert_eq!(obj["spec"]["updateStrategy"]["maxSurge"], json!(1));
        let set: CNSet = serde_json::from_value(obj).unwrap();
        assert_eq!(set.spec.service_type.as_deref(), Some("ClusterIP"));

        let resp = mutate_request::<LogSet>(&request("LogSet", log_set(3, None), None));
        let obj = patched(&resp, log_set(3, None));
        assert!(obj["spec"]["storeFailureTimeout"].is_string());
        let ls: LogSet = serde_json::from_value(obj).unwrap();
        assert!(ls.spec.initial_config.log_shards.is_some());
    }

    #[test]
    fn test_created_sets_update_config_in_place() {
        let resp = mutate_request::<CNSet>(&request("CNSet", cn_set(), None));
        let set: CNSet = serde_json::from_value(patched(&resp, cn_set())).unwrap();
        assert!(version::inplace_configmap_update(&set.metadata));

        let resp = mutate_request::<CNSet>(&request("CNSet", cn_set(), Some(cn_set())));
        let set: CNSet = serde_json::from_value(patched(&resp, cn_set())).unwrap();
        assert!(!version::inplace_configmap_update(&set.metadata));
    }

    #[test]
    fn test_validation_rejects_bootstrap_change() {
        let req = request("LogSet", log_set(3, Some(2)), Some(log_set(3, Some(1))));
        assert!(!validate_request::<LogSet>(&req).allowed);

        let same = request("LogSet", log_set(3, Some(1)), Some(log_set(3, Some(1))));
        assert!(validate_request::<LogSet>(&same).allowed);
    }

    #[test]
    fn test_routes_are_per_kind() {
        assert_eq!(path::<LogSet>("mutate"), "/mutate-logset");
        assert_eq!(path::<MatrixOneCluster>("validate"), "/validate-matrixonecluster");
    }
}
