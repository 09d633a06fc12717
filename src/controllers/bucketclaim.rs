//! Shared object-storage claims and the reclamation of their data.
//!
//! A LogSet acquires the claim of its bucket while it lives and releases it
//! on deletion. With the `Delete` retention policy the claim is then deleted,
//! and its data finalizer runs a one-shot job wiping the bucket prefix.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, EnvVar, PodSpec, PodTemplateSpec, Volume,
    VolumeMount,
};
use kube::api::{Api, DeleteParams, PostParams};
use kube::{Client, ResourceExt};
use log::{info, warn};
use serde_json::json;

use super::workload::{self, value_env};
use crate::common::conditions::{self, CONDITION_RECYCLABLE};
use crate::config::OperatorConfig;
use crate::common::hashing::fnv32a;
use crate::common::{
    identity, ANN_ANY_INSTANCE_RUNNING, FINALIZER_BUCKET_COMPONENT_PREFIX, FINALIZER_BUCKET_DATA,
    LABEL_BUCKET_UNIQUE_ID,
};
use crate::crd::bucketclaim::{BucketClaimSpec, BucketClaimStatus, BucketState};
use crate::crd::common::{RetentionPolicy, S3Provider};
use crate::crd::BucketClaim;
use crate::errors::*;
use crate::kube_utils::{self, ScopedApi};
use crate::runtime::{Actor, Context, Reconciler};

const CLEANUP_IMAGE: &str = "amazon/aws-cli:2.15.0";
const CLEANUP_PATH: &str = "/etc/cleanup";
const CLEANUP_SCRIPT: &str = "cleanup.sh";
const CLEANUP_RETRY: Duration = Duration::from_secs(60);
const DELETING_RETRY: Duration = Duration::from_secs(30);
const FALLBACK_NAMESPACE: &str = "default";

pub fn unique_id_of(s3: &S3Provider) -> String {
    identity::bucket_unique_id(s3.provider_type().as_str(), s3.endpoint(), &s3.path)
}

pub fn claim_name(unique_id: &str) -> String {
    format!("bucket-{}", &unique_id[..unique_id.len().min(16)])
}

/// Finalizer a component puts on the claim while its pods may write to the bucket.
pub fn component_finalizer(component: &str, owner_key: &str) -> String {
    format!(
        "{}{}-{:08x}",
        FINALIZER_BUCKET_COMPONENT_PREFIX,
        component,
        fnv32a(owner_key.as_bytes())
    )
}

fn is_component_finalizer(f: &str) -> bool {
    f.starts_with(FINALIZER_BUCKET_COMPONENT_PREFIX) && f != FINALIZER_BUCKET_DATA
}

/// Claims are guarded by the data finalizer, which is released once the
/// bucket is reclaimed.
pub fn reconciler(client: Client, config: Arc<OperatorConfig>) -> Reconciler<BucketClaim, BucketClaimActor> {
    Reconciler::with_finalizer(client, BucketClaimActor, config, FINALIZER_BUCKET_DATA)
}

pub async fn find_claim(client: &Client, s3: &S3Provider) -> Result<Option<BucketClaim>> {
    let api = BucketClaim::scoped_api(client.clone(), None);
    let labels = BTreeMap::from([(LABEL_BUCKET_UNIQUE_ID.to_string(), unique_id_of(s3))]);
    Ok(kube_utils::list_labeled(&api, &labels).await?.into_iter().next())
}

/// Whether `owner` may take the claim; `Ok(false)` when it already holds it.
pub fn plan_acquire(claim: &BucketClaim, owner: &str) -> Result<bool> {
    match (claim.state(), claim.bind_to()) {
        (Some(BucketState::InUse), Some(b)) if b == owner => Ok(false),
        (Some(BucketState::InUse), Some(b)) => Err(invariant(
            "BucketInUse",
            format!("bucket {} is in use by {}", claim.name_any(), b),
        )),
        (Some(BucketState::Deleting), _) => Err(resync(
            format!("bucket {} is being reclaimed", claim.name_any()),
            DELETING_RETRY,
        )),
        _ => Ok(true),
    }
}

/// Binds the claim of `s3` to `owner`, creating the claim on first use.
pub async fn acquire(
    client: &Client,
    s3: &S3Provider,
    owner: &str,
    template: Option<PodTemplateSpec>,
) -> Result<BucketClaim> {
    let api = BucketClaim::scoped_api(client.clone(), None);
    let claim = match find_claim(client, s3).await? {
        Some(c) => c,
        None => {
            let uid = unique_id_of(s3);
            let mut claim = BucketClaim::new(
                &claim_name(&uid),
                BucketClaimSpec {
                    s3: s3.clone(),
                    log_set_template: template,
                },
            );
            claim.metadata.labels = Some(BTreeMap::from([(LABEL_BUCKET_UNIQUE_ID.to_string(), uid)]));
            info!("creating bucket claim {} for {}", claim.name_any(), owner);
            kube_utils::create_if_missing(&api, &claim).await?
        }
    };
    if !plan_acquire(&claim, owner)? {
        return Ok(claim);
    }
    info!("binding bucket claim {} to {}", claim.name_any(), owner);
    let status = BucketClaimStatus {
        state: Some(BucketState::InUse),
        bind_to: Some(owner.to_string()),
        ..claim.status.clone().unwrap_or_default()
    };
    kube_utils::patch_status(&api, &claim, &status).await
}

/// Gives the claim up when its owner goes away.
pub async fn release(client: &Client, claim: &BucketClaim, owner: &str) -> Result<()> {
    if claim.bind_to() != Some(owner) {
        return Ok(());
    }
    let api = BucketClaim::scoped_api(client.clone(), None);
    let name = claim.name_any();
    match claim.spec.retention_policy() {
        RetentionPolicy::Retain => {
            info!("releasing bucket claim {}", name);
            kube_utils::patch_status(
                &api,
                claim,
                &json!({ "state": BucketState::Released, "bindTo": null }),
            )
            .await?;
        }
        RetentionPolicy::Delete => {
            if claim.state() != Some(BucketState::Deleting) {
                info!("bucket claim {} will be reclaimed", name);
                kube_utils::patch_status(&api, claim, &json!({ "state": BucketState::Deleting }))
                    .await?;
            }
            if claim.metadata.deletion_timestamp.is_none() {
                match api.delete(&name, &DeleteParams::background()).await {
                    Ok(_) => {}
                    Err(kube::Error::Api(e)) if e.code == 404 => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }
    }
    Ok(())
}

/// Records that a pod ran against the bucket, so data may exist.
pub async fn mark_instance_running(client: &Client, claim: &BucketClaim) -> Result<()> {
    if claim.annotations().get(ANN_ANY_INSTANCE_RUNNING).map(String::as_str) == Some("true") {
        return Ok(());
    }
    let api = BucketClaim::scoped_api(client.clone(), None);
    kube_utils::cas_metadata(
        &api,
        claim,
        BTreeMap::new(),
        BTreeMap::from([(ANN_ANY_INSTANCE_RUNNING.to_string(), Some("true".to_string()))]),
    )
    .await?;
    Ok(())
}

pub async fn add_component_finalizer(client: &Client, claim: &BucketClaim, finalizer: &str) -> Result<()> {
    if kube_utils::has_finalizer(claim, finalizer) || claim.metadata.deletion_timestamp.is_some() {
        return Ok(());
    }
    let api = BucketClaim::scoped_api(client.clone(), None);
    kube_utils::add_finalizer(&api, claim, finalizer).await?;
    Ok(())
}

pub async fn remove_component_finalizer(client: &Client, s3: &S3Provider, finalizer: &str) -> Result<()> {
    let Some(claim) = find_claim(client, s3).await? else {
        return Ok(());
    };
    if !kube_utils::has_finalizer(&claim, finalizer) {
        return Ok(());
    }
    let api = BucketClaim::scoped_api(client.clone(), None);
    kube_utils::remove_finalizer(&api, &claim, finalizer).await?;
    Ok(())
}

/// What deleting a claim requires right now.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Reclaim {
    /// An owner still uses the bucket; deletion is refused.
    InUse,
    /// Components still hold the bucket.
    WaitComponents(Vec<String>),
    /// Nothing to wipe: the data is retained or was never written.
    Release,
    /// Run the cleanup job before releasing.
    Cleanup,
}

pub fn plan_reclaim(claim: &BucketClaim) -> Reclaim {
    if claim.state() == Some(BucketState::InUse) {
        return Reclaim::InUse;
    }
    let holders: Vec<String> = claim
        .finalizers()
        .iter()
        .filter(|f| is_component_finalizer(f))
        .cloned()
        .collect();
    if !holders.is_empty() {
        return Reclaim::WaitComponents(holders);
    }
    if claim.spec.retention_policy() == RetentionPolicy::Retain {
        return Reclaim::Release;
    }
    match claim.annotations().get(ANN_ANY_INSTANCE_RUNNING) {
        Some(v) if v == "true" => Reclaim::Cleanup,
        _ => Reclaim::Release,
    }
}

/// Script wiping the bucket prefix, after checking the bucket is reachable.
pub fn cleanup_script(s3: &S3Provider) -> String {
    let (bucket, prefix) = s3.bucket_and_prefix();
    let endpoint = match s3.endpoint() {
        "" => String::new(),
        e => format!(" --endpoint-url {}", e),
    };
    let target = if prefix.is_empty() {
        format!("s3://{}", bucket)
    } else {
        format!("s3://{}/{}", bucket, prefix)
    };
    format!(
        "#!/bin/sh\nset -eu\n\naws s3api head-bucket --bucket {bucket}{endpoint}\naws s3 rm {target} --recursive{endpoint}\n",
        bucket = bucket,
        target = target,
        endpoint = endpoint,
    )
}

fn cleanup_env(s3: &S3Provider) -> Vec<EnvVar> {
    let mut env: Vec<EnvVar> = s3
        .secret_ref
        .as_ref()
        .map(|secret| {
            vec![
                workload::secret_env("AWS_ACCESS_KEY_ID", &secret.name, "AWS_ACCESS_KEY_ID"),
                workload::secret_env("AWS_SECRET_ACCESS_KEY", &secret.name, "AWS_SECRET_ACCESS_KEY"),
            ]
        })
        .unwrap_or_default();
    if let Some(region) = &s3.region {
        env.push(value_env("AWS_DEFAULT_REGION", region.clone()));
    }
    env
}

fn cleanup_job(claim: &BucketClaim, name: &str, namespace: &str) -> Job {
    let template = claim.spec.log_set_template.clone().unwrap_or_default();
    let base = template
        .spec
        .as_ref()
        .and_then(|s| s.containers.first())
        .cloned()
        .unwrap_or_default();
    let container = Container {
        name: "cleanup".to_string(),
        image: Some(CLEANUP_IMAGE.to_string()),
        command: Some(vec![
            "/bin/sh".to_string(),
            format!("{}/{}", CLEANUP_PATH, CLEANUP_SCRIPT),
        ]),
        env: Some(cleanup_env(&claim.spec.s3)),
        resources: base.resources,
        volume_mounts: Some(vec![VolumeMount {
            name: "cleanup".to_string(),
            mount_path: CLEANUP_PATH.to_string(),
            ..Default::default()
        }]),
        ..Default::default()
    };
    let spec = template.spec.unwrap_or_default();
    Job {
        metadata: workload::object_meta(
            name,
            namespace,
            BTreeMap::new(),
            kube_utils::owner_ref(claim),
        ),
        spec: Some(JobSpec {
            backoff_limit: Some(3),
            template: PodTemplateSpec {
                metadata: None,
                spec: Some(PodSpec {
                    containers: vec![container],
                    restart_policy: Some("Never".to_string()),
                    volumes: Some(vec![Volume {
                        name: "cleanup".to_string(),
                        config_map: Some(ConfigMapVolumeSource {
                            name: name.to_string(),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }]),
                    node_selector: spec.node_selector,
                    tolerations: spec.tolerations,
                    service_account_name: spec.service_account_name,
                    image_pull_secrets: spec.image_pull_secrets,
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn job_failed(job: &Job) -> bool {
    job.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map_or(false, |cs| cs.iter().any(|c| c.type_ == "Failed" && c.status == "True"))
}

fn job_succeeded(job: &Job) -> bool {
    job.status
        .as_ref()
        .and_then(|s| s.succeeded)
        .map_or(false, |n| n > 0)
}

pub struct BucketClaimActor;

impl BucketClaimActor {
    async fn set_recyclable(&self, ctx: &Context<BucketClaim>, ok: bool, reason: &str, msg: &str) -> Result<()> {
        let mut conds = ctx
            .obj
            .status
            .as_ref()
            .map(|s| s.conditional.conditions.clone())
            .unwrap_or_default();
        conditions::set(&mut conds, CONDITION_RECYCLABLE, ok, reason, msg, Utc::now());
        ctx.patch_status(&json!({ "conditions": conds })).await?;
        Ok(())
    }

    async fn run_cleanup(&self, ctx: &Context<BucketClaim>) -> Result<bool> {
        let claim = ctx.obj.as_ref();
        let name = format!("{}-cleanup", claim.name_any());
        let namespace = claim
            .bind_to()
            .and_then(|b| b.split_once('/'))
            .map(|(ns, _)| ns.to_string())
            .unwrap_or_else(|| FALLBACK_NAMESPACE.to_string());

        let cm_api: Api<ConfigMap> = ctx.api_in(&namespace);
        let cm = workload::config_map(
            workload::object_meta(&name, &namespace, BTreeMap::new(), kube_utils::owner_ref(claim)),
            BTreeMap::from([(CLEANUP_SCRIPT.to_string(), cleanup_script(&claim.spec.s3))]),
        );
        kube_utils::ensure(&cm_api, &cm).await?;

        let job_api: Api<Job> = ctx.api_in(&namespace);
        let job = match job_api.get_opt(&name).await? {
            Some(j) => j,
            None => {
                info!("starting bucket cleanup {}/{}", namespace, name);
                job_api
                    .create(&PostParams::default(), &cleanup_job(claim, &name, &namespace))
                    .await?
            }
        };
        if job_succeeded(&job) {
            info!("bucket {} reclaimed", claim.spec.s3.path);
            return Ok(true);
        }
        if job_failed(&job) {
            warn!("bucket cleanup {}/{} failed", namespace, name);
            ctx.warning(
                "BucketCleanupFailed",
                format!("cleanup job {}/{} failed, inspect its logs", namespace, name),
            )
            .await;
            return Err(resync("bucket cleanup failed", CLEANUP_RETRY));
        }
        Ok(false)
    }
}

#[async_trait]
impl Actor<BucketClaim> for BucketClaimActor {
    async fn observe(&self, ctx: &Context<BucketClaim>) -> Result<Option<Duration>> {
        let in_use = ctx.obj.state() == Some(BucketState::InUse);
        let conds = ctx
            .obj
            .status
            .as_ref()
            .map(|s| s.conditional.conditions.as_slice())
            .unwrap_or_default();
        let recyclable = conditions::is_true(conds, CONDITION_RECYCLABLE);
        if conditions::find(conds, CONDITION_RECYCLABLE).is_none() || recyclable == in_use {
            let (reason, msg) = if in_use {
                ("InUse", "bucket is bound to a LogSet")
            } else {
                ("Unbound", "")
            };
            self.set_recyclable(ctx, !in_use, reason, msg).await?;
        }
        Ok(None)
    }

    async fn finalize(&self, ctx: &Context<BucketClaim>) -> Result<bool> {
        match plan_reclaim(&ctx.obj) {
            Reclaim::InUse => {
                self.set_recyclable(
                    ctx,
                    false,
                    "InUse",
                    "an InUse bucket claim cannot be deleted; delete its LogSet first",
                )
                .await?;
                Ok(false)
            }
            Reclaim::WaitComponents(_) => Ok(false),
            Reclaim::Release => Ok(true),
            Reclaim::Cleanup => self.run_cleanup(ctx).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::bucketclaim::BucketClaimStatus;

    fn claim(state: Option<BucketState>, bind_to: Option<&str>) -> BucketClaim {
        let s3 = S3Provider {
            path: "test-bucket/mo".to_string(),
            ..Default::default()
        };
        let mut c = BucketClaim::new(
            &claim_name(&unique_id_of(&s3)),
            BucketClaimSpec {
                s3,
                log_set_template: None,
            },
        );
        c.status = Some(BucketClaimStatus {
            state,
            bind_to: bind_to.map(str::to_string),
            ..Default::default()
        });
        c
    }

    #[test]
    fn test_acquire_rules() {
        assert!(plan_acquire(&claim(None, None), "default/test").unwrap());
        assert!(plan_acquire(&claim(Some(BucketState::Released), None), "default/test").unwrap());
        assert!(!plan_acquire(&claim(Some(BucketState::InUse), Some("default/test")), "default/test").unwrap());

        let err = plan_acquire(&claim(Some(BucketState::InUse), Some("other/log")), "default/test").unwrap_err();
        assert_eq!(err.as_invariant().map(|(r, _)| r), Some("BucketInUse"));

        let err = plan_acquire(&claim(Some(BucketState::Deleting), None), "default/test").unwrap_err();
        assert!(err.resync_after().is_some());
    }

    #[test]
    fn test_reclamation_of_deleted_logset_bucket() {
        let mut c = claim(Some(BucketState::Deleting), Some("default/test"));
        assert_eq!(plan_reclaim(&c), Reclaim::Release);

        c.metadata.annotations = Some(BTreeMap::from([(
            ANN_ANY_INSTANCE_RUNNING.to_string(),
            "true".to_string(),
        )]));
        assert_eq!(plan_reclaim(&c), Reclaim::Cleanup);

        let script = cleanup_script(&c.spec.s3);
        assert!(script.contains("aws s3api head-bucket --bucket test-bucket"));
        assert!(script.contains("aws s3 rm s3://test-bucket/mo --recursive"));
        let head = script.find("head-bucket").unwrap();
        let rm = script.find("s3 rm").unwrap();
        assert!(head < rm);
    }

    #[test]
    fn test_in_use_and_held_claims_are_not_reclaimed() {
        let c = claim(Some(BucketState::InUse), Some("default/test"));
        assert_eq!(plan_reclaim(&c), Reclaim::InUse);

        let mut c = claim(Some(BucketState::Deleting), Some("default/test"));
        let cn = component_finalizer("CN", "default/test-tp");
        c.metadata.finalizers = Some(vec![FINALIZER_BUCKET_DATA.to_string(), cn.clone()]);
        assert_eq!(plan_reclaim(&c), Reclaim::WaitComponents(vec![cn]));
    }

    #[test]
    fn test_data_finalizer_does_not_hold_bucket() {
        let mut c = claim(Some(BucketState::Deleting), None);
        c.metadata.finalizers = Some(vec![FINALIZER_BUCKET_DATA.to_string()]);
        c.metadata.annotations = Some(BTreeMap::from([(
            ANN_ANY_INSTANCE_RUNNING.to_string(),
            "true".to_string(),
        )]));
        assert_eq!(plan_reclaim(&c), Reclaim::Cleanup);
    }

    #[test]
    fn test_retained_bucket_is_released_without_cleanup() {
        let mut c = claim(Some(BucketState::Released), None);
        c.spec.s3.s3_retention_policy = Some(RetentionPolicy::Retain);
        c.metadata.annotations = Some(BTreeMap::from([(
            ANN_ANY_INSTANCE_RUNNING.to_string(),
            "true".to_string(),
        )]));
        assert_eq!(plan_reclaim(&c), Reclaim::Release);
    }

    #[test]
    fn test_cleanup_script_with_endpoint() {
        let s3 = S3Provider {
            path: "b".to_string(),
            endpoint: Some("http://minio:9000".to_string()),
            ..Default::default()
        };
        let script = cleanup_script(&s3);
        assert!(script.contains("aws s3 rm s3://b --recursive --endpoint-url http://minio:9000"));
    }

    #[test]
    fn test_component_finalizer_is_bounded() {
        let f = component_finalizer("DN", "a-very-long-namespace/with-a-very-long-dnset-name");
        assert!(f.starts_with("matrixorigin.io/DN-"));
        assert_eq!(f.len(), "matrixorigin.io/DN-".len() + 8);
        assert!(is_component_finalizer(&f));
        assert!(!is_component_finalizer(FINALIZER_BUCKET_DATA));
    }
}
