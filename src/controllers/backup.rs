//! Backup and restore jobs.
//!
//! Each job runs the backup tool behind a small REST sidecar inside a
//! one-off Job. The controller polls the sidecar's `/status` until the
//! command exits, then records the outcome. A successful backup leaves a
//! cluster-scoped `Backup` describing where the data went.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{Container, EnvVar, PodSpec, PodTemplateSpec, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use kube::api::Api;
use kube::ResourceExt;
use log::{debug, info, warn};
#[cfg(test)]
use mockall::automock;
use serde::Deserialize;

use super::cluster::{CREDENTIAL_PASSWORD_KEY, CREDENTIAL_USER_KEY};
use super::workload::{self, secret_env, value_env};
use super::DEPENDENCY_RETRY;
use crate::common::conditions::{self, CONDITION_ENDED};
use crate::crd::backup::{BackupJobStatus, BackupMeta, JobPhase, RestoreJobStatus};
use crate::crd::common::{ConditionalStatus, Overlay, SharedStorageProvider};
use crate::crd::{Backup, BackupJob, CNSet, MatrixOneCluster, RestoreJob};
use crate::errors::*;
use crate::kube_utils;
use crate::probe::MAIN_CONTAINER;
use crate::runtime::{Actor, Context};

pub const META_DELIMITER: &str = "META_DELIMITER";
const META_FILE: &str = "/mo_br.meta";
const BR_BINARY: &str = "/mo_br";
const SIDECAR_BINARY: &str = "/cmdrest";
const SIDECAR_PORT: i32 = 8080;
const DEFAULT_BR_IMAGE: &str = "matrixorigin/mobr:latest";
const LABEL_JOB: &str = "matrixorigin.io/br-job";

/// What the sidecar reports about the wrapped command.
#[derive(Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CmdStatus {
    #[serde(default)]
    pub completed: bool,
    #[serde(default)]
    pub exit_code: i32,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
}

/// Client of the command sidecar.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CmdRestClient: Send + Sync {
    async fn status(&self, base_url: &str) -> Result<CmdStatus>;
}

pub struct HttpCmdRestClient {
    client: reqwest::Client,
}

impl HttpCmdRestClient {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(HttpCmdRestClient { client })
    }
}

#[async_trait]
impl CmdRestClient for HttpCmdRestClient {
    async fn status(&self, base_url: &str) -> Result<CmdStatus> {
        let url = format!("{}/status", base_url);
        let status = self
            .client
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json::<CmdStatus>()
            .await?;
        Ok(status)
    }
}

/// Extracts the backup id and the raw metadata from the tool's stdout.
///
/// The metadata follows the delimiter line; its id is the text before the
/// first comma.
pub fn parse_backup_output(stdout: &str) -> Result<(String, String)> {
    let unparseable = |why: &str| invariant("BackupOutputUnparseable", why.to_string());
    let (_, meta) = stdout
        .split_once(META_DELIMITER)
        .ok_or_else(|| unparseable("delimiter not found in output"))?;
    let raw = meta.trim();
    let (id, _) = raw
        .split_once(',')
        .ok_or_else(|| unparseable("metadata has no id"))?;
    let id = id.trim();
    if id.is_empty() {
        return Err(unparseable("empty backup id"));
    }
    Ok((id.to_string(), raw.to_string()))
}

pub fn backup_name(job: &str, id: &str) -> String {
    let prefix: String = id.chars().take(5).collect();
    format!("{}-{}", job, prefix.to_lowercase())
}

fn sidecar_url(job: &str, namespace: &str) -> String {
    format!("http://{}.{}:{}", job, namespace, SIDECAR_PORT)
}

/// Flags telling the tool where the data lives.
fn storage_args(target: &SharedStorageProvider) -> Result<String> {
    if let Some(s3) = &target.s3 {
        let (bucket, prefix) = s3.bucket_and_prefix();
        let mut args = format!(
            "--backup_dir s3 --bucket {} --filepath {}",
            bucket, prefix
        );
        if let Some(endpoint) = &s3.endpoint {
            args.push_str(&format!(" --endpoint {}", endpoint));
        }
        if let Some(region) = &s3.region {
            args.push_str(&format!(" --region {}", region));
        }
        if s3.secret_ref.is_some() {
            args.push_str(" --access_key_id ${AWS_ACCESS_KEY_ID} --secret_access_key ${AWS_SECRET_ACCESS_KEY}");
        }
        return Ok(args);
    }
    if let Some(fs) = &target.file_system {
        return Ok(format!("--backup_dir filesystem --path {}", fs.path));
    }
    Err(invariant("StorageMissing", "target must name exactly one provider"))
}

/// Backup command whose stdout ends with the metadata of the backup.
pub fn backup_command(host: &str, port: i32, target: &SharedStorageProvider) -> Result<String> {
    Ok(format!(
        "{bin} backup --host {host} --port {port} --user ${{MO_USER}} --password ${{MO_PASSWORD}} {storage} && echo {delim} && cat {meta}",
        bin = BR_BINARY,
        host = host,
        port = port,
        storage = storage_args(target)?,
        delim = META_DELIMITER,
        meta = META_FILE,
    ))
}

pub fn restore_command(backup_id: &str, target: &SharedStorageProvider) -> Result<String> {
    Ok(format!(
        "{} restore {} --meta \"${{RAW_META}}\" {}",
        BR_BINARY,
        backup_id,
        storage_args(target)?.replace("--backup_dir", "--restore_dir"),
    ))
}

/// Job and service running `command` behind the sidecar.
fn job_and_service<K>(
    owner: &K,
    namespace: &str,
    image: &str,
    command: String,
    mut env: Vec<EnvVar>,
    overlay: Option<&Overlay>,
) -> (Job, Service)
where
    K: kube::Resource<DynamicType = ()>,
{
    let name = owner.name_any();
    let labels = BTreeMap::from([(LABEL_JOB.to_string(), name.clone())]);
    let overlay = overlay.cloned().unwrap_or_default();
    env.extend(overlay.env.clone());
    let owner_ref = kube_utils::owner_ref(owner);
    let job = Job {
        metadata: workload::object_meta(&name, namespace, labels.clone(), owner_ref.clone()),
        spec: Some(JobSpec {
            backoff_limit: Some(0),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels.clone()),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    restart_policy: Some("Never".to_string()),
                    containers: vec![Container {
                        name: MAIN_CONTAINER.to_string(),
                        image: Some(image.to_string()),
                        command: Some(vec![
                            SIDECAR_BINARY.to_string(),
                            format!("--port={}", SIDECAR_PORT),
                            "--".to_string(),
                            "sh".to_string(),
                            "-c".to_string(),
                            command,
                        ]),
                        env: Some(env),
                        ports: Some(vec![workload::tcp_port("cmdrest", SIDECAR_PORT)]),
                        volume_mounts: (!overlay.volume_mounts.is_empty())
                            .then(|| overlay.volume_mounts.clone()),
                        ..Default::default()
                    }],
                    volumes: (!overlay.volumes.is_empty()).then(|| overlay.volumes.clone()),
                    tolerations: (!overlay.tolerations.is_empty()).then(|| overlay.tolerations.clone()),
                    affinity: overlay.affinity.clone(),
                    service_account_name: overlay.service_account_name.clone(),
                    image_pull_secrets: (!overlay.image_pull_secrets.is_empty())
                        .then(|| overlay.image_pull_secrets.clone()),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    };
    let svc = workload::service(
        workload::object_meta(&name, namespace, labels.clone(), owner_ref),
        &labels,
        &[("cmdrest", SIDECAR_PORT, SIDECAR_PORT)],
        None,
        None,
    );
    (job, svc)
}

/// Where a run stands after one look at its sidecar.
#[derive(Clone, Debug, PartialEq)]
pub enum Progress {
    Running,
    Succeeded(String),
    Failed(String),
}

impl From<CmdStatus> for Progress {
    fn from(s: CmdStatus) -> Self {
        match (s.completed, s.exit_code) {
            (false, _) => Progress::Running,
            (true, 0) => Progress::Succeeded(s.stdout),
            (true, code) => Progress::Failed(format!("exit code {}: {}", code, s.stderr.trim())),
        }
    }
}

/// Starts the run if needed and reports how far it got.
///
/// A run whose Job vanished after it started was cleaned up externally.
async fn drive<K: crate::runtime::Object>(
    ctx: &Context<K>,
    rest: &dyn CmdRestClient,
    phase: JobPhase,
    build: impl FnOnce() -> Result<(Job, Service)>,
) -> Result<Progress> {
    let namespace = ctx.namespace()?;
    let name = ctx.name();
    let job_api: Api<Job> = ctx.api();
    if phase == JobPhase::Pending {
        let (job, svc) = build()?;
        let svc_api: Api<Service> = ctx.api();
        kube_utils::ensure(&svc_api, &svc).await?;
        kube_utils::create_if_missing(&job_api, &job).await?;
        info!("{}: started", ctx.key());
        return Ok(Progress::Running);
    }
    if job_api.get_opt(&name).await?.is_none() {
        return Ok(Progress::Failed("job was deleted before completion".to_string()));
    }
    match rest.status(&sidecar_url(&name, &namespace)).await {
        Ok(status) => Ok(status.into()),
        Err(e) => {
            debug!("{}: sidecar not reachable yet: {}", ctx.key(), e);
            Ok(Progress::Running)
        }
    }
}

fn end(conditional: &mut ConditionalStatus, ok: bool, message: impl Into<String>) {
    conditions::set(
        &mut conditional.conditions,
        CONDITION_ENDED,
        true,
        if ok { "Completed" } else { "Failed" },
        message,
        Utc::now(),
    );
}

pub struct BackupJobActor {
    pub rest: Arc<dyn CmdRestClient>,
}

impl BackupJobActor {
    /// SQL endpoint and credential secret of the source.
    async fn resolve_source(&self, ctx: &Context<BackupJob>) -> Result<(String, i32, String, String)> {
        let source = &ctx.obj.spec.source;
        let namespace = ctx.namespace()?;
        match (&source.cluster_ref, &source.cn_set_ref) {
            (Some(cluster), None) => {
                let api: Api<MatrixOneCluster> = ctx.api();
                let mo = api
                    .get_opt(cluster)
                    .await?
                    .ok_or_else(|| resync(format!("waiting for cluster {}", cluster), DEPENDENCY_RETRY))?;
                let status = mo.status.unwrap_or_default();
                match (status.host, status.port, status.credential_ref) {
                    (Some(host), Some(port), Some(cred)) => {
                        Ok((host, port, cred.name, format!("{}/{}", namespace, cluster)))
                    }
                    _ => Err(resync(
                        format!("cluster {} has no SQL endpoint yet", cluster),
                        DEPENDENCY_RETRY,
                    )),
                }
            }
            (None, Some(cn)) => {
                let secret = source.secret_ref.clone().ok_or_else(|| {
                    invariant("SecretMissing", "source.secretRef is required for a CNSet source")
                })?;
                let api: Api<CNSet> = ctx.api();
                let cn_set = api
                    .get_opt(cn)
                    .await?
                    .ok_or_else(|| resync(format!("waiting for CNSet {}", cn), DEPENDENCY_RETRY))?;
                let status = cn_set.status.unwrap_or_default();
                match (status.host, status.port) {
                    (Some(host), Some(port)) => Ok((host, port, secret, format!("{}/{}", namespace, cn))),
                    _ => Err(resync(format!("CNSet {} has no SQL endpoint yet", cn), DEPENDENCY_RETRY)),
                }
            }
            _ => Err(invariant(
                "InvalidSource",
                "exactly one of source.clusterRef and source.cnSetRef must be set",
            )),
        }
    }
}

/// The `Backup` left behind by a successful run.
pub fn backup_record(job: &BackupJob, source_ref: &str, stdout: &str) -> Result<Backup> {
    let (id, raw) = parse_backup_output(stdout)?;
    let now = Time(Utc::now());
    let mut backup = Backup::new(
        &backup_name(&job.name_any(), &id),
        BackupMeta {
            id,
            size: None,
            at_time: Some(now.clone()),
            complete_time: Some(now),
            source_ref: source_ref.to_string(),
            location: job.spec.target.clone(),
            raw,
        },
    );
    backup.metadata.labels = Some(BTreeMap::from([(LABEL_JOB.to_string(), job.name_any())]));
    Ok(backup)
}

#[async_trait]
impl Actor<BackupJob> for BackupJobActor {
    async fn observe(&self, ctx: &Context<BackupJob>) -> Result<Option<Duration>> {
        let job = ctx.obj.as_ref();
        let mut status = job.status.clone().unwrap_or_default();
        if status.phase.is_terminal() {
            return Ok(None);
        }
        let namespace = ctx.namespace()?;
        let (host, port, secret, source_ref) = self.resolve_source(ctx).await?;
        let progress = drive(ctx, self.rest.as_ref(), status.phase, || {
            let mut env = vec![
                secret_env("MO_USER", &secret, CREDENTIAL_USER_KEY),
                secret_env("MO_PASSWORD", &secret, CREDENTIAL_PASSWORD_KEY),
            ];
            env.extend(workload::storage_env(&job.spec.target));
            Ok(job_and_service(
                job,
                &namespace,
                job.spec.image.as_deref().unwrap_or(DEFAULT_BR_IMAGE),
                backup_command(&host, port, &job.spec.target)?,
                env,
                job.spec.overlay.as_ref(),
            ))
        })
        .await?;

        let next = match progress {
            Progress::Running => {
                status.phase = JobPhase::Running;
                Some(ctx.config.backup_poll_interval())
            }
            Progress::Succeeded(stdout) => match backup_record(job, &source_ref, &stdout) {
                Ok(backup) => {
                    let api: Api<Backup> = ctx.api();
                    kube_utils::create_if_missing(&api, &backup).await?;
                    info!("{}: backup {} recorded", ctx.key(), backup.name_any());
                    ctx.normal("BackupCompleted", format!("created {}", backup.name_any())).await;
                    status.phase = JobPhase::Completed;
                    status.backup = Some(backup.name_any());
                    end(&mut status.conditional, true, format!("backup {}", backup.name_any()));
                    None
                }
                Err(e) => {
                    warn!("{}: {}", ctx.key(), e);
                    status.phase = JobPhase::Failed;
                    end(&mut status.conditional, false, e.to_string());
                    None
                }
            },
            Progress::Failed(why) => {
                warn!("{}: backup failed: {}", ctx.key(), why);
                ctx.warning("BackupFailed", why.clone()).await;
                status.phase = JobPhase::Failed;
                end(&mut status.conditional, false, why);
                None
            }
        };
        if Some(&status) != job.status.as_ref() {
            ctx.patch_status::<BackupJobStatus>(&status).await?;
        }
        Ok(next)
    }
}

pub struct RestoreJobActor {
    pub rest: Arc<dyn CmdRestClient>,
}

#[async_trait]
impl Actor<RestoreJob> for RestoreJobActor {
    async fn observe(&self, ctx: &Context<RestoreJob>) -> Result<Option<Duration>> {
        let job = ctx.obj.as_ref();
        let mut status = job.status.clone().unwrap_or_default();
        if status.phase.is_terminal() {
            return Ok(None);
        }
        let namespace = ctx.namespace()?;
        let backup_api: Api<Backup> = ctx.api();
        let backup = backup_api.get_opt(&job.spec.backup_name).await?.ok_or_else(|| {
            resync(format!("waiting for backup {}", job.spec.backup_name), DEPENDENCY_RETRY)
        })?;
        let progress = drive(ctx, self.rest.as_ref(), status.phase, || {
            let mut env = vec![value_env("RAW_META", backup.spec.raw.clone())];
            env.extend(workload::storage_env(&job.spec.target));
            Ok(job_and_service(
                job,
                &namespace,
                job.spec.image.as_deref().unwrap_or(DEFAULT_BR_IMAGE),
                restore_command(&backup.spec.id, &job.spec.target)?,
                env,
                job.spec.overlay.as_ref(),
            ))
        })
        .await?;

        let next = match progress {
            Progress::Running => {
                status.phase = JobPhase::Running;
                Some(ctx.config.backup_poll_interval())
            }
            Progress::Succeeded(_) => {
                info!("{}: restored {}", ctx.key(), backup.name_any());
                status.phase = JobPhase::Completed;
                end(&mut status.conditional, true, format!("restored {}", backup.name_any()));
                None
            }
            Progress::Failed(why) => {
                warn!("{}: restore failed: {}", ctx.key(), why);
                ctx.warning("RestoreFailed", why.clone()).await;
                status.phase = JobPhase::Failed;
                end(&mut status.conditional, false, why);
                None
            }
        };
        if Some(&status) != job.status.as_ref() {
            ctx.patch_status::<RestoreJobStatus>(&status).await?;
        }
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::backup::{BackupJobSpec, BackupSource};
    use crate::crd::common::S3Provider;

    fn s3_target() -> SharedStorageProvider {
        SharedStorageProvider {
            s3: Some(S3Provider {
                path: "test-bucket/backups".to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_output() {
        let stdout = "backup started\nbackup done\nMETA_DELIMITER\nid-abc,raw-meta-blob\n";
        let (id, raw) = parse_backup_output(stdout).unwrap();
        assert_eq!(id, "id-abc");
        assert_eq!(raw, "id-abc,raw-meta-blob");
    }

    #[test]
    fn test_parse_output_without_delimiter() {
        let err = parse_backup_output("backup done\n").unwrap_err();
        assert_eq!(err.as_invariant().map(|(r, _)| r), Some("BackupOutputUnparseable"));
        assert!(parse_backup_output("META_DELIMITER\nno-comma").is_err());
    }

    #[test]
    fn test_backup_name_takes_id_prefix() {
        assert_eq!(backup_name("nightly", "id-abc"), "nightly-id-ab");
        assert_eq!(backup_name("nightly", "abc"), "nightly-abc");
    }

    #[test]
    fn test_command_prints_metadata() {
        let cmd = backup_command("mo-tp-cn.default", 6001, &s3_target()).unwrap();
        assert!(cmd.contains("--host mo-tp-cn.default --port 6001"));
        assert!(cmd.contains("--bucket test-bucket --filepath backups"));
        assert!(cmd.ends_with("&& echo META_DELIMITER && cat /mo_br.meta"));
        assert!(backup_command("h", 1, &SharedStorageProvider::default()).is_err());
    }

    #[tokio::test]
    async fn test_successful_run_produces_backup() {
        let mut rest = MockCmdRestClient::new();
        rest.expect_status()
            .withf(|url| url == "http://nightly.default:8080")
            .times(1)
            .returning(|_| {
                Ok(CmdStatus {
                    completed: true,
                    exit_code: 0,
                    stdout: "ok\nMETA_DELIMITER\nid-abc,raw-meta-blob".to_string(),
                    stderr: String::new(),
                })
            });
        let progress: Progress = rest
            .status(&sidecar_url("nightly", "default"))
            .await
            .unwrap()
            .into();
        let Progress::Succeeded(stdout) = progress else {
            panic!("expected success, got {:?}", progress);
        };

        let job = BackupJob::new(
            "nightly",
            BackupJobSpec {
                source: BackupSource {
                    cluster_ref: Some("mo".to_string()),
                    ..Default::default()
                },
                target: s3_target(),
                ..Default::default()
            },
        );
        let backup = backup_record(&job, "default/mo", &stdout).unwrap();
        assert_eq!(backup.name_any(), "nightly-id-ab");
        assert_eq!(backup.spec.id, "id-abc");
        assert_eq!(backup.spec.raw, "id-abc,raw-meta-blob");
        assert_eq!(backup.spec.location, s3_target());
    }

    #[test]
    fn test_progress_from_status() {
        assert_eq!(Progress::from(CmdStatus::default()), Progress::Running);
        let failed = Progress::from(CmdStatus {
            completed: true,
            exit_code: 2,
            stderr: "access denied\n".to_string(),
            ..Default::default()
        });
        assert_eq!(failed, Progress::Failed("exit code 2: access denied".to_string()));
    }

    #[test]
    fn test_job_runs_command_behind_sidecar() {
        let mut job = BackupJob::new("nightly", BackupJobSpec::default());
        job.metadata.uid = Some("uid-1".to_string());
        let (j, svc) = job_and_service(&job, "default", "img", "echo hi".to_string(), vec![], None);
        let container = &j.spec.unwrap().template.spec.unwrap().containers[0];
        let command = container.command.clone().unwrap();
        assert_eq!(command[0], "/cmdrest");
        assert_eq!(command.last().map(String::as_str), Some("echo hi"));
        assert_eq!(svc.metadata.name.as_deref(), Some("nightly"));
        assert_eq!(svc.spec.unwrap().ports.unwrap()[0].port, 8080);
    }
}
