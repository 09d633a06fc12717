//! Builders for the pods, services and config every set renders.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    ConfigMap, Container, ContainerPort, EnvVar, EnvVarSource, ObjectFieldSelector, PodSpec,
    PodTemplateSpec, SecretKeySelector, Service, ServicePort, ServiceSpec,
    TopologySpreadConstraint, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use toml::Value;

use crate::common::{CONFIG_PATH, CONFIG_VOLUME, DATA_PATH, DATA_VOLUME, METRIC_PORT};
use crate::configmap;
use crate::crd::common::{PodSet, SharedStorageCache, SharedStorageProvider};
use crate::errors::*;
use crate::probe::MAIN_CONTAINER;
use crate::tomlconfig::TomlConfig;

pub const COMPONENT_LOGSET: &str = "LogSet";
pub const COMPONENT_DNSET: &str = "DNSet";
pub const COMPONENT_CNSET: &str = "CNSet";
pub const COMPONENT_PROXYSET: &str = "ProxySet";
pub const COMPONENT_WEBUI: &str = "WebUI";

pub const HEADLESS_SERVICE_ENV: &str = "HEADLESS_SERVICE";

/// Placeholders the start script replaces with per-pod values.
pub const UUID_PLACEHOLDER: &str = "__UUID__";
pub const ADDR_PLACEHOLDER: &str = "__ADDR__";

const DNS_WAIT_ATTEMPTS: u32 = 30;

pub fn image_of(pod_set: &PodSet) -> Result<String> {
    pod_set
        .image
        .clone()
        .filter(|i| !i.is_empty())
        .ok_or_else(|| invariant("ImageMissing", "spec.image is not set"))
}

pub fn object_meta(
    name: &str,
    namespace: &str,
    labels: BTreeMap<String, String>,
    owner: Option<OwnerReference>,
) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        labels: Some(labels),
        owner_references: owner.map(|o| vec![o]),
        ..Default::default()
    }
}

pub fn selector(labels: &BTreeMap<String, String>) -> LabelSelector {
    LabelSelector {
        match_labels: Some(labels.clone()),
        ..Default::default()
    }
}

fn field_env(name: &str, path: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: path.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn value_env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        ..Default::default()
    }
}

pub fn secret_env(name: &str, secret: &str, key: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: secret.to_string(),
                key: key.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn tcp_port(name: &str, port: i32) -> ContainerPort {
    ContainerPort {
        name: Some(name.to_string()),
        container_port: port,
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }
}

/// The pieces of a pod template that differ between components.
pub struct PodParts<'a> {
    pub labels: BTreeMap<String, String>,
    pub pod_set: &'a PodSet,
    pub headless_service: Option<String>,
    pub ports: Vec<ContainerPort>,
    pub env: Vec<EnvVar>,
    pub mounts: Vec<VolumeMount>,
    pub volumes: Vec<k8s_openapi::api::core::v1::Volume>,
    pub readiness_gates: Vec<String>,
}

/// Main container running the start script from the mounted config map.
pub fn pod_template(parts: PodParts<'_>) -> Result<PodTemplateSpec> {
    let pod_set = parts.pod_set;
    let overlay = pod_set.overlay.clone().unwrap_or_default();

    let mut env = vec![
        field_env("POD_NAME", "metadata.name"),
        field_env("NAMESPACE", "metadata.namespace"),
        field_env("POD_IP", "status.podIP"),
        configmap::suffix_env(),
    ];
    if let Some(headless) = &parts.headless_service {
        env.push(value_env(HEADLESS_SERVICE_ENV, headless.clone()));
    }
    env.extend(parts.env);
    env.extend(overlay.env.iter().cloned());

    let mut mounts = vec![VolumeMount {
        name: CONFIG_VOLUME.to_string(),
        mount_path: CONFIG_PATH.to_string(),
        read_only: Some(true),
        ..Default::default()
    }];
    mounts.extend(parts.mounts);
    mounts.extend(overlay.volume_mounts.iter().cloned());

    let mut ports = parts.ports;
    ports.push(tcp_port("metric", METRIC_PORT));

    let main = Container {
        name: MAIN_CONTAINER.to_string(),
        image: Some(image_of(pod_set)?),
        image_pull_policy: pod_set.image_pull_policy.clone(),
        command: Some(entrypoint_command()),
        env: Some(env),
        ports: Some(ports),
        resources: pod_set.resources.clone(),
        volume_mounts: Some(mounts),
        ..Default::default()
    };

    let mut volumes = parts.volumes;
    volumes.extend(overlay.volumes.iter().cloned());

    let mut labels = parts.labels.clone();
    labels.extend(overlay.pod_labels.clone());

    let mut annotations = overlay.pod_annotations.clone();
    if pod_set.export_to_prometheus.unwrap_or(false) {
        annotations.insert("prometheus.io/scrape".to_string(), "true".to_string());
        annotations.insert("prometheus.io/port".to_string(), METRIC_PORT.to_string());
        annotations.insert("prometheus.io/path".to_string(), "/metrics".to_string());
    }

    let readiness_gates = (!parts.readiness_gates.is_empty()).then(|| {
        parts
            .readiness_gates
            .iter()
            .map(|g| k8s_openapi::api::core::v1::PodReadinessGate {
                condition_type: g.clone(),
            })
            .collect()
    });

    Ok(PodTemplateSpec {
        metadata: Some(ObjectMeta {
            labels: Some(labels),
            annotations: Some(annotations),
            ..Default::default()
        }),
        spec: Some(PodSpec {
            containers: vec![main],
            volumes: Some(volumes),
            readiness_gates,
            node_selector: pod_set.node_selector.clone(),
            tolerations: (!overlay.tolerations.is_empty()).then(|| overlay.tolerations.clone()),
            affinity: overlay.affinity.clone(),
            service_account_name: overlay.service_account_name.clone(),
            image_pull_secrets: (!overlay.image_pull_secrets.is_empty())
                .then(|| overlay.image_pull_secrets.clone()),
            termination_grace_period_seconds: overlay.termination_grace_period_seconds,
            topology_spread_constraints: topology_spread(&pod_set.topology_spread, &parts.labels),
            ..Default::default()
        }),
    })
}

fn topology_spread(
    keys: &[String],
    labels: &BTreeMap<String, String>,
) -> Option<Vec<TopologySpreadConstraint>> {
    (!keys.is_empty()).then(|| {
        keys.iter()
            .map(|key| TopologySpreadConstraint {
                max_skew: 1,
                topology_key: key.clone(),
                when_unsatisfiable: "DoNotSchedule".to_string(),
                label_selector: Some(selector(labels)),
                ..Default::default()
            })
            .collect()
    })
}

/// Runs the start script of the pod's config revision.
pub fn entrypoint_command() -> Vec<String> {
    vec![
        "/bin/sh".to_string(),
        "-c".to_string(),
        format!(
            "exec /bin/sh {}/start.sh${{{}:+-${}}}",
            CONFIG_PATH,
            configmap::SUFFIX_ENV,
            configmap::SUFFIX_ENV
        ),
    ]
}

pub fn data_mount() -> VolumeMount {
    VolumeMount {
        name: DATA_VOLUME.to_string(),
        mount_path: DATA_PATH.to_string(),
        ..Default::default()
    }
}

fn service_ports(ports: &[(&str, i32, i32)]) -> Vec<ServicePort> {
    ports
        .iter()
        .map(|(name, port, target)| ServicePort {
            name: Some(name.to_string()),
            port: *port,
            target_port: Some(IntOrString::Int(*target)),
            protocol: Some("TCP".to_string()),
            ..Default::default()
        })
        .collect()
}

/// Headless service giving every pod a stable DNS name.
pub fn headless_service(
    meta: ObjectMeta,
    selector_labels: &BTreeMap<String, String>,
    ports: &[(&str, i32, i32)],
) -> Service {
    Service {
        metadata: meta,
        spec: Some(ServiceSpec {
            cluster_ip: Some("None".to_string()),
            publish_not_ready_addresses: Some(true),
            selector: Some(selector_labels.clone()),
            ports: Some(service_ports(ports)),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn service(
    meta: ObjectMeta,
    selector_labels: &BTreeMap<String, String>,
    ports: &[(&str, i32, i32)],
    service_type: Option<&str>,
    node_port: Option<i32>,
) -> Service {
    let service_type = service_type.unwrap_or("ClusterIP").to_string();
    let mut ports = service_ports(ports);
    if service_type == "NodePort" {
        if let (Some(np), Some(first)) = (node_port, ports.first_mut()) {
            first.node_port = Some(np);
        }
    }
    Service {
        metadata: meta,
        spec: Some(ServiceSpec {
            type_: Some(service_type),
            selector: Some(selector_labels.clone()),
            ports: Some(ports),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn config_map(meta: ObjectMeta, data: BTreeMap<String, String>) -> ConfigMap {
    ConfigMap {
        metadata: meta,
        data: Some(data),
        ..Default::default()
    }
}

/// Operator defaults with the user's `spec.config` layered on top.
pub fn render_config(defaults: TomlConfig, pod_set: &PodSet) -> Result<String> {
    let merged = match &pod_set.config {
        Some(user) => user.merged_onto(&defaults),
        None => defaults,
    };
    merged.to_toml()
}

/// `[hakeeper-client]` pointing at the log service discovery address.
pub fn set_hakeeper_client(config: &mut TomlConfig, discovery: &str) {
    config.set(
        &["hakeeper-client", "service-addresses"],
        Value::Array(vec![Value::String(discovery.to_string())]),
    );
}

fn table(entries: Vec<(&str, Value)>) -> Value {
    Value::Table(
        entries
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect(),
    )
}

/// `[[fileservice]]` entries for local, shared and ETL storage.
pub fn set_fileservice(
    config: &mut TomlConfig,
    shared: &SharedStorageProvider,
    cache: Option<&SharedStorageCache>,
) {
    let local = table(vec![
        ("name", Value::from("LOCAL")),
        ("backend", Value::from("DISK")),
        ("data-dir", Value::from(format!("{}/local", DATA_PATH))),
    ]);

    let mut shared_entries = vec![("name", Value::from("SHARED"))];
    if let Some(s3) = &shared.s3 {
        let (bucket, prefix) = s3.bucket_and_prefix();
        let mut s3_entries = vec![
            ("bucket", Value::from(bucket)),
            ("key-prefix", Value::from(prefix)),
        ];
        if let Some(endpoint) = &s3.endpoint {
            s3_entries.push(("endpoint", Value::from(endpoint.as_str())));
        }
        if let Some(region) = &s3.region {
            s3_entries.push(("region", Value::from(region.as_str())));
        }
        if s3.provider_type() == crate::crd::common::S3ProviderType::Minio {
            s3_entries.push(("is-minio", Value::from(true)));
        }
        shared_entries.push(("backend", Value::from("S3")));
        shared_entries.push(("s3", table(s3_entries)));
    } else if let Some(fs) = &shared.file_system {
        shared_entries.push(("backend", Value::from("DISK")));
        shared_entries.push(("data-dir", Value::from(fs.path.as_str())));
    }
    if let Some(cache) = cache {
        let mut cache_entries = vec![];
        if let Some(mem) = &cache.memory_cache_size {
            cache_entries.push(("memory-capacity", Value::from(mem.0.as_str())));
        }
        if let Some(disk) = &cache.disk_cache_size {
            cache_entries.push(("disk-capacity", Value::from(disk.0.as_str())));
            cache_entries.push(("disk-path", Value::from(format!("{}/disk-cache", DATA_PATH))));
        }
        if !cache_entries.is_empty() {
            shared_entries.push(("cache", table(cache_entries)));
        }
    }

    let mut etl = match shared_entries.iter().find(|(k, _)| *k == "backend") {
        Some((_, Value::String(b))) if b == "S3" => shared_entries.clone(),
        _ => vec![
            ("backend", Value::from("DISK")),
            ("data-dir", Value::from(format!("{}/etl", DATA_PATH))),
        ],
    };
    etl.retain(|(k, _)| *k != "name" && *k != "cache");
    etl.push(("name", Value::from("ETL")));

    config.set(
        &["fileservice"],
        Value::Array(vec![local, table(shared_entries), table(etl)]),
    );
}

/// Credentials the database reads to reach shared storage.
pub fn storage_env(shared: &SharedStorageProvider) -> Vec<EnvVar> {
    match shared.s3.as_ref().and_then(|s3| s3.secret_ref.as_ref()) {
        Some(secret) => vec![
            secret_env("AWS_ACCESS_KEY_ID", &secret.name, "AWS_ACCESS_KEY_ID"),
            secret_env("AWS_SECRET_ACCESS_KEY", &secret.name, "AWS_SECRET_ACCESS_KEY"),
        ],
        None => vec![],
    }
}

/// How a store derives its UUID inside the start script.
pub enum UuidSource {
    /// Ordinal of a stateful pod, 16 bytes big-endian.
    Ordinal,
    /// SHA-256 of the pod's DNS name, first 16 bytes.
    DnsName,
    None,
}

/// Start script shared by every component.
///
/// Waits for the pod's own DNS name, fills the per-pod placeholders of the
/// config revision into a runtime copy, appends `extra` and execs the binary.
pub fn start_script(uuid: UuidSource, extra: &str) -> String {
    let uuid_line = match uuid {
        UuidSource::Ordinal => {
            "UUID=$(printf '00000000-0000-0000-0000-%012x' \"${POD_NAME##*-}\")\n".to_string()
        }
        UuidSource::DnsName => concat!(
            "UUID=$(printf '%s' \"${POD_NAME}.${HEADLESS_SERVICE}.${NAMESPACE}\" | sha256sum | cut -c1-32 ",
            "| sed -E 's/^(.{8})(.{4})(.{4})(.{4})(.{12})$/\\1-\\2-\\3-\\4-\\5/')\n"
        )
        .to_string(),
        UuidSource::None => "UUID=\"\"\n".to_string(),
    };
    format!(
        r#"#!/bin/sh
set -eu

ADDR="${{POD_NAME}}.${{HEADLESS_SERVICE:-}}.${{NAMESPACE}}.svc"
if [ -z "${{HEADLESS_SERVICE:-}}" ]; then ADDR="${{POD_IP}}"; fi
CONF="{conf_dir}/config.toml${{{suffix}:+-${suffix}}}"
RUN_CONF={data}/config.toml

i=0
until [ -z "${{HEADLESS_SERVICE:-}}" ] || nslookup "${{ADDR}}" >/dev/null 2>&1; do
  i=$((i+1))
  if [ "${{i}}" -ge {attempts} ]; then
    echo "${{ADDR}} is not resolvable after {attempts} attempts" >&2
    exit 1
  fi
  sleep 1
done

{uuid_line}mkdir -p {data}
sed -e "s/{uuid_ph}/${{UUID}}/g" -e "s/{addr_ph}/${{ADDR}}/g" "${{CONF}}" > "${{RUN_CONF}}"
{extra}
exec /mo-service -cfg "${{RUN_CONF}}"
"#,
        conf_dir = CONFIG_PATH,
        suffix = configmap::SUFFIX_ENV,
        data = DATA_PATH,
        attempts = DNS_WAIT_ATTEMPTS,
        uuid_line = uuid_line,
        uuid_ph = UUID_PLACEHOLDER,
        addr_ph = ADDR_PLACEHOLDER,
        extra = extra,
    )
}

/// `config.toml` and `start.sh` of one revision.
pub fn config_data(config: String, script: String) -> BTreeMap<String, String> {
    BTreeMap::from([
        (crate::common::CONFIG_FILE.to_string(), config),
        (crate::common::ENTRYPOINT_FILE.to_string(), script),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::common::S3Provider;

    #[test]
    fn test_missing_image_is_an_invariant() {
        let err = image_of(&PodSet::default()).unwrap_err();
        assert_eq!(err.as_invariant().map(|(r, _)| r), Some("ImageMissing"));
    }

    #[test]
    fn test_user_config_wins_over_defaults() {
        let mut defaults = TomlConfig::new();
        defaults.set(&["log", "level"], "info");
        defaults.set(&["log", "format"], "json");
        let pod_set = PodSet {
            config: Some(TomlConfig::parse("[log]\nlevel = \"debug\"\n").unwrap()),
            ..Default::default()
        };
        let rendered = TomlConfig::parse(&render_config(defaults, &pod_set).unwrap()).unwrap();
        assert_eq!(rendered.get(&["log", "level"]), Some(Value::from("debug")));
        assert_eq!(rendered.get(&["log", "format"]), Some(Value::from("json")));
    }

    #[test]
    fn test_fileservice_for_s3() {
        let shared = SharedStorageProvider {
            s3: Some(S3Provider {
                path: "test-bucket/mo".to_string(),
                endpoint: Some("http://minio:9000".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let mut config = TomlConfig::new();
        set_fileservice(&mut config, &shared, None);
        let fs = config.get(&["fileservice"]).unwrap();
        let entries = fs.as_array().unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[1]["name"].as_str(), Some("SHARED"));
        assert_eq!(entries[1]["s3"]["bucket"].as_str(), Some("test-bucket"));
        assert_eq!(entries[1]["s3"]["key-prefix"].as_str(), Some("mo"));
        assert_eq!(entries[2]["name"].as_str(), Some("ETL"));
        assert_eq!(entries[2]["backend"].as_str(), Some("S3"));
    }

    #[test]
    fn test_start_script_waits_for_dns() {
        let script = start_script(UuidSource::Ordinal, "");
        assert!(script.contains("-ge 30"));
        assert!(script.contains("config.toml${CONFIG_SUFFIX:+-$CONFIG_SUFFIX}"));
        assert!(script.contains("%012x"));
        assert!(script.contains("exec /mo-service"));
    }

    #[test]
    fn test_entrypoint_selects_revision() {
        let cmd = entrypoint_command();
        assert_eq!(
            cmd[2],
            "exec /bin/sh /etc/matrixone/config/start.sh${CONFIG_SUFFIX:+-$CONFIG_SUFFIX}"
        );
    }
}
