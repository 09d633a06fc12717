//! Keeps the config map mounted by a pod template in sync with desired data.
//!
//! Legacy mode renames the map after its content digest, so any change rolls
//! every pod. In-place mode keeps one map whose keys carry a revision suffix;
//! pods pick their revision through the `config-suffix` annotation and roll
//! one by one while older revisions stay until no pod references them.

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, EnvVar, EnvVarSource, ObjectFieldSelector, Pod,
    PodTemplateSpec, Volume,
};
use kube::api::{Api, PostParams};
use kube::ResourceExt;
use log::{debug, info};

use crate::common::hashing::short_digest;
use crate::common::{pod, ANN_CONFIG_SUFFIX, CONFIG_VOLUME};
use crate::errors::*;
use crate::kube_utils;

/// Environment variable the entrypoint reads its revision suffix from.
pub const SUFFIX_ENV: &str = "CONFIG_SUFFIX";

/// Name of the config map holding `data` in legacy mode.
pub fn legacy_name(base: &str, data: &BTreeMap<String, String>) -> String {
    format!("{}-{}", base, short_digest(data))
}

pub fn suffixed_key(file: &str, suffix: &str) -> String {
    format!("{}-{}", file, suffix)
}

/// Splits `config.toml-abc1234` into file and suffix.
pub fn split_key(key: &str) -> Option<(&str, &str)> {
    let (file, suffix) = key.rsplit_once('-')?;
    (suffix.len() == 7 && suffix.bytes().all(|b| b.is_ascii_hexdigit())).then_some((file, suffix))
}

/// Data of the shared map after publishing `desired`, and the suffix pods
/// should carry to read it.
///
/// Keys of other revisions survive while their suffix is in `referenced`.
pub fn plan_in_place(
    desired: &BTreeMap<String, String>,
    existing: Option<&BTreeMap<String, String>>,
    referenced: &BTreeSet<String>,
) -> (BTreeMap<String, String>, String) {
    let suffix = short_digest(desired);
    let mut data: BTreeMap<String, String> = existing
        .into_iter()
        .flatten()
        .filter(|(k, _)| match split_key(k) {
            Some((_, s)) => s != suffix && referenced.contains(s),
            None => false,
        })
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    for (file, content) in desired {
        data.insert(suffixed_key(file, &suffix), content.clone());
    }
    (data, suffix)
}

/// Legacy maps no pod mounts any more.
pub fn legacy_garbage(
    existing: &[String],
    current: &str,
    referenced: &BTreeSet<String>,
) -> Vec<String> {
    existing
        .iter()
        .filter(|n| n.as_str() != current && !referenced.contains(*n))
        .cloned()
        .collect()
}

/// Downward-API env var exposing the pod's config suffix.
pub fn suffix_env() -> EnvVar {
    EnvVar {
        name: SUFFIX_ENV.to_string(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: format!("metadata.annotations['{}']", ANN_CONFIG_SUFFIX),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn mounted_config_map(p: &Pod) -> Option<&str> {
    p.spec
        .as_ref()?
        .volumes
        .as_ref()?
        .iter()
        .find(|v| v.name == CONFIG_VOLUME)?
        .config_map
        .as_ref()
        .map(|c| c.name.as_str())
}

fn template_suffix(template: &PodTemplateSpec) -> Option<String> {
    template
        .metadata
        .as_ref()?
        .annotations
        .as_ref()?
        .get(ANN_CONFIG_SUFFIX)
        .cloned()
}

fn point_config_volume(template: &mut PodTemplateSpec, cm_name: &str) {
    let Some(spec) = template.spec.as_mut() else {
        return;
    };
    let volumes = spec.volumes.get_or_insert_with(Vec::new);
    let source = Some(ConfigMapVolumeSource {
        name: cm_name.to_string(),
        ..Default::default()
    });
    match volumes.iter_mut().find(|v| v.name == CONFIG_VOLUME) {
        Some(v) => v.config_map = source,
        None => volumes.push(Volume {
            name: CONFIG_VOLUME.to_string(),
            config_map: source,
            ..Default::default()
        }),
    }
}

fn set_template_suffix(template: &mut PodTemplateSpec, suffix: Option<&str>) {
    let annotations = template
        .metadata
        .get_or_insert_with(Default::default)
        .annotations
        .get_or_insert_with(BTreeMap::new);
    match suffix {
        Some(s) => {
            annotations.insert(ANN_CONFIG_SUFFIX.to_string(), s.to_string());
        }
        None => {
            annotations.remove(ANN_CONFIG_SUFFIX);
        }
    }
}

/// Publishes `desired` and points `template` at it.
///
/// `desired` carries the base name, labels and owner of the map. `live` is
/// the template currently applied to the workload, whose revision must
/// survive until every pod has moved off it.
pub async fn sync(
    api: &Api<ConfigMap>,
    desired: ConfigMap,
    template: &mut PodTemplateSpec,
    live: Option<&PodTemplateSpec>,
    pods: &[Pod],
    in_place: bool,
) -> Result<()> {
    let base = desired.name_any();
    let data = desired.data.clone().unwrap_or_default();

    if in_place {
        let mut referenced: BTreeSet<String> = pods
            .iter()
            .filter_map(|p| pod::annotation(p, ANN_CONFIG_SUFFIX))
            .map(str::to_string)
            .collect();
        referenced.extend(live.and_then(template_suffix));

        let existing = api.get_opt(&base).await?;
        let (next, suffix) = plan_in_place(
            &data,
            existing.as_ref().and_then(|cm| cm.data.as_ref()),
            &referenced,
        );
        match existing {
            None => {
                info!("creating config map {} at revision {}", base, suffix);
                let mut cm = desired;
                cm.data = Some(next);
                api.create(&PostParams::default(), &cm).await?;
            }
            Some(live_cm) if live_cm.data.as_ref() != Some(&next) => {
                debug!("publishing config revision {} into {}", suffix, base);
                kube_utils::cas_merge(
                    api,
                    &live_cm,
                    serde_json::json!({ "data": diff_data(live_cm.data.as_ref(), &next) }),
                )
                .await?;
            }
            Some(_) => {}
        }
        point_config_volume(template, &base);
        set_template_suffix(template, Some(&suffix));
        return Ok(());
    }

    let name = legacy_name(&base, &data);
    let mut cm = desired;
    cm.metadata.name = Some(name.clone());
    kube_utils::create_if_missing(api, &cm).await?;
    point_config_volume(template, &name);
    set_template_suffix(template, None);

    let referenced: BTreeSet<String> = pods
        .iter()
        .filter_map(mounted_config_map)
        .map(str::to_string)
        .chain(
            live.and_then(|t| t.spec.as_ref())
                .and_then(|s| s.volumes.as_ref())
                .into_iter()
                .flatten()
                .filter(|v| v.name == CONFIG_VOLUME)
                .filter_map(|v| v.config_map.as_ref().map(|c| c.name.clone())),
        )
        .collect();
    let labels = cm.metadata.labels.clone().unwrap_or_default();
    if !labels.is_empty() {
        let existing: Vec<String> = kube_utils::list_labeled(api, &labels)
            .await?
            .iter()
            .map(|c| c.name_any())
            .filter(|n| n.starts_with(&format!("{}-", base)))
            .collect();
        for stale in legacy_garbage(&existing, &name, &referenced) {
            info!("removing unreferenced config map {}", stale);
            kube_utils::delete_if_exists(api, &stale).await?;
        }
    }
    Ok(())
}

/// Merge-patch body turning `live` into `next`: removed keys map to null.
fn diff_data(
    live: Option<&BTreeMap<String, String>>,
    next: &BTreeMap<String, String>,
) -> BTreeMap<String, Option<String>> {
    let mut patch: BTreeMap<String, Option<String>> = live
        .into_iter()
        .flatten()
        .filter(|(k, _)| !next.contains_key(*k))
        .map(|(k, _)| (k.clone(), None))
        .collect();
    for (k, v) in next {
        if live.and_then(|l| l.get(k)) != Some(v) {
            patch.insert(k.clone(), Some(v.clone()));
        }
    }
    patch
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(config: &str) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("config.toml".to_string(), config.to_string()),
            ("start.sh".to_string(), "exec mo-service".to_string()),
        ])
    }

    #[test]
    fn test_legacy_name_follows_content() {
        let a = legacy_name("mo-cn-config", &data("a = 1"));
        let b = legacy_name("mo-cn-config", &data("a = 2"));
        assert!(a.starts_with("mo-cn-config-"));
        assert_eq!(a.len(), "mo-cn-config-".len() + 7);
        assert_ne!(a, b);
    }

    #[test]
    fn test_split_key() {
        assert_eq!(split_key("config.toml-abc1234"), Some(("config.toml", "abc1234")));
        assert_eq!(split_key("config.toml"), None);
        assert_eq!(split_key("start-script"), None);
    }

    #[test]
    fn test_in_place_roll_keeps_referenced_revision() {
        let d1 = data("sql-port = 6001");
        let (first, s1) = plan_in_place(&d1, None, &BTreeSet::new());
        assert!(first.contains_key(&format!("config.toml-{}", s1)));
        assert!(first.contains_key(&format!("start.sh-{}", s1)));

        // one entry changes while every pod still runs s1
        let d2 = data("sql-port = 6002");
        let pods_on_s1 = BTreeSet::from([s1.clone()]);
        let (second, s2) = plan_in_place(&d2, Some(&first), &pods_on_s1);
        assert_ne!(s1, s2);
        assert!(second.contains_key(&format!("config.toml-{}", s1)));
        assert!(second.contains_key(&format!("config.toml-{}", s2)));

        // halfway through the roll both revisions are live
        let mixed = BTreeSet::from([s1.clone(), s2.clone()]);
        let (third, _) = plan_in_place(&d2, Some(&second), &mixed);
        assert_eq!(third, second);

        // every pod rolled: the old revision is collected
        let rolled = BTreeSet::from([s2.clone()]);
        let (last, s3) = plan_in_place(&d2, Some(&third), &rolled);
        assert_eq!(s3, s2);
        assert!(!last.contains_key(&format!("config.toml-{}", s1)));
        assert_eq!(last.len(), 2);
    }

    #[test]
    fn test_in_place_drops_unsuffixed_keys() {
        let existing = data("old");
        let (next, s) = plan_in_place(&data("new"), Some(&existing), &BTreeSet::new());
        assert!(!next.contains_key("config.toml"));
        assert_eq!(next.keys().filter(|k| k.ends_with(&s)).count(), 2);
    }

    #[test]
    fn test_legacy_garbage_skips_mounted() {
        let existing = vec![
            "mo-cn-config-aaaaaaa".to_string(),
            "mo-cn-config-bbbbbbb".to_string(),
            "mo-cn-config-ccccccc".to_string(),
        ];
        let referenced = BTreeSet::from(["mo-cn-config-bbbbbbb".to_string()]);
        assert_eq!(
            legacy_garbage(&existing, "mo-cn-config-ccccccc", &referenced),
            vec!["mo-cn-config-aaaaaaa".to_string()]
        );
    }

    #[test]
    fn test_diff_data_nulls_removed_keys() {
        let live = BTreeMap::from([
            ("a-1111111".to_string(), "x".to_string()),
            ("b-1111111".to_string(), "y".to_string()),
        ]);
        let next = BTreeMap::from([
            ("b-1111111".to_string(), "y".to_string()),
            ("b-2222222".to_string(), "z".to_string()),
        ]);
        let patch = diff_data(Some(&live), &next);
        assert_eq!(patch.get("a-1111111"), Some(&None));
        assert_eq!(patch.get("b-2222222"), Some(&Some("z".to_string())));
        assert!(!patch.contains_key("b-1111111"));
    }

    #[test]
    fn test_template_wiring() {
        let mut t = PodTemplateSpec {
            spec: Some(Default::default()),
            ..Default::default()
        };
        point_config_volume(&mut t, "mo-cn-config");
        set_template_suffix(&mut t, Some("abc1234"));
        assert_eq!(template_suffix(&t).as_deref(), Some("abc1234"));
        let vols = t.spec.unwrap().volumes.unwrap();
        assert_eq!(vols[0].config_map.as_ref().unwrap().name, "mo-cn-config");
    }
}
