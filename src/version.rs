//! Version gates for database and operator features.
//!
//! Database features are tied to patch windows: a feature listed for 1.1.2
//! exists in 1.1.2 and later 1.1.x, but not in 1.2.0 unless 1.2.x is listed
//! as well. Versions that are not semver (nightly builds, commit tags) are
//! treated as the latest and have every feature.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use semver::Version;

use crate::common::ANN_OPERATOR_VERSION;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum MOFeature {
    /// The proxy routes sessions by CN labels.
    ProxySupport,
    /// Stores accept labels from the operator.
    CNLabel,
    /// Stores export pipeline counts for draining.
    PipelineInfo,
    /// Sessions can be migrated between stores.
    SessionMigration,
    /// Stores report locks and migrate them on drain.
    LockMigration,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum OperatorFeature {
    /// Config maps are updated in place with per-revision keys.
    InplaceConfigmapUpdate,
}

fn mo_feature_table() -> BTreeMap<MOFeature, &'static [&'static str]> {
    BTreeMap::from([
        (MOFeature::ProxySupport, &["1.1.0", "1.2.0", "1.3.0"][..]),
        (MOFeature::CNLabel, &["1.1.0", "1.2.0", "1.3.0"][..]),
        (MOFeature::PipelineInfo, &["1.1.2", "1.2.0", "1.3.0"][..]),
        (MOFeature::SessionMigration, &["1.1.2", "1.2.0", "1.3.0"][..]),
        (MOFeature::LockMigration, &["1.2.0", "1.3.0"][..]),
    ])
}

fn operator_feature_table() -> BTreeMap<OperatorFeature, &'static str> {
    BTreeMap::from([(OperatorFeature::InplaceConfigmapUpdate, "1.2.0")])
}

fn parse(v: &str) -> Option<Version> {
    Version::parse(v.trim().trim_start_matches('v')).ok()
}

/// Whether `version` falls into a window opened by one of `mins`.
pub fn within_windows(version: &str, mins: &[&str]) -> bool {
    let Some(v) = parse(version) else {
        return true;
    };
    mins.iter().filter_map(|m| parse(m)).any(|min| {
        min.major == v.major && min.minor == v.minor && v >= min
    })
}

pub fn mo_has(version: Option<&str>, feature: MOFeature) -> bool {
    let Some(version) = version.filter(|v| !v.is_empty()) else {
        return true;
    };
    mo_feature_table()
        .get(&feature)
        .map_or(false, |mins| within_windows(version, mins))
}

/// Operator features are monotonic: any operator at or above the minimum has them.
pub fn operator_has(version: Option<&str>, feature: OperatorFeature) -> bool {
    let Some(v) = version.and_then(parse) else {
        return false;
    };
    operator_feature_table()
        .get(&feature)
        .and_then(|min| parse(min))
        .map_or(false, |min| v >= min)
}

/// Operator version stamped on an object when it was created.
///
/// Objects created before stamping existed carry none and keep legacy behaviour.
pub fn stamped_operator_version(meta: &ObjectMeta) -> Option<&str> {
    meta.annotations
        .as_ref()?
        .get(ANN_OPERATOR_VERSION)
        .map(String::as_str)
}

/// Stamps the running operator version on an object about to be written.
///
/// An object that already exists keeps whatever stamp it carries, or none.
pub fn stamp_operator_version(meta: &mut ObjectMeta, live: Option<&ObjectMeta>) {
    let stamp = match live {
        Some(live) => stamped_operator_version(live).map(str::to_string),
        None => Some(crate::OPERATOR_VERSION.to_string()),
    };
    if let Some(stamp) = stamp {
        meta.annotations
            .get_or_insert_with(Default::default)
            .entry(ANN_OPERATOR_VERSION.to_string())
            .or_insert(stamp);
    }
}

pub fn inplace_configmap_update(meta: &ObjectMeta) -> bool {
    operator_has(
        stamped_operator_version(meta),
        OperatorFeature::InplaceConfigmapUpdate,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_windows_are_local_to_minor() {
        let mins = ["1.1.2", "1.2.0"];
        assert!(!within_windows("1.1.1", &mins));
        assert!(within_windows("1.1.2", &mins));
        assert!(within_windows("1.1.9", &mins));
        assert!(within_windows("1.2.0", &mins));
        assert!(!within_windows("1.3.0", &mins));
        assert!(within_windows("nightly-4e3f1a", &mins));
        assert!(within_windows("v1.2.3", &mins));
    }

    #[test]
    fn test_feature_in_patch_does_not_leak_to_next_minor() {
        assert!(mo_has(Some("1.1.3"), MOFeature::PipelineInfo));
        assert!(!mo_has(Some("1.1.3"), MOFeature::LockMigration));
        assert!(!mo_has(Some("1.0.0"), MOFeature::CNLabel));
        assert!(mo_has(None, MOFeature::LockMigration));
    }

    #[test]
    fn test_operator_gate() {
        assert!(operator_has(Some("1.2.0"), OperatorFeature::InplaceConfigmapUpdate));
        assert!(operator_has(Some("1.3.0"), OperatorFeature::InplaceConfigmapUpdate));
        assert!(!operator_has(Some("1.1.9"), OperatorFeature::InplaceConfigmapUpdate));
        assert!(!operator_has(None, OperatorFeature::InplaceConfigmapUpdate));

        let mut meta = ObjectMeta::default();
        assert!(!inplace_configmap_update(&meta));
        meta.annotations = Some(BTreeMap::from([(
            ANN_OPERATOR_VERSION.to_string(),
            crate::OPERATOR_VERSION.to_string(),
        )]));
        assert!(inplace_configmap_update(&meta));
    }

    #[test]
    fn test_stamp_is_kept_across_upgrades() {
        let mut fresh = ObjectMeta::default();
        stamp_operator_version(&mut fresh, None);
        assert_eq!(stamped_operator_version(&fresh), Some(crate::OPERATOR_VERSION));
        assert!(inplace_configmap_update(&fresh));

        let mut old = ObjectMeta::default();
        old.annotations = Some(BTreeMap::from([(ANN_OPERATOR_VERSION.to_string(), "1.1.0".to_string())]));
        let mut desired = ObjectMeta::default();
        stamp_operator_version(&mut desired, Some(&old));
        assert_eq!(stamped_operator_version(&desired), Some("1.1.0"));

        let mut legacy = ObjectMeta::default();
        stamp_operator_version(&mut legacy, Some(&ObjectMeta::default()));
        assert!(legacy.annotations.is_none());
    }
}
