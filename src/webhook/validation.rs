//! Admission checks. Each returns every problem found, empty when valid.

use std::collections::BTreeSet;

use kube::ResourceExt;

use super::quantity;
use crate::crd::backup::BackupSource;
use crate::crd::cnset::{CNLabel, CNSetSpec};
use crate::crd::common::{SharedStorageProvider, Volume};
use crate::crd::logset::LogSetSpec;
use crate::crd::{BackupJob, CNClaim, CNPool, CNSet, DNSet, LogSet, MatrixOneCluster};

const CLUSTER_NAME_MAX: usize = 46;
const DNS_LABEL_MAX: usize = 63;
const DNS_SUBDOMAIN_MAX: usize = 253;

fn is_dns_label_body(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= DNS_LABEL_MAX
        && s.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !s.ends_with('-')
}

/// RFC 1035 label: starts with a letter.
pub fn is_dns1035_label(s: &str) -> bool {
    is_dns_label_body(s) && s.starts_with(|c: char| c.is_ascii_lowercase())
}

/// RFC 1123 subdomain: dot-separated labels starting with an alphanumeric.
pub fn is_dns1123_subdomain(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= DNS_SUBDOMAIN_MAX
        && s.split('.').all(|l| {
            is_dns_label_body(l) && l.starts_with(|c: char| c.is_ascii_alphanumeric())
        })
}

pub fn shared_storage(field: &str, s: &SharedStorageProvider) -> Vec<String> {
    match (s.s3.is_some(), s.file_system.is_some()) {
        (true, false) | (false, true) => vec![],
        _ => vec![format!("{}: exactly one storage provider must be set", field)],
    }
}

/// Size is non-zero and never shrinks.
pub fn volume(field: &str, new: Option<&Volume>, old: Option<&Volume>) -> Vec<String> {
    let Some(new) = new else {
        return vec![];
    };
    let Some(size) = quantity::parse(&new.size) else {
        return vec![format!("{}.size: {} is not a quantity", field, new.size.0)];
    };
    if size <= 0.0 {
        return vec![format!("{}.size must be greater than zero", field)];
    }
    match old.and_then(|o| quantity::parse(&o.size)) {
        Some(before) if size < before => vec![format!(
            "{}.size cannot shrink from {} to {}",
            field,
            old.map(|o| o.size.0.as_str()).unwrap_or_default(),
            new.size.0
        )],
        _ => vec![],
    }
}

pub fn cn_labels(field: &str, labels: &[CNLabel]) -> Vec<String> {
    let mut errs = vec![];
    for (i, l) in labels.iter().enumerate() {
        if l.key.is_empty() {
            errs.push(format!("{}[{}].key must not be empty", field, i));
        }
        if l.values.is_empty() || l.values.iter().any(String::is_empty) {
            errs.push(format!("{}[{}].values must be non-empty strings", field, i));
        }
    }
    errs
}

pub fn log_set_spec(field: &str, new: &LogSetSpec, old: Option<&LogSetSpec>) -> Vec<String> {
    let mut errs = shared_storage(&format!("{}.sharedStorage", field), &new.shared_storage);
    errs.extend(volume(
        &format!("{}.volume", field),
        Some(&new.volume),
        old.map(|o| &o.volume),
    ));
    let replicas = new.pod_set.replicas;
    let shard_replicas = new.initial_config.log_shard_replicas(replicas);
    if replicas < shard_replicas {
        errs.push(format!(
            "{}.replicas ({}) must not be less than logShardReplicas ({})",
            field, replicas, shard_replicas
        ));
    }
    if let Some(old) = old {
        if old.initial_config != new.initial_config {
            errs.push(format!("{}.initialConfig is immutable", field));
        }
    }
    errs
}

pub fn cn_set_spec(field: &str, new: &CNSetSpec, old: Option<&CNSetSpec>) -> Vec<String> {
    let mut errs = cn_labels(&format!("{}.cnLabels", field), &new.cn_labels);
    errs.extend(volume(
        &format!("{}.cacheVolume", field),
        new.cache_volume.as_ref(),
        old.and_then(|o| o.cache_volume.as_ref()),
    ));
    if new.pod_set.replicas < 0 {
        errs.push(format!("{}.replicas must not be negative", field));
    }
    errs
}

pub fn backup_source(source: &BackupSource) -> Vec<String> {
    match (&source.cluster_ref, &source.cn_set_ref) {
        (Some(_), None) | (None, Some(_)) => vec![],
        _ => vec!["spec.source: exactly one of clusterRef and cnSetRef must be set".to_string()],
    }
}

/// Kinds the webhook checks.
pub trait Validate {
    fn validate(&self, old: Option<&Self>) -> Vec<String>;
}

impl Validate for LogSet {
    fn validate(&self, old: Option<&Self>) -> Vec<String> {
        log_set_spec("spec", &self.spec, old.map(|o| &o.spec))
    }
}

impl Validate for DNSet {
    fn validate(&self, old: Option<&Self>) -> Vec<String> {
        volume(
            "spec.cacheVolume",
            self.spec.cache_volume.as_ref(),
            old.and_then(|o| o.spec.cache_volume.as_ref()),
        )
    }
}

impl Validate for CNSet {
    fn validate(&self, old: Option<&Self>) -> Vec<String> {
        cn_set_spec("spec", &self.spec, old.map(|o| &o.spec))
    }
}

impl Validate for CNPool {
    fn validate(&self, old: Option<&Self>) -> Vec<String> {
        let mut errs = cn_set_spec("spec.template", &self.spec.template, old.map(|o| &o.spec.template));
        if self.spec.deps.log_set.is_none() {
            errs.push("spec.deps.logSet is required".to_string());
        }
        errs
    }
}

impl Validate for CNClaim {
    fn validate(&self, old: Option<&Self>) -> Vec<String> {
        let mut errs = cn_labels("spec.cnLabels", &self.spec.cn_labels);
        if let Some(before) = old.and_then(|o| o.spec.pod_name.as_deref()) {
            if self.spec.pod_name.as_deref() != Some(before) {
                errs.push("spec.podName is immutable once set".to_string());
            }
        }
        errs
    }
}

impl Validate for BackupJob {
    fn validate(&self, _old: Option<&Self>) -> Vec<String> {
        let mut errs = backup_source(&self.spec.source);
        errs.extend(shared_storage("spec.target", &self.spec.target));
        errs
    }
}

impl Validate for MatrixOneCluster {
    fn validate(&self, old: Option<&Self>) -> Vec<String> {
        let mut errs = vec![];
        let name = self.name_any();
        if !is_dns1035_label(&name) || name.len() > CLUSTER_NAME_MAX {
            errs.push(format!(
                "metadata.name: {} must be a DNS-1035 label of at most {} characters",
                name, CLUSTER_NAME_MAX
            ));
        }
        let spec = &self.spec;
        let old = old.map(|o| &o.spec);
        if spec.tn.is_some() == spec.dn.is_some() {
            errs.push("spec: exactly one of tn and dn must be set".to_string());
        }
        errs.extend(log_set_spec("spec.logService", &spec.log_service, old.map(|o| &o.log_service)));
        if let Some(tp) = &spec.tp {
            errs.extend(cn_set_spec("spec.tp", tp, old.and_then(|o| o.tp.as_ref())));
        }
        if let Some(ap) = &spec.ap {
            errs.extend(cn_set_spec("spec.ap", ap, old.and_then(|o| o.ap.as_ref())));
        }
        let mut seen = BTreeSet::new();
        for (i, group) in spec.cn_groups.iter().enumerate() {
            let field = format!("spec.cnGroups[{}]", i);
            if !is_dns1123_subdomain(&group.name) {
                errs.push(format!("{}.name: {} is not a DNS-1123 subdomain", field, group.name));
            }
            if !seen.insert(group.name.as_str()) {
                errs.push(format!("{}.name: {} is not unique", field, group.name));
            }
            let before = old.and_then(|o| o.cn_groups.iter().find(|g| g.name == group.name));
            errs.extend(cn_set_spec(&field, &group.spec, before.map(|g| &g.spec)));
        }
        errs
    }
}
