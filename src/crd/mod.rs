//! Custom resources served by the operator.

pub mod backup;
pub mod bucketclaim;
pub mod cluster;
pub mod cnclaim;
pub mod cnpool;
pub mod cnset;
pub mod common;
pub mod dnset;
pub mod logset;
pub mod proxyset;

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::CustomResourceExt;

pub use backup::{Backup, BackupJob, RestoreJob};
pub use bucketclaim::BucketClaim;
pub use cluster::MatrixOneCluster;
pub use cnclaim::{CNClaim, CNClaimSet};
pub use cnpool::CNPool;
pub use cnset::CNSet;
pub use dnset::DNSet;
pub use logset::LogSet;
pub use proxyset::{ProxySet, WebUI};

use crate::common::conditions::Conditional;

macro_rules! impl_conditional {
    ($($kind:ty),* $(,)?) => {
        $(
            impl Conditional for $kind {
                fn conditions(&self) -> &[Condition] {
                    self.status
                        .as_ref()
                        .map(|s| s.conditional.conditions.as_slice())
                        .unwrap_or(&[])
                }
            }
        )*
    };
}

impl_conditional!(
    MatrixOneCluster,
    LogSet,
    DNSet,
    CNSet,
    ProxySet,
    WebUI,
    CNPool,
    CNClaim,
    CNClaimSet,
    BucketClaim,
    BackupJob,
    RestoreJob,
);

/// Every CRD the operator owns, for installation.
pub fn all() -> Vec<CustomResourceDefinition> {
    vec![
        MatrixOneCluster::crd(),
        LogSet::crd(),
        DNSet::crd(),
        CNSet::crd(),
        ProxySet::crd(),
        WebUI::crd(),
        CNPool::crd(),
        CNClaim::crd(),
        CNClaimSet::crd(),
        BucketClaim::crd(),
        BackupJob::crd(),
        Backup::crd(),
        RestoreJob::crd(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crd_names() {
        let names: Vec<String> = all()
            .into_iter()
            .map(|c| c.metadata.name.unwrap_or_default())
            .collect();
        assert!(names.contains(&"logsets.core.matrixorigin.io".to_string()));
        assert!(names.contains(&"cnclaimsets.core.matrixorigin.io".to_string()));
        assert!(names.contains(&"matrixoneclusters.core.matrixorigin.io".to_string()));
        assert_eq!(names.len(), 13);
    }

    #[test]
    fn test_bucketclaim_and_backup_are_cluster_scoped() {
        assert_eq!(BucketClaim::crd().spec.scope, "Cluster");
        assert_eq!(Backup::crd().spec.scope, "Cluster");
        assert_eq!(LogSet::crd().spec.scope, "Namespaced");
    }
}
