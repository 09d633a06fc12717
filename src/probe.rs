//! Store health as seen by the coordination service.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
#[cfg(test)]
use mockall::automock;

use crate::common::{pod, ANN_CN_STATE, ANN_CONNECTIONS, ANN_PIPELINES, ANN_REPLICAS};
use crate::crd::cnclaim::Workload;
use crate::crd::cnset::CNStoreState;
use crate::errors::*;

/// Name of the database container in every generated pod.
pub const MAIN_CONTAINER: &str = "main";

/// Answers questions HAKeeper would answer about a CN store.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait StoreProbe: Send + Sync {
    /// State of the store hosted by `pod`.
    async fn cn_store_state(&self, pod: &Pod) -> Result<CNStoreState>;

    /// Work still attached to the store hosted by `pod`.
    async fn workload(&self, pod: &Pod) -> Result<Workload>;
}

/// Probe that reads what the database reports into its own pod.
///
/// The main container turns ready once its store has registered; drain
/// progress is exported through pod annotations.
#[derive(Clone, Default)]
pub struct PodStatusProbe;

#[async_trait]
impl StoreProbe for PodStatusProbe {
    async fn cn_store_state(&self, p: &Pod) -> Result<CNStoreState> {
        Ok(store_state_of(p))
    }

    async fn workload(&self, p: &Pod) -> Result<Workload> {
        Ok(Workload {
            connections: pod::counter(p, ANN_CONNECTIONS),
            pipelines: pod::counter(p, ANN_PIPELINES),
            replicas: pod::counter(p, ANN_REPLICAS),
        })
    }
}

fn store_state_of(p: &Pod) -> CNStoreState {
    if let Some(state) = pod::annotation(p, ANN_CN_STATE) {
        let state = CNStoreState::parse(state);
        if state == CNStoreState::Draining {
            return state;
        }
    }
    let main = p
        .status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref())
        .and_then(|cs| cs.iter().find(|c| c.name == MAIN_CONTAINER));
    match main {
        None => CNStoreState::Unknown,
        Some(c) if c.ready => CNStoreState::Up,
        Some(_) => CNStoreState::Down,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::pod::testing;
    use k8s_openapi::api::core::v1::ContainerStatus;

    fn with_main(mut p: Pod, ready: bool) -> Pod {
        if let Some(status) = p.status.as_mut() {
            status.container_statuses = Some(vec![ContainerStatus {
                name: MAIN_CONTAINER.to_string(),
                ready,
                ..Default::default()
            }]);
        }
        p
    }

    #[tokio::test]
    async fn test_state_follows_main_container() {
        let probe = PodStatusProbe;
        let p = testing::pod("mo-cn-abcde", None);
        assert_eq!(probe.cn_store_state(&p).await.unwrap(), CNStoreState::Unknown);
        let p = with_main(p, false);
        assert_eq!(probe.cn_store_state(&p).await.unwrap(), CNStoreState::Down);
        let p = with_main(p, true);
        assert_eq!(probe.cn_store_state(&p).await.unwrap(), CNStoreState::Up);
        let p = testing::with_annotation(p, ANN_CN_STATE, "Draining");
        assert_eq!(probe.cn_store_state(&p).await.unwrap(), CNStoreState::Draining);
    }

    #[tokio::test]
    async fn test_workload_from_annotations() {
        let p = testing::pod("mo-cn-abcde", None);
        let p = testing::with_annotation(p, ANN_CONNECTIONS, "3");
        let p = testing::with_annotation(p, ANN_PIPELINES, "garbage");
        let w = PodStatusProbe.workload(&p).await.unwrap();
        assert_eq!(w.connections, 3);
        assert_eq!(w.pipelines, 0);
        assert!(!w.is_empty());
    }
}
