use std::sync::Arc;

use futures::future::{self, BoxFuture};
use futures::{FutureExt, StreamExt};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ConfigMap, Pod, Secret, Service};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::Api;
use kube::client::Client;
use kube::{Resource, ResourceExt};
use kube_runtime::reflector::ObjectRef;
use kube_runtime::watcher;
use kube_runtime::Controller;
use log::{debug, info, warn};

use crate::common::{pod, LABEL_CLAIMED_BY, LABEL_COMPONENT, LABEL_POOL_NAME};
use crate::config::OperatorConfig;
use crate::controllers::backup::{BackupJobActor, CmdRestClient, HttpCmdRestClient, RestoreJobActor};
use crate::controllers::bucketclaim;
use crate::controllers::cluster::ClusterActor;
use crate::controllers::cnclaim::CNClaimActor;
use crate::controllers::cnclaimset::CNClaimSetActor;
use crate::controllers::cnpool::CNPoolActor;
use crate::controllers::cnset::CNSetActor;
use crate::controllers::cnstore::CNStoreActor;
use crate::controllers::dnset::DNSetActor;
use crate::controllers::logset::LogSetActor;
use crate::controllers::proxyset::ProxySetActor;
use crate::controllers::ttl::TtlGc;
use crate::controllers::webui::WebUIActor;
use crate::controllers::workload::COMPONENT_CNSET;
use crate::crd::*;
use crate::errors::*;
use crate::kruise::{AdvancedStatefulSet, CloneSet};
use crate::probe::{PodStatusProbe, StoreProbe};
use crate::runtime::{error_policy, reconcile, Actor, Object, Reconciler};

/// Consumes the stream of a controller; the results only matter for logs.
fn drive<K, A>(controller: Controller<K>, rec: Reconciler<K, A>) -> BoxFuture<'static, ()>
where
    K: Object + Resource<DynamicType = ()>,
    A: Actor<K>,
{
    controller
        .shutdown_on_signal()
        .run(reconcile, error_policy, Arc::new(rec))
        .for_each(|res| {
            match res {
                Ok((obj, action)) => debug!("reconciled {}: {:?}", obj, action),
                Err(e) => debug!("controller: {}", e),
            }
            future::ready(())
        })
        .boxed()
}

fn every<K: Resource<DynamicType = ()>>(client: &Client) -> Api<K>
where
    K: Clone + serde::de::DeserializeOwned + std::fmt::Debug,
{
    Api::all(client.clone())
}

fn cfg() -> watcher::Config {
    watcher::Config::default()
}

/// Pool pods trigger the pool they belong to.
fn pool_of(p: Pod) -> Option<ObjectRef<CNPool>> {
    let pool = pod::label(&p, LABEL_POOL_NAME)?;
    Some(ObjectRef::new(pool).within(p.namespace().as_deref()?))
}

/// Claimed pods trigger the claim holding them.
fn claim_of(p: Pod) -> Option<ObjectRef<CNClaim>> {
    let claim = pod::label(&p, LABEL_CLAIMED_BY)?;
    Some(ObjectRef::new(claim).within(p.namespace().as_deref()?))
}

/// Runs one controller per kind until a termination signal arrives.
pub struct Manager {
    pub config: Arc<OperatorConfig>,
}

impl Manager {
    /// Checks that the CRDs are installed and assembles every controller.
    ///
    /// The returned future drives them all; it is up to `main` to await it.
    pub async fn new(client: Client, config: OperatorConfig) -> Result<(Self, BoxFuture<'static, ()>)> {
        let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
        for crd in crate::crd::all() {
            let name = crd.name_any();
            if crds.get_opt(&name).await?.is_none() {
                bail!("CRD {} is not installed, apply the output of `mo-operator crd` first", name);
            }
        }

        let config = Arc::new(config);
        let probe: Arc<dyn StoreProbe> = Arc::new(PodStatusProbe);
        let rest: Arc<dyn CmdRestClient> = Arc::new(HttpCmdRestClient::new()?);
        let c = &client;

        let controllers = vec![
            drive(
                Controller::new(every::<LogSet>(c), cfg())
                    .owns(every::<AdvancedStatefulSet>(c), cfg())
                    .owns(every::<Service>(c), cfg())
                    .owns(every::<ConfigMap>(c), cfg()),
                Reconciler::new(client.clone(), LogSetActor, config.clone()),
            ),
            drive(
                Controller::new(every::<DNSet>(c), cfg())
                    .owns(every::<AdvancedStatefulSet>(c), cfg())
                    .owns(every::<Service>(c), cfg())
                    .owns(every::<ConfigMap>(c), cfg()),
                Reconciler::new(client.clone(), DNSetActor, config.clone()),
            ),
            drive(
                Controller::new(every::<CNSet>(c), cfg())
                    .owns(every::<CloneSet>(c), cfg())
                    .owns(every::<Service>(c), cfg())
                    .owns(every::<ConfigMap>(c), cfg()),
                Reconciler::new(client.clone(), CNSetActor { probe: probe.clone() }, config.clone()),
            ),
            drive(
                Controller::new(
                    every::<Pod>(c),
                    cfg().labels(&format!("{}={}", LABEL_COMPONENT, COMPONENT_CNSET)),
                ),
                Reconciler::without_finalizer(
                    client.clone(),
                    CNStoreActor { probe: probe.clone() },
                    config.clone(),
                ),
            ),
            drive(
                Controller::new(every::<ProxySet>(c), cfg())
                    .owns(every::<CloneSet>(c), cfg())
                    .owns(every::<Service>(c), cfg())
                    .owns(every::<ConfigMap>(c), cfg()),
                Reconciler::new(client.clone(), ProxySetActor, config.clone()),
            ),
            drive(
                Controller::new(every::<WebUI>(c), cfg())
                    .owns(every::<Deployment>(c), cfg())
                    .owns(every::<Service>(c), cfg()),
                Reconciler::new(client.clone(), WebUIActor, config.clone()),
            ),
            drive(
                Controller::new(every::<CNPool>(c), cfg())
                    .owns(every::<CNSet>(c), cfg())
                    .watches(every::<Pod>(c), cfg().labels(LABEL_POOL_NAME), pool_of),
                Reconciler::new(client.clone(), CNPoolActor, config.clone()),
            ),
            drive(
                Controller::new(every::<CNClaim>(c), cfg())
                    .watches(every::<Pod>(c), cfg().labels(LABEL_CLAIMED_BY), claim_of),
                Reconciler::new(client.clone(), CNClaimActor { probe: probe.clone() }, config.clone()),
            ),
            drive(
                Controller::new(every::<CNClaimSet>(c), cfg()).owns(every::<CNClaim>(c), cfg()),
                Reconciler::new(client.clone(), CNClaimSetActor, config.clone()),
            ),
            drive(
                Controller::new(every::<BucketClaim>(c), cfg()),
                bucketclaim::reconciler(client.clone(), config.clone()),
            ),
            drive(
                Controller::new(every::<BackupJob>(c), cfg())
                    .owns(every::<Job>(c), cfg())
                    .owns(every::<Service>(c), cfg()),
                Reconciler::new(client.clone(), BackupJobActor { rest: rest.clone() }, config.clone()),
            ),
            drive(
                Controller::new(every::<RestoreJob>(c), cfg())
                    .owns(every::<Job>(c), cfg())
                    .owns(every::<Service>(c), cfg()),
                Reconciler::new(client.clone(), RestoreJobActor { rest }, config.clone()),
            ),
            drive(
                Controller::new(every::<BackupJob>(c), cfg()),
                Reconciler::without_finalizer(client.clone(), TtlGc::<BackupJob>::new(), config.clone()),
            ),
            drive(
                Controller::new(every::<RestoreJob>(c), cfg()),
                Reconciler::without_finalizer(client.clone(), TtlGc::<RestoreJob>::new(), config.clone()),
            ),
            drive(
                Controller::new(every::<MatrixOneCluster>(c), cfg())
                    .owns(every::<LogSet>(c), cfg())
                    .owns(every::<DNSet>(c), cfg())
                    .owns(every::<CNSet>(c), cfg())
                    .owns(every::<ProxySet>(c), cfg())
                    .owns(every::<WebUI>(c), cfg())
                    .owns(every::<Secret>(c), cfg()),
                Reconciler::new(client.clone(), ClusterActor, config.clone()),
            ),
        ];
        info!("starting {} controllers", controllers.len());

        let drainer = future::join_all(controllers)
            .map(|_| warn!("all controllers stopped"))
            .boxed();
        Ok((Manager { config }, drainer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::pod::testing;

    #[test]
    fn test_pool_pods_map_to_their_pool() {
        let p = testing::with_label(testing::pod("pool-cn-0", None), LABEL_POOL_NAME, "pool");
        let r = pool_of(p).unwrap();
        assert_eq!(r.name, "pool");
        assert_eq!(r.namespace.as_deref(), Some("default"));

        assert!(pool_of(testing::pod("orphan", None)).is_none());
    }

    #[test]
    fn test_claimed_pods_map_to_their_claim() {
        let p = testing::with_label(testing::pod("pool-cn-0", None), LABEL_CLAIMED_BY, "claim-a");
        assert_eq!(claim_of(p).unwrap().name, "claim-a");
    }
}
