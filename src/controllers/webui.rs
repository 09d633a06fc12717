//! Dashboard deployment. Stateless, so a plain Deployment will do.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, HTTPGetAction, PodSpec, PodTemplateSpec, Probe, Service,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::Api;
use kube::ResourceExt;

use super::workload::{self, COMPONENT_WEBUI};
use crate::common::conditions::{self, CONDITION_READY, CONDITION_SYNCED};
use crate::common::{sub_resource_labels, WEBUI_PORT};
use crate::crd::proxyset::WebUIStatus;
use crate::crd::WebUI;
use crate::errors::*;
use crate::kube_utils;
use crate::probe::MAIN_CONTAINER;
use crate::runtime::{Actor, Context};

const ROLLOUT_POLL: Duration = Duration::from_secs(15);

pub fn deployment_name(webui: &str) -> String {
    format!("{}-webui", webui)
}

pub fn service_name(webui: &str) -> String {
    format!("{}-webui", webui)
}

fn deployment(webui: &WebUI, namespace: &str, labels: &BTreeMap<String, String>) -> Result<Deployment> {
    let pod_set = &webui.spec.pod_set;
    let overlay = pod_set.overlay.clone().unwrap_or_default();
    let mut pod_labels = labels.clone();
    pod_labels.extend(overlay.pod_labels.clone());
    let probe = Probe {
        http_get: Some(HTTPGetAction {
            path: Some("/".to_string()),
            port: IntOrString::Int(WEBUI_PORT),
            ..Default::default()
        }),
        period_seconds: Some(10),
        ..Default::default()
    };
    let name = deployment_name(&webui.name_any());
    Ok(Deployment {
        metadata: workload::object_meta(&name, namespace, labels.clone(), kube_utils::owner_ref(webui)),
        spec: Some(DeploymentSpec {
            replicas: Some(pod_set.replicas),
            selector: workload::selector(labels),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(pod_labels),
                    annotations: Some(overlay.pod_annotations.clone()),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: MAIN_CONTAINER.to_string(),
                        image: Some(workload::image_of(pod_set)?),
                        image_pull_policy: pod_set.image_pull_policy.clone(),
                        ports: Some(vec![workload::tcp_port("http", WEBUI_PORT)]),
                        env: (!overlay.env.is_empty()).then(|| overlay.env.clone()),
                        resources: pod_set.resources.clone(),
                        readiness_probe: Some(probe),
                        ..Default::default()
                    }],
                    node_selector: pod_set.node_selector.clone(),
                    tolerations: (!overlay.tolerations.is_empty()).then(|| overlay.tolerations.clone()),
                    affinity: overlay.affinity.clone(),
                    image_pull_secrets: (!overlay.image_pull_secrets.is_empty())
                        .then(|| overlay.image_pull_secrets.clone()),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    })
}

pub struct WebUIActor;

#[async_trait]
impl Actor<WebUI> for WebUIActor {
    async fn observe(&self, ctx: &Context<WebUI>) -> Result<Option<Duration>> {
        let webui = ctx.obj.as_ref();
        let name = webui.name_any();
        let namespace = ctx.namespace()?;
        let labels = sub_resource_labels(&namespace, &name, COMPONENT_WEBUI);

        let svc_api: Api<Service> = ctx.api();
        kube_utils::ensure(
            &svc_api,
            &workload::service(
                workload::object_meta(
                    &service_name(&name),
                    &namespace,
                    labels.clone(),
                    kube_utils::owner_ref(webui),
                ),
                &labels,
                &[("http", WEBUI_PORT, WEBUI_PORT)],
                webui.spec.service_type.as_deref(),
                None,
            ),
        )
        .await?;
        let deploy_api: Api<Deployment> = ctx.api();
        let deploy = kube_utils::ensure(&deploy_api, &deployment(webui, &namespace, &labels)?).await?;

        let ready_replicas = deploy
            .status
            .as_ref()
            .and_then(|s| s.ready_replicas)
            .unwrap_or(0);
        let ready = ready_replicas >= webui.spec.pod_set.replicas;
        let now = Utc::now();
        let mut status = WebUIStatus {
            conditional: webui.status.clone().unwrap_or_default().conditional,
        };
        conditions::set(
            &mut status.conditional.conditions,
            CONDITION_READY,
            ready,
            if ready { "AllReady" } else { "RollingOut" },
            format!("{}/{} ready", ready_replicas, webui.spec.pod_set.replicas),
            now,
        );
        conditions::set(&mut status.conditional.conditions, CONDITION_SYNCED, true, "Synced", "", now);
        if Some(&status) != webui.status.as_ref() {
            ctx.patch_status(&status).await?;
        }
        Ok((!ready).then_some(ROLLOUT_POLL))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::proxyset::WebUISpec;

    #[test]
    fn test_deployment_exposes_dashboard() {
        let mut webui = WebUI::new("mo", WebUISpec::default());
        webui.metadata.namespace = Some("default".to_string());
        webui.spec.pod_set.replicas = 1;
        webui.spec.pod_set.image = Some("matrixorigin/dashboard:1.0.0".to_string());
        let labels = sub_resource_labels("default", "mo", COMPONENT_WEBUI);
        let d = deployment(&webui, "default", &labels).unwrap();
        assert_eq!(d.metadata.name.as_deref(), Some("mo-webui"));
        let spec = d.spec.unwrap();
        let container = &spec.template.spec.unwrap().containers[0];
        assert_eq!(container.ports.as_ref().unwrap()[0].container_port, 8007);
        assert_eq!(spec.selector.match_labels, Some(labels));
    }
}
