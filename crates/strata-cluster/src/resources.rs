//! Rendering of pods and services for a generation
//!
//! Names are derived from the generation id so that two generations of the
//! same cluster never collide:
//!
//! - head pod and head service: `<generation>-head`
//! - worker pod: `<generation>-worker-<group>-<ordinal>`
//! - serving service: `<cluster>-serve`

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, HTTPGetAction, Pod, PodSpec, Probe, ResourceRequirements,
    Service, ServicePort, ServiceSpec, TCPSocketAction,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::{Resource, ResourceExt};

use strata_common::crd::{ContainerTemplate, StrataCluster};
use strata_common::labels::{
    cluster_labels, head_selector, unit_labels, Role, ENDPOINT_LABEL, GENERATION_LABEL,
    IMMUTABLE_HASH_ANNOTATION, ROLE_LABEL, SERVING_ENDPOINT,
    TEMPLATE_HASH_ANNOTATION,
};

use crate::planner::PlannedEntry;

/// GPU extended resource name
pub const GPU_RESOURCE: &str = "nvidia.com/gpu";

/// Name of the head pod of a generation
pub fn head_pod_name(generation: &str) -> String {
    format!("{generation}-head")
}

/// Name of a worker pod
pub fn worker_pod_name(generation: &str, group: &str, ordinal: u32) -> String {
    format!("{generation}-worker-{group}-{ordinal}")
}

/// Name of the per-generation head service
pub fn head_service_name(generation: &str) -> String {
    format!("{generation}-head")
}

/// Name of the stable traffic endpoint of a cluster
pub fn serving_service_name(cluster: &str) -> String {
    format!("{cluster}-serve")
}

/// Stable DNS name workers use to reach their head
pub fn head_address(generation: &str, namespace: &str) -> String {
    format!("{}.{namespace}.svc", head_service_name(generation))
}

fn object_meta(
    cluster: &StrataCluster,
    name: String,
    labels: BTreeMap<String, String>,
    annotations: Option<BTreeMap<String, String>>,
) -> ObjectMeta {
    ObjectMeta {
        name: Some(name),
        namespace: cluster.namespace(),
        labels: Some(labels),
        annotations,
        owner_references: cluster.controller_owner_ref(&()).map(|r| vec![r]),
        ..Default::default()
    }
}

fn hash_annotations(entry: &PlannedEntry) -> BTreeMap<String, String> {
    BTreeMap::from([
        (
            TEMPLATE_HASH_ANNOTATION.to_string(),
            entry.template_hash.clone(),
        ),
        (
            IMMUTABLE_HASH_ANNOTATION.to_string(),
            entry.immutable_hash.clone(),
        ),
    ])
}

/// Render the pod for one unit of a generation
pub fn render_pod(
    cluster: &StrataCluster,
    generation: &str,
    entry: &PlannedEntry,
    name: String,
) -> Pod {
    let cluster_name = cluster.name_any();
    let namespace = cluster.namespace().unwrap_or_default();
    let labels = unit_labels(&cluster_name, generation, entry.role, &entry.group);

    let mut env: Vec<EnvVar> = entry
        .template
        .env
        .iter()
        .map(|(k, v)| env_var(k, v))
        .collect();
    env.extend([
        env_var("STRATA_CLUSTER", &cluster_name),
        env_var("STRATA_GENERATION", generation),
        env_var("STRATA_ROLE", entry.role.as_str()),
        env_var("STRATA_GROUP", &entry.group),
        env_var("STRATA_HEAD_ADDRESS", &head_address(generation, &namespace)),
    ]);

    Pod {
        metadata: object_meta(cluster, name, labels, Some(hash_annotations(entry))),
        spec: Some(PodSpec {
            containers: vec![container(entry.role, &entry.template, env)],
            restart_policy: Some("Always".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn env_var(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        ..Default::default()
    }
}

fn container(role: Role, template: &ContainerTemplate, env: Vec<EnvVar>) -> Container {
    let non_empty = |v: &Vec<String>| (!v.is_empty()).then(|| v.clone());
    Container {
        name: role.as_str().to_string(),
        image: Some(template.image.clone()),
        command: non_empty(&template.command),
        args: non_empty(&template.args),
        env: Some(env),
        ports: (!template.ports.is_empty()).then(|| {
            template
                .ports
                .iter()
                .map(|p| ContainerPort {
                    name: Some(p.name.clone()),
                    container_port: p.container_port,
                    protocol: Some("TCP".to_string()),
                    ..Default::default()
                })
                .collect()
        }),
        resources: template.resources.as_ref().map(|r| {
            let mut quantities = BTreeMap::new();
            if let Some(cpu) = &r.cpu {
                quantities.insert("cpu".to_string(), Quantity(cpu.clone()));
            }
            if let Some(memory) = &r.memory {
                quantities.insert("memory".to_string(), Quantity(memory.clone()));
            }
            if let Some(gpu) = &r.gpu {
                quantities.insert(GPU_RESOURCE.to_string(), Quantity(gpu.clone()));
            }
            ResourceRequirements {
                requests: Some(quantities.clone()),
                limits: Some(quantities),
                ..Default::default()
            }
        }),
        readiness_probe: template.readiness_probe.as_ref().map(|p| {
            let port = IntOrString::Int(p.port);
            let (http_get, tcp_socket) = match &p.path {
                Some(path) => (
                    Some(HTTPGetAction {
                        path: Some(path.clone()),
                        port,
                        ..Default::default()
                    }),
                    None,
                ),
                None => (
                    None,
                    Some(TCPSocketAction {
                        port,
                        ..Default::default()
                    }),
                ),
            };
            Probe {
                http_get,
                tcp_socket,
                initial_delay_seconds: Some(p.initial_delay_seconds),
                period_seconds: Some(p.period_seconds),
                ..Default::default()
            }
        }),
        ..Default::default()
    }
}

/// Copy of a running pod with only its image and template hash changed
pub fn with_image(pod: &Pod, entry: &PlannedEntry) -> Pod {
    let mut updated = pod.clone();
    if let Some(spec) = updated.spec.as_mut() {
        for c in spec.containers.iter_mut() {
            c.image = Some(entry.template.image.clone());
        }
    }
    updated
        .metadata
        .annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(
            TEMPLATE_HASH_ANNOTATION.to_string(),
            entry.template_hash.clone(),
        );
    updated
}

fn service_ports(template: &ContainerTemplate) -> Option<Vec<ServicePort>> {
    (!template.ports.is_empty()).then(|| {
        template
            .ports
            .iter()
            .map(|p| ServicePort {
                name: Some(p.name.clone()),
                port: p.container_port,
                target_port: Some(IntOrString::Int(p.container_port)),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            })
            .collect()
    })
}

/// Headless service giving a generation's head a stable address
pub fn render_head_service(
    cluster: &StrataCluster,
    generation: &str,
    head_template: &ContainerTemplate,
) -> Service {
    let cluster_name = cluster.name_any();
    let mut labels = cluster_labels(&cluster_name);
    labels.insert(GENERATION_LABEL.to_string(), generation.to_string());
    labels.insert(ROLE_LABEL.to_string(), Role::Head.as_str().to_string());

    Service {
        metadata: object_meta(cluster, head_service_name(generation), labels, None),
        spec: Some(ServiceSpec {
            cluster_ip: Some("None".to_string()),
            publish_not_ready_addresses: Some(true),
            selector: Some(head_selector(&cluster_name, generation)),
            ports: service_ports(head_template),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// The cluster's stable traffic endpoint, pointed at one generation's head
///
/// Carries no generation label: it outlives every generation. Without head
/// ports there is nothing to load-balance and the service is headless.
pub fn render_serving_service(
    cluster: &StrataCluster,
    generation: &str,
    head_template: &ContainerTemplate,
) -> Service {
    let cluster_name = cluster.name_any();
    let mut labels = cluster_labels(&cluster_name);
    labels.insert(ENDPOINT_LABEL.to_string(), SERVING_ENDPOINT.to_string());

    let ports = service_ports(head_template);
    let (type_, cluster_ip) = match ports {
        Some(_) => (Some("ClusterIP".to_string()), None),
        None => (None, Some("None".to_string())),
    };

    Service {
        metadata: object_meta(cluster, serving_service_name(&cluster_name), labels, None),
        spec: Some(ServiceSpec {
            type_,
            cluster_ip,
            selector: Some(head_selector(&cluster_name, generation)),
            ports,
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Generation a serving service currently selects
pub fn serving_target(service: &Service) -> Option<&str> {
    service
        .spec
        .as_ref()
        .and_then(|s| s.selector.as_ref())
        .and_then(|s| s.get(GENERATION_LABEL))
        .map(String::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::plan;
    use strata_common::crd::{
        GenerationSpec, PortSpec, ProbeSpec, ResourceSpec, StrataClusterSpec, WorkerGroupSpec,
    };

    fn cluster() -> StrataCluster {
        let mut c = StrataCluster::new(
            "train",
            StrataClusterSpec {
                head_template: ContainerTemplate {
                    image: "runtime:1".into(),
                    ports: vec![PortSpec {
                        name: "serve".into(),
                        container_port: 8000,
                    }],
                    ..Default::default()
                },
                worker_groups: vec![],
                upgrade_strategy: None,
                suspend: false,
            },
        );
        c.metadata.namespace = Some("ml".into());
        c.metadata.uid = Some("uid-1".into());
        c
    }

    fn worker_entry() -> PlannedEntry {
        let spec = GenerationSpec {
            head_template: cluster().spec.head_template,
            worker_groups: vec![WorkerGroupSpec {
                name: "gpu".into(),
                replicas: 1,
                min_replicas: 0,
                max_replicas: None,
                template: ContainerTemplate {
                    image: "runtime:1-gpu".into(),
                    resources: Some(ResourceSpec {
                        cpu: Some("4".into()),
                        memory: None,
                        gpu: Some("1".into()),
                    }),
                    readiness_probe: Some(ProbeSpec {
                        port: 8265,
                        path: Some("/healthz".into()),
                        initial_delay_seconds: 5,
                        period_seconds: 10,
                    }),
                    ..Default::default()
                },
                workers_to_delete: vec![],
            }],
        };
        plan(&spec).unwrap().group("gpu").unwrap().clone()
    }

    #[test]
    fn names_derive_from_generation() {
        assert_eq!(head_pod_name("train-g0"), "train-g0-head");
        assert_eq!(worker_pod_name("train-g0", "gpu", 2), "train-g0-worker-gpu-2");
        assert_eq!(serving_service_name("train"), "train-serve");
        assert_eq!(head_address("train-g1", "ml"), "train-g1-head.ml.svc");
    }

    #[test]
    fn worker_pod_carries_labels_hashes_and_head_address() {
        let entry = worker_entry();
        let pod = render_pod(&cluster(), "train-g0", &entry, worker_pod_name("train-g0", "gpu", 0));

        let labels = pod.labels();
        assert_eq!(labels.get(GENERATION_LABEL).unwrap(), "train-g0");
        assert_eq!(labels.get(ROLE_LABEL).unwrap(), "worker");
        assert_eq!(
            pod.annotations().get(TEMPLATE_HASH_ANNOTATION),
            Some(&entry.template_hash)
        );
        assert_eq!(pod.owner_references()[0].uid, "uid-1");

        let container = &pod.spec.as_ref().unwrap().containers[0];
        let env = container.env.as_ref().unwrap();
        let head = env.iter().find(|e| e.name == "STRATA_HEAD_ADDRESS").unwrap();
        assert_eq!(head.value.as_deref(), Some("train-g0-head.ml.svc"));

        let limits = container.resources.as_ref().unwrap().limits.as_ref().unwrap();
        assert_eq!(limits.get(GPU_RESOURCE), Some(&Quantity("1".into())));

        let probe = container.readiness_probe.as_ref().unwrap();
        assert_eq!(
            probe.http_get.as_ref().unwrap().path.as_deref(),
            Some("/healthz")
        );
    }

    #[test]
    fn image_update_keeps_everything_else() {
        let entry = worker_entry();
        let pod = render_pod(&cluster(), "train-g0", &entry, "p".into());
        let mut newer = entry.clone();
        newer.template.image = "runtime:2-gpu".into();
        newer.template_hash = "newhash".into();

        let updated = with_image(&pod, &newer);
        let spec = updated.spec.as_ref().unwrap();
        assert_eq!(spec.containers[0].image.as_deref(), Some("runtime:2-gpu"));
        assert_eq!(spec.containers[0].env, pod.spec.as_ref().unwrap().containers[0].env);
        assert_eq!(
            updated.annotations().get(TEMPLATE_HASH_ANNOTATION).unwrap(),
            "newhash"
        );
        assert_eq!(
            updated.annotations().get(IMMUTABLE_HASH_ANNOTATION),
            pod.annotations().get(IMMUTABLE_HASH_ANNOTATION)
        );
    }

    #[test]
    fn head_service_is_headless_and_publishes_unready() {
        let c = cluster();
        let svc = render_head_service(&c, "train-g0", &c.spec.head_template);
        let spec = svc.spec.as_ref().unwrap();
        assert_eq!(spec.cluster_ip.as_deref(), Some("None"));
        assert_eq!(spec.publish_not_ready_addresses, Some(true));
        assert_eq!(
            spec.selector.as_ref().unwrap().get(GENERATION_LABEL).unwrap(),
            "train-g0"
        );
    }

    #[test]
    fn serving_service_selects_one_generation() {
        let c = cluster();
        let svc = render_serving_service(&c, "train-g1", &c.spec.head_template);
        assert_eq!(serving_target(&svc), Some("train-g1"));
        assert_eq!(
            svc.labels().get(ENDPOINT_LABEL).map(String::as_str),
            Some(SERVING_ENDPOINT)
        );
        assert!(!svc.labels().contains_key(GENERATION_LABEL));
        assert_eq!(svc.spec.as_ref().unwrap().ports.as_ref().unwrap()[0].port, 8000);
    }
}
