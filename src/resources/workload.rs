//! Compute unit, network endpoint and public route for one site.

use std::collections::BTreeMap;

use k8s_openapi::api::{
    apps::v1::{Deployment, DeploymentSpec, DeploymentStrategy},
    core::v1::{
        Container, ContainerPort, EnvFromSource, LocalObjectReference,
        PersistentVolumeClaimVolumeSource, PodSecurityContext, PodSpec, PodTemplateSpec, Probe,
        ResourceRequirements, SecretEnvSource, Service, ServicePort, ServiceSpec,
        TCPSocketAction, Volume, VolumeMount,
    },
    networking::v1::{
        HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
        IngressServiceBackend, IngressSpec, IngressTLS, ServiceBackendPort,
    },
};
use k8s_openapi::apimachinery::pkg::{apis::meta::v1::LabelSelector, util::intstr::IntOrString};
use kube::api::ObjectMeta;

use super::{
    cpu_quantity, db_secret_name, deployment_name, memory_quantity, route_name, service_name,
    site_labels, tls_secret_name, LABEL_SITE_SLUG, LABEL_TENANT_ID,
};
use super::tenant::HOME_VOLUME_CLAIM;

pub const ANN_ENTRYPOINTS: &str = "traefik.ingress.kubernetes.io/router.entrypoints";
pub const ANN_ROUTER_TLS: &str = "traefik.ingress.kubernetes.io/router.tls";
pub const ANN_CLUSTER_ISSUER: &str = "cert-manager.io/cluster-issuer";

/// Desired shape of one site's workload.
#[derive(Clone, Debug, PartialEq)]
pub struct SiteWorkloadSpec {
    pub namespace: String,
    pub slug: String,
    pub host: String,
    pub image: String,
    pub port: i32,
    pub cpu: f64,
    pub ram_gi: f64,
    pub tls_enabled: bool,
    pub tls_issuer: String,
    /// Allow the image to run as root; otherwise `runAsNonRoot` is enforced.
    pub run_as_root: bool,
    pub pull_secret: Option<String>,
    pub user_id: Option<String>,
    pub ingress_class: Option<String>,
}

impl SiteWorkloadSpec {
    fn labels(&self) -> BTreeMap<String, String> {
        site_labels(&self.slug, self.user_id.as_deref())
    }

    fn meta(&self, name: String) -> ObjectMeta {
        ObjectMeta {
            name: Some(name),
            namespace: Some(self.namespace.clone()),
            labels: Some(self.labels()),
            ..Default::default()
        }
    }
}

/// Resource requests/limits for a site container. Requests equal limits so
/// the tenant quota accounts for exactly what the site may use.
pub fn site_resources(cpu: f64, ram_gi: f64) -> ResourceRequirements {
    let amounts = BTreeMap::from([
        ("cpu".to_string(), cpu_quantity(cpu)),
        ("memory".to_string(), memory_quantity(ram_gi)),
    ]);
    ResourceRequirements {
        requests: Some(amounts.clone()),
        limits: Some(amounts),
        ..Default::default()
    }
}

pub fn build_deployment(spec: &SiteWorkloadSpec) -> Deployment {
    let selector = BTreeMap::from([(LABEL_SITE_SLUG.to_string(), spec.slug.clone())]);
    let tcp_probe = |initial_delay: i32| Probe {
        tcp_socket: Some(TCPSocketAction {
            port: IntOrString::Int(spec.port),
            ..Default::default()
        }),
        initial_delay_seconds: Some(initial_delay),
        period_seconds: Some(10),
        timeout_seconds: Some(3),
        failure_threshold: Some(3),
        ..Default::default()
    };

    Deployment {
        metadata: spec.meta(deployment_name(&spec.slug)),
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(selector),
                ..Default::default()
            },
            strategy: Some(DeploymentStrategy {
                type_: Some("Recreate".to_string()),
                ..Default::default()
            }),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(spec.labels()),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    image_pull_secrets: spec
                        .pull_secret
                        .as_ref()
                        .map(|name| vec![LocalObjectReference { name: name.clone() }]),
                    security_context: Some(PodSecurityContext {
                        run_as_non_root: Some(!spec.run_as_root),
                        fs_group: Some(101),
                        ..Default::default()
                    }),
                    volumes: Some(vec![Volume {
                        name: "home".to_string(),
                        persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                            claim_name: HOME_VOLUME_CLAIM.to_string(),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }]),
                    containers: vec![Container {
                        name: "web".to_string(),
                        image: Some(spec.image.clone()),
                        image_pull_policy: Some("IfNotPresent".to_string()),
                        ports: Some(vec![ContainerPort {
                            name: Some("http".to_string()),
                            container_port: spec.port,
                            ..Default::default()
                        }]),
                        env_from: Some(vec![EnvFromSource {
                            secret_ref: Some(SecretEnvSource {
                                name: db_secret_name(&spec.slug),
                                optional: Some(true),
                            }),
                            ..Default::default()
                        }]),
                        volume_mounts: Some(vec![VolumeMount {
                            name: "home".to_string(),
                            mount_path: "/srv/data".to_string(),
                            sub_path: Some(format!("sites/{}", spec.slug)),
                            ..Default::default()
                        }]),
                        resources: Some(site_resources(spec.cpu, spec.ram_gi)),
                        readiness_probe: Some(tcp_probe(5)),
                        liveness_probe: Some(tcp_probe(30)),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn build_service(spec: &SiteWorkloadSpec) -> Service {
    Service {
        metadata: spec.meta(service_name(&spec.slug)),
        spec: Some(ServiceSpec {
            selector: Some(BTreeMap::from([(
                LABEL_SITE_SLUG.to_string(),
                spec.slug.clone(),
            )])),
            type_: Some("ClusterIP".to_string()),
            ports: Some(vec![ServicePort {
                name: Some("http".to_string()),
                port: 80,
                target_port: Some(IntOrString::Int(spec.port)),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn build_ingress(spec: &SiteWorkloadSpec) -> Ingress {
    let backend = IngressBackend {
        service: Some(IngressServiceBackend {
            name: service_name(&spec.slug),
            port: Some(ServiceBackendPort {
                number: Some(80),
                ..Default::default()
            }),
        }),
        ..Default::default()
    };
    let mut ing = Ingress {
        metadata: spec.meta(route_name(&spec.slug)),
        spec: Some(IngressSpec {
            ingress_class_name: spec.ingress_class.clone(),
            rules: Some(vec![IngressRule {
                host: Some(spec.host.clone()),
                http: Some(HTTPIngressRuleValue {
                    paths: vec![HTTPIngressPath {
                        path: Some("/".to_string()),
                        path_type: "Prefix".to_string(),
                        backend,
                    }],
                }),
            }]),
            ..Default::default()
        }),
        ..Default::default()
    };
    apply_route_tls(&mut ing, &spec.slug, &spec.host, spec.tls_enabled, &spec.tls_issuer);
    ing
}

/// Switch a route between plain HTTP and TLS. Used both at build time and
/// when the TLS add-on toggles an existing route in place.
pub fn apply_route_tls(ing: &mut Ingress, slug: &str, host: &str, enabled: bool, issuer: &str) {
    let annotations = ing.metadata.annotations.get_or_insert_with(BTreeMap::new);
    if enabled {
        annotations.insert(ANN_ENTRYPOINTS.to_string(), "websecure".to_string());
        annotations.insert(ANN_ROUTER_TLS.to_string(), "true".to_string());
        annotations.insert(ANN_CLUSTER_ISSUER.to_string(), issuer.to_string());
    } else {
        annotations.insert(ANN_ENTRYPOINTS.to_string(), "web".to_string());
        annotations.remove(ANN_ROUTER_TLS);
        annotations.remove(ANN_CLUSTER_ISSUER);
    }
    if let Some(spec) = ing.spec.as_mut() {
        spec.tls = enabled.then(|| {
            vec![IngressTLS {
                hosts: Some(vec![host.to_string()]),
                secret_name: Some(tls_secret_name(slug)),
            }]
        });
    }
}

/// Rewrite the resource block of a live Deployment's containers in place.
pub fn set_deployment_resources(dep: &mut Deployment, cpu: f64, ram_gi: f64) {
    let Some(pod) = dep.spec.as_mut().and_then(|s| s.template.spec.as_mut()) else {
        return;
    };
    for container in &mut pod.containers {
        container.resources = Some(site_resources(cpu, ram_gi));
    }
}

/// Recover `(slug, tenant id)` from a compute unit's identifying labels.
pub fn parse_workload_identity(dep: &Deployment) -> Option<(String, Option<String>)> {
    let labels = dep.metadata.labels.as_ref()?;
    let slug = labels.get(LABEL_SITE_SLUG)?.clone();
    Some((slug, labels.get(LABEL_TENANT_ID).cloned()))
}

/// Ready replica count reported by a live Deployment.
pub fn ready_replicas(dep: &Deployment) -> i32 {
    dep.status
        .as_ref()
        .and_then(|s| s.ready_replicas)
        .unwrap_or(0)
}
