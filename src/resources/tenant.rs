//! Tenant-level objects: quota, default limits, isolation policy, volumes.

use std::collections::BTreeMap;

use k8s_openapi::api::{
    core::v1::{
        LimitRange, LimitRangeItem, LimitRangeSpec, PersistentVolumeClaim,
        PersistentVolumeClaimSpec, ResourceQuota, ResourceQuotaSpec, VolumeResourceRequirements,
    },
    networking::v1::NetworkPolicy,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::ObjectMeta;
use serde_json::json;

use crate::error::Result;
use crate::helpers::ControlPlaneDefaults;

use super::tenant_labels;

pub const QUOTA_NAME: &str = "tenant-quota";
pub const LIMIT_RANGE_NAME: &str = "tenant-limits";
pub const ISOLATION_POLICY_NAME: &str = "tenant-isolation";
pub const HOME_VOLUME_CLAIM: &str = "home";
pub const BACKUP_VOLUME_CLAIM: &str = "backups";

fn tenant_meta(ns: &str, name: &str, user_id: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(ns.to_string()),
        labels: Some(tenant_labels(user_id)),
        ..Default::default()
    }
}

fn q(v: &str) -> Quantity {
    Quantity(v.to_string())
}

/// Hard CPU/RAM/pod/storage ceilings for one tenant.
pub fn build_quota(ns: &str, user_id: &str, defaults: &ControlPlaneDefaults) -> ResourceQuota {
    ResourceQuota {
        metadata: tenant_meta(ns, QUOTA_NAME, user_id),
        spec: Some(ResourceQuotaSpec {
            hard: Some(BTreeMap::from([
                ("requests.cpu".to_string(), q(&defaults.quota_cpu)),
                ("limits.cpu".to_string(), q(&defaults.quota_cpu)),
                ("requests.memory".to_string(), q(&defaults.quota_memory)),
                ("limits.memory".to_string(), q(&defaults.quota_memory)),
                ("pods".to_string(), q(&defaults.quota_pods)),
                ("requests.storage".to_string(), q(&defaults.quota_storage)),
            ])),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Container defaults so pods without explicit resources still fit the quota.
pub fn build_limit_range(ns: &str, user_id: &str) -> LimitRange {
    LimitRange {
        metadata: tenant_meta(ns, LIMIT_RANGE_NAME, user_id),
        spec: Some(LimitRangeSpec {
            limits: vec![LimitRangeItem {
                type_: "Container".to_string(),
                default: Some(BTreeMap::from([
                    ("cpu".to_string(), q("500m")),
                    ("memory".to_string(), q("512Mi")),
                ])),
                default_request: Some(BTreeMap::from([
                    ("cpu".to_string(), q("100m")),
                    ("memory".to_string(), q("128Mi")),
                ])),
                ..Default::default()
            }],
        }),
        ..Default::default()
    }
}

/// Deny everything except: traffic inside the tenant, traffic from the
/// router namespace, DNS resolution and egress to the database port.
pub fn build_isolation_policy(
    ns: &str,
    user_id: &str,
    defaults: &ControlPlaneDefaults,
) -> Result<NetworkPolicy> {
    let policy = json!({
        "apiVersion": "networking.k8s.io/v1",
        "kind": "NetworkPolicy",
        "metadata": tenant_meta(ns, ISOLATION_POLICY_NAME, user_id),
        "spec": {
            "podSelector": {},
            "policyTypes": ["Ingress", "Egress"],
            "ingress": [{
                "from": [
                    { "podSelector": {} },
                    { "namespaceSelector": { "matchLabels": {
                        "kubernetes.io/metadata.name": defaults.router_namespace,
                    } } },
                ],
            }],
            "egress": [
                { "ports": [
                    { "protocol": "UDP", "port": 53 },
                    { "protocol": "TCP", "port": 53 },
                ] },
                { "ports": [ { "protocol": "TCP", "port": defaults.database_port } ] },
            ],
        },
    });
    Ok(serde_json::from_value(policy)?)
}

/// A ReadWriteMany claim shared by every workload/job in the tenant.
pub fn build_shared_volume(
    ns: &str,
    name: &str,
    user_id: &str,
    size: &str,
    storage_class: &str,
) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: tenant_meta(ns, name, user_id),
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteMany".to_string()]),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([("storage".to_string(), q(size))])),
                ..Default::default()
            }),
            storage_class_name: Some(storage_class.to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}
