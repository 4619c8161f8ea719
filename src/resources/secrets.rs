//! Credential object builders.

use std::collections::BTreeMap;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::api::ObjectMeta;
use serde_json::json;

/// Opaque secret holding plain string values. Values go into `data` (not
/// `stringData`) so a read-back can be compared byte for byte.
pub fn opaque_secret(
    ns: &str,
    name: &str,
    labels: BTreeMap<String, String>,
    values: &BTreeMap<String, String>,
) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(ns.to_string()),
            labels: Some(labels),
            ..Default::default()
        },
        type_: Some("Opaque".to_string()),
        data: Some(
            values
                .iter()
                .map(|(k, v)| (k.clone(), ByteString(v.as_bytes().to_vec())))
                .collect(),
        ),
        ..Default::default()
    }
}

/// Registry credentials in the `kubernetes.io/dockerconfigjson` format.
pub fn registry_secret(
    ns: &str,
    name: &str,
    labels: BTreeMap<String, String>,
    server: &str,
    username: &str,
    password: &str,
) -> Secret {
    let auth = STANDARD.encode(format!("{username}:{password}"));
    let mut auths = serde_json::Map::new();
    auths.insert(
        server.to_string(),
        json!({ "username": username, "password": password, "auth": auth }),
    );
    let config = json!({ "auths": auths });
    Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(ns.to_string()),
            labels: Some(labels),
            ..Default::default()
        },
        type_: Some("kubernetes.io/dockerconfigjson".to_string()),
        data: Some(BTreeMap::from([(
            ".dockerconfigjson".to_string(),
            ByteString(config.to_string().into_bytes()),
        )])),
        ..Default::default()
    }
}

/// Decode a secret's data into strings (lossy UTF-8).
pub fn secret_values(secret: &Secret) -> BTreeMap<String, String> {
    secret
        .data
        .as_ref()
        .map(|data| {
            data.iter()
                .map(|(k, v)| (k.clone(), String::from_utf8_lossy(&v.0).to_string()))
                .collect()
        })
        .unwrap_or_default()
}
