//! Output fields a resource hook must provide per resource type.

use serde_json::Value;

/// Required output fields for `resource_type`. Unknown types require none.
#[must_use]
pub fn required_outputs(resource_type: &str) -> &'static [&'static str] {
    match resource_type {
        "database" => &[
            "protocol", "host", "port", "name", "url", "account", "username", "password",
        ],
        "databaseCluster" => &["protocol", "host", "port", "username", "password"],
        "databaseSize" | "databaseVersion" => &["databaseType", "databaseVersion"],
        "databaseUser" => &[
            "protocol", "host", "port", "database", "username", "password", "url",
        ],
        "dnsRecord" => &["name", "data", "recordType", "managedZone"],
        "dnsZone" => &["name", "nameservers"],
        "ingressRule" => &["host", "port", "url", "path", "loadBalancerHostname"],
        "kubernetesCluster" => &["name", "vpc", "kubernetesVersion", "configPath"],
        "kubernetesVersion" | "module" | "region" => &["name"],
        "secret" => &["data"],
        "service" => &[
            "account", "host", "name", "port", "protocol", "target_port", "url",
        ],
        "vpc" => &["name", "region"],
        _ => &[],
    }
}

/// Required fields of `resource_type` that `outputs` lacks.
///
/// A non-object `outputs` lacks every field.
#[must_use]
pub fn missing_outputs(resource_type: &str, outputs: &Value) -> Vec<String> {
    required_outputs(resource_type)
        .iter()
        .filter(|field| outputs.get(**field).is_none_or(Value::is_null))
        .map(|field| (*field).to_string())
        .collect()
}
