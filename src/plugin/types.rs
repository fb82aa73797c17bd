//! Wire types for the module plugin protocol.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Provisioning backend a module runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginKind {
    /// Pulumi programs.
    #[default]
    Pulumi,
    /// `OpenTofu` / Terraform modules.
    #[serde(alias = "terraform")]
    Opentofu,
}

impl PluginKind {
    /// Every known plugin kind.
    pub const ALL: [Self; 2] = [Self::Pulumi, Self::Opentofu];

    /// Lowercase name used in container names and images.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pulumi => "pulumi",
            Self::Opentofu => "opentofu",
        }
    }
}

impl fmt::Display for PluginKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PluginKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pulumi" => Ok(Self::Pulumi),
            "opentofu" | "terraform" => Ok(Self::Opentofu),
            other => Err(format!("unknown plugin: {other}")),
        }
    }
}

/// Request to build a module directory into an image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildRequest {
    /// Absolute path of the module source.
    pub directory: String,
}

/// Result of a build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildResponse {
    /// Built image reference.
    pub image: String,
}

/// Request to apply or destroy one module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyRequest {
    /// Graph id of the node being applied.
    pub plugin_id: String,
    /// Module image.
    pub image: String,
    /// Resolved inputs as `[key, value]` pairs.
    pub inputs: Vec<(String, Value)>,
    /// State from the previous apply.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<Value>,
    /// Destroy instead of apply.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub destroy: bool,
}

impl ApplyRequest {
    /// Flattens an inputs object into `[key, value]` pairs.
    ///
    /// Non-object inputs produce no pairs.
    #[must_use]
    pub fn input_pairs(inputs: &Value) -> Vec<(String, Value)> {
        inputs
            .as_object()
            .map(|fields| {
                fields
                    .iter()
                    .map(|(key, value)| (key.clone(), value.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Result of an apply.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ApplyResponse {
    /// Opaque provisioning state to pass back on the next apply.
    #[serde(default)]
    pub state: Option<Value>,
    /// Module outputs.
    #[serde(default)]
    pub outputs: Value,
}

/// Envelope sent to the plugin.
#[derive(Debug, Clone, Serialize)]
pub struct PluginCommand<'a, R: Serialize> {
    /// `build` or `apply`.
    pub command: &'a str,
    /// Command payload.
    pub request: &'a R,
}

/// Frame received from the plugin.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginMessage {
    /// Streamed log line.
    #[serde(default)]
    pub verbose_output: Option<String>,
    /// Terminal error.
    #[serde(default)]
    pub error: Option<Value>,
    /// Terminal result.
    #[serde(default)]
    pub result: Option<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_apply_request_wire_shape() {
        let request = ApplyRequest {
            plugin_id: "module/vpc@blue".to_string(),
            image: "registry/vpc:1".to_string(),
            inputs: ApplyRequest::input_pairs(&json!({ "name": "main", "cidr": "10.0.0.0/16" })),
            state: None,
            destroy: false,
        };
        let json = serde_json::to_value(PluginCommand {
            command: "apply",
            request: &request,
        })
        .expect("serialize");

        assert_eq!(json["command"], "apply");
        assert_eq!(json["request"]["pluginId"], "module/vpc@blue");
        assert_eq!(json["request"]["inputs"][0], json!(["cidr", "10.0.0.0/16"]));
        assert!(json["request"].get("destroy").is_none());
        assert!(json["request"].get("state").is_none());
    }

    #[test]
    fn test_plugin_message_variants() {
        let message: PluginMessage =
            serde_json::from_str(r#"{"verboseOutput":"creating vpc"}"#).expect("parse");
        assert_eq!(message.verbose_output.as_deref(), Some("creating vpc"));

        let message: PluginMessage =
            serde_json::from_str(r#"{"result":{"state":"s","outputs":{"id":"1"}}}"#).expect("parse");
        let response: ApplyResponse =
            serde_json::from_value(message.result.expect("result")).expect("response");
        assert_eq!(response.outputs["id"], "1");
    }

    #[test]
    fn test_plugin_kind_parsing() {
        assert_eq!("Terraform".parse::<PluginKind>(), Ok(PluginKind::Opentofu));
        assert_eq!(PluginKind::default().to_string(), "pulumi");
        assert!("ansible".parse::<PluginKind>().is_err());
    }
}
