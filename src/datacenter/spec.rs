//! Datacenter definition types.
//!
//! A datacenter is parsed from JSON or YAML into a nested document with
//! `variable`, `module` and `environment` blocks. The document carries an
//! optional `version` discriminator; a missing version means `v1`.

use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::error::{CompileError, PluginError};
use crate::plugin::{ModuleBuilder, PluginKind};
use crate::variables::VariableMetadata;

/// A versioned datacenter definition.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "version")]
pub enum DatacenterSpec {
    /// First schema version.
    #[serde(rename = "v1")]
    V1(DatacenterV1),
}

impl DatacenterSpec {
    /// Parses a definition document, dispatching on its `version` field.
    ///
    /// # Errors
    ///
    /// Returns [`CompileError::UnsupportedVersion`] for unknown versions and
    /// [`CompileError::InvalidDefinition`] if the document does not match
    /// the schema.
    pub fn from_value(mut value: Value) -> Result<Self, CompileError> {
        let version = match value.as_object_mut().and_then(|doc| doc.remove("version")) {
            None | Some(Value::Null) => "v1".to_string(),
            Some(Value::String(version)) => version,
            Some(other) => other.to_string(),
        };

        match version.as_str() {
            "v1" => serde_json::from_value(value)
                .map(Self::V1)
                .map_err(|e| CompileError::invalid(e.to_string())),
            _ => Err(CompileError::UnsupportedVersion { version }),
        }
    }

    /// Schema version name.
    #[must_use]
    pub const fn version(&self) -> &'static str {
        match self {
            Self::V1(_) => "v1",
        }
    }

    /// Replaces every module whose source is a local directory with the
    /// image built from it.
    ///
    /// Relative directories are resolved against `base_dir`. Returns the
    /// number of modules built.
    ///
    /// # Errors
    ///
    /// Returns the first build failure.
    pub async fn build_modules(
        &mut self,
        builder: &dyn ModuleBuilder,
        base_dir: &Path,
    ) -> Result<usize, PluginError> {
        match self {
            Self::V1(datacenter) => datacenter.build_modules(builder, base_dir).await,
        }
    }
}

impl<'de> Deserialize<'de> for DatacenterSpec {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Self::from_value(value).map_err(serde::de::Error::custom)
    }
}

/// Version 1 datacenter.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DatacenterV1 {
    /// Declared variables.
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub variable: IndexMap<String, VariableMetadata>,
    /// Modules created once per datacenter.
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub module: IndexMap<String, ModuleSpec>,
    /// Environment blocks, merged in declared order.
    #[serde(
        default,
        deserialize_with = "one_or_many",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub environment: Vec<EnvironmentSpec>,
}

impl DatacenterV1 {
    /// Modules declared in every place a module can be declared.
    fn modules_mut(&mut self) -> impl Iterator<Item = &mut ModuleSpec> {
        let root = self.module.values_mut();
        let environment = self.environment.iter_mut().flat_map(|env| {
            let hooks = env
                .hooks
                .values_mut()
                .flat_map(|hooks| hooks.iter_mut())
                .flat_map(|hook| hook.module.values_mut());
            env.module.values_mut().chain(hooks)
        });
        root.chain(environment)
    }

    async fn build_modules(
        &mut self,
        builder: &dyn ModuleBuilder,
        base_dir: &Path,
    ) -> Result<usize, PluginError> {
        let mut built = 0;
        for module in self.modules_mut() {
            let Some(directory) = module.local_directory(base_dir) else {
                continue;
            };
            info!("Building {} module from {}", module.plugin, directory.display());
            module.source = builder.build(module.plugin, &directory).await?;
            built += 1;
        }
        Ok(built)
    }
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<EnvironmentSpec>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(EnvironmentSpec),
        Many(Vec<EnvironmentSpec>),
    }

    Ok(match Option::<OneOrMany>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(OneOrMany::One(env)) => vec![env],
        Some(OneOrMany::Many(envs)) => envs,
    })
}

/// One declared module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleSpec {
    /// Image, or a local directory to build one from.
    pub source: String,
    /// Provisioning backend.
    #[serde(default)]
    pub plugin: PluginKind,
    /// Module inputs.
    #[serde(default = "empty_object")]
    pub inputs: Value,
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

impl ModuleSpec {
    /// Creates a pulumi module with no inputs.
    #[must_use]
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            plugin: PluginKind::default(),
            inputs: empty_object(),
        }
    }

    /// Sets the inputs.
    #[must_use]
    pub fn with_inputs(mut self, inputs: Value) -> Self {
        self.inputs = inputs;
        self
    }

    /// The source as a directory, if it names one that exists.
    #[must_use]
    pub fn local_directory(&self, base_dir: &Path) -> Option<PathBuf> {
        let looks_local = self.source.starts_with("./")
            || self.source.starts_with("../")
            || Path::new(&self.source).is_absolute();
        if !looks_local {
            return None;
        }
        let path = base_dir.join(&self.source);
        path.is_dir().then_some(path)
    }
}

/// One `environment` block.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EnvironmentSpec {
    /// Modules created once per environment.
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub module: IndexMap<String, ModuleSpec>,
    /// Resource hooks keyed by app resource type, in declared order.
    #[serde(flatten)]
    pub hooks: IndexMap<String, Vec<ResourceHook>>,
}

/// Maps app nodes of one resource type to modules.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ResourceHook {
    /// Guard over `node.*` and `environment.*`; must evaluate to a boolean.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<Value>,
    /// Modules instantiated once per matching app node.
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub module: IndexMap<String, ModuleSpec>,
    /// Values handed to app nodes that depend on the matched node.
    #[serde(default)]
    pub outputs: Value,
}

/// Options for [`DatacenterCompiler::get_graph`].
#[derive(Debug, Clone, Default)]
pub struct GetGraphOptions {
    /// Name of the datacenter being compiled.
    pub datacenter_name: String,
    /// Environment to compile environment modules and hooks for.
    pub environment_name: Option<String>,
    /// Variable values overriding declared defaults.
    pub variables: IndexMap<String, Value>,
}

impl GetGraphOptions {
    /// Options for a datacenter without environment.
    #[must_use]
    pub fn new(datacenter_name: impl Into<String>) -> Self {
        Self {
            datacenter_name: datacenter_name.into(),
            ..Self::default()
        }
    }

    /// Targets an environment.
    #[must_use]
    pub fn with_environment(mut self, environment_name: impl Into<String>) -> Self {
        self.environment_name = Some(environment_name.into());
        self
    }

    /// Sets a variable value.
    #[must_use]
    pub fn with_variable(mut self, name: impl Into<String>, value: Value) -> Self {
        self.variables.insert(name.into(), value);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    #[test]
    fn test_missing_version_defaults_to_v1() {
        let spec: DatacenterSpec = serde_json::from_value(json!({
            "module": { "vpc": { "source": "acme/vpc:1", "inputs": { "name": "main" } } }
        }))
        .expect("parses");
        assert_eq!(spec.version(), "v1");

        let DatacenterSpec::V1(dc) = spec;
        assert_eq!(dc.module["vpc"].plugin, PluginKind::Pulumi);
    }

    #[test]
    fn test_unsupported_version() {
        let err = DatacenterSpec::from_value(json!({ "version": "v9" })).expect_err("rejected");
        assert!(matches!(err, CompileError::UnsupportedVersion { version } if version == "v9"));
    }

    #[test]
    fn test_environment_block_shapes() {
        let single: DatacenterV1 = serde_json::from_value(json!({
            "environment": {
                "module": { "ns": { "source": "acme/ns" } },
                "database": [{ "when": "node.inputs.databaseType == 'postgres'", "outputs": {} }]
            }
        }))
        .expect("single block");
        assert_eq!(single.environment.len(), 1);
        assert_eq!(single.environment[0].hooks["database"].len(), 1);
        assert!(single.environment[0].module.contains_key("ns"));

        let many: DatacenterV1 = serde_json::from_value(json!({
            "environment": [{ "module": {} }, { "service": [] }]
        }))
        .expect("repeated blocks");
        assert_eq!(many.environment.len(), 2);
    }

    #[test]
    fn test_serializes_with_version_tag() {
        let spec = DatacenterSpec::V1(DatacenterV1::default());
        assert_eq!(serde_json::to_value(&spec).expect("serialize"), json!({ "version": "v1" }));
    }

    struct RecordingBuilder {
        built: Mutex<Vec<PathBuf>>,
    }

    #[async_trait]
    impl ModuleBuilder for RecordingBuilder {
        async fn build(&self, plugin: PluginKind, directory: &Path) -> Result<String, PluginError> {
            self.built.lock().expect("lock").push(directory.to_path_buf());
            Ok(format!("{plugin}-built:latest"))
        }
    }

    #[tokio::test]
    async fn test_build_modules_replaces_local_sources() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        std::fs::create_dir(dir.path().join("vpc")).expect("module dir");

        let mut spec = DatacenterSpec::from_value(json!({
            "module": {
                "vpc": { "source": "./vpc" },
                "dns": { "source": "acme/dns:2" }
            },
            "environment": {
                "database": [{ "module": { "db": { "source": "./missing", "plugin": "opentofu" } } }]
            }
        }))
        .expect("parses");

        let builder = RecordingBuilder {
            built: Mutex::new(Vec::new()),
        };
        let built = spec.build_modules(&builder, dir.path()).await.expect("builds");
        assert_eq!(built, 1);

        let DatacenterSpec::V1(dc) = spec;
        assert_eq!(dc.module["vpc"].source, "pulumi-built:latest");
        assert_eq!(dc.module["dns"].source, "acme/dns:2");
        assert_eq!(builder.built.lock().expect("lock").len(), 1);
    }
}
