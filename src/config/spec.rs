//! Configuration types for `infragraph.yaml`.
//!
//! The engine config names the datacenter definition to compile, the
//! optional environment and app graph to compile it for, where state lives,
//! and how plugins run.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use validator::Validate;

use crate::state::StateKey;

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Validate)]
pub struct EngineConfig {
    /// Datacenter to compile.
    #[validate(nested)]
    pub datacenter: DatacenterConfig,
    /// Environment to compile, if any.
    #[serde(default)]
    #[validate(nested)]
    pub environment: Option<EnvironmentConfig>,
    /// State backend.
    #[serde(default)]
    pub state: StateConfig,
    /// Plugin containers.
    #[serde(default)]
    pub plugins: PluginConfig,
    /// Executor settings.
    #[serde(default)]
    #[validate(nested)]
    pub execution: ExecutionConfig,
}

/// Datacenter section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Validate)]
pub struct DatacenterConfig {
    /// Datacenter name, exposed to definitions as `datacenter.name`.
    #[validate(length(min = 1, message = "datacenter name cannot be empty"))]
    pub name: String,
    /// Path of the datacenter definition (JSON or YAML).
    pub path: PathBuf,
    /// Variable values overriding declared defaults.
    #[serde(default)]
    pub variables: IndexMap<String, Value>,
}

/// Environment section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Validate)]
pub struct EnvironmentConfig {
    /// Environment name.
    #[validate(length(min = 1, message = "environment name cannot be empty"))]
    pub name: String,
    /// Path of the app graph produced by the component compiler.
    #[serde(default)]
    pub graph: Option<PathBuf>,
}

/// State backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct StateConfig {
    /// Backend type.
    #[serde(default)]
    pub backend: StateBackend,
    /// S3 bucket name (required for the s3 backend).
    #[serde(default)]
    pub bucket: Option<String>,
    /// S3 key prefix.
    #[serde(default)]
    pub prefix: Option<String>,
    /// S3 region, AWS default when unset.
    #[serde(default)]
    pub region: Option<String>,
    /// Base directory for the local backend.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// State backend types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    /// JSON files on disk.
    #[default]
    Local,
    /// Objects in an S3 bucket.
    S3,
}

impl std::str::FromStr for StateBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "s3" => Ok(Self::S3),
            other => Err(format!("unknown state backend '{other}', expected local or s3")),
        }
    }
}

/// Plugin container configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PluginConfig {
    /// Image prefix; images are named `<prefix><plugin>-plugin`.
    #[serde(default = "default_image_prefix")]
    pub image_prefix: String,
    /// Directory mounted into plugin containers.
    #[serde(default)]
    pub mount: Option<PathBuf>,
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            image_prefix: default_image_prefix(),
            mount: None,
        }
    }
}

/// Executor settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Validate)]
pub struct ExecutionConfig {
    /// Maximum number of modules applied at once.
    #[serde(default = "default_concurrency")]
    #[validate(range(min = 1, message = "concurrency must be at least 1"))]
    pub concurrency: usize,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
        }
    }
}

fn default_image_prefix() -> String {
    String::from("architectio/")
}

const fn default_concurrency() -> usize {
    1
}

impl EngineConfig {
    /// Creates a config for a datacenter definition with defaults elsewhere.
    #[must_use]
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            datacenter: DatacenterConfig {
                name: name.into(),
                path: path.into(),
                variables: IndexMap::new(),
            },
            environment: None,
            state: StateConfig::default(),
            plugins: PluginConfig::default(),
            execution: ExecutionConfig::default(),
        }
    }

    /// Name of the selected environment.
    #[must_use]
    pub fn environment_name(&self) -> Option<&str> {
        self.environment.as_ref().map(|env| env.name.as_str())
    }

    /// State key of the graph this config compiles.
    #[must_use]
    pub fn state_key(&self) -> StateKey {
        match self.environment_name() {
            Some(env) => StateKey::environment(&self.datacenter.name, env),
            None => StateKey::datacenter(&self.datacenter.name),
        }
    }

    /// Resolves relative paths against the directory holding the config.
    pub fn resolve_paths(&mut self, base: &Path) {
        let resolve = |path: &mut PathBuf| {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        };
        resolve(&mut self.datacenter.path);
        if let Some(graph) = self.environment.as_mut().and_then(|env| env.graph.as_mut()) {
            resolve(graph);
        }
        if let Some(path) = self.state.path.as_mut() {
            resolve(path);
        }
        if let Some(mount) = self.plugins.mount.as_mut() {
            resolve(mount);
        }
    }
}
