//! Loading of the engine config and of the documents it points at.
//!
//! Precedence, lowest first: file values, then `INFRAGRAPH_*` environment
//! variables. A `.env` file next to the config, then the per-user one, are
//! loaded into the environment first.

use std::path::{Path, PathBuf};
use tracing::{debug, info};

use serde::de::DeserializeOwned;
use serde_json::Value;

use super::spec::{EngineConfig, EnvironmentConfig};
use crate::datacenter::DatacenterSpec;
use crate::error::{ConfigError, Result};
use crate::graph::AppGraph;

/// Default configuration file names to search for.
pub const DEFAULT_CONFIG_FILES: &[&str] = &["infragraph.yaml", "infragraph.yml"];

/// Prefix of environment overrides.
pub const ENV_PREFIX: &str = "INFRAGRAPH_";

/// Configuration parser.
#[derive(Debug, Default)]
pub struct ConfigParser {
    base_path: Option<PathBuf>,
}

impl ConfigParser {
    /// Creates a new configuration parser.
    #[must_use]
    pub const fn new() -> Self {
        Self { base_path: None }
    }

    /// Sets the directory `.env` is loaded from.
    #[must_use]
    pub fn with_base_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.base_path = Some(path.into());
        self
    }

    /// Loads a config file and resolves its relative paths.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<EngineConfig> {
        let path = path.as_ref();
        info!("Loading configuration from: {}", path.display());

        let content = read(path)?;
        let mut config = self.parse_yaml(&content, Some(path))?;
        if let Some(dir) = path.parent() {
            config.resolve_paths(dir);
        }
        Ok(config)
    }

    /// Parses a config from YAML.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is invalid.
    pub fn parse_yaml(&self, content: &str, source: Option<&Path>) -> Result<EngineConfig> {
        let config: EngineConfig = serde_yaml::from_str(content).map_err(|e| ConfigError::ParseError {
            message: format!("YAML parse error: {e}"),
            location: source.map(|p| p.display().to_string()),
        })?;
        debug!("Parsed configuration for datacenter: {}", config.datacenter.name);
        Ok(config)
    }

    /// Loads `.env`, the config file, then applies environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or an override
    /// has an invalid value.
    pub fn load_with_env(&self, path: impl AsRef<Path>) -> Result<EngineConfig> {
        self.load_dotenv()?;
        let mut config = self.load_file(path)?;
        apply_overrides(&mut config, |name| std::env::var(name).ok())?;
        Ok(config)
    }

    /// Loads the `.env` file if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be loaded.
    pub fn load_dotenv(&self) -> Result<()> {
        let env_path = self
            .base_path
            .as_ref()
            .map_or_else(|| PathBuf::from(".env"), |p| p.join(".env"));

        if env_path.exists() {
            info!("Loading environment from: {}", env_path.display());
            dotenvy::from_path(&env_path).map_err(|e| ConfigError::ParseError {
                message: format!("Failed to load .env file: {e}"),
                location: Some(env_path.display().to_string()),
            })?;
        } else {
            debug!(".env file not found at: {}", env_path.display());
        }

        // Project values win; dotenvy never overwrites variables already set.
        if let Some(user_env) = user_env_file().filter(|path| path.exists()) {
            debug!("Loading user environment from: {}", user_env.display());
            dotenvy::from_path(&user_env).map_err(|e| ConfigError::ParseError {
                message: format!("Failed to load .env file: {e}"),
                location: Some(user_env.display().to_string()),
            })?;
        }
        Ok(())
    }
}

/// Per-user `.env`, e.g. `~/.config/infragraph/.env` on Linux.
#[must_use]
pub fn user_env_file() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("infragraph").join(".env"))
}

/// Applies `INFRAGRAPH_*` overrides read through `lookup`.
///
/// # Errors
///
/// Returns a validation error for unparsable values.
pub fn apply_overrides(
    config: &mut EngineConfig,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<()> {
    let var = |key: &str| lookup(&format!("{ENV_PREFIX}{key}"));

    if let Some(name) = var("DATACENTER") {
        debug!("Overriding datacenter.name from environment");
        config.datacenter.name = name;
    }
    if let Some(name) = var("ENVIRONMENT") {
        debug!("Overriding environment.name from environment");
        match config.environment.as_mut() {
            Some(env) => env.name = name,
            None => config.environment = Some(EnvironmentConfig { name, graph: None }),
        }
    }
    if let Some(concurrency) = var("CONCURRENCY") {
        config.execution.concurrency = concurrency.parse().map_err(|_| {
            ConfigError::validation(
                format!("invalid {ENV_PREFIX}CONCURRENCY '{concurrency}'"),
                "execution.concurrency",
            )
        })?;
    }
    if let Some(backend) = var("STATE_BACKEND") {
        config.state.backend = backend
            .parse()
            .map_err(|message: String| ConfigError::validation(message, "state.backend"))?;
    }
    if let Some(bucket) = var("STATE_BUCKET") {
        config.state.bucket = Some(bucket);
    }
    if let Some(prefix) = var("STATE_PREFIX") {
        config.state.prefix = Some(prefix);
    }
    Ok(())
}

/// Finds the configuration file in `start_dir` or one of its parents.
///
/// # Errors
///
/// Returns an error if no configuration file is found.
pub fn find_config_file(start_dir: impl AsRef<Path>) -> Result<PathBuf> {
    let start = start_dir.as_ref();
    let mut current = start.to_path_buf();

    loop {
        for filename in DEFAULT_CONFIG_FILES {
            let config_path = current.join(filename);
            if config_path.exists() {
                info!("Found configuration file: {}", config_path.display());
                return Ok(config_path);
            }
        }
        if !current.pop() {
            break;
        }
    }

    Err(ConfigError::FileNotFound {
        path: start.join(DEFAULT_CONFIG_FILES[0]),
    }
    .into())
}

/// Loads a datacenter definition from JSON or YAML.
///
/// # Errors
///
/// Returns a config error if the file cannot be read, and a compile error if
/// it does not match the definition schema.
pub fn load_datacenter(path: &Path) -> Result<DatacenterSpec> {
    let value: Value = load_document(path)?;
    Ok(DatacenterSpec::from_value(value)?)
}

/// Loads an app graph from JSON or YAML.
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed.
pub fn load_app_graph(path: &Path) -> Result<AppGraph> {
    load_document(path)
}

/// Reads a document, choosing the format from the extension.
fn load_document<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = read(path)?;
    let parse_error = |message: String| ConfigError::ParseError {
        message,
        location: Some(path.display().to_string()),
    };

    match path.extension().and_then(|ext| ext.to_str()) {
        Some("json") => serde_json::from_str(&content).map_err(|e| parse_error(e.to_string()).into()),
        Some("yml" | "yaml") => {
            serde_yaml::from_str(&content).map_err(|e| parse_error(e.to_string()).into())
        }
        _ => Err(ConfigError::UnsupportedFormat {
            path: path.to_path_buf(),
        }
        .into()),
    }
}

fn read(path: &Path) -> Result<String> {
    if !path.exists() {
        return Err(ConfigError::FileNotFound {
            path: path.to_path_buf(),
        }
        .into());
    }
    std::fs::read_to_string(path).map_err(|e| {
        ConfigError::ParseError {
            message: format!("Failed to read file: {e}"),
            location: Some(path.display().to_string()),
        }
        .into()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StateBackend;
    use crate::error::InfraError;
    use std::collections::HashMap;
    use tempfile::TempDir;

    const MINIMAL: &str = r"
datacenter:
  name: aws
  path: datacenter.yml
";

    #[test]
    fn test_parse_minimal_config() {
        let config = ConfigParser::new().parse_yaml(MINIMAL, None).expect("parses");
        assert_eq!(config.datacenter.name, "aws");
        assert_eq!(config.state.backend, StateBackend::Local);
        assert_eq!(config.execution.concurrency, 1);
        assert_eq!(config.plugins.image_prefix, "architectio/");
        assert!(config.environment.is_none());
    }

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
datacenter:
  name: aws
  path: ./dc/datacenter.yml
  variables:
    region: us-east-2
environment:
  name: prod
  graph: ./graph.json
state:
  backend: s3
  bucket: infra-state
  prefix: teams/platform
plugins:
  image_prefix: "registry.local/"
execution:
  concurrency: 4
"#;
        let config = ConfigParser::new().parse_yaml(yaml, None).expect("parses");
        assert_eq!(config.environment_name(), Some("prod"));
        assert_eq!(config.state.bucket.as_deref(), Some("infra-state"));
        assert_eq!(config.datacenter.variables["region"], "us-east-2");
        assert_eq!(config.execution.concurrency, 4);
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("INFRAGRAPH_ENVIRONMENT", "staging"),
            ("INFRAGRAPH_CONCURRENCY", "8"),
            ("INFRAGRAPH_STATE_BACKEND", "s3"),
            ("INFRAGRAPH_STATE_BUCKET", "bucket"),
        ]
        .into_iter()
        .collect();

        let mut config = ConfigParser::new().parse_yaml(MINIMAL, None).expect("parses");
        apply_overrides(&mut config, |name| vars.get(name).map(ToString::to_string)).expect("applies");

        assert_eq!(config.environment_name(), Some("staging"));
        assert_eq!(config.execution.concurrency, 8);
        assert_eq!(config.state.backend, StateBackend::S3);
        assert_eq!(config.state.bucket.as_deref(), Some("bucket"));
    }

    #[test]
    fn test_invalid_override() {
        let mut config = ConfigParser::new().parse_yaml(MINIMAL, None).expect("parses");
        let err = apply_overrides(&mut config, |name| {
            (name == "INFRAGRAPH_CONCURRENCY").then(|| "many".to_string())
        })
        .expect_err("rejected");
        assert!(matches!(err, InfraError::Config(ConfigError::ValidationError { .. })));
    }

    #[test]
    fn test_find_config_in_parent() {
        let temp = TempDir::new().expect("tempdir");
        std::fs::write(temp.path().join("infragraph.yaml"), MINIMAL).expect("write");
        let nested = temp.path().join("a/b");
        std::fs::create_dir_all(&nested).expect("mkdir");

        let found = find_config_file(&nested).expect("found");
        assert_eq!(found, temp.path().join("infragraph.yaml"));
    }

    #[test]
    fn test_load_file_resolves_relative_paths() {
        let temp = TempDir::new().expect("tempdir");
        let path = temp.path().join("infragraph.yaml");
        std::fs::write(&path, MINIMAL).expect("write");

        let config = ConfigParser::new().load_file(&path).expect("loads");
        assert_eq!(config.datacenter.path, temp.path().join("datacenter.yml"));
    }

    #[test]
    fn test_load_documents_by_extension() {
        let temp = TempDir::new().expect("tempdir");
        let yaml = temp.path().join("datacenter.yml");
        std::fs::write(&yaml, "module:\n  vpc:\n    source: acme/vpc\n").expect("write");
        assert_eq!(load_datacenter(&yaml).expect("yaml").version(), "v1");

        let json = temp.path().join("graph.json");
        std::fs::write(
            &json,
            r#"{"nodes":[{"type":"database","name":"main","inputs":{}}],"edges":[]}"#,
        )
        .expect("write");
        assert_eq!(load_app_graph(&json).expect("json").len(), 1);

        let toml = temp.path().join("datacenter.toml");
        std::fs::write(&toml, "").expect("write");
        let err = load_datacenter(&toml).expect_err("unsupported");
        assert!(matches!(err, InfraError::Config(ConfigError::UnsupportedFormat { .. })));
    }
}
