//! Engine configuration.
//!
//! - Parsing `infragraph.yaml` with `.env` and `INFRAGRAPH_*` overrides
//! - Validation of configuration values and referenced files
//! - Loading datacenter definitions and app graphs from JSON or YAML

mod parser;
mod spec;
mod validator;

pub use parser::{
    apply_overrides, find_config_file, load_app_graph, load_datacenter, user_env_file,
    ConfigParser, DEFAULT_CONFIG_FILES, ENV_PREFIX,
};
pub use spec::{
    DatacenterConfig, EngineConfig, EnvironmentConfig, ExecutionConfig, PluginConfig,
    StateBackend, StateConfig,
};
pub use self::validator::{ConfigValidator, ValidationIssue, ValidationResult};
