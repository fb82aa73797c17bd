//! infragraph CLI entrypoint.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use indexmap::IndexMap;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use infragraph::cli::{Cli, Commands, LogFormat, OutputFormatter, StateCommands};
use infragraph::config::{
    find_config_file, load_app_graph, load_datacenter, ConfigParser, ConfigValidator, EngineConfig,
    StateBackend,
};
use infragraph::datacenter::{DatacenterCompiler, DatacenterSpec, GetGraphOptions};
use infragraph::error::{InfraError, Result};
use infragraph::graph::{AppGraph, GraphNode, InfraGraph, NodeState};
use infragraph::planner::{ExecutorOptions, GraphExecutor};
use infragraph::plugin::{ModuleApplier, PluginManager};
use infragraph::reconciler::{compile, Reconciler};
use infragraph::state::{LocalStateStore, S3StateStore, StateRecord, StateStore, STATE_DIR};
use infragraph::variables::resolve_variables;

fn main() -> ExitCode {
    let cli = Cli::parse_args();

    init_logging(cli.verbose, cli.log_format);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// `RUST_LOG` wins over `--verbose`.
fn init_logging(verbose: bool, format: LogFormat) {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

async fn run(cli: Cli) -> Result<()> {
    let formatter = OutputFormatter::new(cli.output);
    let config_path = cli.config.as_ref();

    match cli.command {
        Commands::Validate { warnings } => cmd_validate(config_path, warnings, &formatter),
        Commands::Variables { vars } => cmd_variables(config_path, &vars, &formatter),
        Commands::Graph { vars } => cmd_graph(config_path, &vars, &formatter),
        Commands::Plan { vars, detailed } => cmd_plan(config_path, &vars, detailed, &formatter).await,
        Commands::Apply {
            vars,
            yes,
            concurrency,
        } => cmd_apply(config_path, &vars, yes, concurrency, &formatter).await,
        Commands::Destroy { yes, concurrency } => {
            cmd_destroy(config_path, yes, concurrency, &formatter).await
        }
        Commands::Build { out } => cmd_build(config_path, out.as_deref(), &formatter).await,
        Commands::State { command } => cmd_state(config_path, command, &formatter).await,
    }
}

fn cmd_validate(config_path: Option<&PathBuf>, warnings: bool, formatter: &OutputFormatter) -> Result<()> {
    let (config, _) = load_config(config_path)?;
    let result = ConfigValidator::new().validate(&config)?;

    let datacenter = load_datacenter(&config.datacenter.path)?;
    let graph = compile(&datacenter, &load_app(&config)?, &graph_options(&config, &[]))?;
    debug!("Compiled {} modules", graph.len());

    emit(&formatter.format_validation(&result, warnings))
}

fn cmd_variables(
    config_path: Option<&PathBuf>,
    vars: &[(String, String)],
    formatter: &OutputFormatter,
) -> Result<()> {
    let (config, _) = load_config(config_path)?;
    let datacenter = load_datacenter(&config.datacenter.path)?;
    let schema = datacenter.get_variables_schema()?;
    let values = resolve_variables(&schema, &graph_options(&config, vars).variables)?;
    emit(&formatter.format_variables(&schema, &values))
}

fn cmd_graph(config_path: Option<&PathBuf>, vars: &[(String, String)], formatter: &OutputFormatter) -> Result<()> {
    let (config, _) = load_config(config_path)?;
    let datacenter = load_datacenter(&config.datacenter.path)?;
    let graph = compile(&datacenter, &load_app(&config)?, &graph_options(&config, vars))?;
    emit(&formatter.format_graph(&graph))
}

async fn cmd_plan(
    config_path: Option<&PathBuf>,
    vars: &[(String, String)],
    detailed: bool,
    formatter: &OutputFormatter,
) -> Result<()> {
    let (config, config_dir) = load_config(config_path)?;
    ConfigValidator::new().validate(&config)?;
    let target = compile_target(&config, vars)?;

    let store = create_state_store(&config, &config_dir).await?;
    let manager = Arc::new(plugin_manager(&config));
    let reconciler = Reconciler::new(&store, executor(&config, &manager, None));

    let plan = reconciler.plan(&config.state_key(), &target).await?;
    emit(&formatter.format_plan(&plan, detailed))
}

async fn cmd_apply(
    config_path: Option<&PathBuf>,
    vars: &[(String, String)],
    auto_approve: bool,
    concurrency: Option<usize>,
    formatter: &OutputFormatter,
) -> Result<()> {
    let (config, config_dir) = load_config(config_path)?;
    ConfigValidator::new().validate(&config)?;
    let target = compile_target(&config, vars)?;

    let store = create_state_store(&config, &config_dir).await?;
    let manager = Arc::new(plugin_manager(&config));
    let (sender, progress) = progress_printer();
    let reconciler =
        Reconciler::new(&store, executor(&config, &manager, concurrency)).with_progress(sender);

    let plan = reconciler.plan(&config.state_key(), &target).await?;
    emit(&formatter.format_plan(&plan, false))?;
    if !plan.summary.has_changes() {
        return Ok(());
    }
    if !auto_approve && !confirm("Do you want to apply this plan?")? {
        eprintln!("Apply cancelled.");
        return Ok(());
    }

    let outcome = reconciler.apply(plan).await;
    drop(reconciler);
    finish(manager, progress).await;

    emit(&formatter.format_result(&outcome?))
}

async fn cmd_destroy(
    config_path: Option<&PathBuf>,
    auto_approve: bool,
    concurrency: Option<usize>,
    formatter: &OutputFormatter,
) -> Result<()> {
    let (config, config_dir) = load_config(config_path)?;
    let key = config.state_key();

    let store = create_state_store(&config, &config_dir).await?;
    let manager = Arc::new(plugin_manager(&config));
    let (sender, progress) = progress_printer();
    let reconciler =
        Reconciler::new(&store, executor(&config, &manager, concurrency)).with_progress(sender);

    let plan = reconciler.plan_destroy(&key).await?;
    emit(&formatter.format_plan(&plan, false))?;
    if !plan.summary.has_changes() {
        return Ok(());
    }
    if !auto_approve && !confirm(&format!("Destroy every module in {key}?"))? {
        eprintln!("Destroy cancelled.");
        return Ok(());
    }

    let outcome = reconciler.destroy(&key).await;
    drop(reconciler);
    finish(manager, progress).await;

    emit(&formatter.format_result(&outcome?))
}

async fn cmd_build(config_path: Option<&PathBuf>, out: Option<&Path>, formatter: &OutputFormatter) -> Result<()> {
    let (config, _) = load_config(config_path)?;
    let mut datacenter = load_datacenter(&config.datacenter.path)?;
    let base_dir = config
        .datacenter
        .path
        .parent()
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf);

    let manager = plugin_manager(&config);
    let built = datacenter.build_modules(&manager, &base_dir).await;
    manager.shutdown().await;
    let built = built?;
    info!("Built {built} modules");

    match out {
        Some(path) => {
            std::fs::write(path, serialize_datacenter(&datacenter, path)?)?;
            emit(&formatter.message(&format!("Built {built} modules, wrote {}", path.display())))
        }
        None => emit(&serialize_datacenter(&datacenter, Path::new("datacenter.yml"))?),
    }
}

async fn cmd_state(config_path: Option<&PathBuf>, command: StateCommands, formatter: &OutputFormatter) -> Result<()> {
    let (config, config_dir) = load_config(config_path)?;
    let store = create_state_store(&config, &config_dir).await?;
    let key = config.state_key();

    match command {
        StateCommands::Show => match store.load(&key).await? {
            Some(record) => {
                let lock = store.get_lock_info(&key).await?;
                emit(&formatter.format_state(&record, lock.as_ref()))
            }
            None => emit(&formatter.message(&format!("No state found for {key}."))),
        },
        StateCommands::Unlock { lock_id, force } => {
            if force {
                store.force_unlock(&key).await?;
                emit(&formatter.message("State forcefully unlocked."))
            } else if let Some(id) = lock_id {
                store.release_lock(&key, &id).await?;
                emit(&formatter.message("State unlocked."))
            } else {
                Err(InfraError::internal("Provide --lock-id or use --force"))
            }
        }
        StateCommands::Delete { yes } => {
            let record = store.load(&key).await?.unwrap_or_else(|| StateRecord::new(key.clone()));
            let live = record
                .graph
                .nodes()
                .filter(|node| node.status.state == NodeState::Complete)
                .count();
            if live > 0 {
                eprintln!("{key} still tracks {live} applied modules; they will not be destroyed.");
            }
            if !yes && !confirm(&format!("Delete stored state for {key}?"))? {
                eprintln!("Delete cancelled.");
                return Ok(());
            }
            store.delete(&key).await?;
            emit(&formatter.message(&format!("Deleted state for {key}.")))
        }
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Loads and returns the config with the directory holding it.
fn load_config(config_path: Option<&PathBuf>) -> Result<(EngineConfig, PathBuf)> {
    let config_file = config_path.map_or_else(|| find_config_file("."), |path| Ok(path.clone()))?;
    let config_dir = config_file
        .parent()
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
    debug!("Loading configuration from: {}", config_file.display());

    let config = ConfigParser::new()
        .with_base_path(&config_dir)
        .load_with_env(&config_file)?;
    Ok((config, config_dir))
}

fn load_app(config: &EngineConfig) -> Result<AppGraph> {
    match config.environment.as_ref().and_then(|env| env.graph.as_ref()) {
        Some(path) => load_app_graph(path),
        None => Ok(AppGraph::new()),
    }
}

/// Config variables overlaid with `--var` flags. Flag values are parsed as
/// JSON when they parse, otherwise taken as strings.
fn graph_options(config: &EngineConfig, vars: &[(String, String)]) -> GetGraphOptions {
    let mut variables: IndexMap<String, Value> = config.datacenter.variables.clone();
    for (name, raw) in vars {
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.clone()));
        variables.insert(name.clone(), value);
    }

    let mut options = GetGraphOptions::new(&config.datacenter.name);
    options.variables = variables;
    match config.environment_name() {
        Some(env) => options.with_environment(env),
        None => options,
    }
}

fn compile_target(config: &EngineConfig, vars: &[(String, String)]) -> Result<InfraGraph> {
    let datacenter = load_datacenter(&config.datacenter.path)?;
    compile(&datacenter, &load_app(config)?, &graph_options(config, vars))
}

fn plugin_manager(config: &EngineConfig) -> PluginManager {
    let manager = PluginManager::new(&config.plugins.image_prefix);
    match &config.plugins.mount {
        Some(mount) => manager.with_mount(mount),
        None => manager,
    }
}

fn executor(config: &EngineConfig, manager: &Arc<PluginManager>, concurrency: Option<usize>) -> GraphExecutor {
    let applier: Arc<dyn ModuleApplier> = Arc::clone(manager) as Arc<dyn ModuleApplier>;
    GraphExecutor::new(applier).with_options(ExecutorOptions {
        concurrency: concurrency.unwrap_or(config.execution.concurrency).max(1),
        cwd: config.datacenter.path.parent().map(Path::to_path_buf),
    })
}

/// Prints node state changes as snapshots arrive.
fn progress_printer() -> (mpsc::UnboundedSender<InfraGraph>, tokio::task::JoinHandle<()>) {
    let (sender, mut receiver) = mpsc::unbounded_channel::<InfraGraph>();
    let handle = tokio::spawn(async move {
        let mut seen: HashMap<String, NodeState> = HashMap::new();
        while let Some(graph) = receiver.recv().await {
            for node in graph.nodes() {
                let id = node.id();
                if seen.get(&id) != Some(&node.status.state) {
                    if node.status.state != NodeState::Pending {
                        eprintln!("  {id}: {} {}", node.action, node.status.state);
                    }
                    seen.insert(id, node.status.state);
                }
            }
        }
    });
    (sender, handle)
}

/// Stops plugin containers and drains the progress printer.
async fn finish(manager: Arc<PluginManager>, progress: tokio::task::JoinHandle<()>) {
    manager.shutdown().await;
    if let Err(e) = progress.await {
        debug!("Progress printer stopped: {e}");
    }
}

async fn create_state_store(config: &EngineConfig, config_dir: &Path) -> Result<Box<dyn StateStore>> {
    let store: Box<dyn StateStore> = match config.state.backend {
        StateBackend::Local => {
            let path = config
                .state
                .path
                .clone()
                .unwrap_or_else(|| config_dir.join(STATE_DIR));
            Box::new(LocalStateStore::with_base_dir(path))
        }
        StateBackend::S3 => {
            let bucket = config
                .state
                .bucket
                .as_deref()
                .ok_or_else(|| InfraError::internal("S3 bucket not configured"))?;
            Box::new(
                S3StateStore::new(
                    bucket,
                    config.state.prefix.as_deref(),
                    config.state.region.as_deref(),
                )
                .await,
            )
        }
    };
    debug!("Using {} state backend", store.backend_type());
    Ok(store)
}

fn serialize_datacenter(datacenter: &DatacenterSpec, path: &Path) -> Result<String> {
    let rendered = match path.extension().and_then(|ext| ext.to_str()) {
        Some("json") => serde_json::to_string_pretty(datacenter).map_err(|e| InfraError::internal(e.to_string()))?,
        _ => serde_yaml::to_string(datacenter).map_err(|e| InfraError::internal(e.to_string()))?,
    };
    Ok(rendered)
}

fn confirm(prompt: &str) -> Result<bool> {
    eprint!("{prompt} [y/N]: ");
    std::io::stderr().flush()?;
    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    Ok(input.trim().eq_ignore_ascii_case("y"))
}

fn emit(text: &str) -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    stdout.write_all(text.as_bytes())?;
    stdout.flush()?;
    Ok(())
}
