//! CLI command definitions.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// infragraph - plan and apply datacenter module graphs.
#[derive(Parser, Debug)]
#[command(name = "infragraph")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, global = true, env = "INFRAGRAPH_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format (text, json).
    #[arg(long, global = true, default_value = "text")]
    pub output: OutputFormat,

    /// Log line format (text, json).
    #[arg(long, global = true, default_value = "text")]
    pub log_format: LogFormat,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Validate the configuration and compile the datacenter.
    Validate {
        /// Show warnings as well as errors.
        #[arg(short, long)]
        warnings: bool,
    },

    /// Show the datacenter's variables, resolved where possible.
    Variables {
        /// Override a variable (`name=value`, value parsed as JSON if possible).
        #[arg(long = "var", value_parser = parse_variable)]
        vars: Vec<(String, String)>,
    },

    /// Print the compiled infrastructure graph.
    Graph {
        /// Override a variable (`name=value`).
        #[arg(long = "var", value_parser = parse_variable)]
        vars: Vec<(String, String)>,
    },

    /// Show what an apply would do.
    Plan {
        /// Override a variable (`name=value`).
        #[arg(long = "var", value_parser = parse_variable)]
        vars: Vec<(String, String)>,

        /// List unchanged nodes too.
        #[arg(short, long)]
        detailed: bool,
    },

    /// Plan and apply.
    Apply {
        /// Override a variable (`name=value`).
        #[arg(long = "var", value_parser = parse_variable)]
        vars: Vec<(String, String)>,

        /// Skip confirmation prompt.
        #[arg(short, long)]
        yes: bool,

        /// Maximum number of modules applied at once.
        #[arg(long)]
        concurrency: Option<usize>,
    },

    /// Destroy everything in the stored graph.
    Destroy {
        /// Skip confirmation prompt.
        #[arg(short, long)]
        yes: bool,

        /// Maximum number of modules destroyed at once.
        #[arg(long)]
        concurrency: Option<usize>,
    },

    /// Build modules whose source is a local directory.
    Build {
        /// Write the definition with built images to this path.
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Manage stored state.
    State {
        /// State subcommand.
        #[command(subcommand)]
        command: StateCommands,
    },
}

/// State management subcommands.
#[derive(Subcommand, Debug)]
pub enum StateCommands {
    /// Show the stored graph and history.
    Show,

    /// Remove a lock left behind by an interrupted run.
    Unlock {
        /// Lock ID to release.
        #[arg(long)]
        lock_id: Option<String>,

        /// Remove the lock whoever holds it.
        #[arg(long)]
        force: bool,
    },

    /// Delete the stored graph without destroying anything.
    Delete {
        /// Skip confirmation prompt.
        #[arg(short, long)]
        yes: bool,
    },
}

/// Output format options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output.
    #[default]
    Text,
    /// JSON output for scripting.
    Json,
}

/// Log line format options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    /// Human-readable log lines.
    #[default]
    Text,
    /// One JSON object per line.
    Json,
}

/// Parses a `name=value` variable override.
fn parse_variable(raw: &str) -> Result<(String, String), String> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("invalid variable '{raw}', expected name=value"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("invalid variable '{raw}', name is empty"));
    }
    Ok((name.to_string(), value.to_string()))
}

impl Cli {
    /// Parses CLI arguments from the command line.
    #[must_use]
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_apply() {
        let cli = Cli::try_parse_from([
            "infragraph",
            "--output",
            "json",
            "apply",
            "--var",
            "region=us-east-1",
            "-y",
            "--concurrency",
            "4",
        ])
        .expect("parses");

        assert_eq!(cli.output, OutputFormat::Json);
        match cli.command {
            Commands::Apply {
                vars,
                yes,
                concurrency,
            } => {
                assert_eq!(vars, vec![("region".to_string(), "us-east-1".to_string())]);
                assert!(yes);
                assert_eq!(concurrency, Some(4));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_parse_variable() {
        assert_eq!(
            parse_variable("a=b=c"),
            Ok(("a".to_string(), "b=c".to_string()))
        );
        assert!(parse_variable("novalue").is_err());
        assert!(parse_variable("=x").is_err());
    }
}
