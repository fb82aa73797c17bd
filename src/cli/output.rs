//! Output formatting for CLI commands.
//!
//! Every formatter returns a string; text output uses `colored` and
//! `tabled`, JSON output is pretty-printed for scripting.

use colored::Colorize;
use indexmap::IndexMap;
use serde_json::{json, Value};
use std::fmt::Write;
use tabled::{Table, Tabled};

use crate::config::ValidationResult;
use crate::graph::{GraphNode, InfraGraph, InfraGraphNode, NodeAction, NodeState};
use crate::reconciler::{Plan, ReconciliationResult};
use crate::state::{LockInfo, StateRecord};
use crate::variables::DatacenterVariablesSchema;

use super::commands::OutputFormat;

/// Output formatter for CLI.
#[derive(Debug, Clone, Copy)]
pub struct OutputFormatter {
    format: OutputFormat,
}

/// Node row for table display.
#[derive(Tabled)]
struct NodeRow {
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Node")]
    id: String,
    #[tabled(rename = "Plugin")]
    plugin: String,
    #[tabled(rename = "Image")]
    image: String,
    #[tabled(rename = "Status")]
    status: String,
}

/// Variable row for table display.
#[derive(Tabled)]
struct VariableRow {
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Type")]
    variable_type: String,
    #[tabled(rename = "Value")]
    value: String,
    #[tabled(rename = "Depends on")]
    depends_on: String,
}

impl OutputFormatter {
    /// Creates a new output formatter.
    #[must_use]
    pub const fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Output format in use.
    #[must_use]
    pub const fn format(&self) -> OutputFormat {
        self.format
    }

    /// Formats a plan. Unchanged nodes are listed only when `detailed`.
    #[must_use]
    pub fn format_plan(&self, plan: &Plan, detailed: bool) -> String {
        match self.format {
            OutputFormat::Json => to_json(&json!({
                "key": plan.key,
                "summary": plan.summary,
                "graph": plan.graph,
            })),
            OutputFormat::Text => {
                if !plan.summary.has_changes() {
                    return format!(
                        "{} No changes required - infrastructure is up to date.\n",
                        "✓".green()
                    );
                }

                let mut output = format!("\nPlan for {}\n\n", plan.key.to_string().bold());
                let rows: Vec<NodeRow> = plan
                    .graph
                    .nodes()
                    .filter(|node| detailed || node.action != NodeAction::NoOp)
                    .map(node_row)
                    .collect();
                output.push_str(&Table::new(rows).to_string());
                output.push('\n');

                let _ = writeln!(
                    output,
                    "\nPlan: {} to create, {} to update, {} to delete, {} unchanged",
                    plan.summary.creates.to_string().green(),
                    plan.summary.updates.to_string().yellow(),
                    plan.summary.deletes.to_string().red(),
                    plan.summary.no_ops
                );
                output
            }
        }
    }

    /// Formats a compiled graph.
    #[must_use]
    pub fn format_graph(&self, graph: &InfraGraph) -> String {
        match self.format {
            OutputFormat::Json => to_json(graph),
            OutputFormat::Text => {
                let mut output = String::new();
                for node in graph.nodes() {
                    let _ = writeln!(output, "{} ({})", node.id().bold(), node.image);
                    for dependency in graph.dependencies(&node.id()) {
                        let _ = writeln!(output, "  └─ {}", dependency.id());
                    }
                }
                let _ = writeln!(
                    output,
                    "\n{} modules, {} edges",
                    graph.len(),
                    graph.edge_count()
                );
                output
            }
        }
    }

    /// Formats variables and their resolved values.
    #[must_use]
    pub fn format_variables(
        &self,
        schema: &DatacenterVariablesSchema,
        values: &IndexMap<String, Value>,
    ) -> String {
        match self.format {
            OutputFormat::Json => to_json(&json!({ "schema": schema, "values": values })),
            OutputFormat::Text => {
                if schema.is_empty() {
                    return String::from("No variables declared.\n");
                }
                let rows: Vec<VariableRow> = schema
                    .iter()
                    .map(|(name, metadata)| VariableRow {
                        name: name.clone(),
                        variable_type: metadata.variable_type.clone(),
                        value: values.get(name).map_or_else(
                            || "(unset)".dimmed().to_string(),
                            |value| truncate(&render_value(value), 40),
                        ),
                        depends_on: metadata
                            .dependant_variables
                            .iter()
                            .map(|dependency| dependency.value.as_str())
                            .collect::<Vec<_>>()
                            .join(", "),
                    })
                    .collect();
                format!("{}\n", Table::new(rows))
            }
        }
    }

    /// Formats the outcome of an apply or destroy.
    #[must_use]
    pub fn format_result(&self, result: &ReconciliationResult) -> String {
        match self.format {
            OutputFormat::Json => to_json(result),
            OutputFormat::Text => {
                let status = if result.success {
                    format!("{} Apply complete", "✓".green())
                } else {
                    format!("{} Apply failed", "✗".red())
                };

                let mut output = format!("{status}\n\n");
                let _ = writeln!(output, "   Created: {}", result.summary.creates);
                let _ = writeln!(output, "   Updated: {}", result.summary.updates);
                let _ = writeln!(output, "   Deleted: {}", result.summary.deletes);
                let _ = writeln!(output, "   Unchanged: {}", result.summary.no_ops);

                if !result.errors.is_empty() {
                    let _ = write!(output, "\n{} Errors:\n", "⚠".yellow());
                    for error in &result.errors {
                        let _ = writeln!(output, "   - {error}");
                    }
                }
                output
            }
        }
    }

    /// Formats a stored record and its lock.
    #[must_use]
    pub fn format_state(&self, record: &StateRecord, lock: Option<&LockInfo>) -> String {
        match self.format {
            OutputFormat::Json => to_json(&json!({ "record": record, "lock": lock })),
            OutputFormat::Text => {
                let mut output = format!("\nState: {}\n\n", record.key.to_string().bold());
                let _ = writeln!(output, "   Version: {}", record.version);
                let _ = writeln!(output, "   Last updated: {}", record.last_updated);
                let _ = writeln!(output, "   Nodes: {}", record.graph.len());
                if let Some(lock) = lock {
                    let _ = writeln!(
                        output,
                        "   {} by {} ({}, {}s left, id {})",
                        "Locked".yellow(),
                        lock.holder,
                        lock.operation,
                        lock.remaining_secs(),
                        lock.lock_id
                    );
                }

                if !record.graph.is_empty() {
                    let rows: Vec<NodeRow> = record.graph.nodes().map(node_row).collect();
                    let _ = write!(output, "\n{}\n", Table::new(rows));
                }

                if !record.history.is_empty() {
                    let _ = writeln!(output, "\n   Recent history ({}):", record.history.len());
                    for entry in record.history.iter().rev().take(5) {
                        let status = if entry.success { "✓".green() } else { "✗".red() };
                        let _ = writeln!(
                            output,
                            "     {status} {} - {} ({} nodes){}",
                            entry.timestamp.format("%Y-%m-%d %H:%M"),
                            entry.operation,
                            entry.nodes.len(),
                            entry
                                .error
                                .as_ref()
                                .map(|e| format!(": {e}"))
                                .unwrap_or_default()
                        );
                    }
                }
                output
            }
        }
    }

    /// Formats a validation result.
    #[must_use]
    pub fn format_validation(&self, result: &ValidationResult, show_warnings: bool) -> String {
        match self.format {
            OutputFormat::Json => to_json(&json!({
                "valid": result.is_valid(),
                "errors": result.errors.iter().map(ToString::to_string).collect::<Vec<_>>(),
                "warnings": result.warnings,
            })),
            OutputFormat::Text => {
                let mut output = format!("{} Configuration is valid\n", "✓".green());
                if show_warnings && !result.warnings.is_empty() {
                    let _ = write!(output, "\n{} Warnings:\n", "⚠".yellow());
                    for warning in &result.warnings {
                        let _ = writeln!(output, "   - {warning}");
                    }
                }
                output
            }
        }
    }

    /// Formats a one-line message.
    #[must_use]
    pub fn message(&self, message: &str) -> String {
        match self.format {
            OutputFormat::Json => to_json(&json!({ "message": message })),
            OutputFormat::Text => format!("{message}\n"),
        }
    }
}

fn to_json(value: &impl serde::Serialize) -> String {
    serde_json::to_string_pretty(value).map_or_else(|e| format!("{{\"error\":\"{e}\"}}"), |s| s + "\n")
}

fn node_row(node: &InfraGraphNode) -> NodeRow {
    NodeRow {
        action: format_action(node.action),
        id: node.id(),
        plugin: node.plugin.to_string(),
        image: truncate(&node.image, 40),
        status: format_state(node.status.state),
    }
}

fn format_action(action: NodeAction) -> String {
    match action {
        NodeAction::Create => "+create".green().to_string(),
        NodeAction::Update => "~update".yellow().to_string(),
        NodeAction::Delete => "-delete".red().to_string(),
        NodeAction::NoOp => "no-op".dimmed().to_string(),
    }
}

fn format_state(state: NodeState) -> String {
    match state {
        NodeState::Complete => "complete".green().to_string(),
        NodeState::Error => "error".red().to_string(),
        NodeState::Pending => "pending".dimmed().to_string(),
        other => other.to_string().yellow().to_string(),
    }
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{head}...")
    }
}
