//! Output formatting for CLI commands.
//!
//! This module provides formatting utilities for displaying
//! information to the user in various formats.

use colored::Colorize;
use serde_json::Value as Json;
use std::collections::BTreeMap;
use std::fmt::Write;
use tabled::{Table, Tabled};

use crate::config::ValidationResult;
use crate::graph::{NodeKind, Plan, plain_string};
use crate::health::HealthStatus;
use crate::planner::{ChangeAction, ChangeSet};
use crate::provisioner::{ApplyOutcome, DriftReport};
use crate::state::{StackState, StackOperation};

use super::commands::OutputFormat;

/// Output formatter for CLI.
#[derive(Debug)]
pub struct OutputFormatter {
    /// Output format.
    format: OutputFormat,
}

/// Change row for table display.
#[derive(Tabled)]
struct ChangeRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Kind")]
    kind: String,
    #[tabled(rename = "Reason")]
    reason: String,
}

/// Recorded resource row for table display.
#[derive(Tabled)]
struct ResourceRow {
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Kind")]
    kind: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "ID")]
    id: String,
}

/// Output row for table display.
#[derive(Tabled)]
struct OutputRow {
    #[tabled(rename = "Output")]
    name: String,
    #[tabled(rename = "Value")]
    value: String,
}

impl OutputFormatter {
    /// Creates a new output formatter.
    #[must_use]
    pub const fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Formats a change preview.
    #[must_use]
    pub fn format_changes(&self, changes: &ChangeSet, detailed: bool) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(changes).unwrap_or_default(),
            OutputFormat::Text => Self::format_changes_text(changes, detailed),
        }
    }

    fn format_changes_text(changes: &ChangeSet, detailed: bool) -> String {
        if !changes.has_changes() {
            return format!(
                "{} No changes required - infrastructure is up to date.\n",
                "✓".green()
            );
        }

        let mut output = String::new();
        let _ = write!(output, "\nExecution plan\n");
        let _ = write!(
            output,
            "   Plan hash: {}\n\n",
            &changes.plan_hash[..8.min(changes.plan_hash.len())]
        );

        let rows: Vec<ChangeRow> = changes
            .changes()
            .iter()
            .filter(|c| detailed || c.action != ChangeAction::NoChange)
            .enumerate()
            .map(|(i, c)| ChangeRow {
                index: i + 1,
                action: Self::format_action(c.action),
                resource: c.name.clone(),
                kind: c.kind.to_string(),
                reason: Self::truncate(&c.reason, 48),
            })
            .collect();

        output.push_str(&Table::new(rows).to_string());
        output.push('\n');

        let _ = write!(
            output,
            "\nPlan: {} to create, {} to update, {} to replace, {} to destroy\n",
            changes.count(ChangeAction::Create).to_string().green(),
            (changes.count(ChangeAction::Update) + changes.count(ChangeAction::Pending))
                .to_string()
                .yellow(),
            changes.count(ChangeAction::Replace).to_string().yellow(),
            changes.count(ChangeAction::Delete).to_string().red()
        );
        output
    }

    /// Formats the result of an apply.
    #[must_use]
    pub fn format_apply(&self, outcome: &ApplyOutcome) -> String {
        match self.format {
            OutputFormat::Json => {
                let outputs: BTreeMap<&str, &Json> = outcome
                    .outputs
                    .iter()
                    .filter(|o| !o.sensitive)
                    .map(|o| (o.name.as_str(), &o.value))
                    .collect();
                let json = serde_json::json!({
                    "status": "success",
                    "changes": outcome.report.changes,
                    "outputs": outputs,
                });
                serde_json::to_string_pretty(&json).unwrap_or_default()
            }
            OutputFormat::Text => {
                let touched = outcome.report.touched();
                let mut output = format!(
                    "{} Apply complete: {} changed, {} unchanged\n",
                    "✓".green(),
                    touched.len(),
                    outcome.report.changes.len() - touched.len()
                );
                for (name, action) in &outcome.report.changes {
                    if *action != ChangeAction::NoChange {
                        let _ = writeln!(output, "   {} {name}", Self::format_action(*action));
                    }
                }

                let outputs: BTreeMap<String, Json> = outcome
                    .outputs
                    .iter()
                    .map(|o| {
                        let value = if o.sensitive {
                            Json::String(String::from("<sensitive>"))
                        } else {
                            o.value.clone()
                        };
                        (o.name.clone(), value)
                    })
                    .collect();
                output.push('\n');
                output.push_str(&Self::format_outputs_text(&outputs));
                output
            }
        }
    }

    /// Formats recorded outputs.
    #[must_use]
    pub fn format_outputs(&self, outputs: &BTreeMap<String, Json>) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(outputs).unwrap_or_default(),
            OutputFormat::Text => Self::format_outputs_text(outputs),
        }
    }

    fn format_outputs_text(outputs: &BTreeMap<String, Json>) -> String {
        if outputs.is_empty() {
            return String::from("No outputs recorded. Run 'taskstack apply' first.\n");
        }
        let rows: Vec<OutputRow> = outputs
            .iter()
            .map(|(name, value)| OutputRow {
                name: name.clone(),
                value: plain_string(value),
            })
            .collect();
        let mut output = Table::new(rows).to_string();
        output.push('\n');
        output
    }

    /// Formats recorded resources with an optional API probe.
    #[must_use]
    pub fn format_status(&self, state: &StackState, health: Option<&HealthStatus>) -> String {
        match self.format {
            OutputFormat::Json => {
                let json = serde_json::json!({
                    "project": state.project,
                    "environment": state.environment,
                    "resources": state.resources.values().map(|r| serde_json::json!({
                        "name": r.name,
                        "kind": r.kind,
                        "status": r.status,
                        "id": r.id,
                    })).collect::<Vec<_>>(),
                    "outputs": state.outputs,
                    "health": health,
                });
                serde_json::to_string_pretty(&json).unwrap_or_default()
            }
            OutputFormat::Text => {
                let mut output = format!(
                    "\nStack: {}/{}\n\n",
                    state.project, state.environment
                );
                if state.is_empty() {
                    output.push_str("   No resources deployed.\n");
                } else {
                    let rows: Vec<ResourceRow> = state
                        .resources
                        .values()
                        .map(|r| ResourceRow {
                            name: r.name.clone(),
                            kind: r.kind.to_string(),
                            status: if r.is_ready() {
                                r.status.to_string().green().to_string()
                            } else {
                                r.status.to_string().yellow().to_string()
                            },
                            id: Self::truncate(&r.id, 40),
                        })
                        .collect();
                    output.push_str(&Table::new(rows).to_string());
                    output.push('\n');
                }

                if let Some(health) = health {
                    let marker = if health.healthy {
                        "✓".green()
                    } else {
                        "✗".red()
                    };
                    let _ = write!(output, "\nAPI: {marker} {health}\n");
                }
                output
            }
        }
    }

    /// Formats a drift report.
    #[must_use]
    pub fn format_drift(&self, report: &DriftReport) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(report).unwrap_or_default(),
            OutputFormat::Text => {
                if report.is_converged() {
                    format!("{} No drift detected - state is converged.\n", "✓".green())
                } else {
                    let mut output = format!("{} Drift detected:\n\n", "⚠".yellow());
                    for entry in &report.entries {
                        let _ = write!(output, "   - {}: {}", entry.name, entry.kind);
                        if !entry.attributes.is_empty() {
                            let _ = write!(output, " ({})", entry.attributes.join(", "));
                        }
                        output.push('\n');
                    }
                    let _ = write!(
                        output,
                        "\n{} of {} declared resources need attention.\n",
                        report.entries.len(),
                        report.declared
                    );
                    output
                }
            }
        }
    }

    /// Formats the dependency graph in apply order.
    #[must_use]
    pub fn format_graph(&self, plan: &Plan, order: &[String], dot: bool) -> String {
        if dot {
            return Self::format_dot(plan, order);
        }
        match self.format {
            OutputFormat::Json => {
                let nodes: Vec<Json> = order
                    .iter()
                    .map(|name| {
                        serde_json::json!({
                            "name": name,
                            "kind": plan.node_kind(name).map(|k| k.to_string()),
                            "depends_on": plan.graph().dependencies(name),
                        })
                    })
                    .collect();
                serde_json::to_string_pretty(&nodes).unwrap_or_default()
            }
            OutputFormat::Text => {
                let mut output = String::new();
                for (i, name) in order.iter().enumerate() {
                    let kind = plan
                        .node_kind(name)
                        .map_or_else(String::new, |k| k.to_string());
                    let deps = plan
                        .graph()
                        .dependencies(name)
                        .map(|d| d.iter().cloned().collect::<Vec<_>>().join(", "))
                        .unwrap_or_default();
                    let _ = write!(output, "{:>3}. {} ({})", i + 1, name.bold(), kind.dimmed());
                    if !deps.is_empty() {
                        let _ = write!(output, " <- {deps}");
                    }
                    output.push('\n');
                }
                output
            }
        }
    }

    fn format_dot(plan: &Plan, order: &[String]) -> String {
        let mut output = String::from("digraph taskstack {\n  rankdir=LR;\n");
        for name in order {
            let shape = match plan.node_kind(name) {
                Some(NodeKind::Lookup) => "ellipse",
                _ => "box",
            };
            let _ = writeln!(output, "  \"{name}\" [shape={shape}];");
        }
        for name in order {
            if let Some(deps) = plan.graph().dependencies(name) {
                for dep in deps {
                    let _ = writeln!(output, "  \"{dep}\" -> \"{name}\";");
                }
            }
        }
        output.push_str("}\n");
        output
    }

    /// Formats a validation result.
    #[must_use]
    pub fn format_validation(
        &self,
        result: &ValidationResult,
        plan: &Plan,
        show_warnings: bool,
    ) -> String {
        match self.format {
            OutputFormat::Json => {
                let json = serde_json::json!({
                    "valid": true,
                    "warnings": result.warnings,
                    "resources": plan.resources().len(),
                    "lookups": plan.lookups().len(),
                    "outputs": plan.outputs().iter().map(|o| o.name.as_str()).collect::<Vec<_>>(),
                });
                serde_json::to_string_pretty(&json).unwrap_or_default()
            }
            OutputFormat::Text => {
                let mut output = format!("{} Configuration is valid!\n", "✓".green());
                if show_warnings && !result.warnings.is_empty() {
                    let _ = write!(output, "\n{} Warnings:\n", "⚠".yellow());
                    for warning in &result.warnings {
                        let _ = writeln!(output, "   - {warning}");
                    }
                }
                let provider = plan.provider();
                let _ = write!(output, "\nConfiguration summary:\n");
                let _ = writeln!(output, "   Project: {}", provider.project);
                let _ = writeln!(output, "   Environment: {}", provider.environment);
                let _ = writeln!(output, "   Region: {}", provider.region);
                let _ = writeln!(output, "   Resources: {}", plan.resources().len());
                let _ = writeln!(output, "   Lookups: {}", plan.lookups().len());
                output
            }
        }
    }

    /// Formats stack state.
    #[must_use]
    pub fn format_state(&self, state: &StackState) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(state).unwrap_or_default(),
            OutputFormat::Text => {
                let mut output = String::new();

                let _ = write!(
                    output,
                    "\nState: {}/{}\n\n",
                    state.project, state.environment
                );
                let _ = writeln!(output, "   Version: {}", state.version);
                let _ = writeln!(
                    output,
                    "   Plan hash: {}",
                    &state.plan_hash[..8.min(state.plan_hash.len())]
                );
                let _ = writeln!(output, "   Last updated: {}", state.last_updated);
                let _ = writeln!(output, "   Resources: {}", state.resources.len());
                let _ = writeln!(output, "   Outputs: {}", state.outputs.len());

                if !state.history.is_empty() {
                    let _ = writeln!(output, "\n   Recent history ({}):", state.history.len());
                    for entry in state.history.iter().rev().take(5) {
                        let status = if entry.success { "✓" } else { "✗" };
                        let _ = write!(
                            output,
                            "     {status} {} - {} ({} resources)",
                            entry.timestamp.format("%Y-%m-%d %H:%M"),
                            entry.operation,
                            entry.resources.len()
                        );
                        if let Some(error) = &entry.error {
                            let _ = write!(output, ": {}", Self::truncate(error, 60));
                        }
                        output.push('\n');
                    }
                }

                output
            }
        }
    }

    /// Formats a list of destroyed resources.
    #[must_use]
    pub fn format_destroyed(&self, deleted: &[String]) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(&serde_json::json!({
                "operation": StackOperation::Destroy,
                "deleted": deleted,
            }))
            .unwrap_or_default(),
            OutputFormat::Text => {
                if deleted.is_empty() {
                    return String::from("Nothing to destroy.\n");
                }
                let mut output = String::new();
                for name in deleted {
                    let _ = writeln!(output, "   {} {name}", Self::format_action(ChangeAction::Delete));
                }
                let _ = write!(
                    output,
                    "\n{} Destroyed {} resources.\n",
                    "✓".green(),
                    deleted.len()
                );
                output
            }
        }
    }

    /// Formats a change action with color.
    fn format_action(action: ChangeAction) -> String {
        match action {
            ChangeAction::Create => "+create".green().to_string(),
            ChangeAction::Update => "~update".yellow().to_string(),
            ChangeAction::Pending => "~update?".yellow().to_string(),
            ChangeAction::Replace => "-/+replace".yellow().to_string(),
            ChangeAction::Delete => "-delete".red().to_string(),
            ChangeAction::NoChange => "noop".dimmed().to_string(),
        }
    }

    /// Truncates a string to a maximum number of characters.
    fn truncate(s: &str, max_len: usize) -> String {
        if s.chars().count() <= max_len {
            s.to_string()
        } else {
            let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
            format!("{kept}...")
        }
    }
}
