//! Output formatting for CLI commands.
//!
//! This module provides formatting utilities for displaying
//! information to the user in various formats.

use colored::Colorize;
use std::fmt::Write;
use tabled::{Table, Tabled};

use crate::autoscaling::{RefreshDecision, RefreshState};
use crate::config::{ConvergeConfig, ValidationResult};
use crate::convergence::ConvergenceOutcome;
use crate::launch_template::PruneReport;
use crate::loadbalancer::RegistrationOutcome;
use crate::provider::InstanceRefresh;
use crate::reconciler::{DriftReport, ReconciliationResult};
use crate::tags::TagDiff;

use super::commands::OutputFormat;

/// Output formatter for CLI.
#[derive(Debug)]
pub struct OutputFormatter {
    /// Output format.
    format: OutputFormat,
}

/// Resource outcome row for table display.
#[derive(Tabled)]
struct ResourceRow {
    #[tabled(rename = "Kind")]
    kind: String,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Outcome")]
    outcome: String,
    #[tabled(rename = "Detail")]
    detail: String,
}

/// Drifted resource row for table display.
#[derive(Tabled)]
struct DriftRow {
    #[tabled(rename = "Kind")]
    kind: String,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Reason")]
    reason: String,
}

/// Tag change row for table display.
#[derive(Tabled)]
struct TagRow {
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Key")]
    key: String,
    #[tabled(rename = "Value")]
    value: String,
}

impl OutputFormatter {
    /// Creates a new output formatter.
    #[must_use]
    pub const fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Formats a validation result.
    #[must_use]
    pub fn format_validation(
        &self,
        config: &ConvergeConfig,
        result: &ValidationResult,
        show_warnings: bool,
    ) -> String {
        match self.format {
            OutputFormat::Json => {
                let json = serde_json::json!({
                    "valid": result.is_valid(),
                    "errors": result.errors.iter().map(ToString::to_string).collect::<Vec<_>>(),
                    "warnings": result.warnings,
                    "cluster": config.cluster.name,
                    "launch_templates": config.launch_templates.len(),
                    "machine_pools": config.machine_pools.len(),
                });
                serde_json::to_string_pretty(&json).unwrap_or_default()
            }
            OutputFormat::Text => {
                let mut output = if result.is_valid() {
                    format!("{} Configuration is valid\n", "✓".green())
                } else {
                    let mut output = format!(
                        "{} Configuration has {} error(s):\n",
                        "✗".red(),
                        result.error_count()
                    );
                    for error in &result.errors {
                        let _ = writeln!(output, "   - {error}");
                    }
                    output
                };

                if show_warnings && !result.warnings.is_empty() {
                    let _ = write!(output, "\n{} Warnings:\n", "⚠".yellow());
                    for warning in &result.warnings {
                        let _ = writeln!(output, "   - {warning}");
                    }
                }

                let _ = write!(output, "\nConfiguration summary:\n");
                let _ = writeln!(output, "   Cluster: {}", config.cluster.name);
                let _ = writeln!(
                    output,
                    "   Security groups: {}",
                    config.network.as_ref().map_or(0, |n| n.security_groups.len())
                );
                let _ = writeln!(output, "   Launch templates: {}", config.launch_templates.len());
                let _ = writeln!(output, "   Machine pools: {}", config.machine_pools.len());
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
                    return format!(
                        "{} No drift detected - {} resources converged.\n",
                        "✓".green(),
                        report.observed_count
                    );
                }

                let rows: Vec<DriftRow> = report
                    .drifted_resources
                    .iter()
                    .map(|d| DriftRow {
                        kind: d.kind.to_string(),
                        name: d.name.clone(),
                        reason: Self::truncate(&d.reason, 60),
                    })
                    .collect();

                let mut output = format!("{} Drift detected:\n\n", "⚠".yellow());
                output.push_str(&Table::new(rows).to_string());
                let _ = write!(
                    output,
                    "\n\n{}/{} resources have drifted.\n",
                    report.drifted_resources.len(),
                    report.total_resources
                );
                output
            }
        }
    }

    /// Formats a reconciliation result.
    #[must_use]
    pub fn format_reconciliation(&self, result: &ReconciliationResult) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(result).unwrap_or_default(),
            OutputFormat::Text => {
                let status = if result.success {
                    format!("{} Reconciliation successful", "✓".green())
                } else {
                    format!("{} Reconciliation failed", "✗".red())
                };
                let mut output = format!("{status}\n\n");

                let rows: Vec<ResourceRow> = result
                    .resources
                    .iter()
                    .map(|r| ResourceRow {
                        kind: r.kind.to_string(),
                        name: r.name.clone(),
                        outcome: Self::format_outcome(r.outcome),
                        detail: r.detail.as_deref().map_or_else(String::new, |d| Self::truncate(d, 40)),
                    })
                    .collect();
                if !rows.is_empty() {
                    output.push_str(&Table::new(rows).to_string());
                    output.push_str("\n\n");
                }

                let _ = writeln!(output, "   Created: {}", result.created.to_string().green());
                let _ = writeln!(output, "   Updated: {}", result.updated.to_string().yellow());
                let _ = writeln!(output, "   Deleted: {}", result.deleted.to_string().red());
                let _ = writeln!(output, "   Unchanged: {}", result.unchanged);

                let changed: Vec<_> = result
                    .registrations
                    .iter()
                    .filter(|r| r.outcome.changed())
                    .collect();
                if !changed.is_empty() {
                    output.push_str("\nRegistrations:\n");
                    for registration in changed {
                        let _ = writeln!(
                            output,
                            "   {} {}",
                            registration.instance_id,
                            Self::format_registration_outcome(registration.outcome)
                        );
                    }
                }

                if !result.errors.is_empty() {
                    let _ = write!(output, "\n{} Errors:\n", "⚠".yellow());
                    for failure in &result.errors {
                        let _ = writeln!(
                            output,
                            "   - {} {} [{}]: {}",
                            failure.kind, failure.name, failure.class, failure.message
                        );
                    }
                }

                output
            }
        }
    }

    /// Formats the refresh state of a machine pool.
    #[must_use]
    pub fn format_refresh(
        &self,
        pool: &str,
        state: RefreshState,
        latest: Option<&InstanceRefresh>,
        decision: RefreshDecision,
    ) -> String {
        match self.format {
            OutputFormat::Json => {
                let json = serde_json::json!({
                    "pool": pool,
                    "state": state,
                    "latest": latest,
                    "can_start": decision,
                });
                serde_json::to_string_pretty(&json).unwrap_or_default()
            }
            OutputFormat::Text => {
                let state_text = match state {
                    RefreshState::Idle => "idle".dimmed().to_string(),
                    RefreshState::InProgress => "in progress".yellow().to_string(),
                    RefreshState::Successful => "successful".green().to_string(),
                    RefreshState::Failed => "failed".red().to_string(),
                    RefreshState::Cancelled => "cancelled".yellow().to_string(),
                };

                let mut output = format!("\nPool: {pool}\n\n");
                let _ = writeln!(output, "   Refresh: {state_text}");
                if let Some(refresh) = latest {
                    let _ = writeln!(
                        output,
                        "   Latest: {} ({}% complete, started {})",
                        refresh.id,
                        refresh.percentage_complete,
                        refresh.started_at.format("%Y-%m-%d %H:%M")
                    );
                    if let Some(reason) = &refresh.status_reason {
                        let _ = writeln!(output, "   Reason: {reason}");
                    }
                }
                let _ = match decision.reason {
                    None => writeln!(output, "   Can start: {}", "yes".green()),
                    Some(reason) => writeln!(output, "   Can start: {} ({reason})", "no".red()),
                };
                output
            }
        }
    }

    /// Formats a registration change.
    #[must_use]
    pub fn format_registration(&self, instance_id: &str, outcome: RegistrationOutcome) -> String {
        match self.format {
            OutputFormat::Json => {
                let json = serde_json::json!({ "instance_id": instance_id, "outcome": outcome });
                serde_json::to_string_pretty(&json).unwrap_or_default()
            }
            OutputFormat::Text => format!(
                "{instance_id}: {}\n",
                Self::format_registration_outcome(outcome)
            ),
        }
    }

    /// Formats a prune report.
    #[must_use]
    pub fn format_prune(&self, template: &str, report: &PruneReport) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(report).unwrap_or_default(),
            OutputFormat::Text => {
                if report.is_noop() {
                    return format!(
                        "{} {template} ({}): nothing to prune, kept {:?}\n",
                        "✓".green(),
                        report.template_id,
                        report.kept
                    );
                }
                format!(
                    "{} {template} ({}): deleted versions {:?}, kept {:?}\n",
                    "✓".green(),
                    report.template_id,
                    report.deleted,
                    report.kept
                )
            }
        }
    }

    /// Formats a tag diff.
    #[must_use]
    pub fn format_tag_diff(&self, resource_id: &str, diff: &TagDiff) -> String {
        match self.format {
            OutputFormat::Json => {
                let json = serde_json::json!({ "resource_id": resource_id, "diff": diff });
                serde_json::to_string_pretty(&json).unwrap_or_default()
            }
            OutputFormat::Text => {
                if diff.is_empty() {
                    return format!("{} {resource_id}: tags converged\n", "✓".green());
                }

                let rows: Vec<TagRow> = diff
                    .create
                    .iter()
                    .map(|(k, v)| TagRow {
                        action: "+set".green().to_string(),
                        key: k.clone(),
                        value: v.clone(),
                    })
                    .chain(diff.remove.iter().map(|k| TagRow {
                        action: "-remove".red().to_string(),
                        key: k.clone(),
                        value: String::new(),
                    }))
                    .collect();

                let mut output = format!("\nTags for {resource_id}:\n\n");
                output.push_str(&Table::new(rows).to_string());
                output.push('\n');
                output
            }
        }
    }

    /// Formats a convergence outcome with color.
    fn format_outcome(outcome: ConvergenceOutcome) -> String {
        match outcome {
            ConvergenceOutcome::Created => "+created".green().to_string(),
            ConvergenceOutcome::Updated => "~updated".yellow().to_string(),
            ConvergenceOutcome::Deleted => "-deleted".red().to_string(),
            ConvergenceOutcome::Unchanged => "unchanged".dimmed().to_string(),
            ConvergenceOutcome::AlreadyAbsent => "absent".dimmed().to_string(),
        }
    }

    /// Formats a registration outcome with color.
    fn format_registration_outcome(outcome: RegistrationOutcome) -> String {
        match outcome {
            RegistrationOutcome::Registered => "registered".green().to_string(),
            RegistrationOutcome::Deregistered => "deregistered".yellow().to_string(),
            RegistrationOutcome::InstanceGone => "instance gone".red().to_string(),
            RegistrationOutcome::AlreadyRegistered | RegistrationOutcome::AlreadyDeregistered => {
                outcome.to_string().dimmed().to_string()
            }
        }
    }

    /// Truncates a string to a maximum length.
    fn truncate(s: &str, max_len: usize) -> String {
        if s.chars().count() <= max_len {
            s.to_string()
        } else {
            let head: String = s.chars().take(max_len.saturating_sub(3)).collect();
            format!("{head}...")
        }
    }
}
