//! Display formatting for CLI output
//!
//! Provides structured display for:
//! - Hibernation status reports
//! - Operation outcomes (what was preserved, deleted and created)
//! - A spinner on stderr while an operation waits

use clap::ValueEnum;
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use std::fmt::Write;
use std::time::Duration;

use dormant_core::{HibernationState, StatusReport, SummaryStatus};
use dormant_kube::HibernateOutcome;

use crate::error::Result;

/// Output format for command results
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text
    #[default]
    Text,
    Json,
    Yaml,
}

impl OutputFormat {
    /// Serialize `value` as JSON or YAML; `None` for text
    pub fn serialize<T: serde::Serialize>(&self, value: &T) -> Result<Option<String>> {
        Ok(match self {
            OutputFormat::Text => None,
            OutputFormat::Json => Some(serde_json::to_string_pretty(value)?),
            OutputFormat::Yaml => Some(serde_yaml::to_string(value)?),
        })
    }
}

/// Which operation produced an outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    On,
    Off,
}

fn summary_style(status: SummaryStatus) -> console::StyledObject<&'static str> {
    let message = status.message();
    match status {
        SummaryStatus::Deployed => style(message).green(),
        SummaryStatus::Hibernated => style(message).cyan(),
        SummaryStatus::Hibernating | SummaryStatus::Resuming => style(message).yellow(),
    }
}

/// Render a status report as text
pub fn render_status(report: &StatusReport) -> String {
    let cluster = &report.cluster;
    let mut out = String::new();

    let _ = writeln!(out, "{}", style("CLUSTER").bold().underlined());
    let _ = writeln!(
        out,
        "  Name:       {}",
        style(cluster.metadata.name.as_deref().unwrap_or_default()).cyan()
    );
    let _ = writeln!(
        out,
        "  Namespace:  {}",
        style(cluster.metadata.namespace.as_deref().unwrap_or_default()).yellow()
    );
    let _ = writeln!(out, "  Instances:  {}", cluster.spec.instances);
    let _ = writeln!(
        out,
        "  Primary:    {}",
        cluster.current_primary().unwrap_or("-")
    );
    let roles: Vec<String> = cluster
        .spec
        .requested_roles()
        .iter()
        .map(ToString::to_string)
        .collect();
    let _ = writeln!(out, "  Storage:    {}", roles.join(", "));

    let _ = writeln!(out);
    let _ = writeln!(out, "{}", style("SUMMARY").bold().underlined());
    let _ = writeln!(out, "  Status:     {}", summary_style(report.status()));

    if !report.pg_control_data.is_empty() {
        let _ = writeln!(out);
        let _ = writeln!(out, "{}", style("PG CONTROL DATA").bold().underlined());
        for line in report.pg_control_data.as_str().lines() {
            let _ = writeln!(out, "  {}", line);
        }
    }
    out
}

/// Render the outcome of hibernate on or off as text
pub fn render_outcome(outcome: &HibernateOutcome, operation: Operation) -> String {
    let mut out = String::new();

    let headline = match (operation, outcome.is_noop()) {
        (Operation::On, true) => format!("Cluster {} already hibernated", outcome.cluster),
        (Operation::On, false) => format!("Cluster {} hibernated", outcome.cluster),
        (Operation::Off, true) => format!("Cluster {} already running", outcome.cluster),
        (Operation::Off, false) => format!("Cluster {} resumed and ready", outcome.cluster),
    };
    let icon = if outcome.is_noop() {
        style("•").dim()
    } else {
        style("✓").green()
    };
    let _ = writeln!(out, "{} {}", icon, style(headline).bold());

    if outcome.initial_state != HibernationState::Active
        && outcome.initial_state != HibernationState::Hibernated
    {
        let _ = writeln!(
            out,
            "  Continued:  interrupted run ({})",
            outcome.initial_state
        );
    }
    if !outcome.preserved.is_empty() {
        let _ = writeln!(out, "  Preserved:  {}", outcome.preserved.join(", "));
    }
    if !outcome.deleted.is_empty() {
        let _ = writeln!(out, "  Deleted:    {} object(s)", outcome.deleted.len());
        for object in &outcome.deleted {
            let _ = writeln!(out, "    {} {}", style("-").red(), object);
        }
    }
    if !outcome.created.is_empty() {
        let _ = writeln!(out, "  Created:    {} object(s)", outcome.created.len());
        for object in &outcome.created {
            let _ = writeln!(out, "    {} {}", style("+").green(), object);
        }
    }
    out
}

/// Spinner on stderr, hidden when stderr is not a terminal
pub fn spinner(message: impl Into<String>) -> ProgressBar {
    if !console::Term::stderr().is_term() {
        return ProgressBar::hidden();
    }
    let bar = ProgressBar::new_spinner();
    bar.set_style(
        ProgressStyle::with_template("{spinner:.cyan} {msg} {elapsed:.dim}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    bar.set_message(message.into());
    bar.enable_steady_tick(Duration::from_millis(100));
    bar
}
