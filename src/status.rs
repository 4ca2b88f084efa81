//! Read-only status reporting
//!
//! [`StatusReport`] is built from the compacted snapshots alone. It never
//! opens the append logs or takes the lock, so it can run next to a live
//! batch and may lag it by up to one compaction interval.

use crate::error::Result;
use crate::journal::{index_dir, read_snapshot, Stream};
use crate::progress::StatusCounts;
use crate::types::{ProgressRecord, ProgressStatus, RunEntry, RunStatus};
use chrono::{DateTime, Utc};
use colored::Colorize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write;
use std::path::Path;

/// Default number of recent runs shown per agent
pub const DEFAULT_RECENT_RUNS: usize = 10;

/// State of one App or Variant
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeStatus {
    /// Key without the agent prefix (`App` or `App/Variant`)
    pub name: String,
    /// Current status
    pub status: ProgressStatus,
    /// Last mutation time
    pub updated_at: DateTime<Utc>,
    /// Last error, if any
    pub error: Option<String>,
}

/// Status of one agent
#[derive(Debug, Clone, Default)]
pub struct AgentStatus {
    /// Agent identifier
    pub agent: String,
    /// Apps in name order
    pub apps: Vec<ScopeStatus>,
    /// Variants in name order
    pub variants: Vec<ScopeStatus>,
    /// Image counts per status
    pub images: StatusCounts,
    /// Most recent runs, oldest first
    pub recent_runs: Vec<RunEntry>,
    /// Error entries recorded for the agent
    pub error_count: usize,
}

/// Snapshot-backed status of a logs directory
#[derive(Debug, Clone, Default)]
pub struct StatusReport {
    /// Per-agent sections in agent order
    pub agents: Vec<AgentStatus>,
    /// Oldest compaction time among the snapshots read
    pub as_of: Option<DateTime<Utc>>,
}

impl StatusReport {
    /// Load the report for `agents` (all agents found when empty)
    pub fn load(logs_dir: &Path, agents: &[String], recent_runs: usize) -> Result<Self> {
        let index = index_dir(logs_dir);
        let mut as_of: Option<DateTime<Utc>> = None;
        let mut track = |t: DateTime<Utc>| {
            as_of = Some(as_of.map_or(t, |prev| prev.min(t)));
        };

        let mut tables = Vec::new();
        for stream in [Stream::Apps, Stream::Variants, Stream::Images] {
            let table = match read_snapshot::<BTreeMap<String, ProgressRecord>>(&index, stream)? {
                Some(s) => {
                    track(s.compacted_at);
                    s.data
                }
                None => BTreeMap::new(),
            };
            tables.push(table);
        }
        let runs = match read_snapshot::<Vec<RunEntry>>(&index, Stream::Runs)? {
            Some(s) => {
                track(s.compacted_at);
                s.data
            }
            None => Vec::new(),
        };
        let errors = read_snapshot::<Vec<crate::types::ErrorEntry>>(&index, Stream::Errors)?
            .map(|s| s.data)
            .unwrap_or_default();

        let wanted: BTreeSet<String> = if agents.is_empty() {
            tables
                .iter()
                .flat_map(|t| t.values().map(|r| r.agent.clone()))
                .chain(runs.iter().map(|r| r.agent.clone()))
                .collect()
        } else {
            agents.iter().cloned().collect()
        };

        let scopes = |table: &BTreeMap<String, ProgressRecord>, agent: &str| -> Vec<ScopeStatus> {
            let prefix = format!("{}:", agent);
            table
                .iter()
                .filter(|(_, r)| r.agent == agent)
                .map(|(key, r)| ScopeStatus {
                    name: key.strip_prefix(&prefix).unwrap_or(key).to_string(),
                    status: r.status,
                    updated_at: r.updated_at,
                    error: r.error.clone(),
                })
                .collect()
        };

        let sections = wanted
            .into_iter()
            .map(|agent| {
                let mut images = StatusCounts::default();
                for record in tables[2].values().filter(|r| r.agent == agent) {
                    match record.status {
                        ProgressStatus::Running => images.running += 1,
                        ProgressStatus::Completed => images.completed += 1,
                        ProgressStatus::Failed => images.failed += 1,
                    }
                }

                let agent_runs: Vec<RunEntry> = runs.iter().filter(|r| r.agent == agent).cloned().collect();
                let skip = agent_runs.len().saturating_sub(recent_runs);

                AgentStatus {
                    apps: scopes(&tables[0], &agent),
                    variants: scopes(&tables[1], &agent),
                    images,
                    recent_runs: agent_runs.into_iter().skip(skip).collect(),
                    error_count: errors.iter().filter(|e| e.agent == agent).count(),
                    agent,
                }
            })
            .collect();

        Ok(Self {
            agents: sections,
            as_of,
        })
    }

    /// Render the report for a terminal
    pub fn render(&self) -> String {
        let mut out = String::new();

        if self.agents.is_empty() {
            out.push_str("No progress recorded yet.\n");
            return out;
        }
        if let Some(as_of) = self.as_of {
            let _ = writeln!(out, "{}", format!("As of {}", as_of.to_rfc3339()).dimmed());
        }

        for agent in &self.agents {
            let _ = writeln!(out, "\n{}", format!("Agent: {}", agent.agent).bold());

            let _ = writeln!(out, "  {}", "Apps".underline());
            if agent.apps.is_empty() {
                let _ = writeln!(out, "    (none)");
            }
            for app in &agent.apps {
                let _ = writeln!(out, "    {} {}", status_icon(app.status), app.name);
                for variant in agent
                    .variants
                    .iter()
                    .filter(|v| v.name.starts_with(&format!("{}/", app.name)))
                {
                    let _ = write!(out, "      {} {}", status_icon(variant.status), variant.name);
                    if let Some(error) = &variant.error {
                        let _ = write!(out, " {}", format!("({})", error).red());
                    }
                    out.push('\n');
                }
            }

            let _ = writeln!(
                out,
                "  Images: {} completed, {} running, {} failed",
                agent.images.completed.to_string().green(),
                agent.images.running.to_string().yellow(),
                agent.images.failed.to_string().red()
            );
            if agent.error_count > 0 {
                let _ = writeln!(out, "  Errors recorded: {}", agent.error_count.to_string().red());
            }

            let _ = writeln!(out, "  {}", "Recent runs".underline());
            if agent.recent_runs.is_empty() {
                let _ = writeln!(out, "    (none)");
            }
            for run in &agent.recent_runs {
                let _ = write!(
                    out,
                    "    {} {} {} {}",
                    run_icon(run.status),
                    run.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    run.action,
                    run.status
                );
                if let Some(error) = &run.error {
                    let _ = write!(out, " {}", error.red());
                }
                out.push('\n');
            }
        }
        out
    }
}

fn status_icon(status: ProgressStatus) -> String {
    match status {
        ProgressStatus::Completed => "✔".green().to_string(),
        ProgressStatus::Running => "…".yellow().to_string(),
        ProgressStatus::Failed => "✘".red().to_string(),
    }
}

fn run_icon(status: RunStatus) -> String {
    match status {
        RunStatus::Success => "✔".green().to_string(),
        RunStatus::Started => "▶".blue().to_string(),
        RunStatus::Interrupted => "■".yellow().to_string(),
        RunStatus::Failed => "✘".red().to_string(),
    }
}
