use std::{collections::HashSet, path::PathBuf};

use serde::{Deserialize, Serialize};

use crate::jobs::transcode::{EncodeOptions, ProgressSample};

pub mod transcode;

/// Lifecycle of a job, and (coarser) of a whole batch.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    #[default]
    Idle,
    Running,
    CancelRequested,
    Cancelled,
    Succeeded,
    Failed,
}

impl ExecutionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Succeeded | Self::Failed)
    }

    /// Allowed moves. `Idle -> Failed` covers jobs whose command could not be built.
    pub fn can_transition_to(&self, next: ExecutionState) -> bool {
        use ExecutionState::*;
        matches!(
            (self, next),
            (Idle, Running)
                | (Idle, Failed)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, CancelRequested)
                | (CancelRequested, Cancelled)
                | (CancelRequested, Succeeded)
                | (CancelRequested, Failed)
        )
    }
}

/// One source file with its resolved encoder invocation. Built right before it runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub index: usize,
    pub source: PathBuf,
    pub output: PathBuf,
    pub argv: Vec<String>,
}

impl Job {
    pub fn name(&self) -> String {
        display_name(&self.source)
    }
}

pub fn display_name(source: &std::path::Path) -> String {
    source
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| source.display().to_string())
}

/// Where a job ended up. A job still `Idle` at the end of a batch was never attempted.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct JobReport {
    pub index: usize,
    pub source: PathBuf,
    pub output: Option<PathBuf>,
    pub state: ExecutionState,
    /// Encoder exit code, kept for failed jobs
    pub exit_code: Option<i32>,
    pub reason: Option<String>,
}

impl JobReport {
    pub fn pending(index: usize, source: PathBuf) -> Self {
        Self {
            index,
            source,
            output: None,
            state: ExecutionState::Idle,
            exit_code: None,
            reason: None,
        }
    }

    pub fn attempted(&self) -> bool {
        self.state != ExecutionState::Idle
    }

    /// Move to `next`, ignoring moves the state machine does not allow.
    pub fn advance(&mut self, next: ExecutionState) -> bool {
        if self.state.can_transition_to(next) {
            self.state = next;
            true
        } else {
            tracing::warn!(
                "job {} cannot move from {:?} to {:?}",
                self.index,
                self.state,
                next
            );
            false
        }
    }

    pub fn fail(&mut self, reason: impl Into<String>, exit_code: Option<i32>) {
        self.advance(ExecutionState::Failed);
        self.reason = Some(reason.into());
        self.exit_code = exit_code;
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct BatchSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub not_attempted: usize,
    /// Whether a stop was requested during the run
    pub stopped: bool,
    pub jobs: Vec<JobReport>,
}

impl BatchSummary {
    pub fn from_reports(jobs: Vec<JobReport>, stopped: bool) -> Self {
        let count = |state| jobs.iter().filter(|j| j.state == state).count();
        Self {
            total: jobs.len(),
            succeeded: count(ExecutionState::Succeeded),
            failed: count(ExecutionState::Failed),
            cancelled: count(ExecutionState::Cancelled),
            not_attempted: jobs.iter().filter(|j| !j.attempted()).count(),
            stopped,
            jobs,
        }
    }
}

/// Everything a presentation layer can observe, in delivery order.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BatchEvent {
    OptionsChanged {
        options: EncodeOptions,
    },
    JobStarted {
        index: usize,
        total: usize,
        name: String,
        argv: Vec<String>,
    },
    Log {
        index: usize,
        line: String,
    },
    Progress {
        index: usize,
        total: usize,
        name: String,
        sample: ProgressSample,
    },
    JobFinished {
        report: JobReport,
    },
    BatchFinished {
        summary: BatchSummary,
    },
}

/// Trim entries, drop blanks and duplicates, keep the first-seen order.
pub fn normalize_file_list<I, S>(entries: I) -> Vec<PathBuf>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = HashSet::new();
    entries
        .into_iter()
        .flat_map(|e| {
            e.as_ref()
                .lines()
                .map(|l| l.trim().to_string())
                .collect::<Vec<_>>()
        })
        .filter(|l| !l.is_empty())
        .filter(|l| seen.insert(l.clone()))
        .map(PathBuf::from)
        .collect()
}
