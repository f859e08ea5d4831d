use std::fmt::{Display, Write};
use std::time::Duration;

use console::style;

use crate::blueprint::mermaid_id;
use crate::engine::{ChangeRecord, Verdict};
use crate::error::TaskFailure;
use crate::graph::Edge;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
    Pending,
    Running,
    UpToDate,
    Skipped,
    Succeeded,
    Failed,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, TaskState::Pending | TaskState::Running)
    }

    fn label(self) -> &'static str {
        match self {
            TaskState::Pending => "PENDING",
            TaskState::Running => "RUNNING",
            TaskState::UpToDate => "UP-TO-DATE",
            TaskState::Skipped => "SKIPPED",
            TaskState::Succeeded => "SUCCEEDED",
            TaskState::Failed => "FAILED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Disabled,
    OnlyIf,
    /// Never started because the run was aborted.
    Aborted,
}

impl Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            SkipReason::Disabled => "disabled",
            SkipReason::OnlyIf => "onlyIf was false",
            SkipReason::Aborted => "run was aborted",
        })
    }
}

/// The outcome of one task in a run.
#[derive(Debug)]
pub struct TaskRecord {
    pub id: String,
    pub state: TaskState,
    /// Present for every task that reached the up-to-date check.
    pub verdict: Option<Verdict>,
    pub skip: Option<SkipReason>,
    pub failure: Option<TaskFailure>,
    /// Change set handed to an incremental execution.
    pub changes: Option<Vec<ChangeRecord>>,
    pub duration: Duration,
}

impl TaskRecord {
    pub(crate) fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            state: TaskState::Pending,
            verdict: None,
            skip: None,
            failure: None,
            changes: None,
            duration: Duration::ZERO,
        }
    }
}

/// Terminal state of every task of an executed plan, in plan order.
#[derive(Debug, Default)]
pub struct ExecutionReport {
    pub(crate) records: Vec<TaskRecord>,
    /// Plan edges as positions into `records`.
    pub(crate) edges: Vec<(usize, usize, Edge)>,
    pub(crate) duration: Duration,
}

impl ExecutionReport {
    pub fn records(&self) -> &[TaskRecord] {
        &self.records
    }

    pub fn record(&self, id: &str) -> Option<&TaskRecord> {
        self.records.iter().find(|record| record.id == id)
    }

    pub fn state(&self, id: &str) -> Option<TaskState> {
        self.record(id).map(|record| record.state)
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    fn with_state(&self, state: TaskState) -> Vec<&str> {
        self.records
            .iter()
            .filter(|record| record.state == state)
            .map(|record| record.id.as_str())
            .collect()
    }

    pub fn succeeded(&self) -> Vec<&str> {
        self.with_state(TaskState::Succeeded)
    }

    pub fn skipped(&self) -> Vec<&str> {
        self.with_state(TaskState::Skipped)
    }

    pub fn up_to_date(&self) -> Vec<&str> {
        self.with_state(TaskState::UpToDate)
    }

    pub fn failed(&self) -> Vec<&str> {
        self.with_state(TaskState::Failed)
    }

    pub fn is_success(&self) -> bool {
        self.records.iter().all(|record| record.state != TaskState::Failed)
    }

    /// Renders the executed plan as a Mermaid diagram, color-coded by the
    /// terminal state of each task.
    ///
    /// * **Green**: Succeeded
    /// * **Blue**: Up-to-date
    /// * **Grey**: Skipped
    /// * **Red**: Failed
    pub fn render_mermaid(&self) -> String {
        let mut f = String::new();
        let _ = writeln!(f, "graph LR");

        for record in &self.records {
            let id = mermaid_id(&record.id);
            let name = record.id.replace('"', "\\\"");
            let color = match record.state {
                TaskState::Succeeded => "#90EE90",
                TaskState::UpToDate => "#ADD8E6",
                TaskState::Skipped => "#D3D3D3",
                TaskState::Failed => "#F08080",
                TaskState::Pending | TaskState::Running => "#FFFFFF",
            };

            let _ = writeln!(f, "    {id}[\"{name}\\n{:.2?}\"]", record.duration);
            let _ = writeln!(f, "    style {id} fill:{color}");
        }

        for &(source, target, edge) in &self.edges {
            let arrow = match edge {
                Edge::DependsOn => "-->",
                Edge::MustRunAfter => "-.->",
            };
            let _ = writeln!(
                f,
                "    {} {} {}",
                mermaid_id(&self.records[source].id),
                arrow,
                mermaid_id(&self.records[target].id)
            );
        }

        f
    }
}

impl Display for ExecutionReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for record in &self.records {
            let label = match record.state {
                TaskState::Succeeded => style(record.state.label()).green(),
                TaskState::UpToDate => style(record.state.label()).blue(),
                TaskState::Skipped => style(record.state.label()).dim(),
                TaskState::Failed => style(record.state.label()).red().bold(),
                TaskState::Pending | TaskState::Running => style(record.state.label()).yellow(),
            };

            write!(f, "{:>12} {}", label, record.id)?;

            if let Some(failure) = &record.failure {
                write!(f, ": {failure}")?;
            } else if let Some(skip) = record.skip {
                write!(f, " ({skip})")?;
            } else if let Some(changes) = &record.changes {
                write!(f, " ({} changes)", changes.len())?;
            }

            if record.state == TaskState::Succeeded {
                write!(f, " {}", style(format!("{:.2?}", record.duration)).dim())?;
            }

            writeln!(f)?;
        }

        let summary = format!(
            "{} tasks: {} succeeded, {} up-to-date, {} skipped, {} failed in {:.2?}",
            self.records.len(),
            self.succeeded().len(),
            self.up_to_date().len(),
            self.skipped().len(),
            self.failed().len(),
            self.duration
        );

        if self.is_success() {
            writeln!(f, "{}", style(summary).green())
        } else {
            writeln!(f, "{}", style(summary).red())
        }
    }
}
