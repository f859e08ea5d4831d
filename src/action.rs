pub mod copy;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use camino::Utf8Path;

use crate::core::ArcStr;
use crate::engine::ChangeRecord;
use crate::fingerprint::{PropertySnapshot, Snapshot};
use crate::task::OutputProperty;

/// The work a task performs when it is out of date.
///
/// Actions are opaque to the engine. They run on a dedicated thread, receive
/// an [`ActionContext`], and either succeed or return an error. Long running
/// actions should poll [`ActionContext::is_cancelled`] so that timeouts and
/// cancellation can take effect early.
pub trait Action: Send + Sync {
    fn execute(&self, ctx: &ActionContext) -> anyhow::Result<()>;
}

impl<F> Action for F
where
    F: Fn(&ActionContext) -> anyhow::Result<()> + Send + Sync,
{
    fn execute(&self, ctx: &ActionContext) -> anyhow::Result<()> {
        self(ctx)
    }
}

/// Cooperative cancellation flag shared between the engine and an action.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Everything an action gets to see about the task it runs for.
pub struct ActionContext {
    pub(crate) task: ArcStr,
    pub(crate) inputs: Arc<Snapshot>,
    pub(crate) outputs: Vec<OutputProperty>,
    pub(crate) changes: Option<Vec<ChangeRecord>>,
    pub(crate) token: CancelToken,
}

impl ActionContext {
    pub(crate) fn new(
        task: ArcStr,
        inputs: Arc<Snapshot>,
        outputs: Vec<OutputProperty>,
        changes: Option<Vec<ChangeRecord>>,
        token: CancelToken,
    ) -> Self {
        Self {
            task,
            inputs,
            outputs,
            changes,
            token,
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task
    }

    /// The input snapshot taken right before the action started.
    pub fn inputs(&self) -> &Snapshot {
        &self.inputs
    }

    pub fn input(&self, name: &str) -> Option<&PropertySnapshot> {
        self.inputs.property(name)
    }

    pub fn outputs(&self) -> &[OutputProperty] {
        &self.outputs
    }

    pub fn output(&self, name: &str) -> Option<&Utf8Path> {
        self.outputs
            .iter()
            .find(|output| output.name == name)
            .map(|output| output.path.as_path())
    }

    /// Changes since the last successful run, only present for incremental
    /// executions.
    pub fn changes(&self) -> Option<&[ChangeRecord]> {
        self.changes.as_deref()
    }

    pub fn is_incremental(&self) -> bool {
        self.changes.is_some()
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Returns an error once the task has been cancelled or timed out.
    pub fn checkpoint(&self) -> anyhow::Result<()> {
        if self.is_cancelled() {
            anyhow::bail!("task {} was cancelled", self.task);
        }
        Ok(())
    }
}

/// Named actions, used to bind declarative task descriptors to code.
#[derive(Clone, Default)]
pub struct ActionRegistry {
    actions: HashMap<String, Arc<dyn Action>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, action: impl Action + 'static) -> &mut Self {
        self.actions.insert(name.into(), Arc::new(action));
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Action>> {
        self.actions.get(name).cloned()
    }
}
