//! Execution of resolved plans.
//!
//! The [`Engine`] walks a [`Plan`] in dependency order on a rayon pool. For
//! every task it snapshots inputs and outputs, asks the up-to-date
//! [`check`]er whether the task has to run, hands incremental tasks their
//! [change set](build_changes), supervises the actions and finally records
//! the new history in the [`FingerprintStore`].

mod changes;
mod checker;
mod report;
mod runner;
#[cfg(feature = "watch")]
mod watch;
mod watchdog;

use crate::action::CancelToken;
use crate::core::Settings;
use crate::error::{EngineError, GraphError};
use crate::graph::{Plan, TaskGraph};
use crate::store::FingerprintStore;

pub use changes::{ChangeRecord, ChangeType, build_changes};
pub use checker::{Decision, Reason, Verdict, check};
pub use report::{ExecutionReport, SkipReason, TaskRecord, TaskState};

/// Stops a run in progress from any thread.
///
/// Running tasks are cancelled and end up `FAILED`, tasks that haven't
/// started yet are never started. Cancellation is sticky, an engine stays
/// cancelled once this has been called.
#[derive(Debug, Clone)]
pub struct CancelHandle(CancelToken);

impl CancelHandle {
    pub fn cancel(&self) {
        tracing::warn!("cancellation requested");
        self.0.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.is_cancelled()
    }
}

pub struct Engine {
    settings: Settings,
    store: FingerprintStore,
    pool: rayon::ThreadPool,
    cancel: CancelToken,
}

impl Engine {
    /// Creates an engine with the history store found in
    /// [`Settings::store_dir`].
    pub fn new(settings: &Settings) -> Result<Self, EngineError> {
        let store = FingerprintStore::open(&settings.store_dir)?;
        Self::with_store(settings, store)
    }

    pub fn with_store(settings: &Settings, store: FingerprintStore) -> Result<Self, EngineError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(settings.workers())
            .thread_name(|i| format!("tsumiki-worker-{i}"))
            .build()?;

        Ok(Self {
            settings: settings.clone(),
            store,
            pool,
            cancel: CancelToken::new(),
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn store(&self) -> &FingerprintStore {
        &self.store
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle(self.cancel.clone())
    }

    /// Resolves `targets` and executes the resulting plan.
    pub fn run<I>(&self, graph: &mut TaskGraph, targets: I) -> Result<ExecutionReport, GraphError>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        let plan = graph.resolve(targets)?;
        self.execute(graph, &plan)
    }

    /// Executes an already resolved plan. Every task of the plan is in a
    /// terminal state in the returned report.
    ///
    /// Fails with [`GraphError::ForeignPlan`] when `plan` wasn't resolved
    /// from `graph`.
    pub fn execute(&self, graph: &TaskGraph, plan: &Plan) -> Result<ExecutionReport, GraphError> {
        if !plan.belongs_to(graph) {
            return Err(GraphError::ForeignPlan);
        }
        Ok(runner::run_plan(self, graph, plan))
    }
}
