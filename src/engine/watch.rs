//! Continuous mode.
//!
//! The plan is executed once, then the input roots of every planned task
//! are watched with `notify`. Every debounced batch of relevant events
//! executes the same plan again. Nothing special is needed to keep the
//! re-execution cheap, the up-to-date check skips whatever didn't change.
//!
//! Events below declared outputs and the history store are ignored, those
//! paths are written by the engine itself.

use std::collections::HashSet;
use std::path::Path;
use std::sync::mpsc::{RecvTimeoutError, channel};
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use notify::RecursiveMode;
use notify_debouncer_full::{DebouncedEvent, new_debouncer};

use crate::engine::{Engine, ExecutionReport};
use crate::error::WatchError;
use crate::graph::{Plan, TaskGraph};
use crate::utils::normalize_path;

/// Paths a watched plan reacts to.
struct Scope {
    inputs: Vec<Utf8PathBuf>,
    ignored: Vec<Utf8PathBuf>,
}

impl Scope {
    fn new(engine: &Engine, graph: &TaskGraph, plan: &Plan) -> Self {
        let mut inputs = HashSet::new();
        let mut ignored = HashSet::new();

        for node in graph.ordered(plan) {
            for input in &node.inputs {
                inputs.extend(graph.input_roots(input).iter().map(|root| normalize_path(root)));
            }
            for output in &node.outputs {
                ignored.insert(normalize_path(&output.path));
            }
        }
        ignored.insert(normalize_path(engine.store().dir()));

        Self {
            inputs: collapse_watch_paths(inputs),
            ignored: ignored.into_iter().collect(),
        }
    }

    fn is_relevant(&self, path: &Utf8Path) -> bool {
        self.inputs.iter().any(|root| path.starts_with(root))
            && !self.ignored.iter().any(|root| path.starts_with(root))
    }

    fn is_dirty(&self, events: &[DebouncedEvent]) -> bool {
        events
            .iter()
            .filter(|de| !de.event.kind.is_access())
            .flat_map(|de| &de.event.paths)
            .filter_map(|path| Utf8Path::from_path(path))
            .any(|path| self.is_relevant(&normalize_path(path)))
    }

    /// Directories to register with the watcher. A root that doesn't exist
    /// yet is covered by its closest existing ancestor.
    fn watch_roots(&self) -> Vec<Utf8PathBuf> {
        let roots = self.inputs.iter().filter_map(|root| existing_dir(root)).collect();
        collapse_watch_paths(roots)
    }
}

impl Engine {
    /// Executes the plan for `targets`, then keeps executing it again after
    /// every change to one of its inputs.
    ///
    /// `on_report` sees the report of every pass. Returns once the engine is
    /// cancelled through its [`CancelHandle`](crate::engine::CancelHandle).
    pub fn watch<I, F>(
        &self,
        graph: &mut TaskGraph,
        targets: I,
        mut on_report: F,
    ) -> Result<(), WatchError>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
        F: FnMut(&ExecutionReport),
    {
        let plan = graph.resolve(targets)?;

        tracing::info!("running initial build...");
        on_report(&self.execute(graph, &plan)?);

        let scope = Scope::new(self, graph, &plan);
        let (tx, rx) = channel();
        let mut debouncer = new_debouncer(Duration::from_millis(250), None, tx)?;

        for path in scope.watch_roots() {
            tracing::info!("watching {}", path);
            debouncer.watch(&path, RecursiveMode::Recursive)?;
        }

        loop {
            if self.cancel.is_cancelled() {
                tracing::info!("watch cancelled");
                return Ok(());
            }

            match rx.recv_timeout(self.settings.poll_interval().max(Duration::from_millis(50))) {
                Ok(Ok(events)) => {
                    tracing::debug!("{} events received", events.len());
                    if !scope.is_dirty(&events) {
                        continue;
                    }

                    tracing::info!("change detected, re-running tasks...");
                    on_report(&self.execute(graph, &plan)?);
                    tracing::info!("rebuild complete, watching for changes...");
                }
                Ok(Err(errors)) => {
                    for error in errors {
                        tracing::error!("watch error: {error}");
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return Ok(()),
            }
        }
    }
}

fn existing_dir(path: &Utf8Path) -> Option<Utf8PathBuf> {
    let mut current = path;
    loop {
        if Path::new(current).is_dir() {
            return Some(current.to_owned());
        }
        current = current.parent()?;
    }
}

/// Reduces a set of paths to the minimal set of recursive watch roots.
///
/// Sorting puts every path right after its ancestors, so a path is dropped
/// when it lies below the last accepted one.
fn collapse_watch_paths(paths: HashSet<Utf8PathBuf>) -> Vec<Utf8PathBuf> {
    let mut paths: Vec<_> = paths.into_iter().collect();
    paths.sort();

    let mut filtered: Vec<Utf8PathBuf> = Vec::new();
    for path in paths {
        if let Some(last) = filtered.last()
            && path.starts_with(last)
        {
            continue;
        }
        filtered.push(path);
    }

    filtered
}
