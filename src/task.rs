//! Task declarations.
//!
//! A [`TaskNode`] is a plain description: what it reads, what it writes,
//! which tasks it depends on and which actions run when it is out of date.
//! Nodes are immutable once added to a [`TaskGraph`](crate::TaskGraph), the
//! per-run state lives in the [`ExecutionReport`](crate::ExecutionReport).

use std::collections::BTreeMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use glob::PatternError;

use crate::action::{Action, ActionContext};
use crate::blueprint::Handle;
use crate::core::{ArcStr, Hash32};
use crate::deferred::Deferred;
use crate::fingerprint::{PathFilter, Sensitivity};

/// Predicate evaluated right before a task would run.
pub type Predicate = Arc<dyn Fn(&TaskNode) -> bool + Send + Sync>;

/// Where the roots of an input property come from.
#[derive(Clone, Debug)]
pub enum InputSource {
    Paths(Vec<Utf8PathBuf>),
    /// Roots computed on first use.
    Deferred(Deferred<Vec<Utf8PathBuf>>),
    /// The declared output of another task, which becomes a dependency.
    OutputOf { task: ArcStr, property: String },
}

/// A named input of a task: a set of roots fingerprinted with one
/// [`Sensitivity`] and filtered through include/exclude patterns.
#[derive(Clone, Debug)]
pub struct InputProperty {
    pub(crate) name: String,
    pub(crate) sources: Vec<InputSource>,
    pub(crate) sensitivity: Sensitivity,
    pub(crate) filter: PathFilter,
}

impl InputProperty {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sources: Vec::new(),
            sensitivity: Sensitivity::default(),
            filter: PathFilter::default(),
        }
    }

    pub fn path(mut self, path: impl Into<Utf8PathBuf>) -> Self {
        self.sources.push(InputSource::Paths(vec![path.into()]));
        self
    }

    pub fn paths<I>(mut self, paths: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<Utf8PathBuf>,
    {
        let paths = paths.into_iter().map(Into::into).collect();
        self.sources.push(InputSource::Paths(paths));
        self
    }

    pub fn deferred(mut self, roots: Deferred<Vec<Utf8PathBuf>>) -> Self {
        self.sources.push(InputSource::Deferred(roots));
        self
    }

    /// Reads the output `property` declared by the task behind `handle`.
    pub fn output_of(mut self, handle: &Handle, property: impl Into<String>) -> Self {
        self.sources.push(InputSource::OutputOf {
            task: handle.id.clone(),
            property: property.into(),
        });
        self
    }

    pub fn sensitivity(mut self, sensitivity: Sensitivity) -> Self {
        self.sensitivity = sensitivity;
        self
    }

    pub fn include(mut self, pattern: &str) -> Result<Self, PatternError> {
        self.filter.include(pattern)?;
        Ok(self)
    }

    pub fn exclude(mut self, pattern: &str) -> Result<Self, PatternError> {
        self.filter.exclude(pattern)?;
        Ok(self)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Tasks whose outputs feed this property.
    pub(crate) fn producers(&self) -> impl Iterator<Item = &ArcStr> {
        self.sources.iter().filter_map(|source| match source {
            InputSource::OutputOf { task, .. } => Some(task),
            _ => None,
        })
    }
}

#[derive(Clone, Debug)]
pub struct OutputProperty {
    pub(crate) name: String,
    pub(crate) path: Utf8PathBuf,
}

impl OutputProperty {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }
}

/// A unit of work in the task graph.
///
/// ```rust,no_run
/// use std::time::Duration;
/// use tsumiki::{InputProperty, Sensitivity, TaskNode};
///
/// let node = TaskNode::new("archive")
///     .input(InputProperty::new("reports").path("reports").sensitivity(Sensitivity::RelativePath))
///     .output("archive", "build/reports.tar")
///     .timeout(Duration::from_secs(30))
///     .do_last(|ctx| {
///         let _ = ctx.output("archive");
///         Ok(())
///     });
/// ```
pub struct TaskNode {
    pub(crate) id: ArcStr,
    pub(crate) inputs: Vec<InputProperty>,
    pub(crate) values: BTreeMap<String, Hash32>,
    pub(crate) outputs: Vec<OutputProperty>,
    pub(crate) depends_on: Vec<ArcStr>,
    pub(crate) must_run_after: Vec<ArcStr>,
    pub(crate) enabled: bool,
    pub(crate) only_if: Option<Predicate>,
    pub(crate) timeout: Option<Duration>,
    pub(crate) incremental: bool,
    pub(crate) directory_changes: bool,
    pub(crate) actions: Vec<Arc<dyn Action>>,
}

impl TaskNode {
    pub fn new(id: impl AsRef<str>) -> Self {
        Self {
            id: ArcStr::from(id.as_ref()),
            inputs: Vec::new(),
            values: BTreeMap::new(),
            outputs: Vec::new(),
            depends_on: Vec::new(),
            must_run_after: Vec::new(),
            enabled: true,
            only_if: None,
            timeout: None,
            incremental: false,
            directory_changes: false,
            actions: Vec::new(),
        }
    }

    pub fn input(mut self, input: InputProperty) -> Self {
        self.inputs.push(input);
        self
    }

    /// Shorthand for a single-path input with default sensitivity.
    pub fn input_file(self, name: impl Into<String>, path: impl Into<Utf8PathBuf>) -> Self {
        self.input(InputProperty::new(name).path(path))
    }

    /// Shorthand for reading another task's output, which also makes that
    /// task a dependency.
    pub fn input_from(self, name: impl Into<String>, handle: &Handle, property: &str) -> Self {
        self.input(InputProperty::new(name).output_of(handle, property))
    }

    /// A non-file input, any change to it forces a full run.
    pub fn value<T: Hash + ?Sized>(mut self, name: impl Into<String>, value: &T) -> Self {
        self.values.insert(name.into(), Hash32::of(value));
        self
    }

    pub fn output(mut self, name: impl Into<String>, path: impl Into<Utf8PathBuf>) -> Self {
        self.outputs.push(OutputProperty {
            name: name.into(),
            path: path.into(),
        });
        self
    }

    pub fn depends_on(mut self, task: impl AsRef<str>) -> Self {
        self.depends_on.push(ArcStr::from(task.as_ref()));
        self
    }

    /// Orders this task after `task` when both are scheduled, without making
    /// it a dependency.
    pub fn must_run_after(mut self, task: impl AsRef<str>) -> Self {
        self.must_run_after.push(ArcStr::from(task.as_ref()));
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn only_if<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&TaskNode) -> bool + Send + Sync + 'static,
    {
        self.only_if = Some(Arc::new(predicate));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Actions receive a change set instead of assuming a full run.
    pub fn incremental(mut self) -> Self {
        self.incremental = true;
        self
    }

    /// Directory entries are reported in change sets.
    pub fn directory_changes(mut self) -> Self {
        self.directory_changes = true;
        self
    }

    pub fn do_first<F>(mut self, callback: F) -> Self
    where
        F: Fn(&ActionContext) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.actions.insert(0, Arc::new(callback));
        self
    }

    pub fn do_last<F>(mut self, callback: F) -> Self
    where
        F: Fn(&ActionContext) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.actions.push(Arc::new(callback));
        self
    }

    /// Appends a prepared action, such as [`CopyFiles`](crate::action::copy::CopyFiles).
    pub fn action(mut self, action: impl Action + 'static) -> Self {
        self.actions.push(Arc::new(action));
        self
    }

    pub(crate) fn action_shared(mut self, action: Arc<dyn Action>) -> Self {
        self.actions.push(action);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn inputs(&self) -> &[InputProperty] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[OutputProperty] {
        &self.outputs
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_incremental(&self) -> bool {
        self.incremental
    }

    pub fn get_timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Hard dependencies: declared ones first, then producers of inputs.
    pub fn dependencies(&self) -> impl Iterator<Item = &str> {
        self.depends_on
            .iter()
            .chain(self.inputs.iter().flat_map(InputProperty::producers))
            .map(|id| &**id)
    }

    pub fn ordering(&self) -> impl Iterator<Item = &str> {
        self.must_run_after.iter().map(|id| &**id)
    }

    pub(crate) fn should_run(&self) -> bool {
        self.only_if.as_ref().is_none_or(|predicate| predicate(self))
    }
}

impl std::fmt::Debug for TaskNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskNode")
            .field("id", &self.id)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .field("depends_on", &self.depends_on)
            .field("must_run_after", &self.must_run_after)
            .field("enabled", &self.enabled)
            .field("timeout", &self.timeout)
            .field("incremental", &self.incremental)
            .field("actions", &self.actions.len())
            .finish_non_exhaustive()
    }
}
