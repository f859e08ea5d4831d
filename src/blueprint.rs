use std::collections::BTreeMap;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;

use crate::action::ActionRegistry;
use crate::core::ArcStr;
use crate::error::{ConfigError, GraphError};
use crate::fingerprint::Sensitivity;
use crate::graph::{Rule, TaskGraph};
use crate::task::{InputProperty, TaskNode};

/// A lightweight token naming a registered task.
///
/// Handles are returned when a task is added and are used to wire the
/// outputs of one task into the inputs of another, which also makes the
/// producer a dependency of the consumer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Handle {
    pub(crate) id: ArcStr,
}

impl Handle {
    pub(crate) fn new(id: impl Into<ArcStr>) -> Self {
        Self { id: id.into() }
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl AsRef<str> for Handle {
    fn as_ref(&self) -> &str {
        &self.id
    }
}

/// The blueprint of a build.
///
/// `Blueprint` collects task declarations, either written in code or read
/// from JSON descriptors. Nothing is validated until [`Blueprint::finish`]
/// turns it into a [`TaskGraph`], which is where duplicate ids and output
/// conflicts are reported.
///
/// # Example
///
/// ```rust,no_run
/// use tsumiki::{Blueprint, TaskNode};
///
/// let mut blueprint = Blueprint::new();
/// let compile = blueprint.add(TaskNode::new("compile").output("classes", "build/classes"));
/// blueprint.add(TaskNode::new("jar").input_from("classes", &compile, "classes"));
///
/// let graph = blueprint.finish().unwrap();
/// ```
#[derive(Default)]
pub struct Blueprint {
    nodes: Vec<TaskNode>,
    rules: Vec<(String, Rule)>,
}

impl Blueprint {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, node: TaskNode) -> Handle {
        let handle = Handle::new(node.id.clone());
        self.nodes.push(node);
        handle
    }

    /// Registers a fallback factory for ids without an explicit task.
    pub fn rule<F>(&mut self, name: impl Into<String>, rule: F) -> &mut Self
    where
        F: Fn(&str) -> Option<TaskNode> + Send + Sync + 'static,
    {
        self.rules.push((name.into(), Box::new(rule)));
        self
    }

    /// Adds tasks described by `descriptors`, binding their action names
    /// through `registry`.
    pub fn declare<I>(&mut self, descriptors: I, registry: &ActionRegistry) -> Result<Vec<Handle>, ConfigError>
    where
        I: IntoIterator<Item = TaskDescriptor>,
    {
        let mut nodes = Vec::new();
        for descriptor in descriptors {
            nodes.push(descriptor.into_node(registry)?);
        }

        Ok(nodes.into_iter().map(|node| self.add(node)).collect())
    }

    /// Adds tasks from a JSON array of descriptors.
    pub fn declare_json(&mut self, json: &str, registry: &ActionRegistry) -> Result<Vec<Handle>, ConfigError> {
        let descriptors: Vec<TaskDescriptor> = serde_json::from_str(json)?;
        self.declare(descriptors, registry)
    }

    pub fn load(&mut self, path: impl AsRef<Utf8Path>, registry: &ActionRegistry) -> Result<Vec<Handle>, ConfigError> {
        let text = std::fs::read_to_string(path.as_ref())?;
        self.declare_json(&text, registry)
    }

    pub fn finish(self) -> Result<TaskGraph, GraphError> {
        let mut graph = TaskGraph::new();

        for node in self.nodes {
            graph.add_node(node)?;
        }

        for (name, rule) in self.rules {
            graph.add_rule(name, rule);
        }

        Ok(graph)
    }
}

impl std::fmt::Display for Blueprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "graph LR")?;

        for node in &self.nodes {
            let name = node.id.replace('"', "\\\"");
            writeln!(f, "    {}[\"{}\"]", mermaid_id(&node.id), name)?;
        }

        for node in &self.nodes {
            for dependency in node.dependencies() {
                writeln!(f, "    {} --> {}", mermaid_id(dependency), mermaid_id(&node.id))?;
            }
            for after in node.ordering() {
                writeln!(f, "    {} -.-> {}", mermaid_id(after), mermaid_id(&node.id))?;
            }
        }

        Ok(())
    }
}

/// Mermaid node ids can't contain most punctuation.
pub(crate) fn mermaid_id(id: &str) -> String {
    let mut out = String::with_capacity(id.len() + 2);
    out.push_str("t_");
    for c in id.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c);
        } else {
            out.push('_');
        }
    }
    out
}

/// Declarative description of a task, as read from configuration.
///
/// ```json
/// {
///   "id": "copyReports",
///   "action": "copy",
///   "inputs": [{ "name": "reports", "paths": ["reports"], "include": ["**/*.pdf"] }],
///   "outputs": [{ "name": "dest", "path": "build/reports" }],
///   "depends_on": ["generateReports"]
/// }
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskDescriptor {
    pub id: String,
    /// Name of an action in the [`ActionRegistry`].
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub inputs: Vec<InputDescriptor>,
    #[serde(default)]
    pub outputs: Vec<OutputDescriptor>,
    #[serde(default)]
    pub values: BTreeMap<String, String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub must_run_after: Vec<String>,
    #[serde(default = "enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub incremental: bool,
    #[serde(default)]
    pub directory_changes: bool,
}

fn enabled() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InputDescriptor {
    pub name: String,
    pub paths: Vec<Utf8PathBuf>,
    #[serde(default)]
    pub sensitivity: Sensitivity,
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OutputDescriptor {
    pub name: String,
    pub path: Utf8PathBuf,
}

impl TaskDescriptor {
    fn into_node(self, registry: &ActionRegistry) -> Result<TaskNode, ConfigError> {
        let mut node = TaskNode::new(&self.id).enabled(self.enabled);

        if self.directory_changes {
            node = node.directory_changes();
        }

        if self.incremental {
            node = node.incremental();
        }

        if let Some(ms) = self.timeout_ms {
            node = node.timeout(Duration::from_millis(ms));
        }

        for input in self.inputs {
            let mut property = InputProperty::new(input.name)
                .paths(input.paths)
                .sensitivity(input.sensitivity);
            for pattern in &input.include {
                property = property.include(pattern)?;
            }
            for pattern in &input.exclude {
                property = property.exclude(pattern)?;
            }
            node = node.input(property);
        }

        for output in self.outputs {
            node = node.output(output.name, output.path);
        }

        for (name, value) in &self.values {
            node = node.value(name.as_str(), value.as_str());
        }

        for dependency in &self.depends_on {
            node = node.depends_on(dependency);
        }

        for after in &self.must_run_after {
            node = node.must_run_after(after);
        }

        if let Some(name) = self.action {
            let action = registry.get(&name).ok_or_else(|| ConfigError::UnknownAction {
                task: self.id.clone(),
                action: name.clone(),
            })?;
            node = node.action_shared(action);
        }

        Ok(node)
    }
}
