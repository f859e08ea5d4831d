//! The task graph and execution planning.
//!
//! Tasks are registered into a [`TaskGraph`] by id. Resolving a set of
//! targets computes the transitive closure over hard dependencies, rejects
//! cycles and produces a [`Plan`]: a petgraph of the closure together with a
//! topological order.
//!
//! ## Edges
//!
//! * `depends_on` and inputs wired to another task's output are hard edges.
//!   They pull the referenced task into the closure and its failure blocks
//!   the dependent.
//! * `must_run_after` only orders two tasks that are both scheduled anyway.
//!   A reference to a task outside the closure is ignored.
//!
//! Among tasks that are otherwise unordered the one registered first comes
//! first, so the same graph always resolves to the same order.

use std::collections::{BTreeSet, HashMap};
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};

use camino::Utf8PathBuf;
use petgraph::Direction;
use petgraph::Graph;
use petgraph::graph::NodeIndex;
use petgraph::visit::EdgeRef;

use crate::blueprint::Handle;
use crate::core::ArcStr;
use crate::error::GraphError;
use crate::fingerprint::{PathFilter, Sensitivity, Snapshot, snapshot_property};
use crate::task::{InputProperty, InputSource, TaskNode};
use crate::utils::normalize_path;

/// Fallback factory for task ids that were never registered explicitly.
pub type Rule = Box<dyn Fn(&str) -> Option<TaskNode> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Edge {
    DependsOn,
    MustRunAfter,
}

/// A resolved set of tasks in execution order.
///
/// Nodes of the inner graph carry the slot of the task in the [`TaskGraph`]
/// it was resolved from, edges point from the task that has to go first.
/// A plan only executes against that same graph.
#[derive(Debug, Clone)]
pub struct Plan {
    source: u64,
    pub(crate) graph: Graph<usize, Edge>,
    pub(crate) order: Vec<NodeIndex>,
    ids: Vec<ArcStr>,
}

impl Plan {
    /// Task ids in execution order.
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(|index| &*self.ids[index.index()])
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Resolved from `graph`. Slots are never reused, so a plan stays valid
    /// while its graph grows.
    pub fn belongs_to(&self, graph: &TaskGraph) -> bool {
        self.source == graph.id
    }

    pub(crate) fn id(&self, index: NodeIndex) -> &ArcStr {
        &self.ids[index.index()]
    }

    /// Hard predecessors of a planned node.
    pub(crate) fn dependencies(&self, index: NodeIndex) -> impl Iterator<Item = NodeIndex> + '_ {
        self.graph
            .edges_directed(index, Direction::Incoming)
            .filter(|edge| *edge.weight() == Edge::DependsOn)
            .map(|edge| edge.source())
    }
}

static NEXT_GRAPH: AtomicU64 = AtomicU64::new(0);

pub struct TaskGraph {
    id: u64,
    nodes: Vec<TaskNode>,
    index: HashMap<ArcStr, usize>,
    /// Normalized output path to the task declaring it.
    outputs: HashMap<Utf8PathBuf, ArcStr>,
    rules: Vec<(String, Rule)>,
}

impl Default for TaskGraph {
    fn default() -> Self {
        Self {
            id: NEXT_GRAPH.fetch_add(1, Ordering::Relaxed),
            nodes: Vec::new(),
            index: HashMap::new(),
            outputs: HashMap::new(),
            rules: Vec::new(),
        }
    }
}

impl TaskGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a task. Fails if the id is taken or one of its outputs is
    /// already declared by another task.
    pub fn add_node(&mut self, node: TaskNode) -> Result<Handle, GraphError> {
        if self.index.contains_key(&node.id) {
            return Err(GraphError::DuplicateTask(node.id.to_string()));
        }

        let mut claimed = Vec::with_capacity(node.outputs.len());
        for output in &node.outputs {
            let path = normalize_path(&output.path);
            if let Some(first) = self.outputs.get(&path) {
                return Err(GraphError::OutputConflict {
                    path: output.path.clone(),
                    first: first.to_string(),
                    second: node.id.to_string(),
                });
            }
            claimed.push(path);
        }

        for path in claimed {
            self.outputs.insert(path, node.id.clone());
        }

        let handle = Handle::new(node.id.clone());
        self.index.insert(node.id.clone(), self.nodes.len());
        self.nodes.push(node);

        Ok(handle)
    }

    /// Registers a fallback factory, consulted in registration order for ids
    /// that have no explicit task.
    pub fn add_rule<F>(&mut self, name: impl Into<String>, rule: F)
    where
        F: Fn(&str) -> Option<TaskNode> + Send + Sync + 'static,
    {
        self.rules.push((name.into(), Box::new(rule)));
    }

    pub fn get(&self, id: &str) -> Option<&TaskNode> {
        self.index.get(id).map(|&slot| &self.nodes[slot])
    }

    pub fn nodes(&self) -> impl Iterator<Item = &TaskNode> {
        self.nodes.iter()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Tasks of a plan in execution order.
    pub fn ordered<'a>(&'a self, plan: &'a Plan) -> impl Iterator<Item = &'a TaskNode> {
        plan.order.iter().map(|&index| self.node(plan, index))
    }

    pub(crate) fn node(&self, plan: &Plan, index: NodeIndex) -> &TaskNode {
        &self.nodes[plan.graph[index]]
    }

    /// Computes the closure of `targets` and orders it.
    pub fn resolve<I>(&mut self, targets: I) -> Result<Plan, GraphError>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        let mut members = BTreeSet::new();
        let mut stack = Vec::new();

        for target in targets {
            let slot = self.lookup(target.as_ref(), None)?;
            if members.insert(slot) {
                stack.push(slot);
            }
        }

        while let Some(slot) = stack.pop() {
            let referrer = self.nodes[slot].id.clone();
            let dependencies: Vec<ArcStr> = self.nodes[slot]
                .dependencies()
                .map(ArcStr::from)
                .collect();

            for dependency in dependencies {
                let found = self.lookup(&dependency, Some(&referrer))?;
                if members.insert(found) {
                    stack.push(found);
                }
            }
        }

        for &slot in &members {
            self.check_wiring(&self.nodes[slot])?;
        }

        let mut graph = Graph::with_capacity(members.len(), members.len());
        let mut position = HashMap::with_capacity(members.len());
        for &slot in &members {
            position.insert(slot, graph.add_node(slot));
        }

        for &slot in &members {
            let node = &self.nodes[slot];
            let target = position[&slot];

            for dependency in node.dependencies() {
                let source = position[&self.index[dependency]];
                if graph.find_edge(source, target).is_none() {
                    graph.add_edge(source, target, Edge::DependsOn);
                }
            }
        }

        for &slot in &members {
            let node = &self.nodes[slot];
            let target = position[&slot];

            for after in node.ordering() {
                let Some(source) = self.index.get(after).and_then(|s| position.get(s)) else {
                    continue;
                };
                if graph.find_edge(*source, target).is_none() {
                    graph.add_edge(*source, target, Edge::MustRunAfter);
                }
            }
        }

        if let Some(members) = find_cycle(&graph) {
            let members = members
                .into_iter()
                .map(|index| self.nodes[graph[index]].id.to_string())
                .collect();
            return Err(GraphError::Cycle { members });
        }

        let order = kahn(&graph);
        let ids = graph
            .node_indices()
            .map(|index| self.nodes[graph[index]].id.clone())
            .collect();

        tracing::debug!("resolved {} tasks", order.len());

        Ok(Plan {
            source: self.id,
            graph,
            order,
            ids,
        })
    }

    fn lookup(&mut self, id: &str, referenced_by: Option<&ArcStr>) -> Result<usize, GraphError> {
        if let Some(&slot) = self.index.get(id) {
            return Ok(slot);
        }

        let produced = self
            .rules
            .iter()
            .find_map(|(name, rule)| rule(id).map(|node| (name.clone(), node)));

        match produced {
            Some((rule, node)) if &*node.id != id => Err(GraphError::RuleMismatch {
                rule,
                requested: id.to_string(),
                produced: node.id.to_string(),
            }),
            Some((rule, node)) => {
                tracing::debug!("rule {} created task {}", rule, id);
                self.add_node(node)?;
                Ok(self.nodes.len() - 1)
            }
            None => Err(match referenced_by {
                Some(referrer) => GraphError::UnknownDependency {
                    id: id.to_string(),
                    referenced_by: referrer.to_string(),
                },
                None => GraphError::UnknownTarget(id.to_string()),
            }),
        }
    }

    /// Every output wired into an input must be declared by its producer.
    fn check_wiring(&self, node: &TaskNode) -> Result<(), GraphError> {
        for input in &node.inputs {
            for source in &input.sources {
                let InputSource::OutputOf { task, property } = source else {
                    continue;
                };

                let declared = self
                    .get(task)
                    .is_some_and(|producer| producer.outputs.iter().any(|o| &o.name == property));

                if !declared {
                    return Err(GraphError::UnknownOutput {
                        task: task.to_string(),
                        property: property.clone(),
                    });
                }
            }
        }

        Ok(())
    }

    /// Current roots of an input property. Deferred roots are evaluated here
    /// the first time they are needed.
    pub(crate) fn input_roots(&self, input: &InputProperty) -> Vec<Utf8PathBuf> {
        let mut roots = Vec::new();

        for source in &input.sources {
            match source {
                InputSource::Paths(paths) => roots.extend(paths.iter().cloned()),
                InputSource::Deferred(deferred) => roots.extend(deferred.get().iter().cloned()),
                InputSource::OutputOf { task, property } => roots.extend(
                    self.get(task)
                        .into_iter()
                        .flat_map(|producer| &producer.outputs)
                        .filter(|output| &output.name == property)
                        .map(|output| output.path.clone()),
                ),
            }
        }

        roots
    }

    pub(crate) fn snapshot_inputs(&self, node: &TaskNode) -> io::Result<Snapshot> {
        let properties = node
            .inputs
            .iter()
            .map(|input| {
                let roots = self.input_roots(input);
                snapshot_property(&input.name, &roots, input.sensitivity, &input.filter)
            })
            .collect::<io::Result<_>>()?;

        Ok(Snapshot {
            properties,
            values: node.values.clone(),
        })
    }

    pub(crate) fn snapshot_outputs(&self, node: &TaskNode) -> io::Result<Snapshot> {
        let filter = PathFilter::default();
        let properties = node
            .outputs
            .iter()
            .map(|output| {
                snapshot_property(
                    &output.name,
                    std::slice::from_ref(&output.path),
                    Sensitivity::AbsolutePath,
                    &filter,
                )
            })
            .collect::<io::Result<_>>()?;

        Ok(Snapshot {
            properties,
            values: Default::default(),
        })
    }
}

impl std::fmt::Debug for TaskGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGraph")
            .field("nodes", &self.nodes)
            .field("rules", &self.rules.iter().map(|(name, _)| name).collect::<Vec<_>>())
            .finish()
    }
}

/// The strongly connected component holding the earliest registered task
/// among those that form a cycle, members in registration order.
fn find_cycle(graph: &Graph<usize, Edge>) -> Option<Vec<NodeIndex>> {
    petgraph::algo::tarjan_scc(graph)
        .into_iter()
        .filter(|scc| scc.len() > 1 || graph.find_edge(scc[0], scc[0]).is_some())
        .map(|mut scc| {
            scc.sort();
            scc
        })
        .min_by_key(|scc| scc[0])
}

/// Kahn's algorithm, the ready set is ordered by registration.
fn kahn(graph: &Graph<usize, Edge>) -> Vec<NodeIndex> {
    let mut degree: Vec<usize> = graph
        .node_indices()
        .map(|index| graph.neighbors_directed(index, Direction::Incoming).count())
        .collect();

    let mut ready: BTreeSet<NodeIndex> = graph
        .node_indices()
        .filter(|index| degree[index.index()] == 0)
        .collect();

    let mut order = Vec::with_capacity(graph.node_count());
    while let Some(index) = ready.pop_first() {
        order.push(index);
        for next in graph.neighbors_directed(index, Direction::Outgoing) {
            degree[next.index()] -= 1;
            if degree[next.index()] == 0 {
                ready.insert(next);
            }
        }
    }

    order
}
