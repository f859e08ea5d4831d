use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::mpsc::{RecvTimeoutError, channel};
use std::time::{Duration, Instant};

use indicatif::ProgressStyle;
use petgraph::Direction;
use petgraph::graph::NodeIndex;
use petgraph::visit::EdgeRef;
use tracing::Level;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::action::{ActionContext, CancelToken};
use crate::engine::watchdog::supervise;
use crate::engine::{
    ChangeRecord, Decision, Engine, ExecutionReport, Reason, SkipReason, TaskRecord, TaskState,
    Verdict, build_changes, check,
};
use crate::error::TaskFailure;
use crate::graph::{Plan, TaskGraph};
use crate::task::TaskNode;
use crate::utils::{get_style_run, get_style_task};

/// What became of a single task.
struct Outcome {
    state: TaskState,
    verdict: Option<Verdict>,
    skip: Option<SkipReason>,
    failure: Option<TaskFailure>,
    changes: Option<Vec<ChangeRecord>>,
    duration: Duration,
}

impl Outcome {
    fn new(state: TaskState) -> Self {
        Self {
            state,
            verdict: None,
            skip: None,
            failure: None,
            changes: None,
            duration: Duration::ZERO,
        }
    }

    fn skipped(reason: SkipReason) -> Self {
        Self {
            skip: Some(reason),
            ..Self::new(TaskState::Skipped)
        }
    }

    fn failed(failure: TaskFailure) -> Self {
        Self {
            failure: Some(failure),
            ..Self::new(TaskState::Failed)
        }
    }

    fn settle(self, record: &mut TaskRecord) {
        record.state = self.state;
        record.verdict = self.verdict;
        record.skip = self.skip;
        record.failure = self.failure;
        record.changes = self.changes;
        record.duration = self.duration;
    }
}

/// Executes the plan on the engine's pool.
///
/// The scheduler works as follows:
/// 1. Every task starts with a count of its unfinished predecessors, over
///    both kinds of edges. Tasks with a count of zero are ready.
/// 2. The calling thread takes ready tasks in plan order. Disabled, skipped
///    and blocked tasks are settled right away, the rest is spawned on the
///    pool as long as there is a free worker.
/// 3. Workers send their outcome back over a channel. Each settled task
///    decrements the counts of its successors, which may make them ready.
/// 4. The loop ends once every task is settled.
///
/// After a failure in fail-fast mode, or after cancellation, no new task is
/// started. Tasks that become ready afterwards are skipped, or failed when
/// one of their dependencies failed.
pub(crate) fn run_plan(engine: &Engine, graph: &TaskGraph, plan: &Plan) -> ExecutionReport {
    let started = Instant::now();
    let count = plan.graph.node_count();

    if count == 0 {
        return ExecutionReport::default();
    }

    let mut records: Vec<TaskRecord> = plan
        .graph
        .node_indices()
        .map(|index| TaskRecord::new(plan.id(index)))
        .collect();

    let mut position = vec![0; count];
    for (at, index) in plan.order.iter().enumerate() {
        position[index.index()] = at;
    }

    let mut remaining: Vec<usize> = plan
        .graph
        .node_indices()
        .map(|index| plan.graph.neighbors_directed(index, Direction::Incoming).count())
        .collect();

    let mut ready: BTreeSet<(usize, NodeIndex)> = plan
        .graph
        .node_indices()
        .filter(|index| remaining[index.index()] == 0)
        .map(|index| (position[index.index()], index))
        .collect();

    let root_span = tracing::span!(Level::INFO, "running_tasks");
    root_span.pb_set_length(count as u64);
    root_span.pb_set_style(&get_style_run());
    root_span.pb_set_message("Running tasks...");
    let _enter = root_span.enter();

    let task_style = get_style_task();
    let workers = engine.settings.workers();
    let fail_fast = engine.settings.fail_fast;
    let poll = engine.settings.poll_interval();

    let mut aborted = false;
    let mut running = 0;
    let mut finished = 0;

    engine.pool.in_place_scope(|scope| {
        let (sender, receiver) = channel::<(NodeIndex, Outcome)>();

        // settles a task and unlocks its successors
        let mut complete = |records: &mut Vec<TaskRecord>,
                            ready: &mut BTreeSet<(usize, NodeIndex)>,
                            index: NodeIndex,
                            outcome: Outcome| {
            outcome.settle(&mut records[index.index()]);
            root_span.pb_inc(1);

            for next in plan.graph.neighbors_directed(index, Direction::Outgoing) {
                remaining[next.index()] -= 1;
                if remaining[next.index()] == 0 {
                    ready.insert((position[next.index()], next));
                }
            }
        };

        loop {
            if !aborted && engine.cancel.is_cancelled() {
                tracing::warn!("run was cancelled, no more tasks will be started");
                aborted = true;
            }

            while let Some(&(_, index)) = ready.first() {
                if let Some(outcome) = admit(graph, plan, &records, index, aborted) {
                    ready.pop_first();
                    complete(&mut records, &mut ready, index, outcome);
                    finished += 1;
                    continue;
                }

                if running >= workers {
                    break;
                }

                ready.pop_first();
                records[index.index()].state = TaskState::Running;
                running += 1;

                let sender = sender.clone();
                let style = task_style.clone();
                scope.spawn(move |_| {
                    let outcome = run_task(engine, graph, plan, index, &style);
                    // the scheduler outlives every worker
                    let _ = sender.send((index, outcome));
                });
            }

            if finished == count {
                break;
            }

            if running == 0 && ready.is_empty() {
                tracing::error!("scheduler stalled with {} unsettled tasks", count - finished);
                break;
            }

            match receiver.recv_timeout(poll) {
                Ok((index, outcome)) => {
                    running -= 1;
                    if outcome.state == TaskState::Failed && fail_fast && !aborted {
                        tracing::warn!("task {} failed, no more tasks will be started", plan.id(index));
                        aborted = true;
                    }
                    complete(&mut records, &mut ready, index, outcome);
                    finished += 1;
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
    });

    for record in records.iter_mut().filter(|record| !record.state.is_terminal()) {
        Outcome::skipped(SkipReason::Aborted).settle(record);
    }

    let edges = plan
        .graph
        .edge_references()
        .map(|edge| {
            (
                position[edge.source().index()],
                position[edge.target().index()],
                *edge.weight(),
            )
        })
        .collect();

    let mut slots: Vec<Option<TaskRecord>> = records.into_iter().map(Some).collect();
    let records = plan
        .order
        .iter()
        .filter_map(|index| slots[index.index()].take())
        .collect();

    let report = ExecutionReport {
        records,
        edges,
        duration: started.elapsed(),
    };

    tracing::info!(
        "{} tasks finished in {:.2?}, {} failed",
        count,
        report.duration(),
        report.failed().len()
    );

    report
}

/// Settles a ready task without running it, if it doesn't get to run.
fn admit(
    graph: &TaskGraph,
    plan: &Plan,
    records: &[TaskRecord],
    index: NodeIndex,
    aborted: bool,
) -> Option<Outcome> {
    let node = graph.node(plan, index);
    let failed = plan
        .dependencies(index)
        .find(|dependency| records[dependency.index()].state == TaskState::Failed)
        .map(|dependency| plan.id(dependency).to_string());

    let outcome = if !node.is_enabled() {
        Outcome::skipped(SkipReason::Disabled)
    } else if aborted {
        match failed {
            Some(dependency) => Outcome::failed(TaskFailure::DependencyFailed(dependency)),
            None => Outcome::skipped(SkipReason::Aborted),
        }
    } else if !node.should_run() {
        Outcome::skipped(SkipReason::OnlyIf)
    } else if let Some(dependency) = failed {
        Outcome::failed(TaskFailure::DependencyFailed(dependency))
    } else {
        return None;
    };

    match (&outcome.skip, &outcome.failure) {
        (Some(reason), _) => tracing::info!("task {} skipped: {}", node.id(), reason),
        (_, Some(failure)) => tracing::error!("task {} not run: {}", node.id(), failure),
        _ => {}
    }

    Some(outcome)
}

fn run_task(
    engine: &Engine,
    graph: &TaskGraph,
    plan: &Plan,
    index: NodeIndex,
    style: &ProgressStyle,
) -> Outcome {
    let node = graph.node(plan, index);

    let span = tracing::span!(Level::INFO, "task", id = node.id());
    span.pb_set_style(style);
    span.pb_set_message(&format!("Running {}", node.id()));
    let _enter = span.enter();

    let started = Instant::now();
    let mut outcome = Outcome::new(TaskState::Running);

    match execute_task(engine, graph, node, &mut outcome) {
        Ok(state) => outcome.state = state,
        Err(failure) => {
            tracing::error!("task {} failed: {}", node.id(), failure);
            outcome.state = TaskState::Failed;
            outcome.failure = Some(failure);
        }
    }

    outcome.duration = started.elapsed();
    outcome
}

fn execute_task(
    engine: &Engine,
    graph: &TaskGraph,
    node: &TaskNode,
    outcome: &mut Outcome,
) -> Result<TaskState, TaskFailure> {
    let settings = &engine.settings;

    let inputs = graph.snapshot_inputs(node).map_err(TaskFailure::Snapshot)?;
    let outputs = graph.snapshot_outputs(node).map_err(TaskFailure::Snapshot)?;

    let (history, verdict) = if settings.rerun {
        (None, Verdict::new(Decision::RunFull, Reason::Rerun))
    } else {
        let history = engine.store.load(node.id());
        let verdict = check(node, history.as_ref(), &inputs, &outputs);
        (history, verdict)
    };
    outcome.verdict = Some(verdict);

    if verdict.decision == Decision::UpToDate {
        tracing::info!("task {} is up-to-date", node.id());
        return Ok(TaskState::UpToDate);
    }

    tracing::info!("task {} is not up-to-date: {}", node.id(), verdict.reason);

    let changes = match (verdict.decision, &history) {
        (Decision::RunIncremental, Some(history)) => Some(build_changes(
            &history.inputs,
            &inputs,
            node.directory_changes,
        )),
        _ => None,
    };
    outcome.changes = changes.clone();

    if engine.cancel.is_cancelled() {
        return Err(TaskFailure::Cancelled);
    }

    let inputs = Arc::new(inputs);
    let ctx = ActionContext::new(
        node.id.clone(),
        inputs.clone(),
        node.outputs.clone(),
        changes,
        CancelToken::new(),
    );

    supervise(
        node.actions.clone(),
        ctx,
        node.get_timeout(),
        settings.poll_interval(),
        &engine.cancel,
    )?;

    // a cancelled run records nothing for tasks that were still running
    if engine.cancel.is_cancelled() {
        return Err(TaskFailure::Cancelled);
    }

    let outputs = graph.snapshot_outputs(node).map_err(TaskFailure::Snapshot)?;
    engine
        .store
        .commit(node.id(), &inputs, &outputs)
        .map_err(TaskFailure::Commit)?;

    Ok(TaskState::Succeeded)
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::thread;

    use camino::Utf8PathBuf;

    use super::*;
    use crate::action::copy::CopyFiles;
    use crate::core::Settings;
    use crate::engine::ChangeType;
    use crate::deferred::Deferred;
    use crate::error::GraphError;
    use crate::fingerprint::Sensitivity;
    use crate::task::InputProperty;

    struct Workspace {
        _dir: tempfile::TempDir,
        root: Utf8PathBuf,
        settings: Settings,
    }

    impl Workspace {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
            let settings = Settings {
                store_dir: root.join(".store"),
                parallelism: Some(4),
                poll_interval_ms: 2,
                ..Settings::default()
            };

            Self {
                _dir: dir,
                root,
                settings,
            }
        }

        fn path(&self, rel: &str) -> Utf8PathBuf {
            self.root.join(rel)
        }

        fn write(&self, rel: &str, text: &str) {
            let path = self.path(rel);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, text).unwrap();
        }

        /// A fresh engine, as if the process was restarted.
        fn engine(&self) -> Engine {
            Engine::new(&self.settings).unwrap()
        }

        fn run(&self, graph: &mut TaskGraph, targets: &[&str]) -> ExecutionReport {
            self.engine().run(graph, targets).unwrap()
        }
    }

    fn noop(_: &ActionContext) -> anyhow::Result<()> {
        Ok(())
    }

    /// Writes `text` to the first declared output.
    fn emit(text: &'static str) -> impl Fn(&ActionContext) -> anyhow::Result<()> + Send + Sync + 'static {
        move |ctx: &ActionContext| {
            let path = ctx.outputs()[0].path();
            fs::create_dir_all(path.parent().unwrap())?;
            fs::write(path, text)?;
            Ok(())
        }
    }

    fn graph(nodes: Vec<TaskNode>) -> TaskGraph {
        let mut graph = TaskGraph::new();
        for node in nodes {
            graph.add_node(node).unwrap();
        }
        graph
    }

    fn verdict(report: &ExecutionReport, id: &str) -> Verdict {
        report.record(id).unwrap().verdict.unwrap()
    }

    #[test]
    fn test_second_run_is_up_to_date() {
        let ws = Workspace::new();
        ws.write("src/a.txt", "a");
        ws.write("src/nested/b.txt", "b");

        let build = |ws: &Workspace| {
            graph(vec![
                TaskNode::new("compile")
                    .input_file("src", ws.path("src"))
                    .output("classes", ws.path("out/classes.txt"))
                    .do_last(emit("classes")),
                TaskNode::new("jar")
                    .depends_on("compile")
                    .input_file("classes", ws.path("out/classes.txt"))
                    .output("jar", ws.path("out/app.jar"))
                    .do_last(emit("jar")),
            ])
        };

        let first = ws.run(&mut build(&ws), &["jar"]);
        assert_eq!(first.succeeded(), vec!["compile", "jar"]);
        assert_eq!(verdict(&first, "compile").reason, Reason::NoHistory);

        let second = ws.run(&mut build(&ws), &["jar"]);
        assert_eq!(second.up_to_date(), vec!["compile", "jar"]);
        assert!(second.is_success());
    }

    #[test]
    fn test_one_modified_file() {
        let ws = Workspace::new();
        ws.write("src/a.txt", "a");
        ws.write("src/b.txt", "b");
        ws.write("other.txt", "other");

        let build = |ws: &Workspace| {
            graph(vec![
                TaskNode::new("sync")
                    .input(
                        InputProperty::new("src")
                            .path(ws.path("src"))
                            .sensitivity(Sensitivity::RelativePath),
                    )
                    .output("dest", ws.path("out/sync"))
                    .incremental()
                    .action(CopyFiles::new(ws.path("out/sync"))),
                TaskNode::new("full")
                    .input_file("src", ws.path("src"))
                    .do_last(noop),
                TaskNode::new("other")
                    .input_file("other", ws.path("other.txt"))
                    .do_last(noop),
            ])
        };

        let targets = ["sync", "full", "other"];
        ws.run(&mut build(&ws), &targets);
        assert_eq!(fs::read_to_string(ws.path("out/sync/b.txt")).unwrap(), "b");

        ws.write("src/b.txt", "changed");
        let report = ws.run(&mut build(&ws), &targets);

        let sync = report.record("sync").unwrap();
        assert_eq!(sync.state, TaskState::Succeeded);
        assert_eq!(sync.verdict.unwrap().decision, Decision::RunIncremental);

        let changes = sync.changes.as_ref().unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].change, ChangeType::Modified);
        assert_eq!(changes[0].key, "b.txt");
        assert_eq!(fs::read_to_string(ws.path("out/sync/b.txt")).unwrap(), "changed");

        assert_eq!(
            verdict(&report, "full"),
            Verdict::new(Decision::RunFull, Reason::InputsChanged)
        );
        assert_eq!(report.state("other"), Some(TaskState::UpToDate));
    }

    #[test]
    fn test_tampered_output_reruns_producer_and_consumer() {
        let ws = Workspace::new();
        let runs = Arc::new(AtomicUsize::new(0));

        let build = |ws: &Workspace| {
            let mut graph = TaskGraph::new();
            let counter = runs.clone();
            let a = graph
                .add_node(TaskNode::new("a").output("out", ws.path("out/a.txt")).do_last(
                    move |ctx: &ActionContext| {
                        let n = counter.fetch_add(1, Ordering::SeqCst);
                        let path = ctx.output("out").unwrap();
                        fs::create_dir_all(path.parent().unwrap())?;
                        fs::write(path, format!("a{n}"))?;
                        Ok(())
                    },
                ))
                .unwrap();
            graph
                .add_node(
                    TaskNode::new("b")
                        .input_from("a", &a, "out")
                        .output("out", ws.path("out/b.txt"))
                        .do_last(|ctx: &ActionContext| {
                            let from = ctx.input("a").unwrap().files().next().unwrap();
                            fs::copy(&from.path, ctx.output("out").unwrap())?;
                            Ok(())
                        }),
                )
                .unwrap();
            graph
        };

        let first = ws.run(&mut build(&ws), &["b"]);
        assert_eq!(first.succeeded(), vec!["a", "b"]);
        assert_eq!(verdict(&first, "a").decision, Decision::RunFull);
        assert_eq!(verdict(&first, "b").decision, Decision::RunFull);

        let second = ws.run(&mut build(&ws), &["b"]);
        assert_eq!(second.up_to_date(), vec!["a", "b"]);

        ws.write("out/a.txt", "tampered");
        let third = ws.run(&mut build(&ws), &["b"]);

        assert_eq!(
            verdict(&third, "a"),
            Verdict::new(Decision::RunFull, Reason::OutputsChanged)
        );
        assert_eq!(
            verdict(&third, "b"),
            Verdict::new(Decision::RunFull, Reason::InputsChanged)
        );
        assert_eq!(third.succeeded(), vec!["a", "b"]);
        assert_eq!(fs::read_to_string(ws.path("out/b.txt")).unwrap(), "a1");
    }

    #[test]
    fn test_disabled_task() {
        let ws = Workspace::new();
        ws.write("in.txt", "1");
        let ran = Arc::new(AtomicBool::new(false));

        let build = |ws: &Workspace| {
            let flag = ran.clone();
            graph(vec![
                TaskNode::new("off")
                    .input_file("in", ws.path("in.txt"))
                    .enabled(false)
                    .do_last(move |_: &ActionContext| {
                        flag.store(true, Ordering::SeqCst);
                        Ok(())
                    }),
                TaskNode::new("after").depends_on("off").do_last(noop),
            ])
        };

        let first = ws.run(&mut build(&ws), &["after"]);
        assert_eq!(first.skipped(), vec!["off"]);
        assert_eq!(first.record("off").unwrap().skip, Some(SkipReason::Disabled));
        assert_eq!(first.succeeded(), vec!["after"]);

        ws.write("in.txt", "2");
        let second = ws.run(&mut build(&ws), &["after"]);
        assert_eq!(second.skipped(), vec!["off"]);
        assert_eq!(second.up_to_date(), vec!["after"]);
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_only_if() {
        let ws = Workspace::new();
        let mut graph = graph(vec![
            TaskNode::new("maybe").only_if(|_| false).do_last(|_: &ActionContext| {
                anyhow::bail!("must not run")
            }),
            TaskNode::new("next").depends_on("maybe").do_last(noop),
        ]);

        let report = ws.run(&mut graph, &["next"]);
        assert_eq!(report.record("maybe").unwrap().skip, Some(SkipReason::OnlyIf));
        assert_eq!(report.state("next"), Some(TaskState::Succeeded));
    }

    #[test]
    fn test_timeout_fails_dependents() {
        let ws = Workspace::new();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();

        let mut graph = graph(vec![
            TaskNode::new("slow")
                .timeout(Duration::from_millis(50))
                .do_last(|ctx: &ActionContext| {
                    while !ctx.is_cancelled() {
                        thread::sleep(Duration::from_millis(1));
                    }
                    Ok(())
                }),
            TaskNode::new("dependent").depends_on("slow").do_last(move |_: &ActionContext| {
                flag.store(true, Ordering::SeqCst);
                Ok(())
            }),
            TaskNode::new("sibling").do_last(noop),
        ]);

        let engine = ws.engine();
        let report = engine.run(&mut graph, ["dependent", "sibling"]).unwrap();

        let slow = report.record("slow").unwrap();
        assert_eq!(slow.state, TaskState::Failed);
        assert!(matches!(slow.failure, Some(TaskFailure::TimeoutExceeded(_))));

        let dependent = report.record("dependent").unwrap();
        assert_eq!(dependent.state, TaskState::Failed);
        assert!(matches!(&dependent.failure, Some(TaskFailure::DependencyFailed(id)) if id == "slow"));
        assert!(!ran.load(Ordering::SeqCst));

        assert_eq!(report.state("sibling"), Some(TaskState::Succeeded));
        assert!(engine.store().load("slow").is_none());
    }

    #[test]
    fn test_failure_keeps_previous_history() {
        let ws = Workspace::new();
        ws.write("in.txt", "1");
        let fail = Arc::new(AtomicBool::new(false));

        let build = |ws: &Workspace| {
            let fail = fail.clone();
            graph(vec![TaskNode::new("t").input_file("in", ws.path("in.txt")).do_last(
                move |_: &ActionContext| {
                    if fail.load(Ordering::SeqCst) {
                        anyhow::bail!("broken");
                    }
                    Ok(())
                },
            )])
        };

        ws.run(&mut build(&ws), &["t"]);
        let recorded = ws.engine().store().load("t").unwrap();

        ws.write("in.txt", "2");
        fail.store(true, Ordering::SeqCst);
        let failed = ws.run(&mut build(&ws), &["t"]);
        assert!(matches!(failed.record("t").unwrap().failure, Some(TaskFailure::Action(_))));
        assert_eq!(ws.engine().store().load("t").unwrap(), recorded);

        fail.store(false, Ordering::SeqCst);
        let retried = ws.run(&mut build(&ws), &["t"]);
        assert_eq!(retried.succeeded(), vec!["t"]);
    }

    #[test]
    fn test_fail_fast() {
        let mut ws = Workspace::new();
        ws.settings.parallelism = Some(1);

        let build = || {
            graph(vec![
                TaskNode::new("bad").do_last(|_: &ActionContext| anyhow::bail!("broken")),
                TaskNode::new("later").do_last(noop),
                TaskNode::new("blocked").depends_on("bad").do_last(noop),
            ])
        };

        let report = ws.run(&mut build(), &["bad", "later", "blocked"]);
        assert_eq!(report.failed(), vec!["bad", "blocked"]);
        assert_eq!(report.succeeded(), vec!["later"]);

        ws.settings.fail_fast = true;
        let report = ws.run(&mut build(), &["bad", "later", "blocked"]);
        assert_eq!(report.failed(), vec!["bad", "blocked"]);
        assert_eq!(report.record("later").unwrap().skip, Some(SkipReason::Aborted));
    }

    #[test]
    fn test_cancel() {
        let mut ws = Workspace::new();
        ws.settings.parallelism = Some(1);

        let mut graph = graph(vec![
            TaskNode::new("slow").do_last(|ctx: &ActionContext| {
                while !ctx.is_cancelled() {
                    thread::sleep(Duration::from_millis(1));
                }
                Ok(())
            }),
            TaskNode::new("queued").do_last(noop),
            TaskNode::new("next").depends_on("slow").do_last(noop),
        ]);

        let engine = ws.engine();
        let handle = engine.cancel_handle();
        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            handle.cancel();
        });

        let report = engine.run(&mut graph, ["slow", "queued", "next"]).unwrap();
        canceller.join().unwrap();

        assert!(matches!(report.record("slow").unwrap().failure, Some(TaskFailure::Cancelled)));
        assert_eq!(report.state("next"), Some(TaskState::Failed));
        assert_eq!(report.record("queued").unwrap().skip, Some(SkipReason::Aborted));
        assert!(report.records().iter().all(|record| record.state.is_terminal()));
        assert!(engine.store().load("slow").is_none());
    }

    #[test]
    fn test_panic_is_contained() {
        let ws = Workspace::new();
        let mut graph = graph(vec![
            TaskNode::new("boom").do_last(|_: &ActionContext| panic!("boom")),
            TaskNode::new("fine").do_last(noop),
        ]);

        let report = ws.run(&mut graph, &["boom", "fine"]);
        assert!(matches!(report.record("boom").unwrap().failure, Some(TaskFailure::Panicked(_))));
        assert_eq!(report.state("fine"), Some(TaskState::Succeeded));
    }

    #[test]
    fn test_rerun() {
        let mut ws = Workspace::new();
        let build = || graph(vec![TaskNode::new("t").do_last(noop)]);

        ws.run(&mut build(), &["t"]);
        ws.settings.rerun = true;
        let report = ws.run(&mut build(), &["t"]);

        assert_eq!(verdict(&report, "t"), Verdict::new(Decision::RunFull, Reason::Rerun));
    }

    #[test]
    fn test_cycle_runs_nothing() {
        let ws = Workspace::new();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();

        let mut graph = graph(vec![
            TaskNode::new("a").depends_on("b").do_last(move |_: &ActionContext| {
                flag.store(true, Ordering::SeqCst);
                Ok(())
            }),
            TaskNode::new("b").must_run_after("a"),
        ]);

        let result = ws.engine().run(&mut graph, ["a"]);
        assert!(matches!(result, Err(GraphError::Cycle { .. })));
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_must_run_after_failure_does_not_block() {
        let ws = Workspace::new();
        let mut graph = graph(vec![
            TaskNode::new("lint").do_last(|_: &ActionContext| anyhow::bail!("style")),
            TaskNode::new("test").must_run_after("lint").do_last(noop),
        ]);

        let report = ws.run(&mut graph, &["test", "lint"]);
        assert_eq!(report.records()[0].id, "lint");
        assert_eq!(report.state("test"), Some(TaskState::Succeeded));
    }

    #[test]
    fn test_deferred_roots() {
        let ws = Workspace::new();
        ws.write("gen/a.txt", "a");
        let root = ws.path("gen");
        let roots = Deferred::new(move || vec![root.clone()]);

        let mut graph = graph(vec![
            TaskNode::new("t")
                .input(InputProperty::new("gen").deferred(roots.clone()))
                .do_last(|ctx: &ActionContext| {
                    anyhow::ensure!(ctx.input("gen").unwrap().files().count() == 1);
                    Ok(())
                }),
        ]);

        assert!(!roots.is_evaluated());
        let report = ws.run(&mut graph, &["t"]);
        assert_eq!(report.succeeded(), vec!["t"]);
        assert!(roots.is_evaluated());
    }

    #[test]
    fn test_report_renders() {
        let ws = Workspace::new();
        let mut graph = graph(vec![
            TaskNode::new("a").do_last(noop),
            TaskNode::new("b").depends_on("a").do_last(noop),
        ]);

        let report = ws.run(&mut graph, &["b"]);
        assert!(report.render_mermaid().contains("t_a --> t_b"));
        assert!(report.to_string().contains("2 tasks"));
    }

    #[test]
    fn test_name_only_ignores_moves() {
        let ws = Workspace::new();
        ws.write("in/x/a.txt", "a");

        let build = |ws: &Workspace| {
            graph(vec![
                TaskNode::new("names")
                    .input(
                        InputProperty::new("in")
                            .path(ws.path("in"))
                            .sensitivity(Sensitivity::NameOnly),
                    )
                    .do_last(noop),
            ])
        };

        ws.run(&mut build(&ws), &["names"]);
        fs::rename(ws.path("in/x"), ws.path("in/y")).unwrap();

        let report = ws.run(&mut build(&ws), &["names"]);
        assert_eq!(report.state("names"), Some(TaskState::UpToDate));
        assert_eq!(verdict(&report, "names"), Verdict::new(Decision::UpToDate, Reason::Unchanged));
    }

    /// Blocks until `count` tasks have arrived, fails after a few seconds.
    fn rendezvous(
        arrived: Arc<AtomicUsize>,
        count: usize,
    ) -> impl Fn(&ActionContext) -> anyhow::Result<()> + Send + Sync + 'static {
        move |_: &ActionContext| {
            arrived.fetch_add(1, Ordering::SeqCst);
            let deadline = Instant::now() + Duration::from_secs(5);
            while arrived.load(Ordering::SeqCst) < count {
                anyhow::ensure!(Instant::now() < deadline, "tasks never ran together");
                thread::sleep(Duration::from_millis(1));
            }
            Ok(())
        }
    }

    #[test]
    fn test_independent_tasks_run_in_parallel() {
        let mut ws = Workspace::new();
        ws.settings.parallelism = Some(2);
        let arrived = Arc::new(AtomicUsize::new(0));

        let mut graph = graph(vec![
            TaskNode::new("left").do_last(rendezvous(arrived.clone(), 2)),
            TaskNode::new("right").do_last(rendezvous(arrived.clone(), 2)),
        ]);

        let report = ws.run(&mut graph, &["left", "right"]);
        assert_eq!(report.succeeded(), vec!["left", "right"]);
    }

    #[test]
    fn test_parallelism_bounds_tasks_in_flight() {
        let mut ws = Workspace::new();
        ws.settings.parallelism = Some(1);
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let nodes = (0..4)
            .map(|i| {
                let (in_flight, peak) = (in_flight.clone(), peak.clone());
                TaskNode::new(format!("t{i}")).do_last(move |_: &ActionContext| {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(20));
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                })
            })
            .collect();
        let mut graph = graph(nodes);

        let report = ws.run(&mut graph, &["t0", "t1", "t2", "t3"]);
        assert_eq!(report.succeeded().len(), 4);
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_plan_from_another_graph() {
        let ws = Workspace::new();
        let mut first = graph(vec![
            TaskNode::new("a").do_last(noop),
            TaskNode::new("b").depends_on("a").do_last(noop),
        ]);
        let second = graph(vec![TaskNode::new("c").do_last(noop)]);

        let plan = first.resolve(["b"]).unwrap();
        let engine = ws.engine();

        assert!(matches!(engine.execute(&second, &plan), Err(GraphError::ForeignPlan)));
        assert_eq!(engine.execute(&first, &plan).unwrap().succeeded(), vec!["a", "b"]);
    }
}
