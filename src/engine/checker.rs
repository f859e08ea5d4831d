use std::fmt::Display;

use crate::fingerprint::{FileType, Snapshot};
use crate::store::TaskHistory;
use crate::task::TaskNode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    UpToDate,
    RunFull,
    RunIncremental,
}

/// Why the checker reached its decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reason {
    NoHistory,
    Rerun,
    OutputsMissing,
    OutputsChanged,
    Unchanged,
    InputsChanged,
    StructureChanged,
}

impl Display for Reason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Reason::NoHistory => "no history is available",
            Reason::Rerun => "rerun was requested",
            Reason::OutputsMissing => "declared outputs are missing",
            Reason::OutputsChanged => "outputs were changed since the last run",
            Reason::Unchanged => "inputs and outputs are unchanged",
            Reason::InputsChanged => "input files changed",
            Reason::StructureChanged => "declared inputs changed",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verdict {
    pub decision: Decision,
    pub reason: Reason,
}

impl Verdict {
    pub(crate) fn new(decision: Decision, reason: Reason) -> Self {
        Self { decision, reason }
    }
}

/// Decides whether `node` has to run.
///
/// Checks run in a fixed order and the first one that applies wins:
///
/// 1. without history the task runs in full;
/// 2. outputs that are missing or differ from what the last run produced
///    can't be trusted, the task runs in full;
/// 3. unchanged inputs make the task up-to-date;
/// 4. an incremental task whose declared inputs kept their shape runs
///    incrementally;
/// 5. anything else runs in full.
pub fn check(
    node: &TaskNode,
    previous: Option<&TaskHistory>,
    inputs: &Snapshot,
    outputs: &Snapshot,
) -> Verdict {
    let Some(previous) = previous else {
        return Verdict::new(Decision::RunFull, Reason::NoHistory);
    };

    let missing = outputs
        .properties
        .iter()
        .flat_map(|p| &p.fingerprints)
        .any(|fp| fp.file_type == FileType::Missing);

    if missing {
        return Verdict::new(Decision::RunFull, Reason::OutputsMissing);
    }

    if !outputs.same_as(&previous.outputs) {
        return Verdict::new(Decision::RunFull, Reason::OutputsChanged);
    }

    if inputs.same_as(&previous.inputs) {
        return Verdict::new(Decision::UpToDate, Reason::Unchanged);
    }

    if !node.is_incremental() {
        return Verdict::new(Decision::RunFull, Reason::InputsChanged);
    }

    if !inputs.same_structure(&previous.inputs) {
        return Verdict::new(Decision::RunFull, Reason::StructureChanged);
    }

    Verdict::new(Decision::RunIncremental, Reason::InputsChanged)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use camino::Utf8PathBuf;

    use super::*;
    use crate::core::Hash32;
    use crate::fingerprint::{PathFilter, Sensitivity, snapshot_property};

    struct Fixture {
        _dir: tempfile::TempDir,
        root: Utf8PathBuf,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
            fs::create_dir_all(root.join("src")).unwrap();
            fs::write(root.join("src/a.txt"), "a").unwrap();
            fs::write(root.join("out.txt"), "out").unwrap();
            Self { _dir: dir, root }
        }

        fn snapshot(&self, name: &str, path: &str) -> Snapshot {
            let property = snapshot_property(
                name,
                &[self.root.join(path)],
                Sensitivity::RelativePath,
                &PathFilter::default(),
            )
            .unwrap();

            Snapshot {
                properties: vec![property],
                values: Default::default(),
            }
        }

        fn history(&self) -> TaskHistory {
            TaskHistory {
                inputs: self.snapshot("src", "src"),
                outputs: self.snapshot("out", "out.txt"),
            }
        }
    }

    #[test]
    fn test_no_history() {
        let fx = Fixture::new();
        let verdict = check(
            &TaskNode::new("t"),
            None,
            &fx.snapshot("src", "src"),
            &fx.snapshot("out", "out.txt"),
        );

        assert_eq!(verdict, Verdict::new(Decision::RunFull, Reason::NoHistory));
    }

    #[test]
    fn test_up_to_date() {
        let fx = Fixture::new();
        let history = fx.history();
        let verdict = check(
            &TaskNode::new("t"),
            Some(&history),
            &fx.snapshot("src", "src"),
            &fx.snapshot("out", "out.txt"),
        );

        assert_eq!(verdict.decision, Decision::UpToDate);
    }

    #[test]
    fn test_outputs_tampered() {
        let fx = Fixture::new();
        let history = fx.history();
        fs::write(fx.root.join("out.txt"), "tampered").unwrap();

        let verdict = check(
            &TaskNode::new("t").incremental(),
            Some(&history),
            &fx.snapshot("src", "src"),
            &fx.snapshot("out", "out.txt"),
        );

        assert_eq!(verdict, Verdict::new(Decision::RunFull, Reason::OutputsChanged));
    }

    #[test]
    fn test_outputs_deleted() {
        let fx = Fixture::new();
        let history = fx.history();
        fs::remove_file(fx.root.join("out.txt")).unwrap();

        let verdict = check(
            &TaskNode::new("t"),
            Some(&history),
            &fx.snapshot("src", "src"),
            &fx.snapshot("out", "out.txt"),
        );

        assert_eq!(verdict, Verdict::new(Decision::RunFull, Reason::OutputsMissing));
    }

    #[test]
    fn test_incremental() {
        let fx = Fixture::new();
        let history = fx.history();
        fs::write(fx.root.join("src/a.txt"), "changed").unwrap();
        let inputs = fx.snapshot("src", "src");
        let outputs = fx.snapshot("out", "out.txt");

        let full = check(&TaskNode::new("t"), Some(&history), &inputs, &outputs);
        assert_eq!(full, Verdict::new(Decision::RunFull, Reason::InputsChanged));

        let incremental = check(&TaskNode::new("t").incremental(), Some(&history), &inputs, &outputs);
        assert_eq!(incremental.decision, Decision::RunIncremental);
    }

    #[test]
    fn test_structure_change() {
        let fx = Fixture::new();
        let history = fx.history();
        let outputs = fx.snapshot("out", "out.txt");
        let node = TaskNode::new("t").incremental();

        // a renamed property
        let renamed = fx.snapshot("sources", "src");
        let verdict = check(&node, Some(&history), &renamed, &outputs);
        assert_eq!(verdict, Verdict::new(Decision::RunFull, Reason::StructureChanged));

        // a changed value
        let mut valued = fx.snapshot("src", "src");
        valued.values.insert("level".into(), Hash32::of(&2));
        let verdict = check(&node, Some(&history), &valued, &outputs);
        assert_eq!(verdict, Verdict::new(Decision::RunFull, Reason::StructureChanged));
    }
}
