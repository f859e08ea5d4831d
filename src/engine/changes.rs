use std::collections::BTreeMap;

use camino::Utf8PathBuf;

use crate::fingerprint::{FileFingerprint, FileType, PropertySnapshot, Snapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeType {
    Added,
    Modified,
    Removed,
}

/// A single file that changed between two runs of a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeRecord {
    /// Input property the file belongs to.
    pub property: String,
    /// Path on disk, for removed files where it used to be.
    pub path: Utf8PathBuf,
    /// Path relative to the input root.
    pub relative: Utf8PathBuf,
    /// Fingerprint key the two snapshots were matched on.
    pub key: String,
    pub change: ChangeType,
    pub file_type: FileType,
}

/// Diffs two input snapshots.
///
/// Records are grouped by property in the current declaration order, then
/// sorted by key and path. Missing roots don't produce records of their
/// own, a root that disappears shows up as its files being removed. Directories are only
/// reported when `directories` is set.
pub fn build_changes(previous: &Snapshot, current: &Snapshot, directories: bool) -> Vec<ChangeRecord> {
    let mut changes = Vec::new();

    for property in &current.properties {
        diff_property(previous.property(&property.name), Some(property), directories, &mut changes);
    }

    // properties that are no longer declared
    for property in &previous.properties {
        if current.property(&property.name).is_none() {
            diff_property(Some(property), None, directories, &mut changes);
        }
    }

    changes
}

fn diff_property(
    previous: Option<&PropertySnapshot>,
    current: Option<&PropertySnapshot>,
    directories: bool,
    out: &mut Vec<ChangeRecord>,
) {
    let Some(name) = current.or(previous).map(|p| p.name.as_str()) else {
        return;
    };

    let mut groups: BTreeMap<&str, (Vec<&FileFingerprint>, Vec<&FileFingerprint>)> =
        BTreeMap::new();

    for fp in present(previous) {
        groups.entry(fp.key.as_str()).or_default().0.push(fp);
    }
    for fp in present(current) {
        groups.entry(fp.key.as_str()).or_default().1.push(fp);
    }

    for (before, after) in groups.into_values() {
        let mut records = Vec::new();

        for (before, after) in pair_group(before, after) {
            let (fp, change) = match (before, after) {
                (None, Some(after)) => (after, ChangeType::Added),
                (Some(before), None) => (before, ChangeType::Removed),
                (Some(before), Some(after)) if before != after => {
                    // a file replaced by a directory is gone as far as files go
                    if !directories && after.file_type == FileType::Directory {
                        (before, ChangeType::Removed)
                    } else {
                        (after, ChangeType::Modified)
                    }
                }
                _ => continue,
            };

            if fp.file_type == FileType::Directory && !directories {
                continue;
            }

            records.push(ChangeRecord {
                property: name.to_string(),
                path: fp.path.clone(),
                relative: fp.relative.clone(),
                key: fp.key.clone(),
                change,
                file_type: fp.file_type,
            });
        }

        records.sort_by(|a, b| a.path.cmp(&b.path));
        out.extend(records);
    }
}

type Pair<'a> = (Option<&'a FileFingerprint>, Option<&'a FileFingerprint>);

/// Pairs the fingerprints sharing one key.
///
/// Keys are unique for path sensitivities, but `NameOnly` and `None` group
/// several files under one key. Unchanged files are matched up first,
/// preferring the same path, so a new file joining a group is reported on
/// its own. What is left is paired in path order, the surplus is added or
/// removed.
fn pair_group<'a>(
    before: Vec<&'a FileFingerprint>,
    after: Vec<&'a FileFingerprint>,
) -> Vec<Pair<'a>> {
    if before.len() <= 1 && after.len() <= 1 {
        return vec![(before.first().copied(), after.first().copied())];
    }

    let mut pairs = Vec::new();
    let mut after: Vec<Option<&FileFingerprint>> = after.into_iter().map(Some).collect();
    let mut left = Vec::new();

    for fp in before {
        let same_path = after
            .iter()
            .position(|other| other.is_some_and(|other| other == fp && other.path == fp.path));
        let same = same_path
            .or_else(|| after.iter().position(|other| other.is_some_and(|other| other == fp)));

        match same.and_then(|at| after[at].take()) {
            Some(other) => pairs.push((Some(fp), Some(other))),
            None => left.push(fp),
        }
    }

    let mut rest: Vec<&FileFingerprint> = after.into_iter().flatten().collect();
    left.sort_by(|a, b| a.path.cmp(&b.path));
    rest.sort_by(|a, b| a.path.cmp(&b.path));

    let mut rest = rest.into_iter();
    for fp in left {
        pairs.push((Some(fp), rest.next()));
    }
    pairs.extend(rest.map(|fp| (None, Some(fp))));

    pairs
}

fn present(property: Option<&PropertySnapshot>) -> impl Iterator<Item = &FileFingerprint> {
    property
        .into_iter()
        .flat_map(|p| &p.fingerprints)
        .filter(|fp| fp.file_type != FileType::Missing)
}
