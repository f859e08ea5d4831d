//! File fingerprints and snapshots.
//!
//! A [`Snapshot`] is what the engine remembers about a task between runs: for
//! every declared property, the ordered list of [`FileFingerprint`]s found
//! under its roots. Two fingerprints are equal when their projected keys and
//! content hashes match. Timestamps and lengths are recorded for diagnostics
//! only and never decide equality.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::time::UNIX_EPOCH;

use camino::{Utf8Path, Utf8PathBuf};
use glob::{MatchOptions, Pattern, PatternError};
use rayon::iter::{IntoParallelIterator, ParallelIterator};
use serde::{Deserialize, Serialize};

use crate::core::Hash32;

/// Controls which part of a file path participates in the fingerprint key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Sensitivity {
    /// The absolute path of the file.
    #[default]
    AbsolutePath,
    /// The path relative to the declared root it was found under.
    RelativePath,
    /// Only the file name, moving a file between directories is no change.
    NameOnly,
    /// The path is ignored, files are keyed by content alone.
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FileType {
    File,
    Directory,
    Missing,
}

/// Fingerprint of a single file system entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileFingerprint {
    /// Path as found on disk.
    pub path: Utf8PathBuf,
    /// Path relative to the declared root; for a root that is a file, its name.
    pub relative: Utf8PathBuf,
    /// Path projected through the property's [`Sensitivity`]. Not unique
    /// for `NameOnly` and `None`, several files may share a key.
    pub key: String,
    pub content_hash: Hash32,
    /// Milliseconds since the Unix epoch.
    pub last_modified: Option<u64>,
    pub length: u64,
    pub file_type: FileType,
}

impl PartialEq for FileFingerprint {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
            && self.content_hash == other.content_hash
            && self.file_type == other.file_type
    }
}

impl Eq for FileFingerprint {}

/// Include and exclude patterns applied to entries below a directory root.
///
/// Patterns match the path relative to the root, `*` never crosses a `/`, so
/// `*.pdf` only matches direct children while `**/*.pdf` matches at any depth.
#[derive(Debug, Clone, Default)]
pub struct PathFilter {
    include: Vec<Pattern>,
    exclude: Vec<Pattern>,
}

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

impl PathFilter {
    pub fn new<I, E>(include: I, exclude: E) -> Result<Self, PatternError>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
        E: IntoIterator,
        E::Item: AsRef<str>,
    {
        let mut filter = Self::default();
        for pattern in include {
            filter.include(pattern.as_ref())?;
        }
        for pattern in exclude {
            filter.exclude(pattern.as_ref())?;
        }
        Ok(filter)
    }

    pub fn include(&mut self, pattern: &str) -> Result<(), PatternError> {
        self.include.push(Pattern::new(pattern)?);
        Ok(())
    }

    pub fn exclude(&mut self, pattern: &str) -> Result<(), PatternError> {
        self.exclude.push(Pattern::new(pattern)?);
        Ok(())
    }

    pub fn has_includes(&self) -> bool {
        !self.include.is_empty()
    }

    /// Whether a file at `relative` passes the filter.
    pub fn includes(&self, relative: &Utf8Path) -> bool {
        let included = self.include.is_empty()
            || self
                .include
                .iter()
                .any(|p| p.matches_with(relative.as_str(), MATCH_OPTIONS));

        included && !self.excludes(relative)
    }

    pub fn excludes(&self, relative: &Utf8Path) -> bool {
        self.exclude
            .iter()
            .any(|p| p.matches_with(relative.as_str(), MATCH_OPTIONS))
    }

    fn patterns(&self) -> (Vec<String>, Vec<String>) {
        let strings = |list: &[Pattern]| list.iter().map(|p| p.as_str().to_string()).collect();
        (strings(&self.include), strings(&self.exclude))
    }
}

/// Fingerprints recorded for one declared property.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropertySnapshot {
    pub name: String,
    pub sensitivity: Sensitivity,
    pub roots: Vec<Utf8PathBuf>,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    /// Sorted by key, then content.
    pub fingerprints: Vec<FileFingerprint>,
}

impl PropertySnapshot {
    /// Same declaration: name, sensitivity and patterns.
    ///
    /// Roots are not compared. Absolute keys already carry them, and under
    /// any other sensitivity a tree moved elsewhere is the same input.
    pub fn same_structure(&self, other: &Self) -> bool {
        self.name == other.name
            && self.sensitivity == other.sensitivity
            && self.include == other.include
            && self.exclude == other.exclude
    }

    pub fn same_as(&self, other: &Self) -> bool {
        self.same_structure(other) && self.fingerprints == other.fingerprints
    }

    /// First fingerprint recorded under `key`.
    pub fn get(&self, key: &str) -> Option<&FileFingerprint> {
        let at = self.fingerprints.partition_point(|fp| fp.key.as_str() < key);
        self.fingerprints.get(at).filter(|fp| fp.key == key)
    }

    /// Regular files only.
    pub fn files(&self) -> impl Iterator<Item = &FileFingerprint> {
        self.fingerprints
            .iter()
            .filter(|fp| fp.file_type == FileType::File)
    }
}

/// The state of all declared properties of a task at one point in time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Snapshot {
    /// In declaration order.
    pub properties: Vec<PropertySnapshot>,
    /// Hashes of non-file input values.
    pub values: BTreeMap<String, Hash32>,
}

impl Snapshot {
    pub fn property(&self, name: &str) -> Option<&PropertySnapshot> {
        self.properties.iter().find(|p| p.name == name)
    }

    /// Both snapshots declare the same properties and values, regardless of
    /// the files currently found.
    pub fn same_structure(&self, other: &Self) -> bool {
        self.values == other.values
            && self.properties.len() == other.properties.len()
            && self.properties.iter().all(|p| {
                other
                    .property(&p.name)
                    .is_some_and(|o| p.same_structure(o))
            })
    }

    pub fn same_as(&self, other: &Self) -> bool {
        self.values == other.values
            && self.properties.len() == other.properties.len()
            && self
                .properties
                .iter()
                .all(|p| other.property(&p.name).is_some_and(|o| p.same_as(o)))
    }

    pub fn files(&self) -> impl Iterator<Item = &FileFingerprint> {
        self.properties.iter().flat_map(PropertySnapshot::files)
    }
}

impl PartialEq for Snapshot {
    fn eq(&self, other: &Self) -> bool {
        self.same_as(other)
    }
}

/// Walks every root and fingerprints what it finds.
///
/// Missing roots are recorded as [`FileType::Missing`] rather than failing.
/// Directory roots are walked recursively in file name order and filtered
/// through `filter`; file contents are hashed in parallel. With `NameOnly`
/// and `None` directories are not recorded, their names would turn a move
/// into a change.
pub fn snapshot_property(
    name: &str,
    roots: &[Utf8PathBuf],
    sensitivity: Sensitivity,
    filter: &PathFilter,
) -> io::Result<PropertySnapshot> {
    let mut entries = Vec::new();
    for root in roots {
        collect_root(root, filter, &mut entries)?;
    }

    if matches!(sensitivity, Sensitivity::NameOnly | Sensitivity::None) {
        entries.retain(|entry| entry.file_type != FileType::Directory);
    }

    let mut fingerprints = entries
        .into_par_iter()
        .map(|entry| entry.fingerprint(sensitivity))
        .collect::<io::Result<Vec<_>>>()?;

    fingerprints.sort_by(|a, b| {
        (&a.key, a.content_hash, a.file_type, &a.path).cmp(&(&b.key, b.content_hash, b.file_type, &b.path))
    });

    let (include, exclude) = filter.patterns();

    Ok(PropertySnapshot {
        name: name.to_string(),
        sensitivity,
        roots: roots.to_vec(),
        include,
        exclude,
        fingerprints,
    })
}

struct Entry {
    path: Utf8PathBuf,
    relative: Utf8PathBuf,
    file_type: FileType,
    length: u64,
    modified: Option<u64>,
}

impl Entry {
    fn new(path: Utf8PathBuf, relative: Utf8PathBuf, meta: &fs::Metadata) -> Self {
        let modified = meta
            .modified()
            .ok()
            .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
            .map(|since| since.as_millis() as u64);

        Self {
            path,
            relative,
            file_type: if meta.is_dir() {
                FileType::Directory
            } else {
                FileType::File
            },
            length: if meta.is_dir() { 0 } else { meta.len() },
            modified,
        }
    }

    fn missing(path: &Utf8Path) -> Self {
        Self {
            path: path.to_owned(),
            relative: Utf8PathBuf::from(path.file_name().unwrap_or_default()),
            file_type: FileType::Missing,
            length: 0,
            modified: None,
        }
    }

    fn fingerprint(self, sensitivity: Sensitivity) -> io::Result<FileFingerprint> {
        let content_hash = match self.file_type {
            FileType::File => Hash32::hash_file(&self.path)?,
            FileType::Directory | FileType::Missing => Hash32::default(),
        };

        let key = match sensitivity {
            Sensitivity::AbsolutePath => absolute(&self.path),
            Sensitivity::RelativePath => self.relative.to_string(),
            Sensitivity::NameOnly => self.path.file_name().unwrap_or_default().to_string(),
            Sensitivity::None => match self.file_type {
                FileType::File => content_hash.to_hex(),
                FileType::Directory | FileType::Missing => String::new(),
            },
        };

        Ok(FileFingerprint {
            path: self.path,
            relative: self.relative,
            key,
            content_hash,
            last_modified: self.modified,
            length: self.length,
            file_type: self.file_type,
        })
    }
}

fn absolute(path: &Utf8Path) -> String {
    std::path::absolute(path)
        .ok()
        .and_then(|path| Utf8PathBuf::try_from(path).ok())
        .map_or_else(|| path.to_string(), Utf8PathBuf::into_string)
}

fn collect_root(root: &Utf8Path, filter: &PathFilter, out: &mut Vec<Entry>) -> io::Result<()> {
    let meta = match fs::metadata(root) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            out.push(Entry::missing(root));
            return Ok(());
        }
        Err(e) => return Err(e),
    };

    if !meta.is_dir() {
        let name = Utf8PathBuf::from(root.file_name().unwrap_or_default());
        out.push(Entry::new(root.to_owned(), name, &meta));
        return Ok(());
    }

    out.push(Entry::new(root.to_owned(), Utf8PathBuf::new(), &meta));

    let mut files = Vec::new();
    let mut dirs = Vec::new();
    walk(root, Utf8Path::new(""), filter, &mut files, &mut dirs)?;

    // with includes only the directories leading to a matched file are kept
    if filter.has_includes() {
        let ancestors: BTreeSet<&Utf8Path> = files
            .iter()
            .flat_map(|file| file.relative.ancestors().skip(1))
            .collect();

        dirs.retain(|dir| ancestors.contains(dir.relative.as_path()));
    }

    out.extend(dirs);
    out.extend(files);
    Ok(())
}

fn walk(
    root: &Utf8Path,
    dir: &Utf8Path,
    filter: &PathFilter,
    files: &mut Vec<Entry>,
    dirs: &mut Vec<Entry>,
) -> io::Result<()> {
    let mut children = fs::read_dir(root.join(dir))?.collect::<io::Result<Vec<_>>>()?;
    children.sort_by_key(|child| child.file_name());

    for child in children {
        let Ok(path) = Utf8PathBuf::try_from(child.path()) else {
            tracing::warn!("skipping non UTF-8 path {:?}", child.path());
            continue;
        };

        let Some(name) = path.file_name() else {
            continue;
        };
        let relative = dir.join(name);

        let meta = match fs::metadata(&path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::warn!("skipping dangling link {}", path);
                continue;
            }
            Err(e) => return Err(e),
        };

        if meta.is_dir() {
            if filter.excludes(&relative) {
                continue;
            }
            dirs.push(Entry::new(path, relative.clone(), &meta));
            walk(root, &relative, filter, files, dirs)?;
        } else if filter.includes(&relative) {
            files.push(Entry::new(path, relative, &meta));
        }
    }

    Ok(())
}
