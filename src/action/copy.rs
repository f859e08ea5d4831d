use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};

use crate::action::{Action, ActionContext};
use crate::engine::{ChangeRecord, ChangeType};
use crate::fingerprint::{FileFingerprint, FileType};

/// Rewrites the path of a copied entry relative to its input root.
/// Entries mapped to `None` or to an empty path are skipped.
pub type PathMapper = dyn Fn(&Utf8Path) -> Option<Utf8PathBuf> + Send + Sync;

/// Copies the files of every input property into a destination directory,
/// keeping their path relative to the input root.
///
/// Given a change set only the added and modified files are copied and the
/// removed ones are deleted, otherwise the destination is cleared and
/// rebuilt from scratch.
///
/// Empty directories are recreated from the input snapshot on both paths.
/// Directories that disappeared from the inputs are only pruned when the
/// task reports directory changes.
#[derive(Clone)]
pub struct CopyFiles {
    into: Utf8PathBuf,
    /// Per property subdirectory of `into`.
    subdirs: BTreeMap<String, Utf8PathBuf>,
    mapper: Option<Arc<PathMapper>>,
    include_empty_dirs: bool,
}

impl fmt::Debug for CopyFiles {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CopyFiles")
            .field("into", &self.into)
            .field("subdirs", &self.subdirs)
            .field("mapper", &self.mapper.is_some())
            .field("include_empty_dirs", &self.include_empty_dirs)
            .finish()
    }
}

impl CopyFiles {
    pub fn new(into: impl Into<Utf8PathBuf>) -> Self {
        Self {
            into: into.into(),
            subdirs: BTreeMap::new(),
            mapper: None,
            include_empty_dirs: true,
        }
    }

    /// Copies the files of `property` below `subdir` of the destination.
    pub fn into_for(mut self, property: impl Into<String>, subdir: impl Into<Utf8PathBuf>) -> Self {
        self.subdirs.insert(property.into(), subdir.into());
        self
    }

    /// Rewrites every relative path before it is placed, e.g. to drop a
    /// leading directory.
    ///
    /// ```
    /// use camino::Utf8PathBuf;
    /// use tsumiki::action::copy::CopyFiles;
    ///
    /// let _copy = CopyFiles::new("build/dist")
    ///     .map_path(|path| Some(path.components().skip(1).collect::<Utf8PathBuf>()));
    /// ```
    pub fn map_path<F>(mut self, mapper: F) -> Self
    where
        F: Fn(&Utf8Path) -> Option<Utf8PathBuf> + Send + Sync + 'static,
    {
        self.mapper = Some(Arc::new(mapper));
        self
    }

    pub fn include_empty_dirs(mut self, include: bool) -> Self {
        self.include_empty_dirs = include;
        self
    }

    /// Where an entry of `property` ends up, `None` when it is skipped.
    fn destination(&self, property: &str, relative: &Utf8Path) -> Option<Utf8PathBuf> {
        let base = match self.subdirs.get(property) {
            Some(subdir) => self.into.join(subdir),
            None => self.into.clone(),
        };

        // the input root itself
        if relative.as_str().is_empty() {
            return Some(base);
        }

        match &self.mapper {
            Some(mapper) => mapper(relative)
                .filter(|mapped| !mapped.as_str().is_empty())
                .map(|mapped| base.join(mapped)),
            None => Some(base.join(relative)),
        }
    }

    fn copy_all(&self, ctx: &ActionContext) -> io::Result<()> {
        if self.into.exists() {
            fs::remove_dir_all(&self.into)?;
        }
        fs::create_dir_all(&self.into)?;

        let mut count = 0;
        for property in &ctx.inputs().properties {
            for fp in &property.fingerprints {
                if ctx.is_cancelled() {
                    return Err(io::Error::new(io::ErrorKind::Interrupted, "copy cancelled"));
                }
                if self.place(&property.name, fp)? {
                    count += 1;
                }
            }
        }

        tracing::debug!("copied {} files into {}", count, self.into);
        Ok(())
    }

    fn apply(&self, ctx: &ActionContext, changes: &[ChangeRecord]) -> io::Result<()> {
        for change in changes {
            if ctx.is_cancelled() {
                return Err(io::Error::new(io::ErrorKind::Interrupted, "copy cancelled"));
            }

            let Some(target) = self.destination(&change.property, &change.relative) else {
                continue;
            };
            match (change.change, change.file_type) {
                (ChangeType::Removed, _) => remove(&target)?,
                (_, FileType::File) => copy_file(&change.path, &target)?,
                _ => {}
            }
        }

        // change sets carry directories only on request
        if self.include_empty_dirs {
            for property in &ctx.inputs().properties {
                let dirs = property.fingerprints.iter().filter(|fp| fp.file_type == FileType::Directory);
                for fp in dirs {
                    self.place(&property.name, fp)?;
                }
            }
        }

        tracing::debug!("applied {} changes to {}", changes.len(), self.into);
        Ok(())
    }

    /// Returns whether a file was copied.
    fn place(&self, property: &str, fp: &FileFingerprint) -> io::Result<bool> {
        let Some(target) = self.destination(property, &fp.relative) else {
            return Ok(false);
        };
        match fp.file_type {
            FileType::File => {
                copy_file(&fp.path, &target)?;
                Ok(true)
            }
            FileType::Directory if self.include_empty_dirs => {
                fs::create_dir_all(&target)?;
                Ok(false)
            }
            _ => Ok(false),
        }
    }
}

impl Action for CopyFiles {
    fn execute(&self, ctx: &ActionContext) -> anyhow::Result<()> {
        match ctx.changes() {
            Some(changes) => self.apply(ctx, changes)?,
            None => self.copy_all(ctx)?,
        }
        Ok(())
    }
}

fn copy_file(src: &Utf8Path, dst: &Utf8Path) -> io::Result<()> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::copy(src, dst)?;
    Ok(())
}

fn remove(path: &Utf8Path) -> io::Result<()> {
    let result = match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) => Err(e),
    };

    match result {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}
