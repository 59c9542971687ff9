//! Discovery: which capture files does this cycle need to ship?
//!
//! Walks the source root, keeps regular files matching the include globs
//! (and none of the exclude globs), drops files the progress store already
//! holds, and yields identities in path order. A fresh walk runs every cycle;
//! the progress store is the only state carried between cycles.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{bail, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use walkdir::WalkDir;

use crate::config::SourceConfig;
use crate::models::FileIdentity;
use crate::store::ProgressStore;

#[derive(Debug, Clone)]
pub struct Discovery {
    root: PathBuf,
    include: GlobSet,
    exclude: GlobSet,
    follow_symlinks: bool,
}

/// Cheap summary of the source tree used by the watch driver to notice changes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TreeFingerprint {
    pub files: u64,
    pub total_bytes: u64,
    pub newest: Option<SystemTime>,
}

impl Discovery {
    pub fn from_config(config: &SourceConfig) -> Result<Self> {
        let include = build_globset(&config.include_globs)?;

        let mut excludes = vec!["**/.git/**".to_string()];
        excludes.extend(config.exclude_globs.clone());
        let exclude = build_globset(&excludes)?;

        Ok(Self {
            root: config.root.clone(),
            include,
            exclude,
            follow_symlinks: config.follow_symlinks,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Lazily walk every candidate capture under the root, in path order.
    ///
    /// Directory entries are visited sorted by file name, which makes the
    /// walk order equal to component-wise path order without collecting
    /// the tree first. Unreadable entries are logged and skipped.
    pub fn walk(&self) -> Result<impl Iterator<Item = FileIdentity> + '_> {
        if !self.root.is_dir() {
            bail!("Source root does not exist: {}", self.root.display());
        }

        let walker = WalkDir::new(&self.root)
            .follow_links(self.follow_symlinks)
            .sort_by_file_name();

        Ok(walker.into_iter().filter_map(move |entry| {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!(error = %e, "skipping unreadable source entry");
                    return None;
                }
            };
            if !entry.file_type().is_file() {
                return None;
            }

            let path = entry.path();
            let relative = path.strip_prefix(&self.root).unwrap_or(path);
            let rel_str = relative.to_string_lossy();

            if self.exclude.is_match(rel_str.as_ref()) || !self.include.is_match(rel_str.as_ref()) {
                return None;
            }
            if rel_str.contains('\n') {
                tracing::warn!(path = %path.display(), "skipping capture with a newline in its path");
                return None;
            }

            match FileIdentity::from_path(&self.root, path) {
                Ok(identity) => Some(identity),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping capture without metadata");
                    None
                }
            }
        }))
    }

    /// Candidates not yet in the progress store, capped at `limit` files.
    pub async fn scan(
        &self,
        store: &dyn ProgressStore,
        limit: Option<usize>,
    ) -> Result<Vec<FileIdentity>> {
        let mut pending = Vec::new();
        let mut already = 0u64;

        for identity in self.walk()? {
            if store.is_processed(&identity).await? {
                already += 1;
                continue;
            }
            pending.push(identity);
            if limit.is_some_and(|max| pending.len() >= max) {
                break;
            }
        }

        tracing::debug!(
            pending = pending.len(),
            already_processed = already,
            root = %self.root.display(),
            "discovery finished"
        );
        Ok(pending)
    }

    pub fn fingerprint(&self) -> Result<TreeFingerprint> {
        let mut fp = TreeFingerprint::default();
        for identity in self.walk()? {
            fp.files += 1;
            fp.total_bytes += identity.size;
            let modified = SystemTime::from(identity.modified);
            fp.newest = Some(fp.newest.map_or(modified, |n| n.max(modified)));
        }
        Ok(fp)
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}
