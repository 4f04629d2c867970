//! Directory scanning and path filtering for the watched root.
//!
//! A [`FileFilter`] decides whether a path belongs to the index: it must
//! sit under the root, match an include glob, match no exclude glob, and
//! have a supported extension. Both the full-tree scan and the watcher
//! use the same filter, so the two can never disagree about a file.

use anyhow::{Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::warn;
use walkdir::WalkDir;

use grounded_kb_core::change::FileStat;
use grounded_kb_core::chunk::content_hash;
use grounded_kb_core::models::{source_group_for, FileKind};

use crate::config::WatchConfig;

const DEFAULT_EXCLUDES: [&str; 4] = [
    "**/.git/**",
    "**/target/**",
    "**/node_modules/**",
    "**/.DS_Store",
];

#[derive(Debug, Clone)]
pub struct FileFilter {
    root: PathBuf,
    include: GlobSet,
    exclude: GlobSet,
    follow_symlinks: bool,
}

impl FileFilter {
    pub fn new(watch: &WatchConfig) -> Result<Self> {
        let root = watch
            .root
            .canonicalize()
            .with_context(|| format!("Failed to resolve watch root {}", watch.root.display()))?;

        let mut excludes: Vec<String> = DEFAULT_EXCLUDES.iter().map(|s| s.to_string()).collect();
        excludes.extend(watch.exclude_globs.iter().cloned());

        Ok(Self {
            root,
            include: build_globset(&watch.include_globs)?,
            exclude: build_globset(&excludes)?,
            follow_symlinks: watch.follow_symlinks,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Root-relative path with `/` separators, if `path` is under the root.
    pub fn relative(&self, path: &Path) -> Option<String> {
        let rel = path.strip_prefix(&self.root).ok()?;
        let s = rel.to_string_lossy().replace('\\', "/");
        if s.is_empty() {
            None
        } else {
            Some(s)
        }
    }

    /// Whether `path` should be indexed. Does not touch the filesystem.
    pub fn accepts(&self, path: &Path) -> bool {
        let Some(rel) = self.relative(path) else {
            return false;
        };
        FileKind::from_path(&rel).is_some()
            && self.include.is_match(&rel)
            && !self.exclude.is_match(&rel)
    }

    /// Source group of an accepted path.
    pub fn source_group(&self, path: &Path) -> String {
        source_group_for(&self.relative(path).unwrap_or_default())
    }

    /// Walk the root and stat every accepted file, sorted by path.
    ///
    /// Entries that cannot be read are logged and skipped; they will be
    /// picked up again by the next scan.
    pub fn scan(&self) -> Vec<FileStat> {
        let mut files = Vec::new();
        let walker = WalkDir::new(&self.root).follow_links(self.follow_symlinks);
        for entry in walker {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!(error = %e, "skipping unreadable directory entry");
                    continue;
                }
            };
            if !entry.file_type().is_file() || !self.accepts(entry.path()) {
                continue;
            }
            match stat_file(entry.path()) {
                Ok(stat) => files.push(stat),
                Err(e) => warn!(path = %entry.path().display(), error = %e, "skipping file"),
            }
        }
        files.sort_by(|a, b| a.path.cmp(&b.path));
        files
    }
}

/// String key for a path as stored in the index.
pub fn path_key(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

/// Stat a file: path key plus mtime in unix milliseconds.
pub fn stat_file(path: &Path) -> io::Result<FileStat> {
    let meta = fs::metadata(path)?;
    if !meta.is_file() {
        return Err(io::Error::new(io::ErrorKind::NotFound, "not a regular file"));
    }
    Ok(FileStat {
        path: path_key(path),
        mtime: mtime_millis(&meta),
    })
}

pub fn mtime_millis(meta: &fs::Metadata) -> i64 {
    meta.modified()
        .unwrap_or(SystemTime::UNIX_EPOCH)
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// SHA-256 of a file's raw bytes.
pub fn hash_file(path: &str) -> io::Result<String> {
    fs::read(path).map(|bytes| content_hash(&bytes))
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).with_context(|| format!("Invalid glob '{}'", pattern))?);
    }
    Ok(builder.build()?)
}
