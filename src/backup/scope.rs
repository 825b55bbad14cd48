//! Expands source entries into the ordered list of files to back up.

use crate::backup::result_error::result::Result;
use bon::Builder;
use derive_more::{Display, From};
use getset::Getters;
use globset::{Glob, GlobBuilder, GlobSet, GlobSetBuilder};
use itertools::Itertools;
use serde::de::Visitor;
use serde::{Deserialize, Deserializer, Serialize};
use walkdir::{DirEntry, WalkDir};

use std::fmt::{Debug, Formatter};
use std::path::{Component, Path, PathBuf};
use std::result;

pub const DEFAULT_MAX_DEPTH: usize = 20;
pub const DEFAULT_MAX_FILES: usize = 10_000;

/// Substrings marking temp, cache and lock artifacts.
pub const TRANSIENT_PATTERNS: [&str; 3] = [".tmp", ".cache", ".lock"];
/// Virtual filesystems never worth copying.
pub const VIRTUAL_ROOTS: [&str; 2] = ["/proc", "/sys"];

/// A glob pattern wrapper that handles custom deserialization
///
/// Enables literal separator mode so `*` never crosses a `/`.
#[derive(Clone, Debug, From, Display, Serialize, PartialEq, Eq, Getters)]
#[serde(transparent)]
#[getset(get = "pub")]
pub struct CustomDeserializedGlob {
    glob: Glob,
}

impl CustomDeserializedGlob {
    pub fn new<S: AsRef<str>>(pattern: S) -> result::Result<Self, globset::Error> {
        GlobBuilder::new(pattern.as_ref())
            .literal_separator(true)
            .build()
            .map(CustomDeserializedGlob::from)
    }
}

struct CustomGlobVisitor;

impl Visitor<'_> for CustomGlobVisitor {
    type Value = CustomDeserializedGlob;

    fn expecting(&self, formatter: &mut Formatter) -> std::fmt::Result {
        formatter.write_str("a glob pattern")
    }

    fn visit_str<E>(self, v: &str) -> result::Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        CustomDeserializedGlob::new(v).map_err(serde::de::Error::custom)
    }
}

impl<'de> Deserialize<'de> for CustomDeserializedGlob {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> result::Result<Self, D::Error> {
        deserializer.deserialize_str(CustomGlobVisitor)
    }
}

/// Filters applied while resolving the backup scope.
#[derive(Clone, Debug, Builder, Getters)]
#[getset(get = "pub")]
pub struct ScopeRules {
    #[builder(default = DEFAULT_MAX_DEPTH)]
    max_depth: usize,
    #[builder(default = DEFAULT_MAX_FILES)]
    max_files: usize,
    #[builder(default)]
    exclude: Vec<CustomDeserializedGlob>,
    /// Subtrees left out of the walk entirely
    #[builder(default)]
    prune: Vec<PathBuf>,
}

impl Default for ScopeRules {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Number of path separators, i.e. normal components of an absolute path.
pub fn path_depth<P: AsRef<Path>>(path: P) -> usize {
    path.as_ref()
        .components()
        .filter(|c| matches!(c, Component::Normal(_)))
        .count()
}

/// Returns `true` for temp/cache/lock artifacts and anything under `/proc` or `/sys`.
pub fn is_transient<P: AsRef<Path>>(path: P) -> bool {
    let path = path.as_ref();
    let text = path.to_string_lossy();
    TRANSIENT_PATTERNS.iter().any(|p| text.contains(p))
        || VIRTUAL_ROOTS.iter().any(|root| path.starts_with(root))
}

/// Rejects paths deeper than `max_depth`; the caller skips them and continues.
pub fn prevent_unbounded_recursion<P: AsRef<Path>>(path: P, max_depth: usize) -> bool {
    let depth = path_depth(path.as_ref());
    if depth > max_depth {
        tracing::warn!(
            "Skipping {:?}: depth {} exceeds maximum {}",
            path.as_ref(),
            depth,
            max_depth
        );
        return false;
    }
    true
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry.depth() > 0 && entry.file_name().to_string_lossy().starts_with('.')
}

impl ScopeRules {
    fn build_exclude_set(&self) -> Result<GlobSet> {
        let mut builder = GlobSetBuilder::new();
        self.exclude.iter().for_each(|g| {
            builder.add(g.glob.clone());
        });
        Ok(builder.build().map_err(std::io::Error::other)?)
    }

    fn is_pruned(&self, path: &Path) -> bool {
        self.prune.iter().any(|p| path.starts_with(p))
    }

    fn keep_file(&self, path: &Path, exclude: &GlobSet) -> bool {
        if self.is_pruned(path) {
            tracing::trace!("Skipping {:?}, inside pruned subtree", path);
            return false;
        }
        if is_transient(path) {
            tracing::trace!("Skipping transient path {:?}", path);
            return false;
        }
        if exclude.is_match(path) {
            tracing::trace!("Skipping {:?}, matches exclude glob", path);
            return false;
        }
        prevent_unbounded_recursion(path, self.max_depth)
    }

    /// Expands `sources` into regular files, in walk order, capped at `max_files`.
    ///
    /// Directories are walked without following symlinks, sorted by file name.
    /// Hidden entries below a source root are pruned. Unreadable entries are
    /// logged and skipped. Duplicates from overlapping sources are dropped.
    pub fn resolve_scope<P: AsRef<Path>>(&self, sources: &[P]) -> Result<Vec<PathBuf>> {
        let exclude = self.build_exclude_set()?;
        let max_depth = self.max_depth;

        let files = sources
            .iter()
            .map(|s| AsRef::<Path>::as_ref(s).to_path_buf())
            .flat_map(|source| -> Box<dyn Iterator<Item = PathBuf>> {
                if source.is_file() {
                    Box::new(std::iter::once(source))
                } else {
                    tracing::info!("Scanning directory {:?}", source);
                    let prune = self.prune.clone();
                    let walk = WalkDir::new(&source)
                        .follow_links(false)
                        .sort_by_file_name()
                        .into_iter()
                        .filter_entry(move |e| {
                            !is_hidden(e)
                                && !prune.iter().any(|p| e.path().starts_with(p))
                                && (!e.file_type().is_dir()
                                    || prevent_unbounded_recursion(e.path(), max_depth))
                        })
                        .filter_map(|res| match res {
                            Ok(de) => Some(de),
                            Err(e) => {
                                tracing::warn!("Ignoring unreadable entry: {e}");
                                None
                            }
                        })
                        .filter(|de| de.file_type().is_file())
                        .map(DirEntry::into_path);
                    Box::new(walk)
                }
            })
            .filter(|p| self.keep_file(p, &exclude))
            .unique()
            .take(self.max_files.saturating_add(1))
            .collect_vec();

        if files.len() > self.max_files {
            tracing::warn!(
                "File limit of {} reached, remaining files are not backed up",
                self.max_files
            );
            let mut files = files;
            files.truncate(self.max_files);
            return Ok(files);
        }

        tracing::info!("Resolved {} files to back up", files.len());
        Ok(files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::test_util::{test_dir, write_file};

    fn names(files: &[PathBuf], root: &Path) -> Vec<String> {
        files
            .iter()
            .map(|f| f.strip_prefix(root).unwrap().to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_excludes_transient_files() {
        let dir = test_dir();
        let root = dir.path();
        write_file(root.join("a.txt"), "keep");
        write_file(root.join("b.tmp"), "temp");
        write_file(root.join("c.cache"), "cache");
        write_file(root.join("d.lock"), "lock");
        write_file(root.join("e.cache.d/inner.txt"), "cache dir");
        write_file(root.join("sub/f.txt"), "keep");

        let files = ScopeRules::default().resolve_scope(&[root]).unwrap();

        assert_eq!(names(&files, root), vec!["a.txt", "sub/f.txt"]);
    }

    #[test]
    fn test_skips_hidden_entries() {
        let dir = test_dir();
        let root = dir.path();
        write_file(root.join(".hidden"), "x");
        write_file(root.join(".git/config"), "x");
        write_file(root.join("visible"), "x");

        let files = ScopeRules::default().resolve_scope(&[root]).unwrap();

        assert_eq!(names(&files, root), vec!["visible"]);
    }

    #[test]
    fn test_is_transient() {
        assert!(is_transient("/home/u/file.tmp"));
        assert!(is_transient("/home/u/.cache/x"));
        assert!(is_transient("/var/app.lock"));
        assert!(is_transient("/proc/self/status"));
        assert!(is_transient("/sys/kernel"));
        assert!(!is_transient("/home/u/notes.txt"));
        assert!(!is_transient("/system/file"));
    }

    #[test]
    fn test_path_depth() {
        assert_eq!(path_depth("/"), 0);
        assert_eq!(path_depth("/a"), 1);
        assert_eq!(path_depth("/a/b/c.txt"), 3);
    }

    #[test]
    fn test_depth_limit_skips_deep_paths() {
        let dir = test_dir();
        let root = dir.path();
        write_file(root.join("a/shallow.txt"), "x");
        write_file(root.join("a/b/c/deep.txt"), "x");

        let rules = ScopeRules::builder()
            .max_depth(path_depth(root) + 2)
            .build();
        let files = rules.resolve_scope(&[root]).unwrap();

        assert_eq!(names(&files, root), vec!["a/shallow.txt"]);
    }

    #[test]
    fn test_depth_limit_applies_to_file_sources() {
        let dir = test_dir();
        let file = dir.path().join("x/y/z.txt");
        write_file(&file, "x");

        let rules = ScopeRules::builder().max_depth(path_depth(&file) - 1).build();
        assert!(rules.resolve_scope(&[&file]).unwrap().is_empty());
    }

    #[test]
    fn test_file_limit_caps_result() {
        let dir = test_dir();
        let root = dir.path();
        for i in 0..5 {
            write_file(root.join(format!("f{i}.txt")), "x");
        }

        let rules = ScopeRules::builder().max_files(3).build();
        let files = rules.resolve_scope(&[root]).unwrap();

        assert_eq!(names(&files, root), vec!["f0.txt", "f1.txt", "f2.txt"]);
    }

    #[test]
    fn test_file_source_included_directly() {
        let dir = test_dir();
        let file = dir.path().join("single.conf");
        write_file(&file, "x");

        let files = ScopeRules::default().resolve_scope(&[&file]).unwrap();
        assert_eq!(files, vec![file]);
    }

    #[test]
    fn test_overlapping_sources_deduplicated() {
        let dir = test_dir();
        let root = dir.path();
        write_file(root.join("sub/a.txt"), "x");

        let files = ScopeRules::default()
            .resolve_scope(&[root.to_path_buf(), root.join("sub")])
            .unwrap();
        assert_eq!(names(&files, root), vec!["sub/a.txt"]);
    }

    #[test]
    fn test_pruned_subtree_does_not_count_toward_cap() {
        let dir = test_dir();
        let root = dir.path();
        for i in 0..5 {
            write_file(root.join(format!("aaa_backups/old{i}.txt")), "x");
        }
        write_file(root.join("data/real.txt"), "x");

        let rules = ScopeRules::builder()
            .max_files(3)
            .prune(vec![root.join("aaa_backups")])
            .build();
        let files = rules.resolve_scope(&[root]).unwrap();

        assert_eq!(names(&files, root), vec!["data/real.txt"]);
    }

    #[test]
    fn test_pruned_file_source_skipped() {
        let dir = test_dir();
        let file = dir.path().join("secrets/key.pem");
        write_file(&file, "x");

        let rules = ScopeRules::builder()
            .prune(vec![dir.path().join("secrets")])
            .build();
        assert!(rules.resolve_scope(&[&file]).unwrap().is_empty());
    }

    #[test]
    fn test_exclude_globs() {
        let dir = test_dir();
        let root = dir.path();
        write_file(root.join("keep.txt"), "x");
        write_file(root.join("drop.log"), "x");
        write_file(root.join("sub/drop2.log"), "x");

        let rules = ScopeRules::builder()
            .exclude(vec![CustomDeserializedGlob::new("**/*.log").unwrap()])
            .build();
        let files = rules.resolve_scope(&[root]).unwrap();

        assert_eq!(names(&files, root), vec!["keep.txt"]);
    }

    #[test]
    fn test_symlinks_not_followed() {
        let dir = test_dir();
        let root = dir.path();
        write_file(root.join("real/file.txt"), "x");
        std::os::unix::fs::symlink(root.join("real"), root.join("link")).unwrap();

        let files = ScopeRules::default().resolve_scope(&[root]).unwrap();
        assert_eq!(names(&files, root), vec!["real/file.txt"]);
    }

    #[test]
    fn test_custom_deserialized_glob() {
        let glob: CustomDeserializedGlob = serde_json::from_str("\"*.txt\"").unwrap();
        assert_eq!(glob.to_string(), "*.txt");
        assert!(serde_json::from_str::<CustomDeserializedGlob>("\"[invalid\"").is_err());
    }
}
