use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Component, Path};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

/// One file or directory in a job directory, addressed by its path relative
/// to the job root. The root itself has the empty path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub path: String,
    pub name: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
    pub is_directory: bool,
    pub parent: Option<String>,
    pub children: Vec<String>,
}

/// Decides what a manifest scan records and where it descends.
pub trait ManifestFilter: Send + Sync {
    fn include_file(&self, _relative_path: &str) -> bool {
        true
    }

    fn include_directory(&self, _relative_path: &str) -> bool {
        true
    }

    /// Whether to look inside a directory. A directory can be listed without
    /// being walked.
    fn walk_directory(&self, _relative_path: &str) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl ManifestFilter for AcceptAll {}

/// Skips the setup-internal directory contents so manifests stay small.
#[derive(Debug, Clone, Default)]
pub struct PrefixFilter {
    pub unwalked_prefixes: Vec<String>,
}

impl ManifestFilter for PrefixFilter {
    fn walk_directory(&self, relative_path: &str) -> bool {
        !self
            .unwalked_prefixes
            .iter()
            .any(|p| relative_path == p || relative_path.starts_with(&format!("{}/", p)))
    }
}

/// Snapshot of everything under a job directory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryManifest {
    entries: BTreeMap<String, ManifestEntry>,
}

impl DirectoryManifest {
    pub fn from_entries(entries: impl IntoIterator<Item = ManifestEntry>) -> Self {
        Self {
            entries: entries.into_iter().map(|e| (e.path.clone(), e)).collect(),
        }
    }

    /// Walk `root` and record every entry the filter admits. Symlinks are
    /// not followed.
    pub fn scan(root: &Path, filter: &dyn ManifestFilter) -> std::io::Result<Self> {
        let mut entries = BTreeMap::new();
        let mut walker = WalkDir::new(root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| {
                e.depth() == 0
                    || !e.file_type().is_dir()
                    || filter.include_directory(&relative_path(root, e.path()))
            });

        while let Some(item) = walker.next() {
            let item = match item {
                Ok(item) => item,
                Err(e) if vanished(&e) => continue,
                Err(e) => return Err(e.into()),
            };
            let meta = match item.metadata() {
                Ok(meta) => meta,
                Err(e) if vanished(&e) => continue,
                Err(e) => return Err(e.into()),
            };
            let relative = relative_path(root, item.path());
            let is_directory = item.file_type().is_dir();

            if item.depth() > 0 {
                if is_directory {
                    if !filter.walk_directory(&relative) {
                        walker.skip_current_dir();
                    }
                } else if !item.file_type().is_file() || !filter.include_file(&relative) {
                    continue;
                }
            }

            let parent = (item.depth() > 0).then(|| match relative.rsplit_once('/') {
                Some((parent, _)) => parent.to_string(),
                None => String::new(),
            });
            entries.insert(
                relative.clone(),
                ManifestEntry {
                    path: relative,
                    name: item.file_name().to_string_lossy().into_owned(),
                    size: if is_directory { 0 } else { meta.len() },
                    last_modified: modified(&meta),
                    is_directory,
                    parent,
                    children: Vec::new(),
                },
            );
        }

        let links: Vec<(String, String)> = entries
            .values()
            .filter_map(|e| e.parent.clone().map(|p| (p, e.path.clone())))
            .collect();
        for (parent, child) in links {
            if let Some(parent) = entries.get_mut(&parent) {
                parent.children.push(child);
            }
        }
        for entry in entries.values_mut() {
            entry.children.sort();
        }
        Ok(Self { entries })
    }

    pub fn entry(&self, relative_path: &str) -> Option<&ManifestEntry> {
        self.entries.get(relative_path)
    }

    pub fn entries(&self) -> impl Iterator<Item = &ManifestEntry> {
        self.entries.values()
    }

    pub fn files(&self) -> impl Iterator<Item = &ManifestEntry> {
        self.entries.values().filter(|e| !e.is_directory)
    }

    pub fn num_files(&self) -> usize {
        self.files().count()
    }

    pub fn num_directories(&self) -> usize {
        self.entries.values().filter(|e| e.is_directory).count()
    }

    pub fn total_size(&self) -> u64 {
        self.files().map(|e| e.size).sum()
    }

    pub fn largest_file_size(&self) -> u64 {
        self.files().map(|e| e.size).max().unwrap_or(0)
    }
}

/// Files can vanish while the job runs. The root itself must exist.
fn vanished(e: &walkdir::Error) -> bool {
    e.depth() > 0 && e.io_error().map(|io| io.kind()) == Some(ErrorKind::NotFound)
}

/// `path` relative to `root`, with `/` separators. The root itself is "".
fn relative_path(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .map(|rel| {
            rel.components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/")
        })
        .unwrap_or_default()
}

fn modified(meta: &std::fs::Metadata) -> DateTime<Utc> {
    meta.modified()
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now())
}

/// Normalize a relative path, rejecting anything that would climb above the
/// root. Returns `None` for escapes and absolute paths.
pub fn normalize_relative_path(path: &str) -> Option<String> {
    let mut parts: Vec<String> = Vec::new();
    for component in Path::new(path).components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::CurDir => {}
            Component::ParentDir => {
                parts.pop()?;
            }
            Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(parts.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_records_files_and_directories() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("logs/deep")).unwrap();
        std::fs::write(dir.path().join("stdout"), b"hello").unwrap();
        std::fs::write(dir.path().join("logs/deep/a.log"), b"0123456789").unwrap();

        let manifest = DirectoryManifest::scan(dir.path(), &AcceptAll).unwrap();
        assert!(manifest.entry("").unwrap().is_directory);
        assert_eq!(manifest.entry("stdout").unwrap().size, 5);
        assert_eq!(manifest.entry("logs/deep/a.log").unwrap().size, 10);
        assert_eq!(manifest.num_files(), 2);
        assert_eq!(manifest.total_size(), 15);
        assert_eq!(manifest.largest_file_size(), 10);
        assert_eq!(
            manifest.entry("").unwrap().children,
            vec!["logs".to_string(), "stdout".to_string()]
        );
    }

    #[test]
    fn unwalked_directories_are_listed_but_not_descended() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("jobcoord/cluster")).unwrap();
        std::fs::write(dir.path().join("jobcoord/cluster/big.jar"), b"x").unwrap();

        let filter = PrefixFilter {
            unwalked_prefixes: vec!["jobcoord".to_string()],
        };
        let manifest = DirectoryManifest::scan(dir.path(), &filter).unwrap();
        assert!(manifest.entry("jobcoord").is_some());
        assert!(manifest.entry("jobcoord/cluster").is_none());
    }

    #[test]
    fn excluded_directories_and_symlinks_are_skipped() {
        struct NoCache;
        impl ManifestFilter for NoCache {
            fn include_directory(&self, relative_path: &str) -> bool {
                relative_path != "cache"
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        std::fs::write(outside.path().join("secret"), b"s").unwrap();
        std::fs::create_dir(dir.path().join("cache")).unwrap();
        std::fs::write(dir.path().join("cache/blob"), b"b").unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("link")).unwrap();

        let manifest = DirectoryManifest::scan(dir.path(), &NoCache).unwrap();
        assert!(manifest.entry("cache").is_none());
        assert!(manifest.entry("cache/blob").is_none());
        assert!(manifest.entry("link").is_none());
        assert!(manifest.entry("link/secret").is_none());
        assert_eq!(manifest.num_files(), 0);
    }

    #[test]
    fn missing_root_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(DirectoryManifest::scan(&dir.path().join("gone"), &AcceptAll).is_err());
    }

    #[test]
    fn normalization_rejects_escapes() {
        assert_eq!(
            normalize_relative_path("logs/./a/../b.txt").as_deref(),
            Some("logs/b.txt")
        );
        assert_eq!(normalize_relative_path("").as_deref(), Some(""));
        assert!(normalize_relative_path("../etc/passwd").is_none());
        assert!(normalize_relative_path("a/../../b").is_none());
        assert!(normalize_relative_path("/etc/passwd").is_none());
    }
}
