use std::{
    fs,
    path::{Path, PathBuf},
};

use super::CommitRef;
use crate::{Error, Result};

/// Content-addressed on-disk store of engine source trees, one directory per commit.
///
/// Entries are written under a staging directory first and moved into place with a single rename, so an entry
/// that exists is always complete.
#[derive(Clone, Debug)]
pub struct SourceCache {
    root: PathBuf,
}

impl SourceCache {
    /// Opens the cache rooted at `root`. Nothing is created until the first entry is staged.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Cache root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Canonical location of the entry for `commit`.
    pub fn entry_path(&self, commit: &CommitRef) -> PathBuf {
        self.root.join(commit.as_str())
    }

    /// Whether a complete entry for `commit` exists.
    pub fn contains(&self, commit: &CommitRef) -> bool {
        self.entry_path(commit).is_dir()
    }

    /// Creates a fresh staging area for `commit`. It is removed when dropped.
    pub fn stage(&self, commit: &CommitRef) -> Result<Staging> {
        let path = self.root.join("tmp").join(commit.as_str());
        if path.exists() {
            log::debug!("removing stale staging directory {}", path.display());
            fs::remove_dir_all(&path)?;
        }
        fs::create_dir_all(path.join("download"))?;
        fs::create_dir_all(path.join("tree"))?;
        Ok(Staging { path })
    }

    /// Moves the single top-level directory of the staged tree into its canonical location.
    pub fn commit(&self, staging: &Staging, commit: &CommitRef) -> Result<PathBuf> {
        let mut entries = fs::read_dir(staging.tree())?
            .map(|entry| entry.map(|entry| entry.path()))
            .collect::<Result<Vec<_>, _>>()?;
        let top = match entries.len() {
            1 => entries.remove(0),
            0 => return Err(Error::Fetch("downloaded source tree is empty".to_string())),
            n => {
                return Err(Error::Fetch(format!(
                    "expected a single top-level directory in the source tree, found {n} entries"
                )))
            }
        };
        if !top.is_dir() {
            return Err(Error::Fetch(format!(
                "top-level entry {} is not a directory",
                top.display()
            )));
        }

        let destination = self.entry_path(commit);
        fs::rename(&top, &destination)?;
        log::debug!("cached source code at {}", destination.display());
        Ok(destination)
    }
}

/// Scratch directory for one cache entry in the making.
#[derive(Debug)]
pub struct Staging {
    path: PathBuf,
}

impl Staging {
    /// Root of the staging area.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Where downloaded archives go.
    pub fn download(&self) -> PathBuf {
        self.path.join("download")
    }

    /// Where the source tree is extracted or cloned.
    pub fn tree(&self) -> PathBuf {
        self.path.join("tree")
    }
}

impl Drop for Staging {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_dir_all(&self.path) {
            log::warn!(
                "could not remove staging directory {}: {err}",
                self.path.display()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commits_single_top_level_directory() {
        let dir = tempfile::tempdir().unwrap();
        let cache = SourceCache::new(dir.path());
        let commit = CommitRef::new("abc123");
        assert!(!cache.contains(&commit));

        let staging = cache.stage(&commit).unwrap();
        fs::create_dir_all(staging.tree().join("owner-repo-abc123/src")).unwrap();
        fs::write(staging.tree().join("owner-repo-abc123/src/main.c"), "int main;").unwrap();

        let entry = cache.commit(&staging, &commit).unwrap();
        assert_eq!(entry, dir.path().join("abc123"));
        assert!(cache.contains(&commit));
        assert!(entry.join("src/main.c").is_file());

        let staging_path = staging.path().to_path_buf();
        drop(staging);
        assert!(!staging_path.exists());
    }

    #[test]
    fn rejects_ambiguous_tree_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let cache = SourceCache::new(dir.path());
        let commit = CommitRef::new("def456");

        let staging_path = {
            let staging = cache.stage(&commit).unwrap();
            fs::create_dir(staging.tree().join("a")).unwrap();
            fs::create_dir(staging.tree().join("b")).unwrap();
            assert!(matches!(
                cache.commit(&staging, &commit),
                Err(Error::Fetch(_))
            ));
            staging.path().to_path_buf()
        };

        assert!(!staging_path.exists());
        assert!(!cache.contains(&commit));
    }
}
