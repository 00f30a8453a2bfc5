//! Shared test scaffolding for cask.
//!
//! Storage tests all revolve around a throwaway directory tree that
//! cask fills with `<prefix>.<suffix>.<gen>` store files and bucket
//! settings. [`StoreRoot`] owns that tempdir and carries the
//! file-inspection helpers the registry and view tests keep repeating.

#![allow(clippy::expect_used)]

use std::fs;
use std::path::Path;

use tempfile::TempDir;

/// A disposable on-disk root for store and registry tests.
///
/// The directory and everything cask wrote underneath it are removed
/// when the value drops.
pub struct StoreRoot {
    dir: TempDir,
}

#[allow(clippy::new_without_default)]
impl StoreRoot {
    /// Creates an empty root.
    ///
    /// # Panics
    ///
    /// Panics when the temporary directory cannot be created.
    pub fn new() -> Self {
        StoreRoot { dir: TempDir::new().expect("create temp store root") }
    }

    /// Path of the root directory.
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Names of the files directly under the root, sorted. Handy in
    /// assertion messages when a store file went missing.
    pub fn file_names(&self) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(self.dir.path())
            .expect("read store root")
            .map(|entry| {
                entry.expect("store root entry").file_name().to_string_lossy().into_owned()
            })
            .collect();
        names.sort();
        names
    }

    /// Whether any generation of `<prefix>.<suffix>.<gen>` has been
    /// flushed under the root.
    pub fn has_store_file(&self, prefix: &str, suffix: &str) -> bool {
        let head = format!("{prefix}.{suffix}.");
        self.file_names()
            .iter()
            .any(|name| name.strip_prefix(&head).is_some_and(|gen| gen.parse::<u64>().is_ok()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lists_and_matches_store_files() {
        let root = StoreRoot::new();
        fs::write(root.path().join("u_0.views.3"), b"x").expect("write");
        fs::write(root.path().join("settings.json"), b"{}").expect("write");

        assert_eq!(
            root.file_names(),
            vec!["settings.json".to_string(), "u_0.views.3".to_string()]
        );
        assert!(root.has_store_file("u_0", "views"));
        assert!(!root.has_store_file("u_0", "data"));
        assert!(!root.has_store_file("u_1", "views"));
        // A non-numeric tail is not a generation.
        fs::write(root.path().join("u_0.data.tmp"), b"x").expect("write");
        assert!(!root.has_store_file("u_0", "data"));
    }
}
