//! Lazy, restartable discovery of candidate files under a set of roots.

use std::path::{Path, PathBuf};

use globset::{Glob, GlobSet, GlobSetBuilder};
use walkdir::WalkDir;

use crate::LedgerError;

/// Roots plus compiled glob patterns. Call [`AssetDiscoverer::iter`] as many times as needed;
/// each call walks the roots again from the start.
#[derive(Debug, Clone)]
pub struct AssetDiscoverer {
    roots: Vec<PathBuf>,
    patterns: Vec<String>,
    matcher: GlobSet,
}

impl AssetDiscoverer {
    /// Compile `patterns` against `roots`. An empty pattern list matches every file.
    ///
    /// # Errors
    /// Returns [`LedgerError::InvalidPattern`] when a pattern does not compile.
    pub fn new<P, S>(
        roots: impl IntoIterator<Item = P>,
        patterns: impl IntoIterator<Item = S>,
    ) -> Result<Self, LedgerError>
    where
        P: Into<PathBuf>,
        S: Into<String>,
    {
        let patterns = patterns.into_iter().map(Into::into).collect::<Vec<String>>();
        let mut builder = GlobSetBuilder::new();
        for pattern in &patterns {
            let glob = Glob::new(pattern).map_err(|err| LedgerError::InvalidPattern {
                pattern: pattern.clone(),
                reason: err.to_string(),
            })?;
            builder.add(glob);
        }
        let matcher = builder.build().map_err(|err| LedgerError::InvalidPattern {
            pattern: patterns.join(","),
            reason: err.to_string(),
        })?;

        Ok(Self { roots: roots.into_iter().map(Into::into).collect(), patterns, matcher })
    }

    #[must_use]
    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    #[must_use]
    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    #[must_use]
    pub fn iter(&self) -> DiscoveredPaths<'_> {
        DiscoveredPaths { discoverer: self, next_root: 0, walker: None }
    }

    fn matches(&self, root: &Path, path: &Path) -> bool {
        if self.patterns.is_empty() {
            return true;
        }
        let relative = path.strip_prefix(root).unwrap_or(path);
        self.matcher.is_match(relative)
            || path.file_name().is_some_and(|name| self.matcher.is_match(Path::new(name)))
    }
}

impl<'a> IntoIterator for &'a AssetDiscoverer {
    type Item = PathBuf;
    type IntoIter = DiscoveredPaths<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Iterator returned by [`AssetDiscoverer::iter`]. Directory roots are walked recursively;
/// file roots are yielded as-is whether or not they match a pattern.
pub struct DiscoveredPaths<'a> {
    discoverer: &'a AssetDiscoverer,
    next_root: usize,
    walker: Option<(&'a Path, walkdir::IntoIter)>,
}

impl Iterator for DiscoveredPaths<'_> {
    type Item = PathBuf;

    fn next(&mut self) -> Option<PathBuf> {
        let discoverer = self.discoverer;
        loop {
            if let Some((root, walker)) = self.walker.as_mut() {
                match walker.next() {
                    Some(Ok(entry)) => {
                        if entry.file_type().is_file() && discoverer.matches(root, entry.path()) {
                            return Some(entry.into_path());
                        }
                        continue;
                    }
                    Some(Err(err)) => {
                        tracing::warn!(
                            root = %root.display(),
                            error = %err,
                            "skipping unreadable entry"
                        );
                        continue;
                    }
                    None => {}
                }
            }
            self.walker = None;

            let root = discoverer.roots.get(self.next_root)?;
            self.next_root += 1;

            if root.is_file() {
                return Some(root.clone());
            }
            if root.is_dir() {
                self.walker =
                    Some((root.as_path(), WalkDir::new(root).follow_links(true).into_iter()));
            } else {
                tracing::warn!(root = %root.display(), "discovery root does not exist; skipping");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::fs;

    use super::*;

    fn layout() -> Result<tempfile::TempDir, Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        fs::create_dir_all(dir.path().join("captures/nested"))?;
        fs::write(dir.path().join("captures/login.har"), b"{}")?;
        fs::write(dir.path().join("captures/nested/checkout.har"), b"{}")?;
        fs::write(dir.path().join("captures/nested/bundle.zip"), b"PK")?;
        fs::write(dir.path().join("captures/notes.md"), b"# notes")?;
        Ok(dir)
    }

    fn names(paths: impl IntoIterator<Item = PathBuf>) -> BTreeSet<String> {
        paths
            .into_iter()
            .filter_map(|path| path.file_name().map(|name| name.to_string_lossy().into_owned()))
            .collect()
    }

    #[test]
    fn walks_directories_recursively_and_filters_by_pattern(
    ) -> Result<(), Box<dyn std::error::Error>> {
        let dir = layout()?;
        let discoverer = AssetDiscoverer::new([dir.path().join("captures")], ["*.har"])?;

        let found = names(discoverer.iter());
        assert_eq!(found, BTreeSet::from(["checkout.har".to_string(), "login.har".to_string()]));
        Ok(())
    }

    #[test]
    fn file_roots_are_yielded_regardless_of_pattern() -> Result<(), Box<dyn std::error::Error>> {
        let dir = layout()?;
        let notes = dir.path().join("captures/notes.md");
        let discoverer = AssetDiscoverer::new([notes.clone()], ["*.har"])?;

        assert_eq!(discoverer.iter().collect::<Vec<_>>(), vec![notes]);
        Ok(())
    }

    #[test]
    fn iteration_is_restartable() -> Result<(), Box<dyn std::error::Error>> {
        let dir = layout()?;
        let discoverer = AssetDiscoverer::new([dir.path().to_path_buf()], ["**/*.har", "*.zip"])?;

        let first = names(discoverer.iter());
        let second = names(&discoverer);
        assert_eq!(first.len(), 3);
        assert_eq!(first, second);
        Ok(())
    }

    #[test]
    fn empty_pattern_set_matches_everything() -> Result<(), Box<dyn std::error::Error>> {
        let dir = layout()?;
        let discoverer = AssetDiscoverer::new([dir.path().to_path_buf()], Vec::<String>::new())?;
        assert_eq!(discoverer.iter().count(), 4);
        Ok(())
    }

    #[test]
    fn missing_roots_are_skipped() -> Result<(), Box<dyn std::error::Error>> {
        let dir = layout()?;
        let discoverer = AssetDiscoverer::new(
            [dir.path().join("does-not-exist"), dir.path().join("captures/login.har")],
            ["*.har"],
        )?;
        assert_eq!(names(discoverer.iter()), BTreeSet::from(["login.har".to_string()]));
        Ok(())
    }

    #[test]
    fn invalid_pattern_is_rejected() {
        let result = AssetDiscoverer::new([PathBuf::from(".")], ["captures/[unclosed"]);
        assert!(matches!(result, Err(LedgerError::InvalidPattern { .. })));
    }
}
