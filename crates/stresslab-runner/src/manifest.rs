use crate::error::RunnerError;
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use tracing::warn;

/// Ordered permutation identifiers loaded from a newline-delimited file such
/// as `shuffled.txt`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    ids: Vec<String>,
}

impl Manifest {
    pub fn load(path: &Path) -> Result<Self, RunnerError> {
        let text = fs::read_to_string(path).map_err(|source| RunnerError::ManifestUnreadable {
            path: path.to_path_buf(),
            source,
        })?;
        let manifest = Self::parse(&text);
        let duplicates = manifest.duplicates();
        if !duplicates.is_empty() {
            warn!(
                manifest = %path.display(),
                "duplicate permutation ids share output paths: {}",
                duplicates.join(", ")
            );
        }
        Ok(manifest)
    }

    /// Blank lines are skipped; every other line is taken as one identifier
    /// with surrounding whitespace removed.
    pub fn parse(text: &str) -> Self {
        let ids = text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();
        Self { ids }
    }

    pub fn from_ids<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            ids: ids.into_iter().map(Into::into).collect(),
        }
    }

    /// Drops the first `n` entries.
    pub fn skip(mut self, n: usize) -> Self {
        let n = n.min(self.ids.len());
        self.ids.drain(..n);
        self
    }

    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    fn duplicates(&self) -> Vec<String> {
        let mut seen = BTreeSet::new();
        let mut dups = BTreeSet::new();
        for id in &self.ids {
            if !seen.insert(id.as_str()) {
                dups.insert(id.clone());
            }
        }
        dups.into_iter().collect()
    }
}
