use std::path::{Path, PathBuf};

/// Maps a permutation id to every file the pipeline reads or writes for it.
/// Distinct ids always yield distinct paths, so workers never share a file.
#[derive(Debug, Clone)]
pub struct Layout {
    pub recreated_dir: PathBuf,
    pub stress_dir: PathBuf,
}

impl Layout {
    pub fn new(recreated_dir: impl Into<PathBuf>, stress_dir: impl Into<PathBuf>) -> Self {
        Self {
            recreated_dir: recreated_dir.into(),
            stress_dir: stress_dir.into(),
        }
    }

    /// Verified source before stress injection.
    pub fn recreated_source(&self, id: &str) -> PathBuf {
        self.recreated_dir
            .join(format!("recreated_{}.verified.c0", id))
    }

    /// Unverified source consumed by the verification script.
    pub fn unverified_source(&self, id: &str) -> PathBuf {
        self.recreated_dir.join(format!("recreated_{}.c0", id))
    }

    pub fn stress_source(&self, id: &str) -> PathBuf {
        self.stress_dir.join(format!("recreated_{}.verified.c0", id))
    }

    /// C file the transpiler leaves next to the stress source.
    pub fn transpiled_c(&self, id: &str) -> PathBuf {
        self.stress_dir
            .join(format!("recreated_{}.verified.c0.c", id))
    }

    pub fn time_file(&self, id: &str) -> PathBuf {
        self.stress_dir
            .join(format!("recreated_{}.verified.time.txt", id))
    }
}

pub fn binary_path(dir: &Path, id: &str) -> PathBuf {
    dir.join(format!("recreated_{}", id))
}
