use crate::batch::{BatchOptions, ReportOrder};
use crate::error::RunnerError;
use crate::instrument::{AssignmentMatch, DuplicateAssignments};
use crate::layout::Layout;
use crate::toolchain::{Transpiler, DEFAULT_RESOURCES_DIR};
use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_MANIFEST: &str = "shuffled.txt";
pub const DEFAULT_RECREATED_DIR: &str = "recreated";
pub const DEFAULT_STRESS_DIR: &str = "stress";
pub const DEFAULT_TRANSPILER: &str = "cc0";

/// One layer of settings. The YAML config file and the command line each
/// produce a layer; unset keys fall through to the layer below.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigLayer {
    #[serde(default)]
    pub manifest: Option<PathBuf>,
    #[serde(default)]
    pub workers: Option<usize>,
    #[serde(default)]
    pub order: Option<ReportOrder>,
    #[serde(default)]
    pub retries: Option<u32>,
    #[serde(default)]
    pub timeout_seconds: Option<f64>,
    #[serde(default)]
    pub cc0: Option<PathBuf>,
    #[serde(default)]
    pub transpiler: Option<String>,
    #[serde(default)]
    pub resources_dir: Option<String>,
    #[serde(default)]
    pub recreated_dir: Option<PathBuf>,
    #[serde(default)]
    pub stress_dir: Option<PathBuf>,
    #[serde(default)]
    pub assignment: Option<AssignmentMatch>,
    #[serde(default)]
    pub duplicates: Option<DuplicateAssignments>,
}

impl ConfigLayer {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("parse config {}", path.display()))
    }

    pub fn parse(raw: &str) -> Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(raw)?)
    }

    /// Values set in `self` win over `lower`.
    pub fn over(self, lower: ConfigLayer) -> ConfigLayer {
        ConfigLayer {
            manifest: self.manifest.or(lower.manifest),
            workers: self.workers.or(lower.workers),
            order: self.order.or(lower.order),
            retries: self.retries.or(lower.retries),
            timeout_seconds: self.timeout_seconds.or(lower.timeout_seconds),
            cc0: self.cc0.or(lower.cc0),
            transpiler: self.transpiler.or(lower.transpiler),
            resources_dir: self.resources_dir.or(lower.resources_dir),
            recreated_dir: self.recreated_dir.or(lower.recreated_dir),
            stress_dir: self.stress_dir.or(lower.stress_dir),
            assignment: self.assignment.or(lower.assignment),
            duplicates: self.duplicates.or(lower.duplicates),
        }
    }
}

/// Fully resolved settings for one command.
#[derive(Debug, Clone)]
pub struct Settings {
    pub manifest: PathBuf,
    pub batch: BatchOptions,
    pub cc0: Option<PathBuf>,
    pub transpiler: Transpiler,
    pub layout: Layout,
    pub assignment: AssignmentMatch,
    pub duplicates: DuplicateAssignments,
}

impl Settings {
    /// Applies built-in defaults beneath `layer`. `default_workers` is the
    /// command's own pool size.
    pub fn resolve(layer: ConfigLayer, default_workers: usize) -> Result<Self, RunnerError> {
        let workers = layer.workers.unwrap_or(default_workers);
        if workers == 0 {
            return Err(RunnerError::InvalidConfig(
                "workers must be at least 1".to_string(),
            ));
        }
        let timeout = match layer.timeout_seconds {
            None => None,
            Some(s) if s.is_finite() && s > 0.0 => {
                Some(Duration::try_from_secs_f64(s).map_err(|e| {
                    RunnerError::InvalidConfig(format!(
                        "timeout_seconds {} is out of range: {}",
                        s, e
                    ))
                })?)
            }
            Some(s) => {
                return Err(RunnerError::InvalidConfig(format!(
                    "timeout_seconds must be positive, got {}",
                    s
                )))
            }
        };
        let resources_dir = layer
            .resources_dir
            .unwrap_or_else(|| DEFAULT_RESOURCES_DIR.to_string());
        Ok(Self {
            manifest: layer
                .manifest
                .unwrap_or_else(|| PathBuf::from(DEFAULT_MANIFEST)),
            batch: BatchOptions {
                workers,
                order: layer.order.unwrap_or_default(),
                retries: layer.retries.unwrap_or(0),
                timeout,
            },
            cc0: layer.cc0,
            transpiler: Transpiler {
                program: layer
                    .transpiler
                    .unwrap_or_else(|| DEFAULT_TRANSPILER.to_string()),
                resources_dir,
            },
            layout: Layout::new(
                layer
                    .recreated_dir
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_RECREATED_DIR)),
                layer
                    .stress_dir
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_STRESS_DIR)),
            ),
            assignment: layer.assignment.unwrap_or_default(),
            duplicates: layer.duplicates.unwrap_or_default(),
        })
    }

    pub fn require_cc0(&self) -> Result<&Path, RunnerError> {
        self.cc0.as_deref().ok_or_else(|| {
            RunnerError::InvalidConfig("cc0 installation path is required (--cc0)".to_string())
        })
    }
}
