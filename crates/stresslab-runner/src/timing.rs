//! Wall-clock measurement of compiled permutations.

use crate::error::RunnerError;
use crate::process::{print_cmd, Invocation, OutputMode};
use crate::toolchain::check_timeout;
use anyhow::{Context, Result};
use regex::Regex;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use std::sync::OnceLock;
use std::time::{Duration, Instant};
use tracing::warn;

pub const DEFAULT_RUNS: u32 = 30;
pub const DEFAULT_STRESS: u64 = 128;

#[derive(Debug, Clone)]
pub struct TimedRun {
    pub runs: u32,
    /// Fail the measurement when any run exits non-zero.
    pub require_success: bool,
    pub timeout: Option<Duration>,
}

impl Default for TimedRun {
    fn default() -> Self {
        Self {
            runs: DEFAULT_RUNS,
            require_success: false,
            timeout: None,
        }
    }
}

impl TimedRun {
    /// Runs `binary --stress <stress>` and returns the mean duration in
    /// seconds, or `None` when the binary does not exist.
    pub fn measure_stress(&self, binary: &Path, stress: u64) -> Result<Option<f64>> {
        let inv = Invocation::new(binary.display().to_string())
            .args(["--stress".to_string(), stress.to_string()]);
        self.measure(&inv)
    }

    pub fn measure(&self, inv: &Invocation) -> Result<Option<f64>> {
        if self.runs == 0 {
            return Err(RunnerError::InvalidConfig("runs must be at least 1".to_string()).into());
        }
        let inv = inv
            .clone()
            .output(OutputMode::Discard)
            .timeout(self.timeout);
        print_cmd(&inv);
        let mut total = Duration::ZERO;
        for _ in 0..self.runs {
            let start = Instant::now();
            let child = match inv.spawn() {
                Ok(child) => child,
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    println!("binary not found");
                    warn!(binary = %inv.program(), "binary not found");
                    return Ok(None);
                }
                Err(e) => {
                    return Err(e).with_context(|| format!("spawn {}", inv.program()));
                }
            };
            let out = inv.wait(child, start)?;
            total += start.elapsed();
            check_timeout(&inv, &out, self.timeout)?;
            if self.require_success && !out.status.success() {
                return Err(RunnerError::NonZeroExit {
                    command: inv.display(),
                    code: out.status_label(),
                }
                .into());
            }
        }
        Ok(Some(total.as_secs_f64() / f64::from(self.runs)))
    }
}

/// Records a measurement as text, `None` for an absent one.
pub fn write_time_file(path: &Path, seconds: Option<f64>) -> Result<()> {
    let text = match seconds {
        Some(s) => s.to_string(),
        None => "None".to_string(),
    };
    fs::write(path, text).with_context(|| format!("write {}", path.display()))
}

/// Extracts the `real` duration from `time` output, accepting both
/// `real 0m1.250s` and `real 1.250s`.
pub fn parse_real_time(text: &str) -> Option<f64> {
    static REAL: OnceLock<Regex> = OnceLock::new();
    let re = REAL.get_or_init(|| {
        Regex::new(r"real\s+(?:(\d+)m)?([0-9]+(?:\.[0-9]+)?)s").expect("static regex")
    });
    let caps = re.captures(text)?;
    let minutes: f64 = match caps.get(1) {
        Some(m) => m.as_str().parse().ok()?,
        None => 0.0,
    };
    let seconds: f64 = caps.get(2)?.as_str().parse().ok()?;
    Some(minutes * 60.0 + seconds)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::path::PathBuf;

    fn scratch(tag: &str) -> PathBuf {
        let root = std::env::temp_dir().join(format!(
            "stresslab_timing_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        fs::create_dir_all(&root).expect("scratch dir");
        root
    }

    #[cfg(unix)]
    fn write_script(path: &Path, body: &str) {
        use std::os::unix::fs::PermissionsExt;
        fs::write(path, format!("#!/bin/sh\n{}\n", body)).expect("script");
        let mut perms = fs::metadata(path).expect("meta").permissions();
        perms.set_mode(0o755);
        fs::set_permissions(path, perms).expect("chmod");
    }

    #[test]
    fn missing_binary_yields_absent_measurement() {
        let root = scratch("missing");
        let timed = TimedRun {
            runs: 3,
            ..TimedRun::default()
        };
        let seconds = timed
            .measure_stress(&root.join("recreated_404"), 128)
            .expect("missing binary is not an error");
        assert_eq!(seconds, None);
        let _ = fs::remove_dir_all(root);
    }

    #[cfg(unix)]
    #[test]
    fn mean_tracks_sleep_duration() {
        let root = scratch("sleep");
        let bin = root.join("recreated_1");
        write_script(&bin, "sleep 0.2");
        let timed = TimedRun {
            runs: 3,
            ..TimedRun::default()
        };
        let mean = timed
            .measure_stress(&bin, 128)
            .expect("measure")
            .expect("present");
        assert!(mean >= 0.2, "mean too small: {}", mean);
        assert!(mean < 1.5, "mean too large: {}", mean);
        let _ = fs::remove_dir_all(root);
    }

    #[cfg(unix)]
    #[test]
    fn stress_flag_is_passed_to_binary() {
        let root = scratch("args");
        let bin = root.join("recreated_2");
        let record = root.join("args.txt");
        write_script(&bin, &format!("echo \"$@\" > '{}'", record.display()));
        let timed = TimedRun {
            runs: 1,
            ..TimedRun::default()
        };
        timed.measure_stress(&bin, 512).expect("measure");
        assert_eq!(
            fs::read_to_string(&record).expect("record"),
            "--stress 512\n"
        );
        let _ = fs::remove_dir_all(root);
    }

    #[cfg(unix)]
    #[test]
    fn failing_runs_only_matter_when_required() {
        let root = scratch("fail");
        let bin = root.join("recreated_3");
        write_script(&bin, "exit 2");
        let lenient = TimedRun {
            runs: 2,
            ..TimedRun::default()
        };
        assert!(lenient.measure_stress(&bin, 1).expect("measure").is_some());
        let strict = TimedRun {
            runs: 2,
            require_success: true,
            ..TimedRun::default()
        };
        let err = strict.measure_stress(&bin, 1).expect_err("must fail");
        assert!(err.to_string().contains("status 2"), "unexpected: {}", err);
        let _ = fs::remove_dir_all(root);
    }

    #[cfg(unix)]
    #[test]
    fn hung_binary_times_out() {
        let root = scratch("hang");
        let bin = root.join("recreated_4");
        write_script(&bin, "exec sleep 5");
        let timed = TimedRun {
            runs: 1,
            timeout: Some(Duration::from_millis(100)),
            ..TimedRun::default()
        };
        let started = Instant::now();
        let err = timed.measure_stress(&bin, 1).expect_err("must time out");
        assert!(started.elapsed() < Duration::from_secs(4));
        assert!(matches!(
            err.downcast_ref::<RunnerError>(),
            Some(RunnerError::TimedOut { .. })
        ));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn zero_runs_is_rejected() {
        let timed = TimedRun {
            runs: 0,
            ..TimedRun::default()
        };
        assert!(timed.measure_stress(Path::new("/bin/true"), 1).is_err());
    }

    #[test]
    fn time_file_records_absent_as_none() {
        let root = scratch("file");
        let path = root.join("recreated_1.verified.time.txt");
        write_time_file(&path, None).expect("write");
        assert_eq!(fs::read_to_string(&path).expect("read"), "None");
        write_time_file(&path, Some(0.5)).expect("write");
        assert_eq!(fs::read_to_string(&path).expect("read"), "0.5");
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn real_time_parses_minutes_and_seconds() {
        let stderr = "\nreal\t1m2.500s\nuser\t0m0.010s\nsys\t0m0.001s\n";
        assert_eq!(parse_real_time(stderr), Some(62.5));
        assert_eq!(parse_real_time("real 0.25s"), Some(0.25));
        assert_eq!(parse_real_time("user 0m1.0s"), None);
    }
}
