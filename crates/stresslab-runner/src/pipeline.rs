//! Batch operations over a manifest: one item task per permutation, run
//! through [`run_batch`].

use crate::batch::{run_batch, BatchObserver, BatchReport, ItemContext};
use crate::config::Settings;
use crate::instrument::{InstrumentReport, StressInjection};
use crate::layout::binary_path;
use crate::platform::Platform;
use crate::process::{print_cmd, Invocation, OutputMode, ProcessOutput};
use crate::timing::{parse_real_time, write_time_file, TimedRun};
use crate::toolchain::{check_timeout, CompileRequest};
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use walkdir::WalkDir;

pub fn stress_all<O>(
    settings: &Settings,
    ids: &[String],
    observer: &mut O,
) -> Result<BatchReport<InstrumentReport>>
where
    O: BatchObserver<InstrumentReport> + ?Sized,
{
    let injection = StressInjection::new("stress", settings.assignment, settings.duplicates)?;
    let layout = &settings.layout;
    fs::create_dir_all(&layout.stress_dir)
        .with_context(|| format!("create {}", layout.stress_dir.display()))?;
    run_batch(
        ids,
        &settings.batch,
        |id, _| injection.instrument_file(&layout.recreated_source(id), &layout.stress_source(id)),
        observer,
    )
}

pub fn transpile_all<O>(
    settings: &Settings,
    ids: &[String],
    observer: &mut O,
) -> Result<BatchReport<ProcessOutput>>
where
    O: BatchObserver<ProcessOutput> + ?Sized,
{
    let layout = &settings.layout;
    let transpiler = &settings.transpiler;
    run_batch(
        ids,
        &settings.batch,
        |id, ctx| transpiler.transpile(&layout.stress_source(id), ctx.timeout),
        observer,
    )
}

pub struct CompileAll<'a> {
    pub cc0: &'a Path,
    pub out_dir: &'a Path,
    pub prefix: &'a [String],
    pub platform: Platform,
}

pub fn compile_all<O>(
    settings: &Settings,
    ids: &[String],
    job: &CompileAll<'_>,
    observer: &mut O,
) -> Result<BatchReport<ProcessOutput>>
where
    O: BatchObserver<ProcessOutput> + ?Sized,
{
    fs::create_dir_all(job.out_dir)
        .with_context(|| format!("create {}", job.out_dir.display()))?;
    let layout = &settings.layout;
    let resources_dir = settings.transpiler.resources_dir.as_str();
    run_batch(
        ids,
        &settings.batch,
        |id, ctx| {
            let src = layout.transpiled_c(id);
            let out = binary_path(job.out_dir, id);
            CompileRequest {
                src: &src,
                out: &out,
                cc0: job.cc0,
                prefix: job.prefix,
                platform: job.platform,
                resources_dir,
            }
            .run(ctx.timeout)
        },
        observer,
    )
}

pub struct TimeAll<'a> {
    pub bin_dir: &'a Path,
    pub runs: u32,
    pub stress: u64,
    /// Also record each mean in the stress directory's `.time.txt` file.
    pub write_time_files: bool,
}

pub fn time_all<O>(
    settings: &Settings,
    ids: &[String],
    job: &TimeAll<'_>,
    observer: &mut O,
) -> Result<BatchReport<Option<f64>>>
where
    O: BatchObserver<Option<f64>> + ?Sized,
{
    let layout = &settings.layout;
    if job.write_time_files {
        fs::create_dir_all(&layout.stress_dir)
            .with_context(|| format!("create {}", layout.stress_dir.display()))?;
    }
    run_batch(
        ids,
        &settings.batch,
        |id, ctx| {
            let timed = TimedRun {
                runs: job.runs,
                require_success: false,
                timeout: ctx.timeout,
            };
            let seconds = timed.measure_stress(&binary_path(job.bin_dir, id), job.stress)?;
            if job.write_time_files {
                write_time_file(&layout.time_file(id), seconds)?;
            }
            Ok(seconds)
        },
        observer,
    )
}

/// Runs `<script> <recreated_dir>/recreated_<id>.c0 --save-files` and returns
/// elapsed seconds.
pub fn verify_all<O>(
    settings: &Settings,
    ids: &[String],
    script: &str,
    observer: &mut O,
) -> Result<BatchReport<f64>>
where
    O: BatchObserver<f64> + ?Sized,
{
    let layout = &settings.layout;
    run_batch(
        ids,
        &settings.batch,
        |id, ctx| {
            let inv = Invocation::new(script)
                .arg(layout.unverified_source(id).display().to_string())
                .arg("--save-files")
                .output(OutputMode::Inherit)
                .timeout(ctx.timeout);
            print_cmd(&inv);
            let start = Instant::now();
            let out = inv.run()?;
            check_timeout(&inv, &out, ctx.timeout)?;
            let elapsed = start.elapsed().as_secs_f64();
            println!("Time: {:.2}s", elapsed);
            Ok(elapsed)
        },
        observer,
    )
}

/// Runs `<script> <id>` for every permutation, ignoring its exit status.
pub fn run_script_all<O>(
    settings: &Settings,
    ids: &[String],
    script: &str,
    observer: &mut O,
) -> Result<BatchReport<ProcessOutput>>
where
    O: BatchObserver<ProcessOutput> + ?Sized,
{
    run_batch(
        ids,
        &settings.batch,
        |id, ctx| {
            let inv = Invocation::new(script).arg(id).timeout(ctx.timeout);
            let out = inv.run()?;
            check_timeout(&inv, &out, ctx.timeout)?;
            Ok(out)
        },
        observer,
    )
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Evaluation {
    pub before: Option<f64>,
    pub after: Option<f64>,
}

impl Evaluation {
    /// Percentage speed-up of `after` relative to `before`.
    pub fn difference(&self) -> Option<f64> {
        match (self.before, self.after) {
            (Some(before), Some(after)) if before != 0.0 => Some((1.0 - after / before) * 100.0),
            _ => None,
        }
    }
}

/// Times the `before` and `after` builds of each permutation with
/// `<script> before <id>` and `<script> after <id>`.
pub fn evaluate_all<O>(
    settings: &Settings,
    ids: &[String],
    script: &str,
    observer: &mut O,
) -> Result<BatchReport<Evaluation>>
where
    O: BatchObserver<Evaluation> + ?Sized,
{
    run_batch(
        ids,
        &settings.batch,
        |id, ctx| {
            Ok(Evaluation {
                before: real_time_of(script, "before", id, ctx)?,
                after: real_time_of(script, "after", id, ctx)?,
            })
        },
        observer,
    )
}

fn real_time_of(script: &str, name: &str, id: &str, ctx: &ItemContext) -> Result<Option<f64>> {
    let inv = Invocation::new(script)
        .args([name, id])
        .timeout(ctx.timeout);
    let out = inv.run()?;
    check_timeout(&inv, &out, ctx.timeout)?;
    Ok(parse_real_time(&String::from_utf8_lossy(&out.stderr)))
}

/// `.c` files in `dir`, ordered by the number after the first `_` in their
/// name. Files without such a number sort last, by name.
pub fn comparison_sources(dir: &Path) -> Result<Vec<String>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
        let entry = entry.with_context(|| format!("list {}", dir.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            if name.ends_with(".c") {
                files.push(name.to_string());
            }
        }
    }
    files.sort_by(|a, b| {
        let ka = permutation_number(a);
        let kb = permutation_number(b);
        match (ka, kb) {
            (Some(x), Some(y)) => x.cmp(&y).then_with(|| a.cmp(b)),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => a.cmp(b),
        }
    });
    Ok(files)
}

fn permutation_number(name: &str) -> Option<u64> {
    let after = name.split('_').nth(1)?;
    after.split('.').next()?.parse().ok()
}

/// Report label for a comparison source: the file name minus its
/// `.verified.c0.c` suffix.
pub fn comparison_label(file: &str) -> &str {
    file.strip_suffix(".verified.c0.c").unwrap_or(file)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Comparison {
    pub gcc: Option<f64>,
    pub clang: Option<f64>,
}

impl Comparison {
    pub fn difference(&self) -> Option<f64> {
        Some((self.gcc? - self.clang?).abs())
    }
}

pub struct CompareAll<'a> {
    pub src_dir: &'a Path,
    pub work_dir: &'a Path,
    pub cc0: &'a Path,
    pub runs: u32,
    pub platform: Platform,
    /// Compiler command lines for the two sides, usually [`GCC_COMMAND`]
    /// and [`CLANG_COMMAND`].
    pub gcc: &'a [String],
    pub clang: &'a [String],
}

pub const GCC_COMMAND: [&str; 1] = ["gcc"];
pub const CLANG_COMMAND: [&str; 3] = ["clang", "-O3", "-fbracket-depth=512"];

/// Compiles each source with gcc and with clang and times both binaries.
/// A failed compile or a failing run leaves that side absent.
pub fn compare_all<O>(
    settings: &Settings,
    files: &[String],
    job: &CompareAll<'_>,
    observer: &mut O,
) -> Result<BatchReport<Comparison>>
where
    O: BatchObserver<Comparison> + ?Sized,
{
    fs::create_dir_all(job.work_dir)
        .with_context(|| format!("create {}", job.work_dir.display()))?;
    let resources_dir = settings.transpiler.resources_dir.as_str();
    run_batch(
        files,
        &settings.batch,
        |file, ctx| {
            let src = job.src_dir.join(file);
            let stem = comparison_label(file);
            let measure = |label: &str, prefix: &[String]| -> Result<Option<f64>> {
                let out: PathBuf = job.work_dir.join(format!("{}_{}", stem, label));
                let build = CompileRequest {
                    src: &src,
                    out: &out,
                    cc0: job.cc0,
                    prefix,
                    platform: job.platform,
                    resources_dir,
                }
                .run(ctx.timeout)?;
                if !build.success() {
                    return Ok(None);
                }
                let timed = TimedRun {
                    runs: job.runs,
                    require_success: true,
                    timeout: ctx.timeout,
                };
                Ok(timed
                    .measure(&Invocation::new(out.display().to_string()))
                    .ok()
                    .flatten())
            };
            Ok(Comparison {
                gcc: measure("gcc", job.gcc)?,
                clang: measure("clang", job.clang)?,
            })
        },
        observer,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::NoopObserver;
    use crate::config::ConfigLayer;
    use crate::toolchain::suffixed;
    use chrono::Utc;
    use std::time::Duration;

    fn scratch(tag: &str) -> PathBuf {
        let root = std::env::temp_dir().join(format!(
            "stresslab_pipeline_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        fs::create_dir_all(&root).expect("scratch dir");
        root
    }

    fn settings_in(root: &Path, workers: usize) -> Settings {
        let layer = ConfigLayer {
            recreated_dir: Some(root.join("recreated")),
            stress_dir: Some(root.join("stress")),
            workers: Some(workers),
            ..ConfigLayer::default()
        };
        Settings::resolve(layer, 1).expect("settings")
    }

    fn ids(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[cfg(unix)]
    fn executable(path: &Path, body: &str) {
        use std::os::unix::fs::PermissionsExt;

        fs::write(path, body).expect("script");
        let mut perms = fs::metadata(path).expect("meta").permissions();
        perms.set_mode(0o755);
        fs::set_permissions(path, perms).expect("chmod");
    }

    /// Stand-in compiler: writes the `-o` target as a shell script exiting
    /// with `status`, then reports which binary it built.
    #[cfg(unix)]
    fn fake_compiler(path: &Path, status: i32) {
        executable(
            path,
            &format!(
                r#"#!/bin/sh
while [ $# -gt 0 ]; do
  if [ "$1" = -o ]; then
    shift
    out="$1"
    printf '#!/bin/sh\nexit {}\n' > "$out"
    chmod 755 "$out"
  fi
  shift
done
echo "built $(basename "$out")"
echo warned 1>&2
"#,
                status
            ),
        );
    }

    #[test]
    fn stress_all_rewrites_each_permutation_and_isolates_missing_sources() {
        let root = scratch("stress");
        let settings = settings_in(&root, 4);
        fs::create_dir_all(&settings.layout.recreated_dir).expect("recreated");
        for id in ["7", "9"] {
            fs::write(
                settings.layout.recreated_source(id),
                format!("int main() {{\n    int stress = {};\n    return 0;\n}}\n", id),
            )
            .expect("source");
        }

        let report = stress_all(&settings, &ids(&["7", "missing", "9"]), &mut NoopObserver)
            .expect("batch");
        assert_eq!(report.items.len(), 3);
        assert_eq!(report.succeeded(), 2);
        let failed: Vec<_> = report.failures().map(|(id, _)| id.to_string()).collect();
        assert_eq!(failed, vec!["missing".to_string()]);

        for id in ["7", "9"] {
            let out = fs::read_to_string(settings.layout.stress_source(id)).expect("output");
            assert!(out.contains("int stress = readStress();"));
            let original =
                fs::read_to_string(settings.layout.recreated_source(id)).expect("original");
            assert!(original.contains(&format!("int stress = {};", id)));
        }
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn evaluation_difference_is_relative_speedup() {
        let e = Evaluation {
            before: Some(2.0),
            after: Some(1.5),
        };
        assert_eq!(e.difference(), Some(25.0));
        let zero = Evaluation {
            before: Some(0.0),
            after: Some(1.0),
        };
        assert_eq!(zero.difference(), None);
        let missing = Evaluation {
            before: None,
            after: Some(1.0),
        };
        assert_eq!(missing.difference(), None);
    }

    #[test]
    fn comparison_difference_is_absolute() {
        let c = Comparison {
            gcc: Some(1.0),
            clang: Some(1.25),
        };
        assert_eq!(c.difference(), Some(0.25));
        let partial = Comparison {
            gcc: None,
            clang: Some(1.0),
        };
        assert_eq!(partial.difference(), None);
    }

    #[test]
    fn comparison_sources_sort_numerically() {
        let root = scratch("compare");
        for name in [
            "recreated_10.verified.c0.c",
            "recreated_2.verified.c0.c",
            "recreated_1.verified.c0.c",
            "notes.txt",
            "odd.c",
        ] {
            fs::write(root.join(name), "").expect("file");
        }
        let files = comparison_sources(&root).expect("list");
        assert_eq!(
            files,
            ids(&[
                "recreated_1.verified.c0.c",
                "recreated_2.verified.c0.c",
                "recreated_10.verified.c0.c",
                "odd.c",
            ])
        );
        assert_eq!(comparison_label("recreated_2.verified.c0.c"), "recreated_2");
        let _ = fs::remove_dir_all(root);
    }

    #[cfg(unix)]
    #[test]
    fn time_all_records_absent_binaries_and_time_files() {
        let root = scratch("time");
        let settings = settings_in(&root, 2);
        let bin_dir = root.join("bin");
        fs::create_dir_all(&bin_dir).expect("bin dir");
        let bin = binary_path(&bin_dir, "1");
        executable(&bin, "#!/bin/sh\nexit 0\n");

        let job = TimeAll {
            bin_dir: &bin_dir,
            runs: 2,
            stress: 8,
            write_time_files: true,
        };
        let report =
            time_all(&settings, &ids(&["1", "2"]), &job, &mut NoopObserver).expect("batch");
        assert_eq!(report.succeeded(), 2);
        assert!(report.items[0].value().expect("1").is_some());
        assert_eq!(report.items[1].value(), Some(&None));
        assert_eq!(
            fs::read_to_string(settings.layout.time_file("2")).expect("time file"),
            "None"
        );
        let _ = fs::remove_dir_all(root);
    }

    #[cfg(unix)]
    #[test]
    fn evaluate_all_parses_script_timings() {
        let root = scratch("evaluate");
        let settings = settings_in(&root, 2);
        let script = root.join("time.sh");
        executable(
            &script,
            "#!/bin/sh\nif [ \"$1\" = before ]; then echo 'real 0m2.000s' 1>&2; else echo 'real 0m1.000s' 1>&2; fi\n",
        );

        let report = evaluate_all(
            &settings,
            &ids(&["3"]),
            &script.display().to_string(),
            &mut NoopObserver,
        )
        .expect("batch");
        let row = report.items[0].value().expect("row");
        assert_eq!(row.before, Some(2.0));
        assert_eq!(row.after, Some(1.0));
        assert_eq!(row.difference(), Some(50.0));
        let _ = fs::remove_dir_all(root);
    }

    #[cfg(unix)]
    #[test]
    fn transpile_all_runs_cc0_on_each_stress_source() {
        let root = scratch("transpile");
        let mut settings = settings_in(&root, 2);
        let cc0 = root.join("fake-cc0");
        executable(
            &cc0,
            "#!/bin/sh\n[ \"$2\" = -L ] && [ \"$6\" = --save-files ] || exit 2\ncp \"$1\" \"$1.c\"\n",
        );
        settings.transpiler.program = cc0.display().to_string();
        fs::create_dir_all(&settings.layout.stress_dir).expect("stress dir");
        for id in ["1", "2"] {
            fs::write(settings.layout.stress_source(id), format!("// {}\n", id)).expect("source");
        }

        let report = transpile_all(&settings, &ids(&["1", "2", "3"]), &mut NoopObserver)
            .expect("batch");
        assert_eq!(report.succeeded(), 3);
        for id in ["1", "2"] {
            assert!(report.items.iter().any(|i| i.id == id
                && i.value().is_some_and(|out| out.success())));
            assert_eq!(
                fs::read_to_string(settings.layout.transpiled_c(id)).expect("transpiled"),
                format!("// {}\n", id)
            );
        }
        let missing = report.items[2].value().expect("non-zero exit is not a failure");
        assert!(!missing.success());
        assert!(!settings.layout.transpiled_c("3").exists());
        let _ = fs::remove_dir_all(root);
    }

    #[cfg(unix)]
    #[test]
    fn compile_all_writes_binaries_and_compiler_logs_per_id() {
        let root = scratch("compile_all");
        let settings = settings_in(&root, 2);
        let compiler = root.join("fake-cc");
        fake_compiler(&compiler, 0);
        let prefix = vec![compiler.display().to_string()];
        let out_dir = root.join("o3");
        let job = CompileAll {
            cc0: Path::new("/cc0"),
            out_dir: &out_dir,
            prefix: &prefix,
            platform: Platform::Linux,
        };

        let report =
            compile_all(&settings, &ids(&["4", "5"]), &job, &mut NoopObserver).expect("batch");
        assert_eq!(report.succeeded(), 2);
        for id in ["4", "5"] {
            let bin = binary_path(&out_dir, id);
            assert!(bin.is_file());
            assert_eq!(
                fs::read_to_string(suffixed(&bin, "_stdout.txt")).expect("stdout"),
                format!("built recreated_{}\n", id)
            );
            assert_eq!(
                fs::read_to_string(suffixed(&bin, "_stderr.txt")).expect("stderr"),
                "warned\n"
            );
        }
        let _ = fs::remove_dir_all(root);
    }

    #[cfg(unix)]
    #[test]
    fn verify_all_runs_script_on_unverified_sources_and_honours_timeout() {
        let root = scratch("verify");
        let mut settings = settings_in(&root, 2);
        fs::create_dir_all(&settings.layout.recreated_dir).expect("recreated");
        let script = root.join("run.sh");
        executable(
            &script,
            "#!/bin/sh\n[ \"$2\" = --save-files ] || exit 2\ntouch \"$1.checked\"\n",
        );

        let report = verify_all(
            &settings,
            &ids(&["1", "2"]),
            &script.display().to_string(),
            &mut NoopObserver,
        )
        .expect("batch");
        assert_eq!(report.succeeded(), 2);
        for id in ["1", "2"] {
            assert!(suffixed(&settings.layout.unverified_source(id), ".checked").exists());
        }

        let hung = root.join("hung.sh");
        executable(&hung, "#!/bin/sh\nexec sleep 5\n");
        settings.batch.timeout = Some(Duration::from_millis(100));
        let report = verify_all(
            &settings,
            &ids(&["1"]),
            &hung.display().to_string(),
            &mut NoopObserver,
        )
        .expect("batch");
        let error = report.items[0].error().expect("timed out");
        assert!(error.contains("timed out"), "{}", error);
        let _ = fs::remove_dir_all(root);
    }

    #[cfg(unix)]
    #[test]
    fn run_script_all_passes_each_id_and_ignores_exit_status() {
        let root = scratch("scripts");
        let settings = settings_in(&root, 3);
        let script = root.join("compile.sh");
        executable(
            &script,
            "#!/bin/sh\necho \"$1\" > \"$(dirname \"$0\")/ran_$1\"\nexit 3\n",
        );

        let report = run_script_all(
            &settings,
            &ids(&["1", "2", "3"]),
            &script.display().to_string(),
            &mut NoopObserver,
        )
        .expect("batch");
        assert_eq!(report.succeeded(), 3);
        for item in &report.items {
            assert_eq!(item.value().and_then(|out| out.status.code()), Some(3));
            assert_eq!(
                fs::read_to_string(root.join(format!("ran_{}", item.id))).expect("marker"),
                format!("{}\n", item.id)
            );
        }
        let _ = fs::remove_dir_all(root);
    }

    #[cfg(unix)]
    #[test]
    fn compare_all_leaves_a_side_empty_when_it_cannot_be_measured() {
        let root = scratch("compare_all");
        let settings = settings_in(&root, 1);
        let src_dir = root.join("src");
        fs::create_dir_all(&src_dir).expect("src");
        fs::write(src_dir.join("recreated_1.verified.c0.c"), "").expect("source");
        let work_dir = root.join("work");

        let good = root.join("cc-good");
        fake_compiler(&good, 0);
        let crashing = root.join("cc-crashing-binary");
        fake_compiler(&crashing, 3);
        let broken = root.join("cc-broken");
        executable(&broken, "#!/bin/sh\necho broken 1>&2\nexit 1\n");

        let good = vec![good.display().to_string()];
        let crashing = vec![crashing.display().to_string()];
        let broken = vec![broken.display().to_string()];
        let files = comparison_sources(&src_dir).expect("list");

        let job = CompareAll {
            src_dir: &src_dir,
            work_dir: &work_dir,
            cc0: Path::new("/cc0"),
            runs: 2,
            platform: Platform::Linux,
            gcc: &good,
            clang: &broken,
        };
        let report = compare_all(&settings, &files, &job, &mut NoopObserver).expect("batch");
        let row = report.items[0].value().expect("row");
        assert!(row.gcc.is_some());
        assert_eq!(row.clang, None);
        assert_eq!(row.difference(), None);
        assert!(work_dir.join("recreated_1_gcc").is_file());
        assert_eq!(
            fs::read_to_string(work_dir.join("recreated_1_clang_stderr.txt")).expect("stderr"),
            "broken\n"
        );

        let job = CompareAll {
            gcc: &crashing,
            clang: &good,
            ..job
        };
        let report = compare_all(&settings, &files, &job, &mut NoopObserver).expect("batch");
        let row = report.items[0].value().expect("row");
        assert_eq!(row.gcc, None);
        assert!(row.clang.is_some());
        let _ = fs::remove_dir_all(root);
    }
}
