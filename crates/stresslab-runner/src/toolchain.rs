//! Argument construction and invocation for the cc0 transpiler and host C
//! compilers.

use crate::error::RunnerError;
use crate::platform::Platform;
use crate::process::{print_cmd, Invocation, OutputMode, ProcessOutput};
use anyhow::{Context, Result};
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

pub const DEFAULT_RESOURCES_DIR: &str = "src/main/resources/";

pub const STANDARD_CFLAGS: [&str; 5] = ["-std=c99", "-g", "-fwrapv", "-Wall", "-Wextra"];

#[derive(Debug, Clone)]
pub struct Transpiler {
    pub program: String,
    pub resources_dir: String,
}

impl Default for Transpiler {
    fn default() -> Self {
        Self {
            program: "cc0".to_string(),
            resources_dir: DEFAULT_RESOURCES_DIR.to_string(),
        }
    }
}

impl Transpiler {
    /// The library search path is passed twice; cc0 accepts the repeat.
    pub fn invocation(&self, source: &Path) -> Invocation {
        let res = self.resources_dir.as_str();
        Invocation::new(self.program.clone())
            .arg(source.display().to_string())
            .args(["-L", res, "-L", res])
            .arg("--save-files")
    }

    /// Runs the transpiler with inherited output. A non-zero exit is logged
    /// and returned, not raised; a spawn failure or timeout is an error.
    pub fn transpile(&self, source: &Path, timeout: Option<Duration>) -> Result<ProcessOutput> {
        let inv = self
            .invocation(source)
            .output(OutputMode::Inherit)
            .timeout(timeout);
        print_cmd(&inv);
        let out = inv.run()?;
        check_timeout(&inv, &out, timeout)?;
        if !out.status.success() {
            warn!(source = %source.display(), status = %out.status_label(), "transpiler exited non-zero");
        }
        Ok(out)
    }
}

/// One host-compiler invocation against a cc0 installation.
#[derive(Debug, Clone)]
pub struct CompileRequest<'a> {
    pub src: &'a Path,
    pub out: &'a Path,
    pub cc0: &'a Path,
    /// Compiler and its extra flags, e.g. `["clang", "-O3"]`.
    pub prefix: &'a [String],
    pub platform: Platform,
    pub resources_dir: &'a str,
}

impl CompileRequest<'_> {
    pub fn invocation(&self) -> Result<Invocation, RunnerError> {
        let inv = Invocation::from_argv(self.prefix).ok_or(RunnerError::MissingCompiler)?;
        let cc0 = self.cc0.display().to_string();
        let ext = self.platform.lib_ext();
        let res = self.resources_dir;
        Ok(inv
            .args(STANDARD_CFLAGS)
            .arg("-o")
            .arg(self.out.display().to_string())
            .arg(format!("-I{}/include", cc0))
            .arg(format!("-I{}/runtime", cc0))
            .arg(self.src.display().to_string())
            .arg(format!("{}/lib/cc0main.c", cc0))
            .args(["-Wl,-rpath".to_string(), format!("{}/lib", cc0)])
            .args(["-Wl,-rpath", res])
            .args(["-Wl,-rpath", res])
            .arg(format!("{}/lib/libconio{}", cc0, ext))
            .arg(format!("{}/lib/libargs{}", cc0, ext))
            .arg(format!("{}/lib/libstring{}", cc0, ext))
            .arg(format!("-L{}/runtime", cc0))
            .args(["-Wl,-rpath".to_string(), format!("{}/runtime", cc0)])
            .arg(format!("{}/runtime/libc0rt{}", cc0, ext)))
    }

    /// Compiles and persists the compiler's stdout and stderr beside the
    /// output binary. Does not fail on a non-zero compiler exit.
    pub fn run(&self, timeout: Option<Duration>) -> Result<ProcessOutput> {
        let inv = self.invocation()?.timeout(timeout);
        print_cmd(&inv);
        let out = inv.run()?;
        let stdout_path = suffixed(self.out, "_stdout.txt");
        let stderr_path = suffixed(self.out, "_stderr.txt");
        fs::write(&stdout_path, &out.stdout)
            .with_context(|| format!("write {}", stdout_path.display()))?;
        fs::write(&stderr_path, &out.stderr)
            .with_context(|| format!("write {}", stderr_path.display()))?;
        check_timeout(&inv, &out, timeout)?;
        if !out.status.success() {
            warn!(src = %self.src.display(), status = %out.status_label(), "compiler exited non-zero");
        }
        Ok(out)
    }
}

/// Precompiles the cc0 main shim to LLVM bitcode for profiling builds.
pub fn cc0main_bitcode_invocation(cc0: &Path, out: &Path) -> Invocation {
    let cc0 = cc0.display().to_string();
    Invocation::new("clang")
        .args(["-fpic", "-O3", "-fbracket-depth=1024"])
        .args(STANDARD_CFLAGS)
        .args(["-pg", "-emit-llvm", "-c"])
        .args(["-I".to_string(), format!("{}/include", cc0)])
        .args(["-I".to_string(), format!("{}/runtime", cc0)])
        .arg("-o")
        .arg(out.display().to_string())
        .arg(format!("{}/lib/cc0main.c", cc0))
}

/// `path` with `suffix` appended to its final component.
pub fn suffixed(path: &Path, suffix: &str) -> PathBuf {
    let mut s: OsString = path.as_os_str().to_owned();
    s.push(suffix);
    PathBuf::from(s)
}

pub(crate) fn check_timeout(
    inv: &Invocation,
    out: &ProcessOutput,
    timeout: Option<Duration>,
) -> Result<(), RunnerError> {
    match timeout {
        Some(after) if out.timed_out => Err(RunnerError::TimedOut {
            command: inv.display(),
            after,
        }),
        _ => Ok(()),
    }
}
