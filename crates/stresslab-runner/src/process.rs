//! External process invocation with optional output capture and wall-clock
//! timeout.

use anyhow::{Context, Result};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputMode {
    Capture,
    Discard,
    Inherit,
}

#[derive(Clone, Debug)]
pub struct Invocation {
    program: String,
    args: Vec<String>,
    current_dir: Option<PathBuf>,
    output: OutputMode,
    timeout: Option<Duration>,
}

#[derive(Debug)]
pub struct ProcessOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub timed_out: bool,
    pub elapsed: Duration,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.status.success()
    }

    pub fn status_label(&self) -> String {
        self.status
            .code()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".to_string())
    }
}

impl Invocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            current_dir: None,
            output: OutputMode::Capture,
            timeout: None,
        }
    }

    /// Splits `command` into program and leading args. Returns `None` for an
    /// empty slice.
    pub fn from_argv(command: &[String]) -> Option<Self> {
        let (program, rest) = command.split_first()?;
        Some(Self::new(program.clone()).args(rest.iter().cloned()))
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: &Path) -> Self {
        self.current_dir = Some(dir.to_path_buf());
        self
    }

    pub fn output(mut self, mode: OutputMode) -> Self {
        self.output = mode;
        self
    }

    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn get_args(&self) -> &[String] {
        &self.args
    }

    pub fn argv(&self) -> Vec<String> {
        let mut out = Vec::with_capacity(self.args.len() + 1);
        out.push(self.program.clone());
        out.extend(self.args.iter().cloned());
        out
    }

    /// Shell-quoted rendering, suitable for echoing to a console.
    pub fn display(&self) -> String {
        shell_join(&self.argv())
    }

    /// Spawns and waits for the process. A spawn failure (for example a
    /// missing binary) is returned as the underlying `io::Error` so callers
    /// can inspect its kind.
    pub fn spawn(&self) -> std::io::Result<Child> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        if let Some(dir) = &self.current_dir {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::null());
        match self.output {
            OutputMode::Capture => {
                cmd.stdout(Stdio::piped());
                cmd.stderr(Stdio::piped());
            }
            OutputMode::Discard => {
                cmd.stdout(Stdio::null());
                cmd.stderr(Stdio::null());
            }
            OutputMode::Inherit => {
                cmd.stdout(Stdio::inherit());
                cmd.stderr(Stdio::inherit());
            }
        }
        debug!(command = %self.display(), "spawn");
        cmd.spawn()
    }

    pub fn run(&self) -> Result<ProcessOutput> {
        let start = Instant::now();
        let child = self
            .spawn()
            .with_context(|| format!("spawn {}", self.program))?;
        self.wait(child, start)
    }

    /// Waits on an already spawned child, draining its pipes on background
    /// threads.
    pub fn wait(&self, mut child: Child, start: Instant) -> Result<ProcessOutput> {
        let stdout_reader = child.stdout.take().map(drain_pipe);
        let stderr_reader = child.stderr.take().map(drain_pipe);

        let (status, timed_out) = match self.timeout {
            Some(limit) => wait_with_deadline(&mut child, limit)?,
            None => (child.wait().context("wait child")?, false),
        };
        let elapsed = start.elapsed();

        // Grandchildren of a killed child may still hold the pipes open, so
        // readers are left detached after a timeout.
        let (stdout, stderr) = if timed_out {
            (Vec::new(), Vec::new())
        } else {
            (join_pipe(stdout_reader), join_pipe(stderr_reader))
        };
        Ok(ProcessOutput {
            status,
            stdout,
            stderr,
            timed_out,
            elapsed,
        })
    }
}

fn wait_with_deadline(child: &mut Child, limit: Duration) -> Result<(ExitStatus, bool)> {
    let started = Instant::now();
    let deadline = started.checked_add(limit);
    loop {
        if let Some(status) = child.try_wait().context("try_wait child")? {
            return Ok((status, false));
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            let _ = child.kill();
            let status = child.wait().context("wait child after kill")?;
            return Ok((status, true));
        }
        thread::sleep(poll_interval(started.elapsed()));
    }
}

const MIN_POLL: Duration = Duration::from_micros(50);
const MAX_POLL: Duration = Duration::from_millis(5);

/// Exit is noticed at most one interval late, so the interval tracks 1% of
/// the time waited so far to keep that lag out of short timings.
fn poll_interval(waited: Duration) -> Duration {
    (waited / 100).clamp(MIN_POLL, MAX_POLL)
}

fn drain_pipe<R: Read + Send + 'static>(mut pipe: R) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        buf
    })
}

fn join_pipe(handle: Option<thread::JoinHandle<Vec<u8>>>) -> Vec<u8> {
    handle
        .and_then(|h| h.join().ok())
        .unwrap_or_default()
}

/// Echoes a command line to stdout as `$ <command>`.
pub fn print_cmd(inv: &Invocation) {
    println!("$ {}", inv.display());
}

pub fn shell_join(parts: &[String]) -> String {
    parts
        .iter()
        .map(|p| shell_quote(p))
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn shell_quote(s: &str) -> String {
    if s.is_empty() {
        "''".to_string()
    } else if s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_./:=@%+,".contains(c))
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\"'\"'"))
    }
}
