use anyhow::Result;
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::{json, Value};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use stresslab_runner::pipeline::{self, CompareAll, CompileAll, TimeAll};
use stresslab_runner::process::print_cmd;
use stresslab_runner::report::{
    seconds_cell, COMPARISON_HEADER, EVALUATION_HEADER, TIMING_HEADER,
};
use stresslab_runner::toolchain::cc0main_bitcode_invocation;
use stresslab_runner::{
    modified_sibling_path, BatchObserver, BatchReport, CompileRequest, ConfigLayer, CsvReport,
    ItemOutcome, ItemResult, Manifest, OutputMode, Platform, Settings, StressInjection,
};
use tracing::warn;
use tracing_subscriber::EnvFilter;

const DEFAULT_SYSTEM_CC0: &str = "/usr/share/cc0";

#[derive(Parser)]
#[command(
    name = "stresslab",
    version = "0.3.0",
    about = "Batch stress-injection, compile, and timing runs over cc0 permutations"
)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct GlobalArgs {
    /// YAML file with default settings
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Newline-delimited permutation ids
    #[arg(long, global = true)]
    manifest: Option<PathBuf>,
    #[arg(long, global = true)]
    workers: Option<usize>,
    #[arg(long, value_enum, global = true)]
    order: Option<OrderArg>,
    /// Extra attempts for a failed item
    #[arg(long, global = true)]
    retries: Option<u32>,
    /// Kill any single external process after this many seconds
    #[arg(long, global = true)]
    timeout_secs: Option<f64>,
    #[arg(long, global = true)]
    recreated_dir: Option<PathBuf>,
    #[arg(long, global = true)]
    stress_dir: Option<PathBuf>,
    #[arg(long, global = true)]
    resources_dir: Option<String>,
    /// Print a JSON summary when the command finishes
    #[arg(long, global = true)]
    json: bool,
    #[arg(short, long, global = true)]
    verbose: bool,
}

impl GlobalArgs {
    fn layer(&self) -> ConfigLayer {
        ConfigLayer {
            manifest: self.manifest.clone(),
            workers: self.workers,
            order: self.order.map(Into::into),
            retries: self.retries,
            timeout_seconds: self.timeout_secs,
            recreated_dir: self.recreated_dir.clone(),
            stress_dir: self.stress_dir.clone(),
            resources_dir: self.resources_dir.clone(),
            ..ConfigLayer::default()
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum OrderArg {
    #[value(name = "manifest")]
    Manifest,
    #[value(name = "completion")]
    Completion,
}

impl From<OrderArg> for stresslab_runner::ReportOrder {
    fn from(value: OrderArg) -> Self {
        match value {
            OrderArg::Manifest => stresslab_runner::ReportOrder::Manifest,
            OrderArg::Completion => stresslab_runner::ReportOrder::Completion,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum AssignmentArg {
    #[value(name = "typed")]
    Typed,
    #[value(name = "bare")]
    Bare,
}

impl From<AssignmentArg> for stresslab_runner::AssignmentMatch {
    fn from(value: AssignmentArg) -> Self {
        match value {
            AssignmentArg::Typed => stresslab_runner::AssignmentMatch::Typed,
            AssignmentArg::Bare => stresslab_runner::AssignmentMatch::Bare,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum DuplicatesArg {
    #[value(name = "keep")]
    Keep,
    #[value(name = "strip")]
    Strip,
}

impl From<DuplicatesArg> for stresslab_runner::DuplicateAssignments {
    fn from(value: DuplicatesArg) -> Self {
        match value {
            DuplicatesArg::Keep => stresslab_runner::DuplicateAssignments::Keep,
            DuplicatesArg::Strip => stresslab_runner::DuplicateAssignments::Strip,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Inject the --stress reader into every recreated permutation
    Stress {
        #[arg(long, value_enum)]
        assignment: Option<AssignmentArg>,
        #[arg(long, value_enum)]
        duplicates: Option<DuplicatesArg>,
    },
    /// Inject the --stress reader into one file, writing `<name>.modified.c0`
    Instrument {
        file: PathBuf,
        #[arg(long)]
        out: Option<PathBuf>,
        #[arg(long, value_enum)]
        assignment: Option<AssignmentArg>,
        #[arg(long, value_enum)]
        duplicates: Option<DuplicatesArg>,
    },
    /// Transpile every stressed permutation to C with cc0
    Transpile {
        #[arg(long)]
        transpiler: Option<String>,
    },
    /// Compile one C file against a cc0 installation
    Compile {
        #[arg(long)]
        cc0: PathBuf,
        #[arg(long)]
        src: PathBuf,
        #[arg(long)]
        out: PathBuf,
        /// Compiler and flags, e.g. `-- clang -O3`
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        cmd: Vec<String>,
    },
    /// Compile every transpiled permutation into DIR
    CompileAll {
        #[arg(long)]
        cc0: Option<PathBuf>,
        #[arg(long)]
        dir: PathBuf,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        cmd: Vec<String>,
    },
    /// Report the mean seconds to run each permutation
    Time {
        /// Directory of binaries
        #[arg(long)]
        dir: PathBuf,
        #[arg(long, default_value_t = 30)]
        runs: u32,
        #[arg(long, default_value_t = 128)]
        stress: u64,
        #[arg(long)]
        csv: Option<PathBuf>,
        /// Also write `<stress_dir>/recreated_<id>.verified.time.txt`
        #[arg(long)]
        time_files: bool,
    },
    /// Run the verification script on every unverified permutation
    Verify {
        #[arg(long, default_value = "./run.sh")]
        script: String,
        /// Skip this many leading manifest entries
        #[arg(long, default_value_t = 0)]
        skip: usize,
    },
    /// Compile with a script, then time before/after builds with another
    Evaluate {
        #[arg(long)]
        cc0: Option<PathBuf>,
        #[arg(long, default_value = "./compile.sh")]
        compile_script: String,
        #[arg(long, default_value = "./time.sh")]
        time_script: String,
        #[arg(long, default_value = "evaluation.csv")]
        csv: PathBuf,
        /// Skip precompiling cc0main.bc
        #[arg(long)]
        no_bitcode: bool,
    },
    /// Time every C file in a directory under gcc and clang
    Compare {
        #[arg(long, default_value = "recreated")]
        src_dir: PathBuf,
        #[arg(long, default_value = "compare")]
        work_dir: PathBuf,
        #[arg(long)]
        cc0: Option<PathBuf>,
        #[arg(long, default_value_t = 30)]
        runs: u32,
        #[arg(long, default_value = "compilation_results.csv")]
        csv: PathBuf,
        #[arg(long, default_value = "compilation_errors.txt")]
        errors: PathBuf,
    },
}

impl Commands {
    fn name(&self) -> &'static str {
        match self {
            Commands::Stress { .. } => "stress",
            Commands::Instrument { .. } => "instrument",
            Commands::Transpile { .. } => "transpile",
            Commands::Compile { .. } => "compile",
            Commands::CompileAll { .. } => "compile-all",
            Commands::Time { .. } => "time",
            Commands::Verify { .. } => "verify",
            Commands::Evaluate { .. } => "evaluate",
            Commands::Compare { .. } => "compare",
        }
    }

    /// Pool size each batch used before it was configurable.
    fn default_workers(&self) -> usize {
        match self {
            Commands::Stress { .. } | Commands::Transpile { .. } | Commands::CompileAll { .. } => 6,
            Commands::Verify { .. } => 4,
            Commands::Evaluate { .. } => 50,
            _ => 1,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.global.verbose);
    let json_mode = cli.global.json;
    match run_command(cli) {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error(
                    "command_failed",
                    format!("{:#}", err),
                    json!({}),
                ));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose {
        "stresslab=debug,stresslab_runner=debug"
    } else {
        "stresslab=info,stresslab_runner=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn settings_for(global: &GlobalArgs, command: ConfigLayer, default_workers: usize) -> Result<Settings> {
    let file = match &global.config {
        Some(path) => ConfigLayer::load(path)?,
        None => ConfigLayer::default(),
    };
    let layer = command.over(global.layer()).over(file);
    Ok(Settings::resolve(layer, default_workers)?)
}

fn run_command(cli: Cli) -> Result<Option<Value>> {
    let global = cli.global;
    let command = cli.command;
    let name = command.name();
    let default_workers = command.default_workers();
    let started = Utc::now();

    match command {
        Commands::Stress {
            assignment,
            duplicates,
        } => {
            let settings = settings_for(
                &global,
                ConfigLayer {
                    assignment: assignment.map(Into::into),
                    duplicates: duplicates.map(Into::into),
                    ..ConfigLayer::default()
                },
                default_workers,
            )?;
            let manifest = Manifest::load(&settings.manifest)?;
            let mut console = Console::new(|id, _| Some(format!("{} succeeded", id)));
            let report = pipeline::stress_all(&settings, manifest.ids(), &mut console)?;
            return Ok(summary(global.json, name, &report, started));
        }
        Commands::Instrument {
            file,
            out,
            assignment,
            duplicates,
        } => {
            let settings = settings_for(
                &global,
                ConfigLayer {
                    assignment: assignment.map(Into::into),
                    duplicates: duplicates.map(Into::into),
                    ..ConfigLayer::default()
                },
                default_workers,
            )?;
            let out = match out {
                Some(p) => p,
                None => modified_sibling_path(&file)?,
            };
            let injection =
                StressInjection::new("stress", settings.assignment, settings.duplicates)?;
            let report = injection.instrument_file(&file, &out)?;
            if global.json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": name,
                    "input": file.display().to_string(),
                    "output": out.display().to_string(),
                    "directives_added": report.directives_added,
                    "helper_inserted": report.helper_inserted,
                    "assignment_replaced": report.assignment_replaced,
                    "duplicates_removed": report.duplicates_removed,
                })));
            }
            println!("wrote: {}", out.display());
        }
        Commands::Transpile { transpiler } => {
            let settings = settings_for(
                &global,
                ConfigLayer {
                    transpiler,
                    ..ConfigLayer::default()
                },
                default_workers,
            )?;
            let manifest = Manifest::load(&settings.manifest)?;
            let mut console = Console::new(|_, _| None);
            let report = pipeline::transpile_all(&settings, manifest.ids(), &mut console)?;
            return Ok(summary(global.json, name, &report, started));
        }
        Commands::Compile { cc0, src, out, cmd } => {
            let settings = settings_for(&global, ConfigLayer::default(), default_workers)?;
            let platform = Platform::host()?;
            let output = CompileRequest {
                src: &src,
                out: &out,
                cc0: &cc0,
                prefix: &cmd,
                platform,
                resources_dir: &settings.transpiler.resources_dir,
            }
            .run(settings.batch.timeout)?;
            if global.json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": name,
                    "status": output.status_label(),
                    "out": out.display().to_string(),
                })));
            }
        }
        Commands::CompileAll { cc0, dir, cmd } => {
            let settings = settings_for(
                &global,
                ConfigLayer {
                    cc0,
                    ..ConfigLayer::default()
                },
                default_workers,
            )?;
            let platform = Platform::host()?;
            let cc0 = settings.require_cc0()?.to_path_buf();
            if cmd.is_empty() {
                return Err(stresslab_runner::RunnerError::MissingCompiler.into());
            }
            let manifest = Manifest::load(&settings.manifest)?;
            let job = CompileAll {
                cc0: &cc0,
                out_dir: &dir,
                prefix: &cmd,
                platform,
            };
            let mut console = Console::new(|id, _| Some(format!("finished permutation {}", id)));
            let report = pipeline::compile_all(&settings, manifest.ids(), &job, &mut console)?;
            return Ok(summary(global.json, name, &report, started));
        }
        Commands::Time {
            dir,
            runs,
            stress,
            csv,
            time_files,
        } => {
            let settings = settings_for(&global, ConfigLayer::default(), default_workers)?;
            let manifest = Manifest::load(&settings.manifest)?;
            let mut writer = match &csv {
                Some(path) => Some(CsvReport::create(path, &TIMING_HEADER)?),
                None => None,
            };
            let mut console = Console::new(|_, _| None).with_sink(
                |item: &ItemResult<Option<f64>>| match writer.as_mut() {
                    Some(w) => w.write_row(&timing_row(item)),
                    None => Ok(()),
                },
            );
            let job = TimeAll {
                bin_dir: &dir,
                runs,
                stress,
                write_time_files: time_files,
            };
            let report = pipeline::time_all(&settings, manifest.ids(), &job, &mut console)?;
            return Ok(summary(global.json, name, &report, started));
        }
        Commands::Verify { script, skip } => {
            let settings = settings_for(&global, ConfigLayer::default(), default_workers)?;
            let manifest = Manifest::load(&settings.manifest)?.skip(skip);
            let mut console = Console::new(|id, secs: &f64| {
                Some(format!("Task for {} completed in {:.2} seconds", id, secs))
            });
            let report = pipeline::verify_all(&settings, manifest.ids(), &script, &mut console)?;
            return Ok(summary(global.json, name, &report, started));
        }
        Commands::Evaluate {
            cc0,
            compile_script,
            time_script,
            csv,
            no_bitcode,
        } => {
            let settings = settings_for(
                &global,
                ConfigLayer {
                    cc0,
                    ..ConfigLayer::default()
                },
                default_workers,
            )?;
            if !no_bitcode {
                let cc0 = settings
                    .cc0
                    .clone()
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_SYSTEM_CC0));
                let inv = cc0main_bitcode_invocation(&cc0, Path::new("cc0main.bc"))
                    .output(OutputMode::Inherit)
                    .timeout(settings.batch.timeout);
                print_cmd(&inv);
                let out = inv.run()?;
                if !out.success() {
                    warn!(status = %out.status_label(), "cc0main.bc precompile failed");
                }
            }
            let manifest = Manifest::load(&settings.manifest)?;

            let mut console = Console::new(|id, _| Some(format!("Compiled {}.", id)));
            pipeline::run_script_all(&settings, manifest.ids(), &compile_script, &mut console)?;
            println!("Finished compiling.");

            let mut writer = CsvReport::create(&csv, &EVALUATION_HEADER)?;
            let mut console = Console::new(|_, _| None).with_sink(
                |item: &ItemResult<pipeline::Evaluation>| writer.write_row(&evaluation_row(item)),
            );
            let report =
                pipeline::evaluate_all(&settings, manifest.ids(), &time_script, &mut console)?;
            return Ok(summary(global.json, name, &report, started));
        }
        Commands::Compare {
            src_dir,
            work_dir,
            cc0,
            runs,
            csv,
            errors,
        } => {
            let settings = settings_for(
                &global,
                ConfigLayer {
                    cc0,
                    ..ConfigLayer::default()
                },
                default_workers,
            )?;
            let platform = Platform::host()?;
            let cc0 = settings
                .cc0
                .clone()
                .unwrap_or_else(|| PathBuf::from(DEFAULT_SYSTEM_CC0));
            let files = pipeline::comparison_sources(&src_dir)?;
            let mut writer = CsvReport::create(&csv, &COMPARISON_HEADER)?;
            let mut error_list = BufWriter::new(File::create(&errors)?);
            let mut console = Console::new(|_, _| None).with_sink(
                |item: &ItemResult<pipeline::Comparison>| match comparison_row(item) {
                    Some(row) => writer.write_row(&row),
                    None => {
                        writeln!(error_list, "{}", item.id)?;
                        error_list.flush()?;
                        Ok(())
                    }
                },
            );
            let gcc = command_line(&pipeline::GCC_COMMAND);
            let clang = command_line(&pipeline::CLANG_COMMAND);
            let job = CompareAll {
                src_dir: &src_dir,
                work_dir: &work_dir,
                cc0: &cc0,
                runs,
                platform,
                gcc: &gcc,
                clang: &clang,
            };
            let report = pipeline::compare_all(&settings, &files, &job, &mut console)?;
            return Ok(summary(global.json, name, &report, started));
        }
    }
    Ok(None)
}

/// A failed item still gets a row; its measurement cell is empty.
fn timing_row(item: &ItemResult<Option<f64>>) -> [Option<String>; 2] {
    [
        Some(item.id.clone()),
        seconds_cell(item.value().copied().flatten()),
    ]
}

fn evaluation_row(item: &ItemResult<pipeline::Evaluation>) -> [Option<String>; 4] {
    let row = item.value().copied();
    [
        Some(item.id.clone()),
        seconds_cell(row.and_then(|r| r.before)),
        seconds_cell(row.and_then(|r| r.after)),
        seconds_cell(row.and_then(|r| r.difference())),
    ]
}

/// `None` unless both sides were measured; such files go to the error list.
fn comparison_row(item: &ItemResult<pipeline::Comparison>) -> Option<[Option<String>; 4]> {
    let c = item.value()?;
    let (gcc, clang, diff) = (c.gcc?, c.clang?, c.difference()?);
    Some([
        Some(pipeline::comparison_label(&item.id).to_string()),
        Some(gcc.to_string()),
        Some(clang.to_string()),
        Some(diff.to_string()),
    ])
}

fn command_line(raw: &[&str]) -> Vec<String> {
    raw.iter().map(|s| s.to_string()).collect()
}

type SuccessLine<'a, T> = Box<dyn Fn(&str, &T) -> Option<String> + 'a>;
type ReportSink<'a, T> = Box<dyn FnMut(&ItemResult<T>) -> Result<()> + 'a>;

/// Prints one console line per finished item and forwards report-ordered
/// items to an optional sink such as a CSV writer.
struct Console<'a, T> {
    success: SuccessLine<'a, T>,
    sink: Option<ReportSink<'a, T>>,
}

impl<'a, T> Console<'a, T> {
    fn new(success: impl Fn(&str, &T) -> Option<String> + 'a) -> Self {
        Self {
            success: Box::new(success),
            sink: None,
        }
    }

    fn with_sink(mut self, sink: impl FnMut(&ItemResult<T>) -> Result<()> + 'a) -> Self {
        self.sink = Some(Box::new(sink));
        self
    }
}

impl<T> BatchObserver<T> for Console<'_, T> {
    fn completed(&mut self, item: &ItemResult<T>) {
        match &item.outcome {
            ItemOutcome::Success(value) => {
                if let Some(line) = (self.success)(&item.id, value) {
                    println!("{}", line);
                }
            }
            ItemOutcome::Failure(message) => println!("{} failed: {}", item.id, message),
        }
    }

    fn report(&mut self, item: &ItemResult<T>) -> Result<()> {
        match self.sink.as_mut() {
            Some(sink) => sink(item),
            None => Ok(()),
        }
    }
}

fn summary<T>(
    json_mode: bool,
    command: &str,
    report: &BatchReport<T>,
    started: DateTime<Utc>,
) -> Option<Value> {
    if !json_mode {
        return None;
    }
    let failed: Vec<Value> = report
        .failures()
        .map(|(id, error)| json!({ "id": id, "error": error }))
        .collect();
    Some(json!({
        "ok": true,
        "command": command,
        "total": report.items.len(),
        "succeeded": report.succeeded(),
        "failed": failed,
        "started_at": started.to_rfc3339(),
        "finished_at": Utc::now().to_rfc3339(),
    }))
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\"}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details,
        }
    })
}
