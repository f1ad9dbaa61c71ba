//! Batch tooling for cc0 permutation experiments: stress injection,
//! transpiling, compiling, and timing of generated C0 programs, one
//! permutation id at a time on a bounded worker pool.

pub mod batch;
pub mod config;
pub mod error;
pub mod instrument;
pub mod layout;
pub mod manifest;
pub mod pipeline;
pub mod platform;
pub mod process;
pub mod report;
pub mod timing;
pub mod toolchain;

pub use batch::{
    run_batch, BatchObserver, BatchOptions, BatchReport, ItemContext, ItemOutcome, ItemResult,
    NoopObserver, ReportOrder,
};
pub use config::{ConfigLayer, Settings};
pub use error::RunnerError;
pub use instrument::{
    modified_sibling_path, AssignmentMatch, DuplicateAssignments, InstrumentReport,
    StressInjection,
};
pub use layout::{binary_path, Layout};
pub use manifest::Manifest;
pub use platform::Platform;
pub use process::{Invocation, OutputMode, ProcessOutput};
pub use report::CsvReport;
pub use timing::TimedRun;
pub use toolchain::{CompileRequest, Transpiler};
