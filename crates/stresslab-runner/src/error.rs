use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("unsupported platform '{0}': expected Darwin or Linux")]
    UnsupportedPlatform(String),

    #[error("cannot read manifest {}: {source}", path.display())]
    ManifestUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("missing compiler command: pass the compiler after `--`")]
    MissingCompiler,

    #[error("timed out after {after:?}: {command}")]
    TimedOut { command: String, after: Duration },

    #[error("exited with status {code}: {command}")]
    NonZeroExit { command: String, code: String },

    #[error("invalid config: {0}")]
    InvalidConfig(String),
}
