use crate::error::RunnerError;

/// Host OS family, which decides the shared-library extension used in link
/// commands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Platform {
    Darwin,
    Linux,
}

impl Platform {
    /// Parses a `uname`-style system name. Anything other than `Darwin` or
    /// `Linux` is rejected.
    pub fn from_system_name(name: &str) -> Result<Self, RunnerError> {
        match name {
            "Darwin" => Ok(Platform::Darwin),
            "Linux" => Ok(Platform::Linux),
            other => Err(RunnerError::UnsupportedPlatform(other.to_string())),
        }
    }

    pub fn host() -> Result<Self, RunnerError> {
        match std::env::consts::OS {
            "macos" => Ok(Platform::Darwin),
            "linux" => Ok(Platform::Linux),
            other => Err(RunnerError::UnsupportedPlatform(other.to_string())),
        }
    }

    pub fn lib_ext(self) -> &'static str {
        match self {
            Platform::Darwin => ".dylib",
            Platform::Linux => ".so",
        }
    }
}
