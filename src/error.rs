use std::io;

/// Central error type for the tern engine.
///
/// Only initialization can fail loudly: socket setup, rlimit handling and
/// thread creation surface here. Per-connection failures never leave the
/// worker that owns the connection.
#[derive(Debug)]
pub enum TernError {
    /// Underlying I/O error from the OS or network.
    Io(io::Error),
    /// A configuration value that cannot be honored.
    Config(String),
    /// A worker thread could not be spawned.
    WorkerSpawn(io::Error),
}

impl std::fmt::Display for TernError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TernError::Io(e) => write!(f, "I/O error: {}", e),
            TernError::Config(msg) => write!(f, "invalid configuration: {}", msg),
            TernError::WorkerSpawn(e) => write!(f, "failed to spawn worker: {}", e),
        }
    }
}

impl std::error::Error for TernError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TernError::Io(e) | TernError::WorkerSpawn(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for TernError {
    fn from(e: io::Error) -> Self {
        TernError::Io(e)
    }
}

pub type TernResult<T> = Result<T, TernError>;
