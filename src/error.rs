//! Launcher error taxonomy.
//!
//! `AlreadyRunning` is an expected outcome and maps to exit code 0. Every
//! other variant that reaches the controller's top level is fatal and maps
//! to exit code 1. A readiness timeout is not represented here: the probe
//! reports it as `false` and the launcher carries on in a degraded state.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum LauncherError {
    #[error("another instance already holds {endpoint}")]
    AlreadyRunning { endpoint: SocketAddr },

    #[error("failed to bind instance lock {endpoint}: {source}")]
    Lock {
        endpoint: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("failed to start service '{}': {source}", .program.display())]
    ServiceStart {
        program: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("GUI shell unavailable: {0}")]
    Presentation(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl LauncherError {
    /// Whether this error is an expected outcome rather than a failure.
    pub fn is_expected(&self) -> bool {
        matches!(self, LauncherError::AlreadyRunning { .. })
    }
}

pub type Result<T> = std::result::Result<T, LauncherError>;
