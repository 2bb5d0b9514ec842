use std::{io, path::PathBuf};

use thiserror::Error;

use crate::sandbox::SandboxState;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub type Result<T, E = Error> = core::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    /// The embedded interpreter could not be located.
    #[error("embedded interpreter not found at {}: {source}", .path.display())]
    MissingInterpreter { path: PathBuf, source: io::Error },

    /// The package directory could not be listed.
    #[error("package directory {} is unreadable: {source}", .path.display())]
    PackageDir { path: PathBuf, source: io::Error },

    /// Runtime creation or bootstrap code failed.
    #[error("bootstrap failed: {0}")]
    Bootstrap(#[source] BoxError),

    /// A bootstrap-only capability was used after the trust window closed.
    #[error("privileged {0} used outside bootstrap")]
    IsolationViolation(&'static str),

    #[error("invalid sandbox state: expected {expected:?}, found {actual:?}")]
    InvalidState {
        expected: SandboxState,
        actual: SandboxState,
    },

    /// The output channel accepted fewer bytes than one frame.
    #[error("partial write: {written} of {expected} bytes")]
    PartialWrite { written: usize, expected: usize },

    #[error(transparent)]
    Codec(#[from] pybox_marshal::Error),

    #[error(transparent)]
    Fs(#[from] FsError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Error, Debug)]
pub enum FsError {
    #[error("no such file or directory: {0}")]
    NotFound(String),
    #[error("not a directory: {0}")]
    NotADirectory(String),
    #[error("is a directory: {0}")]
    IsADirectory(String),
    #[error("directory not empty: {0}")]
    NotEmpty(String),
    #[error("read-only mount: {0}")]
    ReadOnly(String),
    #[error("already mounted: {0}")]
    AlreadyMounted(String),
    #[error("not a mount point: {0}")]
    NotMounted(String),
    #[error("host filesystem error: {0}")]
    Host(#[from] io::Error),
}
