//! Error types for the stub runtime.
//!
//! Each stage has its own enum; `CaxaError` wraps them so `main` can report
//! any failure with a single `caxa:` prefixed line.

use std::{io, path::PathBuf};

use thiserror::Error;

pub type CaxaResult<T> = Result<T, CaxaError>;

#[derive(Error, Debug)]
pub enum CaxaError {
    #[error("failed to find executable: {0}")]
    SelfExe(#[source] io::Error),

    #[error("failed to read executable {path}: {source}")]
    SelfRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("binary corrupted: {0}")]
    Image(#[from] ImageError),

    #[error("failed to prepare application: {0}")]
    Staging(#[from] StagingError),

    #[error("execution failed: {0}")]
    Launch(#[from] LaunchError),
}

/// The artifact does not carry a usable separator/payload/footer layout.
#[derive(Error, Debug)]
pub enum ImageError {
    #[error("footer not found")]
    FooterMissing,

    #[error("invalid footer json: {0}")]
    FooterInvalid(#[from] serde_json::Error),

    #[error("archive separator not found")]
    SeparatorMissing,

    #[error("identifier is empty")]
    EmptyIdentifier,

    #[error("identifier is not a relative path: {0:?}")]
    InvalidIdentifier(String),
}

#[derive(Error, Debug)]
pub enum StagingError {
    #[error("failed to create lock {path}: {source}")]
    CreateLock {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to create application directory {path}: {source}")]
    CreateApp {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Extract(#[from] ExtractError),
}

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("unrecognized payload compression")]
    UnknownCompression,

    #[error("decompression failed: {0}")]
    Decompress(#[source] io::Error),

    #[error("malformed archive: {0}")]
    Archive(#[source] io::Error),

    #[error("illegal file path: {}", .0.display())]
    PathTraversal(PathBuf),

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("io error: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("extraction worker exited unexpectedly")]
    WorkerLost,
}

impl ExtractError {
    pub fn write(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Write { path: path.into(), source }
    }

    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io { context: context.into(), source }
    }
}

#[derive(Error, Debug)]
pub enum LaunchError {
    #[error("no command defined")]
    EmptyCommand,

    #[error("command not found: {program}")]
    NotFound { program: String },

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("staging path is not valid UTF-8: {}", .0.display())]
    NonUnicodePath(PathBuf),
}
