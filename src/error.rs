//! Error types for the repackager.
//!
//! Lower-level components return these typed failures; the package pipeline wraps
//! them in [`Error::Stage`] so the caller learns which step aborted the run.

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::pipeline::Stage;

/// The main error type for patching and repackaging operations.
#[derive(Error, Debug)]
pub enum Error {
    // ==================== Input Validation ====================
    #[error("invalid alias {0:?}: expected 5 characters, a letter followed by letters or digits")]
    InvalidAlias(String),

    #[error("invalid port {0:?}: expected an integer in 1..=65535")]
    InvalidPort(String),

    // ==================== Executable Formats ====================
    #[error("unsupported executable format: {0}")]
    UnsupportedFormat(String),

    #[error("section '{name}' at {offset:#x} (+{size:#x}) lies outside the file")]
    SectionOutOfBounds { name: String, offset: u64, size: u64 },

    #[error("replacement for {old:?} is longer than the original")]
    RuleTooLong { old: String },

    // ==================== Archives ====================
    #[error("not an ar archive: unexpected magic {0:?}")]
    NotAnArArchive(Vec<u8>),

    #[error("malformed ar archive at offset {offset:#x}: {reason}")]
    MalformedArchive { offset: usize, reason: String },

    #[error("ar member name {0:?} does not fit in 16 bytes")]
    MemberNameTooLong(String),

    #[error("package has no {0} member")]
    MissingMember(&'static str),

    #[error("refusing to extract entry outside the target directory: {0}")]
    UnsafePath(String),

    #[error("compression error: {0}")]
    Compression(#[source] std::io::Error),

    #[error("written package failed its self-check: {0}")]
    Validation(String),

    // ==================== I/O Errors ====================
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to access '{path}': {source}")]
    File {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ==================== Pipeline ====================
    #[error("{stage} failed: {source}")]
    Stage {
        stage: Stage,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Returns a `map_err` adapter that attaches `path` to an I/O error.
    pub fn at(path: &Path) -> impl FnOnce(std::io::Error) -> Error + '_ {
        move |source| Error::File {
            path: path.to_path_buf(),
            source,
        }
    }

    /// The stage that failed, when this error came out of the package pipeline.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Error::Stage { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    /// Strips any stage wrappers and returns the underlying cause.
    pub fn root_cause(&self) -> &Error {
        match self {
            Error::Stage { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

/// Result type alias using this crate's [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
