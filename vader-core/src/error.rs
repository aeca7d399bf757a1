//! Fatal pipeline errors.
//!
//! A [`CoreError`] unwinds the current compilation immediately. Recoverable
//! problems are never represented here; they go through
//! [`crate::diagnostic::Diagnostics`] instead.

use thiserror::Error;

use crate::loader::LoadError;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("failed to read source: {0}")]
    SourceIo(#[from] std::io::Error),

    #[error(transparent)]
    Load(#[from] LoadError),

    #[error("lex error at {location}: {message}")]
    Lex { location: String, message: String },

    #[error("parse error at {location}: {message}")]
    Parse { location: String, message: String },

    #[error("resolution reported {count} error(s); not generating code")]
    ResolutionFailed { count: usize },

    #[error("program has no top-level binding named '{0}'")]
    MissingEntry(String),

    #[error("entry function '{name}' must return u32 or void, found {found}")]
    BadEntry { name: String, found: String },

    #[error("no lowering for operator '{op}' on type {ty}")]
    MissingLowering { op: String, ty: String },

    #[error("unknown intrinsic '{0}'")]
    UnknownIntrinsic(String),

    #[error("codegen error: {0}")]
    Codegen(String),
}
