use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Error kinds surfaced by the public API. Every failure maps to exactly
/// one kind; there is no silent fallback anywhere in the engine.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed or unsupported metadata: unknown element type, bad
    /// version, missing required columns.
    #[error("schema error: {0}")]
    Schema(String),

    /// Underlying file error: missing file, permission denied,
    /// unexpected EOF, rename failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A value does not fit the column's type, size or arity, or the
    /// encoding overflowed the row's address space.
    #[error("type error: {0}")]
    Type(String),

    /// Row id out of range, or an index/column name that does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Operation attempted in the wrong mode, or on a closed handle.
    #[error("state error: {0}")]
    State(String),

    /// Malformed key tuple: wrong arity or wrong component type.
    #[error("key error: {0}")]
    Key(String),

    /// Index build failed; the partial build file has been removed.
    #[error("index build failed: {0}")]
    Build(String),
}
