use thiserror::Error;

/// Why a string is not a valid id of the requested type.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    #[error("empty id")]
    Empty,

    #[error("id has no '_' between prefix and ULID")]
    MissingSeparator,

    /// Well formed, but typed for something else (e.g. `fw_…` as a worker id).
    #[error("expected a '{expected}' id, found prefix '{actual}'")]
    WrongPrefix {
        expected: &'static str,
        actual: String,
    },

    #[error("bad ULID: {0}")]
    InvalidUlid(String),
}

impl IdError {
    pub fn is_prefix_error(&self) -> bool {
        matches!(self, IdError::WrongPrefix { .. })
    }
}
