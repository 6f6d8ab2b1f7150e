use thiserror::Error;

/// Why a string is not a valid identifier of the requested type.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    #[error("empty identifier")]
    Empty,

    /// A well-formed id of another type, e.g. `usr_…` where `clu_…` was expected.
    #[error("expected a '{expected}_' identifier, found prefix '{found}'")]
    WrongPrefix {
        expected: &'static str,
        found: String,
    },

    #[error("identifier has no '_' between prefix and ULID")]
    NoSeparator,

    #[error("bad ULID part: {0}")]
    BadUlid(String),
}
