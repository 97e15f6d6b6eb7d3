use thiserror::Error;

/// Errors surfaced while lexing and parsing twtxt input.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    /// Zero twts parsed and at least one line failed.
    #[error("erroneous feed detected ({errors} bad lines, no twts)")]
    InvalidFeed { errors: usize },

    #[error("unexpected {found:?} at byte {pos}, expected {expected}")]
    UnexpectedToken {
        expected: &'static str,
        found: String,
        pos: usize,
    },

    #[error("invalid datetime {0:?}")]
    InvalidDateTime(String),

    #[error("twt text is empty")]
    EmptyTwt,
}
