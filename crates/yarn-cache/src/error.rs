use thiserror::Error;
use yarn_types::ParseError;

/// Why a single feed, avatar, peer or twt request failed.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("unexpected HTTP status {0}")]
    Status(u16),

    #[error("unexpected content type {0:?}")]
    ContentType(String),

    #[error("feed {0} is blacklisted")]
    Blacklisted(String),

    #[error("invalid feed: {0}")]
    Parse(#[from] ParseError),

    #[error("invalid response body: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("gopher error: {0}")]
    Gopher(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("cowardly refusing to twt empty text, or only spaces")]
    EmptyText,

    #[error("{user} may not post to feed {feed}")]
    Unauthorized { user: String, feed: String },

    #[error("feed {0} has no twt to edit")]
    NothingToEdit(String),

    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
}
