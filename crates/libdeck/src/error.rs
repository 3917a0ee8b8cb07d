use thiserror::Error;

use deck_protocol::HandleId;

pub type DeckResult<T> = std::result::Result<T, DeckError>;

#[derive(Error, Debug)]
pub enum DeckError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("api error: {0}")]
    Api(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("unknown terminal handle: {0}")]
    UnknownHandle(HandleId),

    #[error("{0} is no longer running")]
    Stopped(&'static str),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl DeckError {
    /// Failures expected to clear on their own, such as a refused or reset
    /// connection. Channels log other dial failures as warnings.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Io(_))
    }
}

impl From<rusqlite::Error> for DeckError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Store(err.to_string())
    }
}

impl From<serde_json::Error> for DeckError {
    fn from(err: serde_json::Error) -> Self {
        Self::Protocol(err.to_string())
    }
}

impl From<reqwest::Error> for DeckError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() || err.is_timeout() {
            Self::Connection(err.to_string())
        } else {
            Self::Api(err.to_string())
        }
    }
}
