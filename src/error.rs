//! Error type shared by the page, the client and the greeter.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, GreetError>;

#[derive(Debug, Error)]
pub enum GreetError {
    /// No element with this id exists on the page.
    #[error("element #{0} not found")]
    MissingElement(String),

    /// The element exists but has no `value` to read.
    #[error("element #{0} is not an input")]
    NotAnInput(String),

    /// The remote object answered with an error.
    #[error("remote call failed: {0}")]
    Remote(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),

    /// The page loop or client actor is gone.
    #[error("{0} disconnected")]
    Disconnected(&'static str),

    #[error("configuration error: {0}")]
    Config(String),
}

impl GreetError {
    pub fn remote(msg: impl Into<String>) -> Self {
        Self::Remote(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}
