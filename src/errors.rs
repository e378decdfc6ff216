use std::io;

use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("failed to resolve required path: {0}")]
    Path(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Database(#[from] rusqlite::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("{0}")]
    Config(String),
    #[error("local database is not initialized")]
    NotInitialized,
    #[error("not found: {0}")]
    NotFound(String),
    #[error("remote store rejected request ({status}): {body}")]
    Remote { status: u16, body: String },
}

/// Failure to read a serialized blob as the expected JSON shape.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("blob is empty")]
    Empty,
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("expected a json object, found {0}")]
    NotAnObject(&'static str),
}
