use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("token exchange failed with status {status}: {body}")]
    Auth { status: u16, body: String },

    #[error("total count request failed with status {status}: {body}")]
    Fetch { status: u16, body: String },

    #[error("sink error for {destination}: {details}")]
    Sink { destination: String, details: String },

    #[error("validation error: {0}")]
    Validation(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Http(_) | Error::Io(_) | Error::Database(_) => true,
            // 4xx from the authorization server means bad credentials, retrying won't help
            Error::Auth { status, .. } | Error::Fetch { status, .. } => {
                *status >= 500 || *status == 429
            }
            _ => false,
        }
    }
}
