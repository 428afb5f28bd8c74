use thiserror::Error;

/// Errors returned by [`crate::Client`].
///
/// The type is `Clone` so a failed connection attempt can be cached and
/// handed to every caller waiting on it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClientError {
    #[error("Too many connections")]
    TooManyConnections,

    #[error("timed out waiting for the server to admit the session")]
    ConnectTimeout,

    #[error("client has quit")]
    Closed,

    #[error("invalid client configuration: {0}")]
    Config(String),

    /// The server answered with a non-success status.
    #[error("server returned {status}: {message}")]
    Server { status: u16, message: String },

    #[error("request failed: {0}")]
    Http(String),

    #[error("unexpected response: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ClientError::Decode(err.to_string())
        } else {
            ClientError::Http(err.to_string())
        }
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(err: serde_json::Error) -> Self {
        ClientError::Decode(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;
