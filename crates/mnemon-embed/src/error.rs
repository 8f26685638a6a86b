use std::fmt;

/// Result type for mnemon-embed operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types that can occur in the embedding layer
#[derive(Debug)]
pub enum Error {
    /// HTTP transport failed
    Http(reqwest::Error),

    /// Backend returned an unusable response
    Response(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Http(err) => write!(f, "HTTP error: {}", err),
            Error::Response(msg) => write!(f, "Embedding response error: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Http(err) => Some(err),
            Error::Response(_) => None,
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::Http(err)
    }
}
