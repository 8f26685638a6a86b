use std::fmt;
use std::time::Duration;

/// Result type for mnemon-runtime operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types that can occur in the runtime layer
#[derive(Debug)]
pub enum Error {
    /// Store layer error
    Store(mnemon_store::Error),

    /// Session parsing error
    Session(mnemon_types::Error),

    /// Engine layer error (payload validation)
    Engine(mnemon_engine::Error),

    /// Embedding backend error
    Embed(mnemon_embed::Error),

    /// IO operation failed
    Io(std::io::Error),

    /// Configuration error
    Config(String),

    /// A skill listed as required was not discovered at startup
    MissingSkill(String),

    /// Agent subprocess failed
    Agent(String),

    /// Agent subprocess exceeded its deadline
    Timeout(Duration),

    /// Invalid operation or state
    InvalidOperation(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Store(err) => write!(f, "Store error: {}", err),
            Error::Session(err) => write!(f, "Session error: {}", err),
            Error::Engine(err) => write!(f, "Engine error: {}", err),
            Error::Embed(err) => write!(f, "Embedding error: {}", err),
            Error::Io(err) => write!(f, "IO error: {}", err),
            Error::Config(msg) => write!(f, "Configuration error: {}", msg),
            Error::MissingSkill(name) => write!(f, "missing required skill: {}", name),
            Error::Agent(msg) => write!(f, "Agent error: {}", msg),
            Error::Timeout(after) => write!(f, "agent timed out after {}s", after.as_secs()),
            Error::InvalidOperation(msg) => write!(f, "Invalid operation: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Store(err) => Some(err),
            Error::Session(err) => Some(err),
            Error::Engine(err) => Some(err),
            Error::Embed(err) => Some(err),
            Error::Io(err) => Some(err),
            Error::Config(_)
            | Error::MissingSkill(_)
            | Error::Agent(_)
            | Error::Timeout(_)
            | Error::InvalidOperation(_) => None,
        }
    }
}

impl From<mnemon_store::Error> for Error {
    fn from(err: mnemon_store::Error) -> Self {
        Error::Store(err)
    }
}

impl From<mnemon_types::Error> for Error {
    fn from(err: mnemon_types::Error) -> Self {
        Error::Session(err)
    }
}

impl From<mnemon_engine::Error> for Error {
    fn from(err: mnemon_engine::Error) -> Self {
        Error::Engine(err)
    }
}

impl From<mnemon_embed::Error> for Error {
    fn from(err: mnemon_embed::Error) -> Self {
        Error::Embed(err)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for Error {
    fn from(err: toml::ser::Error) -> Self {
        Error::Config(err.to_string())
    }
}
