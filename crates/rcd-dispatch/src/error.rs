use thiserror::Error;

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Could not load json body: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Invalid job request: {0}")]
    InvalidRequest(String),

    #[error("Wrong command '{0}'")]
    UnknownEvent(String),

    #[error("Unknown parameter '{name}' for {event}")]
    UnknownPreference { event: String, name: String },

    #[error("Invalid value for '{name}': {reason}")]
    InvalidPreference { name: String, reason: String },

    #[error("Command runner error: {0}")]
    Runner(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DispatchError>;
