use std::error::Error as StdError;

/// Crate-wide result type for chat provider operations.
pub type Result<T> = std::result::Result<T, ChatError>;

/// Categorized errors surfaced by chat providers.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    /// Bad connection string, unknown provider tag or other invalid configuration.
    #[error("invalid chat configuration: {message}")]
    Config { message: String },

    /// Handshake timeout, authentication rejection or transport fault.
    #[error("chat connection failed: {context}: {source}")]
    Connection {
        context: String,
        #[source]
        source: Box<dyn StdError + Send + Sync>,
    },

    /// The provider is not currently connected.
    #[error("chat provider is not connected")]
    NotConnected,

    /// A message could not be delivered.
    #[error("failed to send chat message: {context}: {source}")]
    Send {
        context: String,
        #[source]
        source: Box<dyn StdError + Send + Sync>,
    },

    /// The operation was cancelled by its caller.
    #[error("chat operation cancelled")]
    Cancelled,

    /// No channel is known under the given id.
    #[error("unknown channel id: {real_id}")]
    UnknownChannel { real_id: u64 },

    /// Channel metadata is missing or inconsistent.
    #[error("channel metadata error: {message}")]
    Metadata { message: String },

    /// A parameter is outside its valid range.
    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },
}

impl ChatError {
    #[must_use]
    pub fn config(message: impl std::fmt::Display) -> Self {
        Self::Config {
            message: message.to_string(),
        }
    }

    #[must_use]
    pub fn connection(context: impl Into<String>, source: impl Into<Box<dyn StdError + Send + Sync>>) -> Self {
        Self::Connection {
            context: context.into(),
            source: source.into(),
        }
    }

    #[must_use]
    pub fn send(context: impl Into<String>, source: impl Into<Box<dyn StdError + Send + Sync>>) -> Self {
        Self::Send {
            context: context.into(),
            source: source.into(),
        }
    }

    #[must_use]
    pub fn metadata(message: impl std::fmt::Display) -> Self {
        Self::Metadata {
            message: message.to_string(),
        }
    }

    #[must_use]
    pub fn invalid_argument(message: impl std::fmt::Display) -> Self {
        Self::InvalidArgument {
            message: message.to_string(),
        }
    }

    /// Whether this error only reports that the caller gave up
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
