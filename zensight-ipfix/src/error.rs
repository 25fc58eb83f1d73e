//! Error types for the IPFIX core.

use thiserror::Error;

/// Result type alias using the IPFIX [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the template, session, transcoder and framing layers.
#[derive(Debug, Error)]
pub enum Error {
    /// Template construction or lookup failure.
    #[error("Template error: {0}")]
    Template(#[from] TemplateError),

    /// No room left in the current message, or no records left in it.
    #[error("End of message")]
    EndOfMessage,

    /// The current set has no more records (manual collection mode only).
    #[error("End of set")]
    EndOfSet,

    /// The collector has no more messages.
    #[error("End of stream")]
    EndOfStream,

    /// Input violates the IPFIX framing or encoding rules.
    #[error("Malformed IPFIX input: {0}")]
    Malformed(String),

    /// External collection buffer ends before the current message does.
    #[error("Buffer too small: {needed} more bytes required")]
    BufferTooSmall { needed: usize },

    /// A value does not fit the field it is stored into.
    #[error("Invalid value: {0}")]
    InvalidValue(String),

    /// Misconfiguration detected while preparing a session or buffer.
    #[error("Setup error: {0}")]
    Setup(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Transport I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a malformed-input error.
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::Malformed(msg.into())
    }

    /// Create an invalid-value error.
    pub fn invalid_value(msg: impl Into<String>) -> Self {
        Self::InvalidValue(msg.into())
    }

    /// Create a setup error.
    pub fn setup(msg: impl Into<String>) -> Self {
        Self::Setup(msg.into())
    }

    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Whether the caller can resume after flushing, advancing or supplying
    /// more data.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::EndOfMessage | Self::EndOfSet | Self::BufferTooSmall { .. }
        )
    }
}

/// Template-level failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    #[error("template is attached to a session and can no longer change")]
    Frozen,

    #[error("template length would exceed 65535 octets")]
    TooLong,

    #[error("template would exceed {max} fields")]
    TooManyFields { max: usize },

    #[error("unknown information element {0}")]
    UnknownElement(String),

    #[error("invalid length {len} for element {name}")]
    InvalidLength { name: String, len: u16 },

    #[error("options scope already set")]
    ScopeAlreadySet,

    #[error("invalid options scope {scope} for a template of {fields} fields")]
    InvalidScope { scope: usize, fields: usize },

    #[error("template has no fields")]
    Empty,

    #[error("template id {0} is reserved")]
    ReservedId(u16),

    #[error("no free template id left")]
    IdsExhausted,

    #[error("missing internal template {0:#06x}")]
    MissingInternal(u16),

    #[error("missing external template {0:#06x}")]
    MissingExternal(u16),

    #[error("no internal template selected")]
    NoInternal,

    #[error("no external template selected")]
    NoExternal,
}
