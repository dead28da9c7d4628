use thiserror::Error;

/// Boxed native error carried by [`DataError::BackendError`]
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Unified error type for all adapter, driver and stream operations
#[derive(Error, Debug)]
pub enum DataError {
    /// No adapter registered under this backend type
    #[error("Database of type \"{0}\" is not supported")]
    UnsupportedBackend(String),

    /// Malformed connection string or missing required parameter
    #[error("Invalid connection string: {0}")]
    InvalidConnectionString(String),

    /// Backend open failed (authentication, network, etc.)
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Operation referenced an id that was never registered or already closed
    #[error("Connection with id \"{0}\" is not registered")]
    UnknownConnection(String),

    /// Query, structure or columns call failed against a live connection
    #[error("Backend error: {message}")]
    BackendError {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// Pulled past the end of a result stream
    #[error("Result stream is exhausted")]
    ExhaustedStream,

    /// The driver does not implement the requested optional capability
    #[error("Operation not supported: {0}")]
    UnsupportedCapability(String),

    /// The caller cancelled the operation
    #[error("Operation cancelled")]
    Cancelled,

    /// Query text the backend cannot even attempt to run
    #[error("Invalid query: {0}")]
    InvalidQuery(String),
}

impl DataError {
    /// Wrap a native backend error
    pub fn backend<E>(msg: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        DataError::BackendError {
            message: msg.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Backend failure with no native error to carry
    pub fn backend_msg(msg: impl Into<String>) -> Self {
        DataError::BackendError {
            message: msg.into(),
            source: None,
        }
    }

    pub fn invalid_connection_string(msg: impl Into<String>) -> Self {
        DataError::InvalidConnectionString(msg.into())
    }

    pub fn unsupported_capability(msg: impl Into<String>) -> Self {
        DataError::UnsupportedCapability(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, DataError>;
