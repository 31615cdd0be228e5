use thiserror::Error;

/// Errors that can occur while invoking hub methods or handling inbound
/// invocations.
#[derive(Error, Debug)]
pub enum RpcError {
    /// A positional argument, upload item or handler result could not be
    /// converted into a wire value.
    #[error("failed to marshal argument {index}: {source}")]
    Marshal {
        /// Zero-based position of the offending value.
        index: usize,
        /// Underlying codec error.
        #[source]
        source: serde_json::Error,
    },

    /// An inbound argument or download item could not be converted into the
    /// requested type.
    #[error("failed to decode argument {index}: {source}")]
    Decode {
        /// Zero-based position of the offending value.
        index: usize,
        /// Underlying codec error.
        #[source]
        source: serde_json::Error,
    },

    /// The inbound invocation carried a different number of arguments than
    /// the handler declares.
    #[error("invocation provides {actual} argument(s) but handler expects {expected}")]
    ArgumentCount {
        /// Number of parameters the handler declares.
        expected: usize,
        /// Number of arguments the invocation carried.
        actual: usize,
    },

    /// JSON serialization or deserialization failed outside a positional
    /// argument.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A result-returning handler is already subscribed for this target.
    #[error("a result handler is already registered for target '{0}'")]
    HandlerConflict(String),

    /// Target names must be non-empty.
    #[error("invalid target name: target must be non-empty")]
    InvalidTarget,

    /// A locally registered handler failed.
    #[error("handler error: {0}")]
    Handler(String),

    /// The remote peer completed the invocation with an error.
    #[error("remote error: {0}")]
    Remote(String),

    /// An upload stream source yielded an error.
    #[error("upload stream failed: {0}")]
    UploadSource(String),

    /// Invocation timed out waiting for its completion.
    #[error("invocation timed out")]
    Timeout,

    /// The invocation was cancelled before it completed.
    #[error("invocation cancelled")]
    Cancelled,

    /// The connection closed before the invocation completed.
    #[error("connection closed")]
    ConnectionClosed,

    /// Operation not valid in the current state.
    #[error("invalid state: {0}")]
    InvalidState(String),
}

/// Result type alias for hub operations.
pub type Result<T> = std::result::Result<T, RpcError>;
