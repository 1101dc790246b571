use thiserror::Error;

/// Errors raised while opening or reading a capture handle
#[derive(Error, Debug)]
pub enum CaptureError {
    /// The requested interface does not exist
    #[error("interface not found: {0}")]
    NotFound(String),

    /// The process lacks the privileges to open the interface
    #[error("permission denied opening {0}")]
    PermissionDenied(String),

    /// The kernel filter expression could not be compiled
    #[error("invalid filter expression: {0}")]
    FilterSyntax(String),

    /// A read failed for a reason other than end-of-capture
    #[error("capture read failed: {0}")]
    Read(String),

    /// The handle already reported end-of-capture
    #[error("capture handle already closed")]
    HandleClosed,

    /// Any other error from the pcap library
    #[error("PCAP error: {0}")]
    Pcap(#[from] pcap::Error),
}

/// Errors raised while turning a raw frame into a flow
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("truncated {0} header")]
    Truncated(&'static str),

    #[error("unsupported link layer type {0}")]
    UnsupportedLinkLayer(i32),

    #[error("not an IP packet ({0})")]
    NotIp(String),
}

/// Application error types
#[derive(Error, Debug)]
pub enum AppError {
    /// Interface disappeared or could not be opened
    #[error("interface unavailable: {0}")]
    InterfaceUnavailable(String),

    /// Filter expression rejected before the session started
    #[error("filter rejected: {0}")]
    FilterSyntax(String),

    /// Error from capture operations
    #[error("capture error: {0}")]
    Capture(CaptureError),

    /// Error from the session database
    #[error("storage error: {0}")]
    Store(#[from] rusqlite::Error),

    /// Error from I/O operations
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Error from JSON serialization/deserialization
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A background task panicked or could not be joined
    #[error("task error: {0}")]
    Task(String),

    /// Connection enumeration failed
    #[error("attribution error: {0}")]
    Attribution(String),

    /// A record arrived for a session that has already ended
    #[error("session {0} is closed")]
    SessionClosed(i64),

    #[error("monitoring is already running")]
    AlreadyRunning,

    #[error("monitoring is not running")]
    NotRunning,
}

impl From<CaptureError> for AppError {
    fn from(err: CaptureError) -> Self {
        match err {
            CaptureError::NotFound(name) => {
                AppError::InterfaceUnavailable(format!("{} does not exist", name))
            }
            CaptureError::PermissionDenied(name) => {
                AppError::InterfaceUnavailable(format!("permission denied on {}", name))
            }
            CaptureError::FilterSyntax(reason) => AppError::FilterSyntax(reason),
            other => AppError::Capture(other),
        }
    }
}

impl From<tokio::task::JoinError> for AppError {
    fn from(err: tokio::task::JoinError) -> Self {
        AppError::Task(err.to_string())
    }
}

/// Result type for application
pub type AppResult<T> = Result<T, AppError>;
