use serde::Serialize;

/// Errors raised anywhere in the fetch pipeline.
///
/// Listing-phase and configuration errors are fatal to a run. Errors raised
/// while transferring a single file are folded into that file's
/// [`FetchOutcome`](crate::transfer::FetchOutcome) and never escape the
/// worker pool.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    /// Endpoint unreachable, or a connection dropped mid-operation.
    #[error("connection error: {0}")]
    Connection(String),
    /// The server answered with something we could not interpret.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// Invalid concurrency bound, paths or other settings.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// Local filesystem failure.
    #[error("io error: {0}")]
    Io(String),
    /// The run was cancelled before this operation could finish.
    #[error("cancelled: {0}")]
    Cancelled(String),
}

/// Serialisable discriminant of [`FetchError`], used in reports and JSONL output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorKind {
    Connection,
    Protocol,
    Configuration,
    Io,
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Connection => "Connection",
            ErrorKind::Protocol => "Protocol",
            ErrorKind::Configuration => "Configuration",
            ErrorKind::Io => "Io",
            ErrorKind::Cancelled => "Cancelled",
        }
    }
}

impl FetchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FetchError::Connection(_) => ErrorKind::Connection,
            FetchError::Protocol(_) => ErrorKind::Protocol,
            FetchError::Configuration(_) => ErrorKind::Configuration,
            FetchError::Io(_) => ErrorKind::Io,
            FetchError::Cancelled(_) => ErrorKind::Cancelled,
        }
    }

    /// The detail message without the category prefix.
    pub fn detail(&self) -> &str {
        match self {
            FetchError::Connection(s)
            | FetchError::Protocol(s)
            | FetchError::Configuration(s)
            | FetchError::Io(s)
            | FetchError::Cancelled(s) => s,
        }
    }

    pub(crate) fn io(context: &str, err: std::io::Error) -> Self {
        FetchError::Io(format!("{}: {}", context, err))
    }

    pub(crate) fn connection(context: &str, err: std::io::Error) -> Self {
        FetchError::Connection(format!("{}: {}", context, err))
    }
}

impl From<ftp::FtpError> for FetchError {
    fn from(err: ftp::FtpError) -> Self {
        match err {
            ftp::FtpError::ConnectionError(e) => FetchError::Connection(e.to_string()),
            ftp::FtpError::InvalidResponse(msg) => FetchError::Protocol(msg.trim().to_string()),
            // address parsing of PASV replies and TLS failures both surface here
            other => FetchError::Connection(other.to_string()),
        }
    }
}
