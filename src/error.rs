//! Error types for nzb-connect
//!
//! The crate-wide [`Error`] enum wraps the domain-specific error families:
//! NNTP protocol/transport errors ([`NntpError`]), yEnc decode errors
//! ([`YencError`]), database errors, and the job-level failures surfaced to
//! the queue. The admin API maps errors to HTTP status codes through
//! [`ToHttpStatus`].

use thiserror::Error;

/// Result type alias for nzb-connect operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for nzb-connect
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with the offending key, when known
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable description of the problem
        message: String,
        /// The configuration key that caused the error (e.g. "servers")
        key: Option<String>,
    },

    /// Database operation failed
    #[error("database error: {0}")]
    Database(#[from] DatabaseError),

    /// NNTP protocol or connection error
    #[error("NNTP error: {0}")]
    Nntp(#[from] NntpError),

    /// Invalid NZB descriptor
    #[error("invalid NZB: {0}")]
    InvalidNzb(String),

    /// yEnc decode or integrity error
    #[error("yEnc error: {0}")]
    Yenc(#[from] YencError),

    /// Every pool and retry round failed for one article
    #[error("all servers exhausted for article <{message_id}>: {source}")]
    FetchExhausted {
        /// The message-id that could not be fetched
        message_id: String,
        /// The last error observed before giving up
        #[source]
        source: Box<NntpError>,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Download not found
    #[error("download not found: {0}")]
    NotFound(String),

    /// Outbound HTTP error (NZB-by-URL fetches)
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// JSON serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Control-plane server error
    #[error("API server error: {0}")]
    ApiServer(String),

    /// Post-processing (extraction/move) failure
    #[error("post-processing error: {0}")]
    PostProcess(String),

    /// The operation was cancelled by the caller
    #[error("cancelled")]
    Cancelled,
}

/// NNTP session and transport errors
///
/// Per-connection errors are recovered locally by the pool manager
/// (discard the connection, try the next pool); only [`Error::FetchExhausted`]
/// reaches the job.
#[derive(Debug, Error)]
pub enum NntpError {
    /// Server greeting was not 200/201
    #[error("unexpected greeting code {0}")]
    Greeting(u16),

    /// AUTHINFO exchange did not end in 281
    #[error("authentication failed (code {0})")]
    AuthFailed(u16),

    /// BODY returned something other than 222 (430 = no such article)
    #[error("article unavailable (code {code})")]
    ArticleUnavailable {
        /// The response code the server returned
        code: u16,
    },

    /// Malformed response line or framing violation
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Socket, TLS, or I/O failure
    #[error("transport error: {0}")]
    Transport(#[source] std::io::Error),

    /// A per-operation deadline expired (30 s writes, 60 s reads)
    #[error("{0} timed out")]
    Timeout(&'static str),

    /// The pool was closed while waiting for a connection
    #[error("connection pool closed")]
    PoolClosed,

    /// The caller's cancellation token fired while waiting
    #[error("cancelled")]
    Cancelled,
}

impl From<std::io::Error> for NntpError {
    fn from(e: std::io::Error) -> Self {
        NntpError::Transport(e)
    }
}

/// yEnc decode errors
#[derive(Debug, Error)]
pub enum YencError {
    /// No `=ybegin` header found in the article body
    #[error("no =ybegin header found")]
    MissingHeader,

    /// Escape byte (`=`) at end of input with no following byte
    #[error("incomplete escape sequence at end of input")]
    TruncatedEscape,

    /// Declared CRC32 does not match the decoded payload
    #[error("CRC32 mismatch: expected {expected:08x}, got {actual:08x}")]
    CrcMismatch {
        /// CRC32 declared in the `=yend` trailer
        expected: u32,
        /// CRC32 computed over the decoded payload
        actual: u32,
    },

    /// Structurally invalid header or trailer line
    #[error("malformed yEnc data: {0}")]
    Malformed(String),
}

/// Database-related errors
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Failed to open or connect to the database
    #[error("failed to connect to database: {0}")]
    ConnectionFailed(String),

    /// Schema setup failed
    #[error("failed to initialize schema: {0}")]
    SchemaFailed(String),

    /// Query failed
    #[error("query failed: {0}")]
    QueryFailed(String),
}

/// Map errors to HTTP status codes for the admin API
pub trait ToHttpStatus {
    /// HTTP status code for this error
    fn status_code(&self) -> u16;
}

impl ToHttpStatus for Error {
    fn status_code(&self) -> u16 {
        match self {
            Error::Config { .. } => 400,
            Error::InvalidNzb(_) => 422,
            Error::Yenc(_) => 422,
            Error::NotFound(_) => 404,
            Error::Nntp(_) | Error::FetchExhausted { .. } | Error::Network(_) => 502,
            Error::Database(_)
            | Error::Io(_)
            | Error::Serialization(_)
            | Error::ApiServer(_)
            | Error::PostProcess(_) => 500,
            Error::Cancelled => 409,
        }
    }
}

impl Error {
    /// Whether this error came from caller cancellation rather than failure
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled | Error::Nntp(NntpError::Cancelled))
    }
}
