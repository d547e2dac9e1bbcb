use std::fmt;
use std::io;

pub type Result<T> = std::result::Result<T, Error>;

/// A FAILURE summary as reported by the server: a vendor status code of the
/// form `Vendor.Classification.Category.Title` plus a human readable message.
/// Client-side failures reuse the same shape with an empty code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerFailure {
    pub code: String,
    pub message: String,
}

impl ServerFailure {
    #[inline]
    pub fn new<C: Into<String>, M: Into<String>>(code: C, message: M) -> ServerFailure {
        ServerFailure {
            code: code.into(),
            message: message.into(),
        }
    }

    /// A failure raised on the client side, carrying no vendor code.
    #[inline]
    pub fn local<M: Into<String>>(message: M) -> ServerFailure {
        ServerFailure {
            code: String::new(),
            message: message.into(),
        }
    }

    /// The classification segment of the status code, e.g. `TransientError`.
    pub fn classification(&self) -> &str {
        self.code.splitn(3, '.').nth(1).unwrap_or("")
    }
}

impl fmt::Display for ServerFailure {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.code.is_empty() {
            write!(f, "{}", self.message)
        } else {
            write!(f, "[{}] {}", self.code, self.message)
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    /// No common protocol version, or the peer did not speak Bolt at all.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// The server rejected the credentials, or they were malformed enough
    /// to be rejected before a socket was ever opened.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// No usable connection could be established or retained.
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    /// Server failure classified as transient; the caller may retry.
    #[error("transient error: {0}")]
    Transient(ServerFailure),

    /// Server failure attributed to the database itself.
    #[error("database error: {0}")]
    Database(ServerFailure),

    /// Server failure attributed to the client, or a client-side usage error.
    #[error("client error: {0}")]
    Client(ServerFailure),

    /// The link died after COMMIT was sent but before its summary arrived;
    /// the outcome of the transaction is unknown.
    #[error("commit outcome unknown: {0}")]
    IncompleteCommit(String),

    /// The routing record was missing mandatory roles or otherwise malformed.
    #[error("routing protocol error: {0}")]
    RoutingProtocol(String),

    #[error("encoding error: {0}")]
    Encoding(String),

    #[error("decoding error: {0}")]
    Decoding(String),

    /// The driver configuration itself was rejected.
    #[error("configuration error: {0}")]
    Configuration(String),
}

/// Transient codes that the server reports as such but that are caused by
/// client behaviour, so retrying them is pointless.
const CLIENT_SIDE_TRANSIENT_CODES: [&str; 2] = [
    "Neo.TransientError.Transaction.Terminated",
    "Neo.TransientError.Transaction.LockClientStopped",
];

impl Error {
    /// Classify a server FAILURE summary into the taxonomy.
    pub fn from_failure(code: &str, message: &str) -> Error {
        let failure = ServerFailure::new(code, message);
        if code == "Neo.ClientError.Security.Unauthorized" {
            return Error::Auth(message.to_string());
        }
        match failure.classification() {
            "ClientError" => Error::Client(failure),
            "TransientError" => {
                if CLIENT_SIDE_TRANSIENT_CODES.contains(&code) {
                    Error::Client(failure)
                } else {
                    Error::Transient(failure)
                }
            }
            _ => Error::Database(failure),
        }
    }

    /// A client-side error with no vendor code.
    #[inline]
    pub fn client<M: Into<String>>(message: M) -> Error {
        Error::Client(ServerFailure::local(message))
    }

    /// True when acquiring a fresh connection could plausibly succeed where
    /// this one failed.
    #[inline]
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::ServiceUnavailable(_) | Error::Transient(_) => true,
            _ => false,
        }
    }
}

impl From<io::Error> for Error {
    #[inline]
    fn from(err: io::Error) -> Error {
        Error::ServiceUnavailable(err.to_string())
    }
}
