use thiserror::Error;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The server could not process the query. Likely to fail again on a
    /// retry, so the cluster surfaces it without trying another server.
    #[error("{0}")]
    QueryError(String),

    /// The server could not process the insert. Likely to fail again.
    #[error("{0}")]
    InsertError(String),

    /// The server is (temporarily) unable to handle the request, for
    /// example while it is re-indexing or synchronizing.
    #[error("{0}")]
    ServerError(String),

    /// At least one required pool has no online server, or the client side
    /// ran out of endpoints to pick from.
    #[error("{0}")]
    PoolError(String),

    /// Credentials are invalid or insufficient, or the database is unknown.
    #[error("{0}")]
    AuthError(String),

    /// The user has no rights to perform the insert or query.
    #[error("{0}")]
    UserAuthError(String),

    /// Establishing the transport failed.
    #[error("connect failed: {0}")]
    ConnectError(String),

    /// The connection was lost before an answer arrived.
    #[error("{0}")]
    ConnectionError(String),

    /// A per-request timer expired before the server answered.
    #[error("{0}")]
    TimeoutError(String),

    /// The byte stream violated the framing rules; the connection is
    /// dropped by the caller.
    #[error("protocol error: {0}")]
    ProtocolError(String),

    /// The server sent a package type this client does not know. Might be
    /// caused by talking to a different SiriDB version.
    #[error("received an unknown package type: {0}")]
    UnknownPackageType(u8),

    /// Integer values must be signed and fit in 63 bits, and an encoded
    /// payload must stay under the package size limit.
    #[error("{0}")]
    OverflowError(String),

    /// A general error message from the server. This should not happen
    /// unless a new bug is discovered.
    #[error("{0}")]
    RuntimeError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("bad config: {0}")]
    BadConfigError(String),
}

impl Error {
    /// Errors after which the cluster marks the endpoint not-available and
    /// retries the request on another server.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::ServerError(_) | Error::ConnectError(_) | Error::ConnectionError(_)
        )
    }
}

impl From<core::convert::Infallible> for Error {
    fn from(err: core::convert::Infallible) -> Self {
        match err {}
    }
}

impl From<rmpv::decode::Error> for Error {
    fn from(err: rmpv::decode::Error) -> Self {
        Error::ProtocolError(format!("invalid payload: {err}"))
    }
}

impl From<rmpv::encode::Error> for Error {
    fn from(err: rmpv::encode::Error) -> Self {
        Error::ProtocolError(format!("failed to encode payload: {err}"))
    }
}
