//! Error types for sentinel resolution.

use thiserror::Error;

/// Result type alias for resolver operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the resolver.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration errors. Never retried.
    #[error("config error: {0}")]
    Config(String),

    /// The sentinel group is not registered.
    #[error("sentinel group not found: {0}")]
    GroupNotFound(String),

    /// The sentinel group has no endpoints to query.
    #[error("missing endpoints for group: {0}")]
    MissingEndpoints(String),

    /// Every endpoint of the group failed to resolve the master.
    #[error("no endpoints resolved master name {master_name} in group {group}")]
    NoEndpointsResolved { group: String, master_name: String },

    /// The cache holds the error marker for this master.
    #[error("no endpoints found for master name {master_name} in group {group}")]
    NoEndpointsFound { group: String, master_name: String },

    /// Sentinel does not know the master name.
    #[error("master name not known to sentinel: {0}")]
    MasterUnknown(String),

    /// The resolved master reported a role other than master.
    #[error("address {addr} reports role {role}, expected master")]
    RoleMismatch { addr: String, role: String },

    /// A reply did not have the expected shape.
    #[error("malformed reply: {0}")]
    MalformedReply(String),

    /// Errors from the command/pub-sub layer.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Errors raised by a [`SentinelTransport`](crate::transport::SentinelTransport).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Connection failed.
    #[error("connection failed to {addr}: {reason}")]
    ConnectionFailed { addr: String, reason: String },

    /// The endpoint did not answer within its timeout.
    #[error("timed out talking to {0}")]
    Timeout(String),

    /// The server answered with an error.
    #[error("command failed: {0}")]
    Command(String),

    /// The connection or subscription was closed.
    #[error("connection closed")]
    Closed,
}

impl TransportError {
    /// Classify a `redis` error raised while talking to `addr`.
    pub fn from_redis(addr: impl ToString, e: redis::RedisError) -> Self {
        let addr = addr.to_string();
        if e.is_timeout() {
            TransportError::Timeout(addr)
        } else if e.is_io_error() || e.is_connection_refusal() || e.is_connection_dropped() {
            TransportError::ConnectionFailed {
                addr,
                reason: e.to_string(),
            }
        } else {
            TransportError::Command(format!("{}: {}", addr, e))
        }
    }
}

impl Error {
    /// Whether this error stems from configuration rather than sentinel state.
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            Error::Config(_) | Error::GroupNotFound(_) | Error::MissingEndpoints(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use redis::{ErrorKind, RedisError};

    #[test]
    fn test_redis_errors_keep_the_endpoint() {
        for kind in [ErrorKind::IoError, ErrorKind::TypeError, ErrorKind::ResponseError] {
            let err = TransportError::from_redis("10.0.0.1:26379", RedisError::from((kind, "failed")));
            assert!(err.to_string().contains("10.0.0.1:26379"), "{}", err);
        }

        let typed = RedisError::from((ErrorKind::TypeError, "unexpected reply"));
        assert!(matches!(
            TransportError::from_redis("10.0.0.1:26379", typed),
            TransportError::Command(_)
        ));
    }

    #[test]
    fn test_config_classification() {
        assert!(Error::MissingEndpoints("g".into()).is_config());
        assert!(!Error::Transport(TransportError::Closed).is_config());
    }
}
