//! Error taxonomy for the proxy server
//!
//! Every failure surfaced by the dispatcher is one of these kinds. The
//! dispatcher alone performs wire mapping ([`ServerError::to_status`]) and
//! decides what feeds the circuit breaker
//! ([`ServerError::is_breaker_failure`]): only slot/transaction timeouts and
//! backend faults do. Client mistakes, admission rejections, and
//! cancellations must never trip a breaker.

use crate::backend::BackendError;
use ojp_core_cluster::ClusterError;
use ojp_core_resilience::ResilienceError;
use thiserror::Error;
use tonic::Status;

#[derive(Error, Debug)]
pub enum ServerError {
    /// Malformed request content (bad temporal/identifier value, bad
    /// property, malformed health blob)
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Remote address is not in the whitelist
    #[error("permission denied for {0}")]
    PermissionDenied(String),

    /// No session with this id exists
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// The session exists but has been terminated
    #[error("session closed: {0}")]
    SessionClosed(String),

    /// The circuit for this connection key is open; no backend call was made
    #[error("circuit open for {0}")]
    CircuitOpen(String),

    /// No slot available or a bounded queue is full
    #[error("overloaded: {0}")]
    Overloaded(String),

    /// A slot or transaction deadline expired
    #[error("timed out: {0}")]
    Timeout(String),

    /// The backend reported a failure; the original message is preserved
    #[error("backend failure: {0}")]
    Backend(#[from] BackendError),

    /// The client cancelled the call or its deadline expired
    #[error("call cancelled by client")]
    Cancelled,

    /// XA support was unavailable at startup
    #[error("XA unavailable: {0}")]
    XaUnavailable(String),
}

impl ServerError {
    /// Whether this outcome counts as a failure for the circuit breaker.
    pub fn is_breaker_failure(&self) -> bool {
        matches!(self, ServerError::Timeout(_) | ServerError::Backend(_))
    }

    /// Map this error onto its wire status code.
    pub fn to_status(&self) -> Status {
        match self {
            ServerError::InvalidArgument(msg) => Status::invalid_argument(msg.clone()),
            ServerError::PermissionDenied(msg) => Status::permission_denied(msg.clone()),
            ServerError::SessionNotFound(msg) | ServerError::SessionClosed(msg) => {
                Status::failed_precondition(msg.clone())
            }
            ServerError::CircuitOpen(msg) => Status::unavailable(msg.clone()),
            ServerError::Overloaded(msg) => Status::resource_exhausted(msg.clone()),
            ServerError::Timeout(msg) => Status::deadline_exceeded(msg.clone()),
            ServerError::Backend(err) => Status::internal(err.to_string()),
            ServerError::Cancelled => Status::cancelled("call cancelled"),
            ServerError::XaUnavailable(msg) => Status::failed_precondition(msg.clone()),
        }
    }
}

impl From<ServerError> for Status {
    fn from(err: ServerError) -> Self {
        err.to_status()
    }
}

impl From<ResilienceError> for ServerError {
    fn from(err: ResilienceError) -> Self {
        match err {
            ResilienceError::CircuitOpen { key } => ServerError::CircuitOpen(key),
            ResilienceError::Timeout(d) => {
                ServerError::Timeout(format!("no admission within {:?}", d))
            }
            ResilienceError::Overloaded(msg) => ServerError::Overloaded(msg),
            ResilienceError::PoolExhausted => {
                ServerError::Overloaded("connection pool exhausted".to_string())
            }
            ResilienceError::PoolClosed => {
                ServerError::Overloaded("connection pool closed".to_string())
            }
            ResilienceError::Setup(msg) => ServerError::Backend(BackendError::Connect(msg)),
        }
    }
}

impl From<ClusterError> for ServerError {
    fn from(err: ClusterError) -> Self {
        ServerError::InvalidArgument(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tonic::Code;

    #[test]
    fn test_wire_mapping() {
        let cases: Vec<(ServerError, Code)> = vec![
            (ServerError::InvalidArgument("x".into()), Code::InvalidArgument),
            (ServerError::PermissionDenied("x".into()), Code::PermissionDenied),
            (ServerError::SessionNotFound("x".into()), Code::FailedPrecondition),
            (ServerError::SessionClosed("x".into()), Code::FailedPrecondition),
            (ServerError::CircuitOpen("x".into()), Code::Unavailable),
            (ServerError::Overloaded("x".into()), Code::ResourceExhausted),
            (ServerError::Timeout("x".into()), Code::DeadlineExceeded),
            (
                ServerError::Backend(BackendError::Sql("boom".into())),
                Code::Internal,
            ),
            (ServerError::Cancelled, Code::Cancelled),
            (ServerError::XaUnavailable("x".into()), Code::FailedPrecondition),
        ];
        for (err, code) in cases {
            assert_eq!(err.to_status().code(), code, "wrong code for {:?}", err);
        }
    }

    #[test]
    fn test_breaker_failure_classification() {
        assert!(ServerError::Timeout("t".into()).is_breaker_failure());
        assert!(ServerError::Backend(BackendError::Sql("e".into())).is_breaker_failure());

        assert!(!ServerError::InvalidArgument("x".into()).is_breaker_failure());
        assert!(!ServerError::PermissionDenied("x".into()).is_breaker_failure());
        assert!(!ServerError::SessionNotFound("x".into()).is_breaker_failure());
        assert!(!ServerError::CircuitOpen("x".into()).is_breaker_failure());
        assert!(!ServerError::Overloaded("x".into()).is_breaker_failure());
        assert!(!ServerError::Cancelled.is_breaker_failure());
    }

    #[test]
    fn test_backend_message_preserved() {
        let err = ServerError::Backend(BackendError::Sql("ORA-00942: table missing".into()));
        let status = err.to_status();
        assert!(status.message().contains("ORA-00942"));
    }
}
