//! Error types for cluster coordination

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClusterError {
    /// A health blob entry was not of the form `endpoint=status`
    #[error("malformed health entry '{0}', expected endpoint=status")]
    MalformedEntry(String),

    /// A health blob entry carried a status other than up/down
    #[error("invalid endpoint status '{0}', expected up or down")]
    InvalidStatus(String),
}
