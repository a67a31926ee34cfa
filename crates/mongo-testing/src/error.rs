//! Error types for the test infrastructure.

use thiserror::Error;

use crate::mock::Operation;

/// Errors produced by the mock driver and the container fixture.
#[derive(Debug, Error)]
pub enum TestingError {
    /// A mock operation was scripted to fail.
    #[error("{operation} failed: {message}")]
    Scripted {
        /// Operation that failed.
        operation: Operation,
        /// Scripted message.
        message: String,
    },

    /// The MongoDB container could not be started or inspected.
    #[error("container error: {0}")]
    Container(#[from] testcontainers::TestcontainersError),
}
