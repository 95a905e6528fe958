//! Errors raised by [`Server`](super::Server) operations.

use std::io;

use thiserror::Error;

/// Errors that may occur while starting or talking to the server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Binding or configuring the listening socket failed.
    #[error("bind error: {0}")]
    Bind(#[source] io::Error),

    /// The worker runtime or thread could not be created.
    #[error("runtime error: {0}")]
    Runtime(#[source] io::Error),

    /// The server has stopped and no longer accepts commands.
    #[error("server stopped")]
    Stopped,
}
