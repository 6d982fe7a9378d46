// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::io::ErrorKind;

use thiserror::Error;

/// I/O-side failures that surface from a live connection.
///
/// These never leak past the connection boundary: the read pump and respond
/// tasks translate them into a close, at debug log level.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The peer is gone: half-closed socket, reset, or a zero-byte write at
    /// EOF.
    #[error("client disconnected")]
    Disconnected,

    /// A bounded I/O step (TLS handshake) exceeded its window.
    #[error("{0} timed out")]
    Timeout(&'static str),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Lifecycle precondition violations.
///
/// Programmer errors: never caught internally, always surfaced to the caller
/// of the server/connection method that broke the contract.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StateError {
    #[error("server already started")]
    AlreadyStarted,

    #[error("server is stopping")]
    Stopping,

    #[error("operation requires a stopped server")]
    NotStopped,

    #[error("connection already started")]
    ConnectionStarted,
}

/// Recognizes a "client disconnected" condition anywhere in an error chain.
///
/// Request handlers propagate I/O failures wrapped in arbitrary `anyhow`
/// context; a disconnect buried in the chain still means the response should
/// be abandoned silently rather than rendered as a 500.
pub fn is_client_disconnected(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        if let Some(conn) = cause.downcast_ref::<ConnectionError>() {
            return matches!(conn, ConnectionError::Disconnected);
        }
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            return matches!(
                io.kind(),
                ErrorKind::BrokenPipe
                    | ErrorKind::ConnectionReset
                    | ErrorKind::ConnectionAborted
                    | ErrorKind::UnexpectedEof
                    | ErrorKind::WriteZero
            );
        }
        false
    })
}
