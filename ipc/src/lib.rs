//! Client side of the GpgEX shell extension.
//!
//! GpgEX adds cryptographic commands to the context menu of the file
//! manager.  It does not do any cryptography itself.  Instead, it
//! forwards the selected files to a UI server (e.g. Kleopatra or GPA)
//! using the Assuan protocol, and the UI server does the rest.
//!
//! # Design
//!
//! The UI server listens on a well-known rendezvous point, the file
//! `S.uiserver` in the GnuPG home directory.  To issue a command, we
//! connect to it, attach the input files using `FILE` commands, and
//! finally send the command itself with the `--nohup` flag, so that
//! the server acknowledges it right away and completes the operation
//! in the background.
//!
//! If no server is listening, we start one on demand.  Several
//! processes may try to do that at the same time (every Explorer
//! window has its own copy of the extension), therefore starting the
//! server is serialized using a system-wide lock.  Under that lock we
//! try to connect once more, because a competing process may have
//! started the server in the meantime, and only then spawn it and
//! poll until it accepts connections.
//!
//! # Layers
//!
//!   - [`assuan`]: the wire protocol.
//!   - [`Context`]: the configuration, i.e. the home directory, the
//!     installation directory, and an optional UI server override.
//!   - [`locate`]: finds the rendezvous point and the server to start.
//!   - [`spawn`] and [`lock`]: starting the server, and serializing
//!     that.
//!   - [`session`]: a connection to the server, starting it if
//!     necessary.
//!   - [`client`]: one operation per user command.

#![warn(missing_docs)]

#[cfg(test)]
#[macro_use]
extern crate quickcheck;

#[macro_use] mod macros;
#[macro_use] mod trace;
pub mod assuan;
pub mod client;
pub mod context;
pub mod locate;
pub mod lock;
pub mod session;
pub mod spawn;

use std::path::PathBuf;

pub use crate::client::{Client, Command, Failure, LogNotifier, Notifier, Request};
pub use crate::context::{Config, Context, Lookup};
pub use crate::locate::{LaunchDescriptor, Locator};
pub use crate::session::{RetryPolicy, Session};

/// Result type for this crate.
pub type Result<T> = ::std::result::Result<T, anyhow::Error>;

#[derive(thiserror::Error, Debug)]
/// Errors returned from the client routines.
pub enum Error {
    /// The rendezvous point cannot be determined.
    #[error("Invalid socket name: the GnuPG home directory is unknown")]
    InvalidEndpoint,
    /// No UI server to start was found.
    #[error("No UI server found: {0}")]
    ServerNotFound(String),
    /// The UI server could not be started.
    #[error("Failed to start the UI server: {0}")]
    SpawnFailed(String),
    /// The spawn lock could not be acquired in time.
    #[error("Timed out waiting for the spawn lock {0:?}")]
    LockTimeout(PathBuf),
    /// No connection to the UI server could be established.
    #[error("Failed to connect to {0:?}: {1}")]
    ConnectFailed(PathBuf, String),
    /// Handshake failed.
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),
    /// Connection closed unexpectedly.
    #[error("Connection closed unexpectedly.")]
    ConnectionClosed(Vec<u8>),
    /// Talking to the UI server failed after the connection was
    /// established.
    #[error("Lost the connection to the UI server: {0}")]
    TransportFailed(String),
    /// The server rejected a command.
    #[error("Operation failed ({code}): {}",
            .message.as_deref().unwrap_or("Unknown reason"))]
    OperationFailed {
        /// Error code as defined in `libgpg-error`.
        code: usize,
        /// Optional human-readable message.
        message: Option<String>,
    },
    /// The remote party violated the protocol.
    #[error("Protocol violation: {0}")]
    ProtocolError(String),
    /// The session has been closed.
    #[error("Session is closed")]
    SessionClosed,
}

impl Error {
    /// Returns the category of this error.
    pub fn kind(&self) -> ErrorKind {
        use self::Error::*;
        match self {
            InvalidEndpoint => ErrorKind::Configuration,
            ServerNotFound(_) | SpawnFailed(_) => ErrorKind::Spawn,
            LockTimeout(_) | ConnectFailed(..) | HandshakeFailed(_) =>
                ErrorKind::Connection,
            ConnectionClosed(_) | TransportFailed(_) | OperationFailed { .. }
                | ProtocolError(_) | SessionClosed => ErrorKind::Protocol,
        }
    }
}

/// Categories of errors.
///
/// The first three mean that we could not talk to the UI server at
/// all, the last one that the server did not like what we told it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The configuration is unusable, e.g. the home directory is
    /// unknown.
    Configuration,
    /// The UI server could not be located or started.
    Spawn,
    /// The UI server could not be reached.
    Connection,
    /// The UI server reported an error after we connected to it.
    Protocol,
}

impl ErrorKind {
    /// Classifies an error.
    ///
    /// Bare I/O errors are considered connection errors.  Once a
    /// session is established, I/O errors are reported as
    /// [`Error::TransportFailed`] instead.
    pub fn of(err: &anyhow::Error) -> Self {
        if let Some(e) = err.downcast_ref::<Error>() {
            e.kind()
        } else if err.downcast_ref::<std::io::Error>().is_some() {
            ErrorKind::Connection
        } else {
            ErrorKind::Protocol
        }
    }

    /// Returns whether the server could not be reached or started.
    pub fn is_unreachable(&self) -> bool {
        *self != ErrorKind::Protocol
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        let e: anyhow::Error = Error::InvalidEndpoint.into();
        assert_eq!(ErrorKind::of(&e), ErrorKind::Configuration);

        let e: anyhow::Error = Error::LockTimeout("x".into()).into();
        assert_eq!(ErrorKind::of(&e), ErrorKind::Connection);
        assert!(ErrorKind::of(&e).is_unreachable());

        let e: anyhow::Error = Error::OperationFailed {
            code: 67109139,
            message: Some("Unknown IPC command".into()),
        }.into();
        assert_eq!(ErrorKind::of(&e), ErrorKind::Protocol);
        assert!(! ErrorKind::of(&e).is_unreachable());
        assert_eq!(e.to_string(),
                   "Operation failed (67109139): Unknown IPC command");

        let e: anyhow::Error = std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused, "refused").into();
        assert_eq!(ErrorKind::of(&e), ErrorKind::Connection);

        let e: anyhow::Error =
            Error::TransportFailed("Broken pipe".into()).into();
        assert_eq!(ErrorKind::of(&e), ErrorKind::Protocol);

        // Context does not hide the category.
        let e = anyhow::Error::from(Error::SpawnFailed("nope".into()))
            .context("Starting the UI server");
        assert_eq!(ErrorKind::of(&e), ErrorKind::Spawn);
    }
}
