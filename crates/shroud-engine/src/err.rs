//! Declare error types for shroud-engine.

use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;

use crate::listener::ListenerMode;

/// An error from creating a listener.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum ListenerError {
    /// We couldn't bind the requested local address.
    #[error("Unable to bind {addr}")]
    Bind {
        /// The address we were asked to listen on.
        addr: SocketAddr,
        /// What went wrong.
        #[source]
        source: Arc<std::io::Error>,
    },

    /// The listener's mode needs a fixed target address, and none was given.
    #[error("Mode {0:?} requires a target address")]
    MissingTarget(ListenerMode),

    /// The listener's mode picks its targets per connection, but a fixed
    /// target was given anyway.
    #[error("Mode {0:?} does not take a target address")]
    UnexpectedTarget(ListenerMode),

    /// The engine is shutting down and admits nothing new.
    #[error("Engine is shutting down")]
    ShuttingDown,
}

/// The reason a single connection was closed.
///
/// These are never surfaced to a caller; the engine resolves each one by
/// closing the connection in question and logging it.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum ConnError {
    /// SOCKS negotiation went wrong.
    #[error("SOCKS negotiation failed")]
    Socks(#[from] shroud_socksproto::Error),

    /// The peer hung up while we were still negotiating.
    #[error("Peer disconnected during SOCKS negotiation")]
    NegotiationEof,

    /// The obfuscation protocol rejected the stream.
    #[error("Obfuscation protocol error")]
    Proto(#[from] shroud_obfs::ProtoError),

    /// A hostname from a SOCKS request did not resolve.
    #[error("Could not resolve {host:?}")]
    Resolve {
        /// The hostname we tried to resolve.
        host: String,
        /// What went wrong.
        #[source]
        source: Arc<std::io::Error>,
    },

    /// We couldn't reach the downstream target.
    #[error("Could not connect to {target}")]
    Connect {
        /// Where we were trying to connect.
        target: String,
        /// The error from the last address we tried.
        #[source]
        source: Arc<std::io::Error>,
    },

    /// Network I/O on an established channel failed.
    #[error("Network I/O error")]
    Io(#[source] Arc<std::io::Error>),
}

impl From<std::io::Error> for ConnError {
    fn from(e: std::io::Error) -> Self {
        ConnError::Io(Arc::new(e))
    }
}
