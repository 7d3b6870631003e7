//! Listeners: bound accepting sockets that produce connections.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use shroud_obfs::{Endpoint, ProtocolSpec};

use crate::engine::Engine;
use crate::err::ListenerError;

/// What kind of traffic a listener accepts, and what it does with it.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum ListenerMode {
    /// Accept local cleartext, obfuscate it toward a fixed remote target.
    SimpleClient,
    /// Accept remote obfuscated traffic, forward cleartext to a fixed
    /// target.
    SimpleServer,
    /// Accept local SOCKS5 requests, obfuscate toward per-request targets.
    SocksClient,
}

/// Everything a listener needs to produce connections.
///
/// Taken by value when the listener is created; on failure there is
/// nothing half-owned to worry about.
#[derive(Clone, Debug)]
#[allow(clippy::exhaustive_structs)]
pub struct ListenerParams {
    /// Which of the three behaviors this listener has.
    pub mode: ListenerMode,
    /// The local address to bind.
    pub listen: SocketAddr,
    /// The fixed downstream target. Required in the simple modes,
    /// forbidden in SOCKS mode.
    pub target: Option<SocketAddr>,
    /// The obfuscation protocol for every connection here.
    pub protocol: ProtocolSpec,
    /// Close connections after this much inactivity.
    pub idle_timeout: Option<Duration>,
}

impl ListenerParams {
    /// Check that the mode and the target option agree.
    pub(crate) fn validate(&self) -> Result<(), ListenerError> {
        match (self.mode, &self.target) {
            (ListenerMode::SimpleClient | ListenerMode::SimpleServer, None) => {
                Err(ListenerError::MissingTarget(self.mode))
            }
            (ListenerMode::SocksClient, Some(_)) => {
                Err(ListenerError::UnexpectedTarget(self.mode))
            }
            _ => Ok(()),
        }
    }

    /// Which end of the obfuscated link our protocol instances serve.
    pub(crate) fn endpoint(&self) -> Endpoint {
        match self.mode {
            ListenerMode::SimpleClient | ListenerMode::SocksClient => Endpoint::Initiator,
            ListenerMode::SimpleServer => Endpoint::Responder,
        }
    }
}

/// Accept connections until told to stop; the accept socket closes when
/// this returns.
pub(crate) async fn accept_loop(
    engine: Arc<Engine>,
    listener: TcpListener,
    params: Arc<ListenerParams>,
    cancel: CancellationToken,
) {
    let local = listener.local_addr().unwrap_or(params.listen);
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            r = listener.accept() => r,
        };
        match accepted {
            Ok((stream, peer)) => engine.launch_conn(stream, peer, &params),
            Err(e) if !accept_err_is_fatal(&e) => {
                warn!("Incoming stream failed: {}", e);
            }
            Err(e) => {
                warn!("Fatal accept error on {}: {}", local, e);
                break;
            }
        }
    }
    info!("Listener on {} closed", local);
}

/// Return true if a given error, when received from accept, means the
/// listener can't go on.
fn accept_err_is_fatal(err: &std::io::Error) -> bool {
    #![allow(clippy::match_like_matches_macro)]

    // Running out of file descriptors is transient: connections close and
    // descriptors come back. EMFILE and ENFILE aren't distinguished by
    // ErrorKind, so check OS errors.
    match err.raw_os_error() {
        #[cfg(unix)]
        Some(libc::EMFILE) | Some(libc::ENFILE) => false,
        _ => true,
    }
}
