//! Declare an error type for shroud-socksproto.

use thiserror::Error;

use crate::msg::SocksCmd;

/// An error that occurs while negotiating a SOCKS handshake.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// The peer spoke something that isn't SOCKS5 at all.
    ///
    /// The argument is the version byte we actually received.
    #[error("Peer asked for SOCKS version {0}, not 5")]
    BadProtocol(u8),

    /// The peer offered no authentication method that we accept.
    ///
    /// A negative method-selection reply has already been appended to the
    /// output buffer; the caller should flush it and close.
    #[error("No acceptable SOCKS authentication method (only NOAUTH is supported)")]
    NoAuthAccepted,

    /// The request was syntactically valid SOCKS5, but the command was not
    /// CONNECT.
    ///
    /// The caller must send a "command not supported" reply and close.
    #[error("SOCKS command {0} is not CONNECT")]
    NotConnect(SocksCmd),

    /// The request named an address type we don't recognize.
    #[error("Unrecognized SOCKS address type {0}")]
    BadAddrType(u8),

    /// The hostname in the request was not valid UTF-8.
    #[error("Hostname in SOCKS request was not UTF-8")]
    BadHostname,

    /// Some other syntactic problem in a SOCKS message.
    #[error("Malformed SOCKS message")]
    Syntax,
}

impl Error {
    /// Return true if this error leaves a negative reply in the caller's
    /// output buffer, or entitles the caller to send one.
    ///
    /// When this is false the peer wasn't speaking SOCKS at all, and the
    /// right response is to hang up without replying.
    pub fn reply_expected(&self) -> bool {
        match self {
            Error::BadProtocol(_) | Error::Syntax | Error::BadHostname => false,
            Error::NoAuthAccepted | Error::NotConnect(_) | Error::BadAddrType(_) => true,
        }
    }
}
