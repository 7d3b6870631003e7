#![cfg_attr(docsrs, feature(doc_cfg))]
#![doc = include_str!("../README.md")]
// @@ begin lint list @@
#![allow(renamed_and_removed_lints)]
#![allow(unknown_lints)]
#![warn(missing_docs)]
#![warn(noop_method_call)]
#![warn(unreachable_pub)]
#![warn(clippy::all)]
#![deny(clippy::await_holding_lock)]
#![deny(clippy::cargo_common_metadata)]
#![deny(clippy::cast_lossless)]
#![deny(clippy::checked_conversions)]
#![warn(clippy::cognitive_complexity)]
#![deny(clippy::debug_assert_with_mut_call)]
#![deny(clippy::exhaustive_enums)]
#![deny(clippy::exhaustive_structs)]
#![deny(clippy::expl_impl_clone_on_copy)]
#![deny(clippy::fallible_impl_from)]
#![deny(clippy::implicit_clone)]
#![deny(clippy::large_stack_arrays)]
#![warn(clippy::manual_ok_or)]
#![deny(clippy::missing_docs_in_private_items)]
#![warn(clippy::needless_borrow)]
#![warn(clippy::needless_pass_by_value)]
#![warn(clippy::option_option)]
#![deny(clippy::print_stderr)]
#![deny(clippy::print_stdout)]
#![warn(clippy::rc_buffer)]
#![deny(clippy::ref_option_ref)]
#![warn(clippy::semicolon_if_nothing_returned)]
#![warn(clippy::trait_duplication_in_bounds)]
#![deny(clippy::unnecessary_wraps)]
#![warn(clippy::unseparated_literal_suffix)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::mod_module_files)]
#![allow(clippy::let_unit_value)] // This can reasonably be done for explicitness
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::significant_drop_in_scrutinee)]
#![allow(clippy::result_large_err)]
#![allow(clippy::needless_raw_string_hashes)] // complained-about code is fine, often best
//! <!-- @@ end lint list @@ -->

mod dummy;
mod scramble;

use std::fmt;
use std::str::FromStr;

use bytes::BytesMut;
use thiserror::Error;

pub use dummy::Dummy;
pub use scramble::Scramble;

/// Which end of an obfuscated link a protocol instance serves.
///
/// The initiator is the side that dialed the obfuscated connection (a
/// shroud client); the responder accepted it (a shroud server).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[allow(clippy::exhaustive_enums)]
pub enum Endpoint {
    /// The dialing side of the obfuscated link.
    Initiator,
    /// The accepting side of the obfuscated link.
    Responder,
}

/// The result of a successful [`Protocol::recv`] call.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[allow(clippy::exhaustive_enums)]
pub enum RecvOutcome {
    /// Progress was made (possibly none, if more wire bytes are needed).
    Good,
    /// The protocol wants to transmit bytes in the reverse direction right
    /// away (a protocol-level acknowledgment, say). The caller must follow
    /// up with a [`Protocol::send`] call in the same turn, even if there is
    /// no pending plaintext.
    SendPending,
}

/// An error from an obfuscation protocol.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum ProtoError {
    /// The configuration named a protocol we don't have.
    #[error("Unrecognized protocol {0:?}")]
    Unrecognized(String),

    /// The incoming wire data did not decode as this protocol.
    #[error("Malformed {protocol} stream: {detail}")]
    Malformed {
        /// Which protocol was decoding.
        protocol: &'static str,
        /// What was wrong with the data.
        detail: &'static str,
    },
}

/// A per-connection obfuscation protocol instance.
///
/// The engine creates one instance per connection from a [`ProtocolSpec`],
/// calls [`handshake`](Protocol::handshake) exactly once before any
/// application data flows, and then uses [`send`](Protocol::send) and
/// [`recv`](Protocol::recv) as the two data pumps. A protocol is the sole
/// producer of bytes on the obfuscated side of a connection and the sole
/// consumer of bytes from it.
///
/// All methods consume from the front of their input buffer and append to
/// their output buffer; a protocol may leave bytes unconsumed if it needs
/// more data to make progress.
pub trait Protocol: Send + Sync {
    /// Append this protocol's handshake prelude, if any, to `out`.
    ///
    /// Called once per connection, before any call to `send` or `recv`.
    fn handshake(&mut self, out: &mut BytesMut) -> Result<(), ProtoError>;

    /// Consume plaintext from `input` and append its over-the-wire form to
    /// `out`.
    fn send(&mut self, input: &mut BytesMut, out: &mut BytesMut) -> Result<(), ProtoError>;

    /// Consume wire bytes from `input` and append recovered plaintext to
    /// `out`.
    fn recv(
        &mut self,
        input: &mut BytesMut,
        out: &mut BytesMut,
    ) -> Result<RecvOutcome, ProtoError>;
}

/// A parsed protocol configuration.
///
/// This is the engine's view of the protocol-specific part of a listener's
/// configuration: it knows how to build one fresh [`Protocol`] instance per
/// connection.
#[derive(Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum ProtocolSpec {
    /// The transparent passthrough protocol.
    Dummy,
    /// The seeded keystream whitening protocol.
    Scramble,
}

impl ProtocolSpec {
    /// Build a per-connection protocol instance for the given endpoint.
    pub fn build(&self, endpoint: Endpoint) -> Result<Box<dyn Protocol>, ProtoError> {
        Ok(match self {
            ProtocolSpec::Dummy => Box::new(Dummy::new()),
            ProtocolSpec::Scramble => Box::new(Scramble::new(endpoint)),
        })
    }
}

impl FromStr for ProtocolSpec {
    type Err = ProtoError;

    fn from_str(s: &str) -> Result<Self, ProtoError> {
        match s {
            "dummy" => Ok(ProtocolSpec::Dummy),
            "scramble" => Ok(ProtocolSpec::Scramble),
            other => Err(ProtoError::Unrecognized(other.to_owned())),
        }
    }
}

impl fmt::Display for ProtocolSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolSpec::Dummy => write!(f, "dummy"),
            ProtocolSpec::Scramble => write!(f, "scramble"),
        }
    }
}
