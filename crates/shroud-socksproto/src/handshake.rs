//! The proxy-side SOCKS5 negotiation state machine.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{Buf, BytesMut};

use crate::err::Error;
use crate::msg::{SocksAddr, SocksCmd, SocksStatus};
use crate::{Result, SOCKS_VERSION};

/// The authentication method "no authentication required".
const NO_AUTH: u8 = 0x00;
/// The method-selection reply meaning "none of your methods are acceptable".
const NO_ACCEPTABLE_METHOD: u8 = 0xFF;

/// How far along a SOCKS5 negotiation has gotten.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum Status {
    /// Waiting for the client's method-selection greeting.
    WaitingMethods,
    /// Methods negotiated; waiting for the CONNECT request.
    WaitingRequest,
    /// The request has been parsed; the target address is known.
    HaveAddress,
    /// A final reply has been sent; the negotiation is over.
    SentReply,
}

/// The result of feeding bytes to [`SocksProxyHandshake::handle`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum Outcome {
    /// We made progress, and may have appended reply bytes to the output
    /// buffer. Check [`SocksProxyHandshake::status`] to see where we are.
    Good,
    /// There weren't enough input bytes to make progress; call again once
    /// more data has arrived. Nothing was consumed.
    Incomplete,
}

/// State for the proxy side of a single SOCKS5 negotiation.
///
/// This object never does I/O: [`handle`](SocksProxyHandshake::handle)
/// consumes request bytes from a caller-supplied input buffer and appends
/// reply bytes to a caller-supplied output buffer. Once the status reaches
/// [`Status::HaveAddress`], the caller connects (or fails to connect) on the
/// client's behalf, records the result with
/// [`set_address`](SocksProxyHandshake::set_address), and finishes the
/// negotiation with [`send_reply`](SocksProxyHandshake::send_reply).
#[derive(Clone, Debug)]
pub struct SocksProxyHandshake {
    /// Where we are in the negotiation.
    status: Status,
    /// The target the client asked us to connect to, once known.
    target: Option<(SocksAddr, u16)>,
    /// The address we actually connected to, as reported by the caller.
    bound: Option<SocketAddr>,
}

impl Default for SocksProxyHandshake {
    fn default() -> Self {
        Self::new()
    }
}

impl SocksProxyHandshake {
    /// Construct a handshake in its initial state.
    pub fn new() -> Self {
        SocksProxyHandshake {
            status: Status::WaitingMethods,
            target: None,
            bound: None,
        }
    }

    /// Return the current negotiation status.
    pub fn status(&self) -> Status {
        self.status
    }

    /// Try to advance the negotiation, consuming bytes from `input` and
    /// appending any reply bytes to `output`.
    ///
    /// On [`Outcome::Incomplete`] nothing was consumed and the caller should
    /// wait for more input. Errors are unrecoverable: depending on
    /// [`Error::reply_expected`] the caller either flushes a pending
    /// negative reply and closes, or just closes.
    ///
    /// # Panics
    ///
    /// Calling this after a reply has been sent is a programming bug, and
    /// panics.
    pub fn handle(&mut self, input: &mut BytesMut, output: &mut BytesMut) -> Result<Outcome> {
        match self.status {
            Status::WaitingMethods => self.handle_methods(input, output),
            Status::WaitingRequest => self.handle_request(input),
            // The caller has everything it needs; nothing to parse.
            Status::HaveAddress => Ok(Outcome::Good),
            Status::SentReply => panic!("SOCKS handshake re-entered after the reply was sent"),
        }
    }

    /// Parse the method-selection greeting and reply to it.
    fn handle_methods(&mut self, input: &mut BytesMut, output: &mut BytesMut) -> Result<Outcome> {
        if input.len() < 2 {
            return Ok(Outcome::Incomplete);
        }
        let version = input[0];
        let n_methods = usize::from(input[1]);
        if version != SOCKS_VERSION {
            return Err(Error::BadProtocol(version));
        }
        if input.len() < 2 + n_methods {
            return Ok(Outcome::Incomplete);
        }
        let noauth_offered = input[2..2 + n_methods].contains(&NO_AUTH);
        input.advance(2 + n_methods);

        if noauth_offered {
            output.extend_from_slice(&[SOCKS_VERSION, NO_AUTH]);
            self.status = Status::WaitingRequest;
            Ok(Outcome::Good)
        } else {
            output.extend_from_slice(&[SOCKS_VERSION, NO_ACCEPTABLE_METHOD]);
            Err(Error::NoAuthAccepted)
        }
    }

    /// Parse the client's request and record the target address.
    fn handle_request(&mut self, input: &mut BytesMut) -> Result<Outcome> {
        if input.len() < 4 {
            return Ok(Outcome::Incomplete);
        }
        let version = input[0];
        let command = SocksCmd::from(input[1]);
        let reserved = input[2];
        let addr_type = input[3];
        if version != SOCKS_VERSION {
            return Err(Error::BadProtocol(version));
        }

        // Length of the address portion, including the length byte for
        // hostnames.
        let addr_len = match addr_type {
            0x01 => 4,
            0x04 => 16,
            0x03 => {
                if input.len() < 5 {
                    return Ok(Outcome::Incomplete);
                }
                1 + usize::from(input[4])
            }
            other => return Err(Error::BadAddrType(other)),
        };
        let msg_len = 4 + addr_len + 2;
        if input.len() < msg_len {
            return Ok(Outcome::Incomplete);
        }
        if reserved != 0 {
            return Err(Error::Syntax);
        }

        let addr = match addr_type {
            0x01 => {
                let octets: [u8; 4] = input[4..8].try_into().expect("slice length mismatch");
                SocksAddr::Ip(IpAddr::V4(Ipv4Addr::from(octets)))
            }
            0x04 => {
                let octets: [u8; 16] = input[4..20].try_into().expect("slice length mismatch");
                SocksAddr::Ip(IpAddr::V6(Ipv6Addr::from(octets)))
            }
            0x03 => {
                let host = std::str::from_utf8(&input[5..4 + addr_len])
                    .map_err(|_| Error::BadHostname)?;
                SocksAddr::Hostname(host.to_owned())
            }
            _ => unreachable!("address type already validated"),
        };
        let port = u16::from_be_bytes(
            input[msg_len - 2..msg_len]
                .try_into()
                .expect("slice length mismatch"),
        );
        input.advance(msg_len);

        if command != SocksCmd::CONNECT {
            return Err(Error::NotConnect(command));
        }

        self.target = Some((addr, port));
        self.status = Status::HaveAddress;
        Ok(Outcome::Good)
    }

    /// Return the address and port the client asked to connect to.
    ///
    /// This is `None` until the status reaches [`Status::HaveAddress`].
    pub fn address(&self) -> Option<(&SocksAddr, u16)> {
        self.target.as_ref().map(|(a, p)| (a, *p))
    }

    /// Record the address we actually connected to, for the final reply.
    ///
    /// If this is never called (or the kernel can't tell us the peer
    /// address), the reply carries the all-zeros address, which SOCKS5
    /// permits.
    pub fn set_address(&mut self, bound: SocketAddr) {
        self.bound = Some(bound);
    }

    /// Append the final reply with code `status` to `output`, completing
    /// the negotiation.
    ///
    /// # Panics
    ///
    /// Panics if a reply was already sent; sending two replies is a
    /// programming bug.
    pub fn send_reply(&mut self, output: &mut BytesMut, status: SocksStatus) {
        assert!(
            self.status != Status::SentReply,
            "attempted to send a second SOCKS reply"
        );
        let bound = self
            .bound
            .unwrap_or_else(|| SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0));
        output.extend_from_slice(&[SOCKS_VERSION, status.into(), 0x00]);
        match bound.ip() {
            IpAddr::V4(v4) => {
                output.extend_from_slice(&[0x01]);
                output.extend_from_slice(&v4.octets());
            }
            IpAddr::V6(v6) => {
                output.extend_from_slice(&[0x04]);
                output.extend_from_slice(&v6.octets());
            }
        }
        output.extend_from_slice(&bound.port().to_be_bytes());
        self.status = Status::SentReply;
    }
}
