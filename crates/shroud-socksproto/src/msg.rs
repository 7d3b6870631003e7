//! Message types and code points used in SOCKS5 negotiation.

use std::fmt;
use std::net::IpAddr;

use caret::caret_int;

caret_int! {
    /// A command from a SOCKS5 request.
    pub struct SocksCmd(u8) {
        /// Connect to a remote TCP address:port.
        CONNECT = 1,
        /// Bind a local port and wait for a connection. (Unsupported.)
        BIND = 2,
        /// Relay UDP datagrams. (Unsupported.)
        UDP_ASSOCIATE = 3,
    }
}

caret_int! {
    /// A reply code to send in response to a SOCKS5 request.
    pub struct SocksStatus(u8) {
        /// The request succeeded.
        SUCCEEDED = 0x00,
        /// Something went wrong that has no more specific code.
        GENERAL_FAILURE = 0x01,
        /// The request was denied by local policy.
        NOT_ALLOWED = 0x02,
        /// The target network is unreachable.
        NETWORK_UNREACHABLE = 0x03,
        /// The target host is unreachable.
        HOST_UNREACHABLE = 0x04,
        /// The target refused the connection.
        CONNECTION_REFUSED = 0x05,
        /// The connection attempt expired.
        TTL_EXPIRED = 0x06,
        /// The command is not supported.
        COMMAND_NOT_SUPPORTED = 0x07,
        /// The address type is not supported.
        ADDRTYPE_NOT_SUPPORTED = 0x08,
    }
}

/// A target address from a SOCKS5 CONNECT request.
///
/// SOCKS lets the client name its target either as a literal IP address
/// or as a hostname to be resolved by the proxy.
#[derive(Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum SocksAddr {
    /// A literal IPv4 or IPv6 address.
    Ip(IpAddr),
    /// A hostname for the proxy to resolve.
    Hostname(String),
}

impl fmt::Display for SocksAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SocksAddr::Ip(a) => write!(f, "{}", a),
            SocksAddr::Hostname(h) => write!(f, "{}", h),
        }
    }
}
