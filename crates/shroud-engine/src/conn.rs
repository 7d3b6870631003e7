//! A single proxied connection: two channels paired through a protocol.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace};

use shroud_obfs::{Protocol, RecvOutcome};
use shroud_socksproto::{
    Error as SocksError, Outcome, SocksAddr, SocksProxyHandshake, SocksStatus, Status,
};

use crate::channel::{Activity, Channel};
use crate::err::ConnError;
use crate::listener::ListenerMode;
use crate::resolve::NetResolver;

/// Stop reading from a side once its peer has this much queued and
/// unwritten. Reading resumes when the queue drains.
const WRITE_HIGH_WATER: usize = 64 * 1024;

/// How long we'll wait for a final negative SOCKS reply to flush, when no
/// idle timeout is configured.
const REPLY_FLUSH_TIMEOUT: Duration = Duration::from_secs(10);

/// Where a connection is in its life.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum State {
    /// SOCKS mode only: parsing the client's greeting and request.
    Negotiating,
    /// Waiting for the outbound connect to finish.
    Connecting,
    /// Shuttling data in both directions.
    Open,
    /// One side is done; draining the survivor's write buffer.
    Flushing,
    /// Both sockets are (about to be) closed.
    Closed,
}

/// One of a connection's two channels.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Side {
    /// The upstream-facing channel, accepted by our listener.
    Input,
    /// The downstream-facing channel, connected by us.
    Output,
}

impl Side {
    /// The side this one is paired with.
    fn other(self) -> Side {
        match self {
            Side::Input => Side::Output,
            Side::Output => Side::Input,
        }
    }
}

/// Where the outbound side of a connection should go.
enum Target {
    /// A literal address, from configuration or a SOCKS request.
    Fixed(SocketAddr),
    /// A hostname from a SOCKS request, to be resolved.
    Named(String, u16),
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Fixed(a) => write!(f, "{}", a),
            Target::Named(h, p) => write!(f, "{}:{}", h, p),
        }
    }
}

/// A live proxied connection.
///
/// Owns the accepted (input) channel, the dialed (output) channel once it
/// exists, the per-connection protocol instance, and, in SOCKS mode, the
/// negotiation state. Everything here is driven by a single task.
pub(crate) struct Connection {
    /// Serial number, for log lines.
    serial: u64,
    /// The mode of the listener that accepted us.
    mode: ListenerMode,
    /// Per-connection obfuscation state.
    proto: Box<dyn Protocol>,
    /// SOCKS negotiation state, between negotiation and the final reply.
    socks: Option<SocksProxyHandshake>,
    /// The channel for the socket our listener accepted.
    input: Channel,
    /// The channel for the socket we dial; absent until connect succeeds.
    output: Option<Channel>,
    /// The fixed target, in the modes that have one.
    target: Option<SocketAddr>,
    /// Close the connection after this much inactivity.
    idle_timeout: Option<Duration>,
    /// Resolver for hostname targets from SOCKS requests.
    resolver: Arc<dyn NetResolver>,
    /// Current lifecycle state.
    state: State,
}

impl Connection {
    /// Wrap a freshly accepted socket as a new connection.
    pub(crate) fn new(
        serial: u64,
        mode: ListenerMode,
        proto: Box<dyn Protocol>,
        stream: TcpStream,
        target: Option<SocketAddr>,
        idle_timeout: Option<Duration>,
        resolver: Arc<dyn NetResolver>,
    ) -> Self {
        let state = match mode {
            ListenerMode::SocksClient => State::Negotiating,
            ListenerMode::SimpleClient | ListenerMode::SimpleServer => State::Connecting,
        };
        Connection {
            serial,
            mode,
            proto,
            socks: None,
            input: Channel::new(stream),
            output: None,
            target,
            idle_timeout,
            resolver,
            state,
        }
    }

    /// Drive this connection until it is finished or force-closed.
    #[instrument(skip_all, level = "trace", fields(conn = self.serial))]
    pub(crate) async fn run(mut self, cancel: CancellationToken) -> Result<(), ConnError> {
        let serial = self.serial;
        tokio::select! {
            r = self.run_inner() => r,
            _ = cancel.cancelled() => {
                // Force-close. Dropping the channels closes both sockets
                // and discards whatever was buffered.
                trace!(conn = serial, "force-closed");
                Ok(())
            }
        }
    }

    /// The connection's whole life, from negotiation to close.
    async fn run_inner(&mut self) -> Result<(), ConnError> {
        let target = match self.mode {
            ListenerMode::SocksClient => {
                let (addr, port) = self.negotiate().await?;
                match addr {
                    SocksAddr::Ip(ip) => Target::Fixed(SocketAddr::new(ip, port)),
                    SocksAddr::Hostname(host) => Target::Named(host, port),
                    _ => unreachable!("unknown SocksAddr variant"),
                }
            }
            ListenerMode::SimpleClient | ListenerMode::SimpleServer => {
                Target::Fixed(self.target.expect("simple modes carry a fixed target"))
            }
        };

        if self.mode == ListenerMode::SimpleServer {
            // The responder's prelude travels back over the link we
            // accepted, ahead of any tunneled data.
            self.proto.handshake(&mut self.input.wr)?;
        }

        self.set_state(State::Connecting);
        self.connect_output(&target).await?;
        trace!(conn = self.serial, "connected to {}", target);

        if self.mode != ListenerMode::SimpleServer {
            let output = self.output.as_mut().expect("output exists after connect");
            self.proto.handshake(&mut output.wr)?;
        }

        if self.socks.is_some() {
            self.finish_socks().await?;
        }

        self.open_loop().await
    }

    /// Run the SOCKS negotiation on the input channel.
    ///
    /// On success, stores the negotiator for the final reply and returns
    /// the requested target. On failure, any owed negative reply has been
    /// flushed before this returns.
    async fn negotiate(&mut self) -> Result<(SocksAddr, u16), ConnError> {
        let mut hs = SocksProxyHandshake::new();
        self.input.set_read_enabled(true);
        let target = loop {
            match hs.handle(&mut self.input.rd, &mut self.input.wr) {
                Ok(Outcome::Good) => {
                    if hs.status() == Status::HaveAddress {
                        let (addr, port) = hs
                            .address()
                            .map(|(a, p)| (a.clone(), p))
                            .expect("no address in HaveAddress status");
                        break (addr, port);
                    }
                }
                Ok(Outcome::Incomplete) => match self.input.next_event().await {
                    Ok(Activity::Read(_) | Activity::Drained) => {}
                    Ok(Activity::Eof) => return Err(ConnError::NegotiationEof),
                    Err(e) => return Err(e.into()),
                },
                Err(e) => {
                    match &e {
                        SocksError::NotConnect(_) => {
                            hs.send_reply(&mut self.input.wr, SocksStatus::COMMAND_NOT_SUPPORTED);
                        }
                        SocksError::BadAddrType(_) => {
                            hs.send_reply(&mut self.input.wr, SocksStatus::ADDRTYPE_NOT_SUPPORTED);
                        }
                        // Anything else either queued its own reply or
                        // doesn't get one.
                        _ => {}
                    }
                    if e.reply_expected() {
                        self.flush_socks_reply().await;
                    }
                    return Err(ConnError::Socks(e));
                }
                Ok(_) => unreachable!("unknown Outcome variant"),
            }
        };
        // No cleartext may flow until the tunnel is up.
        self.input.set_read_enabled(false);
        self.socks = Some(hs);
        Ok(target)
    }

    /// Dial the output side, sending a negative SOCKS reply if that fails
    /// and one is owed.
    async fn connect_output(&mut self, target: &Target) -> Result<(), ConnError> {
        match self.try_connect(target).await {
            Ok(channel) => {
                self.output = Some(channel);
                Ok(())
            }
            Err((status, err)) => {
                if let Some(mut hs) = self.socks.take() {
                    hs.send_reply(&mut self.input.wr, status);
                    self.flush_socks_reply().await;
                }
                Err(err)
            }
        }
    }

    /// Resolve (if needed) and dial each candidate address in turn.
    async fn try_connect(&self, target: &Target) -> Result<Channel, (SocksStatus, ConnError)> {
        let addrs = match target {
            Target::Fixed(a) => vec![*a],
            Target::Named(host, port) => {
                let looked_up = self.resolver.lookup(host, *port).await.and_then(|addrs| {
                    if addrs.is_empty() {
                        Err(io::Error::new(
                            io::ErrorKind::NotFound,
                            "name resolved to no addresses",
                        ))
                    } else {
                        Ok(addrs)
                    }
                });
                match looked_up {
                    Ok(addrs) => addrs,
                    Err(e) => {
                        return Err((
                            SocksStatus::HOST_UNREACHABLE,
                            ConnError::Resolve {
                                host: host.clone(),
                                source: Arc::new(e),
                            },
                        ));
                    }
                }
            }
        };
        let mut last_err = None;
        for addr in addrs {
            match Channel::connect(addr).await {
                Ok(channel) => return Ok(channel),
                Err(e) => last_err = Some(e),
            }
        }
        let e = last_err.expect("no connect attempts were made");
        let status = socks_status_for_io(&e);
        Err((
            status,
            ConnError::Connect {
                target: target.to_string(),
                source: Arc::new(e),
            },
        ))
    }

    /// Send the success reply that completes a SOCKS negotiation.
    async fn finish_socks(&mut self) -> Result<(), ConnError> {
        let mut hs = self.socks.take().expect("finish_socks without a negotiator");
        let output = self.output.as_mut().expect("output exists after connect");
        // If the kernel can't tell us the peer address, the reply falls
        // back to all-zeros, which the protocol permits.
        if let Ok(peer) = output.peer_addr() {
            hs.set_address(peer);
        }
        hs.send_reply(&mut self.input.wr, SocksStatus::SUCCEEDED);
        // The reply must reach the client before anything the tunnel
        // produces does.
        self.input.flush().await?;
        Ok(())
    }

    /// Shuttle data both ways until one side finishes or fails.
    async fn open_loop(&mut self) -> Result<(), ConnError> {
        self.set_state(State::Open);
        self.input.set_read_enabled(true);
        self.output
            .as_mut()
            .expect("open connection without an output channel")
            .set_read_enabled(true);

        // Anything the client pipelined behind its CONNECT request is
        // already sitting in the input read buffer.
        if !self.input.rd.is_empty() {
            self.pump(Side::Input)?;
        }

        loop {
            let event = {
                let idle = self.idle_timeout;
                let input = &mut self.input;
                let output = self
                    .output
                    .as_mut()
                    .expect("open connection without an output channel");
                tokio::select! {
                    r = input.next_event() => Some((Side::Input, r)),
                    r = output.next_event() => Some((Side::Output, r)),
                    _ = sleep_opt(idle), if idle.is_some() => None,
                }
            };
            let Some((side, result)) = event else {
                // Nothing moved for a whole idle window. A flush now would
                // just stall again, so close both sides as they are.
                debug!(conn = self.serial, "closing idle connection");
                self.set_state(State::Closed);
                return Ok(());
            };
            match result {
                Ok(Activity::Read(_)) => {
                    self.pump(side)?;
                    self.apply_backpressure(side);
                }
                Ok(Activity::Drained) => {
                    // Room again; resume reading from the side that was
                    // paused to protect this buffer.
                    self.chan_mut(side.other()).set_read_enabled(true);
                }
                Ok(Activity::Eof) => return self.flush_and_close(side, None).await,
                Err(e) => return self.flush_and_close(side, Some(e)).await,
            }
        }
    }

    /// Move freshly read bytes on `side` through the protocol to its peer.
    fn pump(&mut self, side: Side) -> Result<(), ConnError> {
        let plaintext = self.plaintext_side();
        let output = self
            .output
            .as_mut()
            .expect("pumping without an output channel");
        let input = &mut self.input;
        let proto = &mut self.proto;
        let (from, to) = match side {
            Side::Input => (input, output),
            Side::Output => (output, input),
        };
        if side == plaintext {
            proto.send(&mut from.rd, &mut to.wr)?;
        } else {
            match proto.recv(&mut from.rd, &mut to.wr)? {
                RecvOutcome::Good => {}
                RecvOutcome::SendPending => {
                    // The protocol wants reverse-direction bytes out in
                    // this same turn.
                    proto.send(&mut to.rd, &mut from.wr)?;
                }
            }
        }
        Ok(())
    }

    /// Pause reading from `side` while its peer's write buffer is backed
    /// up past the high-water mark.
    fn apply_backpressure(&mut self, side: Side) {
        let backed_up = self.chan_mut(side.other()).wr.len() >= WRITE_HIGH_WATER;
        if backed_up {
            self.chan_mut(side).set_read_enabled(false);
        }
    }

    /// One side is done for. Drain the survivor's write buffer, half-close
    /// it so the FIN trails the data, and finish.
    async fn flush_and_close(
        &mut self,
        failed: Side,
        err: Option<io::Error>,
    ) -> Result<(), ConnError> {
        if let Some(e) = &err {
            debug!(conn = self.serial, side = ?failed, "channel failed: {}", e);
        }
        // Bytes already read from the failing side still count; push them
        // through the protocol before draining the survivor.
        if !self.chan_mut(failed).rd.is_empty() {
            self.pump(failed)?;
        }
        let survivor = failed.other();
        self.chan_mut(failed).set_read_enabled(false);
        self.chan_mut(survivor).set_read_enabled(false);

        if self.chan_mut(survivor).has_pending_write() {
            self.set_state(State::Flushing);
        }
        let idle = self.idle_timeout;
        let surviving = self.chan_mut(survivor);
        let drained = match idle {
            // A peer that won't take our final bytes within the idle
            // window forfeits them.
            Some(limit) => tokio::time::timeout(limit, surviving.shutdown_write())
                .await
                .unwrap_or(Ok(())),
            None => surviving.shutdown_write().await,
        };
        self.set_state(State::Closed);
        match err {
            Some(e) => Err(ConnError::Io(Arc::new(e))),
            None => drained.map_err(ConnError::from),
        }
    }

    /// Drain the input write buffer so a final SOCKS reply reaches the
    /// client, then half-close toward it.
    async fn flush_socks_reply(&mut self) {
        self.set_state(State::Flushing);
        let limit = self.idle_timeout.unwrap_or(REPLY_FLUSH_TIMEOUT);
        let _ = tokio::time::timeout(limit, self.input.shutdown_write()).await;
        self.set_state(State::Closed);
    }

    /// Note a state transition.
    fn set_state(&mut self, next: State) {
        trace!(conn = self.serial, "{:?} -> {:?}", self.state, next);
        self.state = next;
    }

    /// Which side of this connection faces cleartext.
    fn plaintext_side(&self) -> Side {
        match self.mode {
            ListenerMode::SimpleServer => Side::Output,
            ListenerMode::SimpleClient | ListenerMode::SocksClient => Side::Input,
        }
    }

    /// The channel on a given side.
    ///
    /// # Panics
    ///
    /// Panics if the output channel doesn't exist yet; asking for it
    /// before connecting is a programming bug.
    fn chan_mut(&mut self, side: Side) -> &mut Channel {
        match side {
            Side::Input => &mut self.input,
            Side::Output => self
                .output
                .as_mut()
                .expect("no output channel on this connection yet"),
        }
    }
}

/// Sleep for `d` when present. Guarded off entirely otherwise.
async fn sleep_opt(d: Option<Duration>) {
    match d {
        Some(d) => tokio::time::sleep(d).await,
        None => std::future::pending().await,
    }
}

/// Pick the SOCKS reply code that best describes a socket error.
fn socks_status_for_io(e: &io::Error) -> SocksStatus {
    use io::ErrorKind as EK;
    match e.kind() {
        EK::ConnectionRefused => SocksStatus::CONNECTION_REFUSED,
        EK::HostUnreachable => SocksStatus::HOST_UNREACHABLE,
        EK::NetworkUnreachable => SocksStatus::NETWORK_UNREACHABLE,
        EK::TimedOut => SocksStatus::TTL_EXPIRED,
        EK::AddrNotAvailable | EK::Unsupported => SocksStatus::ADDRTYPE_NOT_SUPPORTED,
        _ => SocksStatus::GENERAL_FAILURE,
    }
}
