//! A buffered, event-driven byte-stream channel over one TCP socket.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncWrite, AsyncWriteExt as _};
use tokio::net::TcpStream;
use tokio_util::io::poll_read_buf;

/// How much spare read capacity to keep available per poll.
//
// Large enough to drain a typical socket buffer in few syscalls, small
// enough not to matter per connection.
const READ_CHUNK: usize = 16 * 1024;

/// Something that happened on a channel.
#[derive(Debug)]
pub(crate) enum Activity {
    /// New bytes were appended to the read buffer.
    Read(usize),
    /// The write buffer just became empty.
    Drained,
    /// The peer half-closed; no more bytes will ever arrive.
    Eof,
}

/// One end of a TCP connection, with explicit read and write buffers.
///
/// A channel wraps exactly one socket and owns it; dropping the channel
/// closes the socket. Reading can be switched off, which stops draining
/// the kernel's receive queue and so exerts TCP backpressure on the peer.
/// Writing happens whenever the write buffer is non-empty.
///
/// The channel does not decide what any bytes mean. The connection that
/// owns it reads events out of [`next_event`](Channel::next_event) and
/// moves bytes between the buffers and the obfuscation protocol.
#[derive(Debug)]
pub(crate) struct Channel {
    /// The underlying socket.
    stream: TcpStream,
    /// Incoming bytes not yet consumed.
    pub(crate) rd: BytesMut,
    /// Outgoing bytes not yet written to the kernel.
    pub(crate) wr: BytesMut,
    /// Whether we currently drain the kernel's receive queue.
    read_enabled: bool,
    /// Set once the peer has half-closed or the read side failed.
    saw_eof: bool,
}

impl Channel {
    /// Wrap an already-connected socket.
    ///
    /// The read side starts out disabled.
    pub(crate) fn new(stream: TcpStream) -> Self {
        Channel {
            stream,
            rd: BytesMut::new(),
            wr: BytesMut::new(),
            read_enabled: false,
            saw_eof: false,
        }
    }

    /// Open a new connection to `addr` and wrap it.
    pub(crate) async fn connect(addr: SocketAddr) -> io::Result<Self> {
        Ok(Channel::new(TcpStream::connect(addr).await?))
    }

    /// Report the address of the socket's peer.
    pub(crate) fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.stream.peer_addr()
    }

    /// Switch the read side on or off.
    pub(crate) fn set_read_enabled(&mut self, on: bool) {
        self.read_enabled = on;
    }

    /// Return true if there are unwritten bytes queued.
    pub(crate) fn has_pending_write(&self) -> bool {
        !self.wr.is_empty()
    }

    /// Wait for the next event on this channel.
    ///
    /// Pending writes are always attempted first; reads happen only while
    /// the read side is enabled. This is cancel-safe: all state lives in
    /// the buffers, so a dropped call loses nothing.
    pub(crate) async fn next_event(&mut self) -> io::Result<Activity> {
        std::future::poll_fn(|cx| self.poll_event(cx)).await
    }

    /// Try to make progress writing, then reading.
    fn poll_event(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<Activity>> {
        while !self.wr.is_empty() {
            match Pin::new(&mut self.stream).poll_write(cx, &self.wr) {
                Poll::Ready(Ok(0)) => {
                    return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
                }
                Poll::Ready(Ok(n)) => {
                    self.wr.advance(n);
                    if self.wr.is_empty() {
                        return Poll::Ready(Ok(Activity::Drained));
                    }
                }
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => break,
            }
        }
        if self.read_enabled && !self.saw_eof {
            self.rd.reserve(READ_CHUNK);
            match poll_read_buf(Pin::new(&mut self.stream), cx, &mut self.rd) {
                Poll::Ready(Ok(0)) => {
                    self.saw_eof = true;
                    return Poll::Ready(Ok(Activity::Eof));
                }
                Poll::Ready(Ok(n)) => return Poll::Ready(Ok(Activity::Read(n))),
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => {}
            }
        }
        Poll::Pending
    }

    /// Write until the write buffer is empty.
    pub(crate) async fn flush(&mut self) -> io::Result<()> {
        while !self.wr.is_empty() {
            let n = self.stream.write(&self.wr).await?;
            if n == 0 {
                return Err(io::ErrorKind::WriteZero.into());
            }
            self.wr.advance(n);
        }
        Ok(())
    }

    /// Flush everything queued, then send a FIN.
    ///
    /// The peer sees end-of-stream only after all buffered bytes.
    pub(crate) async fn shutdown_write(&mut self) -> io::Result<()> {
        self.flush().await?;
        self.stream.shutdown().await
    }
}

#[cfg(test)]
mod test {
    // @@ begin test lint list @@
    #![allow(clippy::bool_assert_comparison)]
    #![allow(clippy::clone_on_copy)]
    #![allow(clippy::dbg_macro)]
    #![allow(clippy::mixed_attributes_style)]
    #![allow(clippy::print_stderr)]
    #![allow(clippy::print_stdout)]
    #![allow(clippy::single_char_pattern)]
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::unchecked_time_subtraction)]
    #![allow(clippy::useless_vec)]
    #![allow(clippy::needless_pass_by_value)]
    //! <!-- @@ end test lint list @@ -->

    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    /// Return a connected (channel, raw peer socket) pair over loopback.
    async fn socket_pair() -> (Channel, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, server) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (Channel::new(client.unwrap()), server.unwrap().0)
    }

    #[tokio::test]
    async fn read_event_and_buffer() {
        let (mut ch, mut peer) = socket_pair().await;
        ch.set_read_enabled(true);
        peer.write_all(b"abc").await.unwrap();

        match timeout(Duration::from_secs(5), ch.next_event()).await {
            Ok(Ok(Activity::Read(n))) => assert!(n >= 1),
            other => panic!("unexpected: {:?}", other),
        }
        // Loopback may split arbitrarily; wait for the rest if needed.
        while ch.rd.len() < 3 {
            let _ = timeout(Duration::from_secs(5), ch.next_event()).await.unwrap();
        }
        assert_eq!(&ch.rd[..], b"abc");
    }

    #[tokio::test]
    async fn disabled_read_reports_nothing() {
        let (mut ch, mut peer) = socket_pair().await;
        peer.write_all(b"ignored for now").await.unwrap();

        // Read is off, write buffer empty: no event may surface.
        assert!(
            timeout(Duration::from_millis(100), ch.next_event())
                .await
                .is_err()
        );
        assert!(ch.rd.is_empty());
    }

    #[tokio::test]
    async fn drained_event_after_queued_write() {
        let (mut ch, mut peer) = socket_pair().await;
        ch.wr.extend_from_slice(b"payload");
        match timeout(Duration::from_secs(5), ch.next_event()).await {
            Ok(Ok(Activity::Drained)) => {}
            other => panic!("unexpected: {:?}", other),
        }
        let mut buf = [0_u8; 7];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"payload");
    }

    #[tokio::test]
    async fn eof_event_when_peer_closes() {
        let (mut ch, peer) = socket_pair().await;
        ch.set_read_enabled(true);
        drop(peer);
        loop {
            match timeout(Duration::from_secs(5), ch.next_event()).await.unwrap() {
                Ok(Activity::Eof) => break,
                Ok(Activity::Read(_)) => continue,
                other => panic!("unexpected: {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn shutdown_write_delivers_buffered_bytes_before_fin() {
        let (mut ch, mut peer) = socket_pair().await;
        ch.wr.extend_from_slice(&[0x5a_u8; 100]);
        ch.shutdown_write().await.unwrap();

        let mut buf = Vec::new();
        peer.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, vec![0x5a_u8; 100]);
    }
}
