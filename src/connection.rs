//! Proxy connection handling for X11 clients holding a decoy cookie.
//!
//! This module provides the [`ProxyConnection`] type that owns one client
//! connection and its upstream connection to the genuine X server. The
//! client's setup packet is buffered until complete, checked against the
//! decoy cookie and rewritten with the real one; afterwards traffic is
//! spliced through unchanged.
//!
//! # Architecture
//!
//! ```text
//! Client <-> ProxyConnection <-> X server
//! ```
//!
//! # Security Model
//!
//! - **Clients are untrusted**: the setup packet must present the decoy, or
//!   the connection is dropped with nothing forwarded
//! - **The X server is trusted**: replies are forwarded as-is
//! - **The real cookie only travels towards the X server**

use std::collections::VecDeque;
use std::io::{self, IoSlice, IoSliceMut};
use std::mem::{self, MaybeUninit};
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rustix::net::{
    recvmsg, sendmsg, RecvAncillaryBuffer, RecvAncillaryMessage, RecvFlags,
    SendAncillaryBuffer, SendAncillaryMessage, SendFlags,
};

use xcookie_proxy::{read_and_rewrite_setup, setup_packet_len, XAuthEntry, XAuthError};

// =============================================================================
// Constants and Limits
// =============================================================================

/// Maximum file descriptors accepted per read (libxcb's `XCB_MAX_PASS_FD`).
const MAX_FDS_PER_MESSAGE: usize = 16;

/// Buffer capacity for socket I/O
const SOCKET_BUFFER_SIZE: usize = 4096;

// =============================================================================
// Cookies
// =============================================================================

/// Credentials of one proxied display.
#[derive(Debug)]
pub struct CookiePair {
    /// Handed to clients; what their setup packet must present.
    pub decoy: XAuthEntry,
    /// Substituted before the packet reaches the X server.
    pub real: XAuthEntry,
}

// =============================================================================
// Socket I/O with File Descriptors
// =============================================================================

/// Receive data and file descriptors from a Unix socket.
///
/// # Security
/// - Limits FDs to `MAX_FDS_PER_MESSAGE`
/// - Received FDs are owned and closed on drop unless forwarded
fn recv_with_fds(
    socket: &UnixStream,
    buf: &mut [u8],
    fds: &mut VecDeque<OwnedFd>,
) -> io::Result<usize> {
    let mut cmsg_space = [MaybeUninit::uninit(); rustix::cmsg_space!(ScmRights(MAX_FDS_PER_MESSAGE))];
    let mut cmsg_buffer = RecvAncillaryBuffer::new(&mut cmsg_space);
    let mut iov = [IoSliceMut::new(buf)];

    let msg = recvmsg(socket.as_fd(), &mut iov[..], &mut cmsg_buffer, RecvFlags::DONTWAIT)?;

    for cmsg in cmsg_buffer.drain() {
        if let RecvAncillaryMessage::ScmRights(received_fds) = cmsg {
            for fd in received_fds {
                log::trace!("[FD] Received fd={}", fd.as_raw_fd());
                fds.push_back(fd);
            }
        }
    }

    if msg.bytes > 0 {
        log::trace!("[RECV] {} bytes, {} fds pending", msg.bytes, fds.len());
    }

    Ok(msg.bytes)
}

/// Send data and any pending file descriptors to a Unix socket.
///
/// Pending FDs ride along with the first byte sent and are closed locally
/// once the kernel has duplicated them for the receiver.
fn send_with_fds(
    socket: &UnixStream,
    buf: &[u8],
    fds: &mut VecDeque<OwnedFd>,
) -> io::Result<usize> {
    let iov = [IoSlice::new(buf)];

    if fds.is_empty() {
        // Fast path: no FDs to send
        let mut empty_cmsg = [];
        let mut cmsg_buffer = SendAncillaryBuffer::new(&mut empty_cmsg);
        let result = sendmsg(socket.as_fd(), &iov, &mut cmsg_buffer, SendFlags::DONTWAIT)?;
        log::trace!("[SEND] {} bytes (no fds)", result);
        return Ok(result);
    }

    let fd_count = fds.len();
    let borrowed: Vec<BorrowedFd<'_>> = fds.iter().map(|fd| fd.as_fd()).collect();

    let mut cmsg_space = vec![MaybeUninit::uninit(); rustix::cmsg_space!(ScmRights(borrowed.len()))];
    let mut cmsg_buffer = SendAncillaryBuffer::new(&mut cmsg_space);
    cmsg_buffer.push(SendAncillaryMessage::ScmRights(&borrowed));

    let result = sendmsg(socket.as_fd(), &iov, &mut cmsg_buffer, SendFlags::DONTWAIT)?;

    drop(cmsg_buffer);
    drop(borrowed);
    fds.clear();

    log::trace!("[SEND] {} bytes, {} fds", result, fd_count);
    Ok(result)
}

/// Send as much of `pending` as the socket accepts, leaving the rest queued
/// for the next poll.
fn flush_pending(
    socket: &UnixStream,
    pending: &mut Vec<u8>,
    fds: &mut VecDeque<OwnedFd>,
) -> io::Result<()> {
    while !pending.is_empty() {
        match send_with_fds(socket, pending, fds) {
            Ok(0) => {
                return Err(io::Error::new(io::ErrorKind::WriteZero, "peer stopped reading"));
            }
            Ok(n) => {
                pending.drain(..n);
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                log::trace!("[SEND] Peer busy, {} bytes queued", pending.len());
                return Ok(());
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

// =============================================================================
// Proxy Connection
// =============================================================================

enum Phase {
    /// Buffering the client's setup packet.
    AwaitingSetup,
    /// Setup accepted; bytes pass through unchanged.
    Forwarding,
}

/// A proxy connection between an X11 client and the genuine X server.
///
/// # Responsibilities
///
/// 1. Buffer the client's setup packet until it is complete
/// 2. Admit it only if it presents the decoy cookie, substituting the real one
/// 3. Forward everything else bidirectionally, file descriptors included
///
/// # Security Considerations
///
/// - The setup packet is parsed defensively (untrusted)
/// - A rejected client never causes a single byte to reach the server
/// - Buffered setup data is bounded by the lengths declared in its header
/// - A side is not read while bytes for its peer are still queued
pub struct ProxyConnection {
    /// Socket to the X11 client
    client: UnixStream,
    /// Socket to the genuine X server
    server: UnixStream,
    /// Decoy expected from the client, real cookie for the server
    cookies: Arc<CookiePair>,
    phase: Phase,
    /// Client bytes received before the setup packet is complete
    setup_buf: Vec<u8>,
    /// Bytes accepted from the client, not yet taken by the server
    to_server: Vec<u8>,
    /// Bytes accepted from the server, not yet taken by the client
    to_client: Vec<u8>,
    /// Pending file descriptors from client
    client_fds: VecDeque<OwnedFd>,
    /// Pending file descriptors from server
    server_fds: VecDeque<OwnedFd>,
    /// Connection ID for logging
    conn_id: u64,
}

/// Global connection counter for logging
static CONN_COUNTER: AtomicU64 = AtomicU64::new(0);

impl ProxyConnection {
    /// Create a new proxy connection.
    ///
    /// # Arguments
    /// * `client_stream` - Socket from the client
    /// * `upstream_path` - Path to the genuine X server socket
    /// * `cookies` - Decoy and real entries of the proxied display
    ///
    /// # Errors
    /// Returns an error if the upstream connection fails.
    pub fn new(
        client_stream: UnixStream,
        upstream_path: &Path,
        cookies: Arc<CookiePair>,
    ) -> io::Result<Self> {
        log::debug!("Connecting to upstream: {}", upstream_path.display());

        let server_stream = UnixStream::connect(upstream_path)?;
        let conn = Self::from_streams(client_stream, server_stream, cookies)?;

        log::info!(
            "[CONN:{}] Established (upstream={})",
            conn.conn_id,
            upstream_path.display()
        );
        Ok(conn)
    }

    /// Wrap an already connected client/server pair.
    fn from_streams(
        client: UnixStream,
        server: UnixStream,
        cookies: Arc<CookiePair>,
    ) -> io::Result<Self> {
        client.set_nonblocking(true)?;
        server.set_nonblocking(true)?;

        Ok(Self {
            client,
            server,
            cookies,
            phase: Phase::AwaitingSetup,
            setup_buf: Vec::with_capacity(SOCKET_BUFFER_SIZE),
            to_server: Vec::new(),
            to_client: Vec::new(),
            client_fds: VecDeque::new(),
            server_fds: VecDeque::new(),
            conn_id: CONN_COUNTER.fetch_add(1, Ordering::Relaxed),
        })
    }

    /// Get the client socket file descriptor (for event loop registration).
    #[inline]
    pub fn client_fd(&self) -> RawFd {
        self.client.as_raw_fd()
    }

    /// Poll the connection for activity.
    ///
    /// # Returns
    /// - `Ok(true)` - Connection is still active
    /// - `Ok(false)` - Connection should be closed
    /// - `Err(_)` - I/O error occurred
    pub fn poll(&mut self) -> io::Result<bool> {
        // Process client → server
        match self.process_client_to_server() {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => {
                log::debug!("[CONN:{}] Client error: {}", self.conn_id, e);
                log::debug!(
                    "[CONN:{}] Setup buffer: {} bytes, pending fds: {} client / {} server",
                    self.conn_id,
                    self.setup_buf.len(),
                    self.client_fds.len(),
                    self.server_fds.len()
                );
                return Ok(false);
            }
        }

        // Process server → client
        match self.process_server_to_client() {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => {
                log::debug!("[CONN:{}] Server error: {}", self.conn_id, e);
                return Ok(false);
            }
        }

        Ok(true)
    }

    /// Process data from client to server.
    fn process_client_to_server(&mut self) -> io::Result<()> {
        flush_pending(&self.server, &mut self.to_server, &mut self.client_fds)?;
        if !self.to_server.is_empty() {
            return Ok(());
        }

        let mut buf = [0u8; SOCKET_BUFFER_SIZE];
        let n = recv_with_fds(&self.client, &mut buf, &mut self.client_fds)?;

        if n == 0 {
            log::debug!("[CONN:{}] Client closed the connection", self.conn_id);
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "client closed"));
        }

        match self.phase {
            Phase::Forwarding => {
                self.to_server.extend_from_slice(&buf[..n]);
                flush_pending(&self.server, &mut self.to_server, &mut self.client_fds)
            }
            Phase::AwaitingSetup => {
                self.setup_buf.extend_from_slice(&buf[..n]);
                self.try_complete_setup()
            }
        }
    }

    /// Rewrite and forward the setup packet once it is fully buffered.
    fn try_complete_setup(&mut self) -> io::Result<()> {
        let packet_len = match setup_packet_len(&self.setup_buf) {
            Ok(Some(len)) if self.setup_buf.len() >= len => len,
            Ok(_) => {
                log::trace!(
                    "[CONN:{}] Setup incomplete: have {} bytes",
                    self.conn_id,
                    self.setup_buf.len()
                );
                return Ok(());
            }
            Err(e) => return Err(self.reject(e)),
        };

        let mut setup = mem::take(&mut self.setup_buf);
        let trailing = setup.split_off(packet_len);

        let cookies = Arc::clone(&self.cookies);
        let packet = read_and_rewrite_setup(&mut &setup[..], &cookies.decoy, &cookies.real)
            .map_err(|e| self.reject(e))?;

        self.to_server.extend_from_slice(&packet);
        self.to_server.extend_from_slice(&trailing);
        self.phase = Phase::Forwarding;
        flush_pending(&self.server, &mut self.to_server, &mut self.client_fds)?;

        log::info!(
            "[CONN:{}] Client admitted with decoy cookie for {}",
            self.conn_id,
            cookies.real.display()
        );
        Ok(())
    }

    /// Log a failed setup and turn it into the error that closes the
    /// connection.
    fn reject(&self, err: XAuthError) -> io::Error {
        let kind = match err {
            XAuthError::AccessDenied(_) => {
                log::warn!(
                    "[CONN:{}] Rejected client presenting a foreign cookie: {}",
                    self.conn_id,
                    err
                );
                io::ErrorKind::PermissionDenied
            }
            _ => {
                log::warn!("[CONN:{}] Rejected setup: {}", self.conn_id, err);
                io::ErrorKind::InvalidData
            }
        };
        io::Error::new(kind, err)
    }

    /// Process data from server to client (passthrough).
    fn process_server_to_client(&mut self) -> io::Result<()> {
        flush_pending(&self.client, &mut self.to_client, &mut self.server_fds)?;
        if !self.to_client.is_empty() {
            return Ok(());
        }

        let mut buf = [0u8; SOCKET_BUFFER_SIZE];
        let n = recv_with_fds(&self.server, &mut buf, &mut self.server_fds)?;

        if n == 0 {
            log::debug!("[CONN:{}] Server closed the connection", self.conn_id);
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "server closed"));
        }

        // Forward directly to client - we trust the X server
        self.to_client.extend_from_slice(&buf[..n]);
        flush_pending(&self.client, &mut self.to_client, &mut self.server_fds)?;

        log::trace!("[CONN:{}] Server -> Client: {} bytes", self.conn_id, n);

        Ok(())
    }
}

impl Drop for ProxyConnection {
    fn drop(&mut self) {
        log::debug!(
            "[CONN:{}] Closing ({} + {} bytes, {} client fds, {} server fds undelivered)",
            self.conn_id,
            self.to_server.len(),
            self.to_client.len(),
            self.client_fds.len(),
            self.server_fds.len()
        );
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::time::Duration;
    use xcookie_proxy::{encode_setup_packet, ByteOrder, Display};

    fn cookies() -> Arc<CookiePair> {
        let real = XAuthEntry::new_random(Display::unix(0));
        let decoy = real.decoy();
        Arc::new(CookiePair { decoy, real })
    }

    /// (app, xserver, connection): the test plays both outer ends.
    fn harness(cookies: &Arc<CookiePair>) -> (UnixStream, UnixStream, ProxyConnection) {
        let (app, client_side) = UnixStream::pair().unwrap();
        let (server_side, xserver) = UnixStream::pair().unwrap();
        xserver.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        app.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let conn = ProxyConnection::from_streams(client_side, server_side, Arc::clone(cookies)).unwrap();
        (app, xserver, conn)
    }

    fn assert_nothing_forwarded(xserver: &UnixStream) {
        xserver.set_nonblocking(true).unwrap();
        let mut buf = [0u8; 64];
        match (&*xserver).read(&mut buf) {
            Err(e) => assert_eq!(e.kind(), io::ErrorKind::WouldBlock),
            // The proxy side may already be closed, which reads as EOF.
            Ok(n) => assert_eq!(n, 0, "forwarded {n} bytes"),
        }
    }

    #[test]
    fn test_decoy_setup_reaches_server_rewritten() {
        let cookies = cookies();
        let (mut app, mut xserver, mut conn) = harness(&cookies);

        let setup = encode_setup_packet(&cookies.decoy, ByteOrder::LittleEndian).unwrap();
        app.write_all(&setup).unwrap();
        app.write_all(b"req1").unwrap();
        assert!(conn.poll().unwrap());

        let expected = encode_setup_packet(&cookies.real, ByteOrder::LittleEndian).unwrap();
        let mut got = vec![0u8; expected.len() + 4];
        xserver.read_exact(&mut got).unwrap();
        assert_eq!(&got[..expected.len()], &expected[..]);
        assert_eq!(&got[expected.len()..], b"req1");

        xserver.write_all(b"reply").unwrap();
        assert!(conn.poll().unwrap());
        let mut reply = [0u8; 5];
        app.read_exact(&mut reply).unwrap();
        assert_eq!(&reply, b"reply");
    }

    #[test]
    fn test_setup_split_across_reads() {
        let cookies = cookies();
        let (mut app, mut xserver, mut conn) = harness(&cookies);

        let setup = encode_setup_packet(&cookies.decoy, ByteOrder::BigEndian).unwrap();
        app.write_all(&setup[..5]).unwrap();
        assert!(conn.poll().unwrap());
        app.write_all(&setup[5..20]).unwrap();
        assert!(conn.poll().unwrap());
        app.write_all(&setup[20..]).unwrap();
        assert!(conn.poll().unwrap());

        let expected = encode_setup_packet(&cookies.real, ByteOrder::BigEndian).unwrap();
        let mut got = vec![0u8; expected.len()];
        xserver.read_exact(&mut got).unwrap();
        assert_eq!(got, expected);
    }

    #[test]
    fn test_stalled_server_does_not_block_poll() {
        let cookies = cookies();
        let (mut app, mut xserver, mut conn) = harness(&cookies);

        let setup = encode_setup_packet(&cookies.decoy, ByteOrder::LittleEndian).unwrap();
        app.write_all(&setup).unwrap();
        assert!(conn.poll().unwrap());
        let mut forwarded_setup = vec![0u8; setup.len()];
        xserver.read_exact(&mut forwarded_setup).unwrap();

        let payload: Vec<u8> = (0..4 * 1024 * 1024).map(|i| (i % 251) as u8).collect();
        let writer = {
            let payload = payload.clone();
            std::thread::spawn(move || {
                app.write_all(&payload).unwrap();
                app
            })
        };

        // The server reads nothing; polling must still return promptly.
        let started = std::time::Instant::now();
        for _ in 0..200 {
            assert!(conn.poll().unwrap());
        }
        assert!(started.elapsed() < Duration::from_secs(5));

        xserver.set_nonblocking(true).unwrap();
        let mut received = Vec::with_capacity(payload.len());
        let mut buf = [0u8; SOCKET_BUFFER_SIZE];
        let deadline = std::time::Instant::now() + Duration::from_secs(20);
        while received.len() < payload.len() {
            assert!(std::time::Instant::now() < deadline, "stalled at {} bytes", received.len());
            assert!(conn.poll().unwrap());
            loop {
                match xserver.read(&mut buf) {
                    Ok(0) => panic!("proxy closed the server side"),
                    Ok(n) => received.extend_from_slice(&buf[..n]),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) => panic!("read failed: {e}"),
                }
            }
        }
        assert!(received == payload);
        drop(writer.join().unwrap());
    }

    #[test]
    fn test_foreign_cookie_closes_connection() {
        let cookies = cookies();
        let (mut app, xserver, mut conn) = harness(&cookies);

        let other = XAuthEntry::new_random(Display::unix(0));
        let setup = encode_setup_packet(&other, ByteOrder::LittleEndian).unwrap();
        app.write_all(&setup).unwrap();

        assert!(!conn.poll().unwrap());
        assert_nothing_forwarded(&xserver);
    }

    #[test]
    fn test_real_cookie_from_client_is_rejected() {
        let cookies = cookies();
        let (mut app, xserver, mut conn) = harness(&cookies);

        let setup = encode_setup_packet(&cookies.real, ByteOrder::LittleEndian).unwrap();
        app.write_all(&setup).unwrap();

        assert!(!conn.poll().unwrap());
        assert_nothing_forwarded(&xserver);
    }

    #[test]
    fn test_bad_byte_order_closes_connection() {
        let cookies = cookies();
        let (mut app, xserver, mut conn) = harness(&cookies);

        app.write_all(&[b'?'; 12]).unwrap();
        assert!(!conn.poll().unwrap());
        assert_nothing_forwarded(&xserver);
    }

    #[test]
    fn test_client_hangup_before_setup() {
        let cookies = cookies();
        let (app, xserver, mut conn) = harness(&cookies);

        drop(app);
        assert!(!conn.poll().unwrap());
        assert_nothing_forwarded(&xserver);
    }
}
