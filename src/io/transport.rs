//! Byte transports underneath the protocol engine
//!
//! A [`Transport`] moves raw bytes; it knows nothing about framing. The
//! network implementation is [`TcpTransport`]; the in-process one is
//! [`LocalTransport`](crate::io::local::LocalTransport). Both hand out a
//! [`StopHandle`] that reaches the acquisition engine out of band, so a stop
//! can be delivered while the main stream is blocked in a long receive.

use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs, UdpSocket};
use std::time::{Duration, Instant};

use tracing::{debug, info, trace, warn};

use crate::error::{DeError, Result};
use crate::io::config::ClientConfig;
use crate::protocol::codec::{STOP_DATAGRAM, STOP_REPLY};
use crate::simulator::{self, SharedSimulator};

/// Most bytes requested from the socket per read
const RECV_CHUNK: usize = 4 * 1024 * 1024;

/// Raw byte stream to a DE server
pub trait Transport: Send {
    /// Write all bytes
    fn send(&mut self, data: &[u8]) -> Result<()>;

    /// Read exactly `len` bytes, or fewer if `timeout` elapses or the peer
    /// closes the stream
    ///
    /// A short buffer is not an error here; callers compare the length with
    /// what they expected.
    fn recv_exact(&mut self, len: usize, timeout: Duration) -> Result<Vec<u8>>;

    /// Handle for stopping the acquisition from any thread
    fn stop_handle(&self) -> StopHandle;

    /// Human readable peer description for logs
    fn peer(&self) -> String;

    /// Close the stream; further sends fail
    fn shutdown(&mut self) -> Result<()>;
}

/// Out-of-band acquisition stop
///
/// Cheap to clone and `Send`, so it can be moved to a watchdog or UI thread
/// while the owning client blocks in `get_result`.
#[derive(Clone)]
pub enum StopHandle {
    /// Send the stop datagram to the server's UDP port
    Udp {
        target: SocketAddr,
        reply_timeout: Duration,
    },
    /// Stop an in-process simulator directly
    Local(SharedSimulator),
}

impl std::fmt::Debug for StopHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StopHandle::Udp { target, .. } => write!(f, "StopHandle::Udp({})", target),
            StopHandle::Local(_) => f.write_str("StopHandle::Local"),
        }
    }
}

impl StopHandle {
    /// Ask the server to stop the running acquisition
    ///
    /// Returns whether the server confirmed with a reply containing
    /// `"Stopped"`. A missing reply within the timeout is `Ok(false)`.
    pub fn send(&self) -> Result<bool> {
        match self {
            StopHandle::Udp {
                target,
                reply_timeout,
            } => {
                let bind: SocketAddr = if target.is_ipv4() {
                    ([0, 0, 0, 0], 0).into()
                } else {
                    ([0u16; 8], 0).into()
                };
                let socket = UdpSocket::bind(bind)?;
                socket.set_read_timeout(Some(*reply_timeout))?;
                socket.send_to(STOP_DATAGRAM, target)?;
                debug!(target = %target, "Sent stop datagram");

                let mut buf = [0u8; 256];
                match socket.recv_from(&mut buf) {
                    Ok((n, from)) => {
                        let stopped = buf[..n]
                            .windows(STOP_REPLY.len())
                            .any(|w| w == STOP_REPLY);
                        debug!(from = %from, stopped, "Stop reply received");
                        Ok(stopped)
                    }
                    Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                        warn!(target = %target, "No reply to stop datagram");
                        Ok(false)
                    }
                    Err(e) => Err(e.into()),
                }
            }
            StopHandle::Local(shared) => {
                simulator::lock(shared).stop_acquisition();
                Ok(true)
            }
        }
    }
}

/// Blocking TCP transport
pub struct TcpTransport {
    stream: TcpStream,
    peer: SocketAddr,
    stop_reply_timeout: Duration,
}

impl TcpTransport {
    /// Connect to `config.host:config.port`
    ///
    /// Every resolved address is tried in turn. TCP_NODELAY follows
    /// `config.tcp_nodelay`, defaulting to off for loopback peers.
    ///
    /// # Errors
    ///
    /// - [`DeError::Io`] - Resolution failed or no address accepted the connection
    pub fn connect(config: &ClientConfig) -> Result<Self> {
        info!(host = %config.host, port = config.port, "Connecting");

        let mut last_err = None;
        let mut connected = None;
        for addr in (config.host.as_str(), config.port).to_socket_addrs()? {
            let attempt = match config.connect_timeout {
                Some(timeout) => TcpStream::connect_timeout(&addr, timeout),
                None => TcpStream::connect(addr),
            };
            match attempt {
                Ok(stream) => {
                    connected = Some((stream, addr));
                    break;
                }
                Err(e) => {
                    debug!(addr = %addr, error = %e, "Connect attempt failed");
                    last_err = Some(e);
                }
            }
        }
        let (stream, peer) = match connected {
            Some(c) => c,
            None => {
                return Err(last_err
                    .unwrap_or_else(|| {
                        std::io::Error::new(ErrorKind::NotFound, "host resolved to no addresses")
                    })
                    .into())
            }
        };

        let nodelay = config
            .tcp_nodelay
            .unwrap_or_else(|| !peer.ip().is_loopback());
        stream.set_nodelay(nodelay)?;

        let transport = TcpTransport {
            stream,
            peer,
            stop_reply_timeout: config.stop_reply_timeout,
        };
        if let Some(size) = config.recv_buffer_size {
            transport.set_recv_buffer_size(size)?;
        }

        debug!(peer = %peer, nodelay, "Connected");
        Ok(transport)
    }

    /// Request a TCP receive buffer (SO_RCVBUF) of `size` bytes
    ///
    /// Large result frames arrive in one burst; a bigger kernel buffer avoids
    /// stalling the sender while the client copies data out. Returns the size
    /// the kernel granted, which may be capped (`net.core.rmem_max`) or
    /// doubled for bookkeeping on Linux.
    ///
    /// # Errors
    ///
    /// - [`DeError::InvalidParameter`] - `size` does not fit a C `int`
    /// - [`DeError::Io`] - The socket option was refused
    #[cfg(unix)]
    pub fn set_recv_buffer_size(&self, size: usize) -> Result<usize> {
        let requested = libc::c_int::try_from(size).map_err(|_| {
            DeError::InvalidParameter(format!("receive buffer of {} bytes is too large", size))
        })?;
        sockopt::set_int(&self.stream, libc::SOL_SOCKET, libc::SO_RCVBUF, requested)?;
        let granted = self.recv_buffer_size()?;
        if granted < size {
            warn!(requested = size, granted, "Receive buffer capped by the kernel");
        } else {
            debug!(requested = size, granted, "Receive buffer size set");
        }
        Ok(granted)
    }

    /// Current SO_RCVBUF of the socket
    #[cfg(unix)]
    pub fn recv_buffer_size(&self) -> Result<usize> {
        let value = sockopt::get_int(&self.stream, libc::SOL_SOCKET, libc::SO_RCVBUF)?;
        Ok(usize::try_from(value).unwrap_or(0))
    }

    #[cfg(not(unix))]
    pub fn set_recv_buffer_size(&self, size: usize) -> Result<usize> {
        warn!(size, "SO_RCVBUF not supported on this platform");
        Ok(0)
    }

    #[cfg(not(unix))]
    pub fn recv_buffer_size(&self) -> Result<usize> {
        Ok(0)
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.stream.local_addr()?)
    }

    pub fn nodelay(&self) -> Result<bool> {
        Ok(self.stream.nodelay()?)
    }
}

impl Transport for TcpTransport {
    fn send(&mut self, data: &[u8]) -> Result<()> {
        trace!(bytes = data.len(), "Sending");
        self.stream.write_all(data)?;
        self.stream.flush()?;
        Ok(())
    }

    fn recv_exact(&mut self, len: usize, timeout: Duration) -> Result<Vec<u8>> {
        let started = Instant::now();
        // grow with the data actually received, not with the announced length
        let mut buf = Vec::with_capacity(len.min(RECV_CHUNK));
        let mut filled = 0;

        while filled < len {
            let remaining = timeout.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                warn!(
                    expected = len,
                    received = filled,
                    timeout_secs = timeout.as_secs_f64(),
                    "Receive timed out"
                );
                break;
            }
            self.stream.set_read_timeout(Some(remaining))?;

            let want = (len - filled).min(RECV_CHUNK);
            buf.resize(filled + want, 0);
            match self.stream.read(&mut buf[filled..]) {
                Ok(0) => {
                    debug!(expected = len, received = filled, "Peer closed the stream");
                    break;
                }
                Ok(n) => {
                    filled += n;
                    trace!(chunk = n, filled, expected = len, "Received");
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
                    ) =>
                {
                    continue
                }
                Err(e) => return Err(DeError::Io(e)),
            }
        }

        buf.truncate(filled);
        Ok(buf)
    }

    fn stop_handle(&self) -> StopHandle {
        StopHandle::Udp {
            target: self.peer,
            reply_timeout: self.stop_reply_timeout,
        }
    }

    fn peer(&self) -> String {
        self.peer.to_string()
    }

    fn shutdown(&mut self) -> Result<()> {
        match self.stream.shutdown(Shutdown::Both) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Integer socket options on a borrowed descriptor
#[cfg(unix)]
mod sockopt {
    use std::io;
    use std::mem::size_of;
    use std::os::fd::AsRawFd;

    pub(super) fn set_int(
        socket: &impl AsRawFd,
        level: libc::c_int,
        name: libc::c_int,
        value: libc::c_int,
    ) -> io::Result<()> {
        // SAFETY: the descriptor stays open for the borrow of `socket`, and
        // the pointer and length describe `value`, which outlives the call.
        let ret = unsafe {
            libc::setsockopt(
                socket.as_raw_fd(),
                level,
                name,
                (&value as *const libc::c_int).cast(),
                size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if ret == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    pub(super) fn get_int(
        socket: &impl AsRawFd,
        level: libc::c_int,
        name: libc::c_int,
    ) -> io::Result<libc::c_int> {
        let mut value: libc::c_int = 0;
        let mut len = size_of::<libc::c_int>() as libc::socklen_t;
        // SAFETY: as for `set_int`; the kernel writes at most `len` bytes.
        let ret = unsafe {
            libc::getsockopt(
                socket.as_raw_fd(),
                level,
                name,
                (&mut value as *mut libc::c_int).cast(),
                &mut len,
            )
        };
        if ret == 0 {
            Ok(value)
        } else {
            Err(io::Error::last_os_error())
        }
    }
}
