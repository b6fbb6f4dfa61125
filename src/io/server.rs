//! Blocking simulator server
//!
//! Serves a [`SharedSimulator`] over TCP with one thread per connection and
//! answers the UDP stop datagram on the same port. All connections share one
//! simulator, so a property written by one client is seen by the others.

use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::thread::{self, JoinHandle};

use tracing::{debug, info, trace, warn};

use crate::error::{DeError, Result};
use crate::protocol::codec::{self, LENGTH_PREFIX_SIZE, STOP_DATAGRAM, STOP_REPLY};
use crate::simulator::{self, SharedSimulator};

/// Largest datagram the stop listener looks at
const DATAGRAM_BUFFER: usize = 1024;

/// Simulator served over TCP, with a UDP stop socket on the same port
pub struct SimulatorServer {
    listener: TcpListener,
    stop_socket: UdpSocket,
    simulator: SharedSimulator,
}

impl SimulatorServer {
    /// Bind the TCP listener, then a UDP socket on the port it got
    ///
    /// Port 0 picks a free port for both.
    ///
    /// # Errors
    ///
    /// - [`DeError::Io`](crate::error::DeError::Io) - Either bind failed
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use deapi::io::SimulatorServer;
    /// use deapi::simulator::Simulator;
    ///
    /// let server = SimulatorServer::bind("127.0.0.1:13241", Simulator::with_defaults()?.into_shared())?;
    /// server.serve()?;
    /// # Ok::<(), deapi::DeError>(())
    /// ```
    pub fn bind(addr: &str, simulator: SharedSimulator) -> Result<Self> {
        info!(addr = %addr, "Binding simulator server");
        let listener = TcpListener::bind(addr)?;
        let local_addr = listener.local_addr()?;
        let stop_socket = UdpSocket::bind(local_addr)?;
        info!(local_addr = %local_addr, "Simulator server listening");
        Ok(SimulatorServer {
            listener,
            stop_socket,
            simulator,
        })
    }

    /// Address both sockets are bound to
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn shared(&self) -> &SharedSimulator {
        &self.simulator
    }

    /// Accept one client connection
    ///
    /// Blocks until a client connects.
    pub fn accept(&self) -> Result<SimulatorConnection> {
        trace!("Waiting for client connection");
        let (stream, peer) = self.listener.accept()?;
        stream.set_nodelay(true)?;
        info!(peer_addr = %peer, "Client connected");
        Ok(SimulatorConnection {
            stream,
            peer,
            simulator: self.simulator.clone(),
        })
    }

    /// Start answering stop datagrams on a background thread
    pub fn spawn_stop_listener(&self) -> Result<JoinHandle<()>> {
        let socket = self.stop_socket.try_clone()?;
        let simulator = self.simulator.clone();
        Ok(thread::spawn(move || run_stop_listener(socket, simulator)))
    }

    /// Serve clients until the listener fails
    ///
    /// Each connection runs on its own thread.
    pub fn serve(self) -> Result<()> {
        self.spawn_stop_listener()?;
        loop {
            let connection = self.accept()?;
            thread::spawn(move || {
                let peer = connection.peer_addr();
                if let Err(e) = connection.run() {
                    warn!(peer_addr = %peer, error = %e, "Connection ended with error");
                }
            });
        }
    }

    /// Run [`serve`](Self::serve) on a background thread
    ///
    /// Returns the bound address, handy with port 0 in tests.
    pub fn spawn(self) -> Result<(SocketAddr, JoinHandle<Result<()>>)> {
        let addr = self.local_addr()?;
        Ok((addr, thread::spawn(move || self.serve())))
    }
}

/// Answer stop datagrams until the socket fails
fn run_stop_listener(socket: UdpSocket, simulator: SharedSimulator) {
    let mut buf = [0u8; DATAGRAM_BUFFER];
    loop {
        let (n, from) = match socket.recv_from(&mut buf) {
            Ok(received) => received,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!(error = %e, "Stop listener failed");
                return;
            }
        };
        if !is_stop_datagram(&buf[..n]) {
            debug!(from = %from, bytes = n, "Ignoring datagram");
            continue;
        }
        simulator::lock(&simulator).stop_acquisition();
        info!(from = %from, "Stop datagram received");
        if let Err(e) = socket.send_to(STOP_REPLY, from) {
            warn!(from = %from, error = %e, "Failed to answer stop datagram");
        }
    }
}

/// Read `len` bytes, growing the buffer only as data arrives
fn read_up_to<R: Read>(reader: &mut R, len: usize) -> Result<Vec<u8>> {
    let mut data = Vec::new();
    reader.take(len as u64).read_to_end(&mut data)?;
    if data.len() != len {
        return Err(DeError::ShortRead {
            expected: len,
            actual: data.len(),
        });
    }
    Ok(data)
}

pub(crate) fn is_stop_datagram(data: &[u8]) -> bool {
    data.windows(STOP_DATAGRAM.len()).any(|w| w == STOP_DATAGRAM)
}

/// One accepted client
pub struct SimulatorConnection {
    stream: TcpStream,
    peer: SocketAddr,
    simulator: SharedSimulator,
}

impl SimulatorConnection {
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Answer commands until the client disconnects
    ///
    /// A clean close between commands returns `Ok`. A close in the middle of
    /// a frame or an undecodable envelope ends the connection with an error.
    pub fn run(mut self) -> Result<()> {
        loop {
            let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
            match self.stream.read_exact(&mut prefix) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                    info!(peer_addr = %self.peer, "Client disconnected");
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            }
            let len = codec::read_length(&prefix)?;
            let body = read_up_to(&mut self.stream, len)?;
            let packet = codec::decode(&body)?;

            let trailing = simulator::lock(&self.simulator).trailing_payload_len(&packet);
            let payload = if trailing > 0 {
                trace!(bytes = trailing, "Reading trailing payload");
                read_up_to(&mut self.stream, trailing)?
            } else {
                Vec::new()
            };

            let responses = simulator::lock(&self.simulator).handle(&packet, &payload);
            for response in responses {
                let bytes = response.into_bytes();
                trace!(peer_addr = %self.peer, bytes = bytes.len(), "Writing response");
                self.stream.write_all(&bytes)?;
            }
            self.stream.flush()?;
        }
    }
}
