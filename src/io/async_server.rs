//! Asynchronous simulator server
//!
//! Tokio counterpart of [`SimulatorServer`](crate::io::SimulatorServer): one
//! task per connection plus a task answering the UDP stop datagram. The
//! simulator lock is only held while a command is dispatched, never across
//! an `.await`.

use std::io::ErrorKind;
use std::net::SocketAddr;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::error::{DeError, Result};
use crate::io::server::is_stop_datagram;
use crate::protocol::codec::{self, LENGTH_PREFIX_SIZE, STOP_REPLY};
use crate::simulator::{self, SharedSimulator};

/// Asynchronous simulator server
///
/// # Examples
///
/// ```no_run
/// use deapi::io::AsyncSimulatorServer;
/// use deapi::simulator::Simulator;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let shared = Simulator::with_defaults()?.into_shared();
///     let server = AsyncSimulatorServer::bind("127.0.0.1:13241", shared).await?;
///     server.serve().await?;
///     Ok(())
/// }
/// ```
pub struct AsyncSimulatorServer {
    listener: TcpListener,
    stop_socket: Option<UdpSocket>,
    simulator: SharedSimulator,
}

impl AsyncSimulatorServer {
    /// Bind the TCP listener and a UDP socket on the same port
    ///
    /// # Errors
    ///
    /// - [`DeError::Io`](crate::error::DeError::Io) - Either bind failed
    pub async fn bind(addr: &str, simulator: SharedSimulator) -> Result<Self> {
        info!(addr = %addr, "Binding simulator server (async)");
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let stop_socket = UdpSocket::bind(local_addr).await?;
        info!(local_addr = %local_addr, "Simulator server listening (async)");
        Ok(AsyncSimulatorServer {
            listener,
            stop_socket: Some(stop_socket),
            simulator,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn shared(&self) -> &SharedSimulator {
        &self.simulator
    }

    /// Accept one client connection
    pub async fn accept(&self) -> Result<AsyncSimulatorConnection> {
        trace!("Waiting for client connection (async)");
        let (stream, peer) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        info!(peer_addr = %peer, "Client connected (async)");
        Ok(AsyncSimulatorConnection {
            stream,
            peer,
            simulator: self.simulator.clone(),
        })
    }

    /// Move the UDP socket into its own task
    ///
    /// Returns `None` if the listener was already started.
    pub fn spawn_stop_listener(&mut self) -> Option<JoinHandle<()>> {
        let socket = self.stop_socket.take()?;
        let simulator = self.simulator.clone();
        Some(tokio::spawn(run_stop_listener(socket, simulator)))
    }

    /// Serve clients until the listener fails
    pub async fn serve(mut self) -> Result<()> {
        self.spawn_stop_listener();
        loop {
            let connection = self.accept().await?;
            tokio::spawn(async move {
                let peer = connection.peer_addr();
                if let Err(e) = connection.run().await {
                    warn!(peer_addr = %peer, error = %e, "Connection ended with error (async)");
                }
            });
        }
    }
}

async fn run_stop_listener(socket: UdpSocket, simulator: SharedSimulator) {
    let mut buf = [0u8; 1024];
    loop {
        let (n, from) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                warn!(error = %e, "Stop listener failed (async)");
                return;
            }
        };
        if !is_stop_datagram(&buf[..n]) {
            debug!(from = %from, bytes = n, "Ignoring datagram");
            continue;
        }
        simulator::lock(&simulator).stop_acquisition();
        info!(from = %from, "Stop datagram received");
        if let Err(e) = socket.send_to(STOP_REPLY, from).await {
            warn!(from = %from, error = %e, "Failed to answer stop datagram");
        }
    }
}

/// One accepted client (async)
pub struct AsyncSimulatorConnection {
    stream: TcpStream,
    peer: SocketAddr,
    simulator: SharedSimulator,
}

impl AsyncSimulatorConnection {
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    async fn read_up_to(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut data = Vec::new();
        (&mut self.stream).take(len as u64).read_to_end(&mut data).await?;
        if data.len() != len {
            return Err(DeError::ShortRead {
                expected: len,
                actual: data.len(),
            });
        }
        Ok(data)
    }

    /// Answer commands until the client disconnects
    pub async fn run(mut self) -> Result<()> {
        loop {
            let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
            match self.stream.read_exact(&mut prefix).await {
                Ok(_) => {}
                Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                    info!(peer_addr = %self.peer, "Client disconnected (async)");
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            }
            let len = codec::read_length(&prefix)?;
            let body = self.read_up_to(len).await?;
            let packet = codec::decode(&body)?;

            let trailing = simulator::lock(&self.simulator).trailing_payload_len(&packet);
            let payload = if trailing > 0 {
                trace!(bytes = trailing, "Reading trailing payload (async)");
                self.read_up_to(trailing).await?
            } else {
                Vec::new()
            };

            let responses = simulator::lock(&self.simulator).handle(&packet, &payload);
            for response in responses {
                self.stream.write_all(&response.into_bytes()).await?;
            }
            self.stream.flush().await?;
        }
    }
}
