//! In-process transport backed by a [`Simulator`]
//!
//! Bytes written by the client are reassembled into frames exactly as the
//! TCP server would see them and handed to the simulator; its responses are
//! queued for the next reads. No sockets or threads are involved, which makes
//! this the transport of choice for unit tests.

use std::time::Duration;

use bytes::{Buf, BytesMut};
use tracing::{debug, trace};

use crate::error::Result;
use crate::io::transport::{StopHandle, Transport};
use crate::protocol::codec::{self, LENGTH_PREFIX_SIZE};
use crate::protocol::packet::DePacket;
use crate::simulator::{self, SharedSimulator, Simulator};

/// Transport that talks to a simulator in the same process
pub struct LocalTransport {
    simulator: SharedSimulator,
    inbound: BytesMut,
    outbound: BytesMut,
    /// Decoded command still waiting for its trailing payload
    pending: Option<(DePacket, usize)>,
    closed: bool,
}

impl LocalTransport {
    pub fn new(simulator: Simulator) -> Self {
        Self::from_shared(simulator.into_shared())
    }

    /// Attach to a simulator that may also be served elsewhere
    pub fn from_shared(simulator: SharedSimulator) -> Self {
        Self {
            simulator,
            inbound: BytesMut::new(),
            outbound: BytesMut::new(),
            pending: None,
            closed: false,
        }
    }

    pub fn simulator(&self) -> &SharedSimulator {
        &self.simulator
    }

    /// Bytes queued for reading
    pub fn pending_bytes(&self) -> usize {
        self.outbound.len()
    }

    /// Dispatch every command that is complete in the inbound buffer
    fn pump(&mut self) -> Result<()> {
        loop {
            if self.pending.is_none() {
                if self.inbound.len() < LENGTH_PREFIX_SIZE {
                    return Ok(());
                }
                let len = codec::read_length(&self.inbound[..LENGTH_PREFIX_SIZE])?;
                if self.inbound.len() < LENGTH_PREFIX_SIZE + len {
                    return Ok(());
                }
                self.inbound.advance(LENGTH_PREFIX_SIZE);
                let body = self.inbound.split_to(len);
                let packet = codec::decode(&body)?;
                let trailing = simulator::lock(&self.simulator).trailing_payload_len(&packet);
                self.pending = Some((packet, trailing));
            }

            let Some((_, trailing)) = &self.pending else {
                return Ok(());
            };
            if self.inbound.len() < *trailing {
                trace!(
                    have = self.inbound.len(),
                    need = *trailing,
                    "Waiting for trailing payload"
                );
                return Ok(());
            }
            let Some((packet, trailing)) = self.pending.take() else {
                return Ok(());
            };
            let payload = self.inbound.split_to(trailing);

            let responses = simulator::lock(&self.simulator).handle(&packet, &payload);
            for response in responses {
                self.outbound.extend_from_slice(&response.into_bytes());
            }
        }
    }
}

impl Transport for LocalTransport {
    fn send(&mut self, data: &[u8]) -> Result<()> {
        if self.closed {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "local transport is shut down",
            )
            .into());
        }
        trace!(bytes = data.len(), "Sending to local simulator");
        self.inbound.extend_from_slice(data);
        self.pump()
    }

    fn recv_exact(&mut self, len: usize, _timeout: Duration) -> Result<Vec<u8>> {
        // nothing more can arrive between calls, so waiting is pointless
        let n = len.min(self.outbound.len());
        if n < len {
            debug!(expected = len, available = n, "Local read is short");
        }
        Ok(self.outbound.split_to(n).to_vec())
    }

    fn stop_handle(&self) -> StopHandle {
        StopHandle::Local(self.simulator.clone())
    }

    fn peer(&self) -> String {
        "local simulator".to_string()
    }

    fn shutdown(&mut self) -> Result<()> {
        self.closed = true;
        self.inbound.clear();
        self.outbound.clear();
        self.pending = None;
        Ok(())
    }
}
