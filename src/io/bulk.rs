//! Bulk result transfer
//!
//! A result acknowledgment is followed by a framed DATA_HEADER announcing a
//! byte count, then exactly that many raw bytes. Every read here checks the
//! length it got against the length it asked for; a short read is always
//! [`DeError::ShortRead`] and never a truncated image.

use std::time::Duration;

use tracing::{debug, error};

use crate::error::{DeError, Result};
use crate::io::transport::Transport;
use crate::protocol::codec::{self, LENGTH_PREFIX_SIZE};
use crate::protocol::packet::{DePacket, PacketType};
use crate::protocol::types::{Image, PixelFormat};

/// Read exactly `len` bytes or fail with [`DeError::ShortRead`]
pub fn read_exact<T: Transport + ?Sized>(
    transport: &mut T,
    len: usize,
    timeout: Duration,
) -> Result<Vec<u8>> {
    let data = transport.recv_exact(len, timeout)?;
    if data.len() != len {
        error!(expected = len, received = data.len(), "Short read");
        return Err(DeError::ShortRead {
            expected: len,
            actual: data.len(),
        });
    }
    Ok(data)
}

/// Read one length-prefixed envelope
pub fn read_packet<T: Transport + ?Sized>(transport: &mut T, timeout: Duration) -> Result<DePacket> {
    let prefix = read_exact(transport, LENGTH_PREFIX_SIZE, timeout)?;
    let len = codec::read_length(&prefix)?;
    let body = read_exact(transport, len, timeout)?;
    codec::decode(&body)
}

/// Read a DATA_HEADER envelope and return the announced byte count
///
/// # Errors
///
/// - [`DeError::ShortRead`] - The prefix or envelope was cut short
/// - [`DeError::UnexpectedPacket`] - The envelope is not a data header
pub fn receive_data_header<T: Transport + ?Sized>(
    transport: &mut T,
    timeout: Duration,
) -> Result<u64> {
    let packet = read_packet(transport, timeout)?;
    match (packet.r#type(), packet.data_header) {
        (PacketType::DataHeader, Some(header)) => {
            debug!(bytesize = header.bytesize, "Data header received");
            Ok(header.bytesize)
        }
        _ => Err(DeError::UnexpectedPacket {
            expected: "DATA_HEADER",
            actual: packet.r#type,
        }),
    }
}

/// Read a raw payload of `len` bytes
pub fn receive_payload<T: Transport + ?Sized>(
    transport: &mut T,
    len: u64,
    timeout: Duration,
) -> Result<Vec<u8>> {
    let len = usize::try_from(len)
        .map_err(|_| DeError::InvalidParameter(format!("payload of {} bytes is too large", len)))?;
    read_exact(transport, len, timeout)
}

/// Read a data header and its payload, and decode it as a `height x width` image
///
/// # Errors
///
/// - [`DeError::InvalidSize`] - Zero bytes were announced, or the payload
///   does not match `width * height * bytes_per_pixel`
/// - [`DeError::ShortRead`] - The payload was cut short
pub fn receive_image<T: Transport + ?Sized>(
    transport: &mut T,
    format: PixelFormat,
    width: usize,
    height: usize,
    timeout: Duration,
) -> Result<Image> {
    let bytesize = receive_data_header(transport, timeout)?;
    if bytesize == 0 {
        return Err(DeError::InvalidSize {
            expected: width
                .saturating_mul(height)
                .saturating_mul(format.bytes_per_pixel().unwrap_or(0)),
            actual: 0,
        });
    }
    let payload = receive_payload(transport, bytesize, timeout)?;
    Image::from_le_bytes(format, width, height, &payload)
}
