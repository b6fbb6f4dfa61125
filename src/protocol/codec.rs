//! Wire codec: typed parameters, command building and length-prefixed framing
//!
//! A frame on the stream is `u32 little-endian length` followed by exactly that
//! many bytes of a serialized [`DePacket`]. Parameters travel as
//! [`AnyParameter`] values whose `type` tag selects the populated field.

use std::fmt;

use bytes::{Buf, BufMut, BytesMut};
use prost::Message;
use tracing::{trace, warn};

use crate::error::{DeError, Result};
use crate::protocol::packet::{
    AnyParameter, DataHeader, DePacket, PacketType, ParameterType, SingleAcknowledge,
    SingleCommand,
};

/// Size of the length prefix preceding every envelope
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Name tag given to the label parameter of a command
pub const LABEL_NAME: &str = "label";

/// Name tag given to value parameters of a command
pub const VALUE_NAME: &str = "val";

/// UDP datagram asking the server to abort the running acquisition
pub const STOP_DATAGRAM: &[u8] = b"PyClientStopAcq";

/// Expected substring of the server's reply to [`STOP_DATAGRAM`]
pub const STOP_REPLY: &[u8] = b"Stopped";

/// Largest envelope accepted from a length prefix
///
/// Image data travels as a raw payload after a data header, so envelopes
/// only ever carry parameters.
pub const MAX_ENVELOPE_SIZE: usize = 64 * 1024 * 1024;

/// A typed scalar parameter
///
/// Booleans, integers, floats and strings are distinct variants, so a boolean
/// is never encoded as an integer and decoding restores the exact variant.
#[derive(Debug, Clone, PartialEq)]
pub enum Parameter {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl Parameter {
    /// Convert into the wire representation with the given name tag
    pub fn to_any(&self, name: &str) -> AnyParameter {
        let mut any = AnyParameter {
            name: name.to_string(),
            ..Default::default()
        };
        match self {
            Parameter::Bool(v) => {
                any.set_type(ParameterType::Bool);
                any.p_bool = *v;
            }
            Parameter::Int(v) => {
                any.set_type(ParameterType::Int);
                any.p_int = *v;
            }
            Parameter::Float(v) => {
                any.set_type(ParameterType::Float);
                any.p_float = *v;
            }
            Parameter::Str(v) => {
                any.set_type(ParameterType::String);
                any.p_string = v.clone();
            }
        }
        any
    }

    /// Convert from the wire representation
    ///
    /// # Errors
    ///
    /// - [`DeError::InvalidParameter`] - The type tag is not one of the four known tags
    pub fn from_any(any: &AnyParameter) -> Result<Self> {
        match ParameterType::try_from(any.r#type) {
            Ok(ParameterType::Bool) => Ok(Parameter::Bool(any.p_bool)),
            Ok(ParameterType::Int) => Ok(Parameter::Int(any.p_int)),
            Ok(ParameterType::Float) => Ok(Parameter::Float(any.p_float)),
            Ok(ParameterType::String) => Ok(Parameter::Str(any.p_string.clone())),
            Err(_) => Err(DeError::InvalidParameter(format!(
                "unknown parameter type tag {}",
                any.r#type
            ))),
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Parameter::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Parameter::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Parameter::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Parameter::Str(v) => Some(v.as_str()),
            _ => None,
        }
    }

    /// Numeric view of the parameter
    ///
    /// Integers and floats convert directly, booleans become 0/1 and strings
    /// are parsed. Returns `None` for non-numeric strings.
    pub fn to_f64(&self) -> Option<f64> {
        match self {
            Parameter::Bool(v) => Some(if *v { 1.0 } else { 0.0 }),
            Parameter::Int(v) => Some(*v as f64),
            Parameter::Float(v) => Some(*v),
            Parameter::Str(v) => v.trim().parse().ok(),
        }
    }

    /// Integer view of the parameter, truncating floats
    pub fn to_i64(&self) -> Option<i64> {
        match self {
            Parameter::Int(v) => Some(*v),
            Parameter::Str(v) => v
                .trim()
                .parse::<i64>()
                .ok()
                .or_else(|| v.trim().parse::<f64>().ok().map(|f| f as i64)),
            other => other.to_f64().map(|f| f as i64),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Parameter::Bool(_) => "bool",
            Parameter::Int(_) => "int",
            Parameter::Float(_) => "float",
            Parameter::Str(_) => "string",
        }
    }
}

impl fmt::Display for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Parameter::Bool(v) => write!(f, "{}", v),
            Parameter::Int(v) => write!(f, "{}", v),
            Parameter::Float(v) => write!(f, "{}", v),
            Parameter::Str(v) => f.write_str(v),
        }
    }
}

impl From<bool> for Parameter {
    fn from(v: bool) -> Self {
        Parameter::Bool(v)
    }
}

impl From<i32> for Parameter {
    fn from(v: i32) -> Self {
        Parameter::Int(v as i64)
    }
}

impl From<i64> for Parameter {
    fn from(v: i64) -> Self {
        Parameter::Int(v)
    }
}

impl From<u32> for Parameter {
    fn from(v: u32) -> Self {
        Parameter::Int(v as i64)
    }
}

impl From<usize> for Parameter {
    fn from(v: usize) -> Self {
        Parameter::Int(v as i64)
    }
}

impl From<f32> for Parameter {
    fn from(v: f32) -> Self {
        Parameter::Float(v as f64)
    }
}

impl From<f64> for Parameter {
    fn from(v: f64) -> Self {
        Parameter::Float(v)
    }
}

impl From<&str> for Parameter {
    fn from(v: &str) -> Self {
        Parameter::Str(v.to_string())
    }
}

impl From<String> for Parameter {
    fn from(v: String) -> Self {
        Parameter::Str(v)
    }
}

/// Build a command packet holding a single sub-command
///
/// The optional label is sent first with the `"label"` name tag, followed by
/// every value parameter tagged `"val"`. `camera_name` may be empty; the
/// protocol engine fills it in before sending.
pub fn build_command(
    command_id: u32,
    camera_name: &str,
    label: Option<&str>,
    params: &[Parameter],
) -> DePacket {
    let mut parameter = Vec::with_capacity(params.len() + 1);
    if let Some(label) = label {
        parameter.push(Parameter::from(label).to_any(LABEL_NAME));
    }
    parameter.extend(params.iter().map(|p| p.to_any(VALUE_NAME)));

    let mut packet = DePacket {
        camera_name: camera_name.to_string(),
        command: vec![SingleCommand {
            command_id,
            parameter,
        }],
        ..Default::default()
    };
    packet.set_type(PacketType::Command);
    packet
}

/// Build and frame a single command in one step
pub fn encode_command(command_id: u32, label: Option<&str>, params: &[Parameter]) -> Vec<u8> {
    frame(&build_command(command_id, "", label, params))
}

/// Serialize a packet with its length prefix
pub fn frame(packet: &DePacket) -> Vec<u8> {
    let body = packet.encode_to_vec();
    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + body.len());
    buf.put_u32_le(body.len() as u32);
    buf.put_slice(&body);

    trace!(
        packet_type = packet.r#type,
        size = body.len(),
        "Framed packet"
    );

    buf.to_vec()
}

/// Interpret a 4-byte little-endian length prefix
///
/// # Errors
///
/// - [`DeError::ShortRead`] - Fewer than four bytes were supplied
/// - [`DeError::FrameTooLarge`] - The length exceeds [`MAX_ENVELOPE_SIZE`]
pub fn read_length(prefix: &[u8]) -> Result<usize> {
    if prefix.len() < LENGTH_PREFIX_SIZE {
        return Err(DeError::ShortRead {
            expected: LENGTH_PREFIX_SIZE,
            actual: prefix.len(),
        });
    }
    let mut cursor = prefix;
    let len = cursor.get_u32_le() as usize;
    if len > MAX_ENVELOPE_SIZE {
        warn!(size = len, max = MAX_ENVELOPE_SIZE, "Envelope length out of range");
        return Err(DeError::FrameTooLarge {
            size: len,
            max: MAX_ENVELOPE_SIZE,
        });
    }
    Ok(len)
}

/// Decode an envelope body (without its length prefix)
pub fn decode(bytes: &[u8]) -> Result<DePacket> {
    DePacket::decode(bytes).map_err(|e| {
        warn!(error = %e, size = bytes.len(), "Failed to decode packet");
        DeError::from(e)
    })
}

/// Decode a complete frame (length prefix plus envelope)
///
/// # Errors
///
/// - [`DeError::ShortRead`] - The buffer holds fewer bytes than announced
/// - [`DeError::Decode`] - The envelope is malformed
pub fn decode_frame(bytes: &[u8]) -> Result<DePacket> {
    let len = read_length(bytes)?;
    let body = &bytes[LENGTH_PREFIX_SIZE..];
    if body.len() < len {
        return Err(DeError::ShortRead {
            expected: len,
            actual: body.len(),
        });
    }
    decode(&body[..len])
}

/// Decode every parameter of a list, preserving order
pub fn decode_parameters(params: &[AnyParameter]) -> Result<Vec<Parameter>> {
    params.iter().map(Parameter::from_any).collect()
}

/// Successful acknowledgment for a single command
pub fn acknowledge(command_id: u32, params: &[Parameter]) -> DePacket {
    let mut packet = DePacket {
        acknowledge: vec![SingleAcknowledge {
            command_id,
            error: false,
            error_message: String::new(),
            parameter: params.iter().map(|p| p.to_any(VALUE_NAME)).collect(),
        }],
        ..Default::default()
    };
    packet.set_type(PacketType::Acknowledge);
    packet
}

/// Failed acknowledgment carrying an error message
pub fn error_acknowledge(command_id: u32, message: &str) -> DePacket {
    let mut packet = DePacket {
        acknowledge: vec![SingleAcknowledge {
            command_id,
            error: true,
            error_message: message.to_string(),
            parameter: Vec::new(),
        }],
        ..Default::default()
    };
    packet.set_type(PacketType::Acknowledge);
    packet
}

/// Data header announcing `bytesize` raw bytes
pub fn data_header(bytesize: u64) -> DePacket {
    let mut packet = DePacket {
        data_header: Some(DataHeader { bytesize }),
        ..Default::default()
    };
    packet.set_type(PacketType::DataHeader);
    packet
}
