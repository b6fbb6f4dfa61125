//! DE server protocol implementation module
//!
//! This module contains the envelope schema, the parameter codec, opcodes
//! with version negotiation, the versioned result layout and the shared data
//! types.

pub mod codec;
pub mod opcode;
pub mod packet;
pub mod schema;
pub mod types;

// Re-export commonly used types
pub use codec::Parameter;
pub use opcode::{Opcode, ProtocolVersion};
pub use packet::{DePacket, PacketType};
pub use schema::{ResultField, ResultSchema};
pub use types::{
    Attributes, FrameType, Histogram, Image, MovieBuffer, MovieBufferInfo, MovieBufferStatus,
    PixelFormat, Pixels, PropertySpec,
};
