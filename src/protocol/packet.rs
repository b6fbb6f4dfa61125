//! Envelope schema for the DE server wire protocol
//!
//! Every frame on the stream carries one [`DePacket`]. A packet is either a
//! command batch sent by the client, an acknowledgment batch sent back by the
//! server, or a data header announcing the size of a raw payload that follows
//! on the stream without further framing.
//!
//! The structs are written against `prost` directly so no build script or
//! `protoc` installation is needed.

/// Top-level envelope
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DePacket {
    #[prost(enumeration = "PacketType", tag = "1")]
    pub r#type: i32,
    /// Camera the commands are addressed to; filled in with the current
    /// camera when left empty
    #[prost(string, tag = "2")]
    pub camera_name: ::prost::alloc::string::String,
    #[prost(message, repeated, tag = "3")]
    pub command: ::prost::alloc::vec::Vec<SingleCommand>,
    #[prost(message, repeated, tag = "4")]
    pub acknowledge: ::prost::alloc::vec::Vec<SingleAcknowledge>,
    #[prost(message, optional, tag = "5")]
    pub data_header: ::core::option::Option<DataHeader>,
}

/// Envelope discriminator
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum PacketType {
    Command = 0,
    Acknowledge = 1,
    DataHeader = 2,
}

impl PacketType {
    /// Name used in logs and error messages
    pub fn as_str_name(&self) -> &'static str {
        match self {
            PacketType::Command => "COMMAND",
            PacketType::Acknowledge => "ACKNOWLEDGE",
            PacketType::DataHeader => "DATA_HEADER",
        }
    }
}

/// One command inside a command batch
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SingleCommand {
    /// Opcode plus `protocol_version * 100`
    #[prost(uint32, tag = "1")]
    pub command_id: u32,
    #[prost(message, repeated, tag = "2")]
    pub parameter: ::prost::alloc::vec::Vec<AnyParameter>,
}

/// One acknowledgment inside an acknowledgment batch
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SingleAcknowledge {
    /// Echo of the command id being acknowledged
    #[prost(uint32, tag = "1")]
    pub command_id: u32,
    #[prost(bool, tag = "2")]
    pub error: bool,
    #[prost(string, tag = "3")]
    pub error_message: ::prost::alloc::string::String,
    #[prost(message, repeated, tag = "4")]
    pub parameter: ::prost::alloc::vec::Vec<AnyParameter>,
}

/// Typed scalar parameter
///
/// Exactly one of the `p_*` fields is meaningful; `type` says which.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AnyParameter {
    #[prost(enumeration = "ParameterType", tag = "1")]
    pub r#type: i32,
    #[prost(bool, tag = "2")]
    pub p_bool: bool,
    #[prost(int64, tag = "3")]
    pub p_int: i64,
    #[prost(double, tag = "4")]
    pub p_float: f64,
    #[prost(string, tag = "5")]
    pub p_string: ::prost::alloc::string::String,
    /// Either `"label"` or `"val"`
    #[prost(string, tag = "6")]
    pub name: ::prost::alloc::string::String,
}

/// Parameter discriminator
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum ParameterType {
    Bool = 0,
    Int = 1,
    Float = 2,
    String = 3,
}

/// Size announcement for a raw payload
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DataHeader {
    #[prost(uint64, tag = "1")]
    pub bytesize: u64,
}
