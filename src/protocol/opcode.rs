//! Command opcodes and protocol version negotiation
//!
//! The wire-level `command_id` of a command is `opcode + protocol_version * 100`.
//! The protocol version is negotiated once per connection from the server's
//! reported software version.

use std::fmt;

use crate::error::{DeError, Result};

/// Base opcodes, independent of protocol version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Opcode {
    ListCameras = 0,
    ListProperties = 1,
    ListAllowedValues = 2,
    GetProperty = 3,
    SetProperty = 4,
    StopAcquisition = 11,
    GetResult = 14,
    StartAcquisition = 15,
    SetHwRoi = 16,
    SetSwRoi = 17,
    GetMovieBufferInfo = 18,
    GetMovieBuffer = 19,
    SetPropertyAndGetChanged = 20,
    SetHwRoiAndGetChanged = 21,
    SetSwRoiAndGetChanged = 22,
    SetVirtualMask = 23,
    SetEngMode = 25,
    SetClientReadOnly = 31,
}

impl Opcode {
    const ALL: [Opcode; 18] = [
        Opcode::ListCameras,
        Opcode::ListProperties,
        Opcode::ListAllowedValues,
        Opcode::GetProperty,
        Opcode::SetProperty,
        Opcode::StopAcquisition,
        Opcode::GetResult,
        Opcode::StartAcquisition,
        Opcode::SetHwRoi,
        Opcode::SetSwRoi,
        Opcode::GetMovieBufferInfo,
        Opcode::GetMovieBuffer,
        Opcode::SetPropertyAndGetChanged,
        Opcode::SetHwRoiAndGetChanged,
        Opcode::SetSwRoiAndGetChanged,
        Opcode::SetVirtualMask,
        Opcode::SetEngMode,
        Opcode::SetClientReadOnly,
    ];

    /// Look up an opcode by its numeric value
    pub fn from_u32(value: u32) -> Option<Self> {
        Self::ALL.iter().copied().find(|op| *op as u32 == value)
    }

    /// Whether the command changes server state
    pub fn is_mutating(self) -> bool {
        matches!(
            self,
            Opcode::SetProperty
                | Opcode::SetHwRoi
                | Opcode::SetSwRoi
                | Opcode::SetPropertyAndGetChanged
                | Opcode::SetHwRoiAndGetChanged
                | Opcode::SetSwRoiAndGetChanged
                | Opcode::SetVirtualMask
                | Opcode::StartAcquisition
        )
    }
}

/// Negotiated protocol version
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProtocolVersion(pub u32);

/// Version table: (minimum packed server version, protocol version)
const VERSION_TABLE: [(u64, u32); 5] = [
    (2_007_004, 12),
    (2_007_003, 11),
    (2_007_002, 10),
    (2_005_025, 4),
    (2_001_017, 3),
];

impl ProtocolVersion {
    /// Version used before negotiation has completed
    pub const LATEST: ProtocolVersion = ProtocolVersion(12);

    /// Map a server software version string onto a protocol version
    ///
    /// The first three integers found in the string are packed as
    /// `major * 1_000_000 + minor * 1000 + patch`.
    ///
    /// # Errors
    ///
    /// - [`DeError::UnsupportedServerVersion`] - Fewer than three numbers, or older than 2.1.17
    ///
    /// # Examples
    ///
    /// ```
    /// use deapi::protocol::ProtocolVersion;
    ///
    /// assert_eq!(ProtocolVersion::negotiate("2.7.3.1234")?, ProtocolVersion(11));
    /// assert_eq!(ProtocolVersion::negotiate("3.7.8893")?, ProtocolVersion(12));
    /// # Ok::<(), deapi::DeError>(())
    /// ```
    pub fn negotiate(server_version: &str) -> Result<Self> {
        let parts: Vec<u64> = server_version
            .split(|c: char| !c.is_ascii_digit())
            .filter(|s| !s.is_empty())
            .filter_map(|s| s.parse().ok())
            .take(3)
            .collect();

        if parts.len() < 3 {
            return Err(DeError::UnsupportedServerVersion(server_version.to_string()));
        }

        let packed = parts[0]
            .checked_mul(1_000_000)
            .zip(parts[1].checked_mul(1000))
            .and_then(|(major, minor)| major.checked_add(minor))
            .and_then(|v| v.checked_add(parts[2]))
            .ok_or_else(|| DeError::UnsupportedServerVersion(server_version.to_string()))?;
        VERSION_TABLE
            .iter()
            .find(|(min, _)| packed >= *min)
            .map(|(_, v)| ProtocolVersion(*v))
            .ok_or_else(|| DeError::UnsupportedServerVersion(server_version.to_string()))
    }

    /// Wire command id for an opcode under this version
    pub fn command_id(self, opcode: Opcode) -> u32 {
        opcode as u32 + self.0 * 100
    }

    /// Recover the opcode number from a wire command id
    ///
    /// Returns `None` when the id was built with a different version offset.
    pub fn opcode_number(self, command_id: u32) -> Option<u32> {
        command_id
            .checked_sub(self.0 * 100)
            .filter(|op| *op < 100)
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
