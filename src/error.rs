//! Error types for DE server protocol operations
//!
//! This module defines all error types that can occur while talking to a DE
//! server (or the bundled simulator): network I/O, envelope decoding, protocol
//! shape violations, server-reported application errors and simulator-side
//! property validation.

use thiserror::Error;

/// DE protocol error types
///
/// All operations in this library return `Result<T, DeError>`. Expected
/// failure modes (timeouts, short reads, server-side errors) are values of
/// this type, never panics.
#[derive(Error, Debug)]
pub enum DeError {
    /// I/O error occurred during network communication
    ///
    /// This error wraps standard library I/O errors and occurs when:
    /// - TCP connection failed or was refused
    /// - Connection reset while a command was in flight
    /// - UDP stop datagram could not be delivered or answered
    /// - Insufficient permissions to bind the simulator port
    ///
    /// # Example
    /// ```no_run
    /// # use deapi::error::DeError;
    /// # use std::io;
    /// let io_err = io::Error::new(io::ErrorKind::ConnectionRefused, "Connection refused");
    /// let err = DeError::Io(io_err);
    /// ```
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Envelope bytes could not be decoded
    ///
    /// This error occurs when:
    /// - The announced frame length does not match the envelope that follows
    /// - The stream was desynchronised by a previous short read
    /// - The peer speaks a different schema
    #[error("Decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    /// Property table could not be parsed
    #[error("Property table error: {0}")]
    PropertyTable(#[from] serde_json::Error),

    /// Response envelope carried the wrong type tag
    ///
    /// A command must be answered by an ACKNOWLEDGE envelope, and the frame
    /// after a result acknowledgment must be a DATA_HEADER.
    ///
    /// # Example
    /// ```no_run
    /// # use deapi::error::DeError;
    /// let err = DeError::UnexpectedPacket {
    ///     expected: "ACKNOWLEDGE",
    ///     actual: 0,
    /// };
    /// ```
    #[error("Unexpected packet type: expected {expected}, got {actual}")]
    UnexpectedPacket {
        /// Name of the packet type the caller was waiting for
        expected: &'static str,
        /// Raw type tag found in the envelope
        actual: i32,
    },

    /// Fewer acknowledgments than commands
    #[error("Short acknowledgment list: {commands} command(s), {acknowledges} acknowledgment(s)")]
    ShortAcknowledge {
        /// Number of sub-commands sent
        commands: usize,
        /// Number of sub-acknowledgments received
        acknowledges: usize,
    },

    /// The server flagged the command as failed
    ///
    /// Carries the first `error_message` of the acknowledgment. Messages
    /// starting with `"Unknown property"` are logged at debug level only, but
    /// still surface as this error.
    #[error("Server error: {0}")]
    Server(String),

    /// Fewer bytes arrived than were announced
    ///
    /// This error occurs when:
    /// - The receive window (`exposure_time * 10 + 30` seconds) elapsed
    /// - The peer closed the stream mid-payload
    ///
    /// No partial image is ever returned alongside this error. The rest of
    /// the payload may still arrive later, so the stream position is unknown
    /// and the client disconnects.
    ///
    /// # Example
    /// ```no_run
    /// # use deapi::error::DeError;
    /// let err = DeError::ShortRead {
    ///     expected: 524288,
    ///     actual: 1000,
    /// };
    /// ```
    #[error("Short read: expected {expected} bytes, received {actual}")]
    ShortRead {
        /// Bytes announced by the length prefix or data header
        expected: usize,
        /// Bytes actually collected before timeout or EOF
        actual: usize,
    },

    /// A length prefix announced an envelope larger than any valid one
    ///
    /// The stream is treated as corrupt; nothing is allocated for the body.
    #[error("Frame too large: {size} bytes announced, limit is {max}")]
    FrameTooLarge {
        /// Length announced by the prefix
        size: usize,
        /// Largest accepted envelope
        max: usize,
    },

    /// Acknowledgment echoed a different command id than was sent
    ///
    /// Indicates the negotiated protocol version does not match the server's.
    /// This is fatal: the client disconnects when it sees it.
    #[error("Protocol version mismatch: sent command id {sent}, acknowledged {received}")]
    VersionMismatch {
        /// Wire command id that was sent
        sent: u32,
        /// Wire command id that was echoed back
        received: u32,
    },

    /// The server reported a software version older than any supported one
    #[error("Unsupported server version: {0}")]
    UnsupportedServerVersion(String),

    /// The simulator has no handler for the command id
    #[error("Unknown command id {command_id} (protocol version {version})")]
    UnknownCommand {
        /// Wire command id received
        command_id: u32,
        /// Protocol version the dispatcher runs with
        version: u32,
    },

    /// Property name not present in the table
    #[error("Unknown property: {0}")]
    UnknownProperty(String),

    /// A parameter was missing or had an unusable type
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Pixel format tag outside {1, 5, 13}
    #[error("Invalid pixel format: {0}")]
    InvalidPixelFormat(i64),

    /// Buffer size does not match its declared dimensions
    #[error("Invalid size: expected {expected}, got {actual}")]
    InvalidSize {
        /// Expected size in bytes
        expected: usize,
        /// Actual size in bytes
        actual: usize,
    },

    /// A property get/set expression could not be evaluated
    #[error("Expression error in `{expr}`: {reason}")]
    Expression {
        /// Source text of the expression
        expr: String,
        /// What went wrong
        reason: String,
    },

    /// Operation attempted on a disconnected client
    #[error("Not connected")]
    NotConnected,
}

impl DeError {
    /// Whether the connection must be dropped after this error
    ///
    /// Version mismatches, transport failures and short reads leave the
    /// stream in an unknown state; everything else is scoped to a single
    /// command.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DeError::Io(_)
                | DeError::VersionMismatch { .. }
                | DeError::Decode(_)
                | DeError::ShortRead { .. }
                | DeError::FrameTooLarge { .. }
        )
    }
}

/// Result type alias for DE protocol operations
pub type Result<T> = std::result::Result<T, DeError>;
