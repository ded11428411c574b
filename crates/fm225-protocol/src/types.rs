//! Common types used throughout the protocol

use thiserror::Error;

/// Protocol errors
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Invalid parameter {field}: {value:#04X}")]
    InvalidParameter { field: &'static str, value: u32 },

    #[error("Transmit failed: {0}")]
    TransmitFailed(#[source] std::io::Error),

    #[error("Frame too short: {0} bytes")]
    FrameTooShort(usize),

    #[error("Header mismatch: got {0:02X?}")]
    HeaderMismatch([u8; 2]),

    #[error("Checksum mismatch: expected {expected:02X}, got {actual:02X}")]
    ChecksumMismatch { expected: u8, actual: u8 },

    #[error("Payload too long for length field: {0} bytes")]
    PayloadTooLong(usize),

    #[error("Serial port error: {0}")]
    SerialError(#[from] std::io::Error),

    #[error("Request timeout")]
    Timeout,

    #[error("Transport not connected")]
    NotConnected,

    #[error("Request already outstanding for {0:?}")]
    Busy(crate::commands::CommandId),

    #[error("Request cancelled by reset")]
    Cancelled,
}

impl ProtocolError {
    /// True for errors raised before any frame was built
    #[must_use]
    pub fn is_parameter_error(&self) -> bool {
        matches!(self, ProtocolError::InvalidParameter { .. })
    }
}

/// Kind of inbound message, taken from frame offset 2
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Reply to the last command
    Reply,
    /// Unsolicited notification
    Note,
    Other(u8),
}

impl From<u8> for MessageKind {
    fn from(value: u8) -> Self {
        match value {
            0x00 => MessageKind::Reply,
            0x01 => MessageKind::Note,
            v => MessageKind::Other(v),
        }
    }
}

/// Note identifiers carried by unsolicited messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Note {
    /// Module finished booting and accepts commands
    Ready,
    Other(u8),
}

impl From<u8> for Note {
    fn from(value: u8) -> Self {
        match value {
            0x00 => Note::Ready,
            v => Note::Other(v),
        }
    }
}

/// Interpreted result of a reply
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome", content = "value")]
pub enum Outcome {
    /// Command completed, no identifier attached
    Success,
    /// Enroll or verify completed for the given user id
    SuccessWithId(u8),
    /// Enroll refused because the face is already in the library
    AlreadyEnrolled,
    /// Operation failed (observed as result 0x0D)
    Failed,
    /// Any other non-zero result code
    Rejected(u8),
    /// Not a usable reply
    Unrecognized,
}

impl Outcome {
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success | Outcome::SuccessWithId(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_kind_from_byte() {
        assert_eq!(MessageKind::from(0x00), MessageKind::Reply);
        assert_eq!(MessageKind::from(0x01), MessageKind::Note);
        assert_eq!(MessageKind::from(0x02), MessageKind::Other(0x02));
    }

    #[test]
    fn test_parameter_error_classification() {
        let err = ProtocolError::InvalidParameter {
            field: "direction",
            value: 0xFF,
        };
        assert!(err.is_parameter_error());
        assert!(!ProtocolError::Timeout.is_parameter_error());
    }
}
