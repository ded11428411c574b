//! FM225 frame envelope and BCC checksum handling

use crate::commands::CommandId;
use crate::types::ProtocolError;

/// Fixed frame header
pub const HEADER: [u8; 2] = [0xEF, 0xAA];

/// Minimum frame size: header(2) + cmd(1) + `payload_len(2)` + bcc(1) = 6
pub const MIN_FRAME_SIZE: usize = 6;

/// First byte covered by the checksum (the command byte)
pub const CHECKSUM_START: usize = 2;

/// Offset of the first payload byte
pub const PAYLOAD_OFFSET: usize = 5;

/// Calculate the BCC (XOR) checksum of a complete frame
///
/// Covers the command byte through the byte before the checksum slot.
/// Buffers shorter than [`MIN_FRAME_SIZE`] yield 0.
#[must_use]
pub fn checksum(frame: &[u8]) -> u8 {
    if frame.len() < MIN_FRAME_SIZE {
        return 0;
    }
    frame[CHECKSUM_START..frame.len() - 1]
        .iter()
        .fold(0, |bcc, &b| bcc ^ b)
}

/// Lay out header, command, big-endian length, payload and checksum
pub fn encode_envelope(command: CommandId, payload: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let payload_len =
        u16::try_from(payload.len()).map_err(|_| ProtocolError::PayloadTooLong(payload.len()))?;

    let mut data = Vec::with_capacity(MIN_FRAME_SIZE + payload.len());
    data.extend_from_slice(&HEADER);
    data.push(command as u8);
    data.extend_from_slice(&payload_len.to_be_bytes());
    data.extend_from_slice(payload);

    // Reserve the checksum slot, then fill it
    data.push(0);
    let bcc = checksum(&data);
    if let Some(last) = data.last_mut() {
        *last = bcc;
    }

    Ok(data)
}

/// Check a received buffer, reporting which rule it broke
#[allow(clippy::missing_errors_doc)]
pub fn check(data: &[u8]) -> Result<(), ProtocolError> {
    if data.len() < MIN_FRAME_SIZE {
        return Err(ProtocolError::FrameTooShort(data.len()));
    }

    if data[..2] != HEADER {
        return Err(ProtocolError::HeaderMismatch([data[0], data[1]]));
    }

    let expected = checksum(data);
    let actual = data[data.len() - 1];
    if expected != actual {
        return Err(ProtocolError::ChecksumMismatch { expected, actual });
    }

    Ok(())
}

/// True only when the buffer is long enough, starts with the header
/// and ends with a matching checksum
#[must_use]
pub fn validate(data: &[u8]) -> bool {
    check(data).is_ok()
}

/// FM225 protocol frame
///
/// Frame format:
/// ```text
/// [Header: 2 bytes] 0xEF 0xAA
/// [Command: 1 byte]
/// [Payload Length: 2 bytes BE] (payload bytes only)
/// [Payload: variable]
/// [BCC: 1 byte] XOR of command through payload
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: CommandId,
    pub payload: Vec<u8>,
}

impl Frame {
    #[must_use]
    pub fn new(command: CommandId, payload: Vec<u8>) -> Self {
        Self { command, payload }
    }

    /// Serialize frame to bytes ready for the serial line
    #[allow(clippy::missing_errors_doc)]
    pub fn serialize(&self) -> Result<Vec<u8>, ProtocolError> {
        encode_envelope(self.command, &self.payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_calculation() {
        let data = [0xEF, 0xAA, 0x01, 0x02, 0x03, 0x00];
        assert_eq!(checksum(&data), 0x01 ^ 0x02 ^ 0x03);

        let verify = [0xEF, 0xAA, 0x12, 0x00, 0x02, 0x01, 0x0A, 0x00];
        assert_eq!(checksum(&verify), 0x1B);
    }

    #[test]
    fn test_checksum_short_buffer_is_zero() {
        assert_eq!(checksum(&[0xEF, 0xAA, 0x12, 0x34, 0x56]), 0);
        assert_eq!(checksum(&[]), 0);
    }

    #[test]
    fn test_encode_empty_payload() {
        let data = encode_envelope(CommandId::DeleteAll, &[]).unwrap();
        assert_eq!(data, vec![0xEF, 0xAA, 0x21, 0x00, 0x00, 0x21]);
    }

    #[test]
    fn test_encoded_frames_validate() {
        let payloads: [&[u8]; 3] = [&[], &[0x00, 0x05], &[0x5A; 40]];
        for payload in payloads {
            let data = Frame::new(CommandId::Enroll, payload.to_vec())
                .serialize()
                .unwrap();
            assert_eq!(data.len(), MIN_FRAME_SIZE + payload.len());
            assert_eq!(&data[3..5], &(payload.len() as u16).to_be_bytes());
            assert!(validate(&data));
        }
    }

    #[test]
    fn test_validate_known_good() {
        assert!(validate(&[0xEF, 0xAA, 0x01, 0x02, 0x03, 0x00]));
        // Ready note from the module
        assert!(validate(&[0xEF, 0xAA, 0x01, 0x00, 0x01, 0x00, 0x00]));
    }

    #[test]
    fn test_frame_too_short() {
        assert!(!validate(&[0xEF, 0xAA, 0x01, 0x01, 0x00]));
        assert!(matches!(
            check(&[0xEF, 0xAA]),
            Err(ProtocolError::FrameTooShort(2))
        ));
        // Short all-zero buffers must not pass on the zero sentinel
        assert!(!validate(&[0x00; 5]));
    }

    #[test]
    fn test_header_mismatch() {
        let data = [0xAA, 0xEF, 0x01, 0x02, 0x03, 0x00];
        assert!(!validate(&data));
        assert!(matches!(
            check(&data),
            Err(ProtocolError::HeaderMismatch([0xAA, 0xEF]))
        ));
    }

    #[test]
    fn test_checksum_mismatch() {
        let data = [0xEF, 0xAA, 0x01, 0x02, 0x03, 0x01];
        assert!(!validate(&data));
        assert!(matches!(
            check(&data),
            Err(ProtocolError::ChecksumMismatch {
                expected: 0x00,
                actual: 0x01
            })
        ));
    }

    #[test]
    fn test_payload_too_long() {
        let payload = vec![0u8; usize::from(u16::MAX) + 1];
        assert!(matches!(
            encode_envelope(CommandId::Enroll, &payload),
            Err(ProtocolError::PayloadTooLong(_))
        ));
    }
}
