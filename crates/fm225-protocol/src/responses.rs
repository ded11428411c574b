//! Inbound message parsing and reply classification
//!
//! Reply layout, after the common envelope:
//! ```text
//! [2]    message kind (0x00 reply, 0x01 note)
//! [5]    echoed command (reply) or note id (note)
//! [6]    result code
//! [7..8] user id, big-endian (enroll/verify success)
//! ```

use crate::commands::CommandId;
use crate::frame;
use crate::types::{MessageKind, Note, Outcome};

const STATUS_OFFSET: usize = 2;
const ECHO_OFFSET: usize = 5;
const RESULT_OFFSET: usize = 6;
const USER_ID_OFFSET: usize = 8;

/// Result code of a completed command
pub const RESULT_SUCCESS: u8 = 0x00;
/// Enroll only: face already present in the library
pub const RESULT_FACE_ENROLLED: u8 = 0x0A;
/// Operation failed
pub const RESULT_FAILED: u8 = 0x0D;

/// What a table row resolves to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Rule {
    Success,
    SuccessWithId,
    AlreadyEnrolled,
    Failed,
}

struct OutcomeRule {
    /// `None` matches every command
    command: Option<CommandId>,
    result: u8,
    rule: Rule,
}

/// Reply classification, first match wins.
///
/// The 0x0A and 0x0D meanings are as observed on the module and have not
/// been checked against a datasheet.
const OUTCOME_TABLE: &[OutcomeRule] = &[
    OutcomeRule {
        command: Some(CommandId::Enroll),
        result: RESULT_SUCCESS,
        rule: Rule::SuccessWithId,
    },
    OutcomeRule {
        command: Some(CommandId::Verify),
        result: RESULT_SUCCESS,
        rule: Rule::SuccessWithId,
    },
    OutcomeRule {
        command: Some(CommandId::Enroll),
        result: RESULT_FACE_ENROLLED,
        rule: Rule::AlreadyEnrolled,
    },
    OutcomeRule {
        command: None,
        result: RESULT_SUCCESS,
        rule: Rule::Success,
    },
    OutcomeRule {
        command: None,
        result: RESULT_FAILED,
        rule: Rule::Failed,
    },
];

fn lookup(command: Option<CommandId>, result: u8) -> Option<Rule> {
    OUTCOME_TABLE
        .iter()
        .find(|row| row.result == result && (row.command.is_none() || row.command == command))
        .map(|row| row.rule)
}

/// A received message, checked and broken into fields
///
/// Fields are only meaningful when [`ParsedResponse::is_valid`] holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
pub struct ParsedResponse {
    pub header_valid: bool,
    pub checksum_valid: bool,
    /// Message kind byte (offset 2)
    pub status: u8,
    /// Echoed command byte for replies, note id for notes
    pub command_echo: Option<u8>,
    /// Result code (offset 6)
    pub sub_status: Option<u8>,
    /// User id of an enroll/verify success
    pub result_id: Option<u8>,
}

impl ParsedResponse {
    /// Response for a buffer that failed validation
    #[must_use]
    pub fn invalid() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.header_valid && self.checksum_valid
    }

    #[must_use]
    pub fn kind(&self) -> MessageKind {
        MessageKind::from(self.status)
    }

    /// Command the module says this reply belongs to
    #[must_use]
    pub fn echoed_command(&self) -> Option<CommandId> {
        if self.kind() != MessageKind::Reply {
            return None;
        }
        self.command_echo.and_then(CommandId::from_u8)
    }

    /// Note carried by an unsolicited message
    #[must_use]
    pub fn note(&self) -> Option<Note> {
        if !self.is_valid() || self.kind() != MessageKind::Note {
            return None;
        }
        self.command_echo.map(Note::from)
    }

    /// Interpret the reply through the outcome table
    #[must_use]
    pub fn outcome(&self) -> Outcome {
        if !self.is_valid() || self.kind() != MessageKind::Reply {
            return Outcome::Unrecognized;
        }
        let Some(result) = self.sub_status else {
            return Outcome::Unrecognized;
        };

        match lookup(self.echoed_command(), result) {
            Some(Rule::Success) => Outcome::Success,
            Some(Rule::SuccessWithId) => match self.result_id {
                Some(id) if id != 0 => Outcome::SuccessWithId(id),
                _ => Outcome::Unrecognized,
            },
            Some(Rule::AlreadyEnrolled) => Outcome::AlreadyEnrolled,
            Some(Rule::Failed) => Outcome::Failed,
            None => Outcome::Rejected(result),
        }
    }

    /// True when the echoed command differs from the one that was sent
    #[must_use]
    pub fn echo_mismatch(&self, sent: CommandId) -> bool {
        self.kind() == MessageKind::Reply && self.command_echo != Some(sent as u8)
    }
}

/// Stateless parser for buffers delivered by the receive side
pub struct ResponseParser;

impl ResponseParser {
    /// Validate and split a received buffer
    ///
    /// Never fails: noise yields a response with both validity flags cleared.
    #[must_use]
    pub fn parse(data: &[u8]) -> ParsedResponse {
        if !frame::validate(data) {
            return ParsedResponse::invalid();
        }

        // Drop the checksum so trailing fields never alias it
        let body = &data[..data.len() - 1];
        let status = body[STATUS_OFFSET];
        let command_echo = body.get(ECHO_OFFSET).copied();
        let sub_status = body.get(RESULT_OFFSET).copied();

        let mut response = ParsedResponse {
            header_valid: true,
            checksum_valid: true,
            status,
            command_echo,
            sub_status,
            result_id: None,
        };

        let carries_id = response
            .echoed_command()
            .is_some_and(|c| c.returns_user_id());
        if carries_id && status == 0x00 && sub_status == Some(RESULT_SUCCESS) {
            response.result_id = body.get(USER_ID_OFFSET).copied();
        }

        response
    }

    /// Parse the first `len` bytes of a fixed receive buffer
    ///
    /// A `len` past the end of `buffer` is treated as noise.
    #[must_use]
    pub fn parse_buffer(buffer: &[u8], len: usize) -> ParsedResponse {
        match buffer.get(..len) {
            Some(data) => Self::parse(data),
            None => ParsedResponse::invalid(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a valid inbound frame from kind + payload
    fn inbound(kind: u8, payload: &[u8]) -> Vec<u8> {
        let mut data = vec![0xEF, 0xAA, kind];
        data.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        data.extend_from_slice(payload);
        data.push(0);
        let bcc = frame::checksum(&data);
        *data.last_mut().unwrap() = bcc;
        data
    }

    #[test]
    fn test_verify_success_with_id() {
        let data = inbound(0x00, &[0x12, 0x00, 0x00, 0x07]);
        let response = ResponseParser::parse(&data);
        assert!(response.is_valid());
        assert_eq!(response.echoed_command(), Some(CommandId::Verify));
        assert_eq!(response.result_id, Some(0x07));
        assert_eq!(response.outcome(), Outcome::SuccessWithId(7));
    }

    #[test]
    fn test_verify_failure_has_no_id() {
        let data = inbound(0x00, &[0x12, 0x0D, 0x00, 0x07]);
        let response = ResponseParser::parse(&data);
        assert!(response.is_valid());
        assert_eq!(response.result_id, None);
        assert_eq!(response.outcome(), Outcome::Failed);
    }

    #[test]
    fn test_enroll_already_enrolled() {
        let data = inbound(0x00, &[0x26, 0x0A]);
        assert_eq!(
            ResponseParser::parse(&data).outcome(),
            Outcome::AlreadyEnrolled
        );

        // 0x0A only means "already enrolled" for enroll
        let data = inbound(0x00, &[0x12, 0x0A]);
        assert_eq!(
            ResponseParser::parse(&data).outcome(),
            Outcome::Rejected(0x0A)
        );
    }

    #[test]
    fn test_success_with_zero_id_is_unrecognized() {
        let data = inbound(0x00, &[0x26, 0x00, 0x00, 0x00]);
        assert_eq!(ResponseParser::parse(&data).outcome(), Outcome::Unrecognized);
    }

    #[test]
    fn test_delete_success() {
        let data = inbound(0x00, &[0x21, 0x00]);
        let response = ResponseParser::parse(&data);
        assert_eq!(response.outcome(), Outcome::Success);
        assert_eq!(response.result_id, None);
        assert!(!response.echo_mismatch(CommandId::DeleteAll));
        assert!(response.echo_mismatch(CommandId::Verify));
    }

    #[test]
    fn test_noise_is_invalid() {
        let mut data = inbound(0x00, &[0x12, 0x00, 0x00, 0x07]);
        data[6] ^= 0xFF;
        let response = ResponseParser::parse(&data);
        assert!(!response.header_valid);
        assert!(!response.checksum_valid);
        assert_eq!(response.outcome(), Outcome::Unrecognized);

        assert!(!ResponseParser::parse(&[0xEF, 0xAA, 0x00]).is_valid());
        assert!(!ResponseParser::parse(&[]).is_valid());
    }

    #[test]
    fn test_ready_note() {
        let data = [0xEF, 0xAA, 0x01, 0x00, 0x01, 0x00, 0x00];
        let response = ResponseParser::parse(&data);
        assert_eq!(response.kind(), MessageKind::Note);
        assert_eq!(response.note(), Some(Note::Ready));
        assert_eq!(response.outcome(), Outcome::Unrecognized);
        assert_eq!(response.echoed_command(), None);
    }

    #[test]
    fn test_parse_fixed_buffer() {
        let mut rx = [0u8; 128];
        let data = inbound(0x00, &[0x20, 0x00]);
        rx[..data.len()].copy_from_slice(&data);

        assert_eq!(
            ResponseParser::parse_buffer(&rx, data.len()).outcome(),
            Outcome::Success
        );
        assert!(!ResponseParser::parse_buffer(&rx, 200).is_valid());
    }

    #[test]
    fn test_minimal_frame_has_no_fields() {
        let response = ResponseParser::parse(&[0xEF, 0xAA, 0x00, 0x00, 0x00, 0x00]);
        assert!(response.is_valid());
        assert_eq!(response.command_echo, None);
        assert_eq!(response.sub_status, None);
        assert_eq!(response.outcome(), Outcome::Unrecognized);
    }
}
