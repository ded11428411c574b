//! FM225 command definitions and request encoding

use crate::frame::encode_envelope;
use crate::types::ProtocolError;
use std::ops::RangeInclusive;
use std::time::Duration;

/// Largest device-side timeout the module accepts, in seconds
pub const MAX_TIMEOUT_SECS: u8 = 60;

/// Device-side timeout the module applies when asked for 0
pub const DEFAULT_DEVICE_TIMEOUT_SECS: u8 = 10;

/// Width of the user name field
pub const NAME_LEN: usize = 32;

/// Enroll data length as declared on the wire: 37 used bytes + 3 reserved
pub const ENROLL_DATA_LEN: usize = 40;

/// User ids accepted by delete-user
pub const USER_ID_RANGE: RangeInclusive<u16> = 1..=100;

/// Command IDs for the FM225 serial protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[repr(u8)]
pub enum CommandId {
    /// Abort the running enroll or verify
    Reset = 0x10,
    /// Match a live face against the library
    Verify = 0x12,
    /// Remove one user
    DeleteUser = 0x20,
    /// Remove every user
    DeleteAll = 0x21,
    /// Register a new face (integrated enroll)
    Enroll = 0x26,
}

impl CommandId {
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x10 => Some(CommandId::Reset),
            0x12 => Some(CommandId::Verify),
            0x20 => Some(CommandId::DeleteUser),
            0x21 => Some(CommandId::DeleteAll),
            0x26 => Some(CommandId::Enroll),
            _ => None,
        }
    }

    /// Whether a successful reply carries a user id
    #[must_use]
    pub fn returns_user_id(&self) -> bool {
        matches!(self, CommandId::Enroll | CommandId::Verify)
    }
}

/// Face orientation captured during enroll
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum FaceDirection {
    /// Treated by the module as Middle
    #[default]
    Undefined = 0x00,
    Middle = 0x01,
    Right = 0x02,
    Left = 0x04,
    Down = 0x08,
    Up = 0x10,
}

impl TryFrom<u8> for FaceDirection {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        match value {
            0x00 => Ok(FaceDirection::Undefined),
            0x01 => Ok(FaceDirection::Middle),
            0x02 => Ok(FaceDirection::Right),
            0x04 => Ok(FaceDirection::Left),
            0x08 => Ok(FaceDirection::Down),
            0x10 => Ok(FaceDirection::Up),
            _ => Err(value),
        }
    }
}

/// Enroll capture mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum EnrollType {
    #[default]
    Interactive = 0x00,
    SingleFrame = 0x01,
}

impl TryFrom<u8> for EnrollType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        match value {
            0x00 => Ok(EnrollType::Interactive),
            0x01 => Ok(EnrollType::SingleFrame),
            _ => Err(value),
        }
    }
}

/// Values above [`MAX_TIMEOUT_SECS`] are clamped, never rejected
#[must_use]
pub fn clamp_timeout(timeout_secs: u8) -> u8 {
    timeout_secs.min(MAX_TIMEOUT_SECS)
}

fn flag(field: &'static str, value: u8) -> Result<bool, ProtocolError> {
    match value {
        0x00 => Ok(false),
        0x01 => Ok(true),
        v => Err(ProtocolError::InvalidParameter {
            field,
            value: u32::from(v),
        }),
    }
}

/// Copy up to 32 name bytes, zero-filling the rest
#[must_use]
pub fn name_field(name: &[u8]) -> [u8; NAME_LEN] {
    let mut field = [0u8; NAME_LEN];
    let len = name.len().min(NAME_LEN);
    field[..len].copy_from_slice(&name[..len]);
    field
}

/// Enroll request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnrollRequest {
    pub admin: bool,
    pub name: [u8; NAME_LEN],
    pub direction: FaceDirection,
    pub enroll_type: EnrollType,
    pub allow_duplicate: bool,
    pub timeout_secs: u8,
}

impl EnrollRequest {
    /// Create an interactive, non-admin enroll with the module's default timeout
    #[must_use]
    pub fn new(name: &[u8]) -> Self {
        Self {
            admin: false,
            name: name_field(name),
            direction: FaceDirection::default(),
            enroll_type: EnrollType::default(),
            allow_duplicate: false,
            timeout_secs: DEFAULT_DEVICE_TIMEOUT_SECS,
        }
    }

    /// Build from raw protocol bytes, rejecting values outside their legal sets
    #[allow(clippy::missing_errors_doc)]
    pub fn from_raw(
        admin: u8,
        name: &[u8],
        direction: u8,
        enroll_type: u8,
        allow_duplicate: u8,
        timeout_secs: u8,
    ) -> Result<Self, ProtocolError> {
        let admin = flag("admin", admin)?;
        let direction =
            FaceDirection::try_from(direction).map_err(|v| ProtocolError::InvalidParameter {
                field: "direction",
                value: u32::from(v),
            })?;
        let enroll_type =
            EnrollType::try_from(enroll_type).map_err(|v| ProtocolError::InvalidParameter {
                field: "enroll_type",
                value: u32::from(v),
            })?;
        let allow_duplicate = flag("allow_duplicate", allow_duplicate)?;

        Ok(Self {
            admin,
            name: name_field(name),
            direction,
            enroll_type,
            allow_duplicate,
            timeout_secs,
        })
    }

    /// Serialize the 40-byte enroll data block
    #[must_use]
    pub fn payload(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(ENROLL_DATA_LEN);
        data.push(u8::from(self.admin));
        data.extend_from_slice(&self.name);
        data.push(self.direction as u8);
        data.push(self.enroll_type as u8);
        data.push(u8::from(self.allow_duplicate));
        data.push(clamp_timeout(self.timeout_secs));
        // Reserved tail
        data.resize(ENROLL_DATA_LEN, 0x00);
        data
    }
}

/// Verify request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerifyRequest {
    pub power_down_on_success: bool,
    pub timeout_secs: u8,
}

impl VerifyRequest {
    #[must_use]
    pub fn new(power_down_on_success: bool, timeout_secs: u8) -> Self {
        Self {
            power_down_on_success,
            timeout_secs,
        }
    }

    #[allow(clippy::missing_errors_doc)]
    pub fn from_raw(power_down_on_success: u8, timeout_secs: u8) -> Result<Self, ProtocolError> {
        Ok(Self {
            power_down_on_success: flag("power_down_on_success", power_down_on_success)?,
            timeout_secs,
        })
    }

    #[must_use]
    pub fn payload(&self) -> Vec<u8> {
        vec![
            u8::from(self.power_down_on_success),
            clamp_timeout(self.timeout_secs),
        ]
    }
}

/// Delete-one-user request; the id is range checked on construction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeleteUserRequest {
    user_id: u16,
}

impl DeleteUserRequest {
    #[allow(clippy::missing_errors_doc)]
    pub fn new(user_id: u16) -> Result<Self, ProtocolError> {
        if !USER_ID_RANGE.contains(&user_id) {
            return Err(ProtocolError::InvalidParameter {
                field: "user_id",
                value: u32::from(user_id),
            });
        }
        Ok(Self { user_id })
    }

    #[must_use]
    pub fn user_id(&self) -> u16 {
        self.user_id
    }

    #[must_use]
    pub fn payload(&self) -> Vec<u8> {
        self.user_id.to_be_bytes().to_vec()
    }
}

/// A validated request, ready to encode
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Enroll(EnrollRequest),
    Verify(VerifyRequest),
    DeleteUser(DeleteUserRequest),
    DeleteAll,
    Reset,
}

impl Request {
    #[must_use]
    pub fn command_id(&self) -> CommandId {
        match self {
            Request::Enroll(_) => CommandId::Enroll,
            Request::Verify(_) => CommandId::Verify,
            Request::DeleteUser(_) => CommandId::DeleteUser,
            Request::DeleteAll => CommandId::DeleteAll,
            Request::Reset => CommandId::Reset,
        }
    }

    #[must_use]
    pub fn payload(&self) -> Vec<u8> {
        match self {
            Request::Enroll(req) => req.payload(),
            Request::Verify(req) => req.payload(),
            Request::DeleteUser(req) => req.payload(),
            Request::DeleteAll | Request::Reset => Vec::new(),
        }
    }

    /// Encode the complete frame
    #[allow(clippy::missing_errors_doc)]
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode_envelope(self.command_id(), &self.payload())
    }

    /// How long the module itself will keep working on this request
    #[must_use]
    pub fn device_timeout(&self) -> Option<Duration> {
        let secs = match self {
            Request::Enroll(req) => req.timeout_secs,
            Request::Verify(req) => req.timeout_secs,
            _ => return None,
        };
        let secs = match clamp_timeout(secs) {
            0 => DEFAULT_DEVICE_TIMEOUT_SECS,
            s => s,
        };
        Some(Duration::from_secs(u64::from(secs)))
    }
}

/// Outbound byte sink (UART, DMA queue, test recorder)
///
/// Success means the bytes were handed off locally, not that the
/// module acted on them.
pub trait Transmit {
    #[allow(clippy::missing_errors_doc)]
    fn transmit(&mut self, frame: &[u8]) -> std::io::Result<()>;
}

impl<T: Transmit + ?Sized> Transmit for &mut T {
    fn transmit(&mut self, frame: &[u8]) -> std::io::Result<()> {
        (**self).transmit(frame)
    }
}

impl Transmit for serial2::SerialPort {
    fn transmit(&mut self, frame: &[u8]) -> std::io::Result<()> {
        self.write_all(frame)?;
        self.flush()
    }
}

/// Validates typed parameters, encodes frames and hands them to a [`Transmit`] sink
///
/// Every operation returns `Ok(())` only if the parameters were valid and the
/// sink accepted the bytes. `Result::is_ok` gives the plain boolean view.
#[derive(Debug)]
pub struct CommandBuilder<T> {
    link: T,
}

impl<T: Transmit> CommandBuilder<T> {
    pub fn new(link: T) -> Self {
        Self { link }
    }

    pub fn into_inner(self) -> T {
        self.link
    }

    /// Encode and transmit an already validated request
    #[allow(clippy::missing_errors_doc)]
    pub fn send(&mut self, request: &Request) -> Result<(), ProtocolError> {
        let data = request.encode()?;
        tracing::debug!("Sending {:?} frame: {:02X?}", request.command_id(), &data);

        self.link.transmit(&data).map_err(|e| {
            tracing::error!("Transmit of {:?} failed: {}", request.command_id(), e);
            ProtocolError::TransmitFailed(e)
        })
    }

    #[allow(clippy::missing_errors_doc)]
    pub fn enroll(&mut self, request: &EnrollRequest) -> Result<(), ProtocolError> {
        self.send(&Request::Enroll(request.clone()))
    }

    /// Enroll from raw protocol bytes, validating each before anything is built
    #[allow(clippy::missing_errors_doc)]
    pub fn enroll_raw(
        &mut self,
        admin: u8,
        name: &[u8],
        direction: u8,
        enroll_type: u8,
        allow_duplicate: u8,
        timeout_secs: u8,
    ) -> Result<(), ProtocolError> {
        let request = EnrollRequest::from_raw(
            admin,
            name,
            direction,
            enroll_type,
            allow_duplicate,
            timeout_secs,
        )
        .inspect_err(|e| tracing::warn!("Enroll rejected: {}", e))?;
        self.enroll(&request)
    }

    #[allow(clippy::missing_errors_doc)]
    pub fn verify(&mut self, request: VerifyRequest) -> Result<(), ProtocolError> {
        self.send(&Request::Verify(request))
    }

    #[allow(clippy::missing_errors_doc)]
    pub fn verify_raw(
        &mut self,
        power_down_on_success: u8,
        timeout_secs: u8,
    ) -> Result<(), ProtocolError> {
        let request = VerifyRequest::from_raw(power_down_on_success, timeout_secs)
            .inspect_err(|e| tracing::warn!("Verify rejected: {}", e))?;
        self.verify(request)
    }

    #[allow(clippy::missing_errors_doc)]
    pub fn delete_user(&mut self, user_id: u16) -> Result<(), ProtocolError> {
        let request = DeleteUserRequest::new(user_id)
            .inspect_err(|e| tracing::warn!("Delete user rejected: {}", e))?;
        self.send(&Request::DeleteUser(request))
    }

    #[allow(clippy::missing_errors_doc)]
    pub fn delete_all(&mut self) -> Result<(), ProtocolError> {
        self.send(&Request::DeleteAll)
    }

    #[allow(clippy::missing_errors_doc)]
    pub fn reset(&mut self) -> Result<(), ProtocolError> {
        self.send(&Request::Reset)
    }
}
