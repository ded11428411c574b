//! FM225 face recognition module serial protocol
//!
//! This crate encodes requests for, and interprets replies from, the FM225
//! face module over its half-duplex UART link.

pub mod commands;
pub mod frame;
pub mod idle;
pub mod responses;
pub mod transport;
pub mod types;

pub use commands::{
    CommandBuilder, CommandId, DeleteUserRequest, EnrollRequest, EnrollType, FaceDirection,
    Request, Transmit, VerifyRequest,
};
pub use frame::Frame;
pub use idle::IdleGapAssembler;
pub use responses::{ParsedResponse, ResponseParser};
pub use transport::{FaceEvent, FaceTransport, TransportConfig};
pub use types::*;
