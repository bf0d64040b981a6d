// src/protocol/mod.rs

//! BASP wire protocol: fixed-size headers plus the payload bodies of the
//! handshake and dispatch operations.

pub mod header;
pub mod payload;

pub use header::{Header, Opcode, HEADER_SIZE};
pub use payload::{ClientHandshake, DispatchPayload, ServerHandshake};

/// Protocol version carried in the `operation_data` field of both handshake
/// headers. There is no negotiation; a mismatch closes the connection.
pub const BASP_VERSION: u32 = 1;
