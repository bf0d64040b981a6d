// src/error.rs

//! Custom error types used throughout the library.

use crate::node::NodeId;

use std::io;
use thiserror::Error;

/// Convenience alias used by most fallible operations in this crate.
pub type BaspResult<T> = Result<T, BaspError>;

#[derive(Error, Debug)]
#[non_exhaustive] // Allows adding more variants later without breaking change
pub enum BaspError {
  // --- I/O Errors ---
  #[error("I/O error: {0}")]
  Io(#[from] io::Error),

  // --- Wire Errors ---
  #[error("malformed message: {0}")]
  MalformedMessage(String),

  #[error("unknown opcode: {0}")]
  UnknownOpcode(u32),

  #[error("payload of {got} bytes exceeds limit of {limit} bytes")]
  PayloadTooLarge { got: u32, limit: u32 },

  #[error("peer speaks BASP version {got}, expected {expected}")]
  VersionMismatch { got: u32, expected: u32 },

  // --- Handshake Errors ---
  #[error("expected signature does not comply to found signature")]
  SignatureMismatch,

  #[error("disconnect during handshake")]
  DisconnectDuringHandshake,

  // --- Routing Errors ---
  #[error("no route to node {0}")]
  RouteUnknown(NodeId),

  // --- Connection/Backend Errors ---
  #[error("connection closed by peer or transport")]
  ConnectionClosed,

  #[error("failed to assign scribe from handle: {0}")]
  ScribeAssignFailed(String),

  #[error("failed to assign doorman from handle: {0}")]
  DoormanAssignFailed(String),

  // --- Control Operation Errors ---
  #[error("invalid argument provided: {0}")]
  InvalidArgument(String),

  #[error("no mapping found")]
  NoSuchPublication,

  // --- Internal Errors ---
  #[error("internal library error: {0}")]
  Internal(String),
}

impl BaspError {
  /// Whether this error came out of wire decoding and mandates closing the
  /// offending connection.
  pub fn is_malformed_wire(&self) -> bool {
    matches!(
      self,
      BaspError::MalformedMessage(_)
        | BaspError::UnknownOpcode(_)
        | BaspError::PayloadTooLarge { .. }
        | BaspError::VersionMismatch { .. }
    )
  }
}
