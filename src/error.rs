//! Error kinds shared across the crate, per the error-handling design: configuration
//! and protocol errors are terminal for the caller, transport errors are recovered
//! from by dropping the offending peer, and state-transition errors are observational.

use std::io;

use thiserror::Error;

/// Deserialization failures from [`crate::wire::buffer`].
#[derive(Debug, Error)]
pub enum CodecError {
  #[error("ran out of bytes while decoding a wire value")]
  EndOfBuffer,
  #[error("string field was not valid UTF-8")]
  InvalidUtf8,
  #[error("unknown wire message kind {0}")]
  UnknownKind(u8),
  #[error("unknown enum discriminant {value} for {type_name}")]
  UnknownDiscriminant { type_name: &'static str, value: u32 },
  #[error("frame exceeds configured maximum length ({0} bytes)")]
  FrameTooLarge(u32),
}

/// Top-level error type returned from the crate's public API.
#[derive(Debug, Error)]
pub enum VasioError {
  #[error("configuration error: {0}")]
  Configuration(String),

  #[error("misconfiguration: {0}")]
  Misconfiguration(String),

  #[error("transport error: {0}")]
  Transport(String),

  #[error("protocol error: {0}")]
  Protocol(String),

  /// Observational only: stored and logged, never propagated to halt a
  /// participant unless that participant is required (see orchestration).
  #[error("invalid state transition: {0}")]
  StateTransition(String),

  #[error("codec error: {0}")]
  Codec(#[from] CodecError),

  #[error("operation timed out")]
  Timeout,

  #[error(transparent)]
  Io(#[from] io::Error),
}

pub type VasioResult<T> = Result<T, VasioError>;
