// SPDX-License-Identifier: MIT OR Apache-2.0
//! Two wire formats for task payloads and response values: a compact
//! binary archive for the fast path, and a self-describing structured
//! archive for heterogeneous or human-debuggable transport.
//!
//! Both offer the same four primitives — `encode`/`decode` plus streaming
//! `encode_into`/`decode_from` — over the same logical payload shape,
//! [`Payload`]: a `context` field (the task's captured state) followed by
//! an `args` field (the argument tuple).

#![deny(unsafe_code)]
#![warn(missing_docs)]

use fanout_error::{DispatchError, ErrorCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use thiserror::Error;

/// Leaf error type for archive encode/decode failures, converted into
/// [`DispatchError`] at the crate boundary.
#[derive(Debug, Error)]
pub enum ArchiveError {
    /// The binary archive failed to encode a value.
    #[error("binary archive encode failed")]
    BinaryEncode(#[source] bincode::Error),
    /// The binary archive failed to decode bytes.
    #[error("binary archive decode failed")]
    BinaryDecode(#[source] bincode::Error),
    /// The structured archive failed to encode a value.
    #[error("structured archive encode failed")]
    StructuredEncode(#[source] serde_json::Error),
    /// The structured archive failed to decode bytes.
    #[error("structured archive decode failed")]
    StructuredDecode(#[source] serde_json::Error),
}

impl From<ArchiveError> for DispatchError {
    fn from(err: ArchiveError) -> Self {
        let message = err.to_string();
        match err {
            ArchiveError::BinaryEncode(e) => {
                DispatchError::new(ErrorCode::SerializeFailed, message).with_source(e)
            }
            ArchiveError::BinaryDecode(e) => {
                DispatchError::new(ErrorCode::DeserializeFailed, message).with_source(e)
            }
            ArchiveError::StructuredEncode(e) => {
                DispatchError::new(ErrorCode::SerializeFailed, message).with_source(e)
            }
            ArchiveError::StructuredDecode(e) => {
                DispatchError::new(ErrorCode::DeserializeFailed, message).with_source(e)
            }
        }
    }
}

/// The two-field record every task transports: captured context, then the
/// positional argument tuple.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload<C, A> {
    /// The task's captured state.
    pub context: C,
    /// The task's positional arguments.
    pub args: A,
}

impl<C, A> Payload<C, A> {
    /// Bundle a context and argument tuple into a payload.
    pub fn new(context: C, args: A) -> Self {
        Self { context, args }
    }
}

/// An archive format: encode/decode to/from bytes, or a stream.
pub trait Archive {
    /// Encode a value into an owned byte buffer.
    fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, DispatchError>;

    /// Decode a value from a byte slice.
    fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, DispatchError>;

    /// Encode a value directly into a writer.
    fn encode_into<T: Serialize, W: Write>(value: &T, writer: W) -> Result<(), DispatchError>;

    /// Decode a value directly from a reader.
    fn decode_from<T: DeserializeOwned, R: Read>(reader: R) -> Result<T, DispatchError>;
}

/// Compact, field-order-driven, little-endian binary archive. No schema is
/// embedded; both ends must agree on the type being decoded.
pub struct BinaryArchive;

impl Archive for BinaryArchive {
    fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, DispatchError> {
        Ok(bincode::serialize(value).map_err(ArchiveError::BinaryEncode)?)
    }

    fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, DispatchError> {
        Ok(bincode::deserialize(bytes).map_err(ArchiveError::BinaryDecode)?)
    }

    fn encode_into<T: Serialize, W: Write>(value: &T, writer: W) -> Result<(), DispatchError> {
        Ok(bincode::serialize_into(writer, value).map_err(ArchiveError::BinaryEncode)?)
    }

    fn decode_from<T: DeserializeOwned, R: Read>(reader: R) -> Result<T, DispatchError> {
        Ok(bincode::deserialize_from(reader).map_err(ArchiveError::BinaryDecode)?)
    }
}

/// Self-describing, key/value structured archive. Doubles as JSON when
/// emitted to a text stream; used when the remote side may be
/// language-heterogeneous, or for human-debuggable tests.
pub struct StructuredArchive;

impl Archive for StructuredArchive {
    fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, DispatchError> {
        Ok(serde_json::to_vec(value).map_err(ArchiveError::StructuredEncode)?)
    }

    fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, DispatchError> {
        Ok(serde_json::from_slice(bytes).map_err(ArchiveError::StructuredDecode)?)
    }

    fn encode_into<T: Serialize, W: Write>(value: &T, writer: W) -> Result<(), DispatchError> {
        Ok(serde_json::to_writer(writer, value).map_err(ArchiveError::StructuredEncode)?)
    }

    fn decode_from<T: DeserializeOwned, R: Read>(reader: R) -> Result<T, DispatchError> {
        Ok(serde_json::from_reader(reader).map_err(ArchiveError::StructuredDecode)?)
    }
}
