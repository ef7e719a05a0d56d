// SMPP v3.4 Codec - Separates parsing/encoding logic from domain models
//
// Wire format lives here (header, primitive field codecs, frame dispatch);
// the domain models in `datatypes` implement Encodable/Decodable against it.

use crate::datatypes::{CommandId, CommandStatus};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::io::Cursor;
use thiserror::Error;

/// Maximum allowed PDU size to prevent memory exhaustion from a bad peer
pub const MAX_PDU_SIZE: u32 = 65536; // 64KB

/// SMPP v3.4 PDU Header (16 bytes, common to all PDUs)
///
/// `command_id` and `command_status` are kept raw here: an unknown command id
/// must still produce a decodable header so the session can answer with
/// `generic_nack` echoing the sequence number.
#[derive(Debug, Clone, PartialEq)]
pub struct PduHeader {
    pub command_length: u32,
    pub command_id: u32,
    pub command_status: u32,
    pub sequence_number: u32,
}

impl PduHeader {
    pub const SIZE: usize = 16;

    /// Decode a PDU header from the buffer with length validation
    pub fn decode(buf: &mut Cursor<&[u8]>) -> Result<Self, CodecError> {
        if buf.remaining() < Self::SIZE {
            return Err(CodecError::Incomplete);
        }

        let command_length = buf.get_u32();
        let command_id = buf.get_u32();
        let command_status = buf.get_u32();
        let sequence_number = buf.get_u32();

        if command_length < Self::SIZE as u32 || command_length > MAX_PDU_SIZE {
            return Err(CodecError::InvalidPduLength {
                length: command_length,
                min: Self::SIZE as u32,
                max: MAX_PDU_SIZE,
            });
        }

        Ok(PduHeader {
            command_length,
            command_id,
            command_status,
            sequence_number,
        })
    }

    /// Encode this header to the buffer
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.command_length);
        buf.put_u32(self.command_id);
        buf.put_u32(self.command_status);
        buf.put_u32(self.sequence_number);
    }

    /// The typed command id, if this is one we speak
    pub fn typed_command(&self) -> Option<CommandId> {
        CommandId::try_from(self.command_id).ok()
    }

    /// The command status, unknown values collapse to `CommandStatus::Unknown`
    pub fn status(&self) -> CommandStatus {
        CommandStatus::from(self.command_status)
    }
}

/// Trait for types that can be encoded to bytes
pub trait Encodable {
    /// Encode this PDU (header included) to the buffer. The command_length
    /// written may be a placeholder; `to_bytes` fixes it up.
    fn encode(&self, buf: &mut BytesMut) -> Result<(), CodecError>;

    /// Convert this PDU to wire bytes with the command_length field corrected
    fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode(&mut buf)
            .expect("encoding a constructed PDU cannot fail");

        if buf.len() >= 4 {
            let length = buf.len() as u32;
            buf[0..4].copy_from_slice(&length.to_be_bytes());
        }

        buf.freeze()
    }
}

/// Trait for types that can be decoded from bytes
pub trait Decodable: Sized {
    /// Decode this PDU from the buffer positioned after the header
    fn decode(header: PduHeader, buf: &mut Cursor<&[u8]>) -> Result<Self, CodecError>;

    /// The command_id this PDU type answers to
    fn command_id() -> CommandId;

    /// Validate the header is appropriate for this PDU type
    fn validate_header(header: &PduHeader) -> Result<(), CodecError> {
        if header.typed_command() != Some(Self::command_id()) {
            return Err(CodecError::UnexpectedCommandId {
                expected: Self::command_id(),
                actual: header.command_id,
            });
        }
        Ok(())
    }
}

/// Codec errors with enough context to log a useful line about the peer
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("incomplete PDU: need more data")]
    Incomplete,

    #[error("invalid PDU length: {length}, must be {min}-{max}")]
    InvalidPduLength { length: u32, min: u32, max: u32 },

    #[error("unexpected command_id: expected {expected:?}, got {actual:#010x}")]
    UnexpectedCommandId { expected: CommandId, actual: u32 },

    #[error("C-Octet-String field '{field}' missing NUL terminator within {max} octets")]
    UnterminatedCString { field: &'static str, max: usize },

    #[error("field '{field}' validation failed: {reason}")]
    FieldValidation { field: &'static str, reason: String },

    #[error("TLV overruns PDU: tag {tag:#06x} declares {declared} octets, {available} left")]
    TlvOverrun {
        tag: u16,
        declared: usize,
        available: usize,
    },

    #[error("field '{field}' is not valid UTF-8")]
    Utf8Error { field: &'static str },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Decode a NUL-terminated C-Octet-String.
///
/// `max` is the declared maximum including the terminator. Returns the bytes
/// up to (not including) the NUL; a lone NUL decodes to the empty string.
pub fn decode_cstring(
    buf: &mut Cursor<&[u8]>,
    max: usize,
    field: &'static str,
) -> Result<String, CodecError> {
    let mut out = Vec::new();

    for _ in 0..max {
        if buf.remaining() < 1 {
            return Err(CodecError::Incomplete);
        }
        let b = buf.get_u8();
        if b == 0 {
            return String::from_utf8(out).map_err(|_| CodecError::Utf8Error { field });
        }
        out.push(b);
    }

    Err(CodecError::UnterminatedCString { field, max })
}

/// Encode a C-Octet-String: at most `max` octets including the terminator,
/// oversize values truncated at `max - 1`. An empty value is a single NUL.
pub fn encode_cstring(buf: &mut BytesMut, value: &str, max: usize) {
    let bytes = value.as_bytes();
    let len = bytes.len().min(max - 1);
    buf.put_slice(&bytes[..len]);
    buf.put_u8(0);
}

/// Encode an optional C-Octet-String (`None` is a lone NUL, same as empty)
pub fn encode_cstring_opt(buf: &mut BytesMut, value: Option<&str>, max: usize) {
    encode_cstring(buf, value.unwrap_or(""), max);
}

/// Decode a fixed-length run of raw octets (never NUL-terminated)
pub fn decode_octet_string(
    buf: &mut Cursor<&[u8]>,
    len: usize,
) -> Result<Bytes, CodecError> {
    if buf.remaining() < len {
        return Err(CodecError::Incomplete);
    }
    Ok(buf.copy_to_bytes(len))
}

pub fn decode_u8(buf: &mut Cursor<&[u8]>) -> Result<u8, CodecError> {
    if buf.remaining() < 1 {
        return Err(CodecError::Incomplete);
    }
    Ok(buf.get_u8())
}

pub fn decode_u16(buf: &mut Cursor<&[u8]>) -> Result<u16, CodecError> {
    if buf.remaining() < 2 {
        return Err(CodecError::Incomplete);
    }
    Ok(buf.get_u16())
}

pub fn decode_u32(buf: &mut Cursor<&[u8]>) -> Result<u32, CodecError> {
    if buf.remaining() < 4 {
        return Err(CodecError::Incomplete);
    }
    Ok(buf.get_u32())
}

/// Generic frame type covering the PDUs the gateway speaks
#[derive(Debug)]
pub enum Frame {
    EnquireLink(crate::datatypes::EnquireLink),
    EnquireLinkResp(crate::datatypes::EnquireLinkResponse),

    Unbind(crate::datatypes::Unbind),
    UnbindResp(crate::datatypes::UnbindResponse),

    BindTransceiver(crate::datatypes::BindTransceiver),
    BindTransceiverResp(crate::datatypes::BindTransceiverResponse),

    SubmitSm(Box<crate::datatypes::SubmitSm>),
    SubmitSmResp(crate::datatypes::SubmitSmResponse),
    DeliverSm(Box<crate::datatypes::DeliverSm>),
    DeliverSmResp(crate::datatypes::DeliverSmResponse),

    GenericNack(crate::datatypes::GenericNack),

    // Anything with a command_id we do not speak (forward compatibility)
    Unknown { header: PduHeader, body: Bytes },
}

/// Registry of PDU decoders keyed by command id
type DecoderFn =
    Box<dyn Fn(PduHeader, &mut Cursor<&[u8]>) -> Result<Frame, CodecError> + Send + Sync>;

pub struct PduRegistry {
    decoders: HashMap<CommandId, DecoderFn>,
}

static REGISTRY: Lazy<PduRegistry> = Lazy::new(PduRegistry::new);

impl PduRegistry {
    /// Create a registry with the gateway's SMPP v3.4 PDU set registered
    pub fn new() -> Self {
        let mut registry = Self {
            decoders: HashMap::new(),
        };

        registry.register_pdu::<crate::datatypes::EnquireLink, _>(Frame::EnquireLink);
        registry.register_pdu::<crate::datatypes::EnquireLinkResponse, _>(Frame::EnquireLinkResp);
        registry.register_pdu::<crate::datatypes::Unbind, _>(Frame::Unbind);
        registry.register_pdu::<crate::datatypes::UnbindResponse, _>(Frame::UnbindResp);
        registry.register_pdu::<crate::datatypes::GenericNack, _>(Frame::GenericNack);

        registry.register_pdu::<crate::datatypes::BindTransceiver, _>(Frame::BindTransceiver);
        registry
            .register_pdu::<crate::datatypes::BindTransceiverResponse, _>(Frame::BindTransceiverResp);

        // Message PDUs are boxed, they dominate the enum size otherwise
        registry
            .register_pdu::<crate::datatypes::SubmitSm, _>(|pdu| Frame::SubmitSm(Box::new(pdu)));
        registry.register_pdu::<crate::datatypes::SubmitSmResponse, _>(Frame::SubmitSmResp);
        registry
            .register_pdu::<crate::datatypes::DeliverSm, _>(|pdu| Frame::DeliverSm(Box::new(pdu)));
        registry.register_pdu::<crate::datatypes::DeliverSmResponse, _>(Frame::DeliverSmResp);

        registry
    }

    /// Shared registry instance
    pub fn global() -> &'static PduRegistry {
        &REGISTRY
    }

    fn register_pdu<T, F>(&mut self, frame_constructor: F)
    where
        T: Decodable + 'static,
        F: Fn(T) -> Frame + Send + Sync + 'static,
    {
        let command_id = T::command_id();
        let decoder = Box::new(move |header: PduHeader, buf: &mut Cursor<&[u8]>| {
            let pdu = T::decode(header, buf)?;
            Ok(frame_constructor(pdu))
        });
        self.decoders.insert(command_id, decoder);
    }

    /// Decode a PDU given its header and remaining body bytes
    pub fn decode_pdu(
        &self,
        header: PduHeader,
        buf: &mut Cursor<&[u8]>,
    ) -> Result<Frame, CodecError> {
        match header.typed_command().and_then(|id| self.decoders.get(&id)) {
            Some(decoder) => decoder(header, buf),
            None => {
                let body_size = header.command_length as usize - PduHeader::SIZE;
                if buf.remaining() < body_size {
                    return Err(CodecError::Incomplete);
                }

                let body = buf.copy_to_bytes(body_size);
                tracing::warn!(
                    command_id = format_args!("{:#010x}", header.command_id),
                    "unknown PDU command_id, treating as opaque data"
                );

                Ok(Frame::Unknown { header, body })
            }
        }
    }

    pub fn is_registered(&self, command_id: CommandId) -> bool {
        self.decoders.contains_key(&command_id)
    }
}

impl Default for PduRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Frame {
    /// Raw command_id for this frame
    pub fn command_id(&self) -> u32 {
        match self {
            Frame::EnquireLink(_) => CommandId::EnquireLink as u32,
            Frame::EnquireLinkResp(_) => CommandId::EnquireLinkResp as u32,
            Frame::Unbind(_) => CommandId::Unbind as u32,
            Frame::UnbindResp(_) => CommandId::UnbindResp as u32,
            Frame::BindTransceiver(_) => CommandId::BindTransceiver as u32,
            Frame::BindTransceiverResp(_) => CommandId::BindTransceiverResp as u32,
            Frame::SubmitSm(_) => CommandId::SubmitSm as u32,
            Frame::SubmitSmResp(_) => CommandId::SubmitSmResp as u32,
            Frame::DeliverSm(_) => CommandId::DeliverSm as u32,
            Frame::DeliverSmResp(_) => CommandId::DeliverSmResp as u32,
            Frame::GenericNack(_) => CommandId::GenericNack as u32,
            Frame::Unknown { header, .. } => header.command_id,
        }
    }

    /// Sequence number carried by this frame
    pub fn sequence_number(&self) -> u32 {
        match self {
            Frame::EnquireLink(pdu) => pdu.sequence_number,
            Frame::EnquireLinkResp(pdu) => pdu.sequence_number,
            Frame::Unbind(pdu) => pdu.sequence_number,
            Frame::UnbindResp(pdu) => pdu.sequence_number,
            Frame::BindTransceiver(pdu) => pdu.sequence_number,
            Frame::BindTransceiverResp(pdu) => pdu.sequence_number,
            Frame::SubmitSm(pdu) => pdu.sequence_number,
            Frame::SubmitSmResp(pdu) => pdu.sequence_number,
            Frame::DeliverSm(pdu) => pdu.sequence_number,
            Frame::DeliverSmResp(pdu) => pdu.sequence_number,
            Frame::GenericNack(pdu) => pdu.sequence_number,
            Frame::Unknown { header, .. } => header.sequence_number,
        }
    }

    /// Response PDUs have the top command_id bit set
    pub fn is_response(&self) -> bool {
        self.command_id() & 0x8000_0000 != 0
    }

    /// Wire bytes for this frame; `Unknown` frames cannot be re-encoded
    pub fn to_bytes(&self) -> Result<Bytes, CodecError> {
        match self {
            Frame::EnquireLink(pdu) => Ok(pdu.to_bytes()),
            Frame::EnquireLinkResp(pdu) => Ok(pdu.to_bytes()),
            Frame::Unbind(pdu) => Ok(pdu.to_bytes()),
            Frame::UnbindResp(pdu) => Ok(pdu.to_bytes()),
            Frame::BindTransceiver(pdu) => Ok(pdu.to_bytes()),
            Frame::BindTransceiverResp(pdu) => Ok(pdu.to_bytes()),
            Frame::SubmitSm(pdu) => Ok(pdu.to_bytes()),
            Frame::SubmitSmResp(pdu) => Ok(pdu.to_bytes()),
            Frame::DeliverSm(pdu) => Ok(pdu.to_bytes()),
            Frame::DeliverSmResp(pdu) => Ok(pdu.to_bytes()),
            Frame::GenericNack(pdu) => Ok(pdu.to_bytes()),
            Frame::Unknown { .. } => Err(CodecError::FieldValidation {
                field: "frame",
                reason: "cannot encode an unknown frame".to_string(),
            }),
        }
    }

    /// Check whether the buffer holds one complete PDU without consuming it
    pub fn check(buf: &mut Cursor<&[u8]>) -> Result<(), CodecError> {
        if buf.remaining() < PduHeader::SIZE {
            return Err(CodecError::Incomplete);
        }

        let pos = buf.position();
        let command_length = buf.get_u32();
        buf.set_position(pos);

        if command_length < PduHeader::SIZE as u32 || command_length > MAX_PDU_SIZE {
            return Err(CodecError::InvalidPduLength {
                length: command_length,
                min: PduHeader::SIZE as u32,
                max: MAX_PDU_SIZE,
            });
        }

        if buf.remaining() < command_length as usize {
            return Err(CodecError::Incomplete);
        }

        Ok(())
    }

    /// Parse one complete PDU from the buffer
    pub fn parse(buf: &mut Cursor<&[u8]>) -> Result<Frame, CodecError> {
        let header = PduHeader::decode(buf)?;
        PduRegistry::global().decode_pdu(header, buf)
    }
}
