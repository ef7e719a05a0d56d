use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io::Cursor;

use crate::codec::CodecError;

// TLV tag constants per SMPP v3.4 Appendix A, limited to the parameters the
// gateway reads or writes.
pub mod tags {
    pub const USER_MESSAGE_REFERENCE: u16 = 0x0204;
    pub const SAR_MSG_REF_NUM: u16 = 0x020C;
    pub const SAR_TOTAL_SEGMENTS: u16 = 0x020E;
    pub const SAR_SEGMENT_SEQNUM: u16 = 0x020F;
    pub const SC_INTERFACE_VERSION: u16 = 0x0210;
    pub const MORE_MESSAGES_TO_SEND: u16 = 0x0426;
    pub const MESSAGE_PAYLOAD: u16 = 0x0424;
    pub const RECEIPTED_MESSAGE_ID: u16 = 0x001E;
    pub const MESSAGE_STATE: u16 = 0x0427;
}

/// Optional parameter: `{tag (2), length (2), value (length)}`.
#[derive(Clone, Debug, PartialEq)]
pub struct Tlv {
    /// Uniquely identifies the optional parameter
    pub tag: u16,

    /// Length of the value field in octets (tag and length not included)
    pub length: u16,

    /// The actual parameter data
    pub value: Bytes,
}

impl Tlv {
    pub fn new(tag: u16, value: Bytes) -> Self {
        Self {
            tag,
            length: value.len() as u16,
            value,
        }
    }

    /// Single-octet integer TLV
    pub fn u8(tag: u16, value: u8) -> Self {
        Self::new(tag, Bytes::copy_from_slice(&[value]))
    }

    /// Two-octet big-endian integer TLV
    pub fn u16(tag: u16, value: u16) -> Self {
        Self::new(tag, Bytes::copy_from_slice(&value.to_be_bytes()))
    }

    pub fn as_u8(&self) -> Option<u8> {
        self.value.first().copied()
    }

    pub fn as_u16(&self) -> Option<u16> {
        match self.value.len() {
            1 => Some(self.value[0] as u16),
            2 => Some(u16::from_be_bytes([self.value[0], self.value[1]])),
            _ => None,
        }
    }

    /// Serialize to bytes (no PDU header, TLVs are body trailers)
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(4 + self.value.len());
        self.encode(&mut buf);
        buf.freeze()
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u16(self.tag);
        buf.put_u16(self.length);
        buf.extend_from_slice(&self.value);
    }

    /// Decode a single TLV from the buffer
    pub fn decode(buf: &mut Cursor<&[u8]>) -> Result<Self, CodecError> {
        if buf.remaining() < 4 {
            return Err(CodecError::Incomplete);
        }

        let tag = buf.get_u16();
        let length = buf.get_u16();

        if buf.remaining() < length as usize {
            return Err(CodecError::TlvOverrun {
                tag,
                declared: length as usize,
                available: buf.remaining(),
            });
        }

        let value = buf.copy_to_bytes(length as usize);

        Ok(Self { tag, length, value })
    }

    /// Decode TLVs until end-of-PDU (`limit` = cursor position one past the body)
    pub fn decode_all(buf: &mut Cursor<&[u8]>, limit: u64) -> Result<Vec<Tlv>, CodecError> {
        let mut tlvs = Vec::new();
        while buf.position() < limit {
            tlvs.push(Tlv::decode(buf)?);
        }
        Ok(tlvs)
    }
}
