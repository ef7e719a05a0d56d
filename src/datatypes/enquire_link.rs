use crate::codec::{CodecError, Decodable, Encodable, PduHeader};
use crate::datatypes::CommandId;
use bytes::BytesMut;
use std::io::Cursor;

/// Link verification request. Either peer may send one at any time while
/// bound; the other must answer with enquire_link_resp.
#[derive(Clone, Debug, PartialEq)]
pub struct EnquireLink {
    // EnquireLink always sets the command status to NULL
    pub sequence_number: u32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct EnquireLinkResponse {
    // EnquireLinkResponse always sets the command status to ESME_ROK
    pub sequence_number: u32,
}

impl EnquireLink {
    pub fn new(sequence_number: u32) -> Self {
        Self { sequence_number }
    }
}

impl EnquireLinkResponse {
    pub fn new(sequence_number: u32) -> Self {
        Self { sequence_number }
    }
}

impl Encodable for EnquireLink {
    fn encode(&self, buf: &mut BytesMut) -> Result<(), CodecError> {
        let header = PduHeader {
            command_length: PduHeader::SIZE as u32,
            command_id: CommandId::EnquireLink as u32,
            command_status: 0,
            sequence_number: self.sequence_number,
        };
        header.encode(buf);
        Ok(())
    }
}

impl Decodable for EnquireLink {
    fn command_id() -> CommandId {
        CommandId::EnquireLink
    }

    fn decode(header: PduHeader, _buf: &mut Cursor<&[u8]>) -> Result<Self, CodecError> {
        Self::validate_header(&header)?;
        Ok(EnquireLink {
            sequence_number: header.sequence_number,
        })
    }
}

impl Encodable for EnquireLinkResponse {
    fn encode(&self, buf: &mut BytesMut) -> Result<(), CodecError> {
        let header = PduHeader {
            command_length: PduHeader::SIZE as u32,
            command_id: CommandId::EnquireLinkResp as u32,
            command_status: 0,
            sequence_number: self.sequence_number,
        };
        header.encode(buf);
        Ok(())
    }
}

impl Decodable for EnquireLinkResponse {
    fn command_id() -> CommandId {
        CommandId::EnquireLinkResp
    }

    fn decode(header: PduHeader, _buf: &mut Cursor<&[u8]>) -> Result<Self, CodecError> {
        Self::validate_header(&header)?;
        Ok(EnquireLinkResponse {
            sequence_number: header.sequence_number,
        })
    }
}
