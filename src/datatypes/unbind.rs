use crate::codec::{CodecError, Decodable, Encodable, PduHeader};
use crate::datatypes::{CommandId, CommandStatus};
use bytes::BytesMut;
use std::io::Cursor;

/// The unbind operation deregisters the ESME from the SMSC: a logoff request
/// closing the current SMPP session. No body, header only.
#[derive(Clone, Debug, PartialEq)]
pub struct Unbind {
    pub sequence_number: u32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct UnbindResponse {
    pub command_status: CommandStatus,
    pub sequence_number: u32,
}

impl Unbind {
    pub fn new(sequence_number: u32) -> Self {
        Self { sequence_number }
    }
}

impl UnbindResponse {
    pub fn new(sequence_number: u32) -> Self {
        Self {
            command_status: CommandStatus::Ok,
            sequence_number,
        }
    }
}

impl Encodable for Unbind {
    fn encode(&self, buf: &mut BytesMut) -> Result<(), CodecError> {
        let header = PduHeader {
            command_length: PduHeader::SIZE as u32,
            command_id: CommandId::Unbind as u32,
            command_status: 0,
            sequence_number: self.sequence_number,
        };
        header.encode(buf);
        Ok(())
    }
}

impl Decodable for Unbind {
    fn command_id() -> CommandId {
        CommandId::Unbind
    }

    fn decode(header: PduHeader, _buf: &mut Cursor<&[u8]>) -> Result<Self, CodecError> {
        Self::validate_header(&header)?;
        Ok(Unbind {
            sequence_number: header.sequence_number,
        })
    }
}

impl Encodable for UnbindResponse {
    fn encode(&self, buf: &mut BytesMut) -> Result<(), CodecError> {
        let header = PduHeader {
            command_length: PduHeader::SIZE as u32,
            command_id: CommandId::UnbindResp as u32,
            command_status: self.command_status as u32,
            sequence_number: self.sequence_number,
        };
        header.encode(buf);
        Ok(())
    }
}

impl Decodable for UnbindResponse {
    fn command_id() -> CommandId {
        CommandId::UnbindResp
    }

    fn decode(header: PduHeader, _buf: &mut Cursor<&[u8]>) -> Result<Self, CodecError> {
        Self::validate_header(&header)?;
        Ok(UnbindResponse {
            command_status: header.status(),
            sequence_number: header.sequence_number,
        })
    }
}
