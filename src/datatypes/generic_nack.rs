use crate::codec::{CodecError, Decodable, Encodable, PduHeader};
use crate::datatypes::{CommandId, CommandStatus};
use bytes::BytesMut;
use std::io::Cursor;

/// GenericNack acknowledges receipt of a PDU the receiving entity cannot
/// process, typically a malformed PDU or an unrecognized command_id.
///
/// Header only. The sequence_number echoes the offending PDU; 0 when the
/// original sequence number could not be determined.
#[derive(Clone, Debug, PartialEq)]
pub struct GenericNack {
    /// Reason for the nack
    pub command_status: CommandStatus,
    pub sequence_number: u32,
}

impl GenericNack {
    pub fn new(command_status: CommandStatus, sequence_number: u32) -> Self {
        Self {
            command_status,
            sequence_number,
        }
    }

    /// Nack for an unrecognized command_id
    pub fn invalid_command_id(sequence_number: u32) -> Self {
        Self::new(CommandStatus::InvalidCommandId, sequence_number)
    }

    /// Nack for a PDU whose declared length was wrong
    pub fn invalid_command_length(sequence_number: u32) -> Self {
        Self::new(CommandStatus::InvalidCommandLength, sequence_number)
    }

    /// Nack when the sequence number cannot be recovered from a malformed PDU
    pub fn unknown_sequence() -> Self {
        Self::new(CommandStatus::InvalidCommandLength, 0)
    }
}

impl Encodable for GenericNack {
    fn encode(&self, buf: &mut BytesMut) -> Result<(), CodecError> {
        let header = PduHeader {
            command_length: PduHeader::SIZE as u32,
            command_id: CommandId::GenericNack as u32,
            command_status: self.command_status as u32,
            sequence_number: self.sequence_number,
        };
        header.encode(buf);
        Ok(())
    }
}

impl Decodable for GenericNack {
    fn command_id() -> CommandId {
        CommandId::GenericNack
    }

    fn decode(header: PduHeader, _buf: &mut Cursor<&[u8]>) -> Result<Self, CodecError> {
        Self::validate_header(&header)?;
        Ok(GenericNack {
            command_status: header.status(),
            sequence_number: header.sequence_number,
        })
    }
}
