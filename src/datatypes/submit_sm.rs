use crate::codec::{
    CodecError, Decodable, Encodable, PduHeader, decode_cstring, decode_octet_string, decode_u8,
    encode_cstring_opt,
};
use crate::datatypes::tlv::{Tlv, tags};
use crate::datatypes::{CommandId, CommandStatus};
use bytes::{BufMut, Bytes, BytesMut};
use std::io::Cursor;

/// submit_sm (Section 4.4.1): an ESME submits a short message to the SMSC for
/// onward transmission. Mandatory parameters in wire order, plus the optional
/// parameters the gateway emits for concatenated messages.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct SubmitSm {
    pub sequence_number: u32,

    // Mandatory parameters
    pub service_type: Option<String>,
    pub source_addr_ton: u8,
    pub source_addr_npi: u8,
    pub source_addr: Option<String>,
    pub dest_addr_ton: u8,
    pub dest_addr_npi: u8,
    pub destination_addr: String,
    pub esm_class: u8,
    pub protocol_id: u8,
    pub priority_flag: u8,
    pub schedule_delivery_time: Option<String>,
    pub validity_period: Option<String>,
    pub registered_delivery: u8,
    pub replace_if_present_flag: u8,
    pub data_coding: u8,
    pub sm_default_msg_id: u8,
    /// Raw message octets; sm_length on the wire is this length
    pub short_message: Bytes,

    // Optional parameters (SAR concatenation and UDH pipelining)
    pub sar_msg_ref_num: Option<u16>,
    pub sar_total_segments: Option<u8>,
    pub sar_segment_seqnum: Option<u8>,
    pub more_messages_to_send: Option<u8>,
    /// Any other TLVs, carried opaquely
    pub extra_tlvs: Vec<Tlv>,
}

/// submit_sm_resp (Section 4.4.2). The message_id body is only present on a
/// successful response.
#[derive(Clone, Debug, PartialEq)]
pub struct SubmitSmResponse {
    pub command_status: CommandStatus,
    pub sequence_number: u32,

    // Body
    pub message_id: String,
}

impl SubmitSmResponse {
    pub fn ok(sequence_number: u32, message_id: &str) -> Self {
        Self {
            command_status: CommandStatus::Ok,
            sequence_number,
            message_id: message_id.to_string(),
        }
    }

    pub fn error(sequence_number: u32, status: CommandStatus) -> Self {
        Self {
            command_status: status,
            sequence_number,
            message_id: String::new(),
        }
    }
}

impl Encodable for SubmitSm {
    fn encode(&self, buf: &mut BytesMut) -> Result<(), CodecError> {
        if self.short_message.len() > 254 {
            return Err(CodecError::FieldValidation {
                field: "short_message",
                reason: format!("{} octets exceeds the 254 octet limit", self.short_message.len()),
            });
        }

        let header = PduHeader {
            command_length: 0, // fixed up by to_bytes
            command_id: CommandId::SubmitSm as u32,
            command_status: 0,
            sequence_number: self.sequence_number,
        };
        header.encode(buf);

        encode_cstring_opt(buf, self.service_type.as_deref(), 6);
        buf.put_u8(self.source_addr_ton);
        buf.put_u8(self.source_addr_npi);
        encode_cstring_opt(buf, self.source_addr.as_deref(), 21);
        buf.put_u8(self.dest_addr_ton);
        buf.put_u8(self.dest_addr_npi);
        encode_cstring_opt(buf, Some(&self.destination_addr), 21);
        buf.put_u8(self.esm_class);
        buf.put_u8(self.protocol_id);
        buf.put_u8(self.priority_flag);
        encode_cstring_opt(buf, self.schedule_delivery_time.as_deref(), 17);
        encode_cstring_opt(buf, self.validity_period.as_deref(), 17);
        buf.put_u8(self.registered_delivery);
        buf.put_u8(self.replace_if_present_flag);
        buf.put_u8(self.data_coding);
        buf.put_u8(self.sm_default_msg_id);
        buf.put_u8(self.short_message.len() as u8);
        buf.extend_from_slice(&self.short_message);

        if let Some(ref_num) = self.sar_msg_ref_num {
            Tlv::u16(tags::SAR_MSG_REF_NUM, ref_num).encode(buf);
        }
        if let Some(total) = self.sar_total_segments {
            Tlv::u8(tags::SAR_TOTAL_SEGMENTS, total).encode(buf);
        }
        if let Some(seqnum) = self.sar_segment_seqnum {
            Tlv::u8(tags::SAR_SEGMENT_SEQNUM, seqnum).encode(buf);
        }
        if let Some(more) = self.more_messages_to_send {
            Tlv::u8(tags::MORE_MESSAGES_TO_SEND, more).encode(buf);
        }
        for tlv in &self.extra_tlvs {
            tlv.encode(buf);
        }
        Ok(())
    }
}

impl Decodable for SubmitSm {
    fn command_id() -> CommandId {
        CommandId::SubmitSm
    }

    fn decode(header: PduHeader, buf: &mut Cursor<&[u8]>) -> Result<Self, CodecError> {
        Self::validate_header(&header)?;

        let end = buf.position() - PduHeader::SIZE as u64 + header.command_length as u64;

        let service_type = decode_cstring(buf, 6, "service_type")?;
        let source_addr_ton = decode_u8(buf)?;
        let source_addr_npi = decode_u8(buf)?;
        let source_addr = decode_cstring(buf, 21, "source_addr")?;
        let dest_addr_ton = decode_u8(buf)?;
        let dest_addr_npi = decode_u8(buf)?;
        let destination_addr = decode_cstring(buf, 21, "destination_addr")?;
        let esm_class = decode_u8(buf)?;
        let protocol_id = decode_u8(buf)?;
        let priority_flag = decode_u8(buf)?;
        let schedule_delivery_time = decode_cstring(buf, 17, "schedule_delivery_time")?;
        let validity_period = decode_cstring(buf, 17, "validity_period")?;
        let registered_delivery = decode_u8(buf)?;
        let replace_if_present_flag = decode_u8(buf)?;
        let data_coding = decode_u8(buf)?;
        let sm_default_msg_id = decode_u8(buf)?;
        let sm_length = decode_u8(buf)? as usize;
        let short_message = decode_octet_string(buf, sm_length)?;

        let tlvs = Tlv::decode_all(buf, end)?;
        let mut pdu = SubmitSm {
            sequence_number: header.sequence_number,
            service_type: (!service_type.is_empty()).then_some(service_type),
            source_addr_ton,
            source_addr_npi,
            source_addr: (!source_addr.is_empty()).then_some(source_addr),
            dest_addr_ton,
            dest_addr_npi,
            destination_addr,
            esm_class,
            protocol_id,
            priority_flag,
            schedule_delivery_time: (!schedule_delivery_time.is_empty())
                .then_some(schedule_delivery_time),
            validity_period: (!validity_period.is_empty()).then_some(validity_period),
            registered_delivery,
            replace_if_present_flag,
            data_coding,
            sm_default_msg_id,
            short_message,
            ..Default::default()
        };

        for tlv in tlvs {
            match tlv.tag {
                tags::SAR_MSG_REF_NUM => pdu.sar_msg_ref_num = tlv.as_u16(),
                tags::SAR_TOTAL_SEGMENTS => pdu.sar_total_segments = tlv.as_u8(),
                tags::SAR_SEGMENT_SEQNUM => pdu.sar_segment_seqnum = tlv.as_u8(),
                tags::MORE_MESSAGES_TO_SEND => pdu.more_messages_to_send = tlv.as_u8(),
                _ => pdu.extra_tlvs.push(tlv),
            }
        }

        Ok(pdu)
    }
}

impl Encodable for SubmitSmResponse {
    fn encode(&self, buf: &mut BytesMut) -> Result<(), CodecError> {
        let header = PduHeader {
            command_length: 0,
            command_id: CommandId::SubmitSmResp as u32,
            command_status: self.command_status as u32,
            sequence_number: self.sequence_number,
        };
        header.encode(buf);

        if self.command_status == CommandStatus::Ok {
            encode_cstring_opt(buf, Some(&self.message_id), 65);
        }
        Ok(())
    }
}

impl Decodable for SubmitSmResponse {
    fn command_id() -> CommandId {
        CommandId::SubmitSmResp
    }

    fn decode(header: PduHeader, buf: &mut Cursor<&[u8]>) -> Result<Self, CodecError> {
        Self::validate_header(&header)?;

        let end = buf.position() - PduHeader::SIZE as u64 + header.command_length as u64;
        let message_id = if buf.position() < end {
            decode_cstring(buf, 65, "message_id")?
        } else {
            String::new()
        };
        // Skip any TLVs appended after the body
        buf.set_position(end);

        Ok(SubmitSmResponse {
            command_status: header.status(),
            sequence_number: header.sequence_number,
            message_id,
        })
    }
}
