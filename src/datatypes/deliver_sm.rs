use crate::codec::{
    CodecError, Decodable, Encodable, PduHeader, decode_cstring, decode_octet_string, decode_u8,
    encode_cstring_opt,
};
use crate::datatypes::tlv::{Tlv, tags};
use crate::datatypes::{CommandId, CommandStatus};
use bytes::{BufMut, Bytes, BytesMut};
use std::io::Cursor;

/// deliver_sm (Section 4.6.1): the SMSC delivers a message to the ESME. The
/// same wire layout as submit_sm; carries mobile-originated messages and,
/// when flagged in esm_class, delivery receipts.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct DeliverSm {
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
    /// Always NUL on the wire for deliver_sm
    pub schedule_delivery_time: Option<String>,
    /// Always NUL on the wire for deliver_sm
    pub validity_period: Option<String>,
    pub registered_delivery: u8,
    pub replace_if_present_flag: u8,
    pub data_coding: u8,
    pub sm_default_msg_id: u8,
    pub short_message: Bytes,

    // Optional parameters (SAR reassembly and receipt correlation)
    pub sar_msg_ref_num: Option<u16>,
    pub sar_total_segments: Option<u8>,
    pub sar_segment_seqnum: Option<u8>,
    pub receipted_message_id: Option<String>,
    pub extra_tlvs: Vec<Tlv>,
}

/// deliver_sm_resp (Section 4.6.2). The message_id field is unused and always
/// encodes as a single NUL.
#[derive(Clone, Debug, PartialEq)]
pub struct DeliverSmResponse {
    pub command_status: CommandStatus,
    pub sequence_number: u32,
}

impl DeliverSmResponse {
    pub fn ok(sequence_number: u32) -> Self {
        Self {
            command_status: CommandStatus::Ok,
            sequence_number,
        }
    }
}

impl Encodable for DeliverSm {
    fn encode(&self, buf: &mut BytesMut) -> Result<(), CodecError> {
        if self.short_message.len() > 254 {
            return Err(CodecError::FieldValidation {
                field: "short_message",
                reason: format!("{} octets exceeds the 254 octet limit", self.short_message.len()),
            });
        }

        let header = PduHeader {
            command_length: 0, // fixed up by to_bytes
            command_id: CommandId::DeliverSm as u32,
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
        if let Some(msgid) = &self.receipted_message_id {
            let mut value = msgid.as_bytes().to_vec();
            value.push(0);
            Tlv::new(tags::RECEIPTED_MESSAGE_ID, Bytes::from(value)).encode(buf);
        }
        for tlv in &self.extra_tlvs {
            tlv.encode(buf);
        }
        Ok(())
    }
}

impl Decodable for DeliverSm {
    fn command_id() -> CommandId {
        CommandId::DeliverSm
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
        let mut pdu = DeliverSm {
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
                tags::RECEIPTED_MESSAGE_ID => {
                    let raw = tlv.value.as_ref();
                    let trimmed = raw.strip_suffix(&[0u8]).unwrap_or(raw);
                    pdu.receipted_message_id =
                        String::from_utf8(trimmed.to_vec()).ok();
                }
                _ => pdu.extra_tlvs.push(tlv),
            }
        }

        Ok(pdu)
    }
}

impl Encodable for DeliverSmResponse {
    fn encode(&self, buf: &mut BytesMut) -> Result<(), CodecError> {
        let header = PduHeader {
            command_length: 0,
            command_id: CommandId::DeliverSmResp as u32,
            command_status: self.command_status as u32,
            sequence_number: self.sequence_number,
        };
        header.encode(buf);

        // Unused message_id field, a single NUL
        buf.put_u8(0);
        Ok(())
    }
}

impl Decodable for DeliverSmResponse {
    fn command_id() -> CommandId {
        CommandId::DeliverSmResp
    }

    fn decode(header: PduHeader, buf: &mut Cursor<&[u8]>) -> Result<Self, CodecError> {
        Self::validate_header(&header)?;

        let end = buf.position() - PduHeader::SIZE as u64 + header.command_length as u64;
        if buf.position() < end {
            decode_cstring(buf, 65, "message_id")?;
        }
        buf.set_position(end);

        Ok(DeliverSmResponse {
            command_status: header.status(),
            sequence_number: header.sequence_number,
        })
    }
}
