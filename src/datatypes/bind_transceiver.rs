use crate::codec::{
    CodecError, Decodable, Encodable, PduHeader, decode_cstring, decode_u8, encode_cstring,
    encode_cstring_opt,
};
use crate::datatypes::tlv::{Tlv, tags};
use crate::datatypes::{CommandId, CommandStatus};
use bytes::BytesMut;
use std::io::Cursor;

/// SMPP v3.4 interface version octet carried in bind PDUs and the
/// sc_interface_version TLV.
pub const INTERFACE_VERSION_34: u8 = 0x34;

/// bind_transceiver (Section 4.2.5): registers the ESME with the SMSC over a
/// single connection carrying both submit and deliver traffic. The only bind
/// variant this gateway issues.
#[derive(Clone, Debug, PartialEq)]
pub struct BindTransceiver {
    pub sequence_number: u32,

    // Body
    /// 5.2.1 system_id: identifies the ESME to the SMSC, up to 16 octets
    /// including the terminator.
    pub system_id: String,
    /// 5.2.2 password: up to 9 octets including the terminator; a NUL when
    /// the SMSC requires none.
    pub password: Option<String>,
    /// 5.2.3 system_type: categorizes the ESME ("VMS", "OTA", ...), up to 13
    /// characters; frequently empty.
    pub system_type: Option<String>,
    /// 5.2.4 interface_version supported by the ESME.
    pub interface_version: u8,
    /// 5.2.5 addr_ton of the address range served via this session.
    pub addr_ton: u8,
    /// 5.2.6 addr_npi of the address range served via this session.
    pub addr_npi: u8,
    /// 5.2.7 address_range of SME addresses serviced by the ESME.
    pub address_range: Option<String>,
}

/// bind_transceiver_resp (Section 4.2.6). A successful response may carry the
/// sc_interface_version TLV announcing the SMSC's supported version.
#[derive(Clone, Debug, PartialEq)]
pub struct BindTransceiverResponse {
    pub command_status: CommandStatus,
    pub sequence_number: u32,

    // Body
    pub system_id: String,
    /// TLV 0x0210, SMSC interface version
    pub sc_interface_version: Option<u8>,
}

impl BindTransceiverResponse {
    pub fn ok(sequence_number: u32, system_id: &str) -> Self {
        Self {
            command_status: CommandStatus::Ok,
            sequence_number,
            system_id: system_id.to_string(),
            sc_interface_version: Some(INTERFACE_VERSION_34),
        }
    }

    pub fn error(sequence_number: u32, status: CommandStatus) -> Self {
        Self {
            command_status: status,
            sequence_number,
            system_id: String::new(),
            sc_interface_version: None,
        }
    }
}

impl Encodable for BindTransceiver {
    fn encode(&self, buf: &mut BytesMut) -> Result<(), CodecError> {
        let header = PduHeader {
            command_length: 0, // fixed up by to_bytes
            command_id: CommandId::BindTransceiver as u32,
            command_status: 0,
            sequence_number: self.sequence_number,
        };
        header.encode(buf);

        encode_cstring(buf, &self.system_id, 16);
        encode_cstring_opt(buf, self.password.as_deref(), 9);
        encode_cstring_opt(buf, self.system_type.as_deref(), 13);
        buf.extend_from_slice(&[self.interface_version, self.addr_ton, self.addr_npi]);
        encode_cstring_opt(buf, self.address_range.as_deref(), 41);
        Ok(())
    }
}

impl Decodable for BindTransceiver {
    fn command_id() -> CommandId {
        CommandId::BindTransceiver
    }

    fn decode(header: PduHeader, buf: &mut Cursor<&[u8]>) -> Result<Self, CodecError> {
        Self::validate_header(&header)?;

        let system_id = decode_cstring(buf, 16, "system_id")?;
        let password = decode_cstring(buf, 9, "password")?;
        let system_type = decode_cstring(buf, 13, "system_type")?;
        let interface_version = decode_u8(buf)?;
        let addr_ton = decode_u8(buf)?;
        let addr_npi = decode_u8(buf)?;
        let address_range = decode_cstring(buf, 41, "address_range")?;

        Ok(BindTransceiver {
            sequence_number: header.sequence_number,
            system_id,
            password: (!password.is_empty()).then_some(password),
            system_type: (!system_type.is_empty()).then_some(system_type),
            interface_version,
            addr_ton,
            addr_npi,
            address_range: (!address_range.is_empty()).then_some(address_range),
        })
    }
}

impl Encodable for BindTransceiverResponse {
    fn encode(&self, buf: &mut BytesMut) -> Result<(), CodecError> {
        let header = PduHeader {
            command_length: 0,
            command_id: CommandId::BindTransceiverResp as u32,
            command_status: self.command_status as u32,
            sequence_number: self.sequence_number,
        };
        header.encode(buf);

        // A rejected bind carries no body at all
        if self.command_status == CommandStatus::Ok {
            encode_cstring(buf, &self.system_id, 16);
            if let Some(version) = self.sc_interface_version {
                Tlv::u8(tags::SC_INTERFACE_VERSION, version).encode(buf);
            }
        }
        Ok(())
    }
}

impl Decodable for BindTransceiverResponse {
    fn command_id() -> CommandId {
        CommandId::BindTransceiverResp
    }

    fn decode(header: PduHeader, buf: &mut Cursor<&[u8]>) -> Result<Self, CodecError> {
        Self::validate_header(&header)?;

        // The cursor may hold coalesced PDUs; this PDU's body ends at
        // command_length, not at the end of the read buffer.
        let end = buf.position() - PduHeader::SIZE as u64 + header.command_length as u64;
        let command_status = header.status();

        if buf.position() >= end {
            return Ok(BindTransceiverResponse {
                command_status,
                sequence_number: header.sequence_number,
                system_id: String::new(),
                sc_interface_version: None,
            });
        }

        let system_id = decode_cstring(buf, 16, "system_id")?;
        let tlvs = Tlv::decode_all(buf, end)?;
        let sc_interface_version = tlvs
            .iter()
            .find(|t| t.tag == tags::SC_INTERFACE_VERSION)
            .and_then(Tlv::as_u8);

        Ok(BindTransceiverResponse {
            command_status,
            sequence_number: header.sequence_number,
            system_id,
            sc_interface_version,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_bind() -> BindTransceiver {
        BindTransceiver {
            sequence_number: 1,
            system_id: "test1".to_string(),
            password: Some("testpw".to_string()),
            system_type: None,
            interface_version: INTERFACE_VERSION_34,
            addr_ton: 0,
            addr_npi: 1,
            address_range: None,
        }
    }

    #[test]
    fn bind_transceiver_roundtrip() {
        let original = sample_bind();
        let bytes = original.to_bytes();

        let mut cursor = Cursor::new(bytes.as_ref());
        let header = PduHeader::decode(&mut cursor).unwrap();
        assert_eq!(header.typed_command(), Some(CommandId::BindTransceiver));

        let decoded = BindTransceiver::decode(header, &mut cursor).unwrap();
        assert_eq!(original, decoded);
    }

    #[test]
    fn bind_transceiver_wire_layout() {
        let bytes = sample_bind().to_bytes();

        // header + "test1\0" + "testpw\0" + "\0" + 3 octets + "\0"
        assert_eq!(bytes.len(), 16 + 6 + 7 + 1 + 3 + 1);
        assert_eq!(&bytes[16..22], b"test1\0");
        assert_eq!(&bytes[22..29], b"testpw\0");
        assert_eq!(bytes[29], 0); // empty system_type
        assert_eq!(bytes[30], 0x34);
    }

    #[test]
    fn bind_resp_roundtrip_with_tlv() {
        let original = BindTransceiverResponse::ok(1, "smsc-sim");
        let bytes = original.to_bytes();

        let mut cursor = Cursor::new(bytes.as_ref());
        let header = PduHeader::decode(&mut cursor).unwrap();
        let decoded = BindTransceiverResponse::decode(header, &mut cursor).unwrap();
        assert_eq!(original, decoded);
        assert_eq!(decoded.sc_interface_version, Some(0x34));
    }

    #[test]
    fn bind_resp_error_has_no_body() {
        let original = BindTransceiverResponse::error(5, CommandStatus::InvalidPassword);
        let bytes = original.to_bytes();
        assert_eq!(bytes.len(), 16);

        let mut cursor = Cursor::new(bytes.as_ref());
        let header = PduHeader::decode(&mut cursor).unwrap();
        let decoded = BindTransceiverResponse::decode(header, &mut cursor).unwrap();
        assert_eq!(decoded.command_status, CommandStatus::InvalidPassword);
        assert_eq!(decoded.sc_interface_version, None);
    }
}
