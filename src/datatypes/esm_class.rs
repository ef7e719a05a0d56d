// esm_class bitfield helpers. The gateway composes esm_class values
// arithmetically when building PDU templates and classifies inbound
// deliver_sm PDUs by their message-type bits, so this is a constants module
// rather than a struct-per-bitfield type.

/// Messaging mode, bits 1-0
pub const MODE_DEFAULT: u8 = 0x00;
pub const MODE_DATAGRAM: u8 = 0x01;
pub const MODE_FORWARD: u8 = 0x02;
pub const MODE_STORE_AND_FORWARD: u8 = 0x03;

/// Message type, bits 5-2
pub const TYPE_DEFAULT: u8 = 0x00;
/// deliver_sm contains an SMSC delivery receipt
pub const TYPE_SMSC_DELIVERY_RECEIPT: u8 = 0x04;
/// deliver_sm contains an SME delivery acknowledgement
pub const TYPE_DELIVERY_ACK: u8 = 0x08;
/// deliver_sm contains an SME manual/user acknowledgement
pub const TYPE_MANUAL_ACK: u8 = 0x10;
/// deliver_sm contains an intermediate delivery notification
pub const TYPE_INTERMEDIATE_NOTIFICATION: u8 = 0x20;

/// GSM network features, bits 7-6
pub const GSM_UDHI: u8 = 0x40;
pub const GSM_REPLY_PATH: u8 = 0x80;

const TYPE_MASK: u8 = 0x3C;
const RECEIPT_MASK: u8 = TYPE_SMSC_DELIVERY_RECEIPT | TYPE_DELIVERY_ACK | TYPE_MANUAL_ACK;

/// The message-type bits of an esm_class value
pub fn message_type(esm_class: u8) -> u8 {
    esm_class & TYPE_MASK
}

/// True when the UDHI bit is set (short_message starts with a UDH)
pub fn has_udhi(esm_class: u8) -> bool {
    esm_class & GSM_UDHI != 0
}

/// True when the deliver_sm carries a delivery receipt or acknowledgement
pub fn is_receipt(esm_class: u8) -> bool {
    esm_class & RECEIPT_MASK != 0
}

/// True when the message-type bits are the default (a plain MO message)
pub fn is_default_type(esm_class: u8) -> bool {
    message_type(esm_class) == TYPE_DEFAULT
}
