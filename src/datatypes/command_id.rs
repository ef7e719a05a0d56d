// SMPP v3.4 command identifiers for the PDU set a transceiver gateway speaks.
// Bit 31 of the command_id marks a response PDU.

use num_enum::TryFromPrimitive;

/// SMPP v3.4 Command Identifiers (Table 4-1), transceiver-gateway subset.
///
/// The command_id field identifies the SMPP PDU type; it is a 4-octet field
/// in the PDU header. Reserved ids and the TX/RX-only bind variants are not
/// represented: an incoming PDU with any other id is handled as opaque and
/// answered with generic_nack.
#[derive(TryFromPrimitive)]
#[repr(u32)]
#[derive(Clone, Debug, PartialEq, Eq, Hash, Copy)]
pub enum CommandId {
    /// generic_nack PDU (Section 4.3.1) - Error response for invalid PDUs
    GenericNack = 0x8000_0000,

    // Message Submission Operations (Section 4.4)
    /// submit_sm PDU (Section 4.4.1) - Submit short message
    SubmitSm = 0x0000_0004,
    /// submit_sm_resp PDU (Section 4.4.2) - Response to submit_sm
    SubmitSmResp = 0x8000_0004,

    // Message Delivery Operations (Section 4.6)
    /// deliver_sm PDU (Section 4.6.1) - Deliver message to ESME
    DeliverSm = 0x0000_0005,
    /// deliver_sm_resp PDU (Section 4.6.2) - Response to deliver_sm
    DeliverSmResp = 0x8000_0005,

    // Session Management Operations (Section 4.2)
    /// unbind PDU (Section 4.2.1) - Unbind from SMSC
    Unbind = 0x0000_0006,
    /// unbind_resp PDU (Section 4.2.2) - Response to unbind
    UnbindResp = 0x8000_0006,

    // Transceiver Operations (Section 4.2.5-4.2.6)
    /// bind_transceiver PDU (Section 4.2.5) - Bind as transceiver (TX+RX)
    BindTransceiver = 0x0000_0009,
    /// bind_transceiver_resp PDU (Section 4.2.6) - Response to bind_transceiver
    BindTransceiverResp = 0x8000_0009,

    // Link Management Operations (Section 4.11)
    /// enquire_link PDU (Section 4.11.1) - Link verification request
    EnquireLink = 0x0000_0015,
    /// enquire_link_resp PDU (Section 4.11.2) - Response to enquire_link
    EnquireLinkResp = 0x8000_0015,
}

impl CommandId {
    /// Check if this command_id represents a response PDU
    pub fn is_response(&self) -> bool {
        (*self as u32) & 0x8000_0000 != 0
    }
}
