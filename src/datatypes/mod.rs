mod bind_transceiver;
mod command_id;
mod command_status;
mod deliver_sm;
mod enquire_link;
pub mod esm_class;
mod generic_nack;
mod submit_sm;
mod tlv;
mod unbind;

pub use bind_transceiver::{BindTransceiver, BindTransceiverResponse, INTERFACE_VERSION_34};
pub use command_id::CommandId;
pub use command_status::CommandStatus;
pub use deliver_sm::{DeliverSm, DeliverSmResponse};
pub use enquire_link::{EnquireLink, EnquireLinkResponse};
pub use generic_nack::GenericNack;
pub use submit_sm::{SubmitSm, SubmitSmResponse};
pub use tlv::{Tlv, tags};
pub use unbind::{Unbind, UnbindResponse};

// SMPP v3.4 field length limits (including the NUL terminator)
pub const MAX_SYSTEM_ID_LENGTH: usize = 16;
pub const MAX_PASSWORD_LENGTH: usize = 9;
pub const MAX_ADDRESS_LENGTH: usize = 21;
pub const MAX_SHORT_MESSAGE_LENGTH: usize = 254;
