//! SMPP v3.4 gateway core.
//!
//! Mediates between HTTP clients and upstream SMSCs: the HTTP front turns
//! send requests into submit_sm bundles, the route table picks a connector,
//! each connector owns one persistent transceiver session, and inbound
//! deliver_sm traffic is reconciled into DLR and MO events on outbound
//! queues for the poster workers.
//!
//! ```text
//! HTTP /send -> pipeline -> route table -> work queue -> connector
//!     -> session.submit -> SMSC -> deliver_sm -> DLR/MO queues
//! ```
//!
//! The queue transport and key/value store are contracts (`queue::QueueTransport`,
//! `kv::KvStore`) with in-memory implementations for tests and single-process
//! runs; production deployments plug in their own.

pub mod codec;
pub mod config;
pub mod connection;
pub mod connector;
pub mod datatypes;
pub mod dlr;
pub mod gsm;
pub mod httpapi;
pub mod interceptor;
pub mod kv;
pub mod mo;
pub mod pipeline;
pub mod queue;
pub mod routing;
pub mod session;
pub mod supervisor;

#[cfg(test)]
mod tests;

pub use codec::{CodecError, Decodable, Encodable, Frame, PduHeader, PduRegistry};
pub use config::GatewayConfig;
pub use connector::Connector;
pub use session::{Session, SessionConfig, SessionError, SessionState};
pub use supervisor::Supervisor;
