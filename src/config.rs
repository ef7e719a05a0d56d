//! Structured configuration records.
//!
//! Config *parsing* (INI files, flags) is an external collaborator; these are
//! the records it produces. Defaults follow the reference deployment:
//! national/ISDN source numbering, international/ISDN destination numbering,
//! 30 s reconnect delay and enquire-link interval, 24 h DLR expiry.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use crate::queue::connector_queue_name;

/// Fixed base names for the outbound event queues
pub const DLR_QUEUE: &str = "dlr";
pub const MO_QUEUE: &str = "mo";

fn default_true() -> bool {
    true
}

fn default_port() -> u16 {
    2775
}

fn default_conn_loss_delay() -> u64 {
    30
}

fn default_enquire_link_interval() -> u64 {
    30
}

fn default_bind_timeout_ms() -> u64 {
    150
}

fn default_submit_timeout_ms() -> u64 {
    500
}

fn default_enquire_link_timeout_ms() -> u64 {
    150
}

fn default_dlr_expiry() -> u64 {
    86_400
}

fn default_mo_part_ttl() -> u64 {
    300
}

fn default_submit_throughput() -> u32 {
    1
}

fn default_src_ton() -> u8 {
    2 // national
}

fn default_src_npi() -> u8 {
    1 // ISDN
}

fn default_dst_ton() -> u8 {
    1 // international
}

fn default_dst_npi() -> u8 {
    1 // ISDN
}

fn default_bind_npi() -> u8 {
    1
}

fn default_status_refresh_interval() -> u64 {
    120
}

/// One `smpp_bind:<name>` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectorConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub systemid: String,
    pub password: String,
    #[serde(default)]
    pub system_type: Option<String>,
    #[serde(default)]
    pub addr_range: Option<String>,
    #[serde(default)]
    pub bind_ton: u8,
    #[serde(default = "default_bind_npi")]
    pub bind_npi: u8,

    #[serde(default)]
    pub disabled: bool,
    #[serde(default = "default_true")]
    pub conn_loss_retry: bool,
    /// Seconds between reconnect attempts
    #[serde(default = "default_conn_loss_delay")]
    pub conn_loss_delay: u64,
    /// Seconds between enquire_link keepalives
    #[serde(default = "default_enquire_link_interval")]
    pub enquire_link_interval: u64,
    #[serde(default = "default_bind_timeout_ms")]
    pub bind_timeout_ms: u64,
    #[serde(default = "default_submit_timeout_ms")]
    pub submit_timeout_ms: u64,
    #[serde(default = "default_enquire_link_timeout_ms")]
    pub enquire_link_timeout_ms: u64,
    /// Seconds a DLR correlation record stays retrievable
    #[serde(default = "default_dlr_expiry")]
    pub dlr_expiry: u64,
    /// Seconds multipart MO segments wait for their siblings
    #[serde(default = "default_mo_part_ttl")]
    pub mo_part_ttl: u64,
    /// Drop incomplete multipart MO messages instead of flushing what arrived
    #[serde(default)]
    pub multipart_strict: bool,
    /// Declared submits/second; consumed as the queue prefetch bound
    #[serde(default = "default_submit_throughput")]
    pub submit_throughput: u32,

    // PDU parameter overlay applied to queued templates (unless locked)
    #[serde(default)]
    pub protocol_id: Option<u8>,
    #[serde(default)]
    pub replace_if_present_flag: u8,
    #[serde(default)]
    pub service_type: Option<String>,
    #[serde(default = "default_src_ton")]
    pub source_addr_ton: u8,
    #[serde(default = "default_src_npi")]
    pub source_addr_npi: u8,
    #[serde(default = "default_dst_ton")]
    pub dest_addr_ton: u8,
    #[serde(default = "default_dst_npi")]
    pub dest_addr_npi: u8,
    #[serde(default)]
    pub sm_default_msg_id: u8,
}

impl ConnectorConfig {
    pub fn bind_timeout(&self) -> Duration {
        Duration::from_millis(self.bind_timeout_ms)
    }

    pub fn submit_timeout(&self) -> Duration {
        Duration::from_millis(self.submit_timeout_ms)
    }

    pub fn enquire_link_timeout(&self) -> Duration {
        Duration::from_millis(self.enquire_link_timeout_ms)
    }

    pub fn enquire_link_period(&self) -> Duration {
        Duration::from_secs(self.enquire_link_interval)
    }

    pub fn conn_loss_delay(&self) -> Duration {
        Duration::from_secs(self.conn_loss_delay)
    }

    pub fn dlr_expiry(&self) -> Duration {
        Duration::from_secs(self.dlr_expiry)
    }

    pub fn mo_part_ttl(&self) -> Duration {
        Duration::from_secs(self.mo_part_ttl)
    }
}

/// Queue transport settings (`mq` section).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MqConfig {
    /// Prefix prepended to every queue name (a trailing `_` is added)
    #[serde(default)]
    pub name_prefix: String,
    #[serde(default)]
    pub use_fifo: bool,
}

impl MqConfig {
    pub fn prefix(&self) -> String {
        if self.name_prefix.is_empty() {
            String::new()
        } else {
            format!("{}_", self.name_prefix)
        }
    }

    pub fn suffix(&self) -> &'static str {
        if self.use_fifo { ".fifo" } else { "" }
    }
}

/// One `filter:<name>` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterConfig {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub regex: Option<String>,
    #[serde(default)]
    pub tag: Option<i64>,
    #[serde(default)]
    pub connector: Option<String>,
}

/// One `mt_route:<priority>` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteConfig {
    /// "static", "default" or "smartrr"
    #[serde(rename = "type")]
    pub kind: String,
    /// Target for static/default routes
    #[serde(default)]
    pub connector: Option<String>,
    /// Ordered candidates for smartrr routes
    #[serde(default)]
    pub connectors: Vec<String>,
    /// Filter names, evaluated in order
    #[serde(default)]
    pub filters: Vec<String>,
}

/// The whole gateway configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub mq: MqConfig,
    #[serde(default)]
    pub connectors: HashMap<String, ConnectorConfig>,
    #[serde(default)]
    pub filters: HashMap<String, FilterConfig>,
    /// Keyed by priority, evaluated highest first
    #[serde(default)]
    pub mt_routes: BTreeMap<u32, RouteConfig>,
    /// Seconds between connector-status pushes into the route table
    #[serde(default = "default_status_refresh_interval")]
    pub status_refresh_interval: u64,
}

impl GatewayConfig {
    /// The MT work-queue name for a connector
    pub fn connector_queue(&self, connector: &str) -> String {
        connector_queue_name(&self.mq.prefix(), connector, self.mq.suffix())
    }

    pub fn dlr_queue(&self) -> String {
        format!("{}{}{}", self.mq.prefix(), DLR_QUEUE, self.mq.suffix())
    }

    pub fn mo_queue(&self) -> String {
        format!("{}{}{}", self.mq.prefix(), MO_QUEUE, self.mq.suffix())
    }
}
