//! Delivery-receipt text parsing and the DLR event/record types.
//!
//! A receipt-flagged deliver_sm carries a status line in `short_message`:
//!
//! ```text
//! id:IIIIIIIIII sub:SSS dlvrd:DDD submit date:YYMMDDHHMM done date:YYMMDDHHMM stat:ZZZZZZZ err:YYY text: ...
//! ```
//!
//! Fields are extracted individually; `id` and `stat` are required, the rest
//! default to `"ND"` (`text` to the empty string).

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

static RE_ID: Lazy<Regex> = Lazy::new(|| Regex::new(r"id:([\dA-Za-z\-_]+)").expect("valid regex"));
static RE_SUB: Lazy<Regex> = Lazy::new(|| Regex::new(r"sub:(\d{3})").expect("valid regex"));
static RE_DLVRD: Lazy<Regex> = Lazy::new(|| Regex::new(r"dlvrd:(\d{3})").expect("valid regex"));
static RE_SDATE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"submit date:(\d+)").expect("valid regex"));
static RE_DDATE: Lazy<Regex> = Lazy::new(|| Regex::new(r"done date:(\d+)").expect("valid regex"));
static RE_STAT: Lazy<Regex> = Lazy::new(|| Regex::new(r"stat:(\w{7})").expect("valid regex"));
static RE_ERR: Lazy<Regex> = Lazy::new(|| Regex::new(r"err:(\w{3})").expect("valid regex"));
static RE_TEXT: Lazy<Regex> = Lazy::new(|| Regex::new(r"text:(.*)").expect("valid regex"));

/// Fields parsed out of a delivery-receipt status line.
#[derive(Debug, Clone, PartialEq)]
pub struct DlrInfo {
    /// SMSC message id the receipt refers to
    pub id: String,
    pub sub: String,
    pub dlvrd: String,
    pub sdate: String,
    pub ddate: String,
    /// Final message state, e.g. DELIVRD / EXPIRED / UNDELIV
    pub stat: String,
    pub err: String,
    pub text: String,
}

fn capture(re: &Regex, text: &str) -> Option<String> {
    re.captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// Parse receipt text. Returns `None` when `id` or `stat` is missing, the
/// caller warns and drops such receipts.
pub fn parse_dlr_text(raw: &[u8]) -> Option<DlrInfo> {
    let text = String::from_utf8_lossy(raw);

    let id = capture(&RE_ID, &text)?;
    let stat = capture(&RE_STAT, &text)?;

    Some(DlrInfo {
        id,
        stat,
        sub: capture(&RE_SUB, &text).unwrap_or_else(|| "ND".to_string()),
        dlvrd: capture(&RE_DLVRD, &text).unwrap_or_else(|| "ND".to_string()),
        sdate: capture(&RE_SDATE, &text).unwrap_or_else(|| "ND".to_string()),
        ddate: capture(&RE_DDATE, &text).unwrap_or_else(|| "ND".to_string()),
        err: capture(&RE_ERR, &text).unwrap_or_else(|| "ND".to_string()),
        text: capture(&RE_TEXT, &text).unwrap_or_default(),
    })
}

/// HTTP callback requested with an MT submission (`dlr-url`/`dlr-level`/
/// `dlr-method` on the send request).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DlrRequest {
    pub url: String,
    pub level: u8,
    pub method: String,
}

fn default_dlr_level() -> u8 {
    3
}

/// Correlation record stored in the key/value store under the SMSC-returned
/// message id, TTL `dlr_expiry`. Written on the ROK response to the last PDU
/// of a DLR-requesting bundle; read back when the receipt arrives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DlrRecord {
    /// Original HTTP request id
    pub id: String,
    pub url: String,
    pub method: String,
    #[serde(default = "default_dlr_level")]
    pub level: u8,
}

/// Event published to the DLR queue for the poster workers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DlrEvent {
    /// Original HTTP request id
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id_smsc: Option<String>,
    pub connector: String,
    pub level: u8,
    pub method: String,
    pub url: String,
    pub message_status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subdate: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub donedate: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dlvrd: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub err: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    pub retries: u32,
}
