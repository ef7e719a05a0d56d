//! The MT pipeline: turn a legacy HTTP send request into a PDU bundle on the
//! selected connector's work queue.
//!
//! Stages: parameter validation, short-message encoding (GSM 03.38 for
//! coding 0, hex passthrough for binary content), segmentation into one or
//! more submit_sm templates (SAR TLVs or in-band UDH concatenation), default
//! parameters, connector parameter overlay, DLR flagging.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

use crate::config::ConnectorConfig;
use crate::datatypes::esm_class;
use crate::dlr::DlrRequest;
use crate::gsm::gsm_encode;

/// Upper bound on the parts of one concatenated message
pub const LONG_CONTENT_MAX_PARTS: usize = 5;

/// registered_delivery value requesting an SMSC delivery receipt
pub const SMSC_DELIVERY_RECEIPT_REQUESTED: u8 = 0x01;

/// Rejection reasons for the legacy send endpoint; the display string is the
/// HTTP 400 body.
#[derive(Debug, Error, PartialEq)]
pub enum SendRequestError {
    #[error("to address missing from payload")]
    MissingTo,
    #[error("username missing from payload")]
    MissingUsername,
    #[error("password missing from payload")]
    MissingPassword,
    #[error("content or hex-content must be provided")]
    MissingContent,
    #[error("coding must be in the range 0-14")]
    InvalidCoding,
    #[error("priority must be in the range 0-3")]
    InvalidPriority,
    #[error("validity-period must be an integer")]
    InvalidValidityPeriod,
    #[error("validity-period must be greater than 0")]
    NegativeValidityPeriod,
    #[error("tags must be integers")]
    InvalidTags,
    #[error("dlr-url missing")]
    MissingDlrUrl,
    #[error("dlr-level missing")]
    MissingDlrLevel,
    #[error("dlr-method missing")]
    MissingDlrMethod,
    #[error("dlr-level not 1,2 or 3")]
    InvalidDlrLevel,
    #[error("dlr-method not GET or POST")]
    InvalidDlrMethod,
    #[error("hex-content is not valid hex")]
    InvalidHexContent,
}

/// A validated legacy send request.
#[derive(Debug, Clone, PartialEq)]
pub struct SendRequest {
    pub to: String,
    pub from: Option<String>,
    pub coding: u8,
    pub priority: u8,
    /// Scheduled delivery time, accepted and carried but not interpreted
    pub sdt: Option<String>,
    pub validity_period: Option<i64>,
    pub tags: Vec<i64>,
    pub content: Option<String>,
    pub hex_content: Option<String>,
    pub dlr: Option<DlrRequest>,
}

impl SendRequest {
    /// Validate a query-string parameter map.
    ///
    /// Required: `to`, `username`, `password`, one of `content`/`hex-content`.
    /// `username`/`password` are accepted but not authenticated here.
    pub fn parse(form: &HashMap<String, String>) -> Result<SendRequest, SendRequestError> {
        if !form.contains_key("to") {
            return Err(SendRequestError::MissingTo);
        }
        if !form.contains_key("username") {
            return Err(SendRequestError::MissingUsername);
        }
        if !form.contains_key("password") {
            return Err(SendRequestError::MissingPassword);
        }
        if !form.contains_key("content") && !form.contains_key("hex-content") {
            return Err(SendRequestError::MissingContent);
        }

        let coding = match form.get("coding") {
            None => 0,
            Some(raw) => match raw.parse::<u8>() {
                Ok(v) if v <= 14 => v,
                _ => return Err(SendRequestError::InvalidCoding),
            },
        };

        let priority = match form.get("priority") {
            None => 0,
            Some(raw) => match raw.parse::<u8>() {
                Ok(v) if v <= 3 => v,
                _ => return Err(SendRequestError::InvalidPriority),
            },
        };

        let validity_period = match form.get("validity-period") {
            None => None,
            Some(raw) => {
                let v: i64 = raw
                    .parse()
                    .map_err(|_| SendRequestError::InvalidValidityPeriod)?;
                if v < 0 {
                    return Err(SendRequestError::NegativeValidityPeriod);
                }
                Some(v)
            }
        };

        let tags = match form.get("tags") {
            None => Vec::new(),
            Some(raw) => raw
                .split(',')
                .map(|part| part.trim().parse::<i64>())
                .collect::<Result<Vec<_>, _>>()
                .map_err(|_| SendRequestError::InvalidTags)?,
        };

        let dlr = if form.get("dlr").map(String::as_str) == Some("yes") {
            let url = form
                .get("dlr-url")
                .ok_or(SendRequestError::MissingDlrUrl)?;
            let level = form
                .get("dlr-level")
                .ok_or(SendRequestError::MissingDlrLevel)?;
            let method = form
                .get("dlr-method")
                .ok_or(SendRequestError::MissingDlrMethod)?;

            let level = match level.as_str() {
                "1" => 1,
                "2" => 2,
                "3" => 3,
                _ => return Err(SendRequestError::InvalidDlrLevel),
            };
            if method != "GET" && method != "POST" {
                return Err(SendRequestError::InvalidDlrMethod);
            }

            Some(DlrRequest {
                url: url.clone(),
                level,
                method: method.clone(),
            })
        } else {
            None
        };

        let content = form.get("content").cloned();
        // content wins when both are supplied
        let hex_content = if content.is_some() {
            None
        } else {
            form.get("hex-content").cloned()
        };

        Ok(SendRequest {
            to: form["to"].clone(),
            from: form.get("from").cloned(),
            coding,
            priority,
            sdt: form.get("sdt").cloned(),
            validity_period,
            tags,
            content,
            hex_content,
            dlr,
        })
    }
}

/// A JSON-compatible submit_sm template as carried on the work queue. The
/// connector turns one of these into a wire PDU at submit time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PduTemplate {
    pub source_addr: Option<String>,
    pub destination_addr: String,
    pub data_coding: u8,
    /// Textual message body; `None` when the body is binary
    pub short_message: Option<String>,
    /// Binary message body, hex encoded; `None` when the body is textual
    #[serde(default)]
    pub short_message_hex: Option<String>,

    pub service_type: Option<String>,
    pub source_addr_ton: u8,
    pub source_addr_npi: u8,
    pub dest_addr_ton: u8,
    pub dest_addr_npi: u8,
    pub esm_class: u8,
    pub protocol_id: Option<u8>,
    pub priority_flag: u8,
    pub schedule_delivery_time: Option<String>,
    pub validity_period: Option<String>,
    pub registered_delivery: u8,
    pub replace_if_present_flag: u8,
    pub sm_default_msg_id: u8,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sar_msg_ref_num: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sar_total_segments: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sar_segment_seqnum: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub more_messages_to_send: Option<u8>,
}

impl PduTemplate {
    /// Message body as raw octets (hex body decoded, textual body as bytes)
    pub fn message_octets(&self) -> Result<Vec<u8>, hex::FromHexError> {
        match &self.short_message_hex {
            Some(h) => hex::decode(h),
            None => Ok(self
                .short_message
                .as_ref()
                .map(|s| s.clone().into_bytes())
                .unwrap_or_default()),
        }
    }
}

/// An MT event flowing between the pipeline, interceptors and the route
/// table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MtEvent {
    pub pdus: Vec<PduTemplate>,
    pub to: String,
    pub from: Option<String>,
    pub timestamp: f64,
    /// The pre-segmentation message, for short_message filters
    pub msg: String,
    pub direction: String,
    pub tags: Vec<i64>,
    pub dlr: Option<DlrRequest>,
    /// Receiving connector, set on MO-originated events only
    #[serde(rename = "origin-connector", default, skip_serializing_if = "Option::is_none")]
    pub origin_connector: Option<String>,
    /// Parameter names set explicitly (by an interceptor) that the connector
    /// overlay must not touch
    pub locked: Vec<String>,
}

/// Work-queue payload: one send request routed to one connector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MtJob {
    pub req_id: String,
    pub connector: String,
    pub pdus: Vec<PduTemplate>,
    pub dlr: Option<DlrRequest>,
}

/// Splitting method for long content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitMode {
    /// In-band user-data-header concatenation (the default)
    Udh,
    /// sar_* TLV segmentation
    Sar,
}

enum SmPayload {
    Text(Vec<char>),
    Binary(Vec<u8>),
}

impl SmPayload {
    fn units(&self) -> usize {
        match self {
            SmPayload::Text(chars) => chars.len(),
            SmPayload::Binary(bytes) => bytes.len(),
        }
    }

    fn slice(&self, start: usize, end: usize) -> SmPayload {
        match self {
            SmPayload::Text(chars) => {
                SmPayload::Text(chars[start.min(chars.len())..end.min(chars.len())].to_vec())
            }
            SmPayload::Binary(bytes) => {
                SmPayload::Binary(bytes[start.min(bytes.len())..end.min(bytes.len())].to_vec())
            }
        }
    }

    fn octets(&self) -> Vec<u8> {
        match self {
            SmPayload::Text(chars) => chars.iter().collect::<String>().into_bytes(),
            SmPayload::Binary(bytes) => bytes.clone(),
        }
    }

    /// Fill a template's short_message/short_message_hex pair
    fn apply(&self, template: &mut PduTemplate) {
        match self {
            SmPayload::Text(chars) => {
                template.short_message = Some(chars.iter().collect());
                template.short_message_hex = None;
            }
            SmPayload::Binary(bytes) => {
                template.short_message = None;
                template.short_message_hex = Some(hex::encode(bytes));
            }
        }
    }
}

/// Builds MT events from validated send requests.
pub struct MtPipeline {
    split_mode: SplitMode,
    max_parts: usize,
    // Rolls over 1..=255, never 0
    long_msg_ref: AtomicUsize,
}

impl Default for MtPipeline {
    fn default() -> Self {
        Self::new(SplitMode::Udh)
    }
}

impl MtPipeline {
    pub fn new(split_mode: SplitMode) -> Self {
        Self {
            split_mode,
            max_parts: LONG_CONTENT_MAX_PARTS,
            long_msg_ref: AtomicUsize::new(0),
        }
    }

    /// Next concatenation reference: the sequence 1,2,…,255,1,2,… — zero is
    /// never produced.
    pub fn next_long_msg_ref(&self) -> u8 {
        (self.long_msg_ref.fetch_add(1, Ordering::Relaxed) % 255) as u8 + 1
    }

    /// Build the MT event for a request: encode, segment, apply defaults.
    pub fn build_event(&self, request: &SendRequest) -> Result<MtEvent, SendRequestError> {
        let (payload, msg) = encode_short_message(request)?;

        let (bits, max_sm, sliced_max) = coding_limits(request.coding);
        let sm_length = if bits == 16 {
            payload.units() / 2
        } else {
            payload.units()
        };

        let mut pdus = Vec::new();

        if sm_length <= max_sm {
            let mut template = self.base_template(request);
            payload.apply(&mut template);
            // Single binary bodies travel hex encoded as well
            pdus.push(template);
        } else {
            let num_parts = sm_length.div_ceil(sliced_max).min(self.max_parts);
            let msg_ref = self.next_long_msg_ref();

            // Python slicing took code units: doubled for 16-bit payloads
            let window = if bits == 16 { sliced_max * 2 } else { sliced_max };

            for part in 0..num_parts {
                let seqnum = (part + 1) as u8;
                let segment = payload.slice(window * part, window * (part + 1));

                let mut template = self.base_template(request);

                match self.split_mode {
                    SplitMode::Sar => {
                        segment.apply(&mut template);
                        template.sar_total_segments = Some(num_parts as u8);
                        template.sar_segment_seqnum = Some(seqnum);
                        template.sar_msg_ref_num = Some(msg_ref as u16);
                    }
                    SplitMode::Udh => {
                        template.esm_class =
                            esm_class::MODE_DEFAULT | esm_class::TYPE_DEFAULT | esm_class::GSM_UDHI;
                        template.more_messages_to_send =
                            Some(if seqnum < num_parts as u8 { 1 } else { 0 });

                        // Concatenated-SMS UDH: IEI 0x00, IEDL 3, ref/total/seq
                        let mut body =
                            vec![0x05, 0x00, 0x03, msg_ref, num_parts as u8, seqnum];
                        body.extend(segment.octets());
                        template.short_message = None;
                        template.short_message_hex = Some(hex::encode(body));
                    }
                }

                pdus.push(template);
            }
        }

        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or_default();

        Ok(MtEvent {
            pdus,
            to: request.to.clone(),
            from: request.from.clone(),
            timestamp,
            msg,
            direction: "MT".to_string(),
            tags: request.tags.clone(),
            dlr: request.dlr.clone(),
            origin_connector: None,
            locked: Vec::new(),
        })
    }

    /// The default parameter set every template starts from.
    fn base_template(&self, request: &SendRequest) -> PduTemplate {
        PduTemplate {
            source_addr: request.from.clone(),
            destination_addr: request.to.clone(),
            data_coding: request.coding,
            short_message: None,
            short_message_hex: None,
            service_type: None,
            source_addr_ton: 2,  // national
            source_addr_npi: 1,  // ISDN
            dest_addr_ton: 1,    // international
            dest_addr_npi: 1,    // ISDN
            esm_class: esm_class::MODE_STORE_AND_FORWARD | esm_class::TYPE_DEFAULT,
            protocol_id: None,
            priority_flag: 0,
            schedule_delivery_time: None,
            validity_period: None,
            registered_delivery: 0,
            replace_if_present_flag: 0,
            sm_default_msg_id: 0,
            sar_msg_ref_num: None,
            sar_total_segments: None,
            sar_segment_seqnum: None,
            more_messages_to_send: None,
        }
    }
}

/// Overlay the connector's configured PDU parameters onto every template,
/// skipping names the event has locked.
pub fn apply_connector_params(event: &mut MtEvent, config: &ConnectorConfig) {
    let locked = |name: &str| event.locked.iter().any(|l| l == name);

    for pdu in &mut event.pdus {
        if !locked("protocol_id") {
            pdu.protocol_id = config.protocol_id;
        }
        if !locked("replace_if_present_flag") {
            pdu.replace_if_present_flag = config.replace_if_present_flag;
        }
        if !locked("dest_addr_ton") {
            pdu.dest_addr_ton = config.dest_addr_ton;
        }
        if !locked("source_addr_npi") {
            pdu.source_addr_npi = config.source_addr_npi;
        }
        if !locked("dest_addr_npi") {
            pdu.dest_addr_npi = config.dest_addr_npi;
        }
        if !locked("service_type") {
            pdu.service_type = config.service_type.clone();
        }
        if !locked("source_addr_ton") {
            pdu.source_addr_ton = config.source_addr_ton;
        }
        if !locked("sm_default_msg_id") {
            pdu.sm_default_msg_id = config.sm_default_msg_id;
        }
    }
}

/// Set the delivery-receipt request on the last PDU of the bundle. Earlier
/// PDUs never request receipts (one receipt per message, not per part).
pub fn apply_dlr_flag(event: &mut MtEvent) {
    if event.dlr.is_some() {
        if let Some(last) = event.pdus.last_mut() {
            last.registered_delivery = SMSC_DELIVERY_RECEIPT_REQUESTED;
        }
    }
}

fn encode_short_message(
    request: &SendRequest,
) -> Result<(SmPayload, String), SendRequestError> {
    if let Some(hex_content) = &request.hex_content {
        let bytes =
            hex::decode(hex_content).map_err(|_| SendRequestError::InvalidHexContent)?;
        let msg = String::from_utf8_lossy(&bytes).into_owned();
        return Ok((SmPayload::Binary(bytes), msg));
    }

    let content = request.content.clone().unwrap_or_default();
    if request.coding == 0 {
        let encoded = gsm_encode(&content);
        Ok((SmPayload::Text(encoded.chars().collect()), encoded))
    } else {
        Ok((SmPayload::Text(content.chars().collect()), content))
    }
}

/// Segmentation limits by data_coding: (bits, max single-part length,
/// max per-part length once sliced).
pub fn coding_limits(coding: u8) -> (u8, usize, usize) {
    match coding {
        3 | 6 | 7 | 10 => (8, 140, 134),
        2 | 4 | 5 | 8 | 9 | 13 | 14 => (16, 70, 67),
        _ => (7, 160, 153),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn form(entries: &[(&str, &str)]) -> HashMap<String, String> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn base_form() -> HashMap<String, String> {
        form(&[
            ("to", "447428555555"),
            ("from", "447428666666"),
            ("username", "test"),
            ("password", "test"),
            ("content", "hello"),
        ])
    }

    #[test]
    fn parse_rejects_missing_required_fields() {
        let mut f = base_form();
        f.remove("to");
        assert_eq!(SendRequest::parse(&f), Err(SendRequestError::MissingTo));

        let mut f = base_form();
        f.remove("username");
        assert_eq!(
            SendRequest::parse(&f),
            Err(SendRequestError::MissingUsername)
        );

        let mut f = base_form();
        f.remove("content");
        assert_eq!(
            SendRequest::parse(&f),
            Err(SendRequestError::MissingContent)
        );
    }

    #[test]
    fn parse_validates_ranges() {
        let mut f = base_form();
        f.insert("coding".to_string(), "15".to_string());
        assert_eq!(SendRequest::parse(&f), Err(SendRequestError::InvalidCoding));

        let mut f = base_form();
        f.insert("priority".to_string(), "4".to_string());
        assert_eq!(
            SendRequest::parse(&f),
            Err(SendRequestError::InvalidPriority)
        );

        let mut f = base_form();
        f.insert("validity-period".to_string(), "-3".to_string());
        assert_eq!(
            SendRequest::parse(&f),
            Err(SendRequestError::NegativeValidityPeriod)
        );

        let mut f = base_form();
        f.insert("tags".to_string(), "1,x".to_string());
        assert_eq!(SendRequest::parse(&f), Err(SendRequestError::InvalidTags));
    }

    #[test]
    fn parse_dlr_requires_subfields() {
        let mut f = base_form();
        f.insert("dlr".to_string(), "yes".to_string());
        assert_eq!(SendRequest::parse(&f), Err(SendRequestError::MissingDlrUrl));

        f.insert("dlr-url".to_string(), "http://example.org".to_string());
        f.insert("dlr-level".to_string(), "5".to_string());
        f.insert("dlr-method".to_string(), "POST".to_string());
        assert_eq!(
            SendRequest::parse(&f),
            Err(SendRequestError::InvalidDlrLevel)
        );

        f.insert("dlr-level".to_string(), "3".to_string());
        let parsed = SendRequest::parse(&f).unwrap();
        assert_eq!(
            parsed.dlr,
            Some(DlrRequest {
                url: "http://example.org".to_string(),
                level: 3,
                method: "POST".to_string(),
            })
        );
    }

    #[test]
    fn parse_content_wins_over_hex_content() {
        let mut f = base_form();
        f.insert("hex-content".to_string(), "414243".to_string());
        let parsed = SendRequest::parse(&f).unwrap();
        assert_eq!(parsed.content.as_deref(), Some("hello"));
        assert_eq!(parsed.hex_content, None);
    }

    #[test]
    fn gsm7_short_single_pdu() {
        let mut f = base_form();
        f.insert("content".to_string(), "£ test".to_string());
        let request = SendRequest::parse(&f).unwrap();

        let pipeline = MtPipeline::default();
        let event = pipeline.build_event(&request).unwrap();

        assert_eq!(event.pdus.len(), 1);
        let pdu = &event.pdus[0];
        assert_eq!(pdu.short_message.as_deref(), Some("\x01 test"));
        assert_eq!(pdu.short_message_hex, None);
        assert_eq!(pdu.data_coding, 0);
        assert_eq!(pdu.sm_default_msg_id, 0);
        assert_eq!(pdu.source_addr.as_deref(), Some("447428666666"));
        assert_eq!(pdu.destination_addr, "447428555555");
        assert_eq!(pdu.esm_class, 0x03);
        assert_eq!(event.direction, "MT");
    }

    #[test]
    fn ucs2_hex_content_stays_binary() {
        // UTF-16-BE of "£ test"
        let ucs2_hex = "00a300200074006500730074";
        let mut f = base_form();
        f.remove("content");
        f.insert("hex-content".to_string(), ucs2_hex.to_string());
        f.insert("coding".to_string(), "8".to_string());
        let request = SendRequest::parse(&f).unwrap();

        let pipeline = MtPipeline::default();
        let event = pipeline.build_event(&request).unwrap();

        assert_eq!(event.pdus.len(), 1);
        let pdu = &event.pdus[0];
        assert_eq!(pdu.data_coding, 8);
        assert_eq!(pdu.short_message, None);
        assert_eq!(pdu.short_message_hex.as_deref(), Some(ucs2_hex));
    }

    #[test]
    fn gsm7_long_two_parts_udh() {
        let mut lorem = String::from(
            "Lorem ipsum dolor sit amet, consectetur adipiscing elit, sed do eiusmod \
             tempor incididunt ut labore et dolore magna aliqua. ",
        );
        while lorem.len() < 200 {
            lorem.push_str("Ut enim ad minim veniam. ");
        }
        lorem.truncate(200);
        assert_eq!(lorem.chars().count(), 200);

        let mut f = base_form();
        f.insert("content".to_string(), lorem);
        let request = SendRequest::parse(&f).unwrap();

        let pipeline = MtPipeline::default();
        let event = pipeline.build_event(&request).unwrap();

        assert_eq!(event.pdus.len(), 2);

        let first = &event.pdus[0];
        assert!(first.short_message_hex.as_deref().unwrap().starts_with("050003010201"));
        assert_eq!(first.more_messages_to_send, Some(1));
        assert_eq!(first.esm_class, 0x40);
        assert_eq!(first.short_message, None);

        let second = &event.pdus[1];
        assert!(second.short_message_hex.as_deref().unwrap().starts_with("050003010202"));
        assert_eq!(second.more_messages_to_send, Some(0));
    }

    #[test]
    fn segmentation_roundtrip_udh() {
        // Any message under 5*sliced_max reassembles from its UDH parts
        let content: String = std::iter::repeat('x').take(400).collect();
        let mut f = base_form();
        f.insert("content".to_string(), content.clone());
        let request = SendRequest::parse(&f).unwrap();

        let pipeline = MtPipeline::default();
        let event = pipeline.build_event(&request).unwrap();
        assert_eq!(event.pdus.len(), 3);

        let mut reassembled = Vec::new();
        for pdu in &event.pdus {
            let bytes = hex::decode(pdu.short_message_hex.as_deref().unwrap()).unwrap();
            assert_eq!(&bytes[..3], &[0x05, 0x00, 0x03]);
            reassembled.extend_from_slice(&bytes[6..]);
        }
        assert_eq!(reassembled, content.into_bytes());
    }

    #[test]
    fn segmentation_roundtrip_sar() {
        let content: String = std::iter::repeat('y').take(300).collect();
        let mut f = base_form();
        f.insert("content".to_string(), content.clone());
        let request = SendRequest::parse(&f).unwrap();

        let pipeline = MtPipeline::new(SplitMode::Sar);
        let event = pipeline.build_event(&request).unwrap();
        assert_eq!(event.pdus.len(), 2);

        let mut reassembled = String::new();
        for (i, pdu) in event.pdus.iter().enumerate() {
            assert_eq!(pdu.sar_segment_seqnum, Some(i as u8 + 1));
            assert_eq!(pdu.sar_total_segments, Some(2));
            assert_eq!(pdu.sar_msg_ref_num, Some(1));
            // SAR segments keep the textual body
            reassembled.push_str(pdu.short_message.as_deref().unwrap());
        }
        assert_eq!(reassembled, content);
    }

    #[test]
    fn parts_are_capped_at_five() {
        let content: String = std::iter::repeat('z').take(2000).collect();
        let mut f = base_form();
        f.insert("content".to_string(), content);
        let request = SendRequest::parse(&f).unwrap();

        let pipeline = MtPipeline::default();
        let event = pipeline.build_event(&request).unwrap();
        assert_eq!(event.pdus.len(), LONG_CONTENT_MAX_PARTS);
    }

    #[test]
    fn ucs2_long_slices_by_code_units() {
        // 80 UCS-2 chars (160 octets) > 70 => split; sliced_max 67 chars
        let hex_content: String = std::iter::repeat("0041").take(80).collect();
        let mut f = base_form();
        f.remove("content");
        f.insert("hex-content".to_string(), hex_content.clone());
        f.insert("coding".to_string(), "8".to_string());
        let request = SendRequest::parse(&f).unwrap();

        let pipeline = MtPipeline::default();
        let event = pipeline.build_event(&request).unwrap();
        assert_eq!(event.pdus.len(), 2);

        let first = hex::decode(event.pdus[0].short_message_hex.as_deref().unwrap()).unwrap();
        // 6 UDH octets + 67 chars * 2
        assert_eq!(first.len(), 6 + 134);

        let mut reassembled = Vec::new();
        for pdu in &event.pdus {
            let bytes = hex::decode(pdu.short_message_hex.as_deref().unwrap()).unwrap();
            reassembled.extend_from_slice(&bytes[6..]);
        }
        assert_eq!(hex::encode(reassembled), hex_content);
    }

    #[test]
    fn ref_counter_rolls_over_skipping_zero() {
        let pipeline = MtPipeline::default();
        for expected in 1..=255u8 {
            assert_eq!(pipeline.next_long_msg_ref(), expected);
        }
        // Wraps straight back to 1
        assert_eq!(pipeline.next_long_msg_ref(), 1);
        assert_eq!(pipeline.next_long_msg_ref(), 2);
    }

    #[test]
    fn coding_limit_table() {
        assert_eq!(coding_limits(0), (7, 160, 153));
        assert_eq!(coding_limits(1), (7, 160, 153));
        assert_eq!(coding_limits(3), (8, 140, 134));
        assert_eq!(coding_limits(8), (16, 70, 67));
        assert_eq!(coding_limits(14), (16, 70, 67));
        assert_eq!(coding_limits(11), (7, 160, 153));
    }

    #[test]
    fn connector_overlay_respects_locked() {
        let f = base_form();
        let request = SendRequest::parse(&f).unwrap();
        let pipeline = MtPipeline::default();
        let mut event = pipeline.build_event(&request).unwrap();

        let config: ConnectorConfig = serde_json::from_value(serde_json::json!({
            "host": "127.0.0.1",
            "systemid": "x",
            "password": "y",
            "source_addr_ton": 5,
            "service_type": "SVC",
            "protocol_id": 9
        }))
        .unwrap();

        event.locked.push("source_addr_ton".to_string());
        apply_connector_params(&mut event, &config);

        let pdu = &event.pdus[0];
        assert_eq!(pdu.source_addr_ton, 2); // locked, kept
        assert_eq!(pdu.service_type.as_deref(), Some("SVC"));
        assert_eq!(pdu.protocol_id, Some(9));
        assert_eq!(pdu.dest_addr_ton, 1);
    }

    #[test]
    fn dlr_flag_lands_on_last_pdu_only() {
        let content: String = std::iter::repeat('a').take(200).collect();
        let mut f = base_form();
        f.insert("content".to_string(), content);
        f.insert("dlr".to_string(), "yes".to_string());
        f.insert("dlr-url".to_string(), "http://example.org".to_string());
        f.insert("dlr-level".to_string(), "3".to_string());
        f.insert("dlr-method".to_string(), "POST".to_string());
        let request = SendRequest::parse(&f).unwrap();

        let pipeline = MtPipeline::default();
        let mut event = pipeline.build_event(&request).unwrap();
        apply_dlr_flag(&mut event);

        assert_eq!(event.pdus.len(), 2);
        assert_eq!(event.pdus[0].registered_delivery, 0);
        assert_eq!(
            event.pdus[1].registered_delivery,
            SMSC_DELIVERY_RECEIPT_REQUESTED
        );
    }

    #[test]
    fn queue_payload_shape() {
        let mut f = base_form();
        f.insert("content".to_string(), "£ test".to_string());
        let request = SendRequest::parse(&f).unwrap();
        let pipeline = MtPipeline::default();
        let event = pipeline.build_event(&request).unwrap();

        let job = MtJob {
            req_id: "req-1".to_string(),
            connector: "smpp_conn1".to_string(),
            pdus: event.pdus,
            dlr: None,
        };

        let json = serde_json::to_value(&job).unwrap();
        assert_eq!(json["req_id"], "req-1");
        assert_eq!(json["connector"], "smpp_conn1");
        assert_eq!(json["pdus"][0]["short_message"], "\u{1} test");
        assert!(json["dlr"].is_null());

        let back: MtJob = serde_json::from_value(json).unwrap();
        assert_eq!(back.pdus.len(), 1);
    }
}
