//! Mobile-originated message handling: split detection and multipart
//! reassembly.
//!
//! Multipart segments are stored as a hash in the key/value store under
//! `long_sms:<connector>:<ref>:<dest_addr>`, one field per segment sequence
//! number. The hash shape makes out-of-order arrival and re-receipt of the
//! same segment idempotent with no read-modify-write.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::datatypes::{DeliverSm, esm_class};
use crate::kv::{KvError, KvStore};

#[derive(Debug, Error)]
pub enum MoError {
    #[error("data coding {0:#04x} addresses the SIM, unsupported")]
    UnsupportedCoding(u8),

    #[error(transparent)]
    Kv(#[from] KvError),

    #[error("segment record is not valid JSON: {0}")]
    BadSegmentRecord(#[from] serde_json::Error),

    #[error("stored segment payload is not valid hex")]
    BadSegmentPayload,
}

/// Event published to the MO queue for the poster workers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoEvent {
    pub id: String,
    pub to: String,
    pub from: String,
    pub coding: u8,
    #[serde(rename = "origin-connector")]
    pub origin_connector: String,
    /// Message body, base64 of the raw octets
    pub msg: String,
    pub retries: u32,
}

/// How an inbound deliver_sm was segmented.
#[derive(Debug, Clone, PartialEq)]
pub enum SplitInfo {
    Single,
    /// TLV-based segmentation
    Sar {
        ref_num: u16,
        total: u8,
        seqnum: u8,
    },
    /// In-band concatenation header; payload already trimmed of the 6 UDH octets
    Udh {
        ref_num: u8,
        total: u8,
        seqnum: u8,
    },
}

/// Classify a deliver_sm's segmentation and return the effective payload.
///
/// UDH detection requires the UDHI bit plus the concatenated-SMS header
/// `05 00 03` in the first three octets; the 6-octet header is stripped from
/// the returned payload.
pub fn detect_split(pdu: &DeliverSm) -> (SplitInfo, Vec<u8>) {
    if let (Some(ref_num), Some(total), Some(seqnum)) = (
        pdu.sar_msg_ref_num,
        pdu.sar_total_segments,
        pdu.sar_segment_seqnum,
    ) {
        return (
            SplitInfo::Sar {
                ref_num,
                total,
                seqnum,
            },
            pdu.short_message.to_vec(),
        );
    }

    let body = pdu.short_message.as_ref();
    if esm_class::has_udhi(pdu.esm_class)
        && body.len() >= 6
        && body[0] == 0x05
        && body[1] == 0x00
        && body[2] == 0x03
    {
        return (
            SplitInfo::Udh {
                ref_num: body[3],
                total: body[4],
                seqnum: body[5],
            },
            body[6..].to_vec(),
        );
    }

    (SplitInfo::Single, body.to_vec())
}

/// One stored segment of a multipart MO.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SegmentRecord {
    total_segments: u8,
    msg_ref_num: u16,
    segment_seqnum: u8,
    /// Segment payload, hex encoded
    payload: String,
}

/// Reassembles multipart MO messages for one connector.
pub struct Reassembler {
    kv: Arc<dyn KvStore>,
    connector: String,
    part_ttl: Duration,
    /// Strict mode drops incomplete messages at flush time instead of
    /// publishing the segments that did arrive
    strict: bool,
}

impl Reassembler {
    pub fn new(kv: Arc<dyn KvStore>, connector: &str, part_ttl: Duration, strict: bool) -> Self {
        Self {
            kv,
            connector: connector.to_string(),
            part_ttl,
            strict,
        }
    }

    /// Feed one deliver_sm. Returns an MO event when a message is complete:
    /// immediately for single-part, on the terminal segment for multipart.
    pub async fn ingest(&self, pdu: &DeliverSm) -> Result<Option<MoEvent>, MoError> {
        if is_sim_class(pdu.data_coding) {
            return Err(MoError::UnsupportedCoding(pdu.data_coding));
        }

        let (split, payload) = detect_split(pdu);

        let (ref_num, total, seqnum) = match split {
            SplitInfo::Single => return Ok(Some(self.event(pdu, payload))),
            SplitInfo::Sar {
                ref_num,
                total,
                seqnum,
            } => (ref_num, total, seqnum),
            SplitInfo::Udh {
                ref_num,
                total,
                seqnum,
            } => (ref_num as u16, total, seqnum),
        };

        let key = format!(
            "long_sms:{}:{}:{}",
            self.connector, ref_num, pdu.destination_addr
        );

        let record = SegmentRecord {
            total_segments: total,
            msg_ref_num: ref_num,
            segment_seqnum: seqnum,
            payload: hex::encode(&payload),
        };
        self.kv
            .hset(&key, &seqnum.to_string(), &serde_json::to_string(&record)?)
            .await?;
        self.kv.expire(&key, self.part_ttl).await?;

        // Not the terminal segment: wait for the rest (or the TTL)
        if seqnum != total {
            return Ok(None);
        }

        let stored = self.kv.hvals(&key).await?.unwrap_or_default();
        let mut segments = Vec::with_capacity(stored.len());
        for value in &stored {
            segments.push(serde_json::from_str::<SegmentRecord>(value)?);
        }
        segments.sort_by_key(|s| s.segment_seqnum);

        if segments.len() != total as usize {
            tracing::error!(
                connector = %self.connector,
                ref_num,
                expected = total,
                got = segments.len(),
                "multipart MO flushed with missing segments"
            );
            if self.strict {
                return Ok(None);
            }
        }

        let mut message = Vec::new();
        for segment in &segments {
            message.extend(hex::decode(&segment.payload).map_err(|_| MoError::BadSegmentPayload)?);
        }

        Ok(Some(self.event(pdu, message)))
    }

    fn event(&self, pdu: &DeliverSm, payload: Vec<u8>) -> MoEvent {
        use base64::Engine as _;

        MoEvent {
            id: uuid::Uuid::new_v4().to_string(),
            to: pdu.destination_addr.clone(),
            from: pdu.source_addr.clone().unwrap_or_default(),
            coding: pdu.data_coding,
            origin_connector: self.connector.clone(),
            msg: base64::engine::general_purpose::STANDARD.encode(payload),
            retries: 0,
        }
    }
}

/// Data coding with the message-class bits addressing the SIM (class 2).
pub fn is_sim_class(data_coding: u8) -> bool {
    data_coding & 0x10 != 0 && data_coding & 0x03 == 0x02
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;
    use base64::Engine as _;
    use bytes::Bytes;

    fn deliver(esm: u8, body: &[u8]) -> DeliverSm {
        DeliverSm {
            sequence_number: 1,
            source_addr_ton: 1,
            source_addr_npi: 1,
            source_addr: Some("447111111111".to_string()),
            dest_addr_ton: 1,
            dest_addr_npi: 1,
            destination_addr: "447222222222".to_string(),
            esm_class: esm,
            data_coding: 0,
            short_message: Bytes::copy_from_slice(body),
            ..Default::default()
        }
    }

    fn reassembler(kv: Arc<dyn KvStore>, strict: bool) -> Reassembler {
        Reassembler::new(kv, "mock_connector", Duration::from_secs(300), strict)
    }

    fn decode_msg(event: &MoEvent) -> Vec<u8> {
        base64::engine::general_purpose::STANDARD
            .decode(&event.msg)
            .unwrap()
    }

    #[tokio::test]
    async fn single_part_publishes_immediately() {
        let kv = Arc::new(MemoryKv::new());
        let r = reassembler(kv, false);

        let event = r.ingest(&deliver(0x00, b"Hello")).await.unwrap().unwrap();
        assert_eq!(decode_msg(&event), b"Hello");
        assert_eq!(event.to, "447222222222");
        assert_eq!(event.from, "447111111111");
        assert_eq!(event.origin_connector, "mock_connector");
        assert_eq!(event.retries, 0);
    }

    #[tokio::test]
    async fn udh_two_parts_reassemble() {
        let kv = Arc::new(MemoryKv::new());
        let r = reassembler(kv, false);

        let first = r
            .ingest(&deliver(0x40, b"\x05\x00\x03\x01\x02\x01Hello"))
            .await
            .unwrap();
        assert!(first.is_none());

        let second = r
            .ingest(&deliver(0x40, b"\x05\x00\x03\x01\x02\x02 World"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(decode_msg(&second), b"Hello World");
    }

    #[tokio::test]
    async fn sar_two_parts_reassemble_out_of_order_storage() {
        let kv = Arc::new(MemoryKv::new());
        let r = reassembler(kv, false);

        let mut part1 = deliver(0x00, b"Hello");
        part1.sar_msg_ref_num = Some(1);
        part1.sar_total_segments = Some(2);
        part1.sar_segment_seqnum = Some(1);

        let mut part2 = deliver(0x00, b" World");
        part2.sar_msg_ref_num = Some(1);
        part2.sar_total_segments = Some(2);
        part2.sar_segment_seqnum = Some(2);

        assert!(r.ingest(&part1).await.unwrap().is_none());
        let event = r.ingest(&part2).await.unwrap().unwrap();
        assert_eq!(decode_msg(&event), b"Hello World");
    }

    #[tokio::test]
    async fn duplicate_segment_is_idempotent() {
        let kv = Arc::new(MemoryKv::new());
        let r = reassembler(kv, false);

        let part1 = deliver(0x40, b"\x05\x00\x03\x01\x02\x01Hello");
        assert!(r.ingest(&part1).await.unwrap().is_none());
        assert!(r.ingest(&part1).await.unwrap().is_none());

        let event = r
            .ingest(&deliver(0x40, b"\x05\x00\x03\x01\x02\x02 World"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(decode_msg(&event), b"Hello World");
    }

    #[tokio::test]
    async fn lenient_flush_with_missing_segment() {
        let kv = Arc::new(MemoryKv::new());
        let r = reassembler(kv, false);

        // Only the terminal segment ever arrives
        let event = r
            .ingest(&deliver(0x40, b"\x05\x00\x03\x01\x02\x02 World"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(decode_msg(&event), b" World");
    }

    #[tokio::test]
    async fn strict_flush_drops_incomplete() {
        let kv = Arc::new(MemoryKv::new());
        let r = reassembler(kv, true);

        let result = r
            .ingest(&deliver(0x40, b"\x05\x00\x03\x01\x02\x02 World"))
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn different_senders_do_not_mix() {
        let kv = Arc::new(MemoryKv::new());
        let r = reassembler(kv, false);

        let mut other_dest = deliver(0x40, b"\x05\x00\x03\x01\x02\x01Other");
        other_dest.destination_addr = "447333333333".to_string();
        assert!(r.ingest(&other_dest).await.unwrap().is_none());

        assert!(
            r.ingest(&deliver(0x40, b"\x05\x00\x03\x01\x02\x01Hello"))
                .await
                .unwrap()
                .is_none()
        );
        let event = r
            .ingest(&deliver(0x40, b"\x05\x00\x03\x01\x02\x02 World"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(decode_msg(&event), b"Hello World");
    }

    #[tokio::test]
    async fn sim_class_coding_is_rejected() {
        let kv = Arc::new(MemoryKv::new());
        let r = reassembler(kv, false);

        let mut pdu = deliver(0x00, b"Hello");
        pdu.data_coding = 0x12; // class 2, SIM-specific
        assert!(matches!(
            r.ingest(&pdu).await,
            Err(MoError::UnsupportedCoding(0x12))
        ));
    }

    #[test]
    fn udh_detection_requires_udhi_bit() {
        // Same prefix bytes but no UDHI: treated as single-part
        let pdu = deliver(0x00, b"\x05\x00\x03\x01\x02\x01Hello");
        let (split, payload) = detect_split(&pdu);
        assert_eq!(split, SplitInfo::Single);
        assert_eq!(payload, b"\x05\x00\x03\x01\x02\x01Hello");
    }

    #[test]
    fn sim_class_detection() {
        assert!(is_sim_class(0x12));
        assert!(is_sim_class(0xF2));
        assert!(!is_sim_class(0x00));
        assert!(!is_sim_class(0x08));
        assert!(!is_sim_class(0x11));
    }
}
