//! Conversion of stream records into authoritative resource records.
//!
//! A stream record is a wire-independent JSON description of one resource
//! record. Conversion goes through the canonical presentation form
//! `<name> <ttl> IN <type> [<priority>] <content>`, which is then parsed by
//! hickory's presentation-format parser. SOA content already carries its
//! seven fields, so SOA uses `<name> <ttl> IN SOA <content>`.

use hickory_proto::rr::{DNSClass, Name, RData, Record, RecordType};
use hickory_proto::serialize::txt::RDataParser;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tracing::{debug, warn};

/// Record types that can be converted.
pub const SUPPORTED_TYPES: [RecordType; 8] = [
    RecordType::A,
    RecordType::AAAA,
    RecordType::CNAME,
    RecordType::SOA,
    RecordType::MX,
    RecordType::NS,
    RecordType::TXT,
    RecordType::PTR,
];

/// One record as carried in a stream entry value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamRecord {
    /// Owner name, e.g. "example.com.".
    #[serde(rename = "Name", alias = "name")]
    pub name: String,

    /// Type tag, e.g. "A" or "MX".
    #[serde(rename = "Type", alias = "type")]
    pub record_type: String,

    /// Presentation-format rdata, without the priority.
    #[serde(rename = "Content", alias = "content")]
    pub content: String,

    /// TTL in seconds.
    #[serde(rename = "Ttl", alias = "ttl")]
    pub ttl: u32,

    /// Preference for types that carry one (MX). Zero means absent.
    #[serde(rename = "Priority", alias = "priority", default)]
    pub priority: Option<u32>,
}

impl StreamRecord {
    /// Build a record without priority.
    pub fn new(name: &str, record_type: &str, content: &str, ttl: u32) -> Self {
        Self {
            name: name.to_string(),
            record_type: record_type.to_string(),
            content: content.to_string(),
            ttl,
            priority: None,
        }
    }

    /// Set the priority.
    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Canonical presentation form of this record.
    pub fn to_text(&self) -> String {
        if self.record_type == "SOA" {
            return format!("{} {} IN SOA {}", self.name, self.ttl, self.content);
        }

        match self.priority {
            Some(priority) if priority > 0 => format!(
                "{} {} IN {} {} {}",
                self.name, self.ttl, self.record_type, priority, self.content
            ),
            _ => format!(
                "{} {} IN {} {}",
                self.name, self.ttl, self.record_type, self.content
            ),
        }
    }
}

impl fmt::Display for StreamRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_text())
    }
}

/// Payload of a stream entry: a single record or all records of a domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RecordPayload {
    /// One record.
    One(StreamRecord),
    /// Several records, usually every record of the key's domain.
    Many(Vec<StreamRecord>),
}

impl RecordPayload {
    /// Decode a stream value.
    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Flatten into the contained records.
    pub fn into_records(self) -> Vec<StreamRecord> {
        match self {
            RecordPayload::One(record) => vec![record],
            RecordPayload::Many(records) => records,
        }
    }
}

/// Reasons a stream record has no resource-record form.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConvertError {
    /// The type tag is not one of [`SUPPORTED_TYPES`].
    #[error("unsupported record type {0:?}")]
    Unsupported(String),

    /// The canonical text did not parse.
    #[error("malformed record {text:?}: {reason}")]
    Malformed {
        /// Canonical text that was parsed.
        text: String,
        /// Parser message.
        reason: String,
    },
}

/// Parse a supported type tag.
pub fn supported_type(tag: &str) -> Option<RecordType> {
    let record_type = RecordType::from_str(tag).ok()?;
    SUPPORTED_TYPES.contains(&record_type).then_some(record_type)
}

/// Convert a record, reporting why it could not be converted.
pub fn try_convert(record: &StreamRecord) -> Result<Record, ConvertError> {
    let record_type = supported_type(&record.record_type)
        .ok_or_else(|| ConvertError::Unsupported(record.record_type.clone()))?;

    parse_text(&record.to_text(), record_type)
}

/// Convert a record, or `None` when it is unsupported or malformed.
pub fn convert(record: &StreamRecord) -> Option<Record> {
    match try_convert(record) {
        Ok(rr) => Some(rr),
        Err(ConvertError::Unsupported(tag)) => {
            debug!(name = %record.name, record_type = %tag, "skipping unsupported record type");
            None
        }
        Err(e) => {
            warn!(name = %record.name, "{e}");
            None
        }
    }
}

/// Convert every record, one output per input, in order.
pub fn convert_all(records: &[StreamRecord]) -> Vec<Option<Record>> {
    records.iter().map(convert).collect()
}

fn malformed(text: &str, reason: impl fmt::Display) -> ConvertError {
    ConvertError::Malformed {
        text: text.to_string(),
        reason: reason.to_string(),
    }
}

/// Parse `<name> <ttl> IN <type> <rdata...>`.
fn parse_text(text: &str, record_type: RecordType) -> Result<Record, ConvertError> {
    let mut fields = text.splitn(5, ' ');
    let (Some(name), Some(ttl), Some(class), Some(tag), Some(rdata)) = (
        fields.next(),
        fields.next(),
        fields.next(),
        fields.next(),
        fields.next(),
    ) else {
        return Err(malformed(text, "missing fields"));
    };

    if class != "IN" || RecordType::from_str(tag).ok() != Some(record_type) {
        return Err(malformed(text, "unexpected class or type"));
    }

    let name = Name::from_ascii(name).map_err(|e| malformed(text, e))?;
    let ttl: u32 = ttl.parse().map_err(|e| malformed(text, e))?;
    let rdata = RData::try_from_str(record_type, rdata).map_err(|e| malformed(text, e))?;

    let mut rr = Record::from_rdata(name, ttl, rdata);
    rr.set_dns_class(DNSClass::IN);
    Ok(rr)
}
