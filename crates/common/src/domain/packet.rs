use crate::domain::bus::Attributes;
use crate::domain::result::{DomainError, DomainResult};
use crate::domain::validate::{validate_struct, SourceRegion};
use crate::domain::wire_format::{to_python_json, to_python_json_string};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Layout of `datetime_created` on the wire, e.g. `2024-09-20T15:31:38.520109+0000`.
pub const WIRE_DATETIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f%z";

/// Accepts any sub-second precision when decoding.
const WIRE_DATETIME_PARSE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f%z";

/// Attribute key carrying the JSON-encoded [`PacketAttributes`].
pub const ATTRS_ATTRIBUTE: &str = "attrs";

/// Identity of a packet for de-duplication.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey {
    pub unix_ms: i64,
    pub region: String,
}

impl DedupKey {
    pub fn new(unix_ms: i64, region: impl Into<String>) -> Self {
        Self {
            unix_ms,
            region: region.into(),
        }
    }
}

impl fmt::Display for DedupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.unix_ms, self.region)
    }
}

/// One synthetic sensor reading.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub created_at: DateTime<Utc>,
    pub unix_ms: i64,
    pub region: String,
    pub channels: Vec<f64>,
}

#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct WirePacket {
    datetime_created: String,
    unix_ms: f64,
    pub_region: String,
    payload: String,
}

impl Packet {
    pub fn dedup_key(&self) -> DedupKey {
        DedupKey::new(self.unix_ms, self.region.clone())
    }

    /// Serialize to the JSON object published on the bus. Key order and
    /// separators are fixed so equal packets produce equal bytes.
    pub fn to_wire_bytes(&self) -> DomainResult<Bytes> {
        if let Some(idx) = self.channels.iter().position(|v| !v.is_finite()) {
            return Err(DomainError::InvalidArgument(format!(
                "channel {} is not a finite number",
                idx
            )));
        }

        let payload = to_python_json_string(&self.channels)
            .map_err(|e| DomainError::InvalidArgument(format!("payload encoding: {}", e)))?;

        let wire = WirePacket {
            datetime_created: self.created_at.format(WIRE_DATETIME_FORMAT).to_string(),
            unix_ms: self.unix_ms as f64,
            pub_region: self.region.clone(),
            payload,
        };

        let bytes = to_python_json(&wire)
            .map_err(|e| DomainError::InvalidArgument(format!("packet encoding: {}", e)))?;
        Ok(Bytes::from(bytes))
    }

    pub fn from_wire_bytes(data: &[u8]) -> DomainResult<Self> {
        let wire: WirePacket = serde_json::from_slice(data)
            .map_err(|e| DomainError::DecodeError(format!("packet json: {}", e)))?;

        let created_at =
            DateTime::parse_from_str(&wire.datetime_created, WIRE_DATETIME_PARSE_FORMAT)
                .map_err(|e| {
                    DomainError::DecodeError(format!(
                        "datetime_created '{}': {}",
                        wire.datetime_created, e
                    ))
                })?
                .with_timezone(&Utc);

        if !wire.unix_ms.is_finite() || wire.unix_ms < 0.0 {
            return Err(DomainError::DecodeError(format!(
                "unix_ms {} is not a non-negative number",
                wire.unix_ms
            )));
        }

        validate_struct(&SourceRegion::new(&wire.pub_region))
            .map_err(|_| DomainError::DecodeError("pub_region is empty".to_string()))?;

        let channels: Vec<f64> = serde_json::from_str(&wire.payload)
            .map_err(|e| DomainError::DecodeError(format!("payload: {}", e)))?;

        Ok(Self {
            created_at,
            unix_ms: wire.unix_ms.trunc() as i64,
            region: wire.pub_region,
            channels,
        })
    }
}

/// Descriptive metadata published alongside each packet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PacketAttributes {
    pub business: String,
    pub latitude: f64,
    pub longitude: f64,
}

impl Default for PacketAttributes {
    fn default() -> Self {
        Self {
            business: "Mechatronic Solutions LLC".to_string(),
            latitude: 40.44127,
            longitude: -76.12276,
        }
    }
}

impl PacketAttributes {
    pub fn to_attributes(&self) -> DomainResult<Attributes> {
        let encoded = to_python_json_string(self)
            .map_err(|e| DomainError::InvalidArgument(format!("attrs encoding: {}", e)))?;
        let mut attributes = Attributes::new();
        attributes.insert(ATTRS_ATTRIBUTE.to_string(), encoded);
        Ok(attributes)
    }

    pub fn from_attributes(attributes: &Attributes) -> DomainResult<Self> {
        let raw = attributes.get(ATTRS_ATTRIBUTE).ok_or_else(|| {
            DomainError::DecodeError(format!("missing '{}' attribute", ATTRS_ATTRIBUTE))
        })?;
        serde_json::from_str(raw)
            .map_err(|e| DomainError::DecodeError(format!("attrs: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference_packet() -> Packet {
        Packet {
            created_at: DateTime::from_timestamp(1_726_846_298, 520_109_000).unwrap(),
            unix_ms: 1_726_846_298_000,
            region: "us-east4".to_string(),
            channels: vec![
                0.1726846298,
                0.17182766645607023,
                0.20854329490139709,
                0.8513872227333332,
                3.453692596,
            ],
        }
    }

    const REFERENCE_WIRE: &str = r#"{"datetime_created": "2024-09-20T15:31:38.520109+0000", "unix_ms": 1726846298000.0, "pub_region": "us-east4", "payload": "[0.1726846298, 0.17182766645607023, 0.20854329490139709, 0.8513872227333332, 3.453692596]"}"#;

    #[test]
    fn test_encode_matches_reference_bytes() {
        let bytes = reference_packet().to_wire_bytes().unwrap();
        assert_eq!(std::str::from_utf8(&bytes).unwrap(), REFERENCE_WIRE);
    }

    #[test]
    fn test_decode_reference_bytes() {
        let packet = Packet::from_wire_bytes(REFERENCE_WIRE.as_bytes()).unwrap();
        assert_eq!(packet, reference_packet());
        assert_eq!(
            packet.dedup_key(),
            DedupKey::new(1_726_846_298_000, "us-east4")
        );
    }

    #[test]
    fn test_encode_rejects_non_finite_channel() {
        let mut packet = reference_packet();
        packet.channels[2] = f64::NAN;
        let err = packet.to_wire_bytes().unwrap_err();
        assert!(matches!(err, DomainError::InvalidArgument(_)));
    }

    #[test]
    fn test_decode_rejects_unknown_field() {
        let data = br#"{"datetime_created": "2024-09-20T15:31:38.520109+0000", "unix_ms": 1.0, "pub_region": "r", "payload": "[]", "extra": 1}"#;
        assert!(matches!(
            Packet::from_wire_bytes(data),
            Err(DomainError::DecodeError(_))
        ));
    }

    #[test]
    fn test_decode_rejects_missing_field() {
        let data = br#"{"datetime_created": "2024-09-20T15:31:38.520109+0000", "pub_region": "r", "payload": "[]"}"#;
        assert!(matches!(
            Packet::from_wire_bytes(data),
            Err(DomainError::DecodeError(_))
        ));
    }

    #[test]
    fn test_decode_rejects_bad_datetime_and_payload() {
        let bad_time = br#"{"datetime_created": "yesterday", "unix_ms": 1.0, "pub_region": "r", "payload": "[]"}"#;
        assert!(matches!(
            Packet::from_wire_bytes(bad_time),
            Err(DomainError::DecodeError(_))
        ));

        let bad_payload = br#"{"datetime_created": "2024-09-20T15:31:38.520109+0000", "unix_ms": 1.0, "pub_region": "r", "payload": "[1.0, "#;
        assert!(matches!(
            Packet::from_wire_bytes(bad_payload),
            Err(DomainError::DecodeError(_))
        ));
    }

    #[test]
    fn test_decode_rejects_negative_unix_ms() {
        let data = br#"{"datetime_created": "2024-09-20T15:31:38.520109+0000", "unix_ms": -5.0, "pub_region": "r", "payload": "[]"}"#;
        assert!(matches!(
            Packet::from_wire_bytes(data),
            Err(DomainError::DecodeError(_))
        ));
    }

    #[test]
    fn test_decode_truncates_fractional_unix_ms() {
        let data = br#"{"datetime_created": "2024-09-20T15:31:38.520109+0000", "unix_ms": 1726846298000.9, "pub_region": "r", "payload": "[]"}"#;
        let packet = Packet::from_wire_bytes(data).unwrap();
        assert_eq!(packet.unix_ms, 1_726_846_298_000);
        assert!(packet.channels.is_empty());
    }

    #[test]
    fn test_attributes_encoding() {
        let attrs = PacketAttributes::default().to_attributes().unwrap();
        assert_eq!(
            attrs.get(ATTRS_ATTRIBUTE).map(String::as_str),
            Some(r#"{"business": "Mechatronic Solutions LLC", "latitude": 40.44127, "longitude": -76.12276}"#)
        );
        assert_eq!(
            PacketAttributes::from_attributes(&attrs).unwrap(),
            PacketAttributes::default()
        );
    }

    #[test]
    fn test_missing_attributes_is_decode_error() {
        let err = PacketAttributes::from_attributes(&Attributes::new()).unwrap_err();
        assert!(matches!(err, DomainError::DecodeError(_)));
    }

    #[test]
    fn test_dedup_key_display() {
        assert_eq!(DedupKey::new(42, "eu-west1").to_string(), "42/eu-west1");
    }
}
