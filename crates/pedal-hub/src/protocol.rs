//! # Wireless Protocol
//!
//! Message types exchanged with field units over the two logical channels.
//!
//! ## Message Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Field Unit ⇄ Hub Messages                          │
//! │                                                                         │
//! │  FIELD UNIT                                   HUB                       │
//! │  ──────────                                   ───                       │
//! │                                                                         │
//! │  bike_registration ─────── data ──────────►  attribute session         │
//! │  {bike_id, battery, heap, ...} ── data ───►  active-slot discipline    │
//! │  config_request ────────── config ────────►                            │
//! │                  ◄──────── config ────────── {target_bike, config}     │
//! │  config_received ───────── config ────────►  bookkeeping only          │
//! │  alert ─────────────────── data ──────────►  critical buffer entry     │
//! │                  ◄──────── data ──────────── data_request (pull)       │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every inbound payload is parsed exactly once into a [`UnitMessage`].
//! Payloads without a `type` are telemetry; an unrecognised `type` or a
//! missing `bike_id` is rejected here and never reaches business logic.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use pedal_core::{FieldUnitId, Timestamp};

use crate::error::{HubError, HubResult};

// =============================================================================
// Channels
// =============================================================================

/// Logical channel a write arrived on or a notification goes out on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Data,
    Config,
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Channel::Data => write!(f, "data"),
            Channel::Config => write!(f, "config"),
        }
    }
}

// =============================================================================
// Inbound Messages
// =============================================================================

/// First-contact announcement.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Registration {
    pub bike_id: String,
    #[serde(default)]
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub version: Option<String>,
}

/// Unit asks for its configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ConfigRequest {
    pub bike_id: String,
}

/// Unit acknowledges a configuration push.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ConfigReceived {
    pub bike_id: String,
    #[serde(default = "default_status")]
    pub status: String,
    #[serde(default)]
    pub version: Option<u32>,
}

fn default_status() -> String {
    "ok".to_string()
}

/// Safety event raised by a unit (fall, theft, tamper).
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Alert {
    pub bike_id: String,
    #[serde(default = "default_alert_kind")]
    pub kind: String,
    #[serde(default)]
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub detail: Option<Value>,
}

fn default_alert_kind() -> String {
    "unspecified".to_string()
}

/// Untyped data-channel payload.
///
/// Only `bike_id` is typed. Readings stay in `fields` exactly as the unit
/// sent them, so an odd `battery` or `heap` value never costs the record.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Telemetry {
    pub bike_id: String,
    /// Every other field the unit sent, preserved for upload.
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Telemetry {
    /// Battery reading rounded to a whole percent. `None` when absent or
    /// not a finite number.
    pub fn battery(&self) -> Option<i64> {
        self.fields
            .get("battery")
            .and_then(Value::as_f64)
            .filter(|v| v.is_finite())
            .map(|v| v.round() as i64)
    }

    /// Free heap in bytes. `None` when absent, negative, fractional or
    /// beyond `u32`.
    pub fn heap(&self) -> Option<u32> {
        self.fields
            .get("heap")
            .and_then(Value::as_u64)
            .and_then(|v| u32::try_from(v).ok())
    }

    /// Unit-reported epoch seconds, if it sent a usable one.
    pub fn timestamp(&self) -> Option<i64> {
        let raw = self.fields.get("timestamp")?;
        raw.as_i64().or_else(|| {
            raw.as_f64()
                .filter(|v| v.is_finite() && v.abs() < i64::MAX as f64)
                .map(|v| v as i64)
        })
    }

    /// Builds the document stored in the offline buffer.
    pub fn to_buffer_payload(&self, timestamp: Timestamp, corrected: bool) -> Value {
        let mut doc = self.fields.clone();
        doc.remove("type");
        doc.insert("bike_id".into(), Value::from(self.bike_id.clone()));
        doc.insert("timestamp".into(), Value::from(timestamp));
        doc.insert("timestamp_corrected".into(), Value::from(corrected));
        Value::Object(doc)
    }
}

/// Parsed inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum UnitMessage {
    Registration(Registration),
    ConfigRequest(ConfigRequest),
    ConfigReceived(ConfigReceived),
    Alert(Alert),
    Telemetry(Telemetry),
}

impl UnitMessage {
    /// Parses a raw payload.
    ///
    /// ## Errors
    /// - [`HubError::InvalidMessage`] for non-JSON or non-object payloads
    /// - [`HubError::MissingBikeId`] when `bike_id` is absent or not a string
    /// - [`HubError::UnknownMessageType`] for an unrecognised `type`
    pub fn parse(payload: &str) -> HubResult<Self> {
        let value: Value = serde_json::from_str(payload)
            .map_err(|e| HubError::InvalidMessage(e.to_string()))?;

        let object = value
            .as_object()
            .ok_or_else(|| HubError::InvalidMessage("payload is not a JSON object".into()))?;

        if !matches!(object.get("bike_id"), Some(Value::String(_))) {
            return Err(HubError::MissingBikeId);
        }

        let kind = object.get("type").and_then(Value::as_str).map(str::to_owned);

        let message = match kind.as_deref() {
            None | Some("telemetry") => UnitMessage::Telemetry(decode(value)?),
            Some("bike_registration") => UnitMessage::Registration(decode(value)?),
            Some("config_request") => UnitMessage::ConfigRequest(decode(value)?),
            Some("config_received") => UnitMessage::ConfigReceived(decode(value)?),
            Some("alert") => UnitMessage::Alert(decode(value)?),
            Some(other) => return Err(HubError::UnknownMessageType(other.to_string())),
        };

        Ok(message)
    }

    /// Identity the message claims to come from.
    pub fn bike_id(&self) -> &str {
        match self {
            UnitMessage::Registration(m) => &m.bike_id,
            UnitMessage::ConfigRequest(m) => &m.bike_id,
            UnitMessage::ConfigReceived(m) => &m.bike_id,
            UnitMessage::Alert(m) => &m.bike_id,
            UnitMessage::Telemetry(m) => &m.bike_id,
        }
    }

    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            UnitMessage::Registration(_) => "bike_registration",
            UnitMessage::ConfigRequest(_) => "config_request",
            UnitMessage::ConfigReceived(_) => "config_received",
            UnitMessage::Alert(_) => "alert",
            UnitMessage::Telemetry(_) => "telemetry",
        }
    }
}

fn decode<T: serde::de::DeserializeOwned>(value: Value) -> HubResult<T> {
    serde_json::from_value(value).map_err(|e| HubError::InvalidMessage(e.to_string()))
}

// =============================================================================
// Outbound Messages
// =============================================================================

/// Notification sent from the hub to one connection.
#[derive(Debug, Clone, PartialEq)]
pub enum HubMessage {
    /// Configuration reply, sent on the config channel.
    ConfigPush {
        target_bike: FieldUnitId,
        timestamp: Timestamp,
        config: Value,
    },
    /// "Send your data now", sent on the data channel when a queued unit
    /// becomes active.
    DataRequest { bike_id: FieldUnitId },
}

impl HubMessage {
    /// Channel this message travels on.
    pub fn channel(&self) -> Channel {
        match self {
            HubMessage::ConfigPush { .. } => Channel::Config,
            HubMessage::DataRequest { .. } => Channel::Data,
        }
    }

    /// Wire representation.
    pub fn to_json(&self) -> Value {
        match self {
            HubMessage::ConfigPush {
                target_bike,
                timestamp,
                config,
            } => json!({
                "target_bike": target_bike.as_str(),
                "timestamp": timestamp,
                "config": config,
            }),
            HubMessage::DataRequest { bike_id } => json!({
                "type": "data_request",
                "bike_id": bike_id.as_str(),
            }),
        }
    }

    /// Encoded payload ready for the radio.
    pub fn encode(&self) -> String {
        self.to_json().to_string()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_registration() {
        let msg = UnitMessage::parse(
            r#"{"type":"bike_registration","bike_id":"u-000001","timestamp":1700000000,"version":"1.4.2"}"#,
        )
        .unwrap();
        match msg {
            UnitMessage::Registration(r) => {
                assert_eq!(r.bike_id, "u-000001");
                assert_eq!(r.timestamp, Some(1_700_000_000));
                assert_eq!(r.version.as_deref(), Some("1.4.2"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_untyped_payload_is_telemetry_with_extra_fields() {
        let msg =
            UnitMessage::parse(r#"{"bike_id":"u-AAA","battery":87,"heap":40000,"lat":52.1}"#)
                .unwrap();
        match msg {
            UnitMessage::Telemetry(t) => {
                assert_eq!(t.battery(), Some(87));
                assert_eq!(t.heap(), Some(40_000));
                assert_eq!(t.timestamp(), None);
                assert_eq!(t.fields.get("lat"), Some(&json!(52.1)));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_config_messages() {
        assert!(matches!(
            UnitMessage::parse(r#"{"type":"config_request","bike_id":"u-AAA"}"#).unwrap(),
            UnitMessage::ConfigRequest(_)
        ));

        match UnitMessage::parse(r#"{"type":"config_received","bike_id":"u-AAA"}"#).unwrap() {
            UnitMessage::ConfigReceived(c) => {
                assert_eq!(c.status, "ok");
                assert_eq!(c.version, None);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_boundary_rejections() {
        assert!(matches!(
            UnitMessage::parse(r#"{"battery":87}"#),
            Err(HubError::MissingBikeId)
        ));
        assert!(matches!(
            UnitMessage::parse(r#"{"bike_id":42}"#),
            Err(HubError::MissingBikeId)
        ));
        assert!(matches!(
            UnitMessage::parse(r#"{"type":"firmware_blob","bike_id":"u-AAA"}"#),
            Err(HubError::UnknownMessageType(t)) if t == "firmware_blob"
        ));
        assert!(matches!(
            UnitMessage::parse("not json"),
            Err(HubError::InvalidMessage(_))
        ));
        assert!(matches!(
            UnitMessage::parse("[1,2]"),
            Err(HubError::InvalidMessage(_))
        ));
    }

    #[test]
    fn test_odd_readings_do_not_reject_telemetry() {
        let UnitMessage::Telemetry(t) = UnitMessage::parse(
            r#"{"bike_id":"u-AAA","battery":87.5,"heap":5000000000,"timestamp":1700000000.7,"lat":52.1}"#,
        )
        .unwrap() else {
            panic!("expected telemetry");
        };
        assert_eq!(t.battery(), Some(88));
        assert_eq!(t.heap(), None);
        assert_eq!(t.timestamp(), Some(1_700_000_000));

        let UnitMessage::Telemetry(t) =
            UnitMessage::parse(r#"{"bike_id":"u-AAA","battery":"full","heap":-1}"#).unwrap()
        else {
            panic!("expected telemetry");
        };
        assert_eq!(t.battery(), None);
        assert_eq!(t.heap(), None);

        let doc = t.to_buffer_payload(1_700_000_123, false);
        assert_eq!(doc["battery"], "full");
        assert_eq!(doc["heap"], -1);
    }

    #[test]
    fn test_telemetry_buffer_payload() {
        let msg = UnitMessage::parse(r#"{"bike_id":"u-AAA","battery":50,"speed":12}"#).unwrap();
        let UnitMessage::Telemetry(t) = msg else {
            panic!("expected telemetry");
        };
        let doc = t.to_buffer_payload(1_700_000_123, true);
        assert_eq!(doc["bike_id"], "u-AAA");
        assert_eq!(doc["speed"], 12);
        assert_eq!(doc["timestamp"], 1_700_000_123);
        assert_eq!(doc["timestamp_corrected"], true);
    }

    #[test]
    fn test_outbound_encoding() {
        let id = FieldUnitId::parse("u-AAA").unwrap();

        let push = HubMessage::ConfigPush {
            target_bike: id.clone(),
            timestamp: 1_700_000_000,
            config: json!({"version": 4}),
        };
        assert_eq!(push.channel(), Channel::Config);
        assert_eq!(
            push.to_json(),
            json!({"target_bike":"u-AAA","timestamp":1_700_000_000,"config":{"version":4}})
        );

        let pull = HubMessage::DataRequest { bike_id: id };
        assert_eq!(pull.channel(), Channel::Data);
        assert_eq!(
            pull.to_json(),
            json!({"type":"data_request","bike_id":"u-AAA"})
        );
    }
}
