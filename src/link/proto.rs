use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Response-type tag carried by magnetometer telemetry.
pub const MAG_DATA: &str = "MAGDATA";
/// Response-type tag carried by CPU temperature telemetry.
pub const CPU_TEMP_DATA: &str = "CPUTEMP";
/// Response-type tag carried by motor telemetry.
pub const MOTOR_DATA: &str = "MOTORDATA";

/// Opaque identifier correlating one outbound token with its response.
///
/// The device may echo it back as a JSON string or number; both decode to the
/// same textual form so `7` and `"7"` correlate.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct TransactionId(String);

impl TransactionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TransactionId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for TransactionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<u64> for TransactionId {
    fn from(value: u64) -> Self {
        Self(value.to_string())
    }
}

impl<'de> Deserialize<'de> for TransactionId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Wire {
            Text(String),
            Number(serde_json::Number),
        }

        Ok(match Wire::deserialize(deserializer)? {
            Wire::Text(text) => Self(text),
            Wire::Number(number) => Self(number.to_string()),
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Headers {
    #[serde(
        rename = "transactionID",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub transaction_id: Option<TransactionId>,
    #[serde(
        rename = "responseType",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub response_type: Option<String>,
}

/// One decoded frame received from the device.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Message {
    #[serde(default)]
    pub headers: Headers,
    #[serde(default)]
    pub body: Value,
}

impl Message {
    pub fn transaction_id(&self) -> Option<&TransactionId> {
        self.headers.transaction_id.as_ref()
    }

    pub fn response_type(&self) -> Option<&str> {
        self.headers.response_type.as_deref()
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct MagData {
    pub heading: f64,
    pub pitch: f64,
    pub roll: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct CpuTemperature {
    pub temperature: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct MotorData {
    #[serde(flatten)]
    pub fields: serde_json::Map<String, Value>,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn numeric_and_text_transaction_ids_correlate() {
        let numeric: Message =
            serde_json::from_str(r#"{"headers":{"transactionID":7},"body":null}"#)
                .expect("decode numeric id");
        let text: Message = serde_json::from_str(r#"{"headers":{"transactionID":"7"}}"#)
            .expect("decode text id");
        assert_eq!(numeric.transaction_id(), text.transaction_id());
        assert_eq!(numeric.transaction_id(), Some(&TransactionId::from(7u64)));
    }

    #[test]
    fn missing_sections_default_to_empty() {
        let message: Message = serde_json::from_str("{}").expect("decode empty object");
        assert_eq!(message.transaction_id(), None);
        assert_eq!(message.response_type(), None);
        assert_eq!(message.body, Value::Null);
    }

    #[test]
    fn telemetry_body_decodes_into_mag_data() {
        let message: Message = serde_json::from_value(json!({
            "headers": {"transactionID": "t1", "responseType": MAG_DATA},
            "body": {"heading": 10, "pitch": 0, "roll": 0}
        }))
        .expect("decode mag frame");
        assert_eq!(message.response_type(), Some(MAG_DATA));

        let mag: MagData = serde_json::from_value(message.body).expect("decode mag body");
        assert_eq!(
            mag,
            MagData {
                heading: 10.0,
                pitch: 0.0,
                roll: 0.0
            }
        );
    }

    #[test]
    fn headers_serialize_with_wire_names() {
        let message = Message {
            headers: Headers {
                transaction_id: Some("a".into()),
                response_type: None,
            },
            body: Value::Null,
        };
        let text = message.to_text().expect("encode");
        assert_eq!(text, r#"{"headers":{"transactionID":"a"},"body":null}"#);
    }
}
