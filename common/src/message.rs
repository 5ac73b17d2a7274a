use serde_json::{Map, Value};
use thiserror::Error;

use crate::topics::Channel;

/// Inbound payloads larger than the device's receive buffer are dropped.
pub const MAX_PAYLOAD_BYTES: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("payload of {0} bytes exceeds the receive buffer")]
    Oversized(usize),
    #[error("payload is not valid utf-8")]
    NotUtf8,
    #[error("payload is not valid json: {0}")]
    Json(String),
    #[error("payload is not a flat json object")]
    NotAnObject,
    #[error("missing field `{0}`")]
    MissingField(&'static str),
    #[error("field `{0}` must be a string")]
    InvalidField(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandAction {
    PumpOn,
    PumpOff,
    Relay2On,
    Relay2Off,
    Unknown(String),
}

impl CommandAction {
    fn parse(value: &str) -> Self {
        match value {
            "pump_on" => Self::PumpOn,
            "pump_off" => Self::PumpOff,
            "relay2_on" => Self::Relay2On,
            "relay2_off" => Self::Relay2Off,
            other => Self::Unknown(other.to_string()),
        }
    }
}

/// Firmware image announced by a `start_update` message. Every field is
/// optional on the wire; the update pipeline decides what it can work with.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FirmwareDescriptor {
    pub version: Option<String>,
    pub source_url: Option<String>,
    pub expected_size_bytes: Option<u32>,
    pub checksum: Option<String>,
}

impl FirmwareDescriptor {
    pub fn version_label(&self) -> &str {
        self.version.as_deref().unwrap_or("unknown")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FirmwareRequest {
    Start(FirmwareDescriptor),
    Cancel,
    Other(Option<String>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    Command(CommandAction),
    /// Raw requested mode; validated by the ingestor.
    ConfigUpdate(String),
    FirmwareUpdate(FirmwareRequest),
}

pub fn decode(channel: Channel, payload: &[u8]) -> Result<ControlMessage, DecodeError> {
    let fields = decode_fields(payload)?;

    match channel {
        Channel::Command => {
            let action = required_str(&fields, "action")?;
            Ok(ControlMessage::Command(CommandAction::parse(action)))
        }
        Channel::Config => {
            let mode = required_str(&fields, "mode")?;
            Ok(ControlMessage::ConfigUpdate(mode.to_string()))
        }
        Channel::FirmwareUpdate => {
            let request = match optional_str(&fields, "action").as_deref() {
                Some("start_update") => FirmwareRequest::Start(FirmwareDescriptor {
                    version: optional_str(&fields, "version"),
                    source_url: optional_str(&fields, "firmwareUrl"),
                    expected_size_bytes: fields
                        .get("firmwareSize")
                        .and_then(Value::as_u64)
                        .and_then(|size| u32::try_from(size).ok()),
                    checksum: optional_str(&fields, "checksum"),
                }),
                Some("cancel_update") => FirmwareRequest::Cancel,
                other => FirmwareRequest::Other(other.map(str::to_string)),
            };
            Ok(ControlMessage::FirmwareUpdate(request))
        }
    }
}

fn decode_fields(payload: &[u8]) -> Result<Map<String, Value>, DecodeError> {
    if payload.len() > MAX_PAYLOAD_BYTES {
        return Err(DecodeError::Oversized(payload.len()));
    }

    let text = std::str::from_utf8(payload).map_err(|_| DecodeError::NotUtf8)?;
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(fields)) => Ok(fields),
        Ok(_) => Err(DecodeError::NotAnObject),
        Err(err) => Err(DecodeError::Json(err.to_string())),
    }
}

fn required_str<'a>(
    fields: &'a Map<String, Value>,
    key: &'static str,
) -> Result<&'a str, DecodeError> {
    match fields.get(key) {
        Some(Value::String(value)) => Ok(value.as_str()),
        Some(_) => Err(DecodeError::InvalidField(key)),
        None => Err(DecodeError::MissingField(key)),
    }
}

fn optional_str(fields: &Map<String, Value>, key: &str) -> Option<String> {
    fields
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}
