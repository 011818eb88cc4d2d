//! Call wire protocol: JSON objects tagged by `"type"`.
//!
//! Client → server: `activate`, `speech`, `end`, `ping`.
//! Server → client: `status`, `response` (audio base64-encoded), `error`, `pong`.

use crate::config::Credentials;
use crate::error::TransportError;
use serde::{Deserialize, Serialize};

/// Call status as reported by the call service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteStatus {
    Connecting,
    Active,
    Ended,
}

fn default_audio_format() -> String {
    "mp3".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransportMessage {
    Activate {
        #[serde(flatten)]
        credentials: Credentials,
    },
    Status {
        status: RemoteStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    Speech {
        text: String,
    },
    Response {
        text: String,
        #[serde(default, with = "base64_audio", skip_serializing_if = "Option::is_none")]
        audio: Option<Vec<u8>>,
        #[serde(default = "default_audio_format")]
        audio_format: String,
    },
    Error {
        message: String,
    },
    End,
    Ping,
    Pong {
        #[serde(default)]
        duration: u64,
    },
}

impl TransportMessage {
    pub fn speech(text: impl Into<String>) -> Self {
        TransportMessage::Speech { text: text.into() }
    }

    pub fn status(status: RemoteStatus) -> Self {
        TransportMessage::Status {
            status,
            message: None,
        }
    }

    /// Short name for logs; never includes payloads or credentials.
    pub fn kind(&self) -> &'static str {
        match self {
            TransportMessage::Activate { .. } => "activate",
            TransportMessage::Status { .. } => "status",
            TransportMessage::Speech { .. } => "speech",
            TransportMessage::Response { .. } => "response",
            TransportMessage::Error { .. } => "error",
            TransportMessage::End => "end",
            TransportMessage::Ping => "ping",
            TransportMessage::Pong { .. } => "pong",
        }
    }

    pub fn encode(&self) -> Result<String, TransportError> {
        serde_json::to_string(self).map_err(|e| TransportError::InvalidMessage(e.to_string()))
    }

    pub fn decode(frame: &str) -> Result<Self, TransportError> {
        serde_json::from_str(frame).map_err(|e| TransportError::InvalidMessage(e.to_string()))
    }
}

mod base64_audio {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};
    use tracing::warn;

    pub fn serialize<S>(audio: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match audio {
            Some(bytes) => serializer.serialize_str(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    /// A clip that is not valid base64 is dropped; the rest of the message still applies.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded: Option<String> = Option::deserialize(deserializer)?;
        match encoded.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(s) => match STANDARD.decode(s) {
                Ok(bytes) => Ok(Some(bytes)),
                Err(e) => {
                    warn!(target: "companion::call", "Dropping undecodable audio: {}", e);
                    Ok(None)
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn activate_carries_flat_credentials() {
        let msg = TransportMessage::Activate {
            credentials: Credentials::new("key-1", "group-1"),
        };
        let value: serde_json::Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"type": "activate", "api_key": "key-1", "group_id": "group-1"})
        );
    }

    #[test]
    fn unit_messages_are_bare_tags() {
        assert_eq!(TransportMessage::End.encode().unwrap(), r#"{"type":"end"}"#);
        assert_eq!(TransportMessage::Ping.encode().unwrap(), r#"{"type":"ping"}"#);
    }

    #[test]
    fn decodes_server_status_with_extra_fields() {
        let frame = r#"{"type":"status","status":"connecting","session":{"id":"s1","duration":0}}"#;
        assert_eq!(
            TransportMessage::decode(frame).unwrap(),
            TransportMessage::status(RemoteStatus::Connecting)
        );

        let frame = r#"{"type":"status","status":"active","message":"Call activated"}"#;
        match TransportMessage::decode(frame).unwrap() {
            TransportMessage::Status { status, message } => {
                assert_eq!(status, RemoteStatus::Active);
                assert_eq!(message.as_deref(), Some("Call activated"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn decodes_response_audio_from_base64() {
        let frame = r#"{"type":"response","text":"你好！","audio":"AAEC","audio_format":"wav"}"#;
        match TransportMessage::decode(frame).unwrap() {
            TransportMessage::Response {
                text,
                audio,
                audio_format,
            } => {
                assert_eq!(text, "你好！");
                assert_eq!(audio, Some(vec![0u8, 1, 2]));
                assert_eq!(audio_format, "wav");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn response_without_audio_defaults_format() {
        let frame = r#"{"type":"response","text":"嗯"}"#;
        match TransportMessage::decode(frame).unwrap() {
            TransportMessage::Response {
                audio, audio_format, ..
            } => {
                assert!(audio.is_none());
                assert_eq!(audio_format, "mp3");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn bad_base64_keeps_response_text() {
        let frame = r#"{"type":"response","text":"你好！","audio":"%%%"}"#;
        match TransportMessage::decode(frame).unwrap() {
            TransportMessage::Response { text, audio, .. } => {
                assert_eq!(text, "你好！");
                assert!(audio.is_none());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn unknown_type_is_invalid_message() {
        assert!(TransportMessage::decode(r#"{"type":"karaoke"}"#).is_err());
    }
}
