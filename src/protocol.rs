//! WebSocket protocol messages
//!
//! JSON text frames discriminated by `type`. Field names are a fixed wire
//! contract shared with the mobile app, browser extension and web UI.

use serde::{Deserialize, Serialize};

/// Every frame exchanged between host and client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// Client authenticates with the token from the QR payload
    Pair { token: String },
    /// Host acknowledges a valid `pair`
    Hello { token: String, msg: String },
    /// Deprecated clipboard shape, normalised into `ClipboardRequest` on receipt
    Clipboard {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        action: Option<ClipboardAction>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<String>,
    },
    ClipboardRequest {
        action: ClipboardAction,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<String>,
    },
    ClipboardResponse {
        status: Status,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Media {
        action: MediaAction,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<i32>,
    },
    Presentation { action: PresentationAction },
    Command { command: String },
    #[serde(rename_all = "camelCase")]
    CommandOutput {
        output: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
    },
    #[serde(rename_all = "camelCase")]
    RemoteInput {
        finger_x: f64,
        finger_y: f64,
        normalized_x: f64,
        normalized_y: f64,
        touchpad_width: f64,
        touchpad_height: f64,
    },
    #[serde(rename_all = "camelCase")]
    FileStart {
        file_id: String,
        name: String,
        size: u64,
        #[serde(default = "default_mime")]
        mime: String,
    },
    /// `data` is base64 of one binary slice of the file
    #[serde(rename_all = "camelCase")]
    FileChunk {
        file_id: String,
        index: u64,
        data: String,
    },
    #[serde(rename_all = "camelCase")]
    FileEnd { file_id: String },
    #[serde(rename_all = "camelCase")]
    FileAck {
        file_id: String,
        status: Status,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Heartbeat
    Ping,
    Pong,
}

fn default_mime() -> String {
    "application/octet-stream".to_string()
}

/// Every `type` value [`Message`] understands.
pub const KNOWN_TYPES: &[&str] = &[
    "pair",
    "hello",
    "clipboard",
    "clipboard_request",
    "clipboard_response",
    "media",
    "presentation",
    "command",
    "command_output",
    "remote_input",
    "file_start",
    "file_chunk",
    "file_end",
    "file_ack",
    "ping",
    "pong",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClipboardAction {
    Get,
    Set,
}

/// Outcome carried by `clipboard_response` and `file_ack`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Success,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaAction {
    #[serde(alias = "playpause")]
    PlayPause,
    Next,
    Previous,
    VolumeUp,
    VolumeDown,
    Mute,
    BrightnessUp,
    BrightnessDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresentationAction {
    #[serde(alias = "next_slide")]
    Next,
    #[serde(alias = "previous_slide")]
    Previous,
    #[serde(alias = "start_presentation")]
    Start,
    #[serde(alias = "exit_presentation")]
    Exit,
}

impl Message {
    /// Wire `type` of this message
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Pair { .. } => "pair",
            Message::Hello { .. } => "hello",
            Message::Clipboard { .. } => "clipboard",
            Message::ClipboardRequest { .. } => "clipboard_request",
            Message::ClipboardResponse { .. } => "clipboard_response",
            Message::Media { .. } => "media",
            Message::Presentation { .. } => "presentation",
            Message::Command { .. } => "command",
            Message::CommandOutput { .. } => "command_output",
            Message::RemoteInput { .. } => "remote_input",
            Message::FileStart { .. } => "file_start",
            Message::FileChunk { .. } => "file_chunk",
            Message::FileEnd { .. } => "file_end",
            Message::FileAck { .. } => "file_ack",
            Message::Ping => "ping",
            Message::Pong => "pong",
        }
    }

    /// Encode as a JSON text frame
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Result of decoding one inbound text frame
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Message(Message),
    /// Not JSON at all: legacy plain-text payload
    Legacy(String),
    /// JSON with a `type` nobody handles
    Unknown(String),
    /// Known `type` (or no `type`) but the fields don't fit
    Malformed { kind: String, reason: String },
}

impl Inbound {
    pub fn parse(raw: &str) -> Self {
        let value: serde_json::Value = match serde_json::from_str(raw) {
            Ok(v) => v,
            Err(_) => return Inbound::Legacy(raw.to_string()),
        };

        let kind = match value.get("type").and_then(|t| t.as_str()) {
            Some(kind) => kind.to_string(),
            None => {
                return Inbound::Malformed {
                    kind: String::new(),
                    reason: "missing type".to_string(),
                }
            }
        };

        if !KNOWN_TYPES.contains(&kind.as_str()) {
            return Inbound::Unknown(kind);
        }

        match serde_json::from_value::<Message>(value) {
            Ok(msg) => Inbound::Message(msg),
            Err(e) => Inbound::Malformed {
                kind,
                reason: e.to_string(),
            },
        }
    }
}

/// Out-of-band pairing payload rendered into the QR code.
///
/// Field names are consumed verbatim by the mobile and web clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairingPayload {
    pub server_ip: String,
    pub port_no: u16,
    pub pairing_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
}

impl PairingPayload {
    /// Encode as JSON for the QR code
    pub fn to_qr_data(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Decode a scanned or pasted payload
    pub fn from_qr_data(data: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(data.trim())
    }

    /// WebSocket URL for this host (e.g., ws://192.168.1.10:9000)
    pub fn ws_url(&self) -> String {
        format!("ws://{}:{}", self.server_ip, self.port_no)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_chunk_uses_camel_case_fields() {
        let msg = Message::FileChunk {
            file_id: "f1".into(),
            index: 3,
            data: "AAEC".into(),
        };
        let json: serde_json::Value = serde_json::from_str(&msg.to_json()).unwrap();
        assert_eq!(json["type"], "file_chunk");
        assert_eq!(json["fileId"], "f1");
        assert_eq!(json["index"], 3);
    }

    #[test]
    fn test_remote_input_wire_shape() {
        let raw = r#"{"type":"remote_input","fingerX":10,"fingerY":20,"normalizedX":0.5,
            "normalizedY":0.25,"touchpadWidth":300,"touchpadHeight":200}"#;
        match Inbound::parse(raw) {
            Inbound::Message(Message::RemoteInput {
                normalized_x,
                touchpad_height,
                ..
            }) => {
                assert_eq!(normalized_x, 0.5);
                assert_eq!(touchpad_height, 200.0);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_legacy_clipboard_without_action() {
        let parsed = Inbound::parse(r#"{"type":"clipboard","data":"hi"}"#);
        assert_eq!(
            parsed,
            Inbound::Message(Message::Clipboard {
                action: None,
                data: Some("hi".into())
            })
        );
    }

    #[test]
    fn test_media_aliases() {
        let parsed = Inbound::parse(r#"{"type":"media","action":"playpause"}"#);
        assert_eq!(
            parsed,
            Inbound::Message(Message::Media {
                action: MediaAction::PlayPause,
                value: None
            })
        );
        let parsed = Inbound::parse(r#"{"type":"presentation","action":"next_slide"}"#);
        assert_eq!(
            parsed,
            Inbound::Message(Message::Presentation {
                action: PresentationAction::Next
            })
        );
    }

    #[test]
    fn test_non_json_is_legacy() {
        assert_eq!(
            Inbound::parse("hello there"),
            Inbound::Legacy("hello there".into())
        );
    }

    #[test]
    fn test_unknown_and_malformed() {
        assert_eq!(
            Inbound::parse(r#"{"type":"teleport"}"#),
            Inbound::Unknown("teleport".into())
        );
        assert!(matches!(
            Inbound::parse(r#"{"type":"file_chunk","fileId":"x"}"#),
            Inbound::Malformed { kind, .. } if kind == "file_chunk"
        ));
        assert!(matches!(
            Inbound::parse(r#"{"token":"abc"}"#),
            Inbound::Malformed { .. }
        ));
    }

    #[test]
    fn test_ping_ignores_extra_fields() {
        assert_eq!(
            Inbound::parse(r#"{"type":"pong","timestamp":12.5}"#),
            Inbound::Message(Message::Pong)
        );
    }

    #[test]
    fn test_pairing_payload_field_names() {
        let payload = PairingPayload {
            server_ip: "192.168.1.10".into(),
            port_no: 9000,
            pairing_token: "abc123".into(),
            host: None,
        };
        assert_eq!(
            payload.to_qr_data(),
            r#"{"server_ip":"192.168.1.10","port_no":9000,"pairing_token":"abc123"}"#
        );
        assert_eq!(PairingPayload::from_qr_data(&payload.to_qr_data()).unwrap(), payload);
        assert_eq!(payload.ws_url(), "ws://192.168.1.10:9000");
    }

    #[test]
    fn test_every_kind_is_known() {
        let samples = [
            Message::Ping,
            Message::Pong,
            Message::Pair { token: "t".into() },
            Message::FileEnd { file_id: "f".into() },
        ];
        for msg in samples {
            assert!(KNOWN_TYPES.contains(&msg.kind()));
            assert_eq!(Inbound::parse(&msg.to_json()), Inbound::Message(msg));
        }
    }
}
