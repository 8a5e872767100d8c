//! Transcript fragments and their data-channel encoding.

use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TranscriptRole {
    User,
    Agent,
}

impl fmt::Display for TranscriptRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TranscriptRole::User => write!(f, "user"),
            TranscriptRole::Agent => write!(f, "agent"),
        }
    }
}

/// A unit of conversation text produced by the voice pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptFragment {
    pub role: TranscriptRole,
    pub text: String,
}

impl TranscriptFragment {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: TranscriptRole::User,
            text: text.into(),
        }
    }

    pub fn agent(text: impl Into<String>) -> Self {
        Self {
            role: TranscriptRole::Agent,
            text: text.into(),
        }
    }

    /// Encodes the fragment as the JSON payload the UI listens for.
    pub fn to_payload(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(&DataMessage::Transcript {
            role: self.role,
            text: &self.text,
        })
    }
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum DataMessage<'a> {
    Transcript { role: TranscriptRole, text: &'a str },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_shape() {
        let payload = TranscriptFragment::user("namaste").to_payload().unwrap();
        let json: serde_json::Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"type": "transcript", "role": "user", "text": "namaste"})
        );

        let payload = TranscriptFragment::agent("hello").to_payload().unwrap();
        assert_eq!(
            String::from_utf8(payload).unwrap(),
            r#"{"type":"transcript","role":"agent","text":"hello"}"#
        );
    }

    #[test]
    fn test_text_is_relayed_verbatim() {
        let text = "  quoted \"text\" with ünïcode\n";
        let payload = TranscriptFragment::agent(text).to_payload().unwrap();
        let json: serde_json::Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(json["text"], text);
    }

    #[test]
    fn test_role_display() {
        assert_eq!(TranscriptRole::User.to_string(), "user");
        assert_eq!(TranscriptRole::Agent.to_string(), "agent");
    }
}
