//! Provider media-stream wire protocol
//!
//! JSON text frames with a top-level `event` tag. Every frame after
//! the initial handshake carries the provider-assigned stream id.
//! Inbound and outbound media payloads are standard base64 of raw
//! mu-law bytes, no line wrapping.

use serde::{Deserialize, Serialize};

/// Events the provider sends to us.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum ProviderEvent {
    /// Provider handshake, no payload used.
    Connected {
        #[serde(default)]
        protocol: Option<String>,
        #[serde(default)]
        version: Option<serde_json::Value>,
    },
    /// Begin call.
    Start {
        #[serde(rename = "streamSid")]
        stream_sid: String,
        start: StartMeta,
    },
    /// Inbound audio frame, typically 20ms.
    Media {
        #[serde(rename = "streamSid")]
        stream_sid: String,
        media: MediaMeta,
    },
    /// Provider confirms playback reached an earlier mark.
    Mark {
        #[serde(rename = "streamSid")]
        stream_sid: String,
        mark: MarkMeta,
    },
    /// Call ended.
    Stop {
        #[serde(rename = "streamSid")]
        stream_sid: String,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct StartMeta {
    #[serde(rename = "callSid")]
    pub call_sid: String,
    /// Caller phone number when the provider forwards it
    #[serde(default)]
    pub from: Option<String>,
    #[serde(rename = "mediaFormat")]
    pub media_format: MediaFormat,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MediaFormat {
    pub encoding: String,
    #[serde(rename = "sampleRate")]
    pub sample_rate: u32,
    pub channels: u32,
}

impl MediaFormat {
    /// The only format this engine speaks: 8kHz mono mu-law.
    pub fn is_supported(&self) -> bool {
        self.encoding.eq_ignore_ascii_case("audio/x-mulaw")
            && self.sample_rate == 8000
            && self.channels == 1
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MediaMeta {
    /// Base64 of mu-law bytes
    pub payload: String,
    /// Milliseconds relative to stream start, as a decimal string
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub chunk: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MarkMeta {
    pub name: String,
}

/// Events we send to the provider.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "lowercase")]
enum OutboundEvent<'a> {
    Media {
        #[serde(rename = "streamSid")]
        stream_sid: &'a str,
        media: OutboundMedia<'a>,
    },
    Mark {
        #[serde(rename = "streamSid")]
        stream_sid: &'a str,
        mark: OutboundMark<'a>,
    },
}

#[derive(Debug, Clone, Serialize)]
struct OutboundMedia<'a> {
    payload: &'a str,
}

#[derive(Debug, Clone, Serialize)]
struct OutboundMark<'a> {
    name: &'a str,
}

/// Parse one provider text frame.
pub fn parse_event(text: &str) -> Result<ProviderEvent, serde_json::Error> {
    serde_json::from_str(text)
}

/// Serialize an outbound media frame.
pub fn media_frame(stream_sid: &str, payload_b64: &str) -> String {
    serde_json::to_string(&OutboundEvent::Media {
        stream_sid,
        media: OutboundMedia {
            payload: payload_b64,
        },
    })
    .unwrap()
}

/// Serialize an outbound mark frame.
pub fn mark_frame(stream_sid: &str, name: &str) -> String {
    serde_json::to_string(&OutboundEvent::Mark {
        stream_sid,
        mark: OutboundMark { name },
    })
    .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_start() {
        let text = r#"{
            "event": "start",
            "streamSid": "MZ123",
            "start": {
                "callSid": "CA456",
                "from": "+15551234567",
                "mediaFormat": {"encoding": "audio/x-mulaw", "sampleRate": 8000, "channels": 1}
            }
        }"#;
        match parse_event(text).unwrap() {
            ProviderEvent::Start { stream_sid, start } => {
                assert_eq!(stream_sid, "MZ123");
                assert_eq!(start.call_sid, "CA456");
                assert_eq!(start.from.as_deref(), Some("+15551234567"));
                assert!(start.media_format.is_supported());
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_parse_media() {
        let text = r#"{
            "event": "media",
            "streamSid": "MZ123",
            "media": {"payload": "AAAA", "timestamp": "1240", "chunk": "62"}
        }"#;
        match parse_event(text).unwrap() {
            ProviderEvent::Media { media, .. } => {
                assert_eq!(media.payload, "AAAA");
                assert_eq!(media.timestamp.as_deref(), Some("1240"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_parse_stop_and_connected() {
        assert!(matches!(
            parse_event(r#"{"event": "stop", "streamSid": "MZ1"}"#).unwrap(),
            ProviderEvent::Stop { .. }
        ));
        assert!(matches!(
            parse_event(r#"{"event": "connected", "protocol": "Call", "version": "1.0.0"}"#)
                .unwrap(),
            ProviderEvent::Connected { .. }
        ));
    }

    #[test]
    fn test_unknown_event_is_an_error() {
        assert!(parse_event(r#"{"event": "dtmf", "streamSid": "MZ1"}"#).is_err());
        assert!(parse_event("not json").is_err());
    }

    #[test]
    fn test_media_frame_shape() {
        let frame = media_frame("MZ123", "cGF5bG9hZA==");
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["event"], "media");
        assert_eq!(value["streamSid"], "MZ123");
        assert_eq!(value["media"]["payload"], "cGF5bG9hZA==");
    }

    #[test]
    fn test_mark_frame_shape() {
        let frame = mark_frame("MZ123", "reply-0");
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["event"], "mark");
        assert_eq!(value["mark"]["name"], "reply-0");
    }

    #[test]
    fn test_unsupported_format_detected() {
        let format = MediaFormat {
            encoding: "audio/l16".into(),
            sample_rate: 16000,
            channels: 1,
        };
        assert!(!format.is_supported());
    }
}
