//! Framing between [`Message`]s and typed protocol messages.

use super::messages::{InboundMessage, OutboundMessage, ServerContent, ToolCall, ToolCallCancellation};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tokio_tungstenite::tungstenite::protocol::Message;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("payload is not valid UTF-8")]
    InvalidUtf8,
    #[error("malformed JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unrecognized message with keys [{0}]")]
    Unrecognized(String),
}

pub fn encode(message: &OutboundMessage) -> Result<Message, serde_json::Error> {
    let json = serde_json::to_string(message)?;
    Ok(Message::Text(json.into()))
}

/// Decodes a data frame. Control frames (ping, pong, close) yield `Ok(None)`.
///
/// The service sends JSON in binary frames as well as text frames; both are accepted.
pub fn decode(message: &Message) -> Result<Option<InboundMessage>, DecodeError> {
    let text = match message {
        Message::Text(text) => text.as_str(),
        Message::Binary(bytes) => {
            std::str::from_utf8(bytes.as_slice()).map_err(|_| DecodeError::InvalidUtf8)?
        }
        _ => return Ok(None),
    };
    decode_json(text).map(Some)
}

pub fn decode_json(text: &str) -> Result<InboundMessage, DecodeError> {
    let raw: RawInbound = serde_json::from_str(text)?;
    raw.classify()
}

/// Every key the service may send, all optional. Unknown keys (usage metadata and the like) are
/// ignored.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawInbound {
    setup_complete: Option<Value>,
    server_content: Option<ServerContent>,
    tool_call: Option<ToolCall>,
    tool_call_cancellation: Option<ToolCallCancellation>,
    #[serde(flatten)]
    rest: serde_json::Map<String, Value>,
}

impl RawInbound {
    fn classify(self) -> Result<InboundMessage, DecodeError> {
        if self.setup_complete.is_some() {
            return Ok(InboundMessage::SetupComplete);
        }
        if let Some(content) = self.server_content {
            return Ok(InboundMessage::ServerContent(content));
        }
        if let Some(call) = self.tool_call {
            return Ok(InboundMessage::ToolCall(call));
        }
        if let Some(cancellation) = self.tool_call_cancellation {
            return Ok(InboundMessage::ToolCallCancellation(cancellation));
        }
        let keys: Vec<&str> = self.rest.keys().map(String::as_str).collect();
        Err(DecodeError::Unrecognized(keys.join(", ")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::messages::{Part, SessionConfig};

    #[test]
    fn test_encode_produces_text_frame() {
        let message = encode(&OutboundMessage::Setup(SessionConfig::new("m1"))).unwrap();
        match message {
            Message::Text(text) => assert_eq!(text.as_str(), r#"{"setup":{"model":"m1"}}"#),
            other => panic!("expected text frame, got {:?}", other),
        }
    }

    #[test]
    fn test_setup_complete_with_empty_object() {
        assert_eq!(
            decode_json(r#"{"setupComplete":{}}"#).unwrap(),
            InboundMessage::SetupComplete
        );
    }

    #[test]
    fn test_binary_frame_with_json_is_accepted() {
        let frame = Message::Binary(br#"{"serverContent":{"turnComplete":true}}"#.to_vec().into());
        match decode(&frame).unwrap() {
            Some(InboundMessage::ServerContent(content)) => {
                assert!(content.turn_complete);
                assert!(!content.interrupted);
                assert!(content.model_turn.is_none());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_model_turn_with_audio_part() {
        let json = r#"{"serverContent":{"modelTurn":{"role":"model","parts":[{"inlineData":{"mimeType":"audio/pcm;rate=24000","data":"AAEC"}}]}}}"#;
        let InboundMessage::ServerContent(content) = decode_json(json).unwrap() else {
            panic!("expected serverContent");
        };
        let parts = content.model_turn.unwrap().parts;
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].audio_bytes(), Some(&[0u8, 1, 2][..]));
        assert!(!matches!(parts[0], Part::Text(_)));
    }

    #[test]
    fn test_tool_call_and_cancellation() {
        let call = decode_json(r#"{"toolCall":{"functionCalls":[{"id":"1","name":"x","args":{"a":1}}]}}"#)
            .unwrap();
        match call {
            InboundMessage::ToolCall(call) => {
                assert_eq!(call.function_calls[0].id, "1");
                assert_eq!(call.function_calls[0].args["a"], 1);
            }
            other => panic!("unexpected {:?}", other),
        }

        let cancel = decode_json(r#"{"toolCallCancellation":{"ids":["1","2"]}}"#).unwrap();
        assert_eq!(
            cancel,
            InboundMessage::ToolCallCancellation(ToolCallCancellation {
                ids: vec!["1".into(), "2".into()]
            })
        );
    }

    #[test]
    fn test_unknown_keys_are_ignored_next_to_known_ones() {
        let message =
            decode_json(r#"{"usageMetadata":{"totalTokenCount":3},"serverContent":{"turnComplete":true}}"#)
                .unwrap();
        assert!(matches!(message, InboundMessage::ServerContent(_)));
    }

    #[test]
    fn test_unrecognized_message_reports_keys() {
        match decode_json(r#"{"goAway":{"timeLeft":"1s"}}"#) {
            Err(DecodeError::Unrecognized(keys)) => assert_eq!(keys, "goAway"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_malformed_json_and_control_frames() {
        assert!(matches!(decode_json("not json"), Err(DecodeError::Json(_))));
        assert!(decode(&Message::Ping(Vec::new().into())).unwrap().is_none());
        assert!(matches!(
            decode(&Message::Binary(vec![0xff, 0xfe].into())),
            Err(DecodeError::InvalidUtf8)
        ));
    }
}
