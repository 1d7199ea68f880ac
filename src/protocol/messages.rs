//! Wire types for the bidirectional generate-content session.
//!
//! Every message is a JSON object with exactly one top-level key naming its type. Outbound
//! messages serialize directly from [`OutboundMessage`]; inbound ones are decoded once by
//! [`super::codec`] into [`InboundMessage`].

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use strum::{Display, EnumString, IntoStaticStr};

/// Immutable configuration sent in the `setup` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation_config: Option<GenerationConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<Tool>,
}

impl SessionConfig {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            generation_config: None,
            system_instruction: None,
            tools: Vec::new(),
        }
    }

    pub fn with_modality(mut self, modality: Modality) -> Self {
        self.generation_config
            .get_or_insert_with(GenerationConfig::default)
            .response_modalities = vec![modality];
        self
    }

    pub fn with_voice(mut self, voice: impl Into<String>) -> Self {
        self.generation_config
            .get_or_insert_with(GenerationConfig::default)
            .speech_config = Some(SpeechConfig {
            voice_config: VoiceConfig {
                prebuilt_voice_config: PrebuiltVoiceConfig {
                    voice_name: voice.into(),
                },
            },
        });
        self
    }

    pub fn with_system_instruction(mut self, text: impl Into<String>) -> Self {
        self.system_instruction = Some(Content {
            role: None,
            parts: vec![Part::Text(text.into())],
        });
        self
    }

    pub fn with_tool(mut self, tool: Tool) -> Self {
        self.tools.push(tool);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub response_modalities: Vec<Modality>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speech_config: Option<SpeechConfig>,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, IntoStaticStr,
)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Modality {
    Text,
    Audio,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

/// Capability declared to the service at setup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Tool {
    FunctionDeclarations(Vec<FunctionDeclaration>),
    GoogleSearch {},
    CodeExecution {},
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDeclaration {
    pub name: String,
    pub description: String,
    /// JSON schema of the arguments object
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
}

/// One party's turn: an ordered list of parts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default)]
    pub parts: Vec<Part>,
}

impl Content {
    pub fn user(parts: Vec<Part>) -> Self {
        Self {
            role: Some("user".to_string()),
            parts,
        }
    }
}

/// One unit of a turn. Decoding picks the first known kind present and ignores extra fields on
/// it; a part of any other kind is kept verbatim as `Other`.
#[derive(Debug, Clone, PartialEq, Serialize, IntoStaticStr)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum Part {
    Text(String),
    InlineData(Blob),
    ExecutableCode(ExecutableCode),
    CodeExecutionResult(CodeExecutionResult),
    #[serde(untagged)]
    Other(Value),
}

impl<'de> Deserialize<'de> for Part {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        let Value::Object(fields) = &value else {
            return Ok(Part::Other(value));
        };

        let known = if let Some(text) = fields.get("text").and_then(Value::as_str) {
            Some(Part::Text(text.to_owned()))
        } else if let Some(blob) = field(fields, "inlineData") {
            Some(Part::InlineData(blob))
        } else if let Some(code) = field(fields, "executableCode") {
            Some(Part::ExecutableCode(code))
        } else {
            field(fields, "codeExecutionResult").map(Part::CodeExecutionResult)
        };
        Ok(known.unwrap_or(Part::Other(value)))
    }
}

fn field<T: DeserializeOwned>(fields: &Map<String, Value>, key: &str) -> Option<T> {
    let raw = fields.get(key)?;
    match T::deserialize(raw) {
        Ok(parsed) => Some(parsed),
        Err(e) => {
            log::debug!("Malformed '{}' part kept as-is: {}", key, e);
            None
        }
    }
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Part::Text(text.into())
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Part::Text(text) => Some(text),
            _ => None,
        }
    }

    /// Raw bytes of an inline audio part.
    pub fn audio_bytes(&self) -> Option<&[u8]> {
        match self {
            Part::InlineData(blob) if blob.mime_type.starts_with("audio/pcm") => Some(&blob.data),
            _ => None,
        }
    }
}

/// Inline binary payload, base64 on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    pub mime_type: String,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutableCode {
    #[serde(default)]
    pub language: String,
    pub code: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeExecutionResult {
    #[serde(default)]
    pub outcome: String,
    #[serde(default)]
    pub output: String,
}

/// A realtime media chunk whose payload is already transport-encoded (base64).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaChunk {
    pub mime_type: String,
    pub data: String,
}

impl MediaChunk {
    pub fn new(mime_type: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            mime_type: mime_type.into(),
            data: data.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub args: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionResponse {
    pub id: String,
    pub name: String,
    pub response: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    pub media_chunks: Vec<MediaChunk>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientContent {
    pub turns: Vec<Content>,
    pub turn_complete: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResponse {
    pub function_responses: Vec<FunctionResponse>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, IntoStaticStr)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum OutboundMessage {
    Setup(SessionConfig),
    RealtimeInput(RealtimeInput),
    ClientContent(ClientContent),
    ToolResponse(ToolResponse),
}

impl OutboundMessage {
    pub fn name(&self) -> &'static str {
        self.into()
    }

    /// One-line description for the session log.
    pub fn summary(&self) -> String {
        match self {
            OutboundMessage::Setup(config) => format!("model {}", config.model),
            OutboundMessage::RealtimeInput(input) => {
                let mimes: Vec<&str> = input
                    .media_chunks
                    .iter()
                    .map(|chunk| chunk.mime_type.as_str())
                    .collect();
                mimes.join(", ")
            }
            OutboundMessage::ClientContent(content) => {
                let text: Vec<&str> = content
                    .turns
                    .iter()
                    .flat_map(|turn| turn.parts.iter().filter_map(Part::as_text))
                    .collect();
                format!("{} (turnComplete: {})", text.join(" "), content.turn_complete)
            }
            OutboundMessage::ToolResponse(response) => {
                let ids: Vec<&str> = response
                    .function_responses
                    .iter()
                    .map(|r| r.id.as_str())
                    .collect();
                format!("ids [{}]", ids.join(", "))
            }
        }
    }
}

/// Model output inside a `serverContent` message.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    #[serde(default)]
    pub model_turn: Option<Content>,
    #[serde(default)]
    pub turn_complete: bool,
    #[serde(default)]
    pub interrupted: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCall {
    #[serde(default)]
    pub function_calls: Vec<FunctionCall>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ToolCallCancellation {
    #[serde(default)]
    pub ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, IntoStaticStr)]
#[strum(serialize_all = "camelCase")]
pub enum InboundMessage {
    SetupComplete,
    ServerContent(ServerContent),
    ToolCall(ToolCall),
    ToolCallCancellation(ToolCallCancellation),
}

impl InboundMessage {
    pub fn name(&self) -> &'static str {
        self.into()
    }

    pub fn summary(&self) -> String {
        match self {
            InboundMessage::SetupComplete => String::new(),
            InboundMessage::ServerContent(content) => {
                let parts: Vec<&'static str> = content
                    .model_turn
                    .iter()
                    .flat_map(|turn| turn.parts.iter().map(|part| part.into()))
                    .collect();
                let mut summary = format!("parts [{}]", parts.join(", "));
                if content.interrupted {
                    summary.push_str(" interrupted");
                }
                if content.turn_complete {
                    summary.push_str(" turnComplete");
                }
                summary
            }
            InboundMessage::ToolCall(call) => {
                let names: Vec<String> = call
                    .function_calls
                    .iter()
                    .map(|c| format!("{}#{}", c.name, c.id))
                    .collect();
                names.join(", ")
            }
            InboundMessage::ToolCallCancellation(cancel) => {
                format!("ids [{}]", cancel.ids.join(", "))
            }
        }
    }
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
