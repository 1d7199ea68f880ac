pub mod codec;
pub mod messages;

pub use codec::{decode, decode_json, encode, DecodeError};
pub use messages::{
    Blob, ClientContent, CodeExecutionResult, Content, ExecutableCode, FunctionCall,
    FunctionDeclaration, FunctionResponse, GenerationConfig, InboundMessage, MediaChunk, Modality,
    OutboundMessage, Part, RealtimeInput, ServerContent, SessionConfig, Tool, ToolCall,
    ToolCallCancellation, ToolResponse,
};
