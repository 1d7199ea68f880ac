//! Local capabilities the service may invoke through `toolCall` messages.

use crate::protocol::{FunctionCall, FunctionDeclaration, FunctionResponse, Tool};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub mod notes;

pub use notes::{register_note_tools, Note, NoteStore};

#[derive(Error, Debug)]
pub enum ToolError {
    #[error("Tool not found: {0}")]
    NotFound(String),
    #[error("Tool execution failed: {0}")]
    ExecutionFailed(String),
    #[error("Invalid tool parameters: {0}")]
    InvalidParameters(String),
    #[error("Tool execution was cancelled")]
    Cancelled,
}

#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// Declaration advertised in the `setup` message.
    fn declaration(&self) -> FunctionDeclaration;

    async fn execute(&self, args: Value) -> Result<Value, ToolError>;
}

#[derive(Default, Clone)]
pub struct ToolRegistry {
    handlers: Vec<Arc<dyn ToolHandler>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. A later registration with the same name replaces the earlier one.
    pub fn register(&mut self, handler: Arc<dyn ToolHandler>) {
        let name = handler.declaration().name;
        self.handlers.retain(|h| h.declaration().name != name);
        log::debug!("Tools: registered '{}'", name);
        self.handlers.push(handler);
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn find_tool(&self, name: &str) -> Option<&Arc<dyn ToolHandler>> {
        self.handlers.iter().find(|h| h.declaration().name == name)
    }

    pub fn declarations(&self) -> Vec<FunctionDeclaration> {
        self.handlers.iter().map(|h| h.declaration()).collect()
    }

    /// The `functionDeclarations` entry for the session setup, if any tools are registered.
    pub fn as_tool(&self) -> Option<Tool> {
        (!self.is_empty()).then(|| Tool::FunctionDeclarations(self.declarations()))
    }

    /// Execute a single call. Returns `Cancelled` as soon as `cancel_token` fires.
    pub async fn execute_tool(
        &self,
        call: &FunctionCall,
        cancel_token: CancellationToken,
    ) -> Result<FunctionResponse, ToolError> {
        if cancel_token.is_cancelled() {
            return Err(ToolError::Cancelled);
        }

        let handler = self
            .find_tool(&call.name)
            .ok_or_else(|| ToolError::NotFound(format!("Tool '{}' not found", call.name)))?;

        let response = tokio::select! {
            result = handler.execute(call.args.clone()) => result?,
            _ = cancel_token.cancelled() => return Err(ToolError::Cancelled),
        };

        Ok(FunctionResponse {
            id: call.id.clone(),
            name: call.name.clone(),
            response,
        })
    }
}
