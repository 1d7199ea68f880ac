//! `saveNote` / `getNotes`: a JSON file of notes the model can write to and read back.

use super::{ToolError, ToolHandler, ToolRegistry};
use crate::protocol::FunctionDeclaration;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Note {
    /// Milliseconds since the epoch at creation
    pub id: i64,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// Notes persisted as a JSON array. Reads and writes are serialized through one lock.
pub struct NoteStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl NoteStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn save(&self, content: &str) -> Result<Note, ToolError> {
        let _guard = self.lock.lock().await;
        let mut notes = self.read().await?;

        let timestamp = Utc::now();
        let note = Note {
            id: timestamp.timestamp_millis(),
            content: content.to_string(),
            timestamp,
        };
        notes.push(note.clone());

        let json = serde_json::to_vec_pretty(&notes)
            .map_err(|e| ToolError::ExecutionFailed(format!("Failed to encode notes: {}", e)))?;
        tokio::fs::write(&self.path, json).await.map_err(|e| {
            ToolError::ExecutionFailed(format!("Failed to write {}: {}", self.path.display(), e))
        })?;

        log::info!("Notes: saved note {} ({} total)", note.id, notes.len());
        Ok(note)
    }

    pub async fn list(&self) -> Result<Vec<Note>, ToolError> {
        let _guard = self.lock.lock().await;
        self.read().await
    }

    async fn read(&self) -> Result<Vec<Note>, ToolError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) if bytes.is_empty() => Ok(Vec::new()),
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                ToolError::ExecutionFailed(format!("Corrupt notes file {}: {}", self.path.display(), e))
            }),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(ToolError::ExecutionFailed(format!(
                "Failed to read {}: {}",
                self.path.display(),
                e
            ))),
        }
    }
}

pub struct SaveNote {
    store: Arc<NoteStore>,
}

#[async_trait]
impl ToolHandler for SaveNote {
    fn declaration(&self) -> FunctionDeclaration {
        FunctionDeclaration {
            name: "saveNote".to_string(),
            description: "Save a note for later".to_string(),
            parameters: Some(json!({
                "type": "object",
                "properties": {
                    "content": {
                        "type": "string",
                        "description": "The content of the note to save"
                    }
                },
                "required": ["content"]
            })),
        }
    }

    async fn execute(&self, args: Value) -> Result<Value, ToolError> {
        let content = args
            .get("content")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::InvalidParameters("'content' must be a string".to_string()))?;

        self.store.save(content).await?;
        Ok(json!({ "success": true, "message": "Note saved successfully" }))
    }
}

pub struct GetNotes {
    store: Arc<NoteStore>,
}

#[async_trait]
impl ToolHandler for GetNotes {
    fn declaration(&self) -> FunctionDeclaration {
        FunctionDeclaration {
            name: "getNotes".to_string(),
            description: "Retrieve all saved notes".to_string(),
            parameters: None,
        }
    }

    async fn execute(&self, _args: Value) -> Result<Value, ToolError> {
        let notes = self.store.list().await?;
        Ok(json!({ "notes": notes }))
    }
}

pub fn register_note_tools(registry: &mut ToolRegistry, store: Arc<NoteStore>) {
    registry.register(Arc::new(SaveNote {
        store: Arc::clone(&store),
    }));
    registry.register(Arc::new(GetNotes { store }));
}
