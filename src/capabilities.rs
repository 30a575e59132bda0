//! Narrow interfaces to the external recognition, synthesis, generation and
//! business-tool providers.
//!
//! The engine never talks to a concrete provider; sessions are handed trait
//! objects implementing these interfaces.

use crate::agents::{ModelConfig, VoiceConfig};
use crate::error::Result;
use crate::pipeline::messages::{AudioChunk, SpeechEvent};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// The role of a message in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// One entry of an agent's conversation history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    /// Set on assistant messages that requested a tool.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call: Option<ToolInvocation>,
    /// Set on tool-result messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    fn text(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_call: None,
            tool_call_id: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::text(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::text(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::text(Role::Assistant, content)
    }

    /// Assistant message that requested `call`.
    pub fn assistant_tool_call(call: ToolInvocation) -> Self {
        Self {
            role: Role::Assistant,
            content: String::new(),
            tool_call: Some(call),
            tool_call_id: None,
        }
    }

    /// Result of the tool call `call_id`.
    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_call: None,
            tool_call_id: Some(call_id.into()),
        }
    }

    /// Whether this message is part of the caller-visible transcript.
    pub fn is_visible(&self) -> bool {
        matches!(self.role, Role::User | Role::Assistant) && !self.content.trim().is_empty()
    }
}

/// A structured tool-invocation request from the generator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub call_id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
}

/// Function schema advertised to the generator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Input to one generation call.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    /// Rendered agent instructions.
    pub instructions: String,
    /// Ordered history, ending with the new user message.
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolSchema>,
    pub model: ModelConfig,
}

/// Streamed generation output.
#[derive(Debug, Clone, PartialEq)]
pub enum GenerationEvent {
    TextDelta(String),
    ToolCall(ToolInvocation),
    Done,
}

pub type GenerationStream = BoxStream<'static, Result<GenerationEvent>>;
pub type AudioStream = BoxStream<'static, Result<Bytes>>;

/// Speech recognition engine, driven by the recognition worker.
#[async_trait]
pub trait SpeechRecognizer: Send {
    /// Feed one audio chunk and collect any resulting events.
    async fn accept(&mut self, chunk: &AudioChunk) -> Result<Vec<SpeechEvent>>;

    /// Re-initialize after an engine failure.
    async fn reset(&mut self) -> Result<()>;
}

/// Speech synthesis engine. Dropping the returned stream aborts synthesis.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    async fn synthesize(&self, text: &str, voice: &VoiceConfig) -> Result<AudioStream>;
}

/// Text generation backend.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, request: GenerationRequest) -> Result<GenerationStream>;
}

/// Business-logic tools (account lookups and the like).
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    /// Schema for `name`, or `None` if this invoker does not provide it.
    fn schema(&self, name: &str) -> Option<ToolSchema>;

    /// Execute a tool call and return its structured result.
    async fn invoke(&self, call: &ToolInvocation) -> Result<serde_json::Value>;
}

/// The provider set a session runs against.
#[derive(Clone)]
pub struct Capabilities {
    pub generator: Arc<dyn TextGenerator>,
    pub synthesizer: Arc<dyn SpeechSynthesizer>,
    pub tools: Option<Arc<dyn ToolInvoker>>,
}

impl Capabilities {
    pub fn new(generator: Arc<dyn TextGenerator>, synthesizer: Arc<dyn SpeechSynthesizer>) -> Self {
        Self {
            generator,
            synthesizer,
            tools: None,
        }
    }

    /// Attach a business-tool invoker.
    pub fn with_tools(mut self, tools: Arc<dyn ToolInvoker>) -> Self {
        self.tools = Some(tools);
        self
    }
}

impl std::fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Capabilities")
            .field("tools", &self.tools.is_some())
            .finish_non_exhaustive()
    }
}
