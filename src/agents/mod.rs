//! Agent descriptors and the read-only agent registry.
//!
//! The registry is loaded and validated once at startup, wrapped in an `Arc`
//! and shared by every session. Sessions never mutate it.

pub mod template;

use crate::capabilities::ToolSchema;
use crate::error::{ParleyError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Voice profile handed to the synthesizer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceConfig {
    /// Provider voice name.
    pub voice: String,
    /// Speech speed multiplier.
    pub speed: f32,
    pub language: String,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            voice: "default".to_owned(),
            speed: 1.0,
            language: "en".to_owned(),
        }
    }
}

/// Generation parameters for one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub model: String,
    pub temperature: f64,
    pub max_tokens: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model: "default".to_owned(),
            temperature: 0.7,
            max_tokens: 512,
        }
    }
}

/// How a hand-off is presented to the caller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandoffVisibility {
    /// The target introduces itself before anything else; barge-in is
    /// suppressed while it does.
    #[default]
    Announced,
    /// No introduction.
    #[serde(alias = "silent")]
    Discrete,
}

/// A tool whose invocation transfers the call to another agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandoffTrigger {
    pub tool_name: String,
    pub target: String,
    #[serde(default)]
    pub visibility: HandoffVisibility,
    /// Carry the full visible history to the target.
    #[serde(default = "default_true")]
    pub share_context: bool,
    /// Whether the target answers the triggering utterance right away
    /// (after its introduction, if announced) or waits for the next turn.
    #[serde(default = "default_true")]
    pub immediate: bool,
    #[serde(default)]
    pub description: Option<String>,
}

fn default_true() -> bool {
    true
}

impl HandoffTrigger {
    /// Function schema advertised to the generator for this trigger.
    pub fn schema(&self) -> ToolSchema {
        let description = self
            .description
            .clone()
            .unwrap_or_else(|| format!("Transfer the caller to {}.", self.target));
        ToolSchema {
            name: self.tool_name.clone(),
            description,
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "reason": {
                        "type": "string",
                        "description": "Why the caller is being transferred."
                    }
                },
                "required": ["reason"]
            }),
        }
    }
}

/// Immutable configuration of one conversational agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentDescriptor {
    pub name: String,
    /// Instruction template rendered with session context each turn.
    pub prompt_template: String,
    #[serde(default)]
    pub voice_config: VoiceConfig,
    #[serde(default)]
    pub model_config: ModelConfig,
    #[serde(default)]
    pub tool_names: Vec<String>,
    #[serde(default)]
    pub handoff_triggers: Vec<HandoffTrigger>,
    #[serde(default)]
    pub is_entry_point: bool,
    /// Spoken (after rendering) when this agent is announced. When absent the
    /// generator is asked to introduce the agent.
    #[serde(default)]
    pub introduction: Option<String>,
}

impl AgentDescriptor {
    /// Minimal descriptor, mainly for tests and programmatic registries.
    pub fn new(name: impl Into<String>, prompt_template: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            prompt_template: prompt_template.into(),
            voice_config: VoiceConfig::default(),
            model_config: ModelConfig::default(),
            tool_names: Vec::new(),
            handoff_triggers: Vec::new(),
            is_entry_point: false,
            introduction: None,
        }
    }

    /// Mark as the session entry point.
    pub fn entry_point(mut self) -> Self {
        self.is_entry_point = true;
        self
    }

    /// Add a hand-off trigger and list its tool.
    pub fn with_trigger(mut self, trigger: HandoffTrigger) -> Self {
        if !self.tool_names.contains(&trigger.tool_name) {
            self.tool_names.push(trigger.tool_name.clone());
        }
        self.handoff_triggers.push(trigger);
        self
    }

    /// Add a business tool.
    pub fn with_tool(mut self, name: impl Into<String>) -> Self {
        self.tool_names.push(name.into());
        self
    }

    /// Set the introduction template.
    pub fn with_introduction(mut self, text: impl Into<String>) -> Self {
        self.introduction = Some(text.into());
        self
    }

    /// The hand-off trigger bound to `tool_name`, if any.
    pub fn trigger_for(&self, tool_name: &str) -> Option<&HandoffTrigger> {
        self.handoff_triggers
            .iter()
            .find(|t| t.tool_name == tool_name)
    }
}

#[derive(Debug, Deserialize)]
struct RegistryFile {
    #[serde(default, rename = "agent")]
    agents: Vec<AgentDescriptor>,
}

/// Read-only name → descriptor table.
#[derive(Debug, Clone)]
pub struct AgentRegistry {
    agents: HashMap<String, Arc<AgentDescriptor>>,
    entry_point: String,
}

impl AgentRegistry {
    /// Build and validate a registry.
    ///
    /// # Errors
    ///
    /// Returns [`ParleyError::Configuration`] if there are no agents, a name
    /// is duplicated, there is not exactly one entry point, a trigger targets
    /// an unknown agent, or a trigger's tool is not listed in `tool_names`.
    pub fn from_descriptors(descriptors: Vec<AgentDescriptor>) -> Result<Self> {
        if descriptors.is_empty() {
            return Err(ParleyError::Configuration("agent registry is empty".into()));
        }

        let mut agents = HashMap::with_capacity(descriptors.len());
        for descriptor in descriptors {
            if descriptor.name.trim().is_empty() {
                return Err(ParleyError::Configuration("agent with empty name".into()));
            }
            let name = descriptor.name.clone();
            if agents.insert(name.clone(), Arc::new(descriptor)).is_some() {
                return Err(ParleyError::Configuration(format!(
                    "duplicate agent name '{name}'"
                )));
            }
        }

        let mut entry_points: Vec<&str> = agents
            .values()
            .filter(|a| a.is_entry_point)
            .map(|a| a.name.as_str())
            .collect();
        entry_points.sort_unstable();
        let entry_point = match entry_points.as_slice() {
            [one] => (*one).to_owned(),
            [] => {
                return Err(ParleyError::Configuration(
                    "no agent is marked as entry point".into(),
                ));
            }
            many => {
                return Err(ParleyError::Configuration(format!(
                    "multiple entry points: {}",
                    many.join(", ")
                )));
            }
        };

        for agent in agents.values() {
            let mut seen_tools = HashSet::new();
            for trigger in &agent.handoff_triggers {
                if !agents.contains_key(&trigger.target) {
                    return Err(ParleyError::Configuration(format!(
                        "agent '{}' hands off to unknown agent '{}' via '{}'",
                        agent.name, trigger.target, trigger.tool_name
                    )));
                }
                if !agent.tool_names.contains(&trigger.tool_name) {
                    return Err(ParleyError::Configuration(format!(
                        "agent '{}' trigger tool '{}' is not in its tool list",
                        agent.name, trigger.tool_name
                    )));
                }
                if !seen_tools.insert(trigger.tool_name.as_str()) {
                    return Err(ParleyError::Configuration(format!(
                        "agent '{}' binds tool '{}' to more than one hand-off",
                        agent.name, trigger.tool_name
                    )));
                }
            }
        }

        info!(agents = agents.len(), entry_point = %entry_point, "agent registry loaded");
        Ok(Self {
            agents,
            entry_point,
        })
    }

    /// Parse `[[agent]]` tables from TOML and validate.
    ///
    /// # Errors
    ///
    /// Returns [`ParleyError::Configuration`] on parse or validation failure.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let file: RegistryFile =
            toml::from_str(content).map_err(|e| ParleyError::Configuration(e.to_string()))?;
        Self::from_descriptors(file.agents)
    }

    /// Load and validate a TOML registry file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn get(&self, name: &str) -> Option<&Arc<AgentDescriptor>> {
        self.agents.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.agents.contains_key(name)
    }

    /// Name of the agent every new session starts with.
    pub fn entry_point(&self) -> &str {
        &self.entry_point
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// Hand-off edges grouped by source agent, sorted for stable output.
    pub fn handoff_graph(&self) -> BTreeMap<String, Vec<(String, String)>> {
        let mut graph = BTreeMap::new();
        for agent in self.agents.values() {
            let mut edges: Vec<(String, String)> = agent
                .handoff_triggers
                .iter()
                .map(|t| (t.tool_name.clone(), t.target.clone()))
                .collect();
            edges.sort();
            graph.insert(agent.name.clone(), edges);
        }
        graph
    }
}
