//! Session state shared by the turn and hand-off logic.

use crate::agents::HandoffVisibility;
use crate::capabilities::ChatMessage;
use crate::handoff::HandoffRequest;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Current snapshot schema version.
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

/// Latency samples kept per session.
pub const MAX_LATENCY_SAMPLES: usize = 64;

/// One completed hand-off, kept for audit and cycle detection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandoffRecord {
    pub from: String,
    pub to: String,
    pub reason: String,
    pub visibility: HandoffVisibility,
    pub at: DateTime<Utc>,
}

/// Annotation left when two agents keep handing the call back and forth.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleWarning {
    pub agents: (String, String),
    pub swaps: usize,
    pub detected_at: DateTime<Utc>,
}

/// Lifetime state of one conversation.
///
/// Written only by the turn processor and hand-off resolver; mirrored to the
/// durable store asynchronously.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    pub session_id: String,
    pub active_agent: String,
    pub visited_agents: BTreeSet<String>,
    #[serde(default)]
    pub slot_values: BTreeMap<String, String>,
    #[serde(default)]
    pub pending_handoff: Option<HandoffRequest>,
    /// Set when the last response was cut off by barge-in; cleared by the
    /// next final utterance.
    #[serde(default)]
    pub interruption_flag: bool,
    /// Utterance-to-first-audio latencies in milliseconds, oldest first.
    #[serde(default)]
    pub latency_samples: Vec<u64>,
    /// Per-agent conversation history.
    #[serde(default)]
    pub histories: BTreeMap<String, Vec<ChatMessage>>,
    #[serde(default)]
    pub handoff_log: Vec<HandoffRecord>,
    #[serde(default)]
    pub cycle_warning: Option<CycleWarning>,
    #[serde(default)]
    pub turns_completed: u64,
    pub updated_at: DateTime<Utc>,
}

fn default_schema_version() -> u32 {
    CURRENT_SCHEMA_VERSION
}

impl SessionState {
    /// Fresh state starting on `entry_agent`.
    pub fn new(session_id: impl Into<String>, entry_agent: impl Into<String>) -> Self {
        let entry_agent = entry_agent.into();
        let mut visited_agents = BTreeSet::new();
        visited_agents.insert(entry_agent.clone());
        Self {
            schema_version: CURRENT_SCHEMA_VERSION,
            session_id: session_id.into(),
            active_agent: entry_agent,
            visited_agents,
            slot_values: BTreeMap::new(),
            pending_handoff: None,
            interruption_flag: false,
            latency_samples: Vec::new(),
            histories: BTreeMap::new(),
            handoff_log: Vec::new(),
            cycle_warning: None,
            turns_completed: 0,
            updated_at: Utc::now(),
        }
    }

    /// History of `agent` (empty if it has not spoken yet).
    pub fn history(&self, agent: &str) -> &[ChatMessage] {
        self.histories.get(agent).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Mutable history of `agent`, created on first use.
    pub fn history_mut(&mut self, agent: &str) -> &mut Vec<ChatMessage> {
        self.histories.entry(agent.to_owned()).or_default()
    }

    /// Caller-visible transcript of `agent` (user and assistant text only).
    pub fn visible_history(&self, agent: &str) -> Vec<ChatMessage> {
        self.history(agent)
            .iter()
            .filter(|m| m.is_visible())
            .cloned()
            .collect()
    }

    /// Append a latency sample, keeping the most recent ones.
    pub fn record_latency(&mut self, millis: u64) {
        self.latency_samples.push(millis);
        if self.latency_samples.len() > MAX_LATENCY_SAMPLES {
            let excess = self.latency_samples.len() - MAX_LATENCY_SAMPLES;
            self.latency_samples.drain(..excess);
        }
    }

    /// The agent that held the call before the current one, if any.
    pub fn previous_agent(&self) -> Option<&str> {
        self.handoff_log.last().map(|r| r.from.as_str())
    }

    /// Variables available to instruction templates.
    pub fn template_vars(&self) -> HashMap<String, String> {
        let mut vars: HashMap<String, String> = self
            .slot_values
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        vars.insert("agent".into(), self.active_agent.clone());
        vars.insert("session_id".into(), self.session_id.clone());
        vars.insert(
            "visited_agents".into(),
            self.visited_agents
                .iter()
                .cloned()
                .collect::<Vec<_>>()
                .join(", "),
        );
        if let Some(last) = self.handoff_log.last() {
            vars.insert("previous_agent".into(), last.from.clone());
            vars.insert("handoff_reason".into(), last.reason.clone());
        }
        vars
    }

    /// Stamp the modification time.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
