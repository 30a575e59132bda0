//! Agent-to-agent hand-off resolution.
//!
//! The resolver validates the target, builds the context the target starts
//! with, and moves the session to the target in a single state mutation.
//! Failures never end the session: the caller stays with the current agent.

use crate::agents::{AgentRegistry, HandoffTrigger, HandoffVisibility};
use crate::capabilities::{ChatMessage, ToolInvocation};
use crate::config::HandoffConfig;
use crate::error::{ParleyError, Result, error_codes};
use crate::runtime::{RuntimeEvent, emit};
use crate::session::types::{CycleWarning, HandoffRecord, SessionState};
use crate::session::SessionStateStore;
use chrono::{Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// A request to transfer the call, created by the turn processor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandoffRequest {
    pub trigger_tool: String,
    pub target_agent: String,
    pub reason: String,
    /// Structured result of the triggering tool call.
    pub carried_context: serde_json::Value,
    pub visibility: HandoffVisibility,
    pub share_context: bool,
    pub immediate: bool,
}

impl HandoffRequest {
    /// Build a request from the trigger bound to `call`.
    pub fn from_trigger(trigger: &HandoffTrigger, call: &ToolInvocation) -> Self {
        let reason = call
            .arguments
            .get("reason")
            .and_then(|r| r.as_str())
            .unwrap_or("")
            .to_owned();
        Self {
            trigger_tool: trigger.tool_name.clone(),
            target_agent: trigger.target.clone(),
            reason,
            carried_context: call.arguments.clone(),
            visibility: trigger.visibility,
            share_context: trigger.share_context,
            immediate: trigger.immediate,
        }
    }
}

/// Result of a successful hand-off.
#[derive(Debug, Clone, PartialEq)]
pub struct HandoffOutcome {
    pub from: String,
    pub to: String,
    pub visibility: HandoffVisibility,
    pub immediate: bool,
    pub share_context: bool,
    /// Set when this hand-off completed an A↔B cycle.
    pub cycle: Option<CycleWarning>,
}

/// Resolves hand-off requests against the shared registry.
pub struct HandoffResolver {
    registry: Arc<AgentRegistry>,
    config: HandoffConfig,
    runtime_tx: Option<broadcast::Sender<RuntimeEvent>>,
}

impl HandoffResolver {
    pub fn new(
        registry: Arc<AgentRegistry>,
        config: HandoffConfig,
        runtime_tx: Option<broadcast::Sender<RuntimeEvent>>,
    ) -> Self {
        Self {
            registry,
            config,
            runtime_tx,
        }
    }

    /// Consume the session's pending hand-off.
    ///
    /// # Errors
    ///
    /// Returns [`ParleyError::Configuration`] when there is no pending
    /// request, the target is unknown, or the target is already active. The
    /// pending request is cleared and `active_agent` is left unchanged.
    pub fn resolve(&self, session: &mut SessionStateStore) -> Result<HandoffOutcome> {
        let Some(request) = session.read().pending_handoff.clone() else {
            return Err(ParleyError::Configuration("no pending hand-off".into()));
        };
        let from = session.read().active_agent.clone();

        if let Err(e) = self.validate(&from, &request) {
            session.mutate(|s| s.pending_handoff = None);
            warn!(
                code = error_codes::CONFIGURATION,
                from = %from,
                target = %request.target_agent,
                "hand-off rejected, staying on current agent: {e}"
            );
            emit(
                self.runtime_tx.as_ref(),
                RuntimeEvent::HandoffRejected {
                    target: request.target_agent.clone(),
                    message: e.to_string(),
                },
            );
            return Err(e);
        }

        let depth = self.config.cycle_depth;
        let window = ChronoDuration::milliseconds(self.config.cycle_window_ms as i64);
        let (first_visit, cycle) = session.mutate(|s| {
            let seed = carried_messages(s, &from, &request);
            *s.history_mut(&request.target_agent) = seed;
            s.slot_values.extend(carried_slots(&request.carried_context));

            s.visited_agents.insert(from.clone());
            let first_visit = s.visited_agents.insert(request.target_agent.clone());
            s.active_agent = request.target_agent.clone();
            s.pending_handoff = None;
            s.handoff_log.push(HandoffRecord {
                from: from.clone(),
                to: request.target_agent.clone(),
                reason: request.reason.clone(),
                visibility: request.visibility,
                at: Utc::now(),
            });

            let cycle = detect_cycle(&s.handoff_log, depth, window);
            if cycle.is_some() {
                s.cycle_warning = cycle.clone();
            }
            (first_visit, cycle)
        });

        info!(
            from = %from,
            to = %request.target_agent,
            visibility = ?request.visibility,
            reason = %request.reason,
            "hand-off completed"
        );
        if first_visit {
            emit(
                self.runtime_tx.as_ref(),
                RuntimeEvent::AgentVisited {
                    agent: request.target_agent.clone(),
                },
            );
        }
        emit(
            self.runtime_tx.as_ref(),
            RuntimeEvent::HandoffCompleted {
                from: from.clone(),
                to: request.target_agent.clone(),
                visibility: request.visibility,
                reason: request.reason.clone(),
            },
        );
        if let Some(c) = &cycle {
            warn!(
                a = %c.agents.0,
                b = %c.agents.1,
                swaps = c.swaps,
                "hand-off cycle detected"
            );
            emit(
                self.runtime_tx.as_ref(),
                RuntimeEvent::CycleDetected {
                    agents: c.agents.clone(),
                    swaps: c.swaps,
                },
            );
        }

        Ok(HandoffOutcome {
            from,
            to: request.target_agent,
            visibility: request.visibility,
            immediate: request.immediate,
            share_context: request.share_context,
            cycle,
        })
    }

    fn validate(&self, from: &str, request: &HandoffRequest) -> Result<()> {
        if !self.registry.contains(&request.target_agent) {
            return Err(ParleyError::Configuration(format!(
                "hand-off target '{}' is not a registered agent",
                request.target_agent
            )));
        }
        if request.target_agent == from {
            return Err(ParleyError::Configuration(format!(
                "hand-off target '{}' is already the active agent",
                request.target_agent
            )));
        }
        Ok(())
    }
}

/// History the target starts with: a transfer note, preceded by the
/// caller-visible conversation when context is shared.
fn carried_messages(state: &SessionState, from: &str, request: &HandoffRequest) -> Vec<ChatMessage> {
    let mut messages = if request.share_context {
        state.visible_history(from)
    } else {
        Vec::new()
    };
    let mut note = format!("The call was transferred to you from {from}.");
    if !request.reason.is_empty() {
        note.push_str(&format!(" Reason: {}.", request.reason));
    }
    if !request.carried_context.is_null() {
        note.push_str(&format!(" Transfer details: {}", request.carried_context));
    }
    messages.push(ChatMessage::system(note));
    messages
}

/// Scalar fields of the trigger's arguments, kept as slots for later
/// templates. `reason` is already exposed as `handoff_reason`.
fn carried_slots(context: &serde_json::Value) -> Vec<(String, String)> {
    let Some(fields) = context.as_object() else {
        return Vec::new();
    };
    fields
        .iter()
        .filter(|(key, _)| key.as_str() != "reason")
        .filter_map(|(key, value)| {
            let value = match value {
                serde_json::Value::String(s) => s.clone(),
                serde_json::Value::Number(n) => n.to_string(),
                serde_json::Value::Bool(b) => b.to_string(),
                _ => return None,
            };
            Some((key.clone(), value))
        })
        .collect()
}

/// Whether the last `depth` hand-offs alternate between the same two agents
/// within `window`.
fn detect_cycle(
    log: &[HandoffRecord],
    depth: usize,
    window: ChronoDuration,
) -> Option<CycleWarning> {
    if depth < 2 || log.len() < depth {
        return None;
    }
    let recent = &log[log.len() - depth..];
    let first = &recent[0];
    let newest = recent.last()?;
    if newest.at - first.at > window {
        return None;
    }
    let pair = |r: &HandoffRecord| {
        if r.from <= r.to {
            (r.from.clone(), r.to.clone())
        } else {
            (r.to.clone(), r.from.clone())
        }
    };
    let expected = pair(first);
    let alternating = recent.windows(2).all(|w| w[0].to == w[1].from);
    if alternating && recent.iter().all(|r| pair(r) == expected) {
        Some(CycleWarning {
            agents: expected,
            swaps: depth,
            detected_at: Utc::now(),
        })
    } else {
        None
    }
}
