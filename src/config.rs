//! Configuration types for the turn engine.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration for a parley session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ParleyConfig {
    /// Recognition worker settings.
    pub recognition: RecognitionConfig,
    /// Turn queue settings.
    pub turn_queue: TurnQueueConfig,
    /// Turn processor settings (timeouts, retries, fallback).
    pub processor: ProcessorConfig,
    /// Hand-off resolution settings.
    pub handoff: HandoffConfig,
    /// Durable session snapshot settings.
    pub persistence: PersistenceConfig,
}

/// Recognition worker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecognitionConfig {
    /// Minimum interim transcript length (chars, trimmed) that counts as a
    /// partial signal.
    ///
    /// Shorter partials are treated as noise and never trigger barge-in.
    pub min_partial_chars: usize,
    /// Number of automatic engine re-initializations before the failure is
    /// reported as fatal.
    pub max_reinit_attempts: u32,
    /// Base delay between re-initialization attempts (doubles each attempt).
    pub reinit_backoff_ms: u64,
    /// Inbound audio chunks buffered ahead of the recognizer.
    ///
    /// When full, new chunks are dropped rather than blocking the caller.
    pub inbound_buffer: usize,
    /// Expected inbound sample rate in Hz. Chunks at other rates are rejected.
    pub sample_rate: u32,
}

impl Default for RecognitionConfig {
    fn default() -> Self {
        Self {
            min_partial_chars: 4,
            max_reinit_attempts: 3,
            reinit_backoff_ms: 200,
            inbound_buffer: 64,
            sample_rate: 16_000,
        }
    }
}

impl RecognitionConfig {
    /// Delay before re-initialization attempt `attempt` (1-based).
    pub fn reinit_delay(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(6);
        Duration::from_millis(self.reinit_backoff_ms.saturating_mul(factor))
    }
}

/// Turn queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TurnQueueConfig {
    /// Turns buffered beyond the one currently being processed.
    ///
    /// When full, the oldest unprocessed turn is dropped so the latest
    /// utterance wins.
    pub capacity: usize,
}

impl Default for TurnQueueConfig {
    fn default() -> Self {
        Self { capacity: 1 }
    }
}

/// Turn processor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorConfig {
    /// Grace period for a cancelled response to acknowledge before its
    /// resources are forcibly released.
    pub cancel_grace_ms: u64,
    /// Per-call timeout for generation, synthesis and tool calls.
    pub capability_timeout_ms: u64,
    /// Base backoff before retrying a transient capability failure.
    pub retry_backoff_ms: u64,
    /// Retries for a transient capability failure within one turn.
    pub max_transient_retries: u32,
    /// Maximum business-tool round trips within one response.
    pub max_tool_rounds: usize,
    /// Spoken when a turn fails irrecoverably.
    pub fallback_utterance: String,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            cancel_grace_ms: 300,
            capability_timeout_ms: 8_000,
            retry_backoff_ms: 150,
            max_transient_retries: 1,
            max_tool_rounds: 4,
            fallback_utterance: "Sorry, I had trouble with that. Could you say it again?"
                .to_owned(),
        }
    }
}

impl ProcessorConfig {
    /// Cancellation grace period.
    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }

    /// Per-call capability timeout.
    pub fn capability_timeout(&self) -> Duration {
        Duration::from_millis(self.capability_timeout_ms)
    }

    /// Backoff before retry `attempt` (1-based), with up to 10% jitter.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let base = self.retry_backoff_ms as f64 * 2f64.powi(attempt as i32 - 1);
        let jitter = base * (rand::random::<f64>() * 0.1);
        Duration::from_millis((base + jitter) as u64)
    }
}

/// Hand-off resolution configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HandoffConfig {
    /// Consecutive swaps between the same agent pair that count as a cycle.
    pub cycle_depth: usize,
    /// Window within which those swaps must fall.
    pub cycle_window_ms: u64,
    /// User-role prompt used to ask a target agent for its introduction when
    /// it has no `introduction` template.
    pub announcement_prompt: String,
}

impl Default for HandoffConfig {
    fn default() -> Self {
        Self {
            cycle_depth: 3,
            cycle_window_ms: 60_000,
            announcement_prompt:
                "You have just been handed this call. Briefly introduce yourself to the caller."
                    .to_owned(),
        }
    }
}

/// Durable snapshot configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Directory for filesystem session snapshots.
    pub root_dir: PathBuf,
    /// Whether the coordinator flushes a final snapshot when the session ends.
    pub flush_on_session_end: bool,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            root_dir: default_snapshot_dir(),
            flush_on_session_end: true,
        }
    }
}

fn default_snapshot_dir() -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join("parley").join("sessions"))
        .unwrap_or_else(|| PathBuf::from("/tmp/parley-sessions"))
}

impl ParleyConfig {
    /// Load configuration from a TOML file, falling back to defaults for missing fields.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> crate::error::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| crate::error::ParleyError::Configuration(e.to_string()))
    }

    /// Save configuration to a TOML file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or the config cannot be serialized.
    pub fn save_to_file(&self, path: &std::path::Path) -> crate::error::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::error::ParleyError::Serialization(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Returns the default config file path: `~/.config/parley/config.toml`.
    pub fn default_config_path() -> PathBuf {
        if let Some(config) = std::env::var_os("XDG_CONFIG_HOME") {
            PathBuf::from(config).join("parley").join("config.toml")
        } else if let Some(home) = std::env::var_os("HOME") {
            PathBuf::from(home)
                .join(".config")
                .join("parley")
                .join("config.toml")
        } else {
            PathBuf::from("/tmp/parley-config/config.toml")
        }
    }
}
