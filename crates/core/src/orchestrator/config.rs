use std::time::Duration;

use serde::{Deserialize, Serialize};

/// The model used when none is configured.
pub const DEFAULT_MODEL: &str = "anthropic/claude-3.5-sonnet";

/// Configuration of the conversation loop.
///
/// Every field has a default, so a partial configuration deserializes
/// fine. Durations are given in seconds.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Model identifier sent with every request.
    pub model: String,
    /// Deadline of one model call, retries included.
    #[serde(with = "secs")]
    pub model_timeout: Duration,
    /// Deadline of one tool invocation.
    #[serde(with = "secs")]
    pub tool_timeout: Duration,
    /// Maximum number of model calls for one user message.
    pub max_iterations: usize,
    /// If set, the model only sees this many of the latest turns.
    pub max_history_turns: Option<usize>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_owned(),
            model_timeout: Duration::from_secs(60),
            tool_timeout: Duration::from_secs(30),
            max_iterations: 8,
            max_history_turns: None,
        }
    }
}

mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        duration: &Duration,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_partial_config() {
        let config: AgentConfig = serde_json::from_value(json!({
            "model_timeout": 5,
            "max_history_turns": 40
        }))
        .unwrap();
        assert_eq!(
            config,
            AgentConfig {
                model_timeout: Duration::from_secs(5),
                max_history_turns: Some(40),
                ..Default::default()
            }
        );
        assert_eq!(
            serde_json::to_value(&config).unwrap()["tool_timeout"],
            json!(30)
        );
    }
}
