//! Engine configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default debounce window for update requests.
pub const DEFAULT_IDLE_WAIT: Duration = Duration::from_millis(500);

/// Default name of the runtime that exchanges values unpacked.
pub const DEFAULT_NATIVE_LANGUAGE: &str = "rust";

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Update requests within this window are coalesced into one pass.
    #[serde(rename = "idle_wait_ms", with = "millis")]
    pub idle_wait: Duration,
    /// Context name whose calls use the native (unpacked) value regime.
    pub native_language: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            idle_wait: DEFAULT_IDLE_WAIT,
            native_language: DEFAULT_NATIVE_LANGUAGE.to_string(),
        }
    }
}

impl EngineConfig {
    pub fn with_idle_wait(mut self, idle_wait: Duration) -> Self {
        self.idle_wait = idle_wait;
        self
    }

    pub fn with_native_language(mut self, language: impl Into<String>) -> Self {
        self.native_language = language.into();
        self
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
