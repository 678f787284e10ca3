//! Voice assistant configuration.
//!
//! Precedence: env `MERRYCAM_CONFIG` path > `config/voice.toml` > defaults,
//! with `MERRYCAM__*` environment variables layered on top.

use crate::capture::CaptureConfig;
use crate::channel::{Connector, RelayConnector};
use crate::error::{VoiceError, VoiceResult};
use crate::live::{LiveConnector, DEFAULT_LIVE_ENDPOINT};
use crate::playback::PlaybackConfig;
use crate::protocol::SessionSetup;
use crate::scheduler::LagPolicy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_LIVE_MODEL: &str = "gemini-2.5-flash-native-audio-preview-09-2025";
pub const DEFAULT_VOICE: &str = "Kore";
pub const DEFAULT_RELAY_ADDR: &str = "127.0.0.1:8765";

/// Environment variables consulted for the key when the config has none.
const API_KEY_VARS: [&str; 2] = ["GEMINI_API_KEY", "API_KEY"];

/// How the session reaches the live model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    /// WebSocket to the hosted service.
    #[default]
    Direct,
    /// JSON lines to a local relay.
    Relay,
}

/// A credential that never shows up in logs or serialized config.
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct ApiKey(String);

impl ApiKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ApiKey(<redacted>)")
    }
}

/// Persona the assistant speaks with.
pub const ELF_PERSONA: &str = "You are a cheerful, magical Christmas Elf assistant for a photo studio. \
You help users decide what kind of photo setting they want (e.g. snowy, cozy fireplace, fancy party). \
Keep your responses short, fun, and very festive. Suggest creative ideas for Christmas photos.";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoiceConfig {
    /// Live model identity sent in the setup message.
    pub model: String,
    /// Prebuilt voice the model answers with.
    pub voice_name: String,
    pub system_instruction: String,
    pub transport: Transport,
    /// WebSocket endpoint for [`Transport::Direct`].
    pub live_endpoint: String,
    /// Falls back to `GEMINI_API_KEY`, then `API_KEY`.
    #[serde(default, skip_serializing)]
    pub api_key: Option<ApiKey>,
    /// host:port of the live-protocol relay.
    pub relay_addr: String,
    pub capture_sample_rate: u32,
    pub playback_sample_rate: u32,
    /// Samples per outbound frame.
    pub frame_size: usize,
    /// Outbound frames that may wait for the channel before new ones are dropped.
    pub outbound_queue: usize,
    /// Furthest the playback schedule may run ahead of the device; 0 = unbounded.
    pub max_lead_ms: u64,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_LIVE_MODEL.to_string(),
            voice_name: DEFAULT_VOICE.to_string(),
            system_instruction: ELF_PERSONA.to_string(),
            transport: Transport::Direct,
            live_endpoint: DEFAULT_LIVE_ENDPOINT.to_string(),
            api_key: None,
            relay_addr: DEFAULT_RELAY_ADDR.to_string(),
            capture_sample_rate: 16000,
            playback_sample_rate: 24000,
            frame_size: 4096,
            outbound_queue: 64,
            max_lead_ms: 0,
        }
    }
}

impl VoiceConfig {
    /// Load from file and environment.
    pub fn load() -> VoiceResult<Self> {
        let path = std::env::var("MERRYCAM_CONFIG").unwrap_or_else(|_| "config/voice".to_string());
        Self::load_from(Path::new(&path))
    }

    /// Load using `path` as the optional config file (extension may be omitted).
    pub fn load_from(path: &Path) -> VoiceResult<Self> {
        let defaults = Self::default();
        let builder = config::Config::builder()
            .set_default("model", defaults.model)?
            .set_default("voice_name", defaults.voice_name)?
            .set_default("system_instruction", defaults.system_instruction)?
            .set_default("transport", "direct")?
            .set_default("live_endpoint", defaults.live_endpoint)?
            .set_default("relay_addr", defaults.relay_addr)?
            .set_default("capture_sample_rate", defaults.capture_sample_rate as i64)?
            .set_default("playback_sample_rate", defaults.playback_sample_rate as i64)?
            .set_default("frame_size", defaults.frame_size as i64)?
            .set_default("outbound_queue", defaults.outbound_queue as i64)?
            .set_default("max_lead_ms", defaults.max_lead_ms as i64)?
            .add_source(config::File::from(path).required(false))
            .add_source(config::Environment::with_prefix("MERRYCAM").separator("__"));

        let mut loaded: Self = builder.build()?.try_deserialize()?;
        if loaded.api_key.is_none() {
            loaded.api_key = key_from(|name| std::env::var(name).ok());
        }
        loaded.validate()?;
        Ok(loaded)
    }

    pub fn validate(&self) -> VoiceResult<()> {
        if self.capture_sample_rate == 0 || self.playback_sample_rate == 0 {
            return Err(VoiceError::Config("sample rates must be non-zero".to_string()));
        }
        if self.frame_size == 0 {
            return Err(VoiceError::Config("frame_size must be non-zero".to_string()));
        }
        if self.model.trim().is_empty() {
            return Err(VoiceError::Config("model must be set".to_string()));
        }
        Ok(())
    }

    pub fn capture_config(&self) -> CaptureConfig {
        CaptureConfig {
            sample_rate: self.capture_sample_rate,
            channels: 1,
            frame_size: self.frame_size,
        }
    }

    pub fn playback_config(&self) -> PlaybackConfig {
        PlaybackConfig {
            sample_rate: self.playback_sample_rate,
            ..PlaybackConfig::default()
        }
    }

    pub fn session_setup(&self) -> SessionSetup {
        SessionSetup {
            model: self.model.clone(),
            voice_name: self.voice_name.clone(),
            system_instruction: self.system_instruction.clone(),
        }
    }

    /// Connector for the configured transport.
    pub fn connector(&self) -> VoiceResult<Arc<dyn Connector>> {
        match self.transport {
            Transport::Direct => {
                let key = self.api_key.as_ref().ok_or_else(|| {
                    VoiceError::Config(
                        "direct transport needs an API key (api_key, GEMINI_API_KEY or API_KEY)".to_string(),
                    )
                })?;
                Ok(Arc::new(LiveConnector::new(self.live_endpoint.clone(), key.expose())))
            }
            Transport::Relay => Ok(Arc::new(RelayConnector::new(self.relay_addr.clone()))),
        }
    }

    pub fn lag_policy(&self) -> LagPolicy {
        match self.max_lead_ms {
            0 => LagPolicy::Unbounded,
            ms => LagPolicy::DropBeyond(Duration::from_millis(ms)),
        }
    }
}

fn key_from(lookup: impl Fn(&str) -> Option<String>) -> Option<ApiKey> {
    API_KEY_VARS
        .iter()
        .filter_map(|name| lookup(name))
        .find(|value| !value.trim().is_empty())
        .map(ApiKey::new)
}
