//! # Configuration Management
//!
//! Loads the client configuration from multiple sources:
//! - TOML configuration file (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `GEMINI_API_KEY` / `GOOGLE_API_KEY` for the credential
//! 2. Environment variables (`APP_SESSION__VOICE`, `APP_AUDIO__FRAME_SIZE`, ...)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)
//!
//! The section separator in environment variables is a double underscore so
//! that field names such as `frame_size` keep their single underscore.

use crate::session::SessionConfig;
use crate::transport::gemini::DEFAULT_ENDPOINT;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub session: SessionSettings,
    pub audio: AudioSettings,
    pub devices: DevicesConfig,
}

/// What the remote model is asked to be.
///
/// ## Fields:
/// - `endpoint`: live WebSocket endpoint, without the key parameter
/// - `model`: model identifier (the `models/` prefix is optional)
/// - `voice`: prebuilt voice used for replies (e.g. "Puck", "Kore", "Charon")
/// - `persona`: instruction text sent once when the session opens
/// - `api_key`: credential; usually supplied through `GEMINI_API_KEY`
#[derive(Clone, Serialize, Deserialize)]
pub struct SessionSettings {
    pub endpoint: String,
    pub model: String,
    pub voice: String,
    pub persona: String,
    pub api_key: Option<String>,
}

impl std::fmt::Debug for SessionSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionSettings")
            .field("endpoint", &self.endpoint)
            .field("model", &self.model)
            .field("voice", &self.voice)
            .field("persona_len", &self.persona.len())
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Audio format and pipeline sizing.
///
/// ## Fields:
/// - `capture_sample_rate`: microphone rate sent on the wire (Hz)
/// - `playback_sample_rate`: rate of the reply audio (Hz)
/// - `channels`: channel count; only mono is supported
/// - `frame_size`: samples per captured frame (4096 at 16 kHz is 256 ms)
/// - `outbound_queue`: frames that may wait for the socket before new ones are dropped
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioSettings {
    pub capture_sample_rate: u32,
    pub playback_sample_rate: u32,
    pub channels: u16,
    pub frame_size: usize,
    pub outbound_queue: usize,
}

/// Software device wiring.
///
/// ## Fields:
/// - `input_wav`: WAV file played into the microphone; silence when unset
/// - `output_wav`: file the reply audio is written to on close; discarded when unset
/// - `start_suspended`: create device contexts suspended, as browsers do under autoplay policy
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DevicesConfig {
    pub input_wav: Option<String>,
    pub output_wav: Option<String>,
    pub start_suspended: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            session: SessionSettings {
                endpoint: DEFAULT_ENDPOINT.to_string(),
                model: "gemini-2.0-flash-live-001".to_string(),
                voice: "Puck".to_string(),
                persona: "You are a friendly voice assistant. Keep answers short and conversational."
                    .to_string(),
                api_key: None,
            },
            audio: AudioSettings {
                capture_sample_rate: 16000,  // What the live API expects for input
                playback_sample_rate: 24000, // What it sends back
                channels: 1,
                frame_size: 4096,
                outbound_queue: 64, // ~16 s of audio at the default frame size
            },
            devices: DevicesConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from `config.toml` (optional) and the environment.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SESSION__VOICE=Kore`: override the reply voice
    /// - `APP_AUDIO__FRAME_SIZE=2048`: smaller capture frames
    /// - `APP_DEVICES__INPUT_WAV=question.wav`: feed a file into the microphone
    /// - `GEMINI_API_KEY=...`: the credential
    pub fn load() -> Result<Self> {
        Self::load_with(
            config::File::with_name("config").required(false),
            |name| env::var(name).ok(),
        )
    }

    /// Load configuration using `path` as the TOML file.
    pub fn load_from(path: &Path) -> Result<Self> {
        Self::load_with(config::File::from(path).required(true), |name| {
            env::var(name).ok()
        })
    }

    fn load_with<F>(file: config::File<config::FileSourceFile, config::FileFormat>, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(file)
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        // Conventional credential variables; GEMINI_API_KEY wins over GOOGLE_API_KEY
        for name in ["GOOGLE_API_KEY", "GEMINI_API_KEY"] {
            if let Some(key) = lookup(name).filter(|k| !k.trim().is_empty()) {
                settings = settings.set_override("session.api_key", key)?;
            }
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// A missing credential is not a configuration error: the session reports
    /// it through its error callback when it tries to connect.
    pub fn validate(&self) -> Result<()> {
        if self.session.endpoint.trim().is_empty() {
            return Err(anyhow::anyhow!("Session endpoint cannot be empty"));
        }

        if self.session.model.trim().is_empty() {
            return Err(anyhow::anyhow!("Session model cannot be empty"));
        }

        if self.audio.capture_sample_rate == 0 || self.audio.playback_sample_rate == 0 {
            return Err(anyhow::anyhow!("Sample rates must be greater than 0"));
        }

        if self.audio.channels != 1 {
            return Err(anyhow::anyhow!(
                "Only mono audio is supported, got {} channels",
                self.audio.channels
            ));
        }

        if self.audio.frame_size == 0 {
            return Err(anyhow::anyhow!("Frame size must be greater than 0"));
        }

        if self.audio.outbound_queue == 0 {
            return Err(anyhow::anyhow!("Outbound queue must hold at least one frame"));
        }

        Ok(())
    }

    /// Render the effective configuration as TOML, with the credential masked.
    pub fn to_toml(&self) -> Result<String> {
        let mut shown = self.clone();
        if shown.session.api_key.is_some() {
            shown.session.api_key = Some("<redacted>".to_string());
        }
        Ok(toml::to_string_pretty(&shown)?)
    }

    /// The immutable per-session configuration.
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            credential: self
                .session
                .api_key
                .clone()
                .filter(|k| !k.trim().is_empty()),
            persona: self.session.persona.clone(),
            voice: self.session.voice.clone(),
            model: self.session.model.clone(),
            capture_sample_rate: self.audio.capture_sample_rate,
            playback_sample_rate: self.audio.playback_sample_rate,
            channels: self.audio.channels,
            frame_size: self.audio.frame_size,
        }
    }
}
