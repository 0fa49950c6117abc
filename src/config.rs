//! Configuration for propyield, read from `<data-dir>/propyield.toml`.
//!
//! Layering is file → environment → CLI. Secrets (API keys, admin token)
//! may live in the file but an environment variable always wins, so a
//! `.env` file loaded through `dotenvy` is enough for local development.
//!
//! # Configuration File Format
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 8080
//! db_path = ".propyield/propyield.db"
//! dev_mode = false
//!
//! [openai]
//! model = "gpt-4o"
//! timeout_secs = 60
//! max_retries = 3
//!
//! [maps]
//! zoom = 20
//! image_size = "640x640"
//!
//! [analysis]
//! use_satellite_image = true
//! force_mock = false
//!
//! [assistant]
//! poll_interval_ms = 1000
//! max_polls = 60
//!
//! [partners]
//! referral_code = "propyield"
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const CONFIG_FILE_NAME: &str = "propyield.toml";
pub const DEFAULT_DATA_DIR: &str = ".propyield";

pub const ENV_OPENAI_API_KEY: &str = "OPENAI_API_KEY";
pub const ENV_OPENAI_ASSISTANT_ID: &str = "OPENAI_ASSISTANT_ID";
pub const ENV_MAPS_API_KEY: &str = "GOOGLE_MAPS_API_KEY";
pub const ENV_ADMIN_TOKEN: &str = "PROPYIELD_ADMIN_TOKEN";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    pub dev_mode: bool,
    /// Token required in `X-Admin-Token` for admin routes. Admin routes are
    /// disabled when unset.
    pub admin_token: Option<String>,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            db_path: PathBuf::from(DEFAULT_DATA_DIR).join("propyield.db"),
            dev_mode: false,
            admin_token: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenAiSection {
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    pub assistant_id: Option<String>,
    pub timeout_secs: u64,
    pub max_retries: u32,
}

impl Default for OpenAiSection {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o".to_string(),
            assistant_id: None,
            timeout_secs: 60,
            max_retries: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MapsSection {
    pub api_key: Option<String>,
    pub geocode_url: String,
    pub static_map_url: String,
    pub zoom: u8,
    pub image_size: String,
}

impl Default for MapsSection {
    fn default() -> Self {
        Self {
            api_key: None,
            geocode_url: "https://maps.googleapis.com/maps/api/geocode/json".to_string(),
            static_map_url: "https://maps.googleapis.com/maps/api/staticmap".to_string(),
            zoom: 20,
            image_size: "640x640".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisSection {
    /// Attach a satellite image of the parcel to the model prompt.
    pub use_satellite_image: bool,
    /// Skip the language model entirely and always use the mock generator.
    pub force_mock: bool,
}

impl Default for AnalysisSection {
    fn default() -> Self {
        Self {
            use_satellite_image: true,
            force_mock: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AssistantSection {
    pub poll_interval_ms: u64,
    pub max_polls: u32,
}

impl Default for AssistantSection {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            max_polls: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PartnersSection {
    pub referral_code: String,
}

impl Default for PartnersSection {
    fn default() -> Self {
        Self {
            referral_code: "propyield".to_string(),
        }
    }
}

/// The complete propyield.toml configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PropyieldToml {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub openai: OpenAiSection,
    #[serde(default)]
    pub maps: MapsSection,
    #[serde(default)]
    pub analysis: AnalysisSection,
    #[serde(default)]
    pub assistant: AssistantSection,
    #[serde(default)]
    pub partners: PartnersSection,
}

fn env_non_empty(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl PropyieldToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse propyield.toml")
    }

    /// Load `<data_dir>/propyield.toml`, or defaults if the file doesn't exist.
    pub fn load_or_default(data_dir: &Path) -> Result<Self> {
        let config_path = data_dir.join(CONFIG_FILE_NAME);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).context("Failed to serialize propyield.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    pub fn openai_api_key(&self) -> Option<String> {
        env_non_empty(ENV_OPENAI_API_KEY).or_else(|| self.openai.api_key.clone())
    }

    pub fn assistant_id(&self) -> Option<String> {
        env_non_empty(ENV_OPENAI_ASSISTANT_ID).or_else(|| self.openai.assistant_id.clone())
    }

    pub fn maps_api_key(&self) -> Option<String> {
        env_non_empty(ENV_MAPS_API_KEY).or_else(|| self.maps.api_key.clone())
    }

    pub fn admin_token(&self) -> Option<String> {
        env_non_empty(ENV_ADMIN_TOKEN).or_else(|| self.server.admin_token.clone())
    }

    /// Copy with every secret masked, for display.
    pub fn redacted(&self) -> Self {
        let mask = |v: &Option<String>| v.as_ref().map(|_| "********".to_string());
        let mut copy = self.clone();
        copy.openai.api_key = mask(&self.openai.api_key);
        copy.maps.api_key = mask(&self.maps.api_key);
        copy.server.admin_token = mask(&self.server.admin_token);
        copy
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.openai_api_key().is_none() {
            warnings.push(format!(
                "No OpenAI API key ({}): property analyses will use the mock generator",
                ENV_OPENAI_API_KEY
            ));
        }
        if self.assistant_id().is_none() {
            warnings.push(format!(
                "No assistant id ({}): chat will use the local rule-based assistant",
                ENV_OPENAI_ASSISTANT_ID
            ));
        }
        if self.maps_api_key().is_none() {
            warnings.push(format!(
                "No Google Maps API key ({}): addresses will not be geocoded",
                ENV_MAPS_API_KEY
            ));
        }
        if self.admin_token().is_none() {
            warnings.push("No admin token configured: admin routes are disabled".to_string());
        }
        if self.openai.timeout_secs == 0 {
            warnings.push(
                "openai.timeout_secs is 0: every OpenAI request will time out immediately"
                    .to_string(),
            );
        }
        if self.openai.max_retries > MAX_SENSIBLE_RETRIES {
            warnings.push(format!(
                "openai.max_retries {} is above {}: failing requests will stall analyses",
                self.openai.max_retries, MAX_SENSIBLE_RETRIES
            ));
        }
        if self.assistant.poll_interval_ms == 0 {
            warnings.push("assistant.poll_interval_ms must be greater than 0".to_string());
        }
        if self.assistant.max_polls == 0 {
            warnings.push("assistant.max_polls must be greater than 0".to_string());
        }
        if !(1..=21).contains(&self.maps.zoom) {
            warnings.push(format!(
                "maps.zoom {} is outside the supported range 1-21",
                self.maps.zoom
            ));
        }
        if !is_valid_image_size(&self.maps.image_size) {
            warnings.push(format!(
                "Invalid maps.image_size '{}': expected WIDTHxHEIGHT, each at most 640",
                self.maps.image_size
            ));
        }

        warnings
    }
}

/// Retry counts above this keep a user waiting for minutes.
const MAX_SENSIBLE_RETRIES: u32 = 5;

/// Static Maps accepts `WxH` with both sides in 1..=640.
pub fn is_valid_image_size(size: &str) -> bool {
    let Some((w, h)) = size.split_once('x') else {
        return false;
    };
    match (w.parse::<u32>(), h.parse::<u32>()) {
        (Ok(w), Ok(h)) => (1..=640).contains(&w) && (1..=640).contains(&h),
        _ => false,
    }
}

/// Resolved configuration paths plus the parsed file.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub data_dir: PathBuf,
    pub toml: PropyieldToml,
}

impl AppConfig {
    pub fn new(data_dir: PathBuf) -> Result<Self> {
        let toml = PropyieldToml::load_or_default(&data_dir)?;
        Ok(Self { data_dir, toml })
    }

    pub fn config_file(&self) -> PathBuf {
        self.data_dir.join(CONFIG_FILE_NAME)
    }

    /// Database path; relative paths in the file are taken as-is so that the
    /// default `.propyield/propyield.db` follows the data directory.
    pub fn db_path(&self) -> PathBuf {
        let configured = &self.toml.server.db_path;
        if configured == &ServerSection::default().db_path {
            self.data_dir.join("propyield.db")
        } else {
            configured.clone()
        }
    }
}
