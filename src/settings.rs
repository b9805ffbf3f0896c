//! Typed settings from `Config.toml` plus `TRIPCHAT__SECTION__KEY` overrides.

use serde::Deserialize;

use crate::context::{DEFAULT_HISTORY_LIMIT, DEFAULT_IDLE_TIMEOUT_SECS, DEFAULT_SWEEP_INTERVAL_SECS};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerSettings,
    pub context: ContextSettings,
    pub llm: LlmSettings,
    pub weather: WeatherSettings,
    pub itinerary: ItinerarySettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ContextSettings {
    pub idle_timeout_secs: i64,
    pub sweep_interval_secs: u64,
    pub history_limit: usize,
}

impl Default for ContextSettings {
    fn default() -> Self {
        Self {
            idle_timeout_secs: DEFAULT_IDLE_TIMEOUT_SECS,
            sweep_interval_secs: DEFAULT_SWEEP_INTERVAL_SECS,
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSettings {
    pub enabled: bool,
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub timeout_secs: u64,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: String::new(),
            model: "gpt-4o-mini".to_string(),
            timeout_secs: 10,
        }
    }
}

impl LlmSettings {
    /// The service is only used with a key; otherwise every call falls back.
    pub fn is_usable(&self) -> bool {
        self.enabled && !self.api_key.trim().is_empty()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WeatherSettings {
    pub base_url: String,
    pub api_key: String,
    pub units: String,
    pub timeout_secs: u64,
    pub forecast_days: usize,
}

impl Default for WeatherSettings {
    fn default() -> Self {
        Self {
            base_url: "https://api.openweathermap.org/data/2.5".to_string(),
            api_key: String::new(),
            units: "metric".to_string(),
            timeout_secs: 8,
            forecast_days: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ItinerarySettings {
    pub url: Option<String>,
    pub timeout_secs: u64,
    pub default_budget: Option<f64>,
    pub default_member_count: u32,
    pub default_pace: String,
}

impl Default for ItinerarySettings {
    fn default() -> Self {
        Self {
            url: None,
            timeout_secs: 20,
            default_budget: None,
            default_member_count: 1,
            default_pace: "moderate".to_string(),
        }
    }
}

impl Settings {
    /// Reads `Config.toml` from the working directory when present.
    pub fn load() -> anyhow::Result<Self> {
        Self::build(config::File::with_name("Config").required(false))
    }

    fn build<S>(file: S) -> anyhow::Result<Self>
    where
        S: config::Source + Send + Sync + 'static,
    {
        let settings = config::Config::builder()
            .add_source(file)
            .add_source(
                config::Environment::with_prefix("TRIPCHAT")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        Ok(settings.try_deserialize()?)
    }
}
