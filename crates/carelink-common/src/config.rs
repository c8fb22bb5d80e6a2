//! Application configuration loaded from environment variables and config files.
//!
//! Supports `.env` files for development and environment variables for production.
//! Config precedence: env vars > .env file > carelink.toml > defaults

use chrono::{FixedOffset, Offset, Utc};
use serde::Deserialize;
use std::sync::OnceLock;
use std::time::Duration;

use crate::error::CareLinkResult;

static CONFIG: OnceLock<AppConfig> = OnceLock::new();

const DEFAULT_CHAT_URL: &str = "ws://localhost:3300";
const DEFAULT_API_URL: &str = "http://localhost:3300";
const DEFAULT_STORAGE_PATH: &str = "./data/carelink-state.json";
const DEFAULT_LOG_FILTER: &str = "carelink_chat=info,carelink_common=info,warn";

/// Get the global application configuration, if [`init`] has run.
pub fn get() -> Option<&'static AppConfig> {
    CONFIG.get()
}

/// Initialize the global configuration from environment.
///
/// Should be called once at application startup. Later calls return the
/// configuration captured by the first one.
pub fn init() -> CareLinkResult<&'static AppConfig> {
    if let Some(cfg) = CONFIG.get() {
        return Ok(cfg);
    }
    // Load .env file if present (development)
    let _ = dotenvy::dotenv();
    let app_config = load()?;
    Ok(CONFIG.get_or_init(|| app_config))
}

/// Build a configuration from defaults, `carelink.toml`, and `CARELINK_*` env vars
/// without touching the global.
pub fn load() -> CareLinkResult<AppConfig> {
    let defaults = AppConfig::default();
    let cfg = config::Config::builder()
        // Defaults
        .set_default("chat.url", defaults.chat.url.clone())?
        .set_default("chat.transports", vec!["websocket", "polling"])?
        .set_default("chat.reconnection", defaults.chat.reconnection)?
        .set_default("chat.reconnection_attempts", i64::from(defaults.chat.reconnection_attempts))?
        .set_default("chat.reconnection_delay_ms", defaults.chat.reconnection_delay_ms as i64)?
        .set_default(
            "chat.reconnection_delay_max_ms",
            defaults.chat.reconnection_delay_max_ms as i64,
        )?
        .set_default("chat.randomization_factor", defaults.chat.randomization_factor)?
        .set_default("chat.ping_interval_secs", defaults.chat.ping_interval_secs as i64)?
        .set_default("chat.event_buffer", defaults.chat.event_buffer as i64)?
        .set_default("api.url", defaults.api.url.clone())?
        .set_default("api.timeout_secs", defaults.api.timeout_secs as i64)?
        .set_default("api.page_size", i64::from(defaults.api.page_size))?
        .set_default("storage.path", defaults.storage.path.clone())?
        .set_default("display.utc_offset_minutes", i64::from(defaults.display.utc_offset_minutes))?
        .set_default("logging.filter", defaults.logging.filter.clone())?
        // Optional config file
        .add_source(config::File::with_name("carelink").required(false))
        // Environment variables (CARELINK_CHAT__URL, CARELINK_API__URL, etc.)
        .add_source(
            config::Environment::with_prefix("CARELINK")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("chat.transports")
                .try_parsing(true),
        )
        .build()?;

    Ok(cfg.try_deserialize()?)
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    pub chat: ChatConfig,
    pub api: ApiConfig,
    pub storage: StorageConfig,
    pub display: DisplayConfig,
    pub logging: LoggingConfig,
}

/// Underlying transport used for the event-stream connection.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    WebSocket,
    Polling,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChatConfig {
    /// Event-stream endpoint (ws://, wss://, http:// or https://)
    pub url: String,
    /// Transports tried in order on every (re)connect
    pub transports: Vec<TransportKind>,
    pub reconnection: bool,
    pub reconnection_attempts: u32,
    pub reconnection_delay_ms: u64,
    pub reconnection_delay_max_ms: u64,
    /// Jitter applied to each reconnect delay, 0.0..=1.0
    pub randomization_factor: f64,
    pub ping_interval_secs: u64,
    /// Capacity of the transport event broadcast channel
    pub event_buffer: usize,
}

impl ChatConfig {
    pub fn reconnection_delay(&self) -> Duration {
        Duration::from_millis(self.reconnection_delay_ms)
    }

    pub fn reconnection_delay_max(&self) -> Duration {
        Duration::from_millis(self.reconnection_delay_max_ms.max(self.reconnection_delay_ms))
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs.max(1))
    }
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_CHAT_URL.to_owned(),
            transports: vec![TransportKind::WebSocket, TransportKind::Polling],
            reconnection: true,
            reconnection_attempts: 10,
            reconnection_delay_ms: 1_000,
            reconnection_delay_max_ms: 3_000,
            randomization_factor: 0.5,
            ping_interval_secs: 25,
            event_buffer: 1_024,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ApiConfig {
    /// REST collaborator base URL
    pub url: String,
    pub timeout_secs: u64,
    /// Messages fetched per history page
    pub page_size: u32,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_API_URL.to_owned(),
            timeout_secs: 30,
            page_size: 30,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// JSON file holding persisted session state (current group, login keys)
    pub path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: DEFAULT_STORAGE_PATH.to_owned(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct DisplayConfig {
    /// Offset from UTC used when splitting messages by day and minute
    pub utc_offset_minutes: i32,
}

impl DisplayConfig {
    /// The display timezone; out-of-range offsets fall back to UTC.
    pub fn offset(&self) -> FixedOffset {
        self.utc_offset_minutes
            .checked_mul(60)
            .and_then(FixedOffset::east_opt)
            .unwrap_or_else(|| Utc.fix())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// `tracing_subscriber::EnvFilter` directive
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: DEFAULT_LOG_FILTER.to_owned(),
        }
    }
}
