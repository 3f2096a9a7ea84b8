use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::gateway::events::ClientProperties;
use crate::gateway::heartbeat::HANDSHAKE_TIMEOUT;
use crate::gateway::intents::DEFAULT_INTENTS;
use crate::sink::DEFAULT_QUEUE_CAPACITY;

pub const DEFAULT_GATEWAY_URL: &str = "wss://gateway.discord.gg";

/// Values left in place by the setup templates; treated as unset.
const PLACEHOLDER_TOKEN: &str = "YOUR_DISCORD_USER_TOKEN";
const PLACEHOLDER_CHANNEL: &str = "DISCORD_CHANNEL_ID";

/// Connection settings for one gateway session.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub url: String,
    pub token: String,
    pub intents: u64,
    pub properties: ClientProperties,
    /// Bound on waiting for HELLO after the socket opens.
    pub handshake_timeout: Duration,
    /// Silence allowed on a connected session before it is treated as stalled.
    pub idle_timeout: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Failed resumes tolerated before the session is discarded.
    pub max_resume_attempts: u32,
    /// Consecutive invalidated sessions (fresh IDENTIFY needed) without
    /// reaching READY before giving up. Transport failures retry forever.
    pub max_reconnect_attempts: u32,
    /// Consecutive malformed or unexpected frames before forcing a reconnect.
    pub protocol_error_threshold: u32,
}

impl GatewayConfig {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            url: DEFAULT_GATEWAY_URL.to_string(),
            token: token.into(),
            intents: DEFAULT_INTENTS,
            properties: ClientProperties::default(),
            handshake_timeout: HANDSHAKE_TIMEOUT,
            idle_timeout: Duration::from_secs(90),
            backoff_base: Duration::from_millis(1_000),
            backoff_max: Duration::from_millis(60_000),
            max_resume_attempts: 3,
            max_reconnect_attempts: 10,
            protocol_error_threshold: 5,
        }
    }
}

pub struct Config {
    pub gateway: GatewayConfig,
    pub subscribed_channel_ids: Vec<String>,
    pub webhook_url: Option<String>,
    pub telegram: Option<TelegramConfig>,
    pub queue_capacity: usize,
}

/// Telegram Bot API destination for signal notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelegramConfig {
    pub bot_token: String,
    pub chat_id: String,
}

impl TelegramConfig {
    /// Both halves must be present; a token without a chat (or the reverse)
    /// leaves Telegram disabled.
    fn from_parts(bot_token: Option<String>, chat_id: Option<String>) -> Option<Self> {
        Some(Self {
            bot_token: non_empty(bot_token)?,
            chat_id: non_empty(chat_id)?,
        })
    }
}

/// Supplies configuration once at startup.
pub trait ConfigProvider {
    fn load(&self) -> Result<Config, ConfigError>;
}

/// Reads configuration from environment variables.
pub struct EnvConfig;

impl ConfigProvider for EnvConfig {
    fn load(&self) -> Result<Config, ConfigError> {
        Config::from_env()
    }
}

/// Reads configuration from a TOML file, using the keys of the legacy
/// `config.toml` (`discord_token`, `discord_channel_id`, `discord_webhook`,
/// `tg_token`, `tg_chat`).
pub struct FileConfig {
    path: PathBuf,
}

impl FileConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ConfigProvider for FileConfig {
    fn load(&self) -> Result<Config, ConfigError> {
        Config::from_file(&self.path)
    }
}

#[derive(Debug, Deserialize)]
struct FileSettings {
    #[serde(default)]
    discord_token: String,
    #[serde(default)]
    discord_channel_id: Vec<String>,
    #[serde(default)]
    discord_webhook: Option<String>,
    #[serde(default)]
    tg_token: Option<String>,
    #[serde(default)]
    tg_chat: Option<String>,
    #[serde(default)]
    gateway_url: Option<String>,
    #[serde(default)]
    intents: Option<u64>,
    #[serde(default)]
    handshake_timeout_secs: Option<u64>,
    #[serde(default)]
    idle_timeout_secs: Option<u64>,
    #[serde(default)]
    backoff_base_ms: Option<u64>,
    #[serde(default)]
    backoff_max_ms: Option<u64>,
    #[serde(default)]
    max_resume_attempts: Option<u32>,
    #[serde(default)]
    max_reconnect_attempts: Option<u32>,
    #[serde(default)]
    protocol_error_threshold: Option<u32>,
    #[serde(default)]
    queue_capacity: Option<usize>,
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn checked_token(token: String) -> Result<String, ConfigError> {
    let token = token.trim().to_string();
    if token.is_empty() || token == PLACEHOLDER_TOKEN {
        return Err(ConfigError::Missing("discord token"));
    }
    Ok(token)
}

fn checked_channels<I>(ids: I) -> Result<Vec<String>, ConfigError>
where
    I: IntoIterator<Item = String>,
{
    let mut channels: Vec<String> = Vec::new();
    for id in ids {
        let id = id.trim().to_string();
        if id.is_empty() || id == PLACEHOLDER_CHANNEL || channels.contains(&id) {
            continue;
        }
        if !id.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ConfigError::Invalid {
                key: "channel id",
                reason: format!("{id:?} is not a numeric channel id"),
            });
        }
        channels.push(id);
    }
    if channels.is_empty() {
        return Err(ConfigError::Missing("subscribed channel ids"));
    }
    Ok(channels)
}

fn checked_url(url: String) -> Result<String, ConfigError> {
    let url = url.trim().trim_end_matches('/').to_string();
    if url.starts_with("wss://") || url.starts_with("ws://") {
        Ok(url)
    } else {
        Err(ConfigError::Invalid {
            key: "gateway url",
            reason: format!("{url:?} is not a ws:// or wss:// url"),
        })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let token = checked_token(std::env::var("DISCORD_TOKEN").unwrap_or_default())?;
        let channels = checked_channels(
            std::env::var("DISCORD_CHANNEL_IDS")
                .unwrap_or_default()
                .split(',')
                .map(str::to_string),
        )?;

        let mut gateway = GatewayConfig::new(token);
        gateway.url = checked_url(
            std::env::var("DISCORD_GATEWAY_URL")
                .unwrap_or_else(|_| DEFAULT_GATEWAY_URL.to_string()),
        )?;
        gateway.intents = env_parse("DISCORD_INTENTS", gateway.intents);
        gateway.handshake_timeout = Duration::from_secs(env_parse(
            "SIGNALWATCH_HANDSHAKE_TIMEOUT_SECS",
            gateway.handshake_timeout.as_secs(),
        ));
        gateway.idle_timeout = Duration::from_secs(env_parse(
            "SIGNALWATCH_IDLE_TIMEOUT_SECS",
            gateway.idle_timeout.as_secs(),
        ));
        gateway.backoff_base = Duration::from_millis(env_parse(
            "SIGNALWATCH_BACKOFF_BASE_MS",
            gateway.backoff_base.as_millis() as u64,
        ));
        gateway.backoff_max = Duration::from_millis(env_parse(
            "SIGNALWATCH_BACKOFF_MAX_MS",
            gateway.backoff_max.as_millis() as u64,
        ));
        gateway.max_resume_attempts =
            env_parse("SIGNALWATCH_MAX_RESUME_ATTEMPTS", gateway.max_resume_attempts);
        gateway.max_reconnect_attempts =
            env_parse("SIGNALWATCH_MAX_RECONNECT_ATTEMPTS", gateway.max_reconnect_attempts);
        gateway.protocol_error_threshold = env_parse(
            "SIGNALWATCH_PROTOCOL_ERROR_THRESHOLD",
            gateway.protocol_error_threshold,
        );

        Ok(Self {
            gateway,
            subscribed_channel_ids: channels,
            webhook_url: non_empty(std::env::var("DISCORD_WEBHOOK").ok()),
            telegram: TelegramConfig::from_parts(
                std::env::var("TELEGRAM_BOT_TOKEN").ok(),
                std::env::var("TELEGRAM_CHAT_ID").ok(),
            ),
            queue_capacity: env_parse("SIGNALWATCH_QUEUE_CAPACITY", DEFAULT_QUEUE_CAPACITY),
        })
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let settings: FileSettings = toml::from_str(text)?;

        let mut gateway = GatewayConfig::new(checked_token(settings.discord_token)?);
        if let Some(url) = settings.gateway_url {
            gateway.url = checked_url(url)?;
        }
        if let Some(intents) = settings.intents {
            gateway.intents = intents;
        }
        if let Some(secs) = settings.handshake_timeout_secs {
            gateway.handshake_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = settings.idle_timeout_secs {
            gateway.idle_timeout = Duration::from_secs(secs);
        }
        if let Some(ms) = settings.backoff_base_ms {
            gateway.backoff_base = Duration::from_millis(ms);
        }
        if let Some(ms) = settings.backoff_max_ms {
            gateway.backoff_max = Duration::from_millis(ms);
        }
        if let Some(max) = settings.max_resume_attempts {
            gateway.max_resume_attempts = max;
        }
        if let Some(max) = settings.max_reconnect_attempts {
            gateway.max_reconnect_attempts = max;
        }
        if let Some(threshold) = settings.protocol_error_threshold {
            gateway.protocol_error_threshold = threshold;
        }

        Ok(Self {
            gateway,
            subscribed_channel_ids: checked_channels(settings.discord_channel_id)?,
            webhook_url: non_empty(settings.discord_webhook),
            telegram: TelegramConfig::from_parts(settings.tg_token, settings.tg_chat),
            queue_capacity: settings.queue_capacity.unwrap_or(DEFAULT_QUEUE_CAPACITY),
        })
    }
}
