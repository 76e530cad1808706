// Server configuration.
//
// Centralizes environment variable parsing with defaults for local
// development. The DB pool (db/pool.rs) and CORS layer (cors.rs) read their
// own variables; this module covers the core server, media and stream
// timing settings.

use std::{net::SocketAddr, time::Duration};

use anyhow::{bail, Context};

const DEV_JWT_SECRET: &str = "scrolllive_local_development_jwt_secret_32_chars";
const DEV_MEDIA_API_KEY: &str = "devkey";
const DEV_MEDIA_API_SECRET: &str = "scrolllive_local_development_media_secret";
const DEFAULT_MEDIA_WS_URL: &str = "ws://localhost:7880";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

/// Timing and sizing knobs for stream coordination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSettings {
    /// Delay before the abandoned-stream check runs after creation.
    pub cleanup_delay: Duration,
    /// How often the sweeper looks for due cleanups and expired leases.
    pub sweep_interval: Duration,
    /// Lifetime of a presence lease; heartbeats must arrive before it lapses.
    pub lease_ttl: Duration,
    pub room_empty_timeout: Duration,
    pub room_max_participants: u32,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            cleanup_delay: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(15),
            lease_ttl: Duration::from_secs(45),
            room_empty_timeout: Duration::from_secs(300),
            room_max_participants: 100,
        }
    }
}

/// Media server endpoint and API credentials.
#[derive(Clone)]
pub struct MediaConfig {
    /// Room service URL. `None` runs an in-process room registry.
    pub service_url: Option<String>,
    /// URL handed to clients for their media connection.
    pub client_ws_url: String,
    pub api_key: String,
    pub api_secret: String,
    pub request_timeout: Duration,
}

impl std::fmt::Debug for MediaConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaConfig")
            .field("service_url", &self.service_url)
            .field("client_ws_url", &self.client_ws_url)
            .field("api_key", &self.api_key)
            .field("api_secret", &"<redacted>")
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

/// Core server configuration.
///
/// Constructed via [`ServerConfig::from_env`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    /// HS256 secret for user bearer tokens.
    pub jwt_secret: String,
    /// PostgreSQL connection string; `None` selects the in-memory store.
    pub database_url: Option<String>,
    pub cors_origins: Option<String>,
    pub log_filter: String,
    pub log_format: LogFormat,
    pub media: MediaConfig,
    pub streams: StreamSettings,
}

impl ServerConfig {
    /// Parse configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `SCROLLLIVE_HOST` | `0.0.0.0` |
    /// | `SCROLLLIVE_PORT` | `8080` |
    /// | `SCROLLLIVE_JWT_SECRET` | dev-only placeholder |
    /// | `SCROLLLIVE_DATABASE_URL` | *(none, memory store)* |
    /// | `SCROLLLIVE_CORS_ORIGINS` | *(none, cors.rs uses dev defaults)* |
    /// | `SCROLLLIVE_LOG_FILTER` | `info` |
    /// | `SCROLLLIVE_LOG_FORMAT` | `text` |
    /// | `SCROLLLIVE_LIVEKIT_URL` | *(none, in-memory rooms)* |
    /// | `SCROLLLIVE_LIVEKIT_API_KEY[_FILE]` | dev key without a URL |
    /// | `SCROLLLIVE_LIVEKIT_API_SECRET[_FILE]` | dev secret without a URL |
    /// | `SCROLLLIVE_MEDIA_TIMEOUT_SECS` | `10` |
    /// | `SCROLLLIVE_CLEANUP_DELAY_SECS` | `300` |
    /// | `SCROLLLIVE_SWEEP_INTERVAL_SECS` | `15` |
    /// | `SCROLLLIVE_LEASE_TTL_SECS` | `45` |
    /// | `SCROLLLIVE_ROOM_EMPTY_TIMEOUT_SECS` | `300` |
    /// | `SCROLLLIVE_ROOM_MAX_PARTICIPANTS` | `100` |
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_env_fn(|key| std::env::var(key))
    }

    /// Testable constructor that accepts an environment lookup function.
    fn from_env_fn<F>(env: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let host = env("SCROLLLIVE_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let port: u16 = parse_or(&env, "SCROLLLIVE_PORT", 8080);
        let listen_addr = format!("{host}:{port}")
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], port)));

        let jwt_secret = env("SCROLLLIVE_JWT_SECRET").unwrap_or_else(|_| DEV_JWT_SECRET.into());
        let database_url = env("SCROLLLIVE_DATABASE_URL").ok();
        let cors_origins = env("SCROLLLIVE_CORS_ORIGINS").ok();
        let log_filter = env("SCROLLLIVE_LOG_FILTER").unwrap_or_else(|_| "info".into());
        let log_format = match env("SCROLLLIVE_LOG_FORMAT").as_deref() {
            Ok("json") => LogFormat::Json,
            _ => LogFormat::Text,
        };

        let media = media_config_from_env(&env)?;

        let defaults = StreamSettings::default();
        let streams = StreamSettings {
            cleanup_delay: secs_or(&env, "SCROLLLIVE_CLEANUP_DELAY_SECS", defaults.cleanup_delay),
            sweep_interval: secs_or(
                &env,
                "SCROLLLIVE_SWEEP_INTERVAL_SECS",
                defaults.sweep_interval,
            ),
            lease_ttl: secs_or(&env, "SCROLLLIVE_LEASE_TTL_SECS", defaults.lease_ttl),
            room_empty_timeout: secs_or(
                &env,
                "SCROLLLIVE_ROOM_EMPTY_TIMEOUT_SECS",
                defaults.room_empty_timeout,
            ),
            room_max_participants: parse_or(
                &env,
                "SCROLLLIVE_ROOM_MAX_PARTICIPANTS",
                defaults.room_max_participants,
            ),
        };

        Ok(Self {
            listen_addr,
            jwt_secret,
            database_url,
            cors_origins,
            log_filter,
            log_format,
            media,
            streams,
        })
    }

    /// Returns true when using the development-only JWT secret.
    pub fn is_dev_jwt_secret(&self) -> bool {
        self.jwt_secret == DEV_JWT_SECRET
    }
}

fn media_config_from_env<F>(env: &F) -> anyhow::Result<MediaConfig>
where
    F: Fn(&str) -> Result<String, std::env::VarError>,
{
    let service_url = env("SCROLLLIVE_LIVEKIT_URL").ok().filter(|url| !url.trim().is_empty());
    let api_key = secret_from_env(env, "SCROLLLIVE_LIVEKIT_API_KEY")?;
    let api_secret = secret_from_env(env, "SCROLLLIVE_LIVEKIT_API_SECRET")?;

    let (api_key, api_secret) = match (&service_url, api_key, api_secret) {
        (_, Some(key), Some(secret)) => (key, secret),
        (None, None, None) => (DEV_MEDIA_API_KEY.to_string(), DEV_MEDIA_API_SECRET.to_string()),
        (Some(_), _, _) => bail!(
            "SCROLLLIVE_LIVEKIT_URL is set but SCROLLLIVE_LIVEKIT_API_KEY and SCROLLLIVE_LIVEKIT_API_SECRET are not both configured"
        ),
        (None, _, _) => bail!(
            "SCROLLLIVE_LIVEKIT_API_KEY and SCROLLLIVE_LIVEKIT_API_SECRET must be configured together"
        ),
    };

    let client_ws_url = service_url.clone().unwrap_or_else(|| DEFAULT_MEDIA_WS_URL.to_string());
    let request_timeout =
        secs_or(env, "SCROLLLIVE_MEDIA_TIMEOUT_SECS", Duration::from_secs(10));

    Ok(MediaConfig { service_url, client_ws_url, api_key, api_secret, request_timeout })
}

/// Reads `NAME` directly, or the contents of the file named by `NAME_FILE`.
fn secret_from_env<F>(env: &F, name: &str) -> anyhow::Result<Option<String>>
where
    F: Fn(&str) -> Result<String, std::env::VarError>,
{
    if let Ok(value) = env(name) {
        let value = value.trim().to_string();
        return Ok((!value.is_empty()).then_some(value));
    }

    let file_var = format!("{name}_FILE");
    let Ok(path) = env(&file_var) else {
        return Ok(None);
    };
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read {file_var} at {path}"))?;
    let value = contents.trim().to_string();
    if value.is_empty() {
        bail!("{file_var} points at an empty file");
    }
    Ok(Some(value))
}

fn parse_or<F, T>(env: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Result<String, std::env::VarError>,
    T: std::str::FromStr,
{
    env(key).ok().and_then(|value| value.trim().parse().ok()).unwrap_or(default)
}

fn secs_or<F>(env: &F, key: &str, default: Duration) -> Duration
where
    F: Fn(&str) -> Result<String, std::env::VarError>,
{
    env(key)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .filter(|secs| *secs > 0)
        .map(Duration::from_secs)
        .unwrap_or(default)
}
