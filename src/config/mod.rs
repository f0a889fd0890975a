//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{
    collections::HashMap,
    net::SocketAddr,
    num::NonZeroU32,
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use clap::{Args, Parser, Subcommand, ValueHint};
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::cache::CacheConfig;
use crate::realtime::RealtimeConfig;

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "staffetta";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PUBLIC_PORT: u16 = 3000;
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 30;
const DEFAULT_DB_MAX_CONNECTIONS: u32 = 8;
const DEFAULT_SUBSTRATE_URL: &str = "redis://127.0.0.1:6379";
const DEFAULT_CONSUMER_GROUP: &str = "staffetta";
const DEFAULT_RELAY_BATCH_SIZE: u32 = 100;
const DEFAULT_RELAY_POLL_MS: u64 = 1000;
const DEFAULT_RELAY_RETRY_DELAY_MS: u64 = 5000;
const DEFAULT_RELAY_MAX_RETRIES: i32 = 3;
const DEFAULT_RELAY_LEASE_SECS: u64 = 30;
const DEFAULT_RELAY_CLEANUP_SECS: u64 = 3600;
const DEFAULT_RELAY_RETENTION_SECS: u64 = 7 * 24 * 3600;
const DEFAULT_WORKER_MAX: u32 = 8;
const DEFAULT_WORKER_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_IDEMPOTENCY_TTL_SECS: u64 = 24 * 3600;
const DEFAULT_BREAKER_MAX_FAILURES: u32 = 5;
const DEFAULT_BREAKER_WINDOW_SECS: u64 = 30;
const DEFAULT_BREAKER_RESET_SECS: u64 = 15;

/// Command-line arguments for the Staffetta binary.
#[derive(Debug, Parser)]
#[command(name = "staffetta", version, about = "Staffetta middleware core")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "STAFFETTA_CONFIG_FILE", value_name = "PATH", value_hint = ValueHint::FilePath)]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the HTTP gateway, relay, processor, cache updater, and hub.
    Serve(Box<ServeArgs>),
    /// Apply pending database migrations and exit.
    #[command(name = "migrate")]
    Migrate(MigrateArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct MigrateArgs {
    /// Override the database connection URL.
    #[arg(long = "database-url", value_name = "URL")]
    pub database_url: Option<String>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    /// Override the listener host.
    #[arg(long = "server-host", value_name = "HOST")]
    pub server_host: Option<String>,

    /// Override the listener port.
    #[arg(long = "server-port", value_name = "PORT")]
    pub server_port: Option<u16>,

    /// Override the graceful shutdown timeout.
    #[arg(long = "server-graceful-shutdown-seconds", value_name = "SECONDS")]
    pub graceful_shutdown_seconds: Option<u64>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(long = "log-json", value_name = "BOOL")]
    pub log_json: Option<bool>,

    /// Override the database connection URL.
    #[arg(long = "database-url", value_name = "URL")]
    pub database_url: Option<String>,

    /// Override the substrate (Redis) connection URL.
    #[arg(long = "substrate-url", value_name = "URL")]
    pub substrate_url: Option<String>,

    /// Override this instance's relay partition index.
    #[arg(long = "relay-partition-index", value_name = "N")]
    pub relay_partition_index: Option<u32>,

    /// Override the total relay partition count.
    #[arg(long = "relay-partition-count", value_name = "N")]
    pub relay_partition_count: Option<u32>,

    /// Disable the outbox relay in this process.
    #[arg(long = "no-relay", action = clap::ArgAction::SetTrue)]
    pub no_relay: bool,

    /// Disable the cache updater in this process.
    #[arg(long = "no-updater", action = clap::ArgAction::SetTrue)]
    pub no_updater: bool,

    /// Disable the in-process command processor.
    #[arg(long = "no-processor", action = clap::ArgAction::SetTrue)]
    pub no_processor: bool,
}

/// Fully-resolved deployment settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub database: DatabaseSettings,
    pub substrate: SubstrateSettings,
    pub cache: CacheConfig,
    pub relay: RelaySettings,
    pub worker: WorkerSettings,
    pub realtime: RealtimeConfig,
    pub breaker: BreakerSettings,
    pub roles: RoleSettings,
    pub auth_tokens: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub addr: SocketAddr,
    pub graceful_shutdown: Duration,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct DatabaseSettings {
    pub url: Option<String>,
    pub max_connections: NonZeroU32,
}

#[derive(Debug, Clone)]
pub struct SubstrateSettings {
    pub url: String,
    pub consumer_group: String,
}

#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub batch_size: u32,
    pub poll_interval: Duration,
    pub retry_delay: Duration,
    pub max_retries: i32,
    pub lease: Duration,
    pub cleanup_interval: Duration,
    pub retention: Duration,
    pub partition_index: u32,
    pub partition_count: u32,
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub max_workers: NonZeroU32,
    pub default_timeout: Duration,
    pub idempotency_ttl: Duration,
}

#[derive(Debug, Clone)]
pub struct BreakerSettings {
    pub max_failures: u32,
    pub window: Duration,
    pub reset_time: Duration,
}

/// Which background roles this process runs; all on by default.
#[derive(Debug, Clone)]
pub struct RoleSettings {
    pub relay: bool,
    pub updater: bool,
    pub processor: bool,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix("STAFFETTA").separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        Some(Command::Migrate(args)) => {
            if let Some(url) = args.database_url.as_ref() {
                raw.database.url = Some(url.clone());
            }
        }
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

/// Parse the CLI and load the matching settings in one step.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let cli = CliArgs::parse();
    let settings = load(&cli)?;
    Ok((cli, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    database: RawDatabaseSettings,
    substrate: RawSubstrateSettings,
    cache: CacheConfig,
    relay: RawRelaySettings,
    worker: RawWorkerSettings,
    realtime: RealtimeConfig,
    breaker: RawBreakerSettings,
    roles: RawRoleSettings,
    auth: RawAuthSettings,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        if let Some(host) = overrides.server_host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(port) = overrides.server_port {
            self.server.port = Some(port);
        }
        if let Some(seconds) = overrides.graceful_shutdown_seconds {
            self.server.graceful_shutdown_seconds = Some(seconds);
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(url) = overrides.database_url.as_ref() {
            self.database.url = Some(url.clone());
        }
        if let Some(url) = overrides.substrate_url.as_ref() {
            self.substrate.url = Some(url.clone());
        }
        if let Some(index) = overrides.relay_partition_index {
            self.relay.partition_index = Some(index);
        }
        if let Some(count) = overrides.relay_partition_count {
            self.relay.partition_count = Some(count);
        }
        if overrides.no_relay {
            self.roles.relay = Some(false);
        }
        if overrides.no_updater {
            self.roles.updater = Some(false);
        }
        if overrides.no_processor {
            self.roles.processor = Some(false);
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    port: Option<u16>,
    graceful_shutdown_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawDatabaseSettings {
    url: Option<String>,
    max_connections: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSubstrateSettings {
    url: Option<String>,
    consumer_group: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRelaySettings {
    batch_size: Option<u32>,
    poll_interval_ms: Option<u64>,
    retry_delay_ms: Option<u64>,
    max_retries: Option<i32>,
    lease_seconds: Option<u64>,
    cleanup_interval_seconds: Option<u64>,
    retention_seconds: Option<u64>,
    partition_index: Option<u32>,
    partition_count: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawWorkerSettings {
    max_workers: Option<u32>,
    default_timeout_ms: Option<u64>,
    idempotency_ttl_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawBreakerSettings {
    max_failures: Option<u32>,
    window_seconds: Option<u64>,
    reset_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRoleSettings {
    relay: Option<bool>,
    updater: Option<bool>,
    processor: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawAuthSettings {
    /// token → subject map; empty enables the dev authenticator.
    tokens: HashMap<String, String>,
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let host = raw.server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());
        let port = raw.server.port.unwrap_or(DEFAULT_PUBLIC_PORT);
        let addr: SocketAddr = format!("{host}:{port}")
            .parse()
            .map_err(|err| LoadError::invalid("server.host", format!("{err}")))?;

        let level = match raw.logging.level {
            Some(level) => LevelFilter::from_str(level.as_str())
                .map_err(|err| LoadError::invalid("logging.level", err.to_string()))?,
            None => LevelFilter::INFO,
        };
        let format = if raw.logging.json.unwrap_or(false) {
            LogFormat::Json
        } else {
            LogFormat::Compact
        };

        let max_connections = NonZeroU32::new(
            raw.database.max_connections.unwrap_or(DEFAULT_DB_MAX_CONNECTIONS),
        )
        .ok_or_else(|| LoadError::invalid("database.max_connections", "must be non-zero"))?;

        let relay_partition_count = raw.relay.partition_count.unwrap_or(1).max(1);
        let relay_partition_index = raw.relay.partition_index.unwrap_or(0);
        if relay_partition_index >= relay_partition_count {
            return Err(LoadError::invalid(
                "relay.partition_index",
                format!("must be below partition_count ({relay_partition_count})"),
            ));
        }

        let max_workers = NonZeroU32::new(raw.worker.max_workers.unwrap_or(DEFAULT_WORKER_MAX))
            .ok_or_else(|| LoadError::invalid("worker.max_workers", "must be non-zero"))?;

        Ok(Self {
            server: ServerSettings {
                addr,
                graceful_shutdown: Duration::from_secs(
                    raw.server
                        .graceful_shutdown_seconds
                        .unwrap_or(DEFAULT_GRACEFUL_SHUTDOWN_SECS),
                ),
            },
            logging: LoggingSettings { level, format },
            database: DatabaseSettings {
                url: raw.database.url,
                max_connections,
            },
            substrate: SubstrateSettings {
                url: raw
                    .substrate
                    .url
                    .unwrap_or_else(|| DEFAULT_SUBSTRATE_URL.to_string()),
                consumer_group: raw
                    .substrate
                    .consumer_group
                    .unwrap_or_else(|| DEFAULT_CONSUMER_GROUP.to_string()),
            },
            cache: raw.cache,
            relay: RelaySettings {
                batch_size: raw.relay.batch_size.unwrap_or(DEFAULT_RELAY_BATCH_SIZE).max(1),
                poll_interval: Duration::from_millis(
                    raw.relay.poll_interval_ms.unwrap_or(DEFAULT_RELAY_POLL_MS).max(1),
                ),
                retry_delay: Duration::from_millis(
                    raw.relay
                        .retry_delay_ms
                        .unwrap_or(DEFAULT_RELAY_RETRY_DELAY_MS),
                ),
                max_retries: raw.relay.max_retries.unwrap_or(DEFAULT_RELAY_MAX_RETRIES).max(0),
                lease: Duration::from_secs(
                    raw.relay.lease_seconds.unwrap_or(DEFAULT_RELAY_LEASE_SECS).max(1),
                ),
                cleanup_interval: Duration::from_secs(
                    raw.relay
                        .cleanup_interval_seconds
                        .unwrap_or(DEFAULT_RELAY_CLEANUP_SECS)
                        .max(1),
                ),
                retention: Duration::from_secs(
                    raw.relay
                        .retention_seconds
                        .unwrap_or(DEFAULT_RELAY_RETENTION_SECS),
                ),
                partition_index: relay_partition_index,
                partition_count: relay_partition_count,
            },
            worker: WorkerSettings {
                max_workers,
                default_timeout: Duration::from_millis(
                    raw.worker
                        .default_timeout_ms
                        .unwrap_or(DEFAULT_WORKER_TIMEOUT_MS)
                        .max(1),
                ),
                idempotency_ttl: Duration::from_secs(
                    raw.worker
                        .idempotency_ttl_seconds
                        .unwrap_or(DEFAULT_IDEMPOTENCY_TTL_SECS)
                        .max(1),
                ),
            },
            realtime: raw.realtime,
            breaker: BreakerSettings {
                max_failures: raw
                    .breaker
                    .max_failures
                    .unwrap_or(DEFAULT_BREAKER_MAX_FAILURES)
                    .max(1),
                window: Duration::from_secs(
                    raw.breaker
                        .window_seconds
                        .unwrap_or(DEFAULT_BREAKER_WINDOW_SECS)
                        .max(1),
                ),
                reset_time: Duration::from_secs(
                    raw.breaker
                        .reset_seconds
                        .unwrap_or(DEFAULT_BREAKER_RESET_SECS)
                        .max(1),
                ),
            },
            roles: RoleSettings {
                relay: raw.roles.relay.unwrap_or(true),
                updater: raw.roles.updater.unwrap_or(true),
                processor: raw.roles.processor.unwrap_or(true),
            },
            auth_tokens: raw.auth.tokens,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings_from(raw: RawSettings) -> Settings {
        Settings::from_raw(raw).expect("settings should resolve")
    }

    #[test]
    fn defaults_resolve() {
        let settings = settings_from(RawSettings::default());
        assert_eq!(settings.server.addr.port(), DEFAULT_PUBLIC_PORT);
        assert_eq!(settings.logging.level, LevelFilter::INFO);
        assert!(matches!(settings.logging.format, LogFormat::Compact));
        assert_eq!(settings.relay.batch_size, 100);
        assert_eq!(settings.relay.poll_interval, Duration::from_secs(1));
        assert_eq!(settings.relay.retention, Duration::from_secs(7 * 24 * 3600));
        assert_eq!(settings.worker.idempotency_ttl, Duration::from_secs(24 * 3600));
        assert!(settings.roles.relay && settings.roles.updater && settings.roles.processor);
    }

    #[test]
    fn serve_overrides_take_precedence() {
        let mut raw = RawSettings::default();
        raw.apply_serve_overrides(&ServeOverrides {
            server_port: Some(8080),
            log_level: Some("debug".to_string()),
            log_json: Some(true),
            no_relay: true,
            ..Default::default()
        });

        let settings = settings_from(raw);
        assert_eq!(settings.server.addr.port(), 8080);
        assert_eq!(settings.logging.level, LevelFilter::DEBUG);
        assert!(matches!(settings.logging.format, LogFormat::Json));
        assert!(!settings.roles.relay);
        assert!(settings.roles.updater);
    }

    #[test]
    fn partition_index_must_fit_count() {
        let raw = RawSettings {
            relay: RawRelaySettings {
                partition_index: Some(3),
                partition_count: Some(2),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(matches!(
            Settings::from_raw(raw),
            Err(LoadError::Invalid { key, .. }) if key == "relay.partition_index"
        ));
    }

    #[test]
    fn bad_log_level_is_rejected() {
        let raw = RawSettings {
            logging: RawLoggingSettings {
                level: Some("loud".to_string()),
                json: None,
            },
            ..Default::default()
        };
        assert!(Settings::from_raw(raw).is_err());
    }
}
