#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use chatline_util::secret::SecretString;
use serde::Deserialize;
use tracing::info;

/// Default config path: `~/.chatline/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".chatline").join("config.toml"))
}

/// Load the server config from TOML and env overrides.
#[allow(dead_code)]
pub fn load_server_config() -> anyhow::Result<ServerConfig> {
	let path = default_config_path()?;
	load_server_config_from_path(&path)
}

/// Same as `load_server_config` but with an explicit config path.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg)?;
	apply_env_overrides(&mut cfg)?;

	Ok(cfg)
}

/// Server config (v1). The JWT secret has no default: its absence is a startup failure, not a
/// lazily-discovered runtime error (§9 open question resolution).
#[derive(Debug, Clone)]
pub struct ServerConfig {
	pub bind: String,
	pub metrics_bind: Option<String>,
	pub health_bind: Option<String>,
	pub default_room: String,

	pub auth: AuthSettings,
	pub redis: RedisSettings,
	pub persistence: PersistenceSettings,
	pub hub: HubSettings,
}

#[derive(Debug, Clone)]
pub struct AuthSettings {
	pub jwt_secret: SecretString,
	pub token_ttl: Duration,
}

#[derive(Debug, Clone)]
pub struct RedisSettings {
	pub url: String,
}

#[derive(Debug, Clone)]
pub struct PersistenceSettings {
	pub database_url: String,
	pub history_limit: i64,
}

/// Timing constants and the outbound queue capacity (§6, tunable, defaults normative).
#[derive(Debug, Clone)]
pub struct HubSettings {
	pub write_wait: Duration,
	pub pong_wait: Duration,
	pub ping_period: Duration,
	pub presence_ttl: Duration,
	pub outbound_queue_capacity: usize,
	pub command_rate_limit_per_conn_burst: u32,
	pub command_rate_limit_per_conn_per_minute: u32,
}

impl Default for HubSettings {
	fn default() -> Self {
		Self {
			write_wait: Duration::from_secs(10),
			pong_wait: Duration::from_secs(25),
			ping_period: Duration::from_secs(10),
			presence_ttl: Duration::from_secs(30),
			outbound_queue_capacity: 256,
			command_rate_limit_per_conn_burst: 20,
			command_rate_limit_per_conn_per_minute: 600,
		}
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	bind: Option<String>,
	metrics_bind: Option<String>,
	health_bind: Option<String>,
	default_room: Option<String>,

	#[serde(default)]
	auth: FileAuthSettings,
	#[serde(default)]
	redis: FileRedisSettings,
	#[serde(default)]
	persistence: FilePersistenceSettings,
	#[serde(default)]
	hub: FileHubSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileAuthSettings {
	jwt_secret: Option<String>,
	token_ttl_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileRedisSettings {
	url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FilePersistenceSettings {
	database_url: Option<String>,
	history_limit: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileHubSettings {
	write_wait_secs: Option<u64>,
	pong_wait_secs: Option<u64>,
	ping_period_secs: Option<u64>,
	presence_ttl_secs: Option<u64>,
	outbound_queue_capacity: Option<usize>,
	command_rate_limit_per_conn_burst: Option<u32>,
	command_rate_limit_per_conn_per_minute: Option<u32>,
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> anyhow::Result<Self> {
		let defaults = HubSettings::default();

		Ok(Self {
			bind: file.bind.filter(|s| !s.trim().is_empty()).unwrap_or_else(|| "0.0.0.0:8080".to_string()),
			metrics_bind: file.metrics_bind.filter(|s| !s.trim().is_empty()),
			health_bind: file.health_bind.filter(|s| !s.trim().is_empty()),
			default_room: file
				.default_room
				.filter(|s| !s.trim().is_empty())
				.unwrap_or_else(|| chatline_domain::DEFAULT_ROOM_ID.to_string()),
			auth: AuthSettings {
				jwt_secret: file
					.auth
					.jwt_secret
					.filter(|s| !s.trim().is_empty())
					.map(SecretString::new)
					.unwrap_or_else(|| SecretString::new(String::new())),
				token_ttl: Duration::from_secs(file.auth.token_ttl_secs.unwrap_or(24 * 60 * 60)),
			},
			redis: RedisSettings {
				url: file.redis.url.filter(|s| !s.trim().is_empty()).unwrap_or_else(|| "redis://127.0.0.1/".to_string()),
			},
			persistence: PersistenceSettings {
				database_url: file
					.persistence
					.database_url
					.filter(|s| !s.trim().is_empty())
					.unwrap_or_else(|| "sqlite://chatline.db".to_string()),
				history_limit: file.persistence.history_limit.filter(|v| *v > 0).unwrap_or(50),
			},
			hub: HubSettings {
				write_wait: file.hub.write_wait_secs.map(Duration::from_secs).unwrap_or(defaults.write_wait),
				pong_wait: file.hub.pong_wait_secs.map(Duration::from_secs).unwrap_or(defaults.pong_wait),
				ping_period: file.hub.ping_period_secs.map(Duration::from_secs).unwrap_or(defaults.ping_period),
				presence_ttl: file.hub.presence_ttl_secs.map(Duration::from_secs).unwrap_or(defaults.presence_ttl),
				outbound_queue_capacity: file.hub.outbound_queue_capacity.unwrap_or(defaults.outbound_queue_capacity),
				command_rate_limit_per_conn_burst: file
					.hub
					.command_rate_limit_per_conn_burst
					.unwrap_or(defaults.command_rate_limit_per_conn_burst),
				command_rate_limit_per_conn_per_minute: file
					.hub
					.command_rate_limit_per_conn_per_minute
					.unwrap_or(defaults.command_rate_limit_per_conn_per_minute),
			},
		})
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn apply_env_overrides(cfg: &mut ServerConfig) -> anyhow::Result<()> {
	if let Ok(v) = std::env::var("CHATLINE_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.bind = v;
			info!("server config: bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("CHATLINE_METRICS_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.metrics_bind = Some(v);
			info!("server config: metrics_bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("CHATLINE_HEALTH_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.health_bind = Some(v);
			info!("server config: health_bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("CHATLINE_DEFAULT_ROOM") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.default_room = v;
			info!("server config: default_room overridden by env");
		}
	}

	if let Ok(v) = std::env::var("CHATLINE_AUTH_JWT_SECRET") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.auth.jwt_secret = SecretString::new(v);
			info!("auth config: jwt_secret overridden by env");
		}
	}

	if let Ok(v) = std::env::var("CHATLINE_AUTH_TOKEN_TTL_SECS")
		&& let Ok(secs) = v.trim().parse::<u64>()
	{
		cfg.auth.token_ttl = Duration::from_secs(secs);
		info!(secs, "auth config: token_ttl overridden by env");
	}

	if let Ok(v) = std::env::var("CHATLINE_REDIS_URL") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.redis.url = v;
			info!("redis config: url overridden by env");
		}
	}

	if let Ok(v) = std::env::var("CHATLINE_DATABASE_URL") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.persistence.database_url = v;
			info!("persistence config: database_url overridden by env");
		}
	}

	if let Ok(v) = std::env::var("CHATLINE_HISTORY_LIMIT")
		&& let Ok(limit) = v.trim().parse::<i64>()
		&& limit > 0
	{
		cfg.persistence.history_limit = limit;
		info!(limit, "persistence config: history_limit overridden by env");
	}

	if let Ok(v) = std::env::var("CHATLINE_OUTBOUND_QUEUE_CAPACITY")
		&& let Ok(capacity) = v.trim().parse::<usize>()
	{
		cfg.hub.outbound_queue_capacity = capacity;
		info!(capacity, "hub config: outbound_queue_capacity overridden by env");
	}

	if let Ok(v) = std::env::var("CHATLINE_COMMAND_RATE_LIMIT_PER_CONN_BURST")
		&& let Ok(burst) = v.trim().parse::<u32>()
	{
		cfg.hub.command_rate_limit_per_conn_burst = burst;
		info!(burst, "hub config: command_rate_limit_per_conn_burst overridden by env");
	}

	if let Ok(v) = std::env::var("CHATLINE_COMMAND_RATE_LIMIT_PER_CONN_PER_MINUTE")
		&& let Ok(rate) = v.trim().parse::<u32>()
	{
		cfg.hub.command_rate_limit_per_conn_per_minute = rate;
		info!(rate, "hub config: command_rate_limit_per_conn_per_minute overridden by env");
	}

	// The JWT secret is the one field whose absence must abort startup rather than silently run
	// with an empty/guessable key (§9 open question resolution).
	if cfg.auth.jwt_secret.expose().is_empty() {
		return Err(anyhow!(
			"no JWT secret configured: set CHATLINE_AUTH_JWT_SECRET or auth.jwt_secret in the config file"
		));
	}

	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn defaults_apply_when_file_absent() {
		// SAFETY-free in single-threaded test context: `env::remove_var` is safe here, no other
		// thread in this process reads these vars concurrently.
		unsafe {
			std::env::remove_var("CHATLINE_BIND");
			std::env::set_var("CHATLINE_AUTH_JWT_SECRET", "test-secret");
		}

		let tmp = std::env::temp_dir().join(format!("chatline-cfg-test-{}", std::process::id()));
		let cfg = load_server_config_from_path(&tmp).unwrap();

		assert_eq!(cfg.bind, "0.0.0.0:8080");
		assert_eq!(cfg.default_room, "general");
		assert_eq!(cfg.hub.outbound_queue_capacity, 256);
		assert_eq!(cfg.persistence.history_limit, 50);
		assert_eq!(cfg.auth.jwt_secret.expose(), "test-secret");

		unsafe {
			std::env::remove_var("CHATLINE_AUTH_JWT_SECRET");
		}
	}

	#[test]
	fn missing_jwt_secret_is_a_startup_error() {
		unsafe {
			std::env::remove_var("CHATLINE_AUTH_JWT_SECRET");
		}
		let tmp = std::env::temp_dir().join(format!("chatline-cfg-test-nosecret-{}", std::process::id()));
		assert!(load_server_config_from_path(&tmp).is_err());
	}
}
