//! Configuration for sharetree
//!
//! The configuration follows a priority chain:
//! 1. Built-in defaults (`Config::default()`)
//! 2. Config file (`.toml`, `.json` or `.json5`)
//! 3. Environment variables (`SHARETREE_*` prefix)
//! 4. CLI flags (highest priority, applied by the binary)

use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::connector::{ConnectorOptions, HostEntry};
use crate::error::ConfigError;
use crate::logging::*;
use crate::protocol::{StaticUsers, DEFAULT_PORT};
use crate::session::SessionConfig;
use crate::types::Allow;
use crate::validation::{
	validate_access_pattern, validate_backoff, validate_heartbeat_interval, validate_max_missed,
	ValidationError,
};

// ============================================================================
// MAIN CONFIGURATION STRUCT
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
	pub server: ServerConfig,
	pub client: ClientConfig,
	pub heartbeat: HeartbeatConfig,
	/// Users accepted when the server requires login
	pub users: Vec<UserConfig>,
	/// Default log filter when `RUST_LOG` is unset
	pub log_level: String,
}

impl Default for Config {
	fn default() -> Self {
		Config {
			server: ServerConfig::default(),
			client: ClientConfig::default(),
			heartbeat: HeartbeatConfig::default(),
			users: vec![],
			log_level: "info".to_string(),
		}
	}
}

// ============================================================================
// NESTED CONFIGURATION STRUCTS
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct ServerConfig {
	pub bind: String,
	pub port: u16,
	pub require_login: bool,
	/// Glob patterns of paths sessions may touch; empty allows everything
	pub access: Vec<String>,
	/// JSON file backing Save-mode nodes
	pub storage_file: Option<PathBuf>,
}

impl Default for ServerConfig {
	fn default() -> Self {
		ServerConfig {
			bind: "0.0.0.0".to_string(),
			port: DEFAULT_PORT,
			require_login: false,
			access: vec![],
			storage_file: None,
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct ClientConfig {
	pub hosts: Vec<HostConfig>,
	pub user: Option<String>,
	pub password: Option<String>,
	pub auto_connect: bool,
	pub backoff_initial_ms: u64,
	pub backoff_max_ms: u64,
	pub connect_timeout_ms: u64,
}

impl Default for ClientConfig {
	fn default() -> Self {
		ClientConfig {
			hosts: vec![],
			user: None,
			password: None,
			auto_connect: true,
			backoff_initial_ms: 2000,
			backoff_max_ms: 30_000,
			connect_timeout_ms: 10_000,
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct HeartbeatConfig {
	pub interval_ms: u64,
	pub max_missed: u32,
}

impl Default for HeartbeatConfig {
	fn default() -> Self {
		HeartbeatConfig { interval_ms: 5000, max_missed: 3 }
	}
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct UserConfig {
	pub name: String,
	pub password: String,
	/// Right names: read, write, create, delete, mode or all
	pub allow: Vec<String>,
}

impl Default for UserConfig {
	fn default() -> Self {
		UserConfig { name: String::new(), password: String::new(), allow: vec!["all".to_string()] }
	}
}

impl UserConfig {
	pub fn rights(&self) -> Result<Allow, ConfigError> {
		self.allow.iter().try_fold(Allow::empty(), |acc, name| {
			Allow::from_right_name(name).map(|a| acc | a).ok_or_else(|| ConfigError::Invalid {
				message: format!("unknown right {:?} for user {}", name, self.name),
			})
		})
	}
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct HostConfig {
	pub host: String,
	pub port: u16,
	pub priority: i32,
}

impl Default for HostConfig {
	fn default() -> Self {
		HostConfig { host: "localhost".to_string(), port: DEFAULT_PORT, priority: 0 }
	}
}

// ============================================================================
// LOADING
// ============================================================================

impl From<ValidationError> for ConfigError {
	fn from(e: ValidationError) -> Self {
		ConfigError::Invalid { message: e.to_string() }
	}
}

impl Config {
	/// Read a config file, picking the format from its extension
	pub fn load(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
		let path = path.as_ref();
		let shown = path.display().to_string();
		let text = std::fs::read_to_string(path)
			.map_err(|e| ConfigError::Io { path: shown.clone(), source: e })?;
		let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("").to_ascii_lowercase();
		let config = match ext.as_str() {
			"toml" => toml::from_str::<Config>(&text)
				.map_err(|e| ConfigError::Parse { path: shown.clone(), message: e.to_string() })?,
			"json" | "json5" => json5::from_str::<Config>(&text)
				.map_err(|e| ConfigError::Parse { path: shown.clone(), message: e.to_string() })?,
			other => {
				return Err(ConfigError::Parse {
					path: shown,
					message: format!("unsupported config format {:?}", other),
				})
			}
		};
		debug!("Loaded configuration from {}", shown);
		Ok(config)
	}

	/// Override settings from `SHARETREE_PORT`, `SHARETREE_BIND` and `SHARETREE_LOG`
	pub fn apply_env(&mut self) {
		self.apply_vars(|name| std::env::var(name).ok());
	}

	fn apply_vars(&mut self, var: impl Fn(&str) -> Option<String>) {
		if let Some(port) = var("SHARETREE_PORT") {
			match port.parse() {
				Ok(port) => self.server.port = port,
				Err(_) => warn!("Ignoring invalid SHARETREE_PORT {:?}", port),
			}
		}
		if let Some(bind) = var("SHARETREE_BIND") {
			self.server.bind = bind;
		}
		if let Some(level) = var("SHARETREE_LOG") {
			self.log_level = level;
		}
	}

	pub fn validate(&self) -> Result<(), ConfigError> {
		validate_heartbeat_interval(self.heartbeat.interval_ms)?;
		validate_max_missed(self.heartbeat.max_missed)?;
		validate_backoff(self.client.backoff_initial_ms, self.client.backoff_max_ms)?;
		for pattern in &self.server.access {
			validate_access_pattern(pattern)?;
		}
		for user in &self.users {
			user.rights()?;
		}
		if self.server.require_login && self.users.is_empty() {
			return Err(ConfigError::Invalid { message: "login required but no users configured".to_string() });
		}
		Ok(())
	}

	/// Listen address of the server
	pub fn bind_addr(&self) -> String {
		format!("{}:{}", self.server.bind, self.server.port)
	}

	pub fn heartbeat_interval(&self) -> Duration {
		Duration::from_millis(self.heartbeat.interval_ms)
	}

	fn access_set(&self) -> Result<Option<GlobSet>, ConfigError> {
		if self.server.access.is_empty() {
			return Ok(None);
		}
		let mut builder = GlobSetBuilder::new();
		for pattern in &self.server.access {
			let glob = Glob::new(pattern).map_err(|e| ConfigError::Invalid {
				message: format!("bad access pattern {:?}: {}", pattern, e),
			})?;
			builder.add(glob);
		}
		builder
			.build()
			.map(Some)
			.map_err(|e| ConfigError::Invalid { message: e.to_string() })
	}

	/// Session policy for a server built from this configuration
	pub fn session_config(&self) -> Result<SessionConfig, ConfigError> {
		let login = if self.server.require_login {
			let mut users = StaticUsers::new();
			for user in &self.users {
				users.add(&user.name, &user.password, user.rights()?);
			}
			Some(Arc::new(users) as Arc<dyn crate::protocol::LoginCheck>)
		} else {
			None
		};
		Ok(SessionConfig {
			login,
			anonymous_allow: Allow::all(),
			access: self.access_set()?,
			heartbeat_interval: self.heartbeat_interval(),
			max_missed: self.heartbeat.max_missed,
		})
	}

	/// Connector options built from the client section
	pub fn connector_options(&self) -> ConnectorOptions {
		ConnectorOptions {
			hosts: self
				.client
				.hosts
				.iter()
				.map(|h| HostEntry { host: h.host.clone(), port: h.port, priority: h.priority })
				.collect(),
			user: self.client.user.clone(),
			password: self.client.password.clone(),
			auto_connect: self.client.auto_connect,
			heartbeat_interval: self.heartbeat_interval(),
			max_missed: self.heartbeat.max_missed,
			backoff_initial: Duration::from_millis(self.client.backoff_initial_ms),
			backoff_max: Duration::from_millis(self.client.backoff_max_ms),
			connect_timeout: Duration::from_millis(self.client.connect_timeout_ms),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::collections::HashMap;

	#[test]
	fn test_config_default() {
		let config = Config::default();
		assert_eq!(config.server.port, 2022);
		assert_eq!(config.server.bind, "0.0.0.0");
		assert_eq!(config.heartbeat.interval_ms, 5000);
		assert_eq!(config.heartbeat.max_missed, 3);
		assert_eq!(config.client.backoff_initial_ms, 2000);
		assert_eq!(config.client.backoff_max_ms, 30_000);
		assert_eq!(config.log_level, "info");
		assert!(config.validate().is_ok());
	}

	#[test]
	fn test_config_serialization() {
		let config = Config::default();
		let json = serde_json::to_string(&config).expect("Failed to serialize");
		assert!(json.contains("\"requireLogin\""));
		let deserialized: Config = serde_json::from_str(&json).expect("Failed to deserialize");
		assert_eq!(deserialized, config);
	}

	#[test]
	fn test_env_overrides() {
		let vars: HashMap<&str, &str> =
			[("SHARETREE_PORT", "3033"), ("SHARETREE_BIND", "127.0.0.1"), ("SHARETREE_LOG", "debug")]
				.into_iter()
				.collect();
		let mut config = Config::default();
		config.apply_vars(|name| vars.get(name).map(|v| v.to_string()));
		assert_eq!(config.bind_addr(), "127.0.0.1:3033");
		assert_eq!(config.log_level, "debug");

		let mut config = Config::default();
		config.apply_vars(|name| (name == "SHARETREE_PORT").then(|| "nope".to_string()));
		assert_eq!(config.server.port, 2022);
	}

	#[test]
	fn test_validate_rejects_bad_values() {
		let mut config = Config::default();
		config.heartbeat.max_missed = 0;
		assert!(config.validate().is_err());

		let mut config = Config::default();
		config.client.backoff_max_ms = 100;
		assert!(config.validate().is_err());

		let mut config = Config::default();
		config.server.require_login = true;
		assert!(config.validate().is_err());

		let mut config = Config::default();
		config.users.push(UserConfig { name: "op".into(), password: "pw".into(), allow: vec!["fly".into()] });
		assert!(config.validate().is_err());
	}

	#[test]
	fn test_session_config_from_users() {
		let mut config = Config::default();
		config.server.require_login = true;
		config.server.access = vec!["/plant/**".into()];
		config.users.push(UserConfig {
			name: "op".into(),
			password: "pw".into(),
			allow: vec!["read".into(), "write".into()],
		});
		let session = config.session_config().unwrap();
		assert!(session.login.is_some());
		let access = session.access.unwrap();
		assert!(access.is_match("/plant/a/b"));
		assert!(!access.is_match("/other"));
		assert_eq!(config.users[0].rights().unwrap(), Allow::READ | Allow::WRITE);
	}
}

// vim: ts=4
