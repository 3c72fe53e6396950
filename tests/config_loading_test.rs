/// Integration tests for configuration files: format detection, partial files
/// falling back to defaults, and conversion into server and connector settings
use sharetree::error::ConfigError;
use sharetree::{Allow, Config};
use std::fs;
use std::time::Duration;
use tempfile::TempDir;

#[test]
fn test_toml_config_file() {
	let temp_dir = TempDir::new().expect("Failed to create temp dir");
	let path = temp_dir.path().join("sharetree.toml");
	fs::write(
		&path,
		r#"
logLevel = "debug"

[server]
bind = "127.0.0.1"
port = 4044
requireLogin = true
access = ["/plant/**"]

[heartbeat]
intervalMs = 1000
maxMissed = 5

[[users]]
name = "op"
password = "secret"
allow = ["read", "write", "create"]
"#,
	)
	.unwrap();

	let config = Config::load(&path).expect("Failed to load toml config");
	assert_eq!(config.log_level, "debug");
	assert_eq!(config.bind_addr(), "127.0.0.1:4044");
	assert_eq!(config.heartbeat_interval(), Duration::from_millis(1000));
	assert!(config.validate().is_ok());
	assert_eq!(config.users[0].rights().unwrap(), Allow::READ | Allow::WRITE | Allow::CREATE);

	let session = config.session_config().unwrap();
	assert!(session.login.is_some());
	assert_eq!(session.max_missed, 5);
	// Untouched sections keep their defaults
	assert_eq!(config.client.backoff_initial_ms, 2000);
}

#[test]
fn test_json5_config_file() {
	let temp_dir = TempDir::new().expect("Failed to create temp dir");
	let path = temp_dir.path().join("client.json5");
	fs::write(
		&path,
		r#"{
	// comments are allowed
	client: {
		hosts: [
			{ host: "backup", port: 2023, priority: 5 },
			{ host: "primary", port: 2022, priority: 1 },
		],
		user: "op",
		password: "secret",
		backoffInitialMs: 100,
		backoffMaxMs: 1000,
	},
}"#,
	)
	.unwrap();

	let config = Config::load(&path).expect("Failed to load json5 config");
	let options = config.connector_options();
	assert_eq!(options.hosts.len(), 2);
	assert_eq!(options.user.as_deref(), Some("op"));
	assert_eq!(options.backoff_initial, Duration::from_millis(100));
	assert_eq!(options.backoff_max, Duration::from_millis(1000));
	assert_eq!(config.server.port, 2022);
}

#[test]
fn test_config_errors() {
	let temp_dir = TempDir::new().expect("Failed to create temp dir");

	let missing = temp_dir.path().join("missing.toml");
	assert!(matches!(Config::load(&missing), Err(ConfigError::Io { .. })));

	let broken = temp_dir.path().join("broken.json");
	fs::write(&broken, "{ server: ").unwrap();
	assert!(matches!(Config::load(&broken), Err(ConfigError::Parse { .. })));

	let unknown = temp_dir.path().join("settings.ini");
	fs::write(&unknown, "port=1").unwrap();
	assert!(matches!(Config::load(&unknown), Err(ConfigError::Parse { .. })));
}
