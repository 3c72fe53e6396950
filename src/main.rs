use clap::{Arg, ArgAction, ArgMatches, Command};
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use sharetree::config::HostConfig;
use sharetree::logging::*;
use sharetree::protocol::DEFAULT_PORT;
use sharetree::tree::ChannelSink;
use sharetree::{
	Config, ConnectState, Connector, Directory, EventKind, HostEntry, JsonFileStorage, Server, SyncMode,
	Value,
};

///////////////////////
// Utility functions //
///////////////////////

/// Build the effective configuration: defaults, file, environment, CLI flags
fn load_config(matches: &ArgMatches) -> Result<Config, Box<dyn Error>> {
	let mut config = match matches.get_one::<String>("config") {
		Some(path) => Config::load(path)?,
		None => Config::default(),
	};
	config.apply_env();
	if let Some(level) = matches.get_one::<String>("log") {
		config.log_level = level.clone();
	}
	if let Some(host) = matches.get_one::<String>("host") {
		config.client.hosts = vec![parse_host(host)?];
	}
	Ok(config)
}

/// Parse `host` or `host:port`
fn parse_host(spec: &str) -> Result<HostConfig, Box<dyn Error>> {
	let (host, port) = match spec.rsplit_once(':') {
		Some((host, port)) => {
			(host, port.parse::<u16>().map_err(|_| format!("Invalid port in {:?}", spec))?)
		}
		None => (spec, DEFAULT_PORT),
	};
	Ok(HostConfig { host: host.to_string(), port, priority: 0 })
}

/// Interpret a command-line value as JSON, falling back to a plain string
fn parse_value(text: &str) -> Value {
	serde_json::from_str::<serde_json::Value>(text).map(Value::from).unwrap_or_else(|_| Value::from(text))
}

/// Start a connector and wait until it is usable
async fn connect(dir: &Directory, config: &Config) -> Result<Connector, Box<dyn Error>> {
	let mut options = config.connector_options();
	if options.hosts.is_empty() {
		options.hosts.push(HostEntry { host: "localhost".to_string(), port: DEFAULT_PORT, priority: 0 });
	}
	let deadline = options.connect_timeout + Duration::from_secs(1);
	let connector = Connector::start(dir, options);
	tokio::time::timeout(deadline, connector.wait_for_state(ConnectState::Connected))
		.await
		.map_err(|_| "Could not connect to server")?;
	Ok(connector)
}

//////////////////
// Subcommands  //
//////////////////

async fn serve(config: Config, matches: &ArgMatches) -> Result<(), Box<dyn Error>> {
	let mut config = config;
	if let Some(port) = matches.get_one::<u16>("port") {
		config.server.port = *port;
	}
	if let Some(bind) = matches.get_one::<String>("bind") {
		config.server.bind = bind.clone();
	}
	if let Some(file) = matches.get_one::<String>("storage") {
		config.server.storage_file = Some(file.into());
	}
	config.validate()?;

	let dir = match &config.server.storage_file {
		Some(file) => {
			let storage = Arc::new(JsonFileStorage::open(file)?);
			info!("Persisting saved nodes to {}", storage.path().display());
			Directory::with_storage(storage)?
		}
		None => Directory::new(),
	};
	let server = Server::bind(&dir, config.bind_addr(), config.session_config()?).await?;
	let shutdown = server.shutdown_handle();
	tokio::spawn(async move {
		if tokio::signal::ctrl_c().await.is_ok() {
			info!("Interrupted, shutting down");
			shutdown.shutdown();
		}
	});
	server.run().await?;
	Ok(())
}

async fn watch(connector: &Connector, dir: &Directory, remote: &str) -> Result<(), Box<dyn Error>> {
	let remote = if remote.ends_with('/') { remote.to_string() } else { format!("{}/", remote) };
	let local = "/watch/";
	let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
	let folder = dir.resolve(local, true)?;
	dir.subscribe(&folder, Arc::new(ChannelSink::new(tx)), true)?;
	connector.mount(local, &remote, SyncMode::MONITOR)?;

	loop {
		tokio::select! {
			event = rx.recv() => {
				let Some(event) = event else { break };
				let shown = event.path.strip_prefix(local).map(|p| format!("{}{}", remote, p));
				let path = shown.unwrap_or_else(|| event.path.to_string());
				match event.kind {
					EventKind::ValueChanged { value, .. } => println!("{} = {}", path, value),
					EventKind::Retired => println!("{} retired", path),
					EventKind::ModeChanged { mode } => println!("{} mode {}", path, mode.to_mode_string()),
					_ => {}
				}
			}
			_ = tokio::signal::ctrl_c() => break,
		}
	}
	connector.close();
	Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
	let matches = Command::new("sharetree")
		.version(env!("CARGO_PKG_VERSION"))
		.author("Szilard Hajba <szilu@symbion.hu>")
		.about("Distributed shared data tree")
		.subcommand_required(true)
		.arg(Arg::new("config").short('c').long("config").value_name("FILE").help("Config file"))
		.arg(Arg::new("log").long("log").value_name("LEVEL").help("Log level").global(true))
		.arg(
			Arg::new("host")
				.short('H')
				.long("host")
				.value_name("HOST[:PORT]")
				.help("Server to talk to")
				.global(true),
		)
		.subcommand(
			Command::new("serve")
				.about("Serve a tree over TCP")
				.arg(
					Arg::new("port")
						.short('p')
						.long("port")
						.value_parser(clap::value_parser!(u16))
						.help("Listen port"),
				)
				.arg(Arg::new("bind").short('b').long("bind").help("Listen address"))
				.arg(Arg::new("storage").short('s').long("storage").value_name("FILE").help("Saved node file")),
		)
		.subcommand(Command::new("get").about("Read a remote value").arg(Arg::new("path").required(true)))
		.subcommand(
			Command::new("set")
				.about("Write a remote value")
				.arg(Arg::new("path").required(true))
				.arg(Arg::new("value").required(true).action(ArgAction::Set)),
		)
		.subcommand(Command::new("ls").about("List a remote folder").arg(Arg::new("path").default_value("/")))
		.subcommand(Command::new("version").about("Show the server version"))
		.subcommand(Command::new("watch").about("Print changes below a remote folder").arg(Arg::new("path").default_value("/")))
		.get_matches();

	let config = load_config(&matches)?;
	init_tracing(&config.log_level);

	if let Some(sub) = matches.subcommand_matches("serve") {
		return serve(config, sub).await;
	}

	let dir = Directory::new();
	let connector = connect(&dir, &config).await?;
	match matches.subcommand() {
		Some(("get", sub)) => {
			let path = sub.get_one::<String>("path").ok_or("get: path argument required")?;
			println!("{}", connector.get(path).await?);
		}
		Some(("set", sub)) => {
			let path = sub.get_one::<String>("path").ok_or("set: path argument required")?;
			let value = sub.get_one::<String>("value").ok_or("set: value argument required")?;
			connector.set(path, parse_value(value)).await?;
		}
		Some(("ls", sub)) => {
			let path = sub.get_one::<String>("path").ok_or("ls: path argument required")?;
			for item in connector.ls(path).await? {
				println!("{}", item);
			}
		}
		Some(("version", _)) => println!("{}", connector.version().await?),
		Some(("watch", sub)) => {
			let path = sub.get_one::<String>("path").ok_or("watch: path argument required")?;
			watch(&connector, &dir, path).await?;
		}
		_ => {}
	}
	connector.close();
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_host_flag_overrides_config_hosts() {
		let matches = Command::new("sharetree")
			.arg(Arg::new("config").long("config"))
			.arg(Arg::new("log").long("log"))
			.arg(Arg::new("host").long("host"))
			.get_matches_from(["sharetree", "--host", "plant.local:3033"]);
		let config = load_config(&matches).unwrap();
		assert_eq!(config.client.hosts, vec![HostConfig { host: "plant.local".into(), port: 3033, priority: 0 }]);

		assert_eq!(parse_host("plant.local").unwrap().port, DEFAULT_PORT);
		assert!(parse_host("plant.local:port").is_err());
	}
}

// vim: ts=4
