//! Client-side connection keeping local mounts in sync with a remote server
//!
//! A [`Connector`] owns a background task that connects to the configured hosts in
//! priority order, logs in, subscribes every mounted subtree and then mirrors changes
//! in both directions until the connection drops. With `auto_connect` it retries
//! with exponential backoff; each reconnect resubscribes every mount so the remote
//! state is replayed.
//!
//! State flow: `Disconnected` -> `Connecting` -> `LoggingIn` -> `Synchronizing`
//! -> `Connected` -> `Disconnected`.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};

use crate::error::{ConnectionError, ErrorCode, TreeError};
use crate::flux::FluxQueue;
use crate::logging::*;
use crate::protocol::{
	make_salt, password_hash, LoginRequest, LoginStatus, Record, RecordReader, RecordWriter, Reply,
};
use crate::tree::{ChannelSink, Directory, EventKind, EventSink, Node, SubscriptionId, TreeEvent};
use crate::types::{ModeFlags, NodeKind, SameValue, SyncMode, Value, WriterId};
use crate::validation::{is_below, is_provider_name, rebase};

/// Connection state published by a [`Connector`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectState {
	Disconnected,
	Connecting,
	LoggingIn,
	Synchronizing,
	Connected,
}

/// Notifications broadcast by a [`Connector`]
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectorEvent {
	StateChanged(ConnectState),
	/// Every host was tried once without success
	TriedAll,
	/// Local and remote values differed on first sync; the remote one was kept
	Divergence { path: String, local: Value, remote: Value },
	/// Server reported an error record
	RemoteError { code: ErrorCode, path: Option<String>, message: String },
	/// Server rejected the credentials; the connector stops
	LoginBad,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostEntry {
	pub host: String,
	pub port: u16,
	/// Lower values are tried first
	pub priority: i32,
}

#[derive(Debug, Clone)]
pub struct ConnectorOptions {
	pub hosts: Vec<HostEntry>,
	pub user: Option<String>,
	pub password: Option<String>,
	pub auto_connect: bool,
	pub heartbeat_interval: Duration,
	pub max_missed: u32,
	pub backoff_initial: Duration,
	pub backoff_max: Duration,
	pub connect_timeout: Duration,
}

impl Default for ConnectorOptions {
	fn default() -> Self {
		ConnectorOptions {
			hosts: Vec::new(),
			user: None,
			password: None,
			auto_connect: true,
			heartbeat_interval: Duration::from_secs(5),
			max_missed: 3,
			backoff_initial: Duration::from_secs(2),
			backoff_max: Duration::from_secs(30),
			connect_timeout: Duration::from_secs(10),
		}
	}
}

/// A local folder mirrored to a remote folder
struct MountPoint {
	local: String,
	remote: String,
	sync_mode: SyncMode,
	node: Arc<Node>,
	subscription: SubscriptionId,
}

enum Request {
	Get(String),
	Set(String, Value),
	Ls(String),
	Version,
}

impl Request {
	fn into_record(self, rid: u64) -> Record {
		match self {
			Request::Get(path) => Record::Get { rid, path },
			Request::Set(path, value) => Record::Set { rid, path, value },
			Request::Ls(path) => Record::Ls { rid, path },
			Request::Version => Record::Version { rid },
		}
	}
}

type ReplyTx = oneshot::Sender<Result<Reply, ConnectionError>>;

enum Command {
	Mount(MountPoint),
	AddHost(HostEntry),
	Request(Request, ReplyTx),
	Close,
}

struct Shared {
	dir: Directory,
	writer: WriterId,
	sink: Arc<dyn EventSink>,
	commands: mpsc::UnboundedSender<Command>,
	state: watch::Receiver<ConnectState>,
	events: broadcast::Sender<ConnectorEvent>,
	service: Mutex<Option<String>>,
	request_timeout: Duration,
}

/// Handle to a running client connection
#[derive(Clone)]
pub struct Connector {
	inner: Arc<Shared>,
}

impl Connector {
	/// Spawn the connection task on the current tokio runtime
	pub fn start(dir: &Directory, options: ConnectorOptions) -> Connector {
		let (commands_tx, commands_rx) = mpsc::unbounded_channel();
		let (local_tx, local_rx) = mpsc::unbounded_channel();
		let (state_tx, state_rx) = watch::channel(ConnectState::Disconnected);
		let (events_tx, _) = broadcast::channel(64);
		let writer = dir.next_writer_id();

		let mut hosts = options.hosts.clone();
		hosts.sort_by_key(|h| h.priority);
		let request_timeout = options.connect_timeout;
		let worker = Worker {
			dir: dir.clone(),
			writer,
			options,
			hosts,
			mounts: Vec::new(),
			commands: commands_rx,
			local: local_rx,
			state: state_tx,
			events: events_tx.clone(),
			closing: false,
			established: false,
			known: HashMap::new(),
		};
		tokio::spawn(worker.run());

		Connector {
			inner: Arc::new(Shared {
				dir: dir.clone(),
				writer,
				sink: Arc::new(ChannelSink::new(local_tx)),
				commands: commands_tx,
				state: state_rx,
				events: events_tx,
				service: Mutex::new(None),
				request_timeout,
			}),
		}
	}

	/// Mirror the local folder `local` to the remote folder `remote`
	pub fn mount(&self, local: &str, remote: &str, sync_mode: SyncMode) -> Result<(), TreeError> {
		for path in [local, remote] {
			if !path.ends_with('/') {
				return Err(TreeError::FolderNotOpen { path: path.to_string() });
			}
		}
		let dir = &self.inner.dir;
		let node = dir.acquire(local, true, self.inner.writer)?;
		let subscription = match dir.subscribe(&node, self.inner.sink.clone(), true) {
			Ok(id) => id,
			Err(e) => {
				dir.release(&node, self.inner.writer);
				return Err(e);
			}
		};
		let mount = MountPoint {
			local: local.to_string(),
			remote: remote.to_string(),
			sync_mode,
			node: node.clone(),
			subscription,
		};
		if self.inner.commands.send(Command::Mount(mount)).is_err() {
			dir.unsubscribe(&node, subscription);
			dir.release(&node, self.inner.writer);
			return Err(TreeError::NotOpen);
		}
		info!("Mounted {} on remote {}", local, remote);
		Ok(())
	}

	/// Add a host, typically one resolved by an external discovery service
	pub fn add_host(&self, host: &str, port: u16, priority: i32) {
		let entry = HostEntry { host: host.to_string(), port, priority };
		let _ = self.inner.commands.send(Command::AddHost(entry));
	}

	pub fn set_service(&self, name: &str) {
		*self.inner.service.lock().unwrap_or_else(PoisonError::into_inner) = Some(name.to_string());
	}

	pub fn service(&self) -> Option<String> {
		self.inner.service.lock().unwrap_or_else(PoisonError::into_inner).clone()
	}

	pub fn state(&self) -> ConnectState {
		*self.inner.state.borrow()
	}

	pub fn state_watch(&self) -> watch::Receiver<ConnectState> {
		self.inner.state.clone()
	}

	/// Resolve once the connector reaches `state`
	pub async fn wait_for_state(&self, state: ConnectState) {
		let mut rx = self.inner.state.clone();
		let _ = rx.wait_for(|s| *s == state).await;
	}

	pub fn events(&self) -> broadcast::Receiver<ConnectorEvent> {
		self.inner.events.subscribe()
	}

	/// Writer id stamped on everything the connector applies locally
	pub fn writer_id(&self) -> WriterId {
		self.inner.writer
	}

	/// Read a remote value
	pub async fn get(&self, path: &str) -> Result<Value, ConnectionError> {
		let reply = self.request(Request::Get(path.to_string())).await?;
		reply.value.ok_or_else(|| ConnectionError::Remote {
			code: ErrorCode::ItemNotSet,
			message: path.to_string(),
		})
	}

	/// Write a remote value without subscribing to it
	pub async fn set(&self, path: &str, value: Value) -> Result<(), ConnectionError> {
		self.request(Request::Set(path.to_string(), value)).await.map(|_| ())
	}

	/// List a remote folder; folder names carry a trailing `/`
	pub async fn ls(&self, path: &str) -> Result<Vec<String>, ConnectionError> {
		self.request(Request::Ls(path.to_string())).await.map(|r| r.items)
	}

	pub async fn version(&self) -> Result<String, ConnectionError> {
		let reply = self.request(Request::Version).await?;
		Ok(reply.version.unwrap_or_default())
	}

	async fn request(&self, request: Request) -> Result<Reply, ConnectionError> {
		if self.state() != ConnectState::Connected {
			return Err(ConnectionError::Disconnected);
		}
		let (tx, rx) = oneshot::channel();
		self.inner
			.commands
			.send(Command::Request(request, tx))
			.map_err(|_| ConnectionError::Disconnected)?;
		let reply = tokio::time::timeout(self.inner.request_timeout, rx)
			.await
			.map_err(|_| ConnectionError::Timeout)?
			.map_err(|_| ConnectionError::Disconnected)??;
		if reply.code.is_ok() {
			Ok(reply)
		} else {
			Err(ConnectionError::Remote { code: reply.code, message: reply.message.unwrap_or_default() })
		}
	}

	/// Say goodbye to the server and stop reconnecting
	pub fn close(&self) {
		let _ = self.inner.commands.send(Command::Close);
	}
}

// ===========================================================================
// Connection task
// ===========================================================================

/// Per-connection state, dropped on disconnect
struct Link {
	reader: RecordReader<OwnedReadHalf>,
	writer: RecordWriter<OwnedWriteHalf>,
	flux: FluxQueue,
	pending: HashMap<u64, ReplyTx>,
	next_rid: u64,
	/// Remote paths subscribed on this connection
	synced: HashSet<String>,
	/// Remote paths whose value was received at least once on this connection
	seen: HashSet<String>,
}

impl Link {
	async fn flush(&mut self) -> Result<(), ConnectionError> {
		if self.flux.is_empty() {
			return Ok(());
		}
		while let Some(record) = self.flux.pop() {
			debug!("Connector -> {}", record.cmd());
			self.writer.send(&record).await?;
		}
		self.writer.flush().await?;
		Ok(())
	}
}

enum Step {
	Record(Result<Option<Record>, crate::protocol::ProtocolError>),
	Local(Option<TreeEvent>),
	Command(Option<Command>),
	Heartbeat,
}

struct Worker {
	dir: Directory,
	writer: WriterId,
	options: ConnectorOptions,
	hosts: Vec<HostEntry>,
	mounts: Vec<MountPoint>,
	commands: mpsc::UnboundedReceiver<Command>,
	local: mpsc::UnboundedReceiver<TreeEvent>,
	state: watch::Sender<ConnectState>,
	events: broadcast::Sender<ConnectorEvent>,
	closing: bool,
	/// Set once a connection reached `Connected`
	established: bool,
	/// Last value exchanged with the server per remote path, kept across connections
	known: HashMap<String, Value>,
}

impl Worker {
	async fn run(mut self) {
		let mut backoff = self.options.backoff_initial;
		let mut next_host = 0usize;

		while !self.closing {
			if self.hosts.is_empty() {
				match self.commands.recv().await {
					Some(command) => self.command_offline(command),
					None => break,
				}
				continue;
			}

			let host = self.hosts[next_host % self.hosts.len()].clone();
			next_host += 1;
			self.established = false;
			let outcome = self.connect_and_serve(&host).await;
			self.set_state(ConnectState::Disconnected);

			match outcome {
				Ok(()) => info!("Connection to {}:{} closed", host.host, host.port),
				Err(ConnectionError::LoginBad) => {
					error!("Login to {}:{} rejected, giving up", host.host, host.port);
					self.emit(ConnectorEvent::LoginBad);
					break;
				}
				Err(e) => warn!("Connection to {}:{} failed: {}", host.host, host.port, e),
			}
			if self.established {
				backoff = self.options.backoff_initial;
				next_host = 0;
			} else if next_host >= self.hosts.len() {
				next_host = 0;
				self.emit(ConnectorEvent::TriedAll);
			}
			if self.closing || !self.options.auto_connect {
				break;
			}

			debug!("Reconnecting in {:?}", backoff);
			self.pause(backoff).await;
			backoff = (backoff * 2).min(self.options.backoff_max);
		}

		self.set_state(ConnectState::Disconnected);
		for mount in self.mounts.drain(..) {
			self.dir.unsubscribe(&mount.node, mount.subscription);
			self.dir.release(&mount.node, self.writer);
		}
		debug!("Connector stopped");
	}

	fn set_state(&self, state: ConnectState) {
		let previous = self.state.send_replace(state);
		if previous != state {
			debug!("Connector state {:?} -> {:?}", previous, state);
			self.emit(ConnectorEvent::StateChanged(state));
		}
	}

	fn emit(&self, event: ConnectorEvent) {
		let _ = self.events.send(event);
	}

	/// Wait out a backoff delay while still serving commands
	async fn pause(&mut self, delay: Duration) {
		let sleep = tokio::time::sleep(delay);
		tokio::pin!(sleep);
		loop {
			tokio::select! {
				_ = &mut sleep => return,
				command = self.commands.recv() => match command {
					Some(command) => {
						self.command_offline(command);
						if self.closing {
							return;
						}
					}
					None => {
						self.closing = true;
						return;
					}
				},
			}
		}
	}

	fn command_offline(&mut self, command: Command) {
		match command {
			Command::Mount(mount) => self.mounts.push(mount),
			Command::AddHost(host) => self.add_host(host),
			Command::Request(_, reply) => {
				let _ = reply.send(Err(ConnectionError::Disconnected));
			}
			Command::Close => self.closing = true,
		}
	}

	fn add_host(&mut self, host: HostEntry) {
		if !self.hosts.contains(&host) {
			self.hosts.push(host);
			self.hosts.sort_by_key(|h| h.priority);
		}
	}

	async fn connect_and_serve(&mut self, host: &HostEntry) -> Result<(), ConnectionError> {
		self.set_state(ConnectState::Connecting);
		let addr = format!("{}:{}", host.host, host.port);
		info!("Connecting to {}", addr);
		let stream = match tokio::time::timeout(self.options.connect_timeout, TcpStream::connect(&addr)).await {
			Ok(Ok(stream)) => stream,
			Ok(Err(e)) => return Err(ConnectionError::ConnectFailed { addr, source: e }),
			Err(_) => return Err(ConnectionError::Timeout),
		};
		if let Err(e) = stream.set_nodelay(true) {
			debug!("Cannot set TCP_NODELAY: {}", e);
		}
		let (reader, writer) = stream.into_split();
		let mut link = Link {
			reader: RecordReader::new(reader),
			writer: RecordWriter::new(writer),
			flux: FluxQueue::new(),
			pending: HashMap::new(),
			next_rid: 1,
			synced: HashSet::new(),
			seen: HashSet::new(),
		};
		// The sync phase covers whatever changed while disconnected
		while self.local.try_recv().is_ok() {}

		self.set_state(ConnectState::LoggingIn);
		match tokio::time::timeout(self.options.connect_timeout, self.login(&mut link)).await {
			Ok(result) => result?,
			Err(_) => return Err(ConnectionError::Timeout),
		}

		self.set_state(ConnectState::Synchronizing);
		for index in 0..self.mounts.len() {
			self.sync_mount(&mut link, index);
		}
		link.flush().await?;
		self.set_state(ConnectState::Connected);
		self.established = true;
		info!("Connected to {}", addr);

		let result = self.serve(&mut link).await;
		for (_, reply) in link.pending.drain() {
			let _ = reply.send(Err(ConnectionError::Disconnected));
		}
		result
	}

	async fn login(&self, link: &mut Link) -> Result<(), ConnectionError> {
		link.writer.send(&Record::Login(LoginRequest::Hello)).await?;
		link.writer.flush().await?;
		loop {
			let record = link.reader.next().await?.ok_or(ConnectionError::Disconnected)?;
			match record {
				Record::Heartbeat => continue,
				Record::LoginReply { status: LoginStatus::Ok, allow, .. } => {
					debug!("Logged in with rights {:?}", allow);
					return Ok(());
				}
				Record::LoginReply { status: LoginStatus::Challenge, salt, .. } => {
					let (Some(user), Some(password)) = (&self.options.user, &self.options.password) else {
						return Err(ConnectionError::HandshakeFailed {
							message: "server requires login but no credentials are configured".to_string(),
						});
					};
					let server_salt = salt.unwrap_or_default();
					let client_salt = make_salt();
					let hash = password_hash(password, &server_salt, &client_salt);
					let credentials = LoginRequest::Credentials { user: user.clone(), salt: client_salt, hash };
					link.writer.send(&Record::Login(credentials)).await?;
					link.writer.flush().await?;
				}
				Record::LoginReply { status: LoginStatus::Bad, .. } => return Err(ConnectionError::LoginBad),
				Record::Error { message, .. } => return Err(ConnectionError::HandshakeFailed { message }),
				other => {
					return Err(ConnectionError::ProtocolError {
						message: format!("unexpected {} during login", other.cmd()),
					})
				}
			}
		}
	}

	async fn serve(&mut self, link: &mut Link) -> Result<(), ConnectionError> {
		let period = self.options.heartbeat_interval;
		let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
		heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
		let mut heard = false;
		let mut missed = 0u32;

		loop {
			let step = tokio::select! {
				record = link.reader.next() => Step::Record(record),
				event = self.local.recv() => Step::Local(event),
				command = self.commands.recv() => Step::Command(command),
				_ = heartbeat.tick() => Step::Heartbeat,
			};

			match step {
				Step::Record(Ok(Some(record))) => {
					heard = true;
					self.on_record(link, record)?;
				}
				Step::Record(Ok(None)) => return Err(ConnectionError::Disconnected),
				Step::Record(Err(e)) => return Err(e.into()),
				Step::Local(Some(event)) => {
					self.on_local(link, event);
					while let Ok(event) = self.local.try_recv() {
						self.on_local(link, event);
					}
				}
				Step::Local(None) | Step::Command(None) => self.closing = true,
				Step::Command(Some(command)) => self.on_command(link, command),
				Step::Heartbeat => {
					if heard {
						missed = 0;
					} else {
						missed += 1;
					}
					heard = false;
					if missed >= self.options.max_missed {
						return Err(ConnectionError::Timeout);
					}
					link.flux.push(Record::Heartbeat);
				}
			}

			if self.closing {
				link.flux.push(Record::Exit);
				let _ = link.flush().await;
				let _ = link.writer.shutdown().await;
				return Ok(());
			}
			link.flush().await?;
		}
	}

	fn on_command(&mut self, link: &mut Link, command: Command) {
		match command {
			Command::Mount(mount) => {
				self.mounts.push(mount);
				self.sync_mount(link, self.mounts.len() - 1);
			}
			Command::AddHost(host) => self.add_host(host),
			Command::Request(request, reply) => {
				let rid = link.next_rid;
				link.next_rid += 1;
				link.flux.push(request.into_record(rid));
				link.pending.insert(rid, reply);
			}
			Command::Close => self.closing = true,
		}
	}

	// ===========================================================================
	// Mount mapping
	// ===========================================================================

	fn remote_path(&self, local: &str) -> Option<(String, SyncMode)> {
		self.mounts
			.iter()
			.find(|m| is_below(local, &m.local))
			.and_then(|m| rebase(local, &m.local, &m.remote).map(|p| (p, m.sync_mode)))
	}

	fn local_path(&self, remote: &str) -> Option<(String, SyncMode)> {
		self.mounts
			.iter()
			.find(|m| is_below(remote, &m.remote))
			.and_then(|m| rebase(remote, &m.remote, &m.local).map(|p| (p, m.sync_mode)))
	}

	/// Subscribe a mount and every leaf already present below it
	fn sync_mount(&self, link: &mut Link, index: usize) {
		let mount = &self.mounts[index];
		debug!("Synchronizing {} with remote {}", mount.local, mount.remote);
		link.flux.push(Record::Subscribe {
			path: mount.remote.clone(),
			sync_mode: mount.sync_mode | SyncMode::MONITOR,
			initial: None,
		});
		link.synced.insert(mount.remote.clone());

		let mut leaves = Vec::new();
		self.collect_leaves(&mount.node, &mut leaves);
		for leaf in leaves {
			self.sync_leaf(link, &leaf);
		}
	}

	fn collect_leaves(&self, folder: &Arc<Node>, leaves: &mut Vec<Arc<Node>>) {
		let Ok(children) = self.dir.child_nodes(folder) else {
			return;
		};
		for child in children {
			if child.is_folder() {
				self.collect_leaves(&child, leaves);
			} else {
				leaves.push(child);
			}
		}
	}

	/// Subscribe one local leaf, then push its mode onto the now existing remote node
	///
	/// The local value is offered as `initial`: the server adopts it when it has none,
	/// or always under Master. Pipe values are never pushed as Master.
	fn sync_leaf(&self, link: &mut Link, node: &Arc<Node>) {
		let Some((remote, sync_mode)) = self.remote_path(node.path()) else {
			return;
		};
		let mode = node.mode() - ModeFlags::THREADED;
		let master_pipe = sync_mode.contains(SyncMode::MASTER) && mode.contains(ModeFlags::PIPE);
		link.flux.push(Record::Subscribe {
			path: remote.clone(),
			sync_mode: sync_mode - SyncMode::MONITOR,
			initial: if master_pipe { None } else { node.value() },
		});
		if !mode.is_empty() && !is_provider_name(node.name()) {
			link.flux.push(Record::ModeChange { path: remote.clone(), mode });
		}
		link.synced.insert(remote);
	}

	// ===========================================================================
	// Remote to local
	// ===========================================================================

	fn on_record(&mut self, link: &mut Link, record: Record) -> Result<(), ConnectionError> {
		debug!("Connector <- {}", record.cmd());
		match record {
			Record::Heartbeat => {}
			Record::Value { path, value, overwrite_key, .. } => {
				self.remote_value(link, &path, value, overwrite_key)
			}
			Record::CreateNode { path, kind } => self.remote_create(link, &path, kind),
			Record::ModeChange { path, mode } => {
				if let Some(node) = self.local_path(&path).and_then(|(p, _)| self.dir.lookup(&p)) {
					if let Err(e) = self.dir.set_mode(&node, mode, self.writer) {
						warn!("Cannot apply remote mode on {}: {}", node.path(), e);
					}
				}
			}
			Record::Retire { path } => {
				link.synced.remove(&path);
				link.seen.remove(&path);
				self.known.remove(&path);
				if let Some(node) = self.local_path(&path).and_then(|(p, _)| self.dir.lookup(&p)) {
					if self.mounts.iter().any(|m| m.node.id() == node.id()) {
						debug!("Remote retired mount root {}", path);
					} else if let Err(e) = self.dir.retire_by(&node, true, self.writer) {
						debug!("Remote retire of {}: {}", path, e);
					}
				}
			}
			Record::RefChange { path, refs } => debug!("Remote holds {} refs on {}", refs, path),
			Record::Reply { rid, reply } => match link.pending.remove(&rid) {
				Some(tx) => {
					let _ = tx.send(Ok(reply));
				}
				None => debug!("Reply for unknown request {}", rid),
			},
			Record::Error { code, path, message } => {
				warn!("Server reported {} on {:?}: {}", code, path, message);
				self.emit(ConnectorEvent::RemoteError { code, path, message: message.clone() });
				if code.is_fatal_to_session() {
					return Err(ConnectionError::ProtocolError { message });
				}
			}
			Record::Exit => return Err(ConnectionError::Disconnected),
			other => {
				return Err(ConnectionError::ProtocolError {
					message: format!("unexpected {} from server", other.cmd()),
				})
			}
		}
		Ok(())
	}

	fn remote_value(&mut self, link: &mut Link, remote: &str, value: Value, overwrite_key: Option<String>) {
		let Some((local, _)) = self.local_path(remote) else {
			debug!("Value for unmounted path {}", remote);
			return;
		};
		let node = match self.dir.resolve_by(&local, true, self.writer) {
			Ok(node) => node,
			Err(e) => {
				warn!("Cannot mirror {}: {}", remote, e);
				return;
			}
		};
		// Diverged only if the local value moved away from what both sides last agreed on
		if link.seen.insert(remote.to_string()) {
			if let Some(current) = node.value() {
				let agreed = self.known.get(remote) == Some(&current);
				if current != value && !agreed {
					warn!("Divergent value on {}: local {}, remote {}; keeping remote", local, current, value);
					self.emit(ConnectorEvent::Divergence { path: local.clone(), local: current, remote: value.clone() });
				}
			}
		}
		self.known.insert(remote.to_string(), value.clone());
		let result = if node.mode().contains(ModeFlags::PIPE) {
			self.dir.set_pipe_value(&node, value, overwrite_key, self.writer)
		} else {
			self.dir.set_value(&node, value, SameValue::Accept, self.writer)
		};
		if let Err(e) = result {
			warn!("Cannot apply remote value on {}: {}", local, e);
		}
	}

	fn remote_create(&self, link: &mut Link, remote: &str, kind: NodeKind) {
		let Some((local, sync_mode)) = self.local_path(remote) else {
			return;
		};
		let node = match self.dir.resolve_by(&local, true, self.writer) {
			Ok(node) => node,
			Err(e) => {
				warn!("Cannot mirror {}: {}", remote, e);
				return;
			}
		};
		if !kind.is_folder() && link.synced.insert(remote.to_string()) {
			link.flux.push(Record::Subscribe {
				path: remote.to_string(),
				sync_mode: sync_mode - SyncMode::MONITOR,
				initial: node.value(),
			});
		}
	}

	// ===========================================================================
	// Local to remote
	// ===========================================================================

	fn on_local(&mut self, link: &mut Link, event: TreeEvent) {
		if event.writer == self.writer {
			return;
		}
		let Some((remote, sync_mode)) = self.remote_path(&event.path) else {
			return;
		};
		match event.kind {
			EventKind::ValueChanged { value, overwrite_key } => {
				self.known.insert(remote.clone(), value.clone());
				if link.synced.insert(remote.clone()) {
					link.flux.push(Record::Subscribe {
						path: remote,
						sync_mode: sync_mode - SyncMode::MONITOR,
						initial: Some(value),
					});
					return;
				}
				let pipe = self.dir.node(event.node).map_or(false, |n| n.mode().contains(ModeFlags::PIPE));
				link.flux.push_value(Record::Value { path: remote, value, seq: event.seq, overwrite_key }, pipe);
			}
			EventKind::CreatedBelow { path: child, kind, .. } => {
				let Some((child_remote, _)) = self.remote_path(&child) else {
					return;
				};
				if kind.is_folder() {
					link.flux.push(Record::CreateNode { path: child_remote, kind });
				} else if link.synced.insert(child_remote.clone()) {
					link.flux.push(Record::Subscribe {
						path: child_remote,
						sync_mode: sync_mode - SyncMode::MONITOR,
						initial: None,
					});
				}
			}
			EventKind::ModeChanged { mode } => {
				let is_twin = self.dir.node(event.node).map_or(false, |n| is_provider_name(n.name()));
				if !is_twin {
					link.flux.push(Record::ModeChange { path: remote, mode: mode - ModeFlags::THREADED });
				}
			}
			EventKind::Retired => {
				if self.mounts.iter().any(|m| m.node.id() == event.node) {
					return;
				}
				link.synced.remove(&remote);
				link.seen.remove(&remote);
				self.known.remove(&remote);
				link.flux.push(Record::Retire { path: remote });
			}
			EventKind::RefChanged { .. } => {}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn test_commands_fail_while_disconnected() {
		let dir = Directory::new();
		let connector = Connector::start(&dir, ConnectorOptions::default());
		assert_eq!(connector.state(), ConnectState::Disconnected);
		assert!(matches!(connector.get("/a").await, Err(ConnectionError::Disconnected)));
		assert!(matches!(connector.ls("/").await, Err(ConnectionError::Disconnected)));
		connector.close();
	}

	#[tokio::test]
	async fn test_mount_requires_folders() {
		let dir = Directory::new();
		let connector = Connector::start(&dir, ConnectorOptions::default());
		assert!(matches!(
			connector.mount("/local", "/remote/", SyncMode::empty()),
			Err(TreeError::FolderNotOpen { .. })
		));
		connector.mount("/local/", "/remote/", SyncMode::empty()).unwrap();
		assert!(dir.exists("/local/"));
		connector.close();
	}

	#[tokio::test]
	async fn test_service_name() {
		let dir = Directory::new();
		let connector = Connector::start(&dir, ConnectorOptions::default());
		assert_eq!(connector.service(), None);
		connector.set_service("plant");
		assert_eq!(connector.service().as_deref(), Some("plant"));
	}

	#[tokio::test]
	async fn test_unreachable_hosts_report_tried_all() {
		let dir = Directory::new();
		let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
		let port = listener.local_addr().unwrap().port();
		drop(listener);
		let options = ConnectorOptions {
			hosts: vec![HostEntry { host: "127.0.0.1".into(), port, priority: 0 }],
			backoff_initial: Duration::from_millis(10),
			backoff_max: Duration::from_millis(20),
			..Default::default()
		};
		let connector = Connector::start(&dir, options);
		let mut events = connector.events();
		let found = tokio::time::timeout(Duration::from_secs(5), async {
			loop {
				match events.recv().await {
					Ok(ConnectorEvent::TriedAll) => return true,
					Ok(_) => continue,
					Err(_) => return false,
				}
			}
		})
		.await
		.unwrap();
		assert!(found);
		connector.close();
	}
}

// vim: ts=4
