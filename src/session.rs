//! Server-side connection handler
//!
//! A session owns one accepted connection. It runs the login handshake, applies
//! the peer's records to the local directory and forwards directory events for the
//! paths the peer subscribed to. Every mutation it makes is stamped with the
//! session's writer id, so the peer never gets its own writes echoed back.
//!
//! State flow: `Connected` -> `AwaitingLogin` (only if the server requires login)
//! -> `Authenticated` -> `Closing` -> `Closed`.

use globset::GlobSet;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};

use crate::error::{ErrorCode, TreeError};
use crate::flux::FluxQueue;
use crate::logging::*;
use crate::protocol::{
	make_salt, LoginCheck, LoginRequest, LoginStatus, ProtocolError, Record, RecordReader,
	RecordWriter, Reply, PROTOCOL_VERSION,
};
use crate::tree::{ChannelSink, Directory, EventKind, EventSink, Node, SubscriptionId, TreeEvent};
use crate::types::{Allow, ModeFlags, NodeId, NodeKind, SameValue, SyncMode, Value, WriterId};
use crate::validation::is_below;

/// Connection state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
	Connected,
	AwaitingLogin,
	Authenticated,
	Closing,
	Closed,
}

/// Policy shared by all sessions of a server
#[derive(Clone)]
pub struct SessionConfig {
	/// Credential check; login is required when set
	pub login: Option<Arc<dyn LoginCheck>>,
	/// Rights of a session on a server without login
	pub anonymous_allow: Allow,
	/// Paths a session may touch; everything when unset
	pub access: Option<GlobSet>,
	pub heartbeat_interval: Duration,
	/// Heartbeat periods without any record from the peer before closing
	pub max_missed: u32,
}

impl Default for SessionConfig {
	fn default() -> Self {
		SessionConfig {
			login: None,
			anonymous_allow: Allow::all(),
			access: None,
			heartbeat_interval: Duration::from_secs(5),
			max_missed: 3,
		}
	}
}

/// Forwards only creations strictly below a monitored folder; the folder's own
/// events arrive through the session's direct subscription
struct MonitorSink {
	folder: NodeId,
	tx: mpsc::UnboundedSender<TreeEvent>,
}

impl EventSink for MonitorSink {
	fn on_event(&self, event: &TreeEvent) {
		if matches!(event.kind, EventKind::CreatedBelow { .. }) && event.node != self.folder {
			let _ = self.tx.send(event.clone());
		}
	}
}

struct SessionSub {
	node: Arc<Node>,
	subscription: SubscriptionId,
	monitor: Option<SubscriptionId>,
	sync_mode: SyncMode,
	last_seq: u64,
}

enum Step {
	Record(Result<Option<Record>, ProtocolError>),
	Event(Option<TreeEvent>),
	Heartbeat,
	Shutdown,
}

/// One server-side connection
pub struct Session<R, W> {
	id: u64,
	dir: Directory,
	writer_id: WriterId,
	config: Arc<SessionConfig>,
	state: SessionState,
	reader: RecordReader<R>,
	writer: RecordWriter<W>,
	events_tx: mpsc::UnboundedSender<TreeEvent>,
	events_rx: mpsc::UnboundedReceiver<TreeEvent>,
	sink: Arc<dyn EventSink>,
	subs: HashMap<NodeId, SessionSub>,
	created: HashSet<String>,
	allow: Allow,
	server_salt: String,
	flux: FluxQueue,
	missed: u32,
	shutdown: watch::Receiver<bool>,
}

impl<R, W> Session<R, W>
where
	R: AsyncRead + Unpin,
	W: AsyncWrite + Unpin,
{
	pub fn new(
		id: u64,
		dir: &Directory,
		config: Arc<SessionConfig>,
		reader: R,
		writer: W,
		shutdown: watch::Receiver<bool>,
	) -> Self {
		let (events_tx, events_rx) = mpsc::unbounded_channel();
		Session {
			id,
			dir: dir.clone(),
			writer_id: dir.next_writer_id(),
			config,
			state: SessionState::Connected,
			reader: RecordReader::new(reader),
			writer: RecordWriter::new(writer),
			sink: Arc::new(ChannelSink::new(events_tx.clone())),
			events_tx,
			events_rx,
			subs: HashMap::new(),
			created: HashSet::new(),
			allow: Allow::empty(),
			server_salt: String::new(),
			flux: FluxQueue::new(),
			missed: 0,
			shutdown,
		}
	}

	pub fn id(&self) -> u64 {
		self.id
	}

	pub fn state(&self) -> SessionState {
		self.state
	}

	/// Serve the connection until it closes, then release everything it held
	pub async fn run(mut self) -> Result<(), ProtocolError> {
		info!("Session {} opened", self.id);
		let result = self.serve().await;
		self.close();
		match &result {
			Ok(()) => info!("Session {} closed", self.id),
			Err(e) => warn!("Session {} terminated: {}", self.id, e),
		}
		result
	}

	async fn serve(&mut self) -> Result<(), ProtocolError> {
		let period = self.config.heartbeat_interval;
		let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
		heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
		let mut heard = false;

		loop {
			let step = tokio::select! {
				record = self.reader.next() => Step::Record(record),
				event = self.events_rx.recv() => Step::Event(event),
				_ = heartbeat.tick() => Step::Heartbeat,
				_ = self.shutdown.changed() => Step::Shutdown,
			};

			match step {
				Step::Record(Ok(Some(record))) => {
					heard = true;
					if let Err(e) = self.handle(record) {
						return self.fail(e).await;
					}
				}
				Step::Record(Ok(None)) => {
					debug!("Session {}: peer closed", self.id);
					return Ok(());
				}
				Step::Record(Err(e)) => return self.fail(e).await,
				Step::Event(Some(event)) => {
					self.forward(event);
					while let Ok(event) = self.events_rx.try_recv() {
						self.forward(event);
					}
				}
				Step::Event(None) => {}
				Step::Heartbeat => {
					if heard {
						self.missed = 0;
					} else {
						self.missed += 1;
					}
					heard = false;
					if self.missed >= self.config.max_missed {
						self.state = SessionState::Closing;
						return Err(ProtocolError::HeartbeatTimeout);
					}
					self.flux.push(Record::Heartbeat);
				}
				Step::Shutdown => {
					debug!("Session {}: server shutting down", self.id);
					self.state = SessionState::Closing;
				}
			}

			self.flush().await?;
			if self.state == SessionState::Closing {
				return Ok(());
			}
		}
	}

	/// Tell the peer why the session ends, as far as the transport still allows
	async fn fail(&mut self, e: ProtocolError) -> Result<(), ProtocolError> {
		self.state = SessionState::Closing;
		if !matches!(e, ProtocolError::LoginBad | ProtocolError::Io(_)) {
			self.flux.push(Record::error(e.code(), None, e.to_string()));
		}
		let _ = self.flush().await;
		Err(e)
	}

	async fn flush(&mut self) -> Result<(), ProtocolError> {
		if self.flux.is_empty() {
			return Ok(());
		}
		while let Some(record) = self.flux.pop() {
			debug!("Session {} -> {}", self.id, record.cmd());
			self.writer.send(&record).await?;
		}
		self.writer.flush().await
	}

	// ===========================================================================
	// Inbound records
	// ===========================================================================

	fn handle(&mut self, record: Record) -> Result<(), ProtocolError> {
		debug!("Session {} <- {}", self.id, record.cmd());
		match (self.state, record) {
			(_, Record::Heartbeat) => Ok(()),
			(_, Record::Exit) => {
				self.state = SessionState::Closing;
				Ok(())
			}
			(SessionState::Connected, Record::Login(LoginRequest::Hello)) => {
				self.login_hello();
				Ok(())
			}
			(SessionState::AwaitingLogin, Record::Login(LoginRequest::Credentials { user, salt, hash })) => {
				self.login_credentials(&user, &salt, &hash)
			}
			(SessionState::Authenticated, record) => self.handle_sync(record),
			(_, record) => Err(ProtocolError::UnexpectedRecord(record.cmd().to_string())),
		}
	}

	fn login_hello(&mut self) {
		match &self.config.login {
			Some(_) => {
				self.server_salt = make_salt();
				self.flux.push(Record::LoginReply {
					status: LoginStatus::Challenge,
					salt: Some(self.server_salt.clone()),
					allow: Allow::empty(),
				});
				self.state = SessionState::AwaitingLogin;
			}
			None => {
				self.allow = self.config.anonymous_allow;
				self.flux.push(Record::LoginReply { status: LoginStatus::Ok, salt: None, allow: self.allow });
				self.state = SessionState::Authenticated;
			}
		}
	}

	fn login_credentials(&mut self, user: &str, salt: &str, hash: &str) -> Result<(), ProtocolError> {
		let granted = self
			.config
			.login
			.as_ref()
			.and_then(|check| check.verify(user, &self.server_salt, salt, hash));
		match granted {
			Some(allow) => {
				info!("Session {}: user {} logged in", self.id, user);
				self.allow = allow;
				self.flux.push(Record::LoginReply { status: LoginStatus::Ok, salt: None, allow });
				self.state = SessionState::Authenticated;
				Ok(())
			}
			None => {
				warn!("Session {}: login failed for {}", self.id, user);
				self.flux.push(Record::LoginReply {
					status: LoginStatus::Bad,
					salt: None,
					allow: Allow::empty(),
				});
				Err(ProtocolError::LoginBad)
			}
		}
	}

	fn handle_sync(&mut self, record: Record) -> Result<(), ProtocolError> {
		let (path, result) = match record {
			Record::Subscribe { path, sync_mode, initial } => {
				let r = self.subscribe(&path, sync_mode, initial);
				(path, r)
			}
			Record::Unsubscribe { path } => {
				if let Some(node) = self.dir.lookup(&path) {
					self.drop_sub(node.id());
				}
				(path, Ok(()))
			}
			Record::Value { path, value, overwrite_key, .. } => {
				let r = self.apply_value(&path, value, overwrite_key);
				(path, r)
			}
			Record::CreateNode { path, kind } => {
				let r = self.create(&path, kind);
				(path, r)
			}
			Record::ModeChange { path, mode } => {
				let r = self.mode_change(&path, mode);
				(path, r)
			}
			Record::Retire { path } => {
				let r = self.retire(&path);
				(path, r)
			}
			Record::RefChange { path, refs } => {
				debug!("Session {}: peer holds {} refs on {}", self.id, refs, path);
				return Ok(());
			}
			Record::Get { rid, path } => {
				let reply = self.cmd_get(&path);
				self.flux.push(Record::Reply { rid, reply });
				return Ok(());
			}
			Record::Set { rid, path, value } => {
				let reply = self.cmd_set(&path, value);
				self.flux.push(Record::Reply { rid, reply });
				return Ok(());
			}
			Record::Ls { rid, path } => {
				let reply = self.cmd_ls(&path);
				self.flux.push(Record::Reply { rid, reply });
				return Ok(());
			}
			Record::Version { rid } => {
				let reply = Reply {
					version: Some(format!(
						"sharetree {} protocol {}",
						env!("CARGO_PKG_VERSION"),
						PROTOCOL_VERSION
					)),
					..Reply::ok()
				};
				self.flux.push(Record::Reply { rid, reply });
				return Ok(());
			}
			Record::Error { code, path, message } => {
				warn!("Session {}: peer reported {} on {:?}: {}", self.id, code, path, message);
				return Ok(());
			}
			other => return Err(ProtocolError::UnexpectedRecord(other.cmd().to_string())),
		};
		if let Err(e) = result {
			debug!("Session {}: {} refused: {}", self.id, path, e);
			self.flux.push(Record::error(e.code(), Some(&path), e.to_string()));
		}
		Ok(())
	}

	fn permit(&self, path: &str, needed: Allow) -> Result<(), TreeError> {
		if !self.allow.contains(needed) {
			return Err(TreeError::not_allowed(path, "missing access right"));
		}
		if let Some(access) = &self.config.access {
			if !access.is_match(path) {
				return Err(TreeError::not_allowed(path, "path outside permitted area"));
			}
		}
		Ok(())
	}

	/// Permit creation when the path does not exist yet, remembering what we created
	fn permit_create(&mut self, path: &str) -> Result<(), TreeError> {
		if !self.dir.exists(path) {
			self.permit(path, Allow::CREATE)?;
			self.created.insert(path.to_string());
		}
		Ok(())
	}

	fn subscribe(&mut self, path: &str, sync_mode: SyncMode, initial: Option<Value>) -> Result<(), TreeError> {
		self.permit(path, Allow::READ)?;
		self.permit_create(path)?;
		let node = self.dir.acquire(path, true, self.writer_id)?;
		if self.subs.contains_key(&node.id()) {
			self.dir.release(&node, self.writer_id);
			return Ok(());
		}

		let subscription = match self.dir.subscribe(&node, self.sink.clone(), false) {
			Ok(id) => id,
			Err(e) => {
				self.dir.release(&node, self.writer_id);
				return Err(e);
			}
		};
		let monitor = if sync_mode.contains(SyncMode::MONITOR) && node.is_folder() {
			let sink = Arc::new(MonitorSink { folder: node.id(), tx: self.events_tx.clone() });
			self.dir.subscribe(&node, sink, true).ok()
		} else {
			None
		};
		self.subs.insert(
			node.id(),
			SessionSub { node: node.clone(), subscription, monitor, sync_mode, last_seq: 0 },
		);
		debug!("Session {}: subscribed {} [{}]", self.id, path, sync_mode.to_mode_string());

		if node.is_folder() {
			if monitor.is_some() {
				self.announce_below(&node);
			}
			return Ok(());
		}
		let mode = node.mode();
		if !mode.is_empty() {
			self.flux.push(Record::ModeChange { path: node.path().to_string(), mode });
		}
		// Writes up to `seq` are covered by the replay; later ones arrive as events
		let (current, seq) = node.value_and_seq();
		if let Some(sub) = self.subs.get_mut(&node.id()) {
			sub.last_seq = seq;
		}
		let master = sync_mode.contains(SyncMode::MASTER);
		match (current, initial) {
			(_, Some(initial)) if master && self.permit(path, Allow::WRITE).is_ok() => {
				debug!("Session {}: master value for {}", self.id, path);
				self.dir.set_value(&node, initial, SameValue::Accept, self.writer_id)?;
			}
			(_, None) if master => {}
			(Some(value), _) => {
				self.flux.push_value(
					Record::Value { path: node.path().to_string(), value, seq, overwrite_key: None },
					mode.contains(ModeFlags::PIPE),
				);
			}
			(None, Some(initial)) if self.permit(path, Allow::WRITE).is_ok() => {
				self.dir.set_value(&node, initial, SameValue::Emit, self.writer_id)?;
			}
			_ => {}
		}
		Ok(())
	}

	/// Announce every existing descendant of a monitored folder, parents first
	fn announce_below(&mut self, folder: &Arc<Node>) {
		let Ok(children) = self.dir.child_nodes(folder) else {
			return;
		};
		for child in children {
			self.flux.push(Record::CreateNode { path: child.path().to_string(), kind: child.kind() });
			if child.is_folder() {
				self.announce_below(&child);
			}
		}
	}

	fn apply_value(
		&mut self,
		path: &str,
		value: Value,
		overwrite_key: Option<String>,
	) -> Result<(), TreeError> {
		self.permit(path, Allow::WRITE)?;
		self.permit_create(path)?;
		let node = self.dir.resolve_by(path, true, self.writer_id)?;
		match overwrite_key {
			Some(key) => self.dir.set_pipe_value(&node, value, Some(key), self.writer_id)?,
			None => self.dir.set_value(&node, value, SameValue::Emit, self.writer_id)?,
		};
		Ok(())
	}

	fn create(&mut self, path: &str, kind: NodeKind) -> Result<(), TreeError> {
		if kind.is_folder() != path.ends_with('/') {
			return Err(TreeError::InvalidPath { path: path.to_string() });
		}
		self.permit_create(path)?;
		self.dir.resolve_by(path, true, self.writer_id)?;
		Ok(())
	}

	fn mode_change(&mut self, path: &str, mode: ModeFlags) -> Result<(), TreeError> {
		self.permit(path, Allow::MODE)?;
		let node = self.dir.resolve(path, false)?;
		self.dir.set_mode(&node, mode, self.writer_id)
	}

	fn retire(&mut self, path: &str) -> Result<(), TreeError> {
		self.permit(path, Allow::DELETE)?;
		let node = self.dir.resolve(path, false)?;
		self.dir.retire_by(&node, true, self.writer_id)
	}

	// ===========================================================================
	// One-shot commands
	// ===========================================================================

	fn cmd_get(&self, path: &str) -> Reply {
		if let Err(e) = self.permit(path, Allow::READ) {
			return Reply::error(e.code(), e.to_string());
		}
		match self.dir.lookup(path).and_then(|n| n.value()) {
			Some(value) => Reply { value: Some(value), ..Reply::ok() },
			None if self.dir.exists(path) => Reply::error(ErrorCode::ItemNotSet, path),
			None => Reply::error(ErrorCode::NotFound, path),
		}
	}

	/// Write without holding the node; an otherwise unused node is reaped right away
	fn cmd_set(&mut self, path: &str, value: Value) -> Reply {
		let result = self
			.permit(path, Allow::WRITE)
			.and_then(|_| {
				if self.dir.exists(path) {
					Ok(())
				} else {
					self.permit(path, Allow::CREATE)
				}
			})
			.and_then(|_| self.dir.acquire(path, true, self.writer_id))
			.and_then(|node| {
				let written = self.dir.set_value(&node, value, SameValue::Emit, self.writer_id);
				self.dir.release(&node, self.writer_id);
				written
			});
		match result {
			Ok(_) => Reply::ok(),
			Err(e) => Reply::error(e.code(), e.to_string()),
		}
	}

	fn cmd_ls(&self, path: &str) -> Reply {
		if let Err(e) = self.permit(path, Allow::READ) {
			return Reply::error(e.code(), e.to_string());
		}
		let folder = if path.ends_with('/') { path.to_string() } else { format!("{}/", path) };
		match self.dir.resolve(&folder, false).and_then(|n| self.dir.children(&n)) {
			Ok(items) => Reply { items, ..Reply::ok() },
			Err(e) => Reply::error(e.code(), e.to_string()),
		}
	}

	// ===========================================================================
	// Outbound events
	// ===========================================================================

	fn forward(&mut self, event: TreeEvent) {
		if event.writer == self.writer_id {
			if event.is_retired() {
				self.drop_sub(event.node);
			}
			return;
		}
		let path = event.path.to_string();
		match event.kind {
			EventKind::ValueChanged { value, overwrite_key } => {
				let Some(sub) = self.subs.get_mut(&event.node) else {
					return;
				};
				if event.seq <= sub.last_seq {
					return;
				}
				sub.last_seq = event.seq;
				let pipe = sub.node.mode().contains(ModeFlags::PIPE);
				self.flux.push_value(Record::Value { path, value, seq: event.seq, overwrite_key }, pipe);
			}
			EventKind::CreatedBelow { path: child, kind, .. } => {
				let monitored = self.subs.values().any(|s| s.monitor.is_some() && is_below(&path, s.node.path()));
				if monitored {
					self.flux.push(Record::CreateNode { path: child.to_string(), kind });
				}
			}
			EventKind::ModeChanged { mode } => {
				if self.subs.contains_key(&event.node) {
					self.flux.push(Record::ModeChange { path, mode });
				}
			}
			EventKind::Retired => {
				if self.subs.contains_key(&event.node) {
					self.flux.push(Record::Retire { path });
					self.drop_sub(event.node);
				}
			}
			EventKind::RefChanged { refs } => {
				if self.subs.contains_key(&event.node) {
					self.flux.push(Record::RefChange { path, refs: refs as u64 });
				}
			}
		}
	}

	fn drop_sub(&mut self, id: NodeId) {
		if let Some(sub) = self.subs.remove(&id) {
			self.dir.unsubscribe(&sub.node, sub.subscription);
			if let Some(monitor) = sub.monitor {
				self.dir.unsubscribe(&sub.node, monitor);
			}
			self.dir.release(&sub.node, self.writer_id);
		}
	}

	/// Release everything the session held
	fn close(&mut self) {
		self.state = SessionState::Closing;
		let subs: Vec<SessionSub> = self.subs.drain().map(|(_, s)| s).collect();
		for sub in subs {
			self.dir.unsubscribe(&sub.node, sub.subscription);
			if let Some(monitor) = sub.monitor {
				self.dir.unsubscribe(&sub.node, monitor);
			}
			self.dir.release(&sub.node, self.writer_id);
			if sub.sync_mode.contains(SyncMode::AUTO_DESTROY) && !sub.node.is_retired() {
				debug!("Session {}: auto-destroying {}", self.id, sub.node.path());
				let _ = self.dir.retire_by(&sub.node, true, self.writer_id);
			}
		}
		for path in self.created.drain() {
			let Some(node) = self.dir.lookup(&path) else {
				continue;
			};
			let mirrored = node.mode().intersects(ModeFlags::BI_DIR | ModeFlags::PIPE);
			if mirrored && node.ref_count() == 0 && !node.is_retired() {
				debug!("Session {}: retiring mirrored {}", self.id, path);
				let _ = self.dir.retire_by(&node, true, self.writer_id);
			}
		}
		self.flux.clear();
		self.state = SessionState::Closed;
	}
}


// vim: ts=4
