//! Caller-held handles onto tree nodes
//!
//! A [`Handle`] binds to one path, holds a reference on the node for as long as it
//! stays bound, and turns the node's events into typed callbacks. Writes made through
//! a handle are stamped with the handle's own writer id so it can ignore its own
//! echoes when asked to.
//!
//! Handles check thread affinity: unless [`Handle::enable_threaded`] was called, or
//! the node carries the threaded mode flag, every operation must run on the thread
//! that created the directory.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::error::TreeError;
use crate::tree::{Directory, EventKind, EventSink, Node, SubscriptionId, TreeEvent};
use crate::types::{ModeFlags, NodeKind, SameValue, Value, WriterId};

/// How a handle attaches to its path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
	/// Path must already exist
	Read,
	/// Path is created when missing
	Write,
	/// Path is created when missing and everything below it is observed
	Monitor,
}

/// Callback invoked with the triggering event
pub type Callback = Arc<dyn Fn(&TreeEvent) + Send + Sync>;

#[derive(Default)]
struct Callbacks {
	change: Option<Callback>,
	created: Option<Callback>,
	retired: Option<Callback>,
	mode: Option<Callback>,
}

/// Event sink shared between a handle and the node it is subscribed to
struct HandleSink {
	node: AtomicU64,
	writer: WriterId,
	block_echo: AtomicBool,
	retired_sent: AtomicBool,
	callbacks: Mutex<Callbacks>,
}

impl HandleSink {
	fn callback(&self, pick: impl Fn(&Callbacks) -> Option<Callback>) -> Option<Callback> {
		let cbs = self.callbacks.lock().unwrap_or_else(PoisonError::into_inner);
		pick(&cbs)
	}
}

impl EventSink for HandleSink {
	fn on_event(&self, event: &TreeEvent) {
		let own = event.node.0 == self.node.load(Ordering::SeqCst);
		let callback = match &event.kind {
			EventKind::ValueChanged { .. } if own => {
				if self.block_echo.load(Ordering::SeqCst) && event.writer == self.writer {
					return;
				}
				self.callback(|c| c.change.clone())
			}
			EventKind::CreatedBelow { .. } => self.callback(|c| c.created.clone()),
			EventKind::ModeChanged { .. } if own => self.callback(|c| c.mode.clone()),
			EventKind::Retired if own => {
				if self.retired_sent.swap(true, Ordering::SeqCst) {
					return;
				}
				self.callback(|c| c.retired.clone())
			}
			_ => None,
		};
		if let Some(cb) = callback {
			cb(event);
		}
	}
}

struct Bound {
	node: Arc<Node>,
	subscription: SubscriptionId,
	access: Access,
}

/// A typed reference to one node of a [`Directory`]
pub struct Handle {
	dir: Directory,
	writer: WriterId,
	bound: Option<Bound>,
	ignore_same: bool,
	threaded: bool,
	sink: Arc<HandleSink>,
}

impl Handle {
	/// Create an unbound handle
	pub fn new(dir: &Directory) -> Self {
		let writer = dir.next_writer_id();
		Handle {
			dir: dir.clone(),
			writer,
			bound: None,
			ignore_same: false,
			threaded: false,
			sink: Arc::new(HandleSink {
				node: AtomicU64::new(0),
				writer,
				block_echo: AtomicBool::new(false),
				retired_sent: AtomicBool::new(false),
				callbacks: Mutex::new(Callbacks::default()),
			}),
		}
	}

	/// Create a handle bound for writing
	pub fn open(dir: &Directory, path: &str) -> Result<Self, TreeError> {
		let mut handle = Self::new(dir);
		handle.bind(path, Access::Write)?;
		Ok(handle)
	}

	/// Attach to a path and take a reference on its node
	pub fn bind(&mut self, path: &str, access: Access) -> Result<(), TreeError> {
		self.check_thread()?;
		if let Some(b) = &self.bound {
			return Err(TreeError::AlreadyOpen { path: b.node.path().to_string() });
		}
		let create = access != Access::Read;
		let node = self.dir.acquire(path, create, self.writer)?;
		let subscription =
			match self.dir.subscribe(&node, self.sink.clone(), access == Access::Monitor) {
				Ok(id) => id,
				Err(e) => {
					self.dir.release(&node, self.writer);
					return Err(e);
				}
			};
		self.sink.node.store(node.id().0, Ordering::SeqCst);
		self.sink.retired_sent.store(false, Ordering::SeqCst);
		self.bound = Some(Bound { node, subscription, access });
		Ok(())
	}

	/// Detach from the node, dropping the reference
	pub fn unbind(&mut self) {
		if let Some(b) = self.bound.take() {
			self.dir.unsubscribe(&b.node, b.subscription);
			self.sink.node.store(0, Ordering::SeqCst);
			self.dir.release(&b.node, self.writer);
		}
	}

	/// Bound to a node that is still live
	pub fn is_open(&self) -> bool {
		self.bound.as_ref().map_or(false, |b| !b.node.is_retired())
	}

	pub fn is_retired(&self) -> bool {
		self.bound.as_ref().map_or(false, |b| b.node.is_retired())
	}

	pub fn path(&self) -> Option<&str> {
		self.bound.as_ref().map(|b| b.node.path())
	}

	pub fn node(&self) -> Option<&Arc<Node>> {
		self.bound.as_ref().map(|b| &b.node)
	}

	pub fn access(&self) -> Option<Access> {
		self.bound.as_ref().map(|b| b.access)
	}

	pub fn writer_id(&self) -> WriterId {
		self.writer
	}

	/// Bound to the provider side of a bidirectional pair
	pub fn is_provider(&self) -> bool {
		self.bound.as_ref().map_or(false, |b| b.node.kind() == NodeKind::Provider)
	}

	// ===========================================================================
	// Policies
	// ===========================================================================

	/// Thread-affinity handshake: allow this handle on any thread
	pub fn enable_threaded(&mut self) {
		self.threaded = true;
	}

	pub fn set_ignore_same_value(&mut self, ignore: bool) {
		self.ignore_same = ignore;
	}

	pub fn ignore_same_value(&self) -> bool {
		self.ignore_same
	}

	/// Suppress change callbacks for writes made through this handle
	pub fn set_block_echo(&self, block: bool) {
		self.sink.block_echo.store(block, Ordering::SeqCst);
	}

	fn check_thread(&self) -> Result<(), TreeError> {
		if self.threaded || self.dir.is_main_thread() {
			return Ok(());
		}
		match &self.bound {
			Some(b) if b.node.mode().contains(ModeFlags::THREADED) => Ok(()),
			_ => Err(TreeError::NotMainThread),
		}
	}

	fn live_node(&self) -> Result<&Arc<Node>, TreeError> {
		self.check_thread()?;
		match &self.bound {
			Some(b) if !b.node.is_retired() => Ok(&b.node),
			Some(b) => Err(TreeError::ItemNotOpen { path: b.node.path().to_string() }),
			None => Err(TreeError::ItemNotOpen { path: String::new() }),
		}
	}

	// ===========================================================================
	// Values
	// ===========================================================================

	/// Current value of the bound node
	pub fn get(&self) -> Result<Value, TreeError> {
		let node = self.live_node()?;
		node.value().ok_or_else(|| TreeError::ItemNotSet { path: node.path().to_string() })
	}

	pub fn get_int(&self) -> Result<i64, TreeError> {
		let value = self.get()?;
		Ok(value.to_int().unwrap_or_default())
	}

	pub fn get_double(&self) -> Result<f64, TreeError> {
		let value = self.get()?;
		Ok(value.to_double().unwrap_or_default())
	}

	pub fn get_string(&self) -> Result<String, TreeError> {
		Ok(self.get()?.to_text())
	}

	pub fn get_bytes(&self) -> Result<Vec<u8>, TreeError> {
		Ok(self.get()?.to_bytes())
	}

	/// Write with the handle's own same-value policy
	pub fn set(&self, value: impl Into<Value>) -> Result<(), TreeError> {
		self.set_with(value, SameValue::DefaultAction)
	}

	pub fn set_with(&self, value: impl Into<Value>, same: SameValue) -> Result<(), TreeError> {
		let same = match same {
			SameValue::DefaultAction if self.ignore_same => SameValue::Accept,
			SameValue::DefaultAction => SameValue::Emit,
			other => other,
		};
		let target = self.write_target()?;
		self.dir.set_value(&target, value.into(), same, self.writer)?;
		Ok(())
	}

	/// Pipe write; a queued unsent value whose text starts with `overwrite_key` is replaced
	pub fn set_pipe(&self, value: impl Into<Value>, overwrite_key: Option<&str>) -> Result<(), TreeError> {
		let target = self.write_target()?;
		self.dir.set_pipe_value(&target, value.into(), overwrite_key.map(str::to_string), self.writer)?;
		Ok(())
	}

	/// Bidirectional nodes are written through their twin
	fn write_target(&self) -> Result<Arc<Node>, TreeError> {
		let node = self.live_node()?;
		if !node.mode().contains(ModeFlags::BI_DIR) {
			return Ok(node.clone());
		}
		match node.twin().and_then(|id| self.dir.node(id)) {
			Some(twin) if !twin.is_retired() => Ok(twin),
			_ => Ok(node.clone()),
		}
	}

	// ===========================================================================
	// Modes and structure
	// ===========================================================================

	pub fn mode(&self) -> ModeFlags {
		self.bound.as_ref().map(|b| b.node.mode()).unwrap_or_default()
	}

	/// Replace the mode flags of the bound node
	pub fn set_mode(&self, mode: ModeFlags) -> Result<(), TreeError> {
		let node = self.structural_node()?;
		self.dir.set_mode(node, mode, self.writer)
	}

	/// Add flags to the current mode
	pub fn add_mode(&self, mode: ModeFlags) -> Result<(), TreeError> {
		let node = self.structural_node()?;
		self.dir.set_mode(node, node.mode() | mode, self.writer)
	}

	pub fn set_persistent(&self, persist: bool) -> Result<(), TreeError> {
		let node = self.structural_node()?;
		self.dir.set_persistent(node, persist);
		Ok(())
	}

	pub fn retire(&self, cascade: bool) -> Result<(), TreeError> {
		let node = self.structural_node()?;
		self.dir.retire_by(node, cascade, self.writer)
	}

	/// Child names of a bound folder
	pub fn children(&self) -> Result<Vec<String>, TreeError> {
		let node = self.structural_node()?;
		self.dir.children(node)
	}

	fn structural_node(&self) -> Result<&Arc<Node>, TreeError> {
		self.check_thread()?;
		match &self.bound {
			Some(b) if b.node.is_retired() => Err(TreeError::Retired { path: b.node.path().to_string() }),
			Some(b) => Ok(&b.node),
			None => Err(TreeError::NotOpen),
		}
	}

	// ===========================================================================
	// Callbacks
	// ===========================================================================

	/// Called for every value written to the bound node
	pub fn on_change<F>(&self, f: F)
	where
		F: Fn(&TreeEvent) + Send + Sync + 'static,
	{
		self.callbacks().change = Some(Arc::new(f));
	}

	/// Called when a node is created below a bound folder (any depth for monitors)
	pub fn on_created<F>(&self, f: F)
	where
		F: Fn(&TreeEvent) + Send + Sync + 'static,
	{
		self.callbacks().created = Some(Arc::new(f));
	}

	/// Called exactly once when the bound node is retired
	pub fn on_retired<F>(&self, f: F)
	where
		F: Fn(&TreeEvent) + Send + Sync + 'static,
	{
		self.callbacks().retired = Some(Arc::new(f));
	}

	pub fn on_mode_change<F>(&self, f: F)
	where
		F: Fn(&TreeEvent) + Send + Sync + 'static,
	{
		self.callbacks().mode = Some(Arc::new(f));
	}

	fn callbacks(&self) -> std::sync::MutexGuard<'_, Callbacks> {
		self.sink.callbacks.lock().unwrap_or_else(PoisonError::into_inner)
	}
}

impl Drop for Handle {
	fn drop(&mut self) {
		self.unbind();
	}
}

impl std::fmt::Debug for Handle {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Handle")
			.field("writer", &self.writer)
			.field("path", &self.path())
			.field("open", &self.is_open())
			.finish()
	}
}


// vim: ts=4
