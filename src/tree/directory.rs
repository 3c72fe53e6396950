//! Path-addressed registry of nodes
//!
//! The directory owns every node through an id-keyed arena and keeps parent/child
//! links as id maps. Two lock levels exist: the structure lock (arena and links) and
//! each node's state mutex. The structure lock is always taken first. Event sinks run
//! with neither held.
//!
//! Event delivery uses a per-node queue. Whoever enqueues into an idle queue drains
//! it; events enqueued while another thread drains are delivered by that thread. This
//! gives every observer the node's events in one global order, and lets a sink write
//! back into the node it is observing without deadlocking.

use indexmap::IndexMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::thread::ThreadId;

use super::event::{EventKind, EventSink, Subscription, SubscriptionId};
use super::node::Node;
use crate::error::TreeError;
use crate::logging::*;
use crate::storage::{NodeSnapshot, Storage};
use crate::types::{ModeFlags, NodeId, NodeKind, SameValue, Value, WriterId};
use crate::validation::{child_path, is_name_valid, is_provider_name, split_tree_path, twin_name};

const ROOT_ID: NodeId = NodeId(1);

/// Shared tree registry; cloning yields another handle to the same tree
#[derive(Clone)]
pub struct Directory {
	inner: Arc<DirectoryInner>,
}

struct DirectoryInner {
	structure: RwLock<Structure>,
	next_node: AtomicU64,
	next_writer: AtomicU64,
	next_subscription: AtomicU64,
	storage: RwLock<Option<Arc<dyn Storage>>>,
	main_thread: ThreadId,
}

struct Structure {
	root: Arc<Node>,
	nodes: HashMap<NodeId, Arc<Node>>,
	children: HashMap<NodeId, IndexMap<String, NodeId>>,
}

impl Default for Directory {
	fn default() -> Self {
		Self::new()
	}
}

impl Directory {
	/// Create an empty tree; the calling thread becomes its main thread
	pub fn new() -> Self {
		let root = Arc::new(Node::new(ROOT_ID, String::new(), Arc::from("/"), NodeKind::Folder, None));
		root.lock().persist = true;
		let mut nodes = HashMap::new();
		nodes.insert(ROOT_ID, root.clone());
		let mut children = HashMap::new();
		children.insert(ROOT_ID, IndexMap::new());
		Directory {
			inner: Arc::new(DirectoryInner {
				structure: RwLock::new(Structure { root, nodes, children }),
				next_node: AtomicU64::new(ROOT_ID.0 + 1),
				next_writer: AtomicU64::new(1),
				next_subscription: AtomicU64::new(1),
				storage: RwLock::new(None),
				main_thread: std::thread::current().id(),
			}),
		}
	}

	/// Create a tree persisting Save-mode nodes to `storage`, pre-populated from it
	pub fn with_storage(storage: Arc<dyn Storage>) -> Result<Self, TreeError> {
		let dir = Self::new();
		dir.load_from(storage.as_ref())?;
		dir.set_storage(storage);
		Ok(dir)
	}

	pub fn set_storage(&self, storage: Arc<dyn Storage>) {
		*self.inner.storage.write().unwrap_or_else(PoisonError::into_inner) = Some(storage);
	}

	fn storage(&self) -> Option<Arc<dyn Storage>> {
		self.inner.storage.read().unwrap_or_else(PoisonError::into_inner).clone()
	}

	pub fn main_thread(&self) -> ThreadId {
		self.inner.main_thread
	}

	pub fn is_main_thread(&self) -> bool {
		std::thread::current().id() == self.inner.main_thread
	}

	/// Allocate a writer identity for a handle or a connection
	pub fn next_writer_id(&self) -> WriterId {
		WriterId(self.inner.next_writer.fetch_add(1, Ordering::Relaxed))
	}

	fn read(&self) -> RwLockReadGuard<'_, Structure> {
		self.inner.structure.read().unwrap_or_else(PoisonError::into_inner)
	}

	fn write(&self) -> RwLockWriteGuard<'_, Structure> {
		self.inner.structure.write().unwrap_or_else(PoisonError::into_inner)
	}

	pub fn root(&self) -> Arc<Node> {
		self.read().root.clone()
	}

	/// Look up a node by id; retired nodes stay reachable until their last reference goes
	pub fn node(&self, id: NodeId) -> Option<Arc<Node>> {
		self.read().nodes.get(&id).cloned()
	}

	pub fn node_count(&self) -> usize {
		self.read().nodes.len()
	}

	// ===========================================================================
	// Resolution
	// ===========================================================================

	/// Find the node at `path`, optionally creating it and any missing folders
	pub fn resolve(&self, path: &str, create: bool) -> Result<Arc<Node>, TreeError> {
		self.resolve_by(path, create, WriterId::SYSTEM)
	}

	/// As [`Directory::resolve`], attributing creation events to `writer`
	pub fn resolve_by(&self, path: &str, create: bool, writer: WriterId) -> Result<Arc<Node>, TreeError> {
		self.resolve_inner(path, create, false, writer)
	}

	/// Resolve and take a reference in one step, so the node cannot be reaped in between
	pub fn acquire(&self, path: &str, create: bool, writer: WriterId) -> Result<Arc<Node>, TreeError> {
		let node = self.resolve_inner(path, create, true, writer)?;
		self.emit(&node, writer, EventKind::RefChanged { refs: node.ref_count() });
		Ok(node)
	}

	pub fn lookup(&self, path: &str) -> Option<Arc<Node>> {
		self.resolve(path, false).ok()
	}

	pub fn exists(&self, path: &str) -> bool {
		self.lookup(path).is_some()
	}

	fn resolve_inner(
		&self,
		path: &str,
		create: bool,
		take_ref: bool,
		writer: WriterId,
	) -> Result<Arc<Node>, TreeError> {
		let (segments, is_folder) =
			split_tree_path(path).map_err(|_| TreeError::InvalidPath { path: path.to_string() })?;

		{
			let st = self.read();
			if let Some(node) = st.walk(&segments, is_folder)? {
				if take_ref {
					node.inc_ref();
				}
				return Ok(node);
			}
		}
		if !create {
			return Err(TreeError::NotFound { path: path.to_string() });
		}

		let mut drain = Vec::new();
		let result = {
			let mut st = self.write();
			st.walk_create(&self.inner, &segments, is_folder, writer, &mut drain).map(|node| {
				if take_ref {
					node.inc_ref();
				}
				node
			})
		};
		self.drain_all(drain);
		result
	}

	/// Create a named child below a folder node
	pub fn create_child(
		&self,
		parent: &Arc<Node>,
		name: &str,
		kind: NodeKind,
		writer: WriterId,
	) -> Result<Arc<Node>, TreeError> {
		let path = child_path(parent.path(), name, kind.is_folder());
		if !is_name_valid(name) {
			return Err(TreeError::InvalidPath { path });
		}
		if kind == NodeKind::Provider && !is_provider_name(name) {
			return Err(TreeError::InvalidPath { path });
		}
		let mut drain = Vec::new();
		let result = {
			let mut st = self.write();
			if parent.is_retired() {
				return Err(TreeError::Retired { path: parent.path().to_string() });
			}
			if !parent.is_folder() {
				return Err(TreeError::FolderNotOpen { path: parent.path().to_string() });
			}
			if st.child(parent.id(), name).is_some() {
				return Err(TreeError::AlreadyExist { path });
			}
			let node = st.insert_child(&self.inner, parent, name, kind, writer, &mut drain);
			if kind == NodeKind::Provider {
				st.link_twins(&self.inner, &node, writer, &mut drain).map(|_| node)
			} else {
				Ok(node)
			}
		};
		self.drain_all(drain);
		result
	}

	/// Child names in creation order; folder names carry a trailing `/`
	pub fn children(&self, folder: &Arc<Node>) -> Result<Vec<String>, TreeError> {
		Ok(self
			.child_nodes(folder)?
			.iter()
			.map(|n| if n.is_folder() { format!("{}/", n.name()) } else { n.name().to_string() })
			.collect())
	}

	pub fn child_nodes(&self, folder: &Arc<Node>) -> Result<Vec<Arc<Node>>, TreeError> {
		if !folder.is_folder() {
			return Err(TreeError::FolderNotOpen { path: folder.path().to_string() });
		}
		if folder.is_retired() {
			return Err(TreeError::Retired { path: folder.path().to_string() });
		}
		let st = self.read();
		Ok(st
			.children
			.get(&folder.id())
			.map(|c| c.values().filter_map(|id| st.nodes.get(id).cloned()).collect())
			.unwrap_or_default())
	}

	// ===========================================================================
	// Values and modes
	// ===========================================================================

	/// Replace a leaf's value
	///
	/// Returns whether a write happened; `SameValue::Accept` skips writes of the
	/// value already present (except on pipes, where every write is a message).
	pub fn set_value(
		&self,
		node: &Arc<Node>,
		value: Value,
		same: SameValue,
		writer: WriterId,
	) -> Result<bool, TreeError> {
		self.write_value(node, value, same, writer, None)
	}

	/// Write to a pipe, replacing queued unsent values that share `overwrite_key`
	pub fn set_pipe_value(
		&self,
		node: &Arc<Node>,
		value: Value,
		overwrite_key: Option<String>,
		writer: WriterId,
	) -> Result<bool, TreeError> {
		self.write_value(node, value, SameValue::Emit, writer, overwrite_key)
	}

	fn write_value(
		&self,
		node: &Arc<Node>,
		value: Value,
		same: SameValue,
		writer: WriterId,
		overwrite_key: Option<String>,
	) -> Result<bool, TreeError> {
		if node.is_folder() {
			return Err(TreeError::not_allowed(node.path(), "folders hold no value"));
		}
		let must_drain = {
			let mut st = node.lock();
			if node.is_retired() {
				return Err(TreeError::ItemNotOpen { path: node.path().to_string() });
			}
			let pipe = st.mode.contains(ModeFlags::PIPE);
			if overwrite_key.is_some() && !pipe {
				return Err(TreeError::not_allowed(node.path(), "overwrite key on a non-pipe node"));
			}
			if same == SameValue::Accept && !pipe && st.value.as_ref() == Some(&value) {
				return Ok(false);
			}
			st.value = Some(value.clone());
			st.seq += 1;
			st.last_writer = writer;
			let event = node.make_event(&st, writer, EventKind::ValueChanged { value, overwrite_key });
			st.enqueue(event)
		};
		if must_drain {
			self.drain(node);
		}
		Ok(true)
	}

	/// Change a node's mode flags
	///
	/// Pipe implies bidirectional, and enabling bidirectional on a leaf creates its
	/// provider twin. Twins always carry the same flags.
	pub fn set_mode(&self, node: &Arc<Node>, mode: ModeFlags, writer: WriterId) -> Result<(), TreeError> {
		if mode.contains(ModeFlags::PIPE) && mode.contains(ModeFlags::SAVE) {
			return Err(TreeError::not_allowed(node.path(), "pipe and save are exclusive"));
		}
		if node.is_folder() && !mode.is_empty() {
			return Err(TreeError::not_allowed(node.path(), "folders carry no mode"));
		}
		let mut mode = mode;
		if mode.contains(ModeFlags::PIPE) {
			mode |= ModeFlags::BI_DIR;
		}

		let mut drain = Vec::new();
		let mut newly_saved = Vec::new();
		{
			let mut st = self.write();
			if node.is_retired() {
				return Err(TreeError::Retired { path: node.path().to_string() });
			}
			let mut targets = vec![node.clone()];
			if mode.contains(ModeFlags::BI_DIR) {
				match st.ensure_twin(&self.inner, node, writer, &mut drain) {
					Ok(twin) => targets.push(twin),
					Err(e) => {
						drop(st);
						self.drain_all(drain);
						return Err(e);
					}
				}
			} else if let Some(twin) = node.twin().and_then(|id| st.nodes.get(&id).cloned()) {
				targets.push(twin);
			}
			for target in targets {
				{
					let ns = target.lock();
					if mode.contains(ModeFlags::SAVE) && !ns.mode.contains(ModeFlags::SAVE) {
						if let Some(value) = &ns.value {
							newly_saved.push((target.path_arc(), value.clone(), ns.seq));
						}
					}
				}
				apply_mode(&target, mode, writer, &mut drain);
			}
		}
		if let Some(storage) = self.storage() {
			for (path, value, seq) in newly_saved {
				storage.store(&path, &value, seq);
			}
		}
		self.drain_all(drain);
		Ok(())
	}

	/// Mark a node as kept alive without references
	pub fn set_persistent(&self, node: &Arc<Node>, persist: bool) {
		node.lock().persist = persist;
		if !persist && node.ref_count() == 0 {
			self.reap_if_unused(node);
		}
	}

	// ===========================================================================
	// References and retirement
	// ===========================================================================

	/// Take a reference on a live node
	pub fn add_ref(&self, node: &Arc<Node>, writer: WriterId) -> Result<usize, TreeError> {
		let refs = {
			let _st = self.read();
			if node.is_retired() {
				return Err(TreeError::Retired { path: node.path().to_string() });
			}
			node.inc_ref()
		};
		self.emit(node, writer, EventKind::RefChanged { refs });
		Ok(refs)
	}

	/// Drop a reference; an unreferenced, non-persistent, childless node is retired
	pub fn release(&self, node: &Arc<Node>, writer: WriterId) {
		let refs = node.dec_ref();
		self.emit(node, writer, EventKind::RefChanged { refs });
		if refs == 0 {
			self.reap_if_unused(node);
		}
	}

	fn reap_if_unused(&self, node: &Arc<Node>) {
		let mut drain = Vec::new();
		{
			let mut st = self.write();
			let mut candidate = Some(node.clone());
			while let Some(n) = candidate.take() {
				if n.ref_count() != 0 {
					break;
				}
				if n.is_retired() {
					// Already unlinked, only the arena entry remains
					st.nodes.remove(&n.id());
					break;
				}
				if n.id() == ROOT_ID || n.is_persistent() || st.has_children(n.id()) {
					break;
				}
				let twin = n.twin().and_then(|id| st.nodes.get(&id).cloned());
				if let Some(t) = &twin {
					if t.ref_count() != 0 || t.is_persistent() {
						break;
					}
				}
				debug!("Reaping unreferenced {}", n.path());
				st.unlink_retire(&n, WriterId::SYSTEM, &mut drain);
				if let Some(t) = twin {
					if !t.is_retired() {
						st.unlink_retire(&t, WriterId::SYSTEM, &mut drain);
					}
				}
				candidate = n.parent_node().cloned();
			}
		}
		self.drain_all(drain);
	}

	/// Retire a node, and with `cascade` its whole subtree
	pub fn retire(&self, node: &Arc<Node>, cascade: bool) -> Result<(), TreeError> {
		self.retire_by(node, cascade, WriterId::SYSTEM)
	}

	pub fn retire_by(&self, node: &Arc<Node>, cascade: bool, writer: WriterId) -> Result<(), TreeError> {
		let mut drain = Vec::new();
		{
			let mut st = self.write();
			if node.is_retired() {
				return Err(TreeError::Retired { path: node.path().to_string() });
			}
			if node.id() == ROOT_ID {
				return Err(TreeError::not_allowed(node.path(), "the root cannot be retired"));
			}
			if st.has_children(node.id()) && !cascade {
				return Err(TreeError::not_allowed(node.path(), "folder has children"));
			}
			let mut order = Vec::new();
			st.collect_post_order(node, &mut order);
			for n in order {
				if n.is_retired() {
					continue;
				}
				let twin = n.twin().and_then(|id| st.nodes.get(&id).cloned());
				st.unlink_retire(&n, writer, &mut drain);
				if let Some(t) = twin {
					if !t.is_retired() {
						st.unlink_retire(&t, writer, &mut drain);
					}
				}
			}
		}
		self.drain_all(drain);
		if let Some(parent) = node.parent_node() {
			if parent.ref_count() == 0 {
				self.reap_if_unused(parent);
			}
		}
		Ok(())
	}

	// ===========================================================================
	// Subscriptions
	// ===========================================================================

	/// Register a sink for a node's events, and with `include_subtree` for all
	/// events of its descendants as well
	pub fn subscribe(
		&self,
		node: &Arc<Node>,
		sink: Arc<dyn EventSink>,
		include_subtree: bool,
	) -> Result<SubscriptionId, TreeError> {
		let id = SubscriptionId(self.inner.next_subscription.fetch_add(1, Ordering::Relaxed));
		let mut st = node.lock();
		if node.is_retired() {
			return Err(TreeError::Retired { path: node.path().to_string() });
		}
		st.subscribers.push(Subscription { id, sink, include_subtree });
		Ok(id)
	}

	/// Remove a subscription; returns false if it was not registered
	pub fn unsubscribe(&self, node: &Arc<Node>, id: SubscriptionId) -> bool {
		let mut st = node.lock();
		let before = st.subscribers.len();
		st.subscribers.retain(|s| s.id != id);
		st.subscribers.len() != before
	}

	// ===========================================================================
	// Persistence
	// ===========================================================================

	/// Current values of all Save-mode nodes
	pub fn snapshot_persistent(&self) -> Vec<NodeSnapshot> {
		let st = self.read();
		let mut snapshots: Vec<NodeSnapshot> = st
			.nodes
			.values()
			.filter(|n| !n.is_retired())
			.filter_map(|n| {
				let ns = n.lock();
				match (&ns.value, ns.mode.contains(ModeFlags::SAVE)) {
					(Some(value), true) => {
						Some(NodeSnapshot { path: n.path().to_string(), value: value.clone(), seq: ns.seq })
					}
					_ => None,
				}
			})
			.collect();
		snapshots.sort_by(|a, b| a.path.cmp(&b.path));
		snapshots
	}

	/// Populate Save-mode nodes from stored snapshots, without emitting value events
	pub fn load_from(&self, storage: &dyn Storage) -> Result<usize, TreeError> {
		let mut count = 0;
		for snapshot in storage.load() {
			let node = match self.resolve(&snapshot.path, true) {
				Ok(node) if !node.is_folder() => node,
				Ok(_) | Err(_) => {
					warn!("Ignoring stored value for unusable path {}", snapshot.path);
					continue;
				}
			};
			let mut ns = node.lock();
			ns.value = Some(snapshot.value);
			ns.seq = ns.seq.max(snapshot.seq);
			ns.mode = (ns.mode - ModeFlags::PIPE) | ModeFlags::SAVE;
			count += 1;
		}
		if count > 0 {
			info!("Loaded {} persisted values", count);
		}
		Ok(count)
	}

	// ===========================================================================
	// Event delivery
	// ===========================================================================

	fn emit(&self, node: &Arc<Node>, writer: WriterId, kind: EventKind) {
		let must_drain = {
			let mut st = node.lock();
			if node.is_retired() {
				return;
			}
			let event = node.make_event(&st, writer, kind);
			st.enqueue(event)
		};
		if must_drain {
			self.drain(node);
		}
	}

	fn drain_all(&self, nodes: Vec<Arc<Node>>) {
		for node in nodes {
			self.drain(&node);
		}
	}

	fn drain(&self, node: &Arc<Node>) {
		loop {
			let (event, mut sinks, save) = {
				let mut st = node.lock();
				let Some(event) = st.pending.pop_front() else {
					st.draining = false;
					return;
				};
				let subscribers = if event.is_retired() {
					std::mem::take(&mut st.subscribers)
				} else {
					st.subscribers.clone()
				};
				let save = matches!(event.kind, EventKind::ValueChanged { .. })
					&& st.mode.contains(ModeFlags::SAVE);
				(event, subscribers.into_iter().map(|s| s.sink).collect::<Vec<_>>(), save)
			};
			sinks.extend(subtree_sinks(node));

			if save {
				if let (Some(storage), Some(value)) = (self.storage(), event.value()) {
					storage.store(node.path(), value, event.seq);
				}
			}
			for sink in &sinks {
				sink.on_event(&event);
			}
		}
	}
}

/// Subtree subscribers of every ancestor, nearest first
fn subtree_sinks(node: &Node) -> Vec<Arc<dyn EventSink>> {
	let mut sinks = Vec::new();
	let mut ancestor = node.parent_node();
	while let Some(a) = ancestor {
		let st = a.lock();
		sinks.extend(st.subscribers.iter().filter(|s| s.include_subtree).map(|s| s.sink.clone()));
		drop(st);
		ancestor = a.parent_node();
	}
	sinks
}

/// Set a node's mode flags, queueing a change event if they differ
fn apply_mode(node: &Arc<Node>, mode: ModeFlags, writer: WriterId, drain: &mut Vec<Arc<Node>>) {
	let mut st = node.lock();
	if st.mode == mode {
		return;
	}
	st.mode = mode;
	let event = node.make_event(&st, writer, EventKind::ModeChanged { mode });
	if st.enqueue(event) {
		drain.push(node.clone());
	}
}

impl Structure {
	fn child(&self, parent: NodeId, name: &str) -> Option<&Arc<Node>> {
		self.children.get(&parent).and_then(|c| c.get(name)).and_then(|id| self.nodes.get(id))
	}

	fn has_children(&self, id: NodeId) -> bool {
		self.children.get(&id).map_or(false, |c| !c.is_empty())
	}

	/// Walk existing links; `Ok(None)` if some segment is missing or names the wrong kind
	fn walk(&self, segments: &[&str], is_folder: bool) -> Result<Option<Arc<Node>>, TreeError> {
		let mut current = self.root.clone();
		for (i, segment) in segments.iter().enumerate() {
			let last = i + 1 == segments.len();
			let Some(next) = self.child(current.id(), segment) else {
				return Ok(None);
			};
			if last {
				return Ok((next.is_folder() == is_folder).then(|| next.clone()));
			}
			if !next.is_folder() {
				return Err(TreeError::FolderNotOpen { path: next.path().to_string() });
			}
			current = next.clone();
		}
		Ok(Some(current))
	}

	fn walk_create(
		&mut self,
		inner: &DirectoryInner,
		segments: &[&str],
		is_folder: bool,
		writer: WriterId,
		drain: &mut Vec<Arc<Node>>,
	) -> Result<Arc<Node>, TreeError> {
		let mut current = self.root.clone();
		for (i, segment) in segments.iter().enumerate() {
			let last = i + 1 == segments.len();
			let want_folder = !last || is_folder;
			let next = match self.child(current.id(), segment).cloned() {
				Some(existing) if existing.is_folder() == want_folder => existing,
				Some(existing) if last => {
					return Err(TreeError::AlreadyExist { path: existing.path().to_string() })
				}
				Some(existing) => {
					return Err(TreeError::FolderNotOpen { path: existing.path().to_string() })
				}
				None => {
					let kind = if want_folder {
						NodeKind::Folder
					} else if is_provider_name(segment) {
						NodeKind::Provider
					} else {
						NodeKind::Leaf
					};
					let node = self.insert_child(inner, &current, segment, kind, writer, drain);
					if kind == NodeKind::Provider {
						self.link_twins(inner, &node, writer, drain)?;
					}
					node
				}
			};
			current = next;
		}
		Ok(current)
	}

	fn insert_child(
		&mut self,
		inner: &DirectoryInner,
		parent: &Arc<Node>,
		name: &str,
		kind: NodeKind,
		writer: WriterId,
		drain: &mut Vec<Arc<Node>>,
	) -> Arc<Node> {
		let id = NodeId(inner.next_node.fetch_add(1, Ordering::Relaxed));
		let path: Arc<str> = Arc::from(child_path(parent.path(), name, kind.is_folder()));
		let node = Arc::new(Node::new(id, name.to_string(), path.clone(), kind, Some(parent.clone())));
		self.nodes.insert(id, node.clone());
		if kind.is_folder() {
			self.children.insert(id, IndexMap::new());
		}
		self.children.entry(parent.id()).or_default().insert(name.to_string(), id);

		let mut ps = parent.lock();
		let event = parent.make_event(&ps, writer, EventKind::CreatedBelow { child: id, path, kind });
		if ps.enqueue(event) {
			drain.push(parent.clone());
		}
		node
	}

	/// Return the twin of a leaf or provider, creating it if needed
	fn ensure_twin(
		&mut self,
		inner: &DirectoryInner,
		node: &Arc<Node>,
		writer: WriterId,
		drain: &mut Vec<Arc<Node>>,
	) -> Result<Arc<Node>, TreeError> {
		if let Some(twin) = node.twin().and_then(|id| self.nodes.get(&id).cloned()) {
			if !twin.is_retired() {
				return Ok(twin);
			}
		}
		let parent = node
			.parent_node()
			.cloned()
			.ok_or_else(|| TreeError::not_allowed(node.path(), "the root has no twin"))?;
		let name = twin_name(node.name());
		let twin_kind = match node.kind() {
			NodeKind::Leaf => NodeKind::Provider,
			NodeKind::Provider => NodeKind::Leaf,
			NodeKind::Folder => return Err(TreeError::not_allowed(node.path(), "folders have no twin")),
		};
		let twin = match self.child(parent.id(), &name).cloned() {
			Some(existing) if existing.kind() == twin_kind => existing,
			Some(existing) => return Err(TreeError::AlreadyExist { path: existing.path().to_string() }),
			None => self.insert_child(inner, &parent, &name, twin_kind, writer, drain),
		};
		node.lock().twin = Some(twin.id());
		twin.lock().twin = Some(node.id());
		Ok(twin)
	}

	/// Link a node with its twin and mark both bidirectional
	fn link_twins(
		&mut self,
		inner: &DirectoryInner,
		node: &Arc<Node>,
		writer: WriterId,
		drain: &mut Vec<Arc<Node>>,
	) -> Result<Arc<Node>, TreeError> {
		let twin = self.ensure_twin(inner, node, writer, drain)?;
		let mode = node.mode() | twin.mode() | ModeFlags::BI_DIR;
		apply_mode(node, mode, writer, drain);
		apply_mode(&twin, mode, writer, drain);
		Ok(twin)
	}

	fn collect_post_order(&self, node: &Arc<Node>, out: &mut Vec<Arc<Node>>) {
		if let Some(children) = self.children.get(&node.id()) {
			for id in children.values() {
				if let Some(child) = self.nodes.get(id) {
					self.collect_post_order(child, out);
				}
			}
		}
		out.push(node.clone());
	}

	/// Detach a node from its parent and emit its final event
	fn unlink_retire(&mut self, node: &Arc<Node>, writer: WriterId, drain: &mut Vec<Arc<Node>>) {
		if let Some(parent) = node.parent_node() {
			if let Some(siblings) = self.children.get_mut(&parent.id()) {
				if siblings.get(node.name()) == Some(&node.id()) {
					siblings.shift_remove(node.name());
				}
			}
		}
		self.children.remove(&node.id());
		if node.ref_count() == 0 {
			self.nodes.remove(&node.id());
		}
		let mut st = node.lock();
		if node.mark_retired() {
			let event = node.make_event(&st, writer, EventKind::Retired);
			if st.enqueue(event) {
				drain.push(node.clone());
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::tree::event::TreeEvent;
	use std::sync::Mutex;

	#[derive(Default)]
	struct Recorder {
		events: Mutex<Vec<TreeEvent>>,
	}

	impl Recorder {
		fn kinds(&self) -> Vec<EventKind> {
			self.events.lock().unwrap().iter().map(|e| e.kind.clone()).collect()
		}

		fn values(&self) -> Vec<Value> {
			self.events.lock().unwrap().iter().filter_map(|e| e.value().cloned()).collect()
		}
	}

	impl EventSink for Recorder {
		fn on_event(&self, event: &TreeEvent) {
			self.events.lock().unwrap().push(event.clone());
		}
	}

	#[test]
	fn test_resolve_creates_intermediate_folders() {
		let dir = Directory::new();
		let node = dir.resolve("/A/B/value", true).unwrap();
		assert_eq!(node.path(), "/A/B/value");
		assert_eq!(node.kind(), NodeKind::Leaf);
		let b = dir.resolve("/A/B/", false).unwrap();
		assert!(b.is_folder());
		assert_eq!(dir.children(&b).unwrap(), vec!["value".to_string()]);
		assert!(matches!(dir.resolve("/A/C", false), Err(TreeError::NotFound { .. })));
	}

	#[test]
	fn test_resolve_is_idempotent() {
		let dir = Directory::new();
		let a = dir.resolve("/x/y", true).unwrap();
		let b = dir.resolve("/x/y", true).unwrap();
		assert_eq!(a.id(), b.id());
		assert_eq!(dir.node_count(), 3);
	}

	#[test]
	fn test_resolve_through_leaf_fails() {
		let dir = Directory::new();
		dir.resolve("/leaf", true).unwrap();
		assert!(matches!(dir.resolve("/leaf/x", true), Err(TreeError::FolderNotOpen { .. })));
		assert!(matches!(dir.resolve("/leaf/", true), Err(TreeError::AlreadyExist { .. })));
	}

	#[test]
	fn test_same_value_policy() {
		let dir = Directory::new();
		let node = dir.resolve("/v", true).unwrap();
		let rec = Arc::new(Recorder::default());
		dir.subscribe(&node, rec.clone(), false).unwrap();

		assert!(dir.set_value(&node, Value::Int(1), SameValue::Accept, WriterId(5)).unwrap());
		assert!(!dir.set_value(&node, Value::Int(1), SameValue::Accept, WriterId(5)).unwrap());
		assert!(dir.set_value(&node, Value::Int(1), SameValue::Emit, WriterId(5)).unwrap());
		assert_eq!(rec.values(), vec![Value::Int(1), Value::Int(1)]);
		assert_eq!(node.seq(), 2);
		assert_eq!(node.last_writer(), WriterId(5));
	}

	#[test]
	fn test_folder_rejects_value() {
		let dir = Directory::new();
		let folder = dir.resolve("/f/", true).unwrap();
		let err = dir.set_value(&folder, Value::Int(1), SameValue::Emit, WriterId::SYSTEM);
		assert!(matches!(err, Err(TreeError::OpNotAllowed { .. })));
	}

	#[test]
	fn test_release_reaps_chain() {
		let dir = Directory::new();
		let node = dir.acquire("/a/b/c", true, WriterId::SYSTEM).unwrap();
		assert_eq!(node.ref_count(), 1);
		dir.release(&node, WriterId::SYSTEM);
		assert!(node.is_retired());
		assert!(!dir.exists("/a/b/c"));
		assert!(!dir.exists("/a/"));
		assert_eq!(dir.node_count(), 1);
	}

	#[test]
	fn test_persistent_node_survives_release() {
		let dir = Directory::new();
		let node = dir.acquire("/keep", true, WriterId::SYSTEM).unwrap();
		dir.set_persistent(&node, true);
		dir.release(&node, WriterId::SYSTEM);
		assert!(!node.is_retired());
		dir.set_persistent(&node, false);
		assert!(node.is_retired());
	}

	#[test]
	fn test_retire_requires_cascade_for_children() {
		let dir = Directory::new();
		dir.resolve("/top/a", true).unwrap();
		let top = dir.resolve("/top/", false).unwrap();
		assert!(matches!(dir.retire(&top, false), Err(TreeError::OpNotAllowed { .. })));

		let rec = Arc::new(Recorder::default());
		dir.subscribe(&dir.root(), rec.clone(), true).unwrap();
		dir.retire(&top, true).unwrap();
		assert!(top.is_retired());
		assert!(!dir.exists("/top/a"));
		let retired: Vec<_> = rec
			.events
			.lock()
			.unwrap()
			.iter()
			.filter(|e| e.is_retired())
			.map(|e| e.path.to_string())
			.collect();
		assert_eq!(retired, vec!["/top/a".to_string(), "/top/".to_string()]);
	}

	#[test]
	fn test_retired_is_last_event() {
		let dir = Directory::new();
		let node = dir.acquire("/r", true, WriterId::SYSTEM).unwrap();
		let rec = Arc::new(Recorder::default());
		dir.subscribe(&node, rec.clone(), false).unwrap();
		dir.retire(&node, false).unwrap();
		let err = dir.set_value(&node, Value::Int(1), SameValue::Emit, WriterId::SYSTEM);
		assert!(matches!(err, Err(TreeError::ItemNotOpen { .. })));
		assert!(matches!(dir.retire(&node, false), Err(TreeError::Retired { .. })));
		assert_eq!(rec.kinds(), vec![EventKind::Retired]);
		assert_eq!(node.subscriber_count(), 0);

		// Still in the arena until the reference goes
		assert!(dir.node(node.id()).is_some());
		dir.release(&node, WriterId::SYSTEM);
		assert!(dir.node(node.id()).is_none());
	}

	#[test]
	fn test_recreate_after_retire() {
		let dir = Directory::new();
		let old = dir.acquire("/same", true, WriterId::SYSTEM).unwrap();
		dir.retire(&old, false).unwrap();
		let new = dir.resolve("/same", true).unwrap();
		assert_ne!(old.id(), new.id());
		assert!(!new.is_retired());
	}

	#[test]
	fn test_subtree_subscription_sees_creation() {
		let dir = Directory::new();
		let folder = dir.resolve("/mon/", true).unwrap();
		let rec = Arc::new(Recorder::default());
		dir.subscribe(&folder, rec.clone(), true).unwrap();
		let leaf = dir.resolve("/mon/sub/x", true).unwrap();
		dir.set_value(&leaf, Value::from("hi"), SameValue::Emit, WriterId::SYSTEM).unwrap();

		let created: Vec<String> = rec
			.events
			.lock()
			.unwrap()
			.iter()
			.filter_map(|e| match &e.kind {
				EventKind::CreatedBelow { path, .. } => Some(path.to_string()),
				_ => None,
			})
			.collect();
		assert_eq!(created, vec!["/mon/sub/".to_string(), "/mon/sub/x".to_string()]);
		assert_eq!(rec.values(), vec![Value::from("hi")]);
	}

	#[test]
	fn test_bidir_creates_twin() {
		let dir = Directory::new();
		let leaf = dir.resolve("/io/cmd", true).unwrap();
		dir.set_mode(&leaf, ModeFlags::BI_DIR, WriterId::SYSTEM).unwrap();
		let twin = dir.resolve("/io/cmd!", false).unwrap();
		assert_eq!(twin.kind(), NodeKind::Provider);
		assert_eq!(leaf.twin(), Some(twin.id()));
		assert_eq!(twin.twin(), Some(leaf.id()));
		assert!(twin.mode().contains(ModeFlags::BI_DIR));
	}

	#[test]
	fn test_provider_path_links_base() {
		let dir = Directory::new();
		let provider = dir.resolve("/io/req!", true).unwrap();
		let base = dir.resolve("/io/req", false).unwrap();
		assert_eq!(provider.twin(), Some(base.id()));
		assert!(base.mode().contains(ModeFlags::BI_DIR));
	}

	#[test]
	fn test_mode_rules() {
		let dir = Directory::new();
		let leaf = dir.resolve("/m", true).unwrap();
		let both = ModeFlags::PIPE | ModeFlags::SAVE;
		assert!(matches!(dir.set_mode(&leaf, both, WriterId::SYSTEM), Err(TreeError::OpNotAllowed { .. })));
		dir.set_mode(&leaf, ModeFlags::PIPE, WriterId::SYSTEM).unwrap();
		assert_eq!(leaf.mode(), ModeFlags::PIPE | ModeFlags::BI_DIR);
		let folder = dir.resolve("/f/", true).unwrap();
		assert!(dir.set_mode(&folder, ModeFlags::SAVE, WriterId::SYSTEM).is_err());
	}

	#[test]
	fn test_pipe_ignores_accept() {
		let dir = Directory::new();
		let pipe = dir.resolve("/p", true).unwrap();
		dir.set_mode(&pipe, ModeFlags::PIPE, WriterId::SYSTEM).unwrap();
		assert!(dir.set_value(&pipe, Value::Int(1), SameValue::Accept, WriterId::SYSTEM).unwrap());
		assert!(dir.set_value(&pipe, Value::Int(1), SameValue::Accept, WriterId::SYSTEM).unwrap());
		let plain = dir.resolve("/q", true).unwrap();
		let keyed = dir.set_pipe_value(&plain, Value::Int(1), Some("k".into()), WriterId::SYSTEM);
		assert!(keyed.is_err());
	}

	#[test]
	fn test_reentrant_write_is_queued() {
		struct Echo {
			dir: Directory,
			node: Mutex<Option<Arc<Node>>>,
			seen: Mutex<Vec<i64>>,
		}
		impl EventSink for Echo {
			fn on_event(&self, event: &TreeEvent) {
				let Some(v) = event.value().and_then(|v| v.to_int()) else { return };
				self.seen.lock().unwrap().push(v);
				if v < 3 {
					let node = self.node.lock().unwrap().clone().unwrap();
					self.dir.set_value(&node, Value::Int(v + 1), SameValue::Emit, WriterId::SYSTEM).unwrap();
				}
			}
		}

		let dir = Directory::new();
		let node = dir.resolve("/loop", true).unwrap();
		let echo =
			Arc::new(Echo { dir: dir.clone(), node: Mutex::new(Some(node.clone())), seen: Mutex::default() });
		dir.subscribe(&node, echo.clone(), false).unwrap();
		dir.set_value(&node, Value::Int(0), SameValue::Emit, WriterId::SYSTEM).unwrap();
		assert_eq!(*echo.seen.lock().unwrap(), vec![0, 1, 2, 3]);
		assert_eq!(node.value(), Some(Value::Int(3)));
	}

	#[test]
	fn test_save_mode_stores_and_loads() {
		use crate::storage::MemoryStorage;

		let storage = Arc::new(MemoryStorage::new());
		let dir = Directory::with_storage(storage.clone()).unwrap();
		let node = dir.resolve("/cfg/speed", true).unwrap();
		dir.set_value(&node, Value::Int(7), SameValue::Emit, WriterId::SYSTEM).unwrap();
		dir.set_mode(&node, ModeFlags::SAVE, WriterId::SYSTEM).unwrap();
		assert_eq!(storage.get("/cfg/speed"), Some(Value::Int(7)));
		dir.set_value(&node, Value::Int(8), SameValue::Emit, WriterId::SYSTEM).unwrap();
		assert_eq!(storage.get("/cfg/speed"), Some(Value::Int(8)));
		assert_eq!(dir.snapshot_persistent().len(), 1);

		let restored = Directory::with_storage(storage).unwrap();
		let node = restored.resolve("/cfg/speed", false).unwrap();
		assert_eq!(node.value(), Some(Value::Int(8)));
		assert!(node.mode().contains(ModeFlags::SAVE));
	}
}

// vim: ts=4
