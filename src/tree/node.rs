//! Arena entry for one path of the tree

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::event::{EventKind, Subscription, TreeEvent};
use crate::types::{ModeFlags, NodeId, NodeKind, Value, WriterId};

/// A node of the shared tree
///
/// Identity, kind and parent are fixed at creation. Everything that changes lives
/// behind the node's own mutex, except the reference count and the retirement flag
/// which are atomics so they can be read without locking.
pub struct Node {
	id: NodeId,
	name: String,
	path: Arc<str>,
	kind: NodeKind,
	parent: Option<Arc<Node>>,
	refs: AtomicUsize,
	retired: AtomicBool,
	state: Mutex<NodeState>,
}

pub(crate) struct NodeState {
	pub value: Option<Value>,
	pub seq: u64,
	pub last_writer: WriterId,
	pub mode: ModeFlags,
	pub persist: bool,
	pub twin: Option<NodeId>,
	pub subscribers: Vec<Subscription>,
	pub pending: VecDeque<TreeEvent>,
	pub draining: bool,
}

impl Node {
	pub(crate) fn new(
		id: NodeId,
		name: String,
		path: Arc<str>,
		kind: NodeKind,
		parent: Option<Arc<Node>>,
	) -> Self {
		Node {
			id,
			name,
			path,
			kind,
			parent,
			refs: AtomicUsize::new(0),
			retired: AtomicBool::new(false),
			state: Mutex::new(NodeState {
				value: None,
				seq: 0,
				last_writer: WriterId::SYSTEM,
				mode: ModeFlags::empty(),
				persist: false,
				twin: None,
				subscribers: Vec::new(),
				pending: VecDeque::new(),
				draining: false,
			}),
		}
	}

	pub fn id(&self) -> NodeId {
		self.id
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	pub fn path(&self) -> &str {
		&self.path
	}

	pub(crate) fn path_arc(&self) -> Arc<str> {
		self.path.clone()
	}

	pub fn kind(&self) -> NodeKind {
		self.kind
	}

	pub fn is_folder(&self) -> bool {
		self.kind.is_folder()
	}

	pub fn parent(&self) -> Option<NodeId> {
		self.parent.as_ref().map(|p| p.id)
	}

	/// Parent folder; a child keeps its parent allocated but not linked
	pub fn parent_node(&self) -> Option<&Arc<Node>> {
		self.parent.as_ref()
	}

	pub fn ref_count(&self) -> usize {
		self.refs.load(Ordering::SeqCst)
	}

	pub fn is_retired(&self) -> bool {
		self.retired.load(Ordering::SeqCst)
	}

	/// Current value, `None` if never written
	pub fn value(&self) -> Option<Value> {
		self.lock().value.clone()
	}

	pub fn has_value(&self) -> bool {
		self.lock().value.is_some()
	}

	pub fn seq(&self) -> u64 {
		self.lock().seq
	}

	/// Value together with the sequence number of the write that produced it
	pub fn value_and_seq(&self) -> (Option<Value>, u64) {
		let st = self.lock();
		(st.value.clone(), st.seq)
	}

	pub fn last_writer(&self) -> WriterId {
		self.lock().last_writer
	}

	pub fn mode(&self) -> ModeFlags {
		self.lock().mode
	}

	pub fn twin(&self) -> Option<NodeId> {
		self.lock().twin
	}

	/// Explicit persistence marker or Save mode
	pub fn is_persistent(&self) -> bool {
		let st = self.lock();
		st.persist || st.mode.contains(ModeFlags::SAVE)
	}

	pub fn subscriber_count(&self) -> usize {
		self.lock().subscribers.len()
	}

	pub(crate) fn lock(&self) -> MutexGuard<'_, NodeState> {
		self.state.lock().unwrap_or_else(PoisonError::into_inner)
	}

	pub(crate) fn inc_ref(&self) -> usize {
		self.refs.fetch_add(1, Ordering::SeqCst) + 1
	}

	/// Decrement, saturating at zero
	pub(crate) fn dec_ref(&self) -> usize {
		let mut current = self.refs.load(Ordering::SeqCst);
		loop {
			if current == 0 {
				return 0;
			}
			match self.refs.compare_exchange(
				current,
				current - 1,
				Ordering::SeqCst,
				Ordering::SeqCst,
			) {
				Ok(_) => return current - 1,
				Err(actual) => current = actual,
			}
		}
	}

	pub(crate) fn mark_retired(&self) -> bool {
		!self.retired.swap(true, Ordering::SeqCst)
	}

	/// Build an event stamped with the node's current sequence number
	pub(crate) fn make_event(&self, st: &NodeState, writer: WriterId, kind: EventKind) -> TreeEvent {
		TreeEvent { node: self.id, path: self.path.clone(), seq: st.seq, writer, kind }
	}
}

impl NodeState {
	/// Queue an event; returns true if the caller must drain the queue
	pub(crate) fn enqueue(&mut self, event: TreeEvent) -> bool {
		self.pending.push_back(event);
		if self.draining {
			false
		} else {
			self.draining = true;
			true
		}
	}
}

impl std::fmt::Debug for Node {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Node")
			.field("id", &self.id)
			.field("path", &self.path)
			.field("kind", &self.kind)
			.field("refs", &self.ref_count())
			.field("retired", &self.is_retired())
			.finish()
	}
}

// vim: ts=4
