//! Change events and the fixed-signature sink interface they are delivered through

use std::fmt;
use std::sync::Arc;

use crate::types::{ModeFlags, NodeId, NodeKind, Value, WriterId};

/// What happened to a node
#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
	/// Value slot replaced
	ValueChanged {
		value: Value,
		/// Pipe writes may ask queued values with the same prefix to be overwritten
		overwrite_key: Option<String>,
	},
	/// A node was created directly below the event's node
	CreatedBelow { child: NodeId, path: Arc<str>, kind: NodeKind },
	/// Mode flags changed
	ModeChanged { mode: ModeFlags },
	/// Node was retired; always the last event a node emits
	Retired,
	/// Reference count changed
	RefChanged { refs: usize },
}

/// One event emitted by a node, in that node's global order
#[derive(Debug, Clone, PartialEq)]
pub struct TreeEvent {
	pub node: NodeId,
	pub path: Arc<str>,
	/// Change-sequence counter of the node when the event was emitted
	pub seq: u64,
	pub writer: WriterId,
	pub kind: EventKind,
}

impl TreeEvent {
	pub fn value(&self) -> Option<&Value> {
		match &self.kind {
			EventKind::ValueChanged { value, .. } => Some(value),
			_ => None,
		}
	}

	pub fn is_retired(&self) -> bool {
		matches!(self.kind, EventKind::Retired)
	}
}

impl fmt::Display for TreeEvent {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match &self.kind {
			EventKind::ValueChanged { value, .. } => {
				write!(f, "{} = {} (seq {})", self.path, value, self.seq)
			}
			EventKind::CreatedBelow { path, .. } => write!(f, "{} created", path),
			EventKind::ModeChanged { mode } => {
				write!(f, "{} mode [{}]", self.path, mode.to_mode_string())
			}
			EventKind::Retired => write!(f, "{} retired", self.path),
			EventKind::RefChanged { refs } => write!(f, "{} refs {}", self.path, refs),
		}
	}
}

/// Receiver of node events
///
/// Sinks are invoked with no directory lock held. A sink may call back into the
/// directory, including writes to the node it is being notified about; such writes
/// are queued behind the event being delivered.
pub trait EventSink: Send + Sync {
	fn on_event(&self, event: &TreeEvent);
}

/// Handle returned by `Directory::subscribe`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

#[derive(Clone)]
pub(crate) struct Subscription {
	pub id: SubscriptionId,
	pub sink: Arc<dyn EventSink>,
	pub include_subtree: bool,
}

/// Sink that forwards every event into an unbounded channel
///
/// Used by sessions and connectors so a slow peer never blocks a local writer.
pub struct ChannelSink {
	tx: tokio::sync::mpsc::UnboundedSender<TreeEvent>,
}

impl ChannelSink {
	pub fn new(tx: tokio::sync::mpsc::UnboundedSender<TreeEvent>) -> Self {
		Self { tx }
	}
}

impl EventSink for ChannelSink {
	fn on_event(&self, event: &TreeEvent) {
		// Receiver gone means the connection is tearing down
		let _ = self.tx.send(event.clone());
	}
}

// vim: ts=4
