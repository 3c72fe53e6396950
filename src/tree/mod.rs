//! The shared tree: nodes, the directory that owns them, and their events

mod directory;
mod event;
mod node;

pub use directory::Directory;
pub use event::{ChannelSink, EventKind, EventSink, SubscriptionId, TreeEvent};
pub use node::Node;

// vim: ts=4
