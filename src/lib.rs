//! # sharetree - Distributed Shared Hierarchical Data Space
//!
//! A process-wide tree of named, typed values that many components observe and
//! mutate, with live mirroring of subtrees between processes over TCP.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use sharetree::{Directory, Handle, Value};
//!
//! let dir = Directory::new();
//! let h = Handle::open(&dir, "/plant/pump/speed")?;
//! h.on_change(|ev| println!("{} = {:?}", ev.path, ev.value()));
//! h.set(42)?;
//! ```
//!
//! ## Serving and mirroring
//!
//! ```rust,ignore
//! use sharetree::{Connector, ConnectorOptions, Directory, HostEntry, Server, SessionConfig, SyncMode};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let dir = Directory::new();
//!     let server = Server::bind(&dir, "0.0.0.0:2022", SessionConfig::default()).await?;
//!     tokio::spawn(server.run());
//!
//!     let local = Directory::new();
//!     let options = ConnectorOptions {
//!         hosts: vec![HostEntry { host: "localhost".into(), port: 2022, priority: 0 }],
//!         ..Default::default()
//!     };
//!     let connector = Connector::start(&local, options);
//!     connector.mount("/remote/", "/", SyncMode::empty())?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod connector;
pub mod depend;
pub mod error;
pub mod flux;
pub mod item;
pub mod logging;
pub mod protocol;
pub mod server;
pub mod session;
pub mod storage;
pub mod tree;
pub mod types;
pub mod validation;

// Re-export commonly used types and functions
pub use config::Config;
pub use connector::{ConnectState, Connector, ConnectorEvent, ConnectorOptions, HostEntry};
pub use depend::Dependency;
pub use error::{ConfigError, ConnectionError, ErrorCode, Severity, TreeError};
pub use item::{Access, Handle};
pub use server::{Server, ShutdownHandle};
pub use session::{SessionConfig, SessionState};
pub use storage::{JsonFileStorage, MemoryStorage, NodeSnapshot, Storage, StorageError};
pub use tree::{Directory, EventKind, EventSink, Node, SubscriptionId, TreeEvent};
pub use types::{Allow, DataType, ModeFlags, NodeId, NodeKind, SameValue, SyncMode, Value, WriterId};

// vim: ts=4
