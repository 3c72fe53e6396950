//! Startup dependencies on named paths
//!
//! External orchestration code can block its own startup until some paths exist and
//! carry a value. A bare name refers to the service entry `/Sys/Service/<name>`; a
//! name starting with `/` is taken as a path.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;
use uuid::Uuid;

use crate::error::TreeError;
use crate::logging::*;
use crate::tree::{Directory, EventKind, EventSink, Node, SubscriptionId, TreeEvent};
use crate::validation::validate_tree_path;

/// Folder holding service entries
pub const SERVICE_FOLDER: &str = "/Sys/Service/";

type CompletedFn = Box<dyn Fn() + Send + Sync>;

struct Waiting {
	paths: HashSet<String>,
	started: bool,
	done: bool,
}

struct DependencySink {
	id: Uuid,
	waiting: Mutex<Waiting>,
	done: watch::Sender<bool>,
	on_completed: Mutex<Option<CompletedFn>>,
}

impl DependencySink {
	/// Mark `path` as satisfied, completing the dependency if nothing is left
	fn satisfy(&self, path: &str) {
		let finished = {
			let mut waiting = self.waiting.lock().unwrap_or_else(PoisonError::into_inner);
			waiting.paths.remove(path);
			if waiting.done || !waiting.started || !waiting.paths.is_empty() {
				return;
			}
			waiting.done = true;
			true
		};
		if finished {
			info!("Dependency {} completed", self.id);
			self.done.send_replace(true);
			let callback = self.on_completed.lock().unwrap_or_else(PoisonError::into_inner);
			if let Some(callback) = callback.as_ref() {
				callback();
			}
		}
	}
}

impl EventSink for DependencySink {
	fn on_event(&self, event: &TreeEvent) {
		if matches!(event.kind, EventKind::ValueChanged { .. }) {
			self.satisfy(&event.path);
		}
	}
}

/// Waits until every monitored path has a value
pub struct Dependency {
	dir: Directory,
	root: Arc<Node>,
	subscription: SubscriptionId,
	sink: Arc<DependencySink>,
	done: watch::Receiver<bool>,
}

impl Dependency {
	pub fn new(dir: &Directory) -> Result<Self, TreeError> {
		let (tx, rx) = watch::channel(false);
		let sink = Arc::new(DependencySink {
			id: Uuid::new_v4(),
			waiting: Mutex::new(Waiting { paths: HashSet::new(), started: false, done: false }),
			done: tx,
			on_completed: Mutex::new(None),
		});
		let root = dir.root();
		let subscription = dir.subscribe(&root, sink.clone(), true)?;
		Ok(Dependency { dir: dir.clone(), root, subscription, sink, done: rx })
	}

	pub fn id(&self) -> Uuid {
		self.sink.id
	}

	/// Add a path, or a service name, to wait for
	pub fn start_monitor(&self, name: &str) -> Result<(), TreeError> {
		let path = if name.starts_with('/') { name.to_string() } else { format!("{}{}", SERVICE_FOLDER, name) };
		if path.ends_with('/') || validate_tree_path(&path).is_err() {
			return Err(TreeError::InvalidPath { path });
		}
		debug!("Dependency {} waits for {}", self.sink.id, path);
		{
			let mut waiting = self.sink.waiting.lock().unwrap_or_else(PoisonError::into_inner);
			if waiting.done {
				return Ok(());
			}
			waiting.started = true;
			waiting.paths.insert(path.clone());
		}
		// The sink is registered already, so a value written from now on is not missed
		if self.dir.lookup(&path).map_or(false, |n| n.has_value()) {
			self.sink.satisfy(&path);
		}
		Ok(())
	}

	/// Paths still missing a value
	pub fn pending(&self) -> Vec<String> {
		let waiting = self.sink.waiting.lock().unwrap_or_else(PoisonError::into_inner);
		let mut paths: Vec<String> = waiting.paths.iter().cloned().collect();
		paths.sort();
		paths
	}

	pub fn completed(&self) -> bool {
		*self.done.borrow()
	}

	/// Run `callback` once on completion, right away if already complete
	pub fn on_completed(&self, callback: impl Fn() + Send + Sync + 'static) {
		let mut slot = self.sink.on_completed.lock().unwrap_or_else(PoisonError::into_inner);
		if self.completed() {
			drop(slot);
			callback();
			return;
		}
		*slot = Some(Box::new(callback));
	}

	/// Wait for completion
	pub async fn wait(&self) {
		let mut rx = self.done.clone();
		let _ = rx.wait_for(|done| *done).await;
	}
}

impl Drop for Dependency {
	fn drop(&mut self) {
		self.dir.unsubscribe(&self.root, self.subscription);
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::types::{SameValue, Value, WriterId};
	use std::sync::atomic::{AtomicUsize, Ordering};

	fn write(dir: &Directory, path: &str, value: i64) {
		let node = dir.resolve(path, true).unwrap();
		dir.set_value(&node, Value::Int(value), SameValue::Emit, WriterId::SYSTEM).unwrap();
	}

	#[test]
	fn test_completes_when_all_paths_have_values() {
		let dir = Directory::new();
		let dep = Dependency::new(&dir).unwrap();
		let fired = Arc::new(AtomicUsize::new(0));
		let counter = fired.clone();
		dep.on_completed(move || {
			counter.fetch_add(1, Ordering::SeqCst);
		});
		dep.start_monitor("db").unwrap();
		dep.start_monitor("/plant/ready").unwrap();
		assert_eq!(dep.pending(), vec!["/Sys/Service/db".to_string(), "/plant/ready".to_string()]);

		write(&dir, "/Sys/Service/db", 1);
		assert!(!dep.completed());
		write(&dir, "/plant/ready", 1);
		assert!(dep.completed());
		write(&dir, "/plant/ready", 2);
		assert_eq!(fired.load(Ordering::SeqCst), 1);
	}

	#[test]
	fn test_existing_value_satisfies_immediately() {
		let dir = Directory::new();
		let node = dir.resolve("/Sys/Service/web", true).unwrap();
		dir.set_persistent(&node, true);
		dir.set_value(&node, Value::Int(1), SameValue::Emit, WriterId::SYSTEM).unwrap();
		let dep = Dependency::new(&dir).unwrap();
		assert!(!dep.completed());
		dep.start_monitor("web").unwrap();
		assert!(dep.completed());
	}

	#[test]
	fn test_rejects_folder_names() {
		let dir = Directory::new();
		let dep = Dependency::new(&dir).unwrap();
		assert!(matches!(dep.start_monitor("/plant/"), Err(TreeError::InvalidPath { .. })));
	}

	#[tokio::test]
	async fn test_wait_resolves() {
		let dir = Directory::new();
		let dep = Dependency::new(&dir).unwrap();
		dep.start_monitor("svc").unwrap();
		let writer = dir.clone();
		std::thread::spawn(move || write(&writer, "/Sys/Service/svc", 1));
		tokio::time::timeout(std::time::Duration::from_secs(5), dep.wait()).await.unwrap();
		assert!(dep.completed());
	}
}

// vim: ts=4
