//! Persistence collaborator for Save-mode nodes
//!
//! The directory hands every value written to a Save-mode node to the configured
//! [`Storage`] and reads a snapshot back at startup. Two implementations ship here:
//! an in-memory map for tests and embedding, and a JSON file keyed by path.

use crate::logging::*;
use crate::types::{DataType, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

/// A persisted node value
#[derive(Debug, Clone, PartialEq)]
pub struct NodeSnapshot {
	pub path: String,
	pub value: Value,
	pub seq: u64,
}

/// Persistence backend
///
/// `store` is called from the event path with no tree lock held and must not block
/// for long. Failures are the backend's to report; the tree keeps the value either way.
pub trait Storage: Send + Sync {
	fn store(&self, path: &str, value: &Value, seq: u64);
	fn load(&self) -> Vec<NodeSnapshot>;
}

/// Storage errors
#[derive(Debug)]
pub enum StorageError {
	LoadFailed { path: PathBuf, source: std::io::Error },
	SaveFailed { path: PathBuf, source: std::io::Error },
	Corrupted { message: String },
}

impl fmt::Display for StorageError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			StorageError::LoadFailed { path, source } => {
				write!(f, "Failed to load {}: {}", path.display(), source)
			}
			StorageError::SaveFailed { path, source } => {
				write!(f, "Failed to save {}: {}", path.display(), source)
			}
			StorageError::Corrupted { message } => write!(f, "Storage corrupted: {}", message),
		}
	}
}

impl Error for StorageError {}

// ===========================================================================
// In-memory
// ===========================================================================

/// Storage that keeps snapshots in a map
#[derive(Default)]
pub struct MemoryStorage {
	entries: Mutex<BTreeMap<String, NodeSnapshot>>,
}

impl MemoryStorage {
	pub fn new() -> Self {
		Self::default()
	}

	/// Pre-populate an entry, as if it had been stored by an earlier run
	pub fn insert(&self, path: &str, value: Value) {
		let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
		entries.insert(path.to_string(), NodeSnapshot { path: path.to_string(), value, seq: 0 });
	}

	pub fn get(&self, path: &str) -> Option<Value> {
		let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
		entries.get(path).map(|s| s.value.clone())
	}

	pub fn len(&self) -> usize {
		self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}

impl Storage for MemoryStorage {
	fn store(&self, path: &str, value: &Value, seq: u64) {
		let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
		entries.insert(
			path.to_string(),
			NodeSnapshot { path: path.to_string(), value: value.clone(), seq },
		);
	}

	fn load(&self) -> Vec<NodeSnapshot> {
		let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
		entries.values().cloned().collect()
	}
}

// ===========================================================================
// JSON file
// ===========================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredEntry {
	#[serde(rename = "t")]
	data_type: String,
	#[serde(rename = "v")]
	value: serde_json::Value,
	#[serde(default)]
	seq: u64,
}

/// Storage backed by a single JSON document, rewritten on every store
pub struct JsonFileStorage {
	path: PathBuf,
	entries: Mutex<BTreeMap<String, StoredEntry>>,
}

impl JsonFileStorage {
	/// Open a storage file, starting empty if it does not exist yet
	pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
		let path = path.as_ref().to_path_buf();
		let entries = if path.exists() {
			let contents = std::fs::read_to_string(&path)
				.map_err(|e| StorageError::LoadFailed { path: path.clone(), source: e })?;
			serde_json::from_str(&contents).map_err(|e| StorageError::Corrupted {
				message: format!("Failed to parse {}: {}", path.display(), e),
			})?
		} else {
			BTreeMap::new()
		};
		Ok(JsonFileStorage { path, entries: Mutex::new(entries) })
	}

	pub fn path(&self) -> &Path {
		&self.path
	}

	fn flush(&self, entries: &BTreeMap<String, StoredEntry>) -> Result<(), StorageError> {
		if let Some(parent) = self.path.parent() {
			if !parent.as_os_str().is_empty() && !parent.exists() {
				std::fs::create_dir_all(parent)
					.map_err(|e| StorageError::SaveFailed { path: self.path.clone(), source: e })?;
			}
		}
		let json = serde_json::to_string_pretty(entries)
			.map_err(|e| StorageError::Corrupted { message: e.to_string() })?;
		std::fs::write(&self.path, json)
			.map_err(|e| StorageError::SaveFailed { path: self.path.clone(), source: e })
	}
}

impl Storage for JsonFileStorage {
	fn store(&self, path: &str, value: &Value, seq: u64) {
		let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
		entries.insert(
			path.to_string(),
			StoredEntry { data_type: value.data_type().tag().to_string(), value: value.to_json(), seq },
		);
		if let Err(e) = self.flush(&entries) {
			warn!("Persisting {} failed: {}", path, e);
		}
	}

	fn load(&self) -> Vec<NodeSnapshot> {
		let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
		entries
			.iter()
			.filter_map(|(path, entry)| {
				let value = DataType::from_tag(&entry.data_type)
					.and_then(|t| Value::from_json(t, &entry.value));
				if value.is_none() {
					warn!("Skipping unreadable stored value for {}", path);
				}
				value.map(|value| NodeSnapshot { path: path.clone(), value, seq: entry.seq })
			})
			.collect()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_memory_storage_keeps_latest() {
		let storage = MemoryStorage::new();
		storage.store("/cfg/a", &Value::Int(1), 1);
		storage.store("/cfg/a", &Value::Int(2), 2);
		let loaded = storage.load();
		assert_eq!(loaded.len(), 1);
		assert_eq!(loaded[0].value, Value::Int(2));
		assert_eq!(loaded[0].seq, 2);
	}

	#[test]
	fn test_json_file_storage_survives_reopen() {
		let dir = tempfile::tempdir().unwrap();
		let file = dir.path().join("nested").join("tree.json");
		{
			let storage = JsonFileStorage::open(&file).unwrap();
			storage.store("/cfg/name", &Value::from("pump"), 3);
			storage.store("/cfg/blob", &Value::Bytes(vec![1, 2, 3]), 1);
		}
		let storage = JsonFileStorage::open(&file).unwrap();
		let mut loaded = storage.load();
		loaded.sort_by(|a, b| a.path.cmp(&b.path));
		assert_eq!(loaded.len(), 2);
		assert_eq!(loaded[0].value, Value::Bytes(vec![1, 2, 3]));
		assert_eq!(loaded[1].value, Value::from("pump"));
		assert_eq!(loaded[1].seq, 3);
	}

	#[test]
	fn test_json_file_storage_rejects_garbage() {
		let dir = tempfile::tempdir().unwrap();
		let file = dir.path().join("tree.json");
		std::fs::write(&file, "not json").unwrap();
		assert!(matches!(JsonFileStorage::open(&file), Err(StorageError::Corrupted { .. })));
	}
}

// vim: ts=4
