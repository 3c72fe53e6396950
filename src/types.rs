//! Value, identity and flag types shared by the tree, the handles and the wire protocol

use bitflags::bitflags;
use std::fmt;

/// Stable identity of a node, assigned at creation and never reused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "#{}", self.0)
	}
}

/// Identity stamped on every mutation, used to suppress echoes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WriterId(pub u64);

impl WriterId {
	/// Writer used by the directory itself (storage loads, internal bookkeeping)
	pub const SYSTEM: WriterId = WriterId(0);
}

/// Kind tag of a node, fixed at creation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
	Folder,
	Leaf,
	Provider,
}

impl NodeKind {
	pub fn is_folder(self) -> bool {
		self == NodeKind::Folder
	}
}

/// Type tag of a value slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
	Null,
	Int,
	Double,
	Bytes,
	String,
	Variant,
}

impl DataType {
	/// One-letter tag used on the wire and in storage snapshots
	pub fn tag(self) -> &'static str {
		match self {
			DataType::Null => "n",
			DataType::Int => "i",
			DataType::Double => "d",
			DataType::Bytes => "b",
			DataType::String => "s",
			DataType::Variant => "v",
		}
	}

	pub fn from_tag(tag: &str) -> Option<Self> {
		match tag {
			"n" => Some(DataType::Null),
			"i" => Some(DataType::Int),
			"d" => Some(DataType::Double),
			"b" => Some(DataType::Bytes),
			"s" => Some(DataType::String),
			"v" => Some(DataType::Variant),
			_ => None,
		}
	}
}

/// The payload of a value slot, replaced wholesale on every write
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
	#[default]
	Null,
	Int(i64),
	Double(f64),
	Bytes(Vec<u8>),
	String(String),
	Variant(serde_json::Value),
}

impl Value {
	pub fn data_type(&self) -> DataType {
		match self {
			Value::Null => DataType::Null,
			Value::Int(_) => DataType::Int,
			Value::Double(_) => DataType::Double,
			Value::Bytes(_) => DataType::Bytes,
			Value::String(_) => DataType::String,
			Value::Variant(_) => DataType::Variant,
		}
	}

	pub fn is_null(&self) -> bool {
		matches!(self, Value::Null)
	}

	/// Integer view, converting between representations where it makes sense
	pub fn to_int(&self) -> Option<i64> {
		match self {
			Value::Null => None,
			Value::Int(v) => Some(*v),
			Value::Double(v) => Some(*v as i64),
			Value::String(s) => s.trim().parse().ok(),
			Value::Bytes(b) => std::str::from_utf8(b).ok().and_then(|s| s.trim().parse().ok()),
			Value::Variant(v) => v.as_i64().or_else(|| v.as_f64().map(|f| f as i64)),
		}
	}

	pub fn to_double(&self) -> Option<f64> {
		match self {
			Value::Null => None,
			Value::Int(v) => Some(*v as f64),
			Value::Double(v) => Some(*v),
			Value::String(s) => s.trim().parse().ok(),
			Value::Bytes(b) => std::str::from_utf8(b).ok().and_then(|s| s.trim().parse().ok()),
			Value::Variant(v) => v.as_f64(),
		}
	}

	/// Text view; bytes are decoded lossily
	pub fn to_text(&self) -> String {
		match self {
			Value::Null => String::new(),
			Value::Int(v) => v.to_string(),
			Value::Double(v) => v.to_string(),
			Value::String(s) => s.clone(),
			Value::Bytes(b) => String::from_utf8_lossy(b).into_owned(),
			Value::Variant(v) => match v {
				serde_json::Value::String(s) => s.clone(),
				other => other.to_string(),
			},
		}
	}

	pub fn to_bytes(&self) -> Vec<u8> {
		match self {
			Value::Bytes(b) => b.clone(),
			other => other.to_text().into_bytes(),
		}
	}

	/// JSON payload as carried on the wire and in storage; the type tag travels beside it
	pub fn to_json(&self) -> serde_json::Value {
		use base64::Engine;
		match self {
			Value::Null => serde_json::Value::Null,
			Value::Int(v) => serde_json::Value::from(*v),
			Value::Double(v) => serde_json::Number::from_f64(*v)
				.map(serde_json::Value::Number)
				.unwrap_or_else(|| serde_json::Value::String(v.to_string())),
			Value::Bytes(b) => {
				serde_json::Value::String(base64::engine::general_purpose::STANDARD.encode(b))
			}
			Value::String(s) => serde_json::Value::String(s.clone()),
			Value::Variant(v) => v.clone(),
		}
	}

	/// Inverse of [`Value::to_json`]; `None` if the payload does not fit the type
	pub fn from_json(data_type: DataType, json: &serde_json::Value) -> Option<Value> {
		use base64::Engine;
		match data_type {
			DataType::Null => Some(Value::Null),
			DataType::Int => json.as_i64().map(Value::Int),
			DataType::Double => match json {
				serde_json::Value::String(s) => s.parse().ok().map(Value::Double),
				other => other.as_f64().map(Value::Double),
			},
			DataType::Bytes => json
				.as_str()
				.and_then(|s| base64::engine::general_purpose::STANDARD.decode(s).ok())
				.map(Value::Bytes),
			DataType::String => json.as_str().map(|s| Value::String(s.to_string())),
			DataType::Variant => Some(Value::Variant(json.clone())),
		}
	}
}

impl fmt::Display for Value {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.to_text())
	}
}

impl From<i32> for Value {
	fn from(v: i32) -> Self {
		Value::Int(v as i64)
	}
}

impl From<i64> for Value {
	fn from(v: i64) -> Self {
		Value::Int(v)
	}
}

impl From<bool> for Value {
	fn from(v: bool) -> Self {
		Value::Int(v as i64)
	}
}

impl From<f64> for Value {
	fn from(v: f64) -> Self {
		Value::Double(v)
	}
}

impl From<&str> for Value {
	fn from(v: &str) -> Self {
		Value::String(v.to_string())
	}
}

impl From<String> for Value {
	fn from(v: String) -> Self {
		Value::String(v)
	}
}

impl From<Vec<u8>> for Value {
	fn from(v: Vec<u8>) -> Self {
		Value::Bytes(v)
	}
}

impl From<&[u8]> for Value {
	fn from(v: &[u8]) -> Self {
		Value::Bytes(v.to_vec())
	}
}

impl From<serde_json::Value> for Value {
	fn from(v: serde_json::Value) -> Self {
		Value::Variant(v)
	}
}

/// Policy for writes that carry the value already stored
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SameValue {
	/// An equal value is accepted as already present: no write, no event
	Accept,
	/// Always write and emit, even when equal
	Emit,
	/// Defer to the handle's own ignore-same-value setting
	#[default]
	DefaultAction,
}

bitflags! {
	/// Orthogonal mode flags carried by a node
	#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
	pub struct ModeFlags: u8 {
		const BI_DIR = 0b0001;
		const PIPE = 0b0010;
		const SAVE = 0b0100;
		const THREADED = 0b1000;
	}
}

impl ModeFlags {
	/// Compact letter form used on the wire, e.g. "BP"
	pub fn to_mode_string(self) -> String {
		let mut s = String::new();
		if self.contains(ModeFlags::BI_DIR) {
			s.push('B');
		}
		if self.contains(ModeFlags::PIPE) {
			s.push('P');
		}
		if self.contains(ModeFlags::SAVE) {
			s.push('S');
		}
		if self.contains(ModeFlags::THREADED) {
			s.push('T');
		}
		s
	}

	/// Parse the letter form; unknown letters are ignored
	pub fn from_mode_string(s: &str) -> Self {
		s.chars().fold(ModeFlags::empty(), |acc, c| match c {
			'B' => acc | ModeFlags::BI_DIR,
			'P' => acc | ModeFlags::PIPE,
			'S' => acc | ModeFlags::SAVE,
			'T' => acc | ModeFlags::THREADED,
			_ => acc,
		})
	}
}

bitflags! {
	/// Per-subscription synchronization mode
	#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
	pub struct SyncMode: u8 {
		/// Client value is authoritative when the server has none
		const MASTER = 0b001;
		/// Announce existing and future descendants
		const MONITOR = 0b010;
		/// Retire the node when the session closes
		const AUTO_DESTROY = 0b100;
	}
}

impl SyncMode {
	pub fn to_mode_string(self) -> String {
		let mut s = String::new();
		if self.contains(SyncMode::MASTER) {
			s.push('M');
		}
		if self.contains(SyncMode::MONITOR) {
			s.push('N');
		}
		if self.contains(SyncMode::AUTO_DESTROY) {
			s.push('A');
		}
		s
	}

	pub fn from_mode_string(s: &str) -> Self {
		s.chars().fold(SyncMode::empty(), |acc, c| match c {
			'M' => acc | SyncMode::MASTER,
			'N' => acc | SyncMode::MONITOR,
			'A' => acc | SyncMode::AUTO_DESTROY,
			_ => acc,
		})
	}
}

bitflags! {
	/// Access rights granted to a logged-in session
	#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
	pub struct Allow: u8 {
		const READ = 0b00001;
		const WRITE = 0b00010;
		const CREATE = 0b00100;
		const DELETE = 0b01000;
		const MODE = 0b10000;
	}
}

impl Allow {
	/// Parse a right name as written in config files
	pub fn from_right_name(name: &str) -> Option<Self> {
		match name.to_ascii_lowercase().as_str() {
			"read" => Some(Allow::READ),
			"write" => Some(Allow::WRITE),
			"create" => Some(Allow::CREATE),
			"delete" => Some(Allow::DELETE),
			"mode" => Some(Allow::MODE),
			"all" => Some(Allow::all()),
			_ => None,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_value_conversions() {
		assert_eq!(Value::from("42").to_int(), Some(42));
		assert_eq!(Value::Double(2.9).to_int(), Some(2));
		assert_eq!(Value::Int(3).to_double(), Some(3.0));
		assert_eq!(Value::Null.to_int(), None);
		assert_eq!(Value::from(vec![b'h', b'i']).to_text(), "hi");
		assert_eq!(Value::from(serde_json::json!({"a": 1})).to_text(), "{\"a\":1}");
		assert_eq!(Value::from(true), Value::Int(1));
	}

	#[test]
	fn test_json_payloads() {
		let bytes = Value::Bytes(vec![0, 255, 7]);
		assert_eq!(bytes.to_json(), serde_json::json!("AP8H"));
		assert_eq!(Value::from_json(DataType::Bytes, &bytes.to_json()), Some(bytes));
		assert_eq!(Value::from_json(DataType::Int, &serde_json::json!("x")), None);
		let nan = Value::Double(f64::NAN).to_json();
		assert!(Value::from_json(DataType::Double, &nan).and_then(|v| v.to_double()).unwrap().is_nan());
	}

	#[test]
	fn test_data_type_tags() {
		for t in [
			DataType::Null,
			DataType::Int,
			DataType::Double,
			DataType::Bytes,
			DataType::String,
			DataType::Variant,
		] {
			assert_eq!(DataType::from_tag(t.tag()), Some(t));
		}
		assert_eq!(DataType::from_tag("x"), None);
	}

	#[test]
	fn test_mode_strings() {
		let mode = ModeFlags::BI_DIR | ModeFlags::PIPE;
		assert_eq!(mode.to_mode_string(), "BP");
		assert_eq!(ModeFlags::from_mode_string("BP"), mode);
		assert_eq!(ModeFlags::from_mode_string("xS"), ModeFlags::SAVE);
		assert_eq!(SyncMode::from_mode_string("MN"), SyncMode::MASTER | SyncMode::MONITOR);
		assert_eq!(SyncMode::AUTO_DESTROY.to_mode_string(), "A");
	}

	#[test]
	fn test_allow_names() {
		assert_eq!(Allow::from_right_name("Write"), Some(Allow::WRITE));
		assert_eq!(Allow::from_right_name("all"), Some(Allow::all()));
		assert_eq!(Allow::from_right_name("fly"), None);
	}
}

// vim: ts=4
