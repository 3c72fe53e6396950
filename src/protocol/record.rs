//! Wire records
//!
//! One record per line, each a JSON object with a `cmd` key. Records that name a
//! tree path for synchronization carry a numeric alias `a`; the sender adds the full
//! path `pth` only the first time it uses an alias on a connection. One-shot commands
//! (`GET`, `SET`, `LS`) and `ERR` always carry the full path.
//!
//! ```text
//! {"cmd":"SUB","a":1,"pth":"/A/B/value","smd":"M","typ":"i","val":0}
//! {"cmd":"VAL","a":1,"typ":"i","val":5,"seq":2}
//! {"cmd":"LOGIN","stg":1,"usr":"op","slt":"9f..","hsh":"4c.."}
//! ```

use crate::error::ErrorCode;
use crate::types::{Allow, ModeFlags, NodeKind, SyncMode, Value};

/// Outcome announced in a login reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginStatus {
	/// Access granted with the attached rights
	Ok,
	/// Credentials required; the reply carries the server salt
	Challenge,
	/// Credentials rejected; the server closes the connection
	Bad,
}

impl LoginStatus {
	pub fn as_str(self) -> &'static str {
		match self {
			LoginStatus::Ok => "ok",
			LoginStatus::Challenge => "chal",
			LoginStatus::Bad => "bad",
		}
	}

	pub fn parse(s: &str) -> Option<Self> {
		match s {
			"ok" => Some(LoginStatus::Ok),
			"chal" => Some(LoginStatus::Challenge),
			"bad" => Some(LoginStatus::Bad),
			_ => None,
		}
	}
}

/// Client side of the login handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginRequest {
	/// First stage, sent on every connect
	Hello,
	/// Second stage, answering a challenge
	Credentials { user: String, salt: String, hash: String },
}

/// Answer to a one-shot command
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Reply {
	pub code: ErrorCode,
	pub value: Option<Value>,
	pub items: Vec<String>,
	pub version: Option<String>,
	pub message: Option<String>,
}

impl Reply {
	pub fn ok() -> Self {
		Reply { code: ErrorCode::Ok, ..Default::default() }
	}

	pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
		Reply { code, message: Some(message.into()), ..Default::default() }
	}
}

/// A decoded protocol operation, with aliases already resolved to paths
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
	Value { path: String, value: Value, seq: u64, overwrite_key: Option<String> },
	CreateNode { path: String, kind: NodeKind },
	ModeChange { path: String, mode: ModeFlags },
	Retire { path: String },
	Subscribe { path: String, sync_mode: SyncMode, initial: Option<Value> },
	Unsubscribe { path: String },
	RefChange { path: String, refs: u64 },
	Heartbeat,
	Login(LoginRequest),
	LoginReply { status: LoginStatus, salt: Option<String>, allow: Allow },
	Get { rid: u64, path: String },
	Set { rid: u64, path: String, value: Value },
	Ls { rid: u64, path: String },
	Version { rid: u64 },
	Exit,
	Reply { rid: u64, reply: Reply },
	Error { code: ErrorCode, path: Option<String>, message: String },
}

impl Record {
	/// Wire name of the record
	pub fn cmd(&self) -> &'static str {
		match self {
			Record::Value { .. } => "VAL",
			Record::CreateNode { .. } => "NEW",
			Record::ModeChange { .. } => "MOD",
			Record::Retire { .. } => "RET",
			Record::Subscribe { .. } => "SUB",
			Record::Unsubscribe { .. } => "UNS",
			Record::RefChange { .. } => "REF",
			Record::Heartbeat => "HB",
			Record::Login(_) => "LOGIN",
			Record::LoginReply { .. } => "LREP",
			Record::Get { .. } => "GET",
			Record::Set { .. } => "SET",
			Record::Ls { .. } => "LS",
			Record::Version { .. } => "VER",
			Record::Exit => "EXIT",
			Record::Reply { .. } => "RPL",
			Record::Error { .. } => "ERR",
		}
	}

	/// Path carried through the alias table, if the record has one
	pub fn synced_path(&self) -> Option<&str> {
		match self {
			Record::Value { path, .. }
			| Record::CreateNode { path, .. }
			| Record::ModeChange { path, .. }
			| Record::Retire { path }
			| Record::Subscribe { path, .. }
			| Record::Unsubscribe { path }
			| Record::RefChange { path, .. } => Some(path),
			_ => None,
		}
	}

	pub fn error(code: ErrorCode, path: Option<&str>, message: impl Into<String>) -> Self {
		Record::Error { code, path: path.map(str::to_string), message: message.into() }
	}
}

pub(crate) fn kind_tag(kind: NodeKind) -> &'static str {
	match kind {
		NodeKind::Folder => "f",
		NodeKind::Leaf => "l",
		NodeKind::Provider => "p",
	}
}

pub(crate) fn kind_from_tag(tag: &str) -> Option<NodeKind> {
	match tag {
		"f" => Some(NodeKind::Folder),
		"l" => Some(NodeKind::Leaf),
		"p" => Some(NodeKind::Provider),
		_ => None,
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_synced_path() {
		let rec = Record::Retire { path: "/x".into() };
		assert_eq!(rec.synced_path(), Some("/x"));
		assert_eq!(Record::Get { rid: 1, path: "/x".into() }.synced_path(), None);
		assert_eq!(Record::Heartbeat.cmd(), "HB");
	}

	#[test]
	fn test_login_status_names() {
		for s in [LoginStatus::Ok, LoginStatus::Challenge, LoginStatus::Bad] {
			assert_eq!(LoginStatus::parse(s.as_str()), Some(s));
		}
		assert_eq!(LoginStatus::parse("maybe"), None);
	}
}

// vim: ts=4
