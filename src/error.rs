//! Error types for sharetree operations

use std::error::Error;
use std::fmt;
use std::io;

/// Severity class of a status code
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
	Ok,
	Info,
	Warning,
	Error,
}

/// Closed set of status codes shared by the local API and the wire protocol
///
/// The numeric values are what travels in the `stat` field of reply records,
/// so they must never be renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum ErrorCode {
	#[default]
	Ok = 0,
	Info = 1,
	Warning = 2,
	Undef = 15,
	CreateError = 16,
	NotFound,
	NotOpen,
	AlreadyExist,
	AlreadyOpen,
	Retired,
	NotMainThread,
	FolderNotOpen,
	ItemNotOpen,
	ItemNotSet,
	ConnectionError,
	RecUnknown,
	RecNotExpected,
	ScriptError,
	LoginBad,
	OpNotAllowed,
}

impl ErrorCode {
	const ALL: [ErrorCode; 20] = [
		ErrorCode::Ok,
		ErrorCode::Info,
		ErrorCode::Warning,
		ErrorCode::Undef,
		ErrorCode::CreateError,
		ErrorCode::NotFound,
		ErrorCode::NotOpen,
		ErrorCode::AlreadyExist,
		ErrorCode::AlreadyOpen,
		ErrorCode::Retired,
		ErrorCode::NotMainThread,
		ErrorCode::FolderNotOpen,
		ErrorCode::ItemNotOpen,
		ErrorCode::ItemNotSet,
		ErrorCode::ConnectionError,
		ErrorCode::RecUnknown,
		ErrorCode::RecNotExpected,
		ErrorCode::ScriptError,
		ErrorCode::LoginBad,
		ErrorCode::OpNotAllowed,
	];

	/// Numeric wire value
	pub fn as_u8(self) -> u8 {
		self as u8
	}

	/// Decode a wire value, unknown numbers map to `Undef`
	pub fn from_u8(value: u8) -> Self {
		Self::ALL.iter().copied().find(|c| c.as_u8() == value).unwrap_or(ErrorCode::Undef)
	}

	pub fn severity(self) -> Severity {
		match self {
			ErrorCode::Ok => Severity::Ok,
			ErrorCode::Info => Severity::Info,
			ErrorCode::Warning => Severity::Warning,
			_ => Severity::Error,
		}
	}

	pub fn is_ok(self) -> bool {
		self == ErrorCode::Ok
	}

	/// Protocol class codes close the session they occur on
	pub fn is_fatal_to_session(self) -> bool {
		matches!(
			self,
			ErrorCode::ConnectionError
				| ErrorCode::RecUnknown
				| ErrorCode::RecNotExpected
				| ErrorCode::LoginBad
		)
	}
}

impl fmt::Display for ErrorCode {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let name = match self {
			ErrorCode::Ok => "Ok",
			ErrorCode::Info => "Info",
			ErrorCode::Warning => "Warning",
			ErrorCode::Undef => "Undefined error",
			ErrorCode::CreateError => "Create error",
			ErrorCode::NotFound => "Not found",
			ErrorCode::NotOpen => "Not open",
			ErrorCode::AlreadyExist => "Already exist",
			ErrorCode::AlreadyOpen => "Already open",
			ErrorCode::Retired => "Retired",
			ErrorCode::NotMainThread => "Not main thread",
			ErrorCode::FolderNotOpen => "Folder not open",
			ErrorCode::ItemNotOpen => "Item not open",
			ErrorCode::ItemNotSet => "Item not set",
			ErrorCode::ConnectionError => "Connection error",
			ErrorCode::RecUnknown => "Unknown record",
			ErrorCode::RecNotExpected => "Record not expected",
			ErrorCode::ScriptError => "Script error",
			ErrorCode::LoginBad => "Login bad",
			ErrorCode::OpNotAllowed => "Operation not allowed",
		};
		write!(f, "{}", name)
	}
}

/// Main error type for local tree operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreeError {
	/// Path does not resolve to a node
	NotFound { path: String },

	/// A live node with this name already exists
	AlreadyExist { path: String },

	/// Handle is already bound
	AlreadyOpen { path: String },

	/// Handle is not bound to anything
	NotOpen,

	/// Parent of an operation is not a folder, or a folder is required
	FolderNotOpen { path: String },

	/// Bound node is retired or the handle is unbound
	ItemNotOpen { path: String },

	/// Node has never been written
	ItemNotSet { path: String },

	/// Node was retired before the operation
	Retired { path: String },

	/// Restricted-affinity operation from an unsanctioned thread
	NotMainThread,

	/// Write or mode change refused by the node's mode or caller's rights
	OpNotAllowed { path: String, reason: String },

	/// Path string is malformed
	InvalidPath { path: String },

	/// Local and remote views disagree in a way that cannot be merged
	ScriptError { message: String },
}

impl TreeError {
	pub fn code(&self) -> ErrorCode {
		match self {
			TreeError::NotFound { .. } => ErrorCode::NotFound,
			TreeError::AlreadyExist { .. } => ErrorCode::AlreadyExist,
			TreeError::AlreadyOpen { .. } => ErrorCode::AlreadyOpen,
			TreeError::NotOpen => ErrorCode::NotOpen,
			TreeError::FolderNotOpen { .. } => ErrorCode::FolderNotOpen,
			TreeError::ItemNotOpen { .. } => ErrorCode::ItemNotOpen,
			TreeError::ItemNotSet { .. } => ErrorCode::ItemNotSet,
			TreeError::Retired { .. } => ErrorCode::Retired,
			TreeError::NotMainThread => ErrorCode::NotMainThread,
			TreeError::OpNotAllowed { .. } => ErrorCode::OpNotAllowed,
			TreeError::InvalidPath { .. } => ErrorCode::CreateError,
			TreeError::ScriptError { .. } => ErrorCode::ScriptError,
		}
	}

	pub(crate) fn not_allowed(path: &str, reason: &str) -> Self {
		TreeError::OpNotAllowed { path: path.to_string(), reason: reason.to_string() }
	}
}

impl fmt::Display for TreeError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			TreeError::NotFound { path } => write!(f, "Not found: {}", path),
			TreeError::AlreadyExist { path } => write!(f, "Already exist: {}", path),
			TreeError::AlreadyOpen { path } => write!(f, "Handle already open on {}", path),
			TreeError::NotOpen => write!(f, "Handle not open"),
			TreeError::FolderNotOpen { path } => write!(f, "Not a folder: {}", path),
			TreeError::ItemNotOpen { path } => write!(f, "Item not open: {}", path),
			TreeError::ItemNotSet { path } => write!(f, "Item not set: {}", path),
			TreeError::Retired { path } => write!(f, "Node retired: {}", path),
			TreeError::NotMainThread => {
				write!(f, "Item used from a thread without threaded access enabled")
			}
			TreeError::OpNotAllowed { path, reason } => {
				write!(f, "Operation not allowed on {}: {}", path, reason)
			}
			TreeError::InvalidPath { path } => write!(f, "Invalid path: {:?}", path),
			TreeError::ScriptError { message } => write!(f, "Script error: {}", message),
		}
	}
}

impl Error for TreeError {}

/// Connection-specific errors
#[derive(Debug)]
pub enum ConnectionError {
	/// TCP connect failed
	ConnectFailed { addr: String, source: io::Error },

	/// No host configured to connect to
	NoHost,

	/// Protocol handshake failed
	HandshakeFailed { message: String },

	/// Server refused the credentials
	LoginBad,

	/// Protocol error (invalid record or desync)
	ProtocolError { message: String },

	/// Connection disconnected unexpectedly
	Disconnected,

	/// Operation timeout
	Timeout,

	/// Peer answered a command with an error status
	Remote { code: ErrorCode, message: String },
}

impl ConnectionError {
	pub fn code(&self) -> ErrorCode {
		match self {
			ConnectionError::LoginBad => ErrorCode::LoginBad,
			ConnectionError::ProtocolError { .. } => ErrorCode::RecUnknown,
			ConnectionError::Remote { code, .. } => *code,
			_ => ErrorCode::ConnectionError,
		}
	}
}

impl fmt::Display for ConnectionError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			ConnectionError::ConnectFailed { addr, source } => {
				write!(f, "Connection to {} failed: {}", addr, source)
			}
			ConnectionError::NoHost => write!(f, "No host to connect to"),
			ConnectionError::HandshakeFailed { message } => {
				write!(f, "Handshake failed: {}", message)
			}
			ConnectionError::LoginBad => write!(f, "Login rejected by server"),
			ConnectionError::ProtocolError { message } => {
				write!(f, "Protocol error: {}", message)
			}
			ConnectionError::Disconnected => write!(f, "Connection disconnected"),
			ConnectionError::Timeout => write!(f, "Connection timeout"),
			ConnectionError::Remote { code, message } => write!(f, "{}: {}", code, message),
		}
	}
}

impl Error for ConnectionError {}

impl From<crate::protocol::ProtocolError> for ConnectionError {
	fn from(e: crate::protocol::ProtocolError) -> Self {
		match e {
			crate::protocol::ProtocolError::LoginBad => ConnectionError::LoginBad,
			crate::protocol::ProtocolError::HeartbeatTimeout => ConnectionError::Timeout,
			other => ConnectionError::ProtocolError { message: other.to_string() },
		}
	}
}

/// Configuration errors
#[derive(Debug)]
pub enum ConfigError {
	/// Config file could not be read
	Io { path: String, source: io::Error },

	/// Config file could not be parsed
	Parse { path: String, message: String },

	/// Config values are inconsistent
	Invalid { message: String },
}

impl fmt::Display for ConfigError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			ConfigError::Io { path, source } => write!(f, "Cannot read {}: {}", path, source),
			ConfigError::Parse { path, message } => write!(f, "Cannot parse {}: {}", path, message),
			ConfigError::Invalid { message } => write!(f, "Invalid configuration: {}", message),
		}
	}
}

impl Error for ConfigError {}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_code_wire_values_are_stable() {
		assert_eq!(ErrorCode::Ok.as_u8(), 0);
		assert_eq!(ErrorCode::CreateError.as_u8(), 16);
		assert_eq!(ErrorCode::NotFound.as_u8(), 17);
		assert_eq!(ErrorCode::RecUnknown.as_u8(), 27);
		for code in ErrorCode::ALL {
			assert_eq!(ErrorCode::from_u8(code.as_u8()), code);
		}
		assert_eq!(ErrorCode::from_u8(200), ErrorCode::Undef);
	}

	#[test]
	fn test_severity() {
		assert_eq!(ErrorCode::Ok.severity(), Severity::Ok);
		assert_eq!(ErrorCode::Warning.severity(), Severity::Warning);
		assert_eq!(ErrorCode::ItemNotSet.severity(), Severity::Error);
		assert!(ErrorCode::RecUnknown.is_fatal_to_session());
		assert!(!ErrorCode::OpNotAllowed.is_fatal_to_session());
	}

	#[test]
	fn test_tree_error_maps_to_code() {
		let err = TreeError::ItemNotOpen { path: "/a".to_string() };
		assert_eq!(err.code(), ErrorCode::ItemNotOpen);
		assert!(err.to_string().contains("/a"));
		assert_eq!(TreeError::not_allowed("/p", "pipe").code(), ErrorCode::OpNotAllowed);
	}
}

// vim: ts=4
