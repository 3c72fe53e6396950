//! Protocol error types
//!
//! Every variant is fatal to the session it occurred in and to nothing else.

use std::fmt;
use std::io;

use crate::error::ErrorCode;

/// Protocol error type
#[derive(Debug)]
pub enum ProtocolError {
	/// I/O error on the transport
	Io(io::Error),
	/// Line is not a JSON5 object
	Json5(String),
	/// Record with an unknown `cmd`
	UnknownRecord(String),
	/// Known record arriving in a state where it makes no sense
	UnexpectedRecord(String),
	/// Path alias that was never announced by the peer
	UnknownAlias(u64),
	/// Required field missing or of the wrong type
	BadField { cmd: String, field: &'static str },
	/// Credentials rejected
	LoginBad,
	/// Peer stopped answering heartbeats
	HeartbeatTimeout,
}

impl ProtocolError {
	pub fn code(&self) -> ErrorCode {
		match self {
			ProtocolError::Io(_) | ProtocolError::HeartbeatTimeout => {
				ErrorCode::ConnectionError
			}
			ProtocolError::Json5(_) => ErrorCode::ScriptError,
			ProtocolError::UnknownRecord(_)
			| ProtocolError::UnknownAlias(_)
			| ProtocolError::BadField { .. } => ErrorCode::RecUnknown,
			ProtocolError::UnexpectedRecord(_) => ErrorCode::RecNotExpected,
			ProtocolError::LoginBad => ErrorCode::LoginBad,
		}
	}
}

impl fmt::Display for ProtocolError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			ProtocolError::Io(e) => write!(f, "I/O error: {}", e),
			ProtocolError::Json5(msg) => write!(f, "JSON5 parse error: {}", msg),
			ProtocolError::UnknownRecord(cmd) => write!(f, "Unknown record: {}", cmd),
			ProtocolError::UnexpectedRecord(cmd) => write!(f, "Record not expected: {}", cmd),
			ProtocolError::UnknownAlias(alias) => write!(f, "Unknown path alias: {}", alias),
			ProtocolError::BadField { cmd, field } => {
				write!(f, "Missing or malformed field {:?} in {} record", field, cmd)
			}
			ProtocolError::LoginBad => write!(f, "Login rejected"),
			ProtocolError::HeartbeatTimeout => write!(f, "Peer missed too many heartbeats"),
		}
	}
}

impl std::error::Error for ProtocolError {}

impl From<io::Error> for ProtocolError {
	fn from(e: io::Error) -> Self {
		ProtocolError::Io(e)
	}
}

impl From<json5::Error> for ProtocolError {
	fn from(e: json5::Error) -> Self {
		ProtocolError::Json5(e.to_string())
	}
}

impl From<serde_json::Error> for ProtocolError {
	fn from(e: serde_json::Error) -> Self {
		ProtocolError::Json5(e.to_string())
	}
}


// vim: ts=4
