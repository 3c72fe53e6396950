//! Input checks shared by configuration loading and the tree
//!
//! [`config`] covers heartbeat, backoff and access-pattern settings; [`path`] covers
//! tree path syntax, twin names and mount rebasing.

use std::error::Error;
use std::fmt;

pub mod config;
pub mod path;

pub use config::*;
pub use path::*;

/// Rejected input, with a human-readable reason
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
	/// A configuration value out of range or malformed
	Setting(String),
	/// A tree path that does not follow the path grammar
	Path(String),
}

impl ValidationError {
	pub fn reason(&self) -> &str {
		match self {
			ValidationError::Setting(reason) | ValidationError::Path(reason) => reason,
		}
	}
}

impl fmt::Display for ValidationError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			ValidationError::Setting(reason) => write!(f, "Invalid setting: {}", reason),
			ValidationError::Path(reason) => write!(f, "Invalid path: {}", reason),
		}
	}
}

impl Error for ValidationError {}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_display_names_the_category() {
		assert_eq!(ValidationError::Setting("x".into()).to_string(), "Invalid setting: x");
		assert!(ValidationError::Path("y".into()).to_string().starts_with("Invalid path"));
	}

	#[test]
	fn test_reason_is_unprefixed() {
		let err = validate_tree_path("relative").unwrap_err();
		assert!(matches!(err, ValidationError::Path(_)));
		assert!(err.reason().contains("relative"));
	}
}

// vim: ts=4
