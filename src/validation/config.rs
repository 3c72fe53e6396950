//! Configuration validation functions

use super::ValidationError;

/// Validate a heartbeat interval in milliseconds
pub fn validate_heartbeat_interval(interval_ms: u64) -> Result<(), ValidationError> {
	if interval_ms == 0 {
		return Err(ValidationError::Setting(
			"Heartbeat interval must be greater than 0".to_string(),
		));
	}
	if interval_ms > 3_600_000 {
		return Err(ValidationError::Setting(format!(
			"Heartbeat interval too large: {} ms (max 3600000)",
			interval_ms
		)));
	}
	Ok(())
}

/// Validate the number of heartbeats that may be missed before a session closes
pub fn validate_max_missed(max_missed: u32) -> Result<(), ValidationError> {
	if max_missed == 0 {
		return Err(ValidationError::Setting(
			"Missed heartbeat limit must be at least 1".to_string(),
		));
	}
	Ok(())
}

/// Validate a reconnect backoff window
///
/// # Arguments
/// * `initial_ms` - First retry delay
/// * `max_ms` - Upper bound the delay doubles towards
pub fn validate_backoff(initial_ms: u64, max_ms: u64) -> Result<(), ValidationError> {
	if initial_ms == 0 {
		return Err(ValidationError::Setting("Retry delay must be greater than 0".to_string()));
	}
	if max_ms < initial_ms {
		return Err(ValidationError::Setting(format!(
			"Maximum retry delay {} ms is below initial delay {} ms",
			max_ms, initial_ms
		)));
	}
	Ok(())
}

/// Validate an access glob pattern
pub fn validate_access_pattern(pattern: &str) -> Result<(), ValidationError> {
	globset::Glob::new(pattern).map(|_| ()).map_err(|e| {
		ValidationError::Setting(format!("Bad access pattern {:?}: {}", pattern, e))
	})
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_validate_heartbeat_interval() {
		assert!(validate_heartbeat_interval(5000).is_ok());
		let result = validate_heartbeat_interval(0);
		assert!(result.unwrap_err().to_string().contains("greater than 0"));
		assert!(validate_heartbeat_interval(4_000_000).is_err());
	}

	#[test]
	fn test_validate_max_missed() {
		assert!(validate_max_missed(3).is_ok());
		assert!(validate_max_missed(0).is_err());
	}

	#[test]
	fn test_validate_backoff() {
		assert!(validate_backoff(2000, 30000).is_ok());
		assert!(validate_backoff(2000, 2000).is_ok());
		assert!(validate_backoff(0, 10).is_err());
		let result = validate_backoff(5000, 1000);
		assert!(result.unwrap_err().to_string().contains("below initial"));
	}

	#[test]
	fn test_validate_access_pattern() {
		assert!(validate_access_pattern("/public/**").is_ok());
		assert!(validate_access_pattern("/bad/[").is_err());
	}
}

// vim: ts=4
