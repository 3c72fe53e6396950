//! Tree path validation and splitting
//!
//! Paths are absolute, `/`-separated and case-sensitive. A trailing `/` names a
//! folder, anything else names a leaf. A leaf whose last segment ends in `!` is the
//! provider twin of the leaf without the `!`.

use super::ValidationError;

/// Suffix marking a provider twin
pub const PROVIDER_SUFFIX: char = '!';

/// Check if a single segment is acceptable as a node name
pub fn is_name_valid(name: &str) -> bool {
	!name.is_empty()
		&& name != "."
		&& name != ".."
		&& !name.contains('/')
		&& !name.chars().any(|c| c.is_control())
}

/// Validate a full path
///
/// # Returns
/// `Ok(())` if the path is absolute and every segment is a valid name
pub fn validate_tree_path(path: &str) -> Result<(), ValidationError> {
	if !path.starts_with('/') {
		return Err(ValidationError::Path(format!("Path must be absolute: {:?}", path)));
	}
	let body = path.trim_start_matches('/');
	let body = body.strip_suffix('/').unwrap_or(body);
	if body.is_empty() {
		return Ok(());
	}
	for segment in body.split('/') {
		if !is_name_valid(segment) {
			return Err(ValidationError::Path(format!(
				"Invalid segment {:?} in path {:?}",
				segment, path
			)));
		}
	}
	Ok(())
}

/// Split a path into its segments and whether it names a folder
///
/// The root path `/` yields no segments and is a folder.
pub fn split_tree_path(path: &str) -> Result<(Vec<&str>, bool), ValidationError> {
	validate_tree_path(path)?;
	let is_folder = path.ends_with('/');
	let body = path.trim_start_matches('/');
	let body = body.strip_suffix('/').unwrap_or(body);
	if body.is_empty() {
		return Ok((Vec::new(), true));
	}
	Ok((body.split('/').collect(), is_folder))
}

/// Join a parent folder path and a child name
pub fn child_path(parent: &str, name: &str, is_folder: bool) -> String {
	let mut path = String::with_capacity(parent.len() + name.len() + 2);
	path.push_str(parent);
	if !path.ends_with('/') {
		path.push('/');
	}
	path.push_str(name);
	if is_folder {
		path.push('/');
	}
	path
}

/// Check if a path lies at or below a folder path
pub fn is_below(path: &str, folder: &str) -> bool {
	let folder = if folder.ends_with('/') { folder.to_string() } else { format!("{}/", folder) };
	path.starts_with(&folder) || path == folder.trim_end_matches('/')
}

/// Replace a prefix of `path`, used to map between local and remote mounts
pub fn rebase(path: &str, from: &str, to: &str) -> Option<String> {
	path.strip_prefix(from).map(|rest| format!("{}{}", to, rest))
}

/// Name of the provider twin of a leaf name
pub fn twin_name(name: &str) -> String {
	match name.strip_suffix(PROVIDER_SUFFIX) {
		Some(base) => base.to_string(),
		None => format!("{}{}", name, PROVIDER_SUFFIX),
	}
}

pub fn is_provider_name(name: &str) -> bool {
	name.len() > 1 && name.ends_with(PROVIDER_SUFFIX)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_split_leaf_and_folder() {
		assert_eq!(split_tree_path("/A/B/value").unwrap(), (vec!["A", "B", "value"], false));
		assert_eq!(split_tree_path("/A/B/").unwrap(), (vec!["A", "B"], true));
		assert_eq!(split_tree_path("/").unwrap(), (vec![], true));
	}

	#[test]
	fn test_validate_rejects_bad_paths() {
		assert!(validate_tree_path("relative/path").is_err());
		assert!(validate_tree_path("/a//b").is_err());
		assert!(validate_tree_path("/a/../b").is_err());
		assert!(validate_tree_path("/a/\nb").is_err());
		let err = validate_tree_path("/a/./b").unwrap_err();
		assert!(err.to_string().contains("Invalid segment"));
	}

	#[test]
	fn test_paths_are_case_sensitive() {
		let (a, _) = split_tree_path("/Data/x").unwrap();
		let (b, _) = split_tree_path("/data/x").unwrap();
		assert_ne!(a, b);
	}

	#[test]
	fn test_child_path_and_below() {
		assert_eq!(child_path("/A/", "b", false), "/A/b");
		assert_eq!(child_path("/A", "sub", true), "/A/sub/");
		assert!(is_below("/A/b/c", "/A/"));
		assert!(is_below("/A", "/A/"));
		assert!(!is_below("/AB/c", "/A/"));
	}

	#[test]
	fn test_rebase() {
		assert_eq!(rebase("/local/x/y", "/local/", "/remote/").as_deref(), Some("/remote/x/y"));
		assert_eq!(rebase("/other/x", "/local/", "/remote/"), None);
	}

	#[test]
	fn test_twin_names() {
		assert_eq!(twin_name("cmd"), "cmd!");
		assert_eq!(twin_name("cmd!"), "cmd");
		assert!(is_provider_name("cmd!"));
		assert!(!is_provider_name("!"));
	}
}

// vim: ts=4
