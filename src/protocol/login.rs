//! Salted login
//!
//! The server answers the first login stage with a random salt. The client proves
//! knowledge of the password by sending `blake3(password "." server_salt "." client_salt)`
//! together with its own salt, so the password never crosses the wire.

use std::collections::HashMap;

use crate::types::Allow;

/// Fresh random salt
pub fn make_salt() -> String {
	uuid::Uuid::new_v4().simple().to_string()
}

/// Login hash as sent by the client
pub fn password_hash(password: &str, server_salt: &str, client_salt: &str) -> String {
	let mut hasher = blake3::Hasher::new();
	hasher.update(password.as_bytes());
	hasher.update(b".");
	hasher.update(server_salt.as_bytes());
	hasher.update(b".");
	hasher.update(client_salt.as_bytes());
	hex::encode(hasher.finalize().as_bytes())
}

/// Pluggable credential check used by sessions
pub trait LoginCheck: Send + Sync {
	/// Rights granted to `user`, or `None` if the proof does not match
	fn verify(&self, user: &str, server_salt: &str, client_salt: &str, hash: &str) -> Option<Allow>;
}

/// A user known to [`StaticUsers`]
#[derive(Debug, Clone)]
pub struct UserEntry {
	pub password: String,
	pub allow: Allow,
}

/// Fixed user table, usually filled from configuration
#[derive(Debug, Clone, Default)]
pub struct StaticUsers {
	users: HashMap<String, UserEntry>,
}

impl StaticUsers {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn add(&mut self, user: &str, password: &str, allow: Allow) {
		self.users.insert(user.to_string(), UserEntry { password: password.to_string(), allow });
	}

	pub fn is_empty(&self) -> bool {
		self.users.is_empty()
	}
}

impl LoginCheck for StaticUsers {
	fn verify(&self, user: &str, server_salt: &str, client_salt: &str, hash: &str) -> Option<Allow> {
		let entry = self.users.get(user)?;
		let expected = password_hash(&entry.password, server_salt, client_salt);
		(expected.eq_ignore_ascii_case(hash)).then_some(entry.allow)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_hash_depends_on_all_inputs() {
		let base = password_hash("pw", "s1", "c1");
		assert_eq!(base.len(), 64);
		assert_eq!(base, password_hash("pw", "s1", "c1"));
		assert_ne!(base, password_hash("pw", "s2", "c1"));
		assert_ne!(base, password_hash("pw", "s1", "c2"));
		assert_ne!(base, password_hash("px", "s1", "c1"));
	}

	#[test]
	fn test_static_users() {
		let mut users = StaticUsers::new();
		users.add("op", "secret", Allow::READ | Allow::WRITE);
		let server = make_salt();
		let client = make_salt();
		assert_ne!(server, client);
		let good = password_hash("secret", &server, &client);
		assert_eq!(users.verify("op", &server, &client, &good), Some(Allow::READ | Allow::WRITE));
		let bad = password_hash("guess", &server, &client);
		assert_eq!(users.verify("op", &server, &client, &bad), None);
		assert_eq!(users.verify("nobody", &server, &client, &good), None);
	}
}

// vim: ts=4
