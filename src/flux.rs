//! Outbound record queue shared by sessions and connectors
//!
//! Value updates for ordinary nodes are coalesced: while an update for a path is
//! still queued, a newer one replaces its payload in place. Pipe values are messages
//! and are queued one by one, except that a pipe write carrying an overwrite key
//! replaces a queued value of the same pipe whose text starts with that key.
//! Everything else is queued in order and never merged.

use std::collections::{HashMap, VecDeque};

use crate::protocol::Record;

struct Entry {
	record: Record,
	pipe: bool,
}

/// FIFO of records waiting for the transport
#[derive(Default)]
pub struct FluxQueue {
	order: VecDeque<u64>,
	entries: HashMap<u64, Entry>,
	/// Queued coalescible value per path
	pending_value: HashMap<String, u64>,
	next_ticket: u64,
}

impl FluxQueue {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn len(&self) -> usize {
		self.order.len()
	}

	pub fn is_empty(&self) -> bool {
		self.order.is_empty()
	}

	/// Queue a structural or control record
	pub fn push(&mut self, record: Record) {
		if let Some(path) = record.synced_path() {
			// Later values must not jump ahead of this record
			self.pending_value.remove(path);
		}
		self.append(record, false);
	}

	/// Queue a value update for `path`
	pub fn push_value(&mut self, record: Record, pipe: bool) {
		let Record::Value { path, overwrite_key, .. } = &record else {
			self.push(record);
			return;
		};

		if !pipe {
			if let Some(ticket) = self.pending_value.get(path) {
				if let Some(entry) = self.entries.get_mut(ticket) {
					entry.record = record;
					return;
				}
			}
			let path = path.clone();
			let ticket = self.append(record, false);
			self.pending_value.insert(path, ticket);
			return;
		}

		if let Some(key) = overwrite_key {
			let target = self.order.iter().copied().find(|t| {
				self.entries.get(t).map_or(false, |e| {
					e.pipe
						&& matches!(&e.record, Record::Value { path: p, value: v, .. }
							if p == path && v.to_text().starts_with(key.as_str()))
				})
			});
			if let Some(ticket) = target {
				if let Some(entry) = self.entries.get_mut(&ticket) {
					entry.record = record;
					return;
				}
			}
		}
		self.append(record, true);
	}

	fn append(&mut self, record: Record, pipe: bool) -> u64 {
		self.next_ticket += 1;
		let ticket = self.next_ticket;
		self.entries.insert(ticket, Entry { record, pipe });
		self.order.push_back(ticket);
		ticket
	}

	/// Take the oldest queued record
	pub fn pop(&mut self) -> Option<Record> {
		while let Some(ticket) = self.order.pop_front() {
			let Some(entry) = self.entries.remove(&ticket) else {
				continue;
			};
			if let Some(path) = entry.record.synced_path() {
				if self.pending_value.get(path) == Some(&ticket) {
					self.pending_value.remove(path);
				}
			}
			return Some(entry.record);
		}
		None
	}

	/// Drop everything queued, as on disconnect
	pub fn clear(&mut self) {
		self.order.clear();
		self.entries.clear();
		self.pending_value.clear();
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::types::Value;

	fn val(path: &str, v: impl Into<Value>) -> Record {
		Record::Value { path: path.into(), value: v.into(), seq: 0, overwrite_key: None }
	}

	fn keyed(path: &str, v: &str, key: &str) -> Record {
		Record::Value { path: path.into(), value: v.into(), seq: 0, overwrite_key: Some(key.into()) }
	}

	fn drain(q: &mut FluxQueue) -> Vec<Record> {
		std::iter::from_fn(|| q.pop()).collect()
	}

	#[test]
	fn test_values_coalesce_in_place() {
		let mut q = FluxQueue::new();
		q.push_value(val("/a", 1), false);
		q.push_value(val("/b", 1), false);
		q.push_value(val("/a", 2), false);
		assert_eq!(q.len(), 2);
		assert_eq!(drain(&mut q), vec![val("/a", 2), val("/b", 1)]);
	}

	#[test]
	fn test_structural_record_breaks_coalescing() {
		let mut q = FluxQueue::new();
		q.push_value(val("/a", 1), false);
		q.push(Record::Retire { path: "/a".into() });
		q.push_value(val("/a", 2), false);
		assert_eq!(
			drain(&mut q),
			vec![val("/a", 1), Record::Retire { path: "/a".into() }, val("/a", 2)]
		);
	}

	#[test]
	fn test_pipe_values_queue_individually() {
		let mut q = FluxQueue::new();
		q.push_value(val("/p", "x"), true);
		q.push_value(val("/p", "x"), true);
		assert_eq!(q.len(), 2);
	}

	#[test]
	fn test_pipe_overwrite_by_prefix() {
		let mut q = FluxQueue::new();
		q.push_value(val("/p", "pos=1"), true);
		q.push_value(val("/p", "cmd=go"), true);
		q.push_value(keyed("/p", "pos=7", "pos="), true);
		q.push_value(keyed("/p", "speed=3", "speed="), true);
		assert_eq!(
			drain(&mut q),
			vec![keyed("/p", "pos=7", "pos="), val("/p", "cmd=go"), keyed("/p", "speed=3", "speed=")]
		);
	}

	#[test]
	fn test_value_after_pop_appends() {
		let mut q = FluxQueue::new();
		q.push_value(val("/a", 1), false);
		assert_eq!(q.pop(), Some(val("/a", 1)));
		q.push_value(val("/a", 2), false);
		assert_eq!(q.pop(), Some(val("/a", 2)));
		assert!(q.is_empty());
	}
}

// vim: ts=4
