/// Integration tests for the shared tree: ordering, idempotence, reference counting
/// and retirement, exercised through the public Handle and Directory API
use sharetree::{Directory, ErrorCode, EventKind, Handle, SameValue, TreeError, TreeEvent, Value, WriterId};
use std::sync::{Arc, Mutex};
use std::thread;

fn recorder(handle: &Handle) -> Arc<Mutex<Vec<(i64, u64)>>> {
	let seen = Arc::new(Mutex::new(Vec::new()));
	let sink = seen.clone();
	handle.on_change(move |ev: &TreeEvent| {
		let value = ev.value().and_then(|v| v.to_int()).unwrap_or(-1);
		sink.lock().unwrap().push((value, ev.seq));
	});
	seen
}

#[test]
fn test_concurrent_writers_are_observed_in_one_order() {
	const THREADS: i64 = 8;
	const WRITES: i64 = 200;

	let dir = Directory::new();
	let observer_a = Handle::open(&dir, "/bench/counter").unwrap();
	let observer_b = Handle::open(&dir, "/bench/counter").unwrap();
	let seen_a = recorder(&observer_a);
	let seen_b = recorder(&observer_b);
	let start_seq = observer_a.node().unwrap().seq();

	let workers: Vec<_> = (0..THREADS)
		.map(|t| {
			let dir = dir.clone();
			thread::spawn(move || {
				let mut h = Handle::new(&dir);
				h.enable_threaded();
				h.bind("/bench/counter", sharetree::Access::Write).unwrap();
				for i in 0..WRITES {
					h.set(t * 1_000_000 + i).unwrap();
				}
			})
		})
		.collect();
	for w in workers {
		w.join().unwrap();
	}

	let seen_a = seen_a.lock().unwrap().clone();
	let seen_b = seen_b.lock().unwrap().clone();
	assert_eq!(seen_a.len() as i64, THREADS * WRITES);
	assert_eq!(seen_a, seen_b, "both subscribers see the same sequence");

	// One global per-node sequence without gaps
	for (i, (_, seq)) in seen_a.iter().enumerate() {
		assert_eq!(*seq, start_seq + 1 + i as u64);
	}
	// Each writer's own writes keep their program order
	for t in 0..THREADS {
		let mine: Vec<i64> = seen_a
			.iter()
			.map(|(v, _)| *v)
			.filter(|v| v / 1_000_000 == t)
			.map(|v| v % 1_000_000)
			.collect();
		assert_eq!(mine, (0..WRITES).collect::<Vec<_>>());
	}
}

#[test]
fn test_same_value_accept_emits_once() {
	let dir = Directory::new();
	let h = Handle::open(&dir, "/idem").unwrap();
	let seen = recorder(&h);
	h.set_with(9, SameValue::Accept).unwrap();
	h.set_with(9, SameValue::Accept).unwrap();
	assert_eq!(seen.lock().unwrap().len(), 1);

	h.set_with(9, SameValue::Emit).unwrap();
	assert_eq!(seen.lock().unwrap().len(), 2);
}

#[test]
fn test_ignore_same_value_is_the_handle_default() {
	let dir = Directory::new();
	let mut h = Handle::open(&dir, "/idem").unwrap();
	h.set_ignore_same_value(true);
	let seen = recorder(&h);
	h.set(1).unwrap();
	h.set(1).unwrap();
	h.set(2).unwrap();
	assert_eq!(seen.lock().unwrap().iter().map(|(v, _)| *v).collect::<Vec<_>>(), vec![1, 2]);
}

#[test]
fn test_node_lives_while_referenced() {
	let dir = Directory::new();
	let handles: Vec<Handle> = (0..5).map(|_| Handle::open(&dir, "/rc/leaf").unwrap()).collect();
	assert_eq!(handles[0].node().unwrap().ref_count(), 5);

	let mut handles = handles;
	let last = handles.pop().unwrap();
	drop(handles);
	assert!(dir.exists("/rc/leaf"));
	drop(last);
	assert!(!dir.exists("/rc/leaf"));
	assert!(!dir.exists("/rc/"));
}

#[test]
fn test_children_and_persistence_keep_nodes_alive() {
	let dir = Directory::new();
	let folder = Handle::open(&dir, "/keep/").unwrap();
	let child = Handle::open(&dir, "/keep/child").unwrap();
	drop(folder);
	assert!(dir.exists("/keep/"), "a folder with children survives");
	drop(child);
	assert!(!dir.exists("/keep/"));

	let saved = Handle::open(&dir, "/saved").unwrap();
	saved.set_persistent(true).unwrap();
	saved.set(3).unwrap();
	drop(saved);
	assert_eq!(dir.lookup("/saved").and_then(|n| n.value()), Some(Value::Int(3)));
}

#[test]
fn test_retirement_is_reported_once() {
	let dir = Directory::new();
	let h1 = Handle::open(&dir, "/doomed").unwrap();
	let h2 = Handle::open(&dir, "/doomed").unwrap();
	let count = Arc::new(Mutex::new(0));
	for h in [&h1, &h2] {
		let count = count.clone();
		h.on_retired(move |ev| {
			assert!(matches!(ev.kind, EventKind::Retired));
			*count.lock().unwrap() += 1;
		});
	}
	h1.retire(false).unwrap();
	assert_eq!(*count.lock().unwrap(), 2);

	assert!(h1.is_retired());
	assert!(matches!(h1.get(), Err(TreeError::ItemNotOpen { .. })));
	assert!(matches!(h2.set(1), Err(TreeError::ItemNotOpen { .. })));
	assert!(matches!(h2.retire(false), Err(TreeError::Retired { .. })));
	assert_eq!(TreeError::NotMainThread.code(), ErrorCode::NotMainThread);

	// The path resolves to a fresh node afterwards
	let fresh = Handle::open(&dir, "/doomed").unwrap();
	assert_ne!(fresh.node().unwrap().id(), h1.node().unwrap().id());
}

#[test]
fn test_two_handles_scenario() {
	let dir = Directory::new();
	let h1 = Handle::open(&dir, "/A/B/value").unwrap();
	h1.set(0).unwrap();
	let h2 = Handle::open(&dir, "/A/B/value").unwrap();
	let seen1 = recorder(&h1);
	let seen2 = recorder(&h2);
	let previous = h1.node().unwrap().seq();

	h1.set(5).unwrap();
	assert_eq!(*seen1.lock().unwrap(), vec![(5, previous + 1)]);
	assert_eq!(*seen2.lock().unwrap(), vec![(5, previous + 1)]);

	drop(h2);
	assert!(dir.exists("/A/B/value"));
	assert_eq!(h1.get_int().unwrap(), 5);
	drop(h1);
	assert!(!dir.exists("/A/B/value"));
}

#[test]
fn test_unset_and_unbound_reads() {
	let dir = Directory::new();
	let h = Handle::open(&dir, "/fresh").unwrap();
	assert!(matches!(h.get(), Err(TreeError::ItemNotSet { .. })));
	let unbound = Handle::new(&dir);
	assert!(matches!(unbound.get(), Err(TreeError::ItemNotOpen { .. })));
	assert!(matches!(unbound.retire(false), Err(TreeError::NotOpen)));
}

#[test]
fn test_wrong_thread_fails_fast() {
	let dir = Directory::new();
	let d = dir.clone();
	let result = thread::spawn(move || {
		let mut h = Handle::new(&d);
		h.bind("/x", sharetree::Access::Write).map(|_| ())
	})
	.join()
	.unwrap();
	assert!(matches!(result, Err(TreeError::NotMainThread)));

	let node = dir.resolve("/x", true).unwrap();
	dir.set_value(&node, Value::Int(1), SameValue::Emit, WriterId::SYSTEM).unwrap();
}
