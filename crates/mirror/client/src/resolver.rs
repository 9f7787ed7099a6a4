//! Weak identifier table, pending population, and the finalize queue.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use mirror_common::DtoId;
use serde_json::{Map, Value};

use crate::proxy::Proxy;

struct Inner {
	table: HashMap<DtoId, Weak<Proxy>>,
	/// Identifiers whose proxy was reclaimed but whose release message has
	/// not been sent yet. Receiving the identifier again inside the
	/// quiescence window cancels the release (resurrection).
	finalize: HashMap<DtoId, Instant>,
}

/// Maps identifiers to proxies without keeping them alive. The table and the
/// finalize queue share one mutex: deciding between "return the live proxy"
/// and "resurrect under the queued identifier" has to be atomic.
pub(crate) struct ClientResolver {
	inner: Mutex<Inner>,
	/// Proxies whose state snapshot arrived mid-decode, in arrival order.
	/// Drained at the end of every top-level decode so the newest fields win.
	to_populate: Mutex<Vec<(Arc<Proxy>, Map<String, Value>)>>,
}

impl ClientResolver {
	pub(crate) fn new() -> Self {
		Self {
			inner: Mutex::new(Inner {
				table: HashMap::new(),
				finalize: HashMap::new(),
			}),
			to_populate: Mutex::new(Vec::new()),
		}
	}

	/// Live lookup. Never creates; a dead entry is left for the decode path,
	/// which knows how to rebuild the proxy.
	pub(crate) fn resolve(&self, id: DtoId) -> Option<Arc<Proxy>> {
		self.inner
			.lock()
			.expect("poisoned")
			.table
			.get(&id)
			.and_then(Weak::upgrade)
	}

	/// The decoder's atomic resolve-or-bind: returns the live proxy for `id`
	/// or installs the one built by `make`, cancelling any queued release of
	/// the identifier. The bool reports whether a proxy was created.
	pub(crate) fn resolve_or_insert(
		&self,
		id: DtoId,
		make: impl FnOnce() -> Arc<Proxy>,
	) -> (Arc<Proxy>, bool) {
		let mut inner = self.inner.lock().expect("poisoned");
		if let Some(live) = inner.table.get(&id).and_then(Weak::upgrade) {
			return (live, false);
		}
		let proxy = make();
		inner.finalize.remove(&id);
		inner.table.insert(id, Arc::downgrade(&proxy));
		(proxy, true)
	}

	/// Called by a proxy's drop: the last strong reference is gone.
	pub(crate) fn note_reclaimed(&self, id: DtoId) {
		// Declared before the guard: if the upgraded successor turns out to
		// be the last strong handle, its drop re-enters this mutex and must
		// run after the guard is released.
		let successor: Option<Arc<Proxy>>;
		let mut inner = self.inner.lock().expect("poisoned");
		// The identifier may already be bound to a successor proxy; queueing
		// a release then would tear down an object still in use.
		successor = inner.table.get(&id).and_then(Weak::upgrade);
		if successor.is_none() {
			inner.finalize.insert(id, Instant::now());
		}
	}

	/// Queue entries past the quiescence window whose identifier still has
	/// no live proxy. They leave the queue and the table; the caller sends
	/// the release messages.
	pub(crate) fn due_finalized(&self, window: Duration) -> Vec<DtoId> {
		// Dropped after the guard; a survivor may be the last strong handle
		// and its drop re-enters this mutex.
		let mut survivors: Vec<Arc<Proxy>> = Vec::new();
		let mut inner = self.inner.lock().expect("poisoned");
		let now = Instant::now();
		let candidates: Vec<DtoId> = inner
			.finalize
			.iter()
			.filter(|(_, queued)| now.duration_since(**queued) >= window)
			.map(|(id, _)| *id)
			.collect();
		let mut due = Vec::with_capacity(candidates.len());
		for id in candidates {
			inner.finalize.remove(&id);
			if let Some(live) = inner.table.get(&id).and_then(Weak::upgrade) {
				survivors.push(live);
				continue;
			}
			inner.table.remove(&id);
			due.push(id);
		}
		due
	}

	pub(crate) fn queue_population(&self, proxy: Arc<Proxy>, state: Map<String, Value>) {
		self.to_populate
			.lock()
			.expect("poisoned")
			.push((proxy, state));
	}

	/// Drains the population queue in arrival order.
	pub(crate) fn take_to_populate(&self) -> Vec<(Arc<Proxy>, Map<String, Value>)> {
		std::mem::take(&mut *self.to_populate.lock().expect("poisoned"))
	}
}
