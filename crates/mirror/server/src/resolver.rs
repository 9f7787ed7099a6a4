//! Strong identifier table for one session.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use mirror_common::DtoId;
use tokio::sync::mpsc;

use crate::object::{ObjectEvent, ServerDto};

static NEXT_SINK_TOKEN: AtomicU64 = AtomicU64::new(0);

struct Tracked {
	object: Arc<dyn ServerDto>,
	sink_token: u64,
}

/// Maps identifiers to live server objects. An entry keeps the object alive
/// and owns the property-change subscription attached to its [`DtoCore`];
/// removing the entry detaches the subscription.
///
/// Each session owns one resolver, so closing the session releases exactly
/// the objects that session exposed. Identifiers stay stable across sessions
/// because they live on the object itself and are assigned at most once.
///
/// [`DtoCore`]: crate::object::DtoCore
pub struct ServerResolver {
	table: Mutex<HashMap<DtoId, Tracked>>,
	events_tx: mpsc::UnboundedSender<ObjectEvent>,
}

impl ServerResolver {
	/// The resolver and the stream of events from every object it tracks.
	pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ObjectEvent>) {
		let (events_tx, events_rx) = mpsc::unbounded_channel();
		(
			Arc::new(Self {
				table: Mutex::new(HashMap::new()),
				events_tx,
			}),
			events_rx,
		)
	}

	/// The object bound to `id`, if this session exposed it. Never creates.
	pub fn resolve(&self, id: DtoId) -> Option<Arc<dyn ServerDto>> {
		self.table
			.lock()
			.expect("poisoned")
			.get(&id)
			.map(|tracked| tracked.object.clone())
	}

	/// Assigns the object's identifier if it has none yet, subscribes to its
	/// property changes, and starts holding it strongly. Idempotent; no two
	/// callers ever observe different identifiers for the same object.
	pub fn get_or_assign(&self, object: &Arc<dyn ServerDto>) -> DtoId {
		let mut table = self.table.lock().expect("poisoned");
		let id = object.core().assign_id();
		if !table.contains_key(&id) {
			let sink_token = NEXT_SINK_TOKEN.fetch_add(1, Ordering::Relaxed);
			object.core().attach(sink_token, self.events_tx.clone());
			table.insert(
				id,
				Tracked {
					object: object.clone(),
					sink_token,
				},
			);
		}
		id
	}

	/// Unsubscribes and releases. Safe to call when absent.
	pub fn remove(&self, id: DtoId) {
		let removed = self.table.lock().expect("poisoned").remove(&id);
		if let Some(tracked) = removed {
			tracked.object.core().detach(tracked.sink_token);
		}
	}

	pub fn contains(&self, id: DtoId) -> bool {
		self.table.lock().expect("poisoned").contains_key(&id)
	}

	pub fn len(&self) -> usize {
		self.table.lock().expect("poisoned").len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// Session teardown: releases every tracked object and its subscription.
	pub fn clear(&self) {
		let drained: Vec<Tracked> = {
			let mut table = self.table.lock().expect("poisoned");
			table.drain().map(|(_, tracked)| tracked).collect()
		};
		for tracked in drained {
			tracked.object.core().detach(tracked.sink_token);
		}
	}
}
