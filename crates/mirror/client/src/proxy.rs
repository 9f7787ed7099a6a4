//! The local stub for one remote object.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use mirror_common::envelope::MessageKind;
use mirror_common::error::RpcError;
use mirror_common::{DtoId, PROPERTY_CHANGED};
use serde_json::{Map, Value};
use tracing::debug;

use crate::decode;
use crate::session::Shared;
use crate::ClientData;

type Handler = Arc<dyn Fn(ClientData) + Send + Sync>;

/// Forwards property reads/writes, method invocations, and event
/// subscriptions to the remote object it stands for. Obtained by decoding a
/// payload; never constructed by the application.
///
/// Identity is preserved: receiving the same identifier twice on a session
/// yields the same `Arc<Proxy>`, as long as some strong reference is still
/// held. Dropping the last one schedules a release message to the server; if
/// the identifier arrives again before the quiescence window elapses, a fresh
/// proxy is bound to it and the release is cancelled.
pub struct Proxy {
	id: DtoId,
	type_name: String,
	shared: Arc<Shared>,
	state: Mutex<ProxyState>,
	handlers: Mutex<HashMap<String, Vec<Handler>>>,
}

#[derive(Default)]
struct ProxyState {
	/// Raw wire values. Object-valued properties stay as identifier markers,
	/// so a cache entry never keeps another proxy alive (and parent/child
	/// graphs cannot leak through reference cycles).
	properties: Map<String, Value>,
	populated: bool,
}

impl Proxy {
	pub(crate) fn new(id: DtoId, type_name: String, shared: Arc<Shared>) -> Self {
		Self {
			id,
			type_name,
			shared,
			state: Mutex::new(ProxyState::default()),
			handlers: Mutex::new(HashMap::new()),
		}
	}

	pub fn id(&self) -> DtoId {
		self.id
	}

	/// The server-side concrete type name, as introduced on the wire.
	pub fn type_name(&self) -> &str {
		&self.type_name
	}

	/// Whether the first state snapshot has been applied.
	pub fn is_populated(&self) -> bool {
		self.state.lock().expect("poisoned").populated
	}

	/// Invokes a remote method. Suspends until the response arrives, the
	/// request times out, or the session closes.
	pub async fn invoke(
		&self,
		method: &str,
		args: Vec<ClientData>,
	) -> Result<ClientData, RpcError> {
		let arity = args.len() as u32;
		let payload = Value::Array(args.iter().map(decode::encode).collect());
		let result = self
			.shared
			.request(MessageKind::Query, Some(self.id), method, arity, payload)
			.await?;
		Ok(decode::decode(&self.shared, &result))
	}

	/// Reads a property from the server and refreshes the local cache.
	pub async fn get(&self, property: &str) -> Result<ClientData, RpcError> {
		let result = self
			.shared
			.request(MessageKind::Get, Some(self.id), property, 0, Value::Null)
			.await?;
		self.state
			.lock()
			.expect("poisoned")
			.properties
			.insert(property.to_owned(), result.clone());
		Ok(decode::decode(&self.shared, &result))
	}

	/// Writes a property. The server acknowledges after applying.
	pub async fn set(
		&self,
		property: &str,
		value: impl Into<ClientData>,
	) -> Result<(), RpcError> {
		let payload = decode::encode(&value.into());
		self.shared
			.request(MessageKind::Set, Some(self.id), property, 1, payload)
			.await?;
		Ok(())
	}

	/// Subscribes to a named event; the handler runs on the session's
	/// dispatch task. Subscribing twice to the same event is idempotent on
	/// the server, but every registered handler runs per delivery.
	pub async fn on(
		&self,
		event: &str,
		handler: impl Fn(ClientData) + Send + Sync + 'static,
	) -> Result<(), RpcError> {
		self.handlers
			.lock()
			.expect("poisoned")
			.entry(event.to_owned())
			.or_default()
			.push(Arc::new(handler));
		self.shared
			.request(MessageKind::EventAdd, Some(self.id), event, 0, Value::Null)
			.await?;
		Ok(())
	}

	/// Drops every local handler for the event and unsubscribes remotely.
	pub async fn off(&self, event: &str) -> Result<(), RpcError> {
		self.handlers.lock().expect("poisoned").remove(event);
		self.shared
			.request(MessageKind::EventRemove, Some(self.id), event, 0, Value::Null)
			.await?;
		Ok(())
	}

	/// The last locally known value of a property, without a round trip.
	/// Fed by population snapshots, [`Self::get`], and `PropertyChanged`
	/// notifications.
	pub fn cached(&self, property: &str) -> Option<ClientData> {
		let raw = self
			.state
			.lock()
			.expect("poisoned")
			.properties
			.get(property)
			.cloned()?;
		Some(decode::peek(&self.shared, &raw))
	}

	/// Applies a state snapshot. Later snapshots override earlier fields.
	pub(crate) fn populate(&self, state: &Map<String, Value>) {
		let mut locked = self.state.lock().expect("poisoned");
		for (property, value) in state {
			locked.properties.insert(property.clone(), value.clone());
		}
		locked.populated = true;
	}

	/// Delivers an event notification addressed to this proxy. For
	/// `PropertyChanged`, the cached value is updated before any handler
	/// runs.
	pub(crate) fn deliver(&self, member: &str, payload: &Value) {
		if member == PROPERTY_CHANGED {
			if let Some(change) = payload.as_object() {
				if let (Some(name), Some(value)) = (
					change.get("name").and_then(Value::as_str),
					change.get("value"),
				) {
					self.state
						.lock()
						.expect("poisoned")
						.properties
						.insert(name.to_owned(), value.clone());
				}
			}
		}
		let handlers: Vec<Handler> = self
			.handlers
			.lock()
			.expect("poisoned")
			.get(member)
			.cloned()
			.unwrap_or_default();
		if handlers.is_empty() {
			debug!(id = %self.id, member, "event with no local handler");
			return;
		}
		let data = decode::decode(&self.shared, payload);
		for handler in &handlers {
			handler(data.clone());
		}
	}
}

impl Drop for Proxy {
	fn drop(&mut self) {
		self.shared.resolver.note_reclaimed(self.id);
	}
}

impl std::fmt::Debug for Proxy {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Proxy")
			.field("id", &self.id)
			.field("type_name", &self.type_name)
			.finish_non_exhaustive()
	}
}

impl From<Arc<Proxy>> for ClientData {
	fn from(proxy: Arc<Proxy>) -> Self {
		ClientData::Object(proxy)
	}
}
