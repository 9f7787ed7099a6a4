//! Client half of the codec hooks: reference substitution both ways.

use std::sync::Arc;

use mirror_common::value::{self, STATE_KEY, TYPE_KEY};
use serde_json::Value;
use tracing::debug;

use crate::proxy::Proxy;
use crate::session::Shared;
use crate::ClientData;

/// Encodes an outgoing argument. A proxy collapses to the bare identifier
/// marker; clients never send object state.
pub(crate) fn encode(data: &ClientData) -> Value {
	match data {
		ClientData::Plain(v) => v.clone(),
		ClientData::Object(proxy) => value::reference(proxy.id()),
		ClientData::List(items) => Value::Array(items.iter().map(encode).collect()),
		ClientData::Map(entries) => Value::Object(
			entries
				.iter()
				.map(|(key, item)| (key.clone(), encode(item)))
				.collect(),
		),
	}
}

/// Decodes one top-level payload: resolves or materializes proxies, then
/// applies the queued state snapshots in arrival order, so fields from the
/// newest introduction override whatever a proxy held before.
pub(crate) fn decode(shared: &Arc<Shared>, payload: &Value) -> ClientData {
	let data = walk(shared, payload, true);
	for (proxy, state) in shared.resolver.take_to_populate() {
		proxy.populate(&state);
	}
	data
}

/// The walk alone, with no state application. Used when re-reading cached
/// values, where re-applying the stale snapshot would clobber newer state.
pub(crate) fn peek(shared: &Arc<Shared>, payload: &Value) -> ClientData {
	walk(shared, payload, false)
}

fn walk(shared: &Arc<Shared>, payload: &Value, populate: bool) -> ClientData {
	if let Some(id) = value::reference_id(payload) {
		let marker = payload.as_object().expect("a reference is always an object");
		let type_name = marker.get(TYPE_KEY).and_then(Value::as_str);
		let (proxy, created) = shared.resolver.resolve_or_insert(id, || {
			Arc::new(Proxy::new(
				id,
				type_name.unwrap_or_default().to_owned(),
				shared.clone(),
			))
		});
		if created && type_name.is_none() {
			// A bare marker should only name an object introduced earlier in
			// the same payload or still held locally. Tolerate it; state
			// will arrive with the next introduction.
			debug!(%id, "bare reference materialized an unpopulated proxy");
		}
		if populate {
			if let Some(Value::Object(state)) = marker.get(STATE_KEY) {
				shared.resolver.queue_population(proxy.clone(), state.clone());
			}
		}
		return ClientData::Object(proxy);
	}
	match payload {
		Value::Array(items) => ClientData::List(
			items.iter().map(|item| walk(shared, item, populate)).collect(),
		),
		Value::Object(map) => ClientData::Map(
			map.iter()
				.map(|(key, item)| (key.clone(), walk(shared, item, populate)))
				.collect(),
		),
		other => ClientData::Plain(other.clone()),
	}
}
