//! The codec hooks: reference substitution between value trees and payloads.

use std::collections::{BTreeMap, HashSet};

use mirror_common::value::{self, REF_KEY, STATE_KEY, TYPE_KEY};
use mirror_common::DtoId;
use serde_json::{Map, Value};

use crate::descriptor::InvokeError;
use crate::object::ServerData;
use crate::resolver::ServerResolver;

/// Encodes one top-level value for the wire. An object is introduced with its
/// type name and a snapshot of its properties on the first encounter; every
/// later encounter within the same payload collapses to the bare identifier.
/// The per-payload visited set is what keeps cyclic object graphs finite.
pub(crate) fn encode(resolver: &ServerResolver, data: &ServerData) -> Value {
	let mut visited = HashSet::new();
	encode_inner(resolver, data, &mut visited)
}

fn encode_inner(
	resolver: &ServerResolver,
	data: &ServerData,
	visited: &mut HashSet<DtoId>,
) -> Value {
	match data {
		ServerData::Plain(v) => v.clone(),
		ServerData::Object(object) => {
			let id = resolver.get_or_assign(object);
			if !visited.insert(id) {
				return value::reference(id);
			}
			let descriptor = object.descriptor();
			let mut state = Map::new();
			for (name, property) in descriptor.properties() {
				let value = property.read(object.as_ref());
				state.insert(name.to_owned(), encode_inner(resolver, &value, visited));
			}
			let mut marker = Map::with_capacity(3);
			marker.insert(REF_KEY.to_owned(), Value::String(id.to_string()));
			marker.insert(
				TYPE_KEY.to_owned(),
				Value::String(descriptor.type_name().to_owned()),
			);
			marker.insert(STATE_KEY.to_owned(), Value::Object(state));
			Value::Object(marker)
		}
		ServerData::List(items) => Value::Array(
			items
				.iter()
				.map(|item| encode_inner(resolver, item, visited))
				.collect(),
		),
		ServerData::Map(entries) => Value::Object(
			entries
				.iter()
				.map(|(key, item)| (key.clone(), encode_inner(resolver, item, visited)))
				.collect(),
		),
	}
}

/// Decodes an incoming argument or property value. A reference marker must
/// name an object this session already exposed; clients never introduce
/// objects of their own.
pub(crate) fn decode(
	resolver: &ServerResolver,
	payload: &Value,
) -> Result<ServerData, InvokeError> {
	if let Some(id) = value::reference_id(payload) {
		let object = resolver.resolve(id).ok_or_else(|| {
			InvokeError::new(format!("unknown object reference {id}"))
		})?;
		return Ok(ServerData::Object(object));
	}
	match payload {
		Value::Array(items) => Ok(ServerData::List(
			items
				.iter()
				.map(|item| decode(resolver, item))
				.collect::<Result<_, _>>()?,
		)),
		Value::Object(map) => Ok(ServerData::Map(
			map.iter()
				.map(|(key, item)| Ok((key.clone(), decode(resolver, item)?)))
				.collect::<Result<BTreeMap<_, _>, InvokeError>>()?,
		)),
		other => Ok(ServerData::Plain(other.clone())),
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::testutil::{as_dto, widget_with_label};

	#[test]
	fn test_first_encounter_carries_type_and_state() {
		let (resolver, _events) = ServerResolver::new();
		let widget = as_dto(widget_with_label("hello"));

		let encoded = encode(&resolver, &ServerData::Object(widget.clone()));
		let marker = encoded.as_object().unwrap();
		assert_eq!(marker[TYPE_KEY], "Widget");
		assert_eq!(marker[STATE_KEY]["Label"], "hello");
		assert_eq!(
			value::reference_id(&encoded),
			Some(widget.core().id().unwrap())
		);
		// Encoding also exposed the object to this session.
		assert!(resolver.contains(widget.core().id().unwrap()));
	}

	#[test]
	fn test_cycles_collapse_to_bare_references() {
		let (resolver, _events) = ServerResolver::new();
		let parent = widget_with_label("parent");
		let child = widget_with_label("child");
		parent.adopt(child.clone());
		child.adopt(parent.clone());

		let encoded = encode(&resolver, &ServerData::Object(as_dto(parent.clone())));
		let nested_child = &encoded[STATE_KEY]["Child"];
		// Child is introduced in full inside the parent's state...
		assert!(nested_child.get(STATE_KEY).is_some());
		// ...but the cycle back to the parent is a bare identifier.
		let back = &nested_child[STATE_KEY]["Child"];
		assert!(back.get(STATE_KEY).is_none());
		assert_eq!(
			value::reference_id(back),
			Some(parent.core().id().unwrap())
		);
	}

	#[test]
	fn test_decode_resolves_known_references_only() {
		let (resolver, _events) = ServerResolver::new();
		let widget = as_dto(widget_with_label("w"));
		let id = resolver.get_or_assign(&widget);

		let decoded = decode(&resolver, &value::reference(id)).unwrap();
		assert!(decoded.as_object().is_some());

		let err = decode(&resolver, &value::reference(DtoId::random())).unwrap_err();
		assert!(err.message.contains("unknown object reference"));
	}

	#[test]
	fn test_decode_keeps_plain_shapes() {
		let (resolver, _events) = ServerResolver::new();
		let decoded = decode(
			&resolver,
			&serde_json::json!({ "a": [1, 2], "b": "text" }),
		)
		.unwrap();
		let ServerData::Map(map) = decoded else {
			panic!("expected a map");
		};
		assert!(matches!(map["a"], ServerData::List(_)));
		assert_eq!(map["b"].as_str(), Some("text"));
	}
}
