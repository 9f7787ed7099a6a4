//! The side-generic wire value model.
//!
//! A payload is JSON, except that any DTO inside it travels as an identifier
//! marker instead of by value. [`Data`] is the decoded tree a peer works
//! with: `O` is `Arc<dyn ServerDto>` on the server and `Arc<Proxy>` on the
//! client, so the reference-substitution walks on each side share one shape.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::DtoId;

/// Marker key naming a DTO by identifier. Always present on a reference.
pub const REF_KEY: &str = "$dto";
/// Concrete type name, sent on the first encounter within one payload.
pub const TYPE_KEY: &str = "$type";
/// Property snapshot, sent alongside [`TYPE_KEY`] so the receiving proxy can
/// be populated.
pub const STATE_KEY: &str = "$state";

#[derive(Debug, Clone)]
pub enum Data<O> {
	/// Any plain JSON value, including null.
	Plain(Value),
	/// A resolved reference.
	Object(O),
	List(Vec<Data<O>>),
	Map(BTreeMap<String, Data<O>>),
}

impl<O> Data<O> {
	pub fn null() -> Self {
		Data::Plain(Value::Null)
	}

	pub fn is_null(&self) -> bool {
		matches!(self, Data::Plain(Value::Null))
	}

	pub fn as_bool(&self) -> Option<bool> {
		match self {
			Data::Plain(v) => v.as_bool(),
			_ => None,
		}
	}

	pub fn as_i64(&self) -> Option<i64> {
		match self {
			Data::Plain(v) => v.as_i64(),
			_ => None,
		}
	}

	pub fn as_f64(&self) -> Option<f64> {
		match self {
			Data::Plain(v) => v.as_f64(),
			_ => None,
		}
	}

	pub fn as_str(&self) -> Option<&str> {
		match self {
			Data::Plain(v) => v.as_str(),
			_ => None,
		}
	}

	pub fn as_object(&self) -> Option<&O> {
		match self {
			Data::Object(o) => Some(o),
			_ => None,
		}
	}

	pub fn into_object(self) -> Option<O> {
		match self {
			Data::Object(o) => Some(o),
			_ => None,
		}
	}
}

impl<O> From<Value> for Data<O> {
	fn from(v: Value) -> Self {
		Data::Plain(v)
	}
}

impl<O> From<bool> for Data<O> {
	fn from(v: bool) -> Self {
		Data::Plain(Value::from(v))
	}
}

impl<O> From<i64> for Data<O> {
	fn from(v: i64) -> Self {
		Data::Plain(Value::from(v))
	}
}

impl<O> From<f64> for Data<O> {
	fn from(v: f64) -> Self {
		Data::Plain(Value::from(v))
	}
}

impl<O> From<&str> for Data<O> {
	fn from(v: &str) -> Self {
		Data::Plain(Value::from(v))
	}
}

impl<O> From<String> for Data<O> {
	fn from(v: String) -> Self {
		Data::Plain(Value::from(v))
	}
}

/// The bare wire form of a reference, as a client sends it: identifier only,
/// no state.
pub fn reference(id: DtoId) -> Value {
	let mut map = serde_json::Map::with_capacity(1);
	map.insert(REF_KEY.to_owned(), Value::String(id.to_string()));
	Value::Object(map)
}

/// Extracts the identifier if `value` is a reference marker.
pub fn reference_id(value: &Value) -> Option<DtoId> {
	let id = value.as_object()?.get(REF_KEY)?.as_str()?;
	DtoId::parse(id).ok()
}
