//! Per-type dispatch tables.
//!
//! The dispatcher selects methods, properties, and events by name at runtime,
//! but nothing here is reflective: every exposable type builds a `Descriptor`
//! once (methods keyed by name with per-arity overloads, property accessors,
//! declared event names) and incoming messages are routed through it.

use std::collections::{HashMap, HashSet};
use std::marker::PhantomData;

use mirror_common::PROPERTY_CHANGED;
use serde_json::Value;

use crate::object::{ServerData, ServerDto};

/// A failed method or setter invocation, as reported back to the caller.
/// Carries at most one level of inner message across the wire.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct InvokeError {
	pub message: String,
	pub inner: Option<String>,
}

impl InvokeError {
	pub fn new(message: impl Into<String>) -> Self {
		Self {
			message: message.into(),
			inner: None,
		}
	}

	pub fn with_inner(mut self, inner: impl Into<String>) -> Self {
		self.inner = Some(inner.into());
		self
	}

	/// Wraps any error, keeping its rendering as the single inner level.
	pub fn wrap(message: impl Into<String>, source: &dyn std::error::Error) -> Self {
		Self::new(message).with_inner(source.to_string())
	}
}

impl From<String> for InvokeError {
	fn from(message: String) -> Self {
		Self::new(message)
	}
}

impl From<&str> for InvokeError {
	fn from(message: &str) -> Self {
		Self::new(message)
	}
}

/// The declared type of one parameter, used to align a deserialized argument
/// before invocation. Widening coercions only; narrowing is rejected.
#[derive(Debug, Clone, Copy)]
pub enum ParamKind {
	Bool,
	/// Any JSON integral that fits a signed 64-bit value.
	Int,
	/// Accepts integrals too (standard numeric widening).
	Float,
	Text,
	/// A reference to an object this server already exposed, or null.
	Object,
	/// A named enumeration: accepts the variant name or an integral index,
	/// aligned to the variant name.
	Enum(&'static [&'static str]),
	/// No coercion; the argument passes through as decoded.
	Raw,
}

type InvokeFn =
	Box<dyn Fn(&dyn ServerDto, Vec<ServerData>) -> Result<ServerData, InvokeError> + Send + Sync>;
type GetFn = Box<dyn Fn(&dyn ServerDto) -> ServerData + Send + Sync>;
type SetFn = Box<dyn Fn(&dyn ServerDto, ServerData) -> Result<(), InvokeError> + Send + Sync>;

pub struct Method {
	params: Vec<ParamKind>,
	f: InvokeFn,
}

impl Method {
	pub(crate) fn arity(&self) -> usize {
		self.params.len()
	}

	pub(crate) fn params(&self) -> &[ParamKind] {
		&self.params
	}

	pub(crate) fn call(
		&self,
		obj: &dyn ServerDto,
		args: Vec<ServerData>,
	) -> Result<ServerData, InvokeError> {
		(self.f)(obj, args)
	}
}

pub struct Property {
	get: GetFn,
	setter: Option<Setter>,
}

struct Setter {
	kind: ParamKind,
	f: SetFn,
}

impl Property {
	pub(crate) fn read(&self, obj: &dyn ServerDto) -> ServerData {
		(self.get)(obj)
	}

	/// Aligns and writes, or explains why the property cannot be written.
	pub(crate) fn write(
		&self,
		name: &str,
		obj: &dyn ServerDto,
		value: ServerData,
	) -> Result<(), InvokeError> {
		let Some(setter) = &self.setter else {
			return Err(InvokeError::new(format!("property `{name}` is read-only")));
		};
		let aligned = align(setter.kind, value, 0)?;
		(setter.f)(obj, aligned)
	}
}

pub struct Descriptor {
	type_name: &'static str,
	methods: HashMap<&'static str, Vec<Method>>,
	properties: HashMap<&'static str, Property>,
	events: HashSet<&'static str>,
}

impl Descriptor {
	pub fn builder<T: ServerDto>(type_name: &'static str) -> DescriptorBuilder<T> {
		DescriptorBuilder {
			inner: Descriptor {
				type_name,
				methods: HashMap::new(),
				properties: HashMap::new(),
				events: HashSet::from([PROPERTY_CHANGED]),
			},
			_marker: PhantomData,
		}
	}

	pub fn type_name(&self) -> &'static str {
		self.type_name
	}

	pub(crate) fn overloads(&self, name: &str) -> Option<&[Method]> {
		self.methods.get(name).map(Vec::as_slice)
	}

	pub(crate) fn property(&self, name: &str) -> Option<&Property> {
		self.properties.get(name)
	}

	pub(crate) fn properties(&self) -> impl Iterator<Item = (&'static str, &Property)> {
		self.properties.iter().map(|(name, prop)| (*name, prop))
	}

	pub(crate) fn has_event(&self, name: &str) -> bool {
		self.events.contains(name)
	}
}

impl std::fmt::Debug for Descriptor {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Descriptor")
			.field("type_name", &self.type_name)
			.field("methods", &self.methods.keys().collect::<Vec<_>>())
			.field("properties", &self.properties.keys().collect::<Vec<_>>())
			.field("events", &self.events)
			.finish()
	}
}

fn downcast<T: ServerDto>(obj: &dyn ServerDto) -> &T {
	obj.as_any()
		.downcast_ref::<T>()
		.expect("descriptor invoked with a different concrete type")
}

/// Builds a [`Descriptor`] for one concrete type. Registration is the only
/// place the concrete type is known; everything after goes through
/// `dyn ServerDto`.
///
/// # Panics
/// Panics on duplicate registrations; descriptors are built once at startup.
pub struct DescriptorBuilder<T> {
	inner: Descriptor,
	_marker: PhantomData<fn(T)>,
}

impl<T: ServerDto> DescriptorBuilder<T> {
	pub fn method(
		mut self,
		name: &'static str,
		params: &[ParamKind],
		f: impl Fn(&T, Vec<ServerData>) -> Result<ServerData, InvokeError> + Send + Sync + 'static,
	) -> Self {
		let overloads = self.inner.methods.entry(name).or_default();
		assert!(
			overloads.iter().all(|m| m.arity() != params.len()),
			"duplicate overload of `{name}` with arity {}",
			params.len()
		);
		overloads.push(Method {
			params: params.to_vec(),
			f: Box::new(move |obj, args| f(downcast::<T>(obj), args)),
		});
		self
	}

	pub fn property(
		mut self,
		name: &'static str,
		get: impl Fn(&T) -> ServerData + Send + Sync + 'static,
	) -> Self {
		let prev = self.inner.properties.insert(
			name,
			Property {
				get: Box::new(move |obj| get(downcast::<T>(obj))),
				setter: None,
			},
		);
		assert!(prev.is_none(), "duplicate property `{name}`");
		self
	}

	pub fn property_rw(
		mut self,
		name: &'static str,
		kind: ParamKind,
		get: impl Fn(&T) -> ServerData + Send + Sync + 'static,
		set: impl Fn(&T, ServerData) -> Result<(), InvokeError> + Send + Sync + 'static,
	) -> Self {
		let prev = self.inner.properties.insert(
			name,
			Property {
				get: Box::new(move |obj| get(downcast::<T>(obj))),
				setter: Some(Setter {
					kind,
					f: Box::new(move |obj, value| set(downcast::<T>(obj), value)),
				}),
			},
		);
		assert!(prev.is_none(), "duplicate property `{name}`");
		self
	}

	pub fn event(mut self, name: &'static str) -> Self {
		self.inner.events.insert(name);
		self
	}

	pub fn build(self) -> Descriptor {
		self.inner
	}
}

/// Coerces a decoded argument to its declared parameter kind.
pub(crate) fn align(
	kind: ParamKind,
	arg: ServerData,
	position: usize,
) -> Result<ServerData, InvokeError> {
	fn mismatch(position: usize, expected: &str, got: &ServerData) -> InvokeError {
		InvokeError::new(format!(
			"parameter {position}: expected {expected}, got {}",
			describe(got)
		))
	}

	match kind {
		ParamKind::Raw => Ok(arg),
		ParamKind::Bool => match arg.as_bool() {
			Some(_) => Ok(arg),
			None => Err(mismatch(position, "a boolean", &arg)),
		},
		ParamKind::Int => match &arg {
			ServerData::Plain(Value::Number(n)) => {
				if n.is_i64() {
					Ok(arg)
				} else {
					// Unsigned overflow or a fraction: narrowing is rejected.
					Err(mismatch(position, "a signed integer", &arg))
				}
			}
			_ => Err(mismatch(position, "an integer", &arg)),
		},
		ParamKind::Float => match &arg {
			ServerData::Plain(Value::Number(n)) => {
				if let Some(i) = n.as_i64() {
					Ok(ServerData::Plain(Value::from(i as f64)))
				} else if n.is_f64() {
					Ok(arg)
				} else {
					Err(mismatch(position, "a number", &arg))
				}
			}
			_ => Err(mismatch(position, "a number", &arg)),
		},
		ParamKind::Text => match arg.as_str() {
			Some(_) => Ok(arg),
			None => Err(mismatch(position, "a string", &arg)),
		},
		ParamKind::Object => match &arg {
			ServerData::Object(_) => Ok(arg),
			a if a.is_null() => Ok(arg),
			_ => Err(mismatch(position, "an object reference", &arg)),
		},
		ParamKind::Enum(names) => {
			if let Some(name) = arg.as_str() {
				return if names.iter().any(|variant| *variant == name) {
					Ok(arg)
				} else {
					Err(InvokeError::new(format!(
						"parameter {position}: `{name}` is not a variant of the enumeration"
					)))
				};
			}
			if let Some(index) = arg.as_i64() {
				let name = usize::try_from(index)
					.ok()
					.and_then(|i| names.get(i))
					.ok_or_else(|| {
						InvokeError::new(format!(
							"parameter {position}: {index} is out of range for the enumeration"
						))
					})?;
				return Ok(ServerData::from(*name));
			}
			Err(mismatch(
				position,
				"an enumeration name or index",
				&arg,
			))
		}
	}
}

fn describe(data: &ServerData) -> &'static str {
	match data {
		ServerData::Plain(Value::Null) => "null",
		ServerData::Plain(Value::Bool(_)) => "a boolean",
		ServerData::Plain(Value::Number(n)) if n.is_i64() || n.is_u64() => "an integer",
		ServerData::Plain(Value::Number(_)) => "a fractional number",
		ServerData::Plain(Value::String(_)) => "a string",
		ServerData::Plain(_) => "a value",
		ServerData::Object(_) => "an object reference",
		ServerData::List(_) => "a list",
		ServerData::Map(_) => "a map",
	}
}
