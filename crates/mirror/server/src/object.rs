//! What a server object carries to be exposable over a session.

use std::any::Any;
use std::sync::{Arc, Mutex, OnceLock};

use mirror_common::DtoId;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::descriptor::Descriptor;

/// A decoded value tree on the server side.
pub type ServerData = mirror_common::value::Data<Arc<dyn ServerDto>>;

/// The DTO capability. An application object that implements this trait is
/// transferred by reference: it gets a stable identifier the first time a
/// session serializes it, and its identifier resolves back to it for as long
/// as the session tracks it.
///
/// Implementors embed a [`DtoCore`] and hand out a [`Descriptor`] built once
/// per concrete type; see the hosting binary's root for the shape.
pub trait ServerDto: Send + Sync + 'static {
	fn core(&self) -> &DtoCore;
	fn descriptor(&self) -> &Descriptor;
	fn as_any(&self) -> &(dyn Any + Send + Sync);
}

/// What a tracked object tells the resolvers observing it.
#[derive(Debug, Clone)]
pub struct ObjectEvent {
	pub dto: DtoId,
	/// Property name for [`EventPayload::PropertyChanged`], event name
	/// otherwise.
	pub member: String,
	pub payload: EventPayload,
}

#[derive(Debug, Clone)]
pub enum EventPayload {
	/// The value is read through the property getter when the notification
	/// is serialized, not when it was queued.
	PropertyChanged,
	/// Application event args, forwarded as-is.
	Custom(Value),
}

/// Per-object server-side adornment: the identifier and the property-change
/// subscriptions. Embed one per application object.
#[derive(Debug, Default)]
pub struct DtoCore {
	id: OnceLock<DtoId>,
	sinks: Mutex<Vec<Sink>>,
}

#[derive(Debug)]
struct Sink {
	token: u64,
	tx: mpsc::UnboundedSender<ObjectEvent>,
}

impl DtoCore {
	pub fn new() -> Self {
		Self::default()
	}

	/// The identifier, once some session has exposed this object.
	pub fn id(&self) -> Option<DtoId> {
		self.id.get().copied()
	}

	/// Assigns the identifier at most once, ever. Races resolve to one value.
	pub(crate) fn assign_id(&self) -> DtoId {
		*self.id.get_or_init(DtoId::random)
	}

	pub(crate) fn attach(&self, token: u64, tx: mpsc::UnboundedSender<ObjectEvent>) {
		self.sinks.lock().expect("poisoned").push(Sink { token, tx });
	}

	pub(crate) fn detach(&self, token: u64) {
		self.sinks
			.lock()
			.expect("poisoned")
			.retain(|sink| sink.token != token);
	}

	/// Announces that the named property has a new value. Sessions that
	/// subscribed to `PropertyChanged` on this object will read the live
	/// value and notify their client.
	pub fn property_changed(&self, property: &str) {
		self.emit(property, EventPayload::PropertyChanged);
	}

	/// Raises a named application event with the given args. The event must
	/// be declared on the type's descriptor for clients to subscribe to it.
	pub fn raise(&self, event: &str, args: Value) {
		self.emit(event, EventPayload::Custom(args));
	}

	fn emit(&self, member: &str, payload: EventPayload) {
		// Never exposed yet: nobody can be subscribed.
		let Some(id) = self.id() else { return };
		self.sinks.lock().expect("poisoned").retain(|sink| {
			sink.tx
				.send(ObjectEvent {
					dto: id,
					member: member.to_owned(),
					payload: payload.clone(),
				})
				.is_ok()
		});
	}
}
