//! The one framed message shape both peers speak.

use serde::{Deserialize, Serialize};

use crate::{error::RpcError, DtoId, MessageId};

/// What an envelope means. Everything except `Response`, `Exception` and
/// `EventNotification` originates on the client.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
pub enum MessageKind {
	/// Ask for the server's root object. The only request that needs no
	/// target identifier.
	RootQuery,
	/// Invoke a method on the target.
	Query,
	/// Read a property of the target.
	Get,
	/// Write a property of the target.
	Set,
	/// Subscribe this session to the named event on the target.
	EventAdd,
	/// Drop the subscription. No-op when absent.
	EventRemove,
	/// Unsolicited server-to-client event delivery.
	EventNotification,
	/// The client reclaimed its proxy; the server may release the object.
	ProxyFinalized,
	Response,
	Exception,
}

/// One message on the wire. `payload` is the opaque value stream: arguments
/// for `Query`/`Set`, the return value for `Response`, event args for
/// `EventNotification`, an [`ExceptionBody`] for `Exception`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
	pub msg: MessageId,
	pub kind: MessageKind,
	/// Target object. `None` for [`MessageKind::RootQuery`] and for replies,
	/// where the correlation id already says everything.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub target: Option<DtoId>,
	/// Method, property, or event name. Empty where the kind implies it.
	#[serde(default, skip_serializing_if = "String::is_empty")]
	pub member: String,
	/// Arity hint used to pick between method overloads.
	#[serde(default)]
	pub arity: u32,
	#[serde(default)]
	pub payload: serde_json::Value,
}

impl Envelope {
	/// A fresh request envelope with its own correlation id.
	pub fn request(
		kind: MessageKind,
		target: Option<DtoId>,
		member: impl Into<String>,
		arity: u32,
		payload: serde_json::Value,
	) -> Self {
		Self {
			msg: MessageId::random(),
			kind,
			target,
			member: member.into(),
			arity,
			payload,
		}
	}

	/// The successful reply to `request`, echoing its correlation id.
	pub fn response(msg: MessageId, payload: serde_json::Value) -> Self {
		Self {
			msg,
			kind: MessageKind::Response,
			target: None,
			member: String::new(),
			arity: 0,
			payload,
		}
	}

	/// The failed reply to `request`.
	pub fn exception(msg: MessageId, body: &ExceptionBody) -> Self {
		Self {
			msg,
			kind: MessageKind::Exception,
			target: None,
			member: String::new(),
			arity: 0,
			payload: serde_json::to_value(body)
				.expect("exception body is always serializable"),
		}
	}

	/// An unsolicited event delivery. Carries its own id, which nothing
	/// correlates against.
	pub fn notification(
		target: DtoId,
		member: impl Into<String>,
		payload: serde_json::Value,
	) -> Self {
		Self {
			msg: MessageId::random(),
			kind: MessageKind::EventNotification,
			target: Some(target),
			member: member.into(),
			arity: 0,
			payload,
		}
	}
}

/// Which typed error an `Exception` envelope decodes back into.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
pub enum ExceptionKind {
	UnknownMember,
	ArityMismatch,
	Invocation,
}

/// The serialized summary of a server-side failure: a message and at most one
/// level of inner message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExceptionBody {
	pub kind: ExceptionKind,
	pub message: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub inner: Option<String>,
}

impl ExceptionBody {
	pub fn new(kind: ExceptionKind, message: impl Into<String>) -> Self {
		Self {
			kind,
			message: message.into(),
			inner: None,
		}
	}

	pub fn with_inner(mut self, inner: impl Into<String>) -> Self {
		self.inner = Some(inner.into());
		self
	}
}

impl From<ExceptionBody> for RpcError {
	fn from(body: ExceptionBody) -> Self {
		match body.kind {
			ExceptionKind::UnknownMember => RpcError::UnknownMember(body.message),
			ExceptionKind::ArityMismatch => RpcError::ArityMismatch(body.message),
			ExceptionKind::Invocation => RpcError::Invocation {
				message: body.message,
				inner: body.inner,
			},
		}
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn test_envelope_round_trip() {
		let env = Envelope::request(
			MessageKind::Query,
			Some(crate::DtoId::random()),
			"Echo",
			1,
			serde_json::json!(["hi"]),
		);
		let bytes = serde_json::to_vec(&env).unwrap();
		let back: Envelope = serde_json::from_slice(&bytes).unwrap();
		assert_eq!(back.msg, env.msg);
		assert_eq!(back.kind, MessageKind::Query);
		assert_eq!(back.target, env.target);
		assert_eq!(back.member, "Echo");
		assert_eq!(back.arity, 1);
		assert_eq!(back.payload, env.payload);
	}

	#[test]
	fn test_implied_fields_stay_off_the_wire() {
		let env = Envelope::response(MessageId::random(), serde_json::Value::Null);
		let text = serde_json::to_string(&env).unwrap();
		assert!(!text.contains("member"));
		assert!(!text.contains("target"));
	}

	#[test]
	fn test_exception_decodes_to_typed_error() {
		let body = ExceptionBody::new(ExceptionKind::Invocation, "boom")
			.with_inner("root cause");
		let env = Envelope::exception(MessageId::random(), &body);
		let back: ExceptionBody = serde_json::from_value(env.payload).unwrap();
		let err = RpcError::from(back);
		assert_eq!(
			err,
			RpcError::Invocation {
				message: "boom".into(),
				inner: Some("root cause".into()),
			}
		);
	}
}
