//! One accepted connection: the framing workers, the dispatch state machine,
//! and the event pump.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use futures::{SinkExt, StreamExt};
use mirror_common::envelope::{Envelope, ExceptionBody, ExceptionKind, MessageKind};
use mirror_common::error::RpcError;
use mirror_common::limits::Limits;
use mirror_common::{classify_frame_error, DtoId, FramedReader, FramedWriter};
use mirror_common::PROPERTY_CHANGED;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn, Instrument, Span};

use crate::descriptor::{align, InvokeError};
use crate::encode::{decode, encode};
use crate::object::{EventPayload, ObjectEvent, ServerData, ServerDto};
use crate::resolver::ServerResolver;

/// Shared state of one session's workers.
struct SessionCtx {
	resolver: Arc<ServerResolver>,
	root: Arc<dyn ServerDto>,
	/// Event subscriptions this client holds, keyed by emitter and event
	/// name. A duplicate add and an absent remove are both no-ops.
	delegates: Mutex<HashSet<(DtoId, String)>>,
	writer_tx: mpsc::Sender<Envelope>,
	fault: Fault,
}

/// First fault wins; tripping cancels every worker.
#[derive(Clone)]
struct Fault {
	slot: Arc<Mutex<Option<RpcError>>>,
	cancel: CancellationToken,
}

impl Fault {
	fn new(cancel: CancellationToken) -> Self {
		Self {
			slot: Arc::new(Mutex::new(None)),
			cancel,
		}
	}

	fn trip(&self, err: RpcError) {
		let mut slot = self.slot.lock().expect("poisoned");
		if slot.is_none() {
			*slot = Some(err);
		}
		drop(slot);
		self.cancel.cancel();
	}

	fn take(&self) -> Option<RpcError> {
		self.slot.lock().expect("poisoned").take()
	}
}

/// Runs one session to completion over an established duplex transport.
/// Returns when the client hangs up (Ok) or the session faults (Err).
pub(crate) async fn run<T>(
	transport: T,
	root: Arc<dyn ServerDto>,
	limits: Limits,
) -> Result<(), RpcError>
where
	T: AsyncRead + AsyncWrite + Send + 'static,
{
	let (read_half, write_half) = tokio::io::split(transport);
	let reader = FramedReader::new(read_half, limits.max_frame_len);
	let writer = FramedWriter::new(write_half, limits.max_frame_len);

	let (resolver, events_rx) = ServerResolver::new();
	let (writer_tx, writer_rx) = mpsc::channel(limits.queue_depth);
	let (dispatch_tx, dispatch_rx) = mpsc::channel(limits.queue_depth);
	let cancel = CancellationToken::new();
	let fault = Fault::new(cancel.clone());

	let ctx = Arc::new(SessionCtx {
		resolver: resolver.clone(),
		root,
		delegates: Mutex::new(HashSet::new()),
		writer_tx,
		fault: fault.clone(),
	});

	let span = Span::current();
	let reader_task = tokio::spawn(
		read_worker(reader, dispatch_tx, fault.clone(), cancel.clone())
			.instrument(span.clone()),
	);
	let writer_task = tokio::spawn(
		write_worker(writer, writer_rx, fault.clone(), cancel.clone())
			.instrument(span.clone()),
	);
	let pump_task = tokio::spawn(
		event_pump(ctx.clone(), events_rx, cancel.clone()).instrument(span),
	);

	dispatch_loop(&ctx, dispatch_rx).await;

	cancel.cancel();
	resolver.clear();
	let _ = tokio::join!(reader_task, writer_task, pump_task);
	match fault.take() {
		Some(err) => Err(err),
		None => Ok(()),
	}
}

async fn read_worker<R>(
	mut reader: FramedReader<R, Envelope>,
	dispatch_tx: mpsc::Sender<Envelope>,
	fault: Fault,
	cancel: CancellationToken,
) where
	R: AsyncRead + Unpin,
{
	loop {
		let next = tokio::select! {
			() = cancel.cancelled() => return,
			next = reader.next() => next,
		};
		match next {
			// Clean hang-up; dropping the sender ends the dispatcher.
			None => return,
			Some(Ok(envelope)) => {
				if dispatch_tx.try_send(envelope).is_err() {
					fault.trip(RpcError::Congestion);
					return;
				}
			}
			Some(Err(err)) => {
				let fault_kind = classify_frame_error(&err);
				warn!(error = %err, "read failed: {fault_kind}");
				fault.trip(fault_kind);
				return;
			}
		}
	}
}

async fn write_worker<W>(
	mut writer: FramedWriter<W, Envelope>,
	mut writer_rx: mpsc::Receiver<Envelope>,
	fault: Fault,
	cancel: CancellationToken,
) where
	W: AsyncWrite + Unpin,
{
	loop {
		let envelope = tokio::select! {
			() = cancel.cancelled() => break,
			envelope = writer_rx.recv() => match envelope {
				Some(envelope) => envelope,
				None => break,
			},
		};
		if let Err(err) = writer.send(envelope).await {
			fault.trip(classify_frame_error(&err));
			return;
		}
	}
	// One final drain, so replies enqueued before cancellation still go out.
	while let Ok(envelope) = writer_rx.try_recv() {
		if writer.send(envelope).await.is_err() {
			break;
		}
	}
}

/// Forwards property-change and application events from tracked objects to
/// the client, filtered by the subscriptions this session holds.
async fn event_pump(
	ctx: Arc<SessionCtx>,
	mut events_rx: mpsc::UnboundedReceiver<ObjectEvent>,
	cancel: CancellationToken,
) {
	loop {
		let event = tokio::select! {
			() = cancel.cancelled() => return,
			event = events_rx.recv() => match event {
				Some(event) => event,
				None => return,
			},
		};
		let event_name = match &event.payload {
			EventPayload::PropertyChanged => PROPERTY_CHANGED,
			EventPayload::Custom(_) => event.member.as_str(),
		};
		let subscribed = ctx
			.delegates
			.lock()
			.expect("poisoned")
			.contains(&(event.dto, event_name.to_owned()));
		if !subscribed {
			continue;
		}
		let payload = match event.payload {
			EventPayload::PropertyChanged => {
				// Read the value that is live now, not when the change was
				// queued.
				let Some(object) = ctx.resolver.resolve(event.dto) else {
					continue;
				};
				let Some(property) = object.descriptor().property(&event.member)
				else {
					continue;
				};
				let current = encode(&ctx.resolver, &property.read(object.as_ref()));
				serde_json::json!({ "name": event.member, "value": current })
			}
			EventPayload::Custom(args) => args,
		};
		let envelope = Envelope::notification(event.dto, event_name, payload);
		if !enqueue(&ctx, envelope) {
			return;
		}
	}
}

fn enqueue(ctx: &SessionCtx, envelope: Envelope) -> bool {
	match ctx.writer_tx.try_send(envelope) {
		Ok(()) => true,
		Err(mpsc::error::TrySendError::Full(_)) => {
			ctx.fault.trip(RpcError::Congestion);
			false
		}
		Err(mpsc::error::TrySendError::Closed(_)) => false,
	}
}

async fn dispatch_loop(ctx: &Arc<SessionCtx>, mut dispatch_rx: mpsc::Receiver<Envelope>) {
	loop {
		let envelope = tokio::select! {
			() = ctx.fault.cancel.cancelled() => return,
			envelope = dispatch_rx.recv() => match envelope {
				Some(envelope) => envelope,
				None => return,
			},
		};
		if let Some(reply) = handle(ctx, envelope) {
			if !enqueue(ctx, reply) {
				return;
			}
		}
	}
}

fn handle(ctx: &SessionCtx, env: Envelope) -> Option<Envelope> {
	match env.kind {
		MessageKind::RootQuery => {
			let payload = encode(&ctx.resolver, &ServerData::Object(ctx.root.clone()));
			Some(Envelope::response(env.msg, payload))
		}
		MessageKind::Query => Some(query(ctx, &env)),
		MessageKind::Get => Some(get(ctx, &env)),
		MessageKind::Set => Some(set(ctx, &env)),
		MessageKind::EventAdd => Some(event_add(ctx, &env)),
		MessageKind::EventRemove => Some(event_remove(ctx, &env)),
		MessageKind::ProxyFinalized => Some(proxy_finalized(ctx, &env)),
		// Clients do not send replies or notifications.
		MessageKind::Response | MessageKind::Exception | MessageKind::EventNotification => {
			debug!(kind = ?env.kind, "dropping unexpected envelope");
			None
		}
	}
}

/// Resolves the addressed object. An unknown identifier is answered with a
/// null response rather than an error; the caller logs and moves on.
fn resolve_target(ctx: &SessionCtx, env: &Envelope) -> Option<(DtoId, Arc<dyn ServerDto>)> {
	let id = env.target?;
	match ctx.resolver.resolve(id) {
		Some(object) => Some((id, object)),
		None => {
			warn!(%id, member = %env.member, "request for an unknown identifier");
			None
		}
	}
}

fn invocation_body(err: &InvokeError) -> ExceptionBody {
	let mut body = ExceptionBody::new(ExceptionKind::Invocation, err.message.clone());
	if let Some(inner) = &err.inner {
		body = body.with_inner(inner.clone());
	}
	body
}

fn query(ctx: &SessionCtx, env: &Envelope) -> Envelope {
	let Some((_, target)) = resolve_target(ctx, env) else {
		return Envelope::response(env.msg, Value::Null);
	};
	match invoke(ctx, &target, env) {
		Ok(result) => Envelope::response(env.msg, encode(&ctx.resolver, &result)),
		Err(body) => Envelope::exception(env.msg, &body),
	}
}

fn invoke(
	ctx: &SessionCtx,
	target: &Arc<dyn ServerDto>,
	env: &Envelope,
) -> Result<ServerData, ExceptionBody> {
	let descriptor = target.descriptor();
	let overloads = descriptor.overloads(&env.member).ok_or_else(|| {
		ExceptionBody::new(
			ExceptionKind::UnknownMember,
			format!("unknown method `{}`", env.member),
		)
	})?;
	let arity = env.arity as usize;
	let method = overloads
		.iter()
		.find(|method| method.arity() == arity)
		.ok_or_else(|| {
			ExceptionBody::new(
				ExceptionKind::ArityMismatch,
				format!("no overload of `{}` takes {} parameters", env.member, env.arity),
			)
		})?;

	let raw_args = match &env.payload {
		Value::Array(items) => items.as_slice(),
		Value::Null => &[],
		_ => {
			return Err(ExceptionBody::new(
				ExceptionKind::Invocation,
				"arguments must be an array",
			))
		}
	};
	if raw_args.len() != arity {
		return Err(ExceptionBody::new(
			ExceptionKind::ArityMismatch,
			format!(
				"argument count {} disagrees with the declared arity {}",
				raw_args.len(),
				env.arity
			),
		));
	}

	let mut args = Vec::with_capacity(arity);
	for (position, (raw, kind)) in raw_args.iter().zip(method.params()).enumerate() {
		let decoded =
			decode(&ctx.resolver, raw).map_err(|err| invocation_body(&err))?;
		args.push(align(*kind, decoded, position).map_err(|err| invocation_body(&err))?);
	}

	method.call(target.as_ref(), args).map_err(|err| {
		// The client gets the exception envelope; the operator gets the log.
		error!(method = %env.member, error = %err, "invocation failed");
		invocation_body(&err)
	})
}

fn get(ctx: &SessionCtx, env: &Envelope) -> Envelope {
	let Some((_, target)) = resolve_target(ctx, env) else {
		return Envelope::response(env.msg, Value::Null);
	};
	let Some(property) = target.descriptor().property(&env.member) else {
		return Envelope::exception(
			env.msg,
			&ExceptionBody::new(
				ExceptionKind::UnknownMember,
				format!("unknown property `{}`", env.member),
			),
		);
	};
	let value = property.read(target.as_ref());
	Envelope::response(env.msg, encode(&ctx.resolver, &value))
}

fn set(ctx: &SessionCtx, env: &Envelope) -> Envelope {
	let Some((_, target)) = resolve_target(ctx, env) else {
		return Envelope::response(env.msg, Value::Null);
	};
	let Some(property) = target.descriptor().property(&env.member) else {
		return Envelope::exception(
			env.msg,
			&ExceptionBody::new(
				ExceptionKind::UnknownMember,
				format!("unknown property `{}`", env.member),
			),
		);
	};
	let outcome = decode(&ctx.resolver, &env.payload)
		.and_then(|value| property.write(&env.member, target.as_ref(), value));
	match outcome {
		Ok(()) => Envelope::response(env.msg, Value::Null),
		Err(err) => Envelope::exception(env.msg, &invocation_body(&err)),
	}
}

fn event_add(ctx: &SessionCtx, env: &Envelope) -> Envelope {
	let Some((id, target)) = resolve_target(ctx, env) else {
		return Envelope::response(env.msg, Value::Null);
	};
	if !target.descriptor().has_event(&env.member) {
		return Envelope::exception(
			env.msg,
			&ExceptionBody::new(
				ExceptionKind::UnknownMember,
				format!("unknown event `{}`", env.member),
			),
		);
	}
	ctx.delegates
		.lock()
		.expect("poisoned")
		.insert((id, env.member.clone()));
	Envelope::response(env.msg, Value::Null)
}

fn event_remove(ctx: &SessionCtx, env: &Envelope) -> Envelope {
	if let Some(id) = env.target {
		ctx.delegates
			.lock()
			.expect("poisoned")
			.remove(&(id, env.member.clone()));
	}
	Envelope::response(env.msg, Value::Null)
}

/// The client reclaimed its proxy: drop its subscriptions, release the
/// object. An unknown identifier is acknowledged silently.
fn proxy_finalized(ctx: &SessionCtx, env: &Envelope) -> Envelope {
	if let Some(id) = env.target {
		ctx.delegates
			.lock()
			.expect("poisoned")
			.retain(|(dto, _)| *dto != id);
		ctx.resolver.remove(id);
	}
	Envelope::response(env.msg, Value::Null)
}
