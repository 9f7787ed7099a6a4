//! One duplex connection to a server: the framing workers, response
//! correlation, event routing, and the finalization pump.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use mirror_common::envelope::{Envelope, ExceptionBody, MessageKind};
use mirror_common::error::RpcError;
use mirror_common::limits::Limits;
use mirror_common::{classify_frame_error, DtoId, FramedReader, FramedWriter, MessageId};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::decode;
use crate::proxy::Proxy;
use crate::resolver::ClientResolver;

type Slot = oneshot::Sender<Result<Value, RpcError>>;

/// State shared between the session handle, its proxies, and its workers.
pub(crate) struct Shared {
	pub(crate) resolver: ClientResolver,
	pub(crate) limits: Limits,
	writer_tx: mpsc::Sender<Envelope>,
	pending: Mutex<HashMap<MessageId, Slot>>,
	cancel: CancellationToken,
}

impl Shared {
	/// Sends a request and suspends the caller until its response arrives,
	/// the deadline passes, or the session closes.
	pub(crate) async fn request(
		&self,
		kind: MessageKind,
		target: Option<DtoId>,
		member: &str,
		arity: u32,
		payload: Value,
	) -> Result<Value, RpcError> {
		if self.cancel.is_cancelled() {
			return Err(RpcError::SessionClosed);
		}
		let envelope = Envelope::request(kind, target, member, arity, payload);
		let msg = envelope.msg;
		let (slot_tx, slot_rx) = oneshot::channel();
		self.pending.lock().expect("poisoned").insert(msg, slot_tx);
		if let Err(err) = self.enqueue(envelope) {
			self.pending.lock().expect("poisoned").remove(&msg);
			return Err(err);
		}
		// A close racing the insert above may have drained the map already;
		// without this the request would sit out its full deadline.
		if self.cancel.is_cancelled() {
			self.pending.lock().expect("poisoned").remove(&msg);
			return Err(RpcError::SessionClosed);
		}
		match tokio::time::timeout(self.limits.request_timeout, slot_rx).await {
			Err(_elapsed) => {
				self.pending.lock().expect("poisoned").remove(&msg);
				Err(RpcError::Timeout)
			}
			Ok(Err(_slot_dropped)) => Err(RpcError::SessionClosed),
			Ok(Ok(result)) => result,
		}
	}

	/// Fire-and-forget release of a reclaimed identifier. No completion slot
	/// is registered; the server's bare ack is dropped by dispatch.
	pub(crate) fn post_finalized(&self, id: DtoId) {
		let envelope =
			Envelope::request(MessageKind::ProxyFinalized, Some(id), "", 0, Value::Null);
		let _ = self.enqueue(envelope);
	}

	fn enqueue(&self, envelope: Envelope) -> Result<(), RpcError> {
		match self.writer_tx.try_send(envelope) {
			Ok(()) => Ok(()),
			Err(mpsc::error::TrySendError::Full(_)) => {
				// Queue overflow is a session fault, not a retryable error.
				self.close();
				Err(RpcError::Congestion)
			}
			Err(mpsc::error::TrySendError::Closed(_)) => Err(RpcError::SessionClosed),
		}
	}

	/// Cancels the workers and fails every outstanding request.
	pub(crate) fn close(&self) {
		self.cancel.cancel();
		let slots: Vec<Slot> = {
			let mut pending = self.pending.lock().expect("poisoned");
			pending.drain().map(|(_, slot)| slot).collect()
		};
		for slot in slots {
			let _ = slot.send(Err(RpcError::SessionClosed));
		}
	}
}

/// A client session. Cheap to clone; every clone (and every proxy obtained
/// from it) shares the same socket and workers.
#[derive(Clone)]
pub struct Session {
	shared: Arc<Shared>,
}

impl Session {
	/// Connects over TCP with default limits.
	pub async fn connect(addr: impl ToSocketAddrs) -> std::io::Result<Self> {
		Self::connect_with(addr, Limits::default()).await
	}

	pub async fn connect_with(
		addr: impl ToSocketAddrs,
		limits: Limits,
	) -> std::io::Result<Self> {
		let stream = TcpStream::connect(addr).await?;
		Ok(Self::over(stream, limits))
	}

	/// Runs a session over any established duplex transport. Encryption, if
	/// any, is the transport's business.
	pub fn over<T>(transport: T, limits: Limits) -> Self
	where
		T: AsyncRead + AsyncWrite + Send + 'static,
	{
		let (read_half, write_half) = tokio::io::split(transport);
		let reader = FramedReader::new(read_half, limits.max_frame_len);
		let writer = FramedWriter::new(write_half, limits.max_frame_len);

		let (writer_tx, writer_rx) = mpsc::channel(limits.queue_depth);
		let (dispatch_tx, dispatch_rx) = mpsc::channel(limits.queue_depth);
		let cancel = CancellationToken::new();
		let shared = Arc::new(Shared {
			resolver: ClientResolver::new(),
			limits,
			writer_tx,
			pending: Mutex::new(HashMap::new()),
			cancel: cancel.clone(),
		});

		tokio::spawn(read_worker(reader, dispatch_tx, shared.clone()));
		tokio::spawn(write_worker(writer, writer_rx, shared.clone()));
		tokio::spawn(dispatch_worker(dispatch_rx, shared.clone()));
		tokio::spawn(finalize_pump(Arc::downgrade(&shared)));

		Self { shared }
	}

	/// Fetches the server's root object, the entry point to everything else.
	pub async fn root(&self) -> Result<Arc<Proxy>, RpcError> {
		let payload = self
			.shared
			.request(MessageKind::RootQuery, None, "", 0, Value::Null)
			.await?;
		decode::decode(&self.shared, &payload)
			.into_object()
			.ok_or_else(|| RpcError::Invocation {
				message: "root query returned a non-object".to_owned(),
				inner: None,
			})
	}

	/// Tears the session down. Outstanding requests fail with
	/// [`RpcError::SessionClosed`].
	pub fn close(&self) {
		self.shared.close();
	}

	pub(crate) fn shared(&self) -> &Arc<Shared> {
		&self.shared
	}
}

impl std::fmt::Debug for Session {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Session").finish_non_exhaustive()
	}
}

async fn read_worker<R>(
	mut reader: FramedReader<R, Envelope>,
	dispatch_tx: mpsc::Sender<Envelope>,
	shared: Arc<Shared>,
) where
	R: AsyncRead + Unpin,
{
	loop {
		let next = tokio::select! {
			() = shared.cancel.cancelled() => return,
			next = reader.next() => next,
		};
		match next {
			// Server hang-up fails everything outstanding.
			None => {
				shared.close();
				return;
			}
			Some(Ok(envelope)) => {
				if dispatch_tx.try_send(envelope).is_err() {
					warn!("dispatch queue overflow");
					shared.close();
					return;
				}
			}
			Some(Err(err)) => {
				warn!(error = %err, "read failed: {}", classify_frame_error(&err));
				shared.close();
				return;
			}
		}
	}
}

async fn write_worker<W>(
	mut writer: FramedWriter<W, Envelope>,
	mut writer_rx: mpsc::Receiver<Envelope>,
	shared: Arc<Shared>,
) where
	W: AsyncWrite + Unpin,
{
	loop {
		let envelope = tokio::select! {
			() = shared.cancel.cancelled() => break,
			envelope = writer_rx.recv() => match envelope {
				Some(envelope) => envelope,
				None => break,
			},
		};
		if let Err(err) = writer.send(envelope).await {
			warn!(error = %err, "write failed: {}", classify_frame_error(&err));
			shared.close();
			return;
		}
	}
	// One final drain, so messages enqueued before cancellation (release
	// notices included) still go out while the socket is writable.
	while let Ok(envelope) = writer_rx.try_recv() {
		if writer.send(envelope).await.is_err() {
			break;
		}
	}
}

/// Routes incoming envelopes: replies to their completion slot, event
/// notifications to the addressed proxy.
async fn dispatch_worker(mut dispatch_rx: mpsc::Receiver<Envelope>, shared: Arc<Shared>) {
	loop {
		let envelope = tokio::select! {
			() = shared.cancel.cancelled() => return,
			envelope = dispatch_rx.recv() => match envelope {
				Some(envelope) => envelope,
				None => return,
			},
		};
		match envelope.kind {
			MessageKind::Response => complete(&shared, envelope.msg, Ok(envelope.payload)),
			MessageKind::Exception => {
				let err = match serde_json::from_value::<ExceptionBody>(envelope.payload)
				{
					Ok(body) => RpcError::from(body),
					Err(_) => RpcError::Invocation {
						message: "malformed exception envelope".to_owned(),
						inner: None,
					},
				};
				complete(&shared, envelope.msg, Err(err));
			}
			MessageKind::EventNotification => deliver_event(&shared, &envelope),
			kind => debug!(?kind, "dropping unexpected envelope"),
		}
	}
}

fn complete(shared: &Shared, msg: MessageId, result: Result<Value, RpcError>) {
	let slot = shared.pending.lock().expect("poisoned").remove(&msg);
	match slot {
		Some(slot) => {
			let _ = slot.send(result);
		}
		// Fire-and-forget acks and late replies land here.
		None => debug!(%msg, "reply with no outstanding request dropped"),
	}
}

fn deliver_event(shared: &Arc<Shared>, envelope: &Envelope) {
	let Some(id) = envelope.target else {
		debug!("event notification without a target dropped");
		return;
	};
	let Some(proxy) = shared.resolver.resolve(id) else {
		// Racing against our own finalization; never an error.
		debug!(%id, member = %envelope.member, "event for a reclaimed proxy dropped");
		return;
	};
	proxy.deliver(&envelope.member, &envelope.payload);
}

/// Sends `ProxyFinalized` for identifiers whose proxy stayed reclaimed for a
/// full quiescence window. Holds the session weakly so an abandoned session
/// can drop; exits when it does.
async fn finalize_pump(shared: Weak<Shared>) {
	let window = match shared.upgrade() {
		Some(shared) => shared.limits.finalize_quiescence,
		None => return,
	};
	let period = (window / 2).max(Duration::from_millis(1));
	let mut interval = tokio::time::interval(period);
	loop {
		interval.tick().await;
		let Some(shared) = shared.upgrade() else {
			return;
		};
		if shared.cancel.is_cancelled() {
			return;
		}
		for id in shared.resolver.due_finalized(window) {
			debug!(%id, "releasing reclaimed proxy");
			shared.post_finalized(id);
		}
	}
}
