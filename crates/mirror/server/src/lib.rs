//! Server half of the mirror remote object fabric: exposes a live graph of
//! application objects to connected clients over a duplex stream socket.

pub mod auth;
pub mod descriptor;
mod encode;
mod hello;
pub mod object;
pub mod resolver;
mod session;

pub use self::auth::{AllowAnonymous, Authenticator, Principal};
pub use self::descriptor::{Descriptor, DescriptorBuilder, InvokeError, ParamKind};
pub use self::object::{DtoCore, EventPayload, ObjectEvent, ServerData, ServerDto};
pub use self::resolver::ServerResolver;
pub use mirror_common::limits::Limits;

use std::net::SocketAddr;
use std::num::Wrapping;
use std::sync::Arc;

use clap::Parser;
use color_eyre::{eyre::Context as _, Result};
use mirror_common::error::RpcError;
use tokio::net::TcpListener;
use tracing::{error, info, info_span, warn, Instrument};

/// Accepts connections and runs one session per client, all sharing the same
/// root object.
pub struct Server {
	root: Arc<dyn ServerDto>,
	authenticator: Arc<dyn Authenticator>,
	limits: Limits,
}

impl Server {
	pub fn new(root: Arc<dyn ServerDto>) -> Self {
		Self {
			root,
			authenticator: Arc::new(AllowAnonymous),
			limits: Limits::default(),
		}
	}

	pub fn with_authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
		self.authenticator = authenticator;
		self
	}

	pub fn with_limits(mut self, limits: Limits) -> Self {
		self.limits = limits;
		self
	}

	/// Serves forever on an already-bound listener.
	pub async fn serve(self, listener: TcpListener) -> Result<()> {
		let server = Arc::new(self);
		let mut id = Wrapping(0u64);
		loop {
			let (stream, peer) = listener
				.accept()
				.await
				.wrap_err("failed to accept a connection")?;
			id += 1;
			let server = server.clone();
			let span =
				info_span!("session", id = id.0, %peer, principal = tracing::field::Empty);
			tokio::spawn(
				async move {
					let Some(principal) = server.authenticator.authenticate(peer).await
					else {
						warn!("{}", RpcError::Unauthorized);
						return;
					};
					tracing::Span::current()
						.record("principal", principal.name.as_str());
					info!("session accepted");
					match session::run(stream, server.root.clone(), server.limits).await
					{
						Ok(()) => info!("disconnected"),
						Err(err) => error!("terminated with error: {err:?}"),
					}
				}
				.instrument(span),
			);
		}
	}
}

/// Command line arguments for the hosting binary.
#[derive(Parser, Debug)]
pub struct Args {
	/// Address to listen on.
	#[clap(long, default_value = "127.0.0.1:9411")]
	pub listen: SocketAddr,
	/// Upper bound on one encoded envelope, in bytes.
	#[clap(long)]
	pub max_frame_len: Option<usize>,
	/// Dispatch and write queue capacity, in envelopes.
	#[clap(long)]
	pub queue_depth: Option<usize>,
}

/// Hosting entry point: serves the built-in root so the fabric can be smoke
/// tested end to end.
pub async fn main(args: Args) -> Result<()> {
	color_eyre::install()?;
	tracing_subscriber::fmt()
		.with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
		.init();

	let mut limits = Limits::default();
	if let Some(n) = args.max_frame_len {
		limits.max_frame_len = n;
	}
	if let Some(n) = args.queue_depth {
		limits.queue_depth = n;
	}

	let listener = TcpListener::bind(args.listen)
		.await
		.wrap_err("failed to bind listener")?;
	info!("listening on {}", listener.local_addr()?);
	Server::new(hello::root())
		.with_limits(limits)
		.serve(listener)
		.await
}
