//! Who may open a session.

use std::net::SocketAddr;

use async_trait::async_trait;

/// The authenticated identity a session's workers run under. Recorded on the
/// session's tracing span, so every worker of the session logs under it.
#[derive(Debug, Clone)]
pub struct Principal {
	pub name: String,
}

/// Decides, once per accepted connection and before any session worker
/// starts, whether the peer may talk to us. `None` refuses the connection.
#[async_trait]
pub trait Authenticator: Send + Sync {
	async fn authenticate(&self, peer: SocketAddr) -> Option<Principal>;
}

/// Accepts everyone, with an address-derived principal name.
#[derive(Debug, Default)]
pub struct AllowAnonymous;

#[async_trait]
impl Authenticator for AllowAnonymous {
	async fn authenticate(&self, peer: SocketAddr) -> Option<Principal> {
		Some(Principal {
			name: format!("anonymous@{peer}"),
		})
	}
}
