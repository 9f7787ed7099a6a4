//! Client half of the mirror remote object fabric: connect to a server, take
//! its root proxy, and work the remote object graph through local stubs.
//!
//! ```no_run
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let session = mirror_client::Session::connect("127.0.0.1:9411").await?;
//! let root = session.root().await?;
//! let reply = root.invoke("Echo", vec!["hi".into()]).await?;
//! assert_eq!(reply.as_str(), Some("hi"));
//! # Ok(())
//! # }
//! ```

mod decode;
mod proxy;
mod resolver;
mod session;

pub use self::proxy::Proxy;
pub use self::session::Session;
pub use mirror_common::error::RpcError;
pub use mirror_common::limits::Limits;
pub use mirror_common::{DtoId, PROPERTY_CHANGED};

/// The decoded payload tree on the client side: plain JSON values with
/// resolved [`Proxy`] handles where the server sent object references.
pub type ClientData = mirror_common::value::Data<std::sync::Arc<Proxy>>;
