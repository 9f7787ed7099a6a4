/// Everything that can go wrong on a session, from the application's point of
/// view. The first three and the last three are session-level; the middle
/// three travel the wire as `Exception` envelopes.
#[derive(thiserror::Error, Debug, Clone, Eq, PartialEq)]
pub enum RpcError {
	#[error("frame exceeds the session's size limit")]
	ProtocolLimit,
	#[error("malformed or truncated frame")]
	FrameTruncated,
	#[error("connection refused by the authenticator")]
	Unauthorized,
	#[error("{0}")]
	UnknownMember(String),
	#[error("{0}")]
	ArityMismatch(String),
	#[error("remote invocation failed: {message}")]
	Invocation {
		message: String,
		/// One level of inner error message, when the remote had one.
		inner: Option<String>,
	},
	#[error("request timed out")]
	Timeout,
	#[error("session closed")]
	SessionClosed,
	#[error("session queue overflow")]
	Congestion,
}
