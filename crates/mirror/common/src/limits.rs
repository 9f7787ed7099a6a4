use std::time::Duration;

/// Resource bounds and deadlines for one session. Both peers carry their own
/// copy; nothing here is negotiated.
#[derive(Debug, Clone, Copy)]
pub struct Limits {
	/// Upper bound on one encoded envelope. Oversize frames fault the session.
	pub max_frame_len: usize,
	/// Capacity of the dispatch and write queues, in envelopes.
	pub queue_depth: usize,
	/// Deadline for an outgoing request's response.
	pub request_timeout: Duration,
	/// How long a finalized proxy's identifier may linger unreferenced before
	/// its release message is sent. Rapid resurrection inside this window
	/// cancels the send.
	pub finalize_quiescence: Duration,
}

impl Default for Limits {
	fn default() -> Self {
		Self {
			max_frame_len: 64 * 1024 * 1024,
			queue_depth: 10_000,
			request_timeout: Duration::from_secs(30),
			finalize_quiescence: Duration::from_millis(50),
		}
	}
}
