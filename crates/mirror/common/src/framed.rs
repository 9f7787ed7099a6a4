//! Length-prefixed JSON framing over one half of a stream socket.
//!
//! A frame is a 4-byte big-endian length (excluding itself) followed by the
//! JSON-encoded envelope. The reader and writer are separate wrappers so the
//! session can run its blocking-read and blocking-write workers over the two
//! halves of a split transport independently.

use std::io;

use futures::{Sink, Stream};
use pin_project::pin_project;
use tokio_serde::formats::SymmetricalJson;
use tokio_util::codec::{
	length_delimited::LengthDelimitedCodecError, FramedRead, FramedWrite,
	LengthDelimitedCodec,
};

use crate::error::RpcError;

fn length_codec(max_frame_len: usize) -> LengthDelimitedCodec {
	LengthDelimitedCodec::builder()
		.max_frame_length(max_frame_len)
		.new_codec()
}

/// Decides how a failed read or write faults the session: an envelope past
/// the configured bound is a protocol-limit fault, anything else means the
/// byte stream itself can no longer be trusted.
pub fn classify_frame_error(err: &io::Error) -> RpcError {
	let oversize = err
		.get_ref()
		.is_some_and(|inner| inner.is::<LengthDelimitedCodecError>());
	if oversize {
		RpcError::ProtocolLimit
	} else {
		RpcError::FrameTruncated
	}
}

/// The receiving half: a [`Stream`] of decoded `Item`s. Partial reads
/// reassemble deterministically inside the length-delimited codec.
#[pin_project]
pub struct FramedReader<Transport, Item> {
	#[pin]
	inner: tokio_serde::SymmetricallyFramed<
		FramedRead<Transport, LengthDelimitedCodec>,
		Item,
		SymmetricalJson<Item>,
	>,
}

impl<Transport, Item> FramedReader<Transport, Item>
where
	Transport: tokio::io::AsyncRead,
{
	pub fn new(transport: Transport, max_frame_len: usize) -> Self {
		let framed = FramedRead::new(transport, length_codec(max_frame_len));
		Self {
			inner: tokio_serde::SymmetricallyFramed::new(
				framed,
				SymmetricalJson::default(),
			),
		}
	}
}

// Skip potentially !Debug transport.
impl<Transport, Item> std::fmt::Debug for FramedReader<Transport, Item> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct(std::any::type_name::<Self>()).finish()
	}
}

impl<Transport, Item> Stream for FramedReader<Transport, Item>
where
	Transport: tokio::io::AsyncRead,
	Item: for<'a> serde::Deserialize<'a>,
{
	type Item = std::io::Result<Item>;

	fn poll_next(
		self: std::pin::Pin<&mut Self>,
		cx: &mut std::task::Context<'_>,
	) -> std::task::Poll<Option<Self::Item>> {
		self.project().inner.poll_next(cx)
	}
}

/// The sending half: a [`Sink`] of `Item`s.
#[pin_project]
pub struct FramedWriter<Transport, Item> {
	#[pin]
	inner: tokio_serde::SymmetricallyFramed<
		FramedWrite<Transport, LengthDelimitedCodec>,
		Item,
		SymmetricalJson<Item>,
	>,
}

impl<Transport, Item> FramedWriter<Transport, Item>
where
	Transport: tokio::io::AsyncWrite,
{
	pub fn new(transport: Transport, max_frame_len: usize) -> Self {
		let framed = FramedWrite::new(transport, length_codec(max_frame_len));
		Self {
			inner: tokio_serde::SymmetricallyFramed::new(
				framed,
				SymmetricalJson::default(),
			),
		}
	}
}

impl<Transport, Item> std::fmt::Debug for FramedWriter<Transport, Item> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct(std::any::type_name::<Self>()).finish()
	}
}

impl<Transport, Item> Sink<Item> for FramedWriter<Transport, Item>
where
	Transport: tokio::io::AsyncWrite,
	Item: serde::Serialize,
{
	type Error = std::io::Error;

	fn poll_ready(
		self: std::pin::Pin<&mut Self>,
		cx: &mut std::task::Context<'_>,
	) -> std::task::Poll<std::result::Result<(), Self::Error>> {
		self.project().inner.poll_ready(cx)
	}

	fn start_send(
		self: std::pin::Pin<&mut Self>,
		item: Item,
	) -> std::result::Result<(), Self::Error> {
		self.project().inner.start_send(item)
	}

	fn poll_flush(
		self: std::pin::Pin<&mut Self>,
		cx: &mut std::task::Context<'_>,
	) -> std::task::Poll<std::result::Result<(), Self::Error>> {
		self.project().inner.poll_flush(cx)
	}

	fn poll_close(
		self: std::pin::Pin<&mut Self>,
		cx: &mut std::task::Context<'_>,
	) -> std::task::Poll<std::result::Result<(), Self::Error>> {
		self.project().inner.poll_close(cx)
	}
}

#[cfg(test)]
mod test {
	use futures::{SinkExt, StreamExt};
	use tokio::io::AsyncWriteExt;

	use super::*;
	use crate::envelope::{Envelope, MessageKind};

	#[tokio::test]
	async fn test_envelope_round_trips_through_the_frame() {
		let (client, server) = tokio::io::duplex(1024);
		let mut writer: FramedWriter<_, Envelope> = FramedWriter::new(client, 1024);
		let mut reader: FramedReader<_, Envelope> = FramedReader::new(server, 1024);

		let sent = Envelope::request(
			MessageKind::Get,
			Some(crate::DtoId::random()),
			"Topic",
			0,
			serde_json::Value::Null,
		);
		writer.send(sent.clone()).await.unwrap();

		let received = reader.next().await.unwrap().unwrap();
		assert_eq!(received.msg, sent.msg);
		assert_eq!(received.kind, MessageKind::Get);
		assert_eq!(received.member, "Topic");
	}

	#[tokio::test]
	async fn test_oversize_frame_is_a_protocol_limit_fault() {
		let (client, server) = tokio::io::duplex(4096);
		// Generous bound on the writer so the fault is observed by the peer.
		let mut writer: FramedWriter<_, Envelope> = FramedWriter::new(client, 1 << 20);
		let mut reader: FramedReader<_, Envelope> = FramedReader::new(server, 64);

		let big = Envelope::request(
			MessageKind::Query,
			None,
			"Echo",
			1,
			serde_json::json!(["x".repeat(256)]),
		);
		writer.send(big).await.unwrap();

		let err = reader.next().await.unwrap().unwrap_err();
		assert_eq!(classify_frame_error(&err), RpcError::ProtocolLimit);
	}

	#[tokio::test]
	async fn test_truncated_frame_is_a_stream_fault() {
		let (mut client, server) = tokio::io::duplex(1024);
		let mut reader: FramedReader<_, Envelope> = FramedReader::new(server, 1024);

		// Announce 100 bytes, deliver 4, hang up.
		client.write_all(&100u32.to_be_bytes()).await.unwrap();
		client.write_all(b"oops").await.unwrap();
		drop(client);

		let err = reader.next().await.unwrap().unwrap_err();
		assert_eq!(classify_frame_error(&err), RpcError::FrameTruncated);
	}
}
