//! Framed JSON transports to the browser.
//!
//! Two interchangeable variants behind the same object-safe halves:
//!
//! - [`WebSocketTransport`]: dialed to the browser's debugger URL, one JSON
//!   text per websocket message.
//! - [`PipeTransport`]: NUL-delimited JSON frames over an OS pipe pair
//!   (`--remote-debugging-pipe`). Generic over [`AsyncRead`]/[`AsyncWrite`]
//!   so tests can drive it with [`tokio::io::duplex`].
//!
//! Each transport has exactly one reader; the [`Connection`](crate::Connection)
//! owns the single writer task, so writers never interleave frames.

use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use crate::error::{Error, Result};

/// Write half of a transport. One frame per call; atomicity is guaranteed by
/// the connection's single writer task.
pub trait TransportSender: Send {
	fn send(&mut self, frame: Value) -> BoxFuture<'_, Result<()>>;
}

/// Read half of a transport. `run` blocks until EOF or a fatal error,
/// forwarding every parsed frame into the channel handed out at construction.
pub trait TransportReceiver: Send {
	fn run(self: Box<Self>) -> BoxFuture<'static, Result<()>>;
}

/// A connected transport, split into its halves plus the inbound frame
/// channel the receiver feeds.
pub struct TransportParts {
	pub sender: Box<dyn TransportSender>,
	pub receiver: Box<dyn TransportReceiver>,
	pub frames: mpsc::UnboundedReceiver<Value>,
}

// ---------------------------------------------------------------- websocket

/// Transport over the browser's websocket debugger endpoint.
pub struct WebSocketTransport;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

impl WebSocketTransport {
	/// Dials `ws://localhost:<port>/devtools/browser/...` (or a per-target
	/// page URL) and returns the split transport.
	pub async fn connect(url: &str) -> Result<TransportParts> {
		let (stream, _) = connect_async(url)
			.await
			.map_err(|e| Error::Transport(format!("dial {url}: {e}")))?;
		let (sink, stream) = stream.split();
		let (frames_tx, frames) = mpsc::unbounded_channel();
		Ok(TransportParts {
			sender: Box::new(WsSender { sink }),
			receiver: Box::new(WsReceiver { stream, frames: frames_tx }),
			frames,
		})
	}
}

struct WsSender {
	sink: futures::stream::SplitSink<WsStream, Message>,
}

impl TransportSender for WsSender {
	fn send(&mut self, frame: Value) -> BoxFuture<'_, Result<()>> {
		Box::pin(async move {
			self.sink
				.send(Message::Text(frame.to_string().into()))
				.await
				.map_err(|e| Error::Transport(format!("websocket send: {e}")))
		})
	}
}

struct WsReceiver {
	stream: futures::stream::SplitStream<WsStream>,
	frames: mpsc::UnboundedSender<Value>,
}

impl TransportReceiver for WsReceiver {
	fn run(mut self: Box<Self>) -> BoxFuture<'static, Result<()>> {
		Box::pin(async move {
			while let Some(message) = self.stream.next().await {
				let message = message.map_err(|e| Error::Transport(format!("websocket recv: {e}")))?;
				let text = match message {
					Message::Text(text) => text,
					Message::Close(_) => return Ok(()),
					// Pings are answered by tungstenite itself.
					_ => continue,
				};
				let frame: Value = serde_json::from_str(text.as_str())
					.map_err(|e| Error::Transport(format!("malformed frame: {e}")))?;
				if self.frames.send(frame).is_err() {
					return Ok(());
				}
			}
			Ok(())
		})
	}
}

// --------------------------------------------------------------------- pipe

/// Transport over an inherited pipe pair, NUL-delimited in both directions.
pub struct PipeTransport;

impl PipeTransport {
	/// Wraps an already-connected byte channel. Production code passes the
	/// pipe ends returned by [`Browser::start_piped`](crate::Browser::start_piped);
	/// tests pass [`tokio::io::duplex`] halves.
	pub fn new<W, R>(writer: W, reader: R) -> TransportParts
	where
		W: AsyncWrite + Send + Unpin + 'static,
		R: AsyncRead + Send + Unpin + 'static,
	{
		let (frames_tx, frames) = mpsc::unbounded_channel();
		TransportParts {
			sender: Box::new(PipeSender { writer }),
			receiver: Box::new(PipeReceiver {
				reader: BufReader::new(reader),
				frames: frames_tx,
			}),
			frames,
		}
	}
}

struct PipeSender<W> {
	writer: W,
}

impl<W: AsyncWrite + Send + Unpin> TransportSender for PipeSender<W> {
	fn send(&mut self, frame: Value) -> BoxFuture<'_, Result<()>> {
		Box::pin(async move {
			let bytes = serde_json::to_vec(&frame)?;
			self.writer.write_all(&bytes).await?;
			self.writer.write_all(&[0]).await?;
			self.writer.flush().await?;
			Ok(())
		})
	}
}

struct PipeReceiver<R> {
	reader: BufReader<R>,
	frames: mpsc::UnboundedSender<Value>,
}

impl<R: AsyncRead + Send + Unpin + 'static> TransportReceiver for PipeReceiver<R> {
	fn run(mut self: Box<Self>) -> BoxFuture<'static, Result<()>> {
		Box::pin(async move {
			let mut buf = Vec::with_capacity(4096);
			loop {
				buf.clear();
				let n = read_until_nul(&mut self.reader, &mut buf).await?;
				if n == 0 {
					return Ok(());
				}
				if buf.last() == Some(&0) {
					buf.pop();
				} else {
					// EOF inside a frame: the child died mid-write.
					return Err(Error::Transport("unterminated pipe frame".into()));
				}
				if buf.is_empty() {
					continue;
				}
				let frame: Value = serde_json::from_slice(&buf)
					.map_err(|e| Error::Transport(format!("malformed frame: {e}")))?;
				if self.frames.send(frame).is_err() {
					return Ok(());
				}
			}
		})
	}
}

async fn read_until_nul<R: AsyncRead + Unpin>(reader: &mut BufReader<R>, buf: &mut Vec<u8>) -> Result<usize> {
	let mut byte = [0u8; 1];
	let mut read = 0;
	loop {
		let n = reader.read(&mut byte).await?;
		if n == 0 {
			return Ok(read);
		}
		read += n;
		buf.push(byte[0]);
		if byte[0] == 0 {
			return Ok(read);
		}
	}
}
