//! Protocol client: request/response correlation and event dispatch.
//!
//! One [`Connection`] multiplexes every session over a single transport
//! (flat-session mode): outbound frames are `{id, method, params, sessionId?}`,
//! inbound frames are either responses (`{id, result?, error?}`) or events
//! (`{method, params, sessionId?}`).
//!
//! # Message flow
//!
//! 1. `execute` assigns a monotonic id, parks a capacity-1 channel in the
//!    pending map, and enqueues the frame — all inside one critical section,
//!    so commands issued from one task keep FIFO order on the wire.
//! 2. A single writer task drains the queue into the transport.
//! 3. The router consumes inbound frames: responses complete their pending
//!    slot directly; events are enqueued onto a bounded serial dispatch
//!    queue so handler order matches wire arrival order per method.
//! 4. Transport EOF or any fatal protocol error closes the connection and
//!    fails every pending slot.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde_json::{Value, json};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

use crate::error::{Error, Result};
use crate::transport::TransportParts;

/// Event callback. Runs on the serial dispatcher; must not block.
pub type EventHandler = Arc<dyn Fn(Value) + Send + Sync>;

/// Bound on the event dispatch queue. Overflow is fatal rather than lossy:
/// a consumer that cannot keep up must not silently miss events.
const DISPATCH_QUEUE: usize = 1024;

#[derive(Debug, Clone)]
enum CloseReason {
	Stopped,
	Transport(String),
}

impl CloseReason {
	fn to_error(&self) -> Error {
		match self {
			CloseReason::Stopped => Error::Stopped,
			CloseReason::Transport(message) => Error::Transport(message.clone()),
		}
	}
}

/// Pending request slot bookkeeping plus the outbound queue. Guarded by one
/// mutex so id assignment and enqueue are atomic.
struct SendState {
	next_id: u32,
	pending: HashMap<u32, oneshot::Sender<Result<Value>>>,
	outbound: mpsc::UnboundedSender<Value>,
	closed: Option<CloseReason>,
}

struct DispatchJob {
	handlers: Vec<EventHandler>,
	params: Value,
}

/// Duplex protocol client over a [`TransportParts`].
pub struct Connection {
	state: Mutex<SendState>,
	/// `(session id, "Domain.event")` → handlers, in registration order.
	subscriptions: RwLock<HashMap<(String, String), Vec<EventHandler>>>,
	/// `(session id, domain)` → live subscription count, for enable/disable
	/// bookkeeping.
	enabled: Mutex<HashMap<(String, String), usize>>,
	dispatch_tx: mpsc::Sender<DispatchJob>,
}

impl Connection {
	/// Takes ownership of a connected transport and spawns the writer,
	/// reader, router, and dispatcher tasks.
	pub fn start(parts: TransportParts) -> Arc<Connection> {
		let TransportParts { mut sender, receiver, mut frames } = parts;
		let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Value>();
		let (dispatch_tx, mut dispatch_rx) = mpsc::channel::<DispatchJob>(DISPATCH_QUEUE);

		let connection = Arc::new(Connection {
			state: Mutex::new(SendState {
				next_id: 0,
				pending: HashMap::new(),
				outbound: outbound_tx,
				closed: None,
			}),
			subscriptions: RwLock::new(HashMap::new()),
			enabled: Mutex::new(HashMap::new()),
			dispatch_tx,
		});

		let writer_conn = Arc::downgrade(&connection);
		tokio::spawn(async move {
			while let Some(frame) = outbound_rx.recv().await {
				debug!(target: "cdp", %frame, "send");
				if let Err(e) = sender.send(frame).await {
					if let Some(conn) = writer_conn.upgrade() {
						conn.close(CloseReason::Transport(e.to_string()));
					}
					break;
				}
			}
		});

		let reader_conn = Arc::downgrade(&connection);
		tokio::spawn(async move {
			let reason = match receiver.run().await {
				Ok(()) => CloseReason::Transport("transport closed".into()),
				Err(e) => CloseReason::Transport(e.to_string()),
			};
			if let Some(conn) = reader_conn.upgrade() {
				conn.close(reason);
			}
		});

		let router_conn = Arc::downgrade(&connection);
		tokio::spawn(async move {
			while let Some(frame) = frames.recv().await {
				let Some(conn) = router_conn.upgrade() else { break };
				if let Err(e) = conn.route(frame) {
					error!(target: "cdp", "fatal protocol error: {e}");
					conn.close(CloseReason::Transport(e.to_string()));
					break;
				}
			}
		});

		// Serial worker: per-method handler order matches frame arrival
		// order, and a blocking handler cannot stall the reader.
		tokio::spawn(async move {
			while let Some(job) = dispatch_rx.recv().await {
				for handler in &job.handlers {
					handler(job.params.clone());
				}
			}
		});

		connection
	}

	/// Sends `method` with `params`, scoped to `session_id` unless empty,
	/// and waits for the matching response.
	pub async fn execute(&self, session_id: &str, method: &str, params: Value) -> Result<Value> {
		let rx = {
			let mut state = self.state.lock();
			if let Some(reason) = &state.closed {
				return Err(reason.to_error());
			}
			state.next_id += 1;
			let id = state.next_id;
			let (tx, rx) = oneshot::channel();
			state.pending.insert(id, tx);
			let mut frame = json!({"id": id, "method": method, "params": params});
			if !session_id.is_empty() {
				frame["sessionId"] = json!(session_id);
			}
			if state.outbound.send(frame).is_err() {
				state.pending.remove(&id);
				return Err(Error::Stopped);
			}
			rx
		};
		match rx.await {
			Ok(result) => result,
			Err(_) => Err(Error::Stopped),
		}
	}

	/// Registers `handler` for `"<Domain>.<event>"` frames scoped to
	/// `session_id` (empty = browser scope) and enables the domain on first
	/// subscription.
	pub async fn subscribe(&self, session_id: &str, method: &str, handler: EventHandler) -> Result<()> {
		self.subscriptions
			.write()
			.entry((session_id.to_string(), method.to_string()))
			.or_default()
			.push(handler);

		let domain = domain_of(method).to_string();
		let first = {
			let mut enabled = self.enabled.lock();
			let count = enabled.entry((session_id.to_string(), domain.clone())).or_insert(0);
			*count += 1;
			*count == 1
		};
		if first {
			if let Err(e) = self.execute(session_id, &format!("{domain}.enable"), json!({})).await {
				let mut enabled = self.enabled.lock();
				if let Some(count) = enabled.get_mut(&(session_id.to_string(), domain.clone())) {
					*count -= 1;
					if *count == 0 {
						enabled.remove(&(session_id.to_string(), domain));
					}
				}
				return Err(e);
			}
		}
		Ok(())
	}

	/// Drops every handler for `method` and disables the domain once the
	/// last subscription in it is gone.
	pub async fn unsubscribe(&self, session_id: &str, method: &str) -> Result<()> {
		let removed = self
			.subscriptions
			.write()
			.remove(&(session_id.to_string(), method.to_string()))
			.map(|handlers| handlers.len())
			.unwrap_or(0);
		if removed == 0 {
			return Ok(());
		}

		let domain = domain_of(method).to_string();
		let last = {
			let mut enabled = self.enabled.lock();
			match enabled.get_mut(&(session_id.to_string(), domain.clone())) {
				Some(count) => {
					*count = count.saturating_sub(removed);
					if *count == 0 {
						enabled.remove(&(session_id.to_string(), domain.clone()));
						true
					} else {
						false
					}
				}
				None => false,
			}
		};
		if last {
			self.execute(session_id, &format!("{domain}.disable"), json!({})).await?;
		}
		Ok(())
	}

	/// Tears the connection down on behalf of the supervisor: every pending
	/// and future operation fails with [`Error::Stopped`]. Idempotent.
	pub fn shutdown(&self) {
		self.close(CloseReason::Stopped);
	}

	pub fn is_closed(&self) -> bool {
		self.state.lock().closed.is_some()
	}

	fn close(&self, reason: CloseReason) {
		let drained: Vec<oneshot::Sender<Result<Value>>> = {
			let mut state = self.state.lock();
			if state.closed.is_some() {
				return;
			}
			state.closed = Some(reason.clone());
			state.pending.drain().map(|(_, tx)| tx).collect()
		};
		for tx in drained {
			let _ = tx.send(Err(reason.to_error()));
		}
		// Dropping the handlers releases anything parked behind them
		// (one-shot event waiters in particular).
		self.subscriptions.write().clear();
		self.enabled.lock().clear();
	}

	/// Routes one inbound frame. A returned error is fatal for the whole
	/// connection.
	fn route(&self, frame: Value) -> Result<()> {
		debug!(target: "cdp", %frame, "recv");
		if let Some(id) = frame.get("id").and_then(Value::as_u64) {
			let slot = {
				let mut state = self.state.lock();
				if state.closed.is_some() {
					return Ok(());
				}
				state.pending.remove(&(id as u32))
			};
			// A response nothing is waiting for means the id state machine
			// has diverged from the browser's; continuing would misdeliver.
			let Some(slot) = slot else {
				return Err(Error::Transport(format!("response for unknown id {id}")));
			};
			let result = match frame.get("error") {
				Some(err) if !err.is_null() => Err(Error::Protocol {
					code: err.get("code").and_then(Value::as_i64).unwrap_or(0),
					message: err
						.get("message")
						.and_then(Value::as_str)
						.unwrap_or_default()
						.to_string(),
					data: err.get("data").and_then(Value::as_str).map(str::to_owned),
				}),
				_ => Ok(frame.get("result").cloned().unwrap_or(Value::Null)),
			};
			let _ = slot.send(result);
			return Ok(());
		}

		let Some(method) = frame.get("method").and_then(Value::as_str) else {
			return Err(Error::Transport(format!("frame is neither response nor event: {frame}")));
		};
		let session = frame.get("sessionId").and_then(Value::as_str).unwrap_or("");
		let handlers = self
			.subscriptions
			.read()
			.get(&(session.to_string(), method.to_string()))
			.cloned()
			.unwrap_or_default();
		if handlers.is_empty() {
			// Unsubscribed events are expected noise.
			return Ok(());
		}
		let params = frame.get("params").cloned().unwrap_or(Value::Null);
		match self.dispatch_tx.try_send(DispatchJob { handlers, params }) {
			Ok(()) => Ok(()),
			Err(mpsc::error::TrySendError::Full(_)) => {
				Err(Error::Transport("event dispatch queue overflow".into()))
			}
			Err(mpsc::error::TrySendError::Closed(_)) => Ok(()),
		}
	}
}

fn domain_of(method: &str) -> &str {
	method.split('.').next().unwrap_or(method)
}
