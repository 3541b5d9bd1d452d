//! The protocol supervisor: browser process + multiplexed connection +
//! attached sessions.

use std::collections::HashMap;
use std::sync::Arc;

use headless_runtime::{Browser, Connection, Error, Result, WebSocketTransport};
use serde_json::{Value, json};

use crate::session::Session;

/// Supervisor construction options.
#[derive(Debug, Default)]
pub struct Options {
	/// Browser configuration (executable, port, flags).
	pub browser: Browser,
	/// Use `--remote-debugging-pipe` with inherited fds instead of dialing
	/// the websocket endpoint.
	pub pipe: bool,
}

pub(crate) struct HeadlessInner {
	pub(crate) browser: tokio::sync::Mutex<Browser>,
	pub(crate) connection: parking_lot::Mutex<Option<Arc<Connection>>>,
	pub(crate) sessions: parking_lot::Mutex<HashMap<String, Session>>,
	pipe: bool,
}

impl HeadlessInner {
	/// The live connection, or [`Error::Stopped`] once the supervisor is
	/// torn down. Sessions go through this so a stopped supervisor fails
	/// every dangling session operation the same way.
	pub(crate) fn connection(&self) -> Result<Arc<Connection>> {
		self.connection.lock().clone().ok_or(Error::Stopped)
	}
}

/// Supervisor over one browser child and its debugging connection.
///
/// Lifecycle: created idle, [`start`](Headless::start)ed (child running,
/// transport open), [`stop`](Headless::stop)ped (child killed, every pending
/// operation failed with [`Error::Stopped`]; idempotent).
#[derive(Clone)]
pub struct Headless {
	inner: Arc<HeadlessInner>,
}

impl Default for Headless {
	fn default() -> Self {
		Self::new()
	}
}

impl Headless {
	pub fn new() -> Self {
		Self::with_options(Options::default())
	}

	pub fn with_options(options: Options) -> Self {
		Headless {
			inner: Arc::new(HeadlessInner {
				browser: tokio::sync::Mutex::new(options.browser),
				connection: parking_lot::Mutex::new(None),
				sessions: parking_lot::Mutex::new(HashMap::new()),
				pipe: options.pipe,
			}),
		}
	}

	/// Launches the browser at `about:blank` and opens the transport.
	pub async fn start(&self) -> Result<()> {
		self.start_at("about:blank").await
	}

	/// Launches the browser at `url` and opens the transport. No-op when
	/// already started.
	pub async fn start_at(&self, url: &str) -> Result<()> {
		let mut browser = self.inner.browser.lock().await;
		if self.inner.connection.lock().is_some() {
			return Ok(());
		}
		let parts = if self.inner.pipe {
			pipe_parts(&mut browser, url).await?
		} else {
			browser.start(url).await?;
			let ws_url = browser
				.websocket_url()
				.ok_or_else(|| Error::Transport("browser reported no debugger URL".into()))?
				.to_string();
			WebSocketTransport::connect(&ws_url).await?
		};
		*self.inner.connection.lock() = Some(Connection::start(parts));
		Ok(())
	}

	/// Kills the browser process group and fails every pending operation.
	/// Safe to call twice and before `start`.
	pub async fn stop(&self) -> Result<()> {
		// Pending slots drain with Stopped before the child dies, so the
		// transport EOF that follows is a no-op.
		if let Some(connection) = self.inner.connection.lock().take() {
			connection.shutdown();
		}
		self.inner.sessions.lock().clear();
		self.inner.browser.lock().await.stop().await
	}

	/// Executes a browser-scoped command.
	pub async fn execute(&self, method: &str, params: Value) -> Result<Value> {
		self.inner.connection()?.execute("", method, params).await
	}

	/// Creates a new target at `url` and attaches a flat session to it.
	pub async fn open(&self, url: &str) -> Result<Session> {
		let connection = self.inner.connection()?;
		let created = connection.execute("", "Target.createTarget", json!({"url": url})).await?;
		let target_id = created
			.get("targetId")
			.and_then(Value::as_str)
			.ok_or_else(|| Error::Transport(format!("Target.createTarget returned no targetId: {created}")))?
			.to_string();
		self.attach(&target_id).await
	}

	/// Attaches a flat session to an existing target.
	pub async fn attach(&self, target_id: &str) -> Result<Session> {
		let connection = self.inner.connection()?;
		let attached = connection
			.execute("", "Target.attachToTarget", json!({"targetId": target_id, "flatten": true}))
			.await?;
		let session_id = attached
			.get("sessionId")
			.and_then(Value::as_str)
			.ok_or_else(|| Error::Transport(format!("Target.attachToTarget returned no sessionId: {attached}")))?
			.to_string();

		let session = Session::new(&session_id, target_id, Arc::downgrade(&self.inner));
		session.init(&connection).await?;
		self.inner.sessions.lock().insert(session_id, session.clone());
		Ok(session)
	}

	/// The browser-wide debugger URL, once started in websocket mode.
	pub async fn websocket_url(&self) -> Option<String> {
		self.inner.browser.lock().await.websocket_url().map(str::to_owned)
	}
}

#[cfg(unix)]
async fn pipe_parts(browser: &mut Browser, url: &str) -> Result<headless_runtime::TransportParts> {
	let (writer, reader) = browser.start_piped(url).await?;
	Ok(headless_runtime::PipeTransport::new(writer, reader))
}

#[cfg(not(unix))]
async fn pipe_parts(_browser: &mut Browser, _url: &str) -> Result<headless_runtime::TransportParts> {
	Err(Error::Spawn("pipe mode is only supported on unix".into()))
}
