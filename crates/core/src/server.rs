//! The script-run server and orchestrator.
//!
//! One HTTP server carries the whole run surface:
//!
//! - `GET /_main` — the fixed control page,
//! - `GET /_run_<id>` — the HTML registered for a run,
//! - `GET /_headless/*` — embedded page assets,
//! - `POST <path>` — JSON directory listing (localhost origins only), with
//!   injectable per-path routes consulted first,
//! - `GET *` — files from the working directory, caching disabled,
//! - websocket upgrades on any path — the control channel on `/_main`, a run
//!   channel on `/_run_<id>`.
//!
//! The control page, once connected, dials the browser's own debugger
//! websocket and opens a target per run on request; each run page reports
//! back over its websocket, which the [`Runner`] surfaces as a channel of
//! [`Message`]s.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};

use axum::Router;
use axum::body::Body;
use axum::extract::ws::{Message as WsMessage, WebSocket};
use axum::extract::{FromRequestParts, State, WebSocketUpgrade};
use axum::http::{HeaderMap, HeaderValue, Method, Request, StatusCode, header};
use axum::response::{Html, IntoResponse, Response};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use headless_runtime::{Error, Result};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use tower_http::services::ServeDir;
use tracing::{debug, info, warn};

use crate::headless::{Headless, Options};
use crate::run::{Message, Run};
use crate::session::Session;

pub(crate) const PAGE_HTML: &str = include_str!("assets/run.html");
const PAGE_MJS: &str = include_str!("assets/headless.mjs");

/// Injectable POST route: `(raw query, body)` → response.
pub type PostRoute = Arc<dyn Fn(Option<&str>, &[u8]) -> Response + Send + Sync>;

struct RunSlot {
	html: String,
	url: String,
	messages: mpsc::UnboundedSender<Message>,
	socket: Mutex<Option<mpsc::UnboundedSender<WsMessage>>>,
}

pub(crate) struct RunnerInner {
	headless: Headless,
	port: AtomicU16,
	next_run_id: AtomicU64,
	/// Live runs. Removal is the exactly-once gate for closing a run's
	/// messages channel: whoever removes the slot drops the only sender.
	runs: DashMap<u64, RunSlot>,
	control: Mutex<Option<mpsc::UnboundedSender<WsMessage>>>,
	connected: watch::Sender<bool>,
	browser_ws_url: Mutex<Option<String>>,
	post_routes: Mutex<HashMap<String, PostRoute>>,
	server: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

/// Drives script runs in a supervised browser.
#[derive(Clone)]
pub struct Runner {
	inner: Arc<RunnerInner>,
}

impl Default for Runner {
	fn default() -> Self {
		Self::new()
	}
}

impl Runner {
	pub fn new() -> Runner {
		Self::with_options(Options::default())
	}

	/// Builds a runner over a supervisor configured with `options`. The
	/// runner drives the control page over the browser's websocket endpoint,
	/// so pipe mode is not supported here.
	pub fn with_options(options: Options) -> Runner {
		Runner {
			inner: Arc::new(RunnerInner {
				headless: Headless::with_options(options),
				port: AtomicU16::new(0),
				next_run_id: AtomicU64::new(0),
				runs: DashMap::new(),
				control: Mutex::new(None),
				connected: watch::channel(false).0,
				browser_ws_url: Mutex::new(None),
				post_routes: Mutex::new(HashMap::new()),
				server: Mutex::new(None),
			}),
		}
	}

	/// The underlying supervisor, for session/binding access beyond the run
	/// channel.
	pub fn headless(&self) -> &Headless {
		&self.inner.headless
	}

	/// Registers a POST route consulted before the directory-listing
	/// default.
	pub fn route_post(&self, path: &str, route: PostRoute) {
		self.inner.post_routes.lock().insert(path.to_string(), route);
	}

	/// Binds the HTTP listener and starts serving, without launching a
	/// browser. Returns the bound port. [`start`](Runner::start) builds on
	/// this; it is public so embedders (and tests) can drive the HTTP
	/// surface directly.
	pub async fn serve(&self) -> Result<u16> {
		{
			let server = self.inner.server.lock();
			if server.is_some() {
				return Ok(self.inner.port.load(Ordering::SeqCst));
			}
		}
		let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await?;
		let port = listener.local_addr()?.port();
		self.inner.port.store(port, Ordering::SeqCst);
		let app = router(self.inner.clone());
		let task = tokio::spawn(async move {
			if let Err(e) = axum::serve(listener, app).await {
				warn!(target: "server", "run server exited: {e}");
			}
		});
		*self.inner.server.lock() = Some(task);
		Ok(port)
	}

	/// Starts the server, launches the browser at the control page, and
	/// waits until the control page has connected back.
	pub async fn start(&self) -> Result<()> {
		let port = self.serve().await?;
		let main_url = format!("http://localhost:{port}/_main");
		if let Err(e) = self.inner.headless.start_at(&main_url).await {
			self.shutdown_server();
			return Err(e);
		}
		*self.inner.browser_ws_url.lock() = self.inner.headless.websocket_url().await;

		let mut connected = self.inner.connected.subscribe();
		while !*connected.borrow_and_update() {
			connected.changed().await.map_err(|_| Error::Stopped)?;
		}
		info!(target: "server", port, "run server ready");
		Ok(())
	}

	/// Ends every run, stops the browser, and closes the listener.
	/// Idempotent.
	pub async fn stop(&self) -> Result<()> {
		let ids: Vec<u64> = self.inner.runs.iter().map(|entry| *entry.key()).collect();
		for id in ids {
			self.inner.end_run(id);
		}
		*self.inner.control.lock() = None;
		let result = self.inner.headless.stop().await;
		self.shutdown_server();
		result
	}

	/// Starts a run of `html` and returns its handle synchronously. The
	/// control page opens the page; messages arrive on the handle's channel.
	pub fn run(&self, html: impl Into<String>) -> Run {
		let run = self.create_run(html.into());
		let control = self.inner.control.lock().clone();
		match control {
			Some(control) => {
				let frame = json!({"method": "open", "params": {"url": run.url()}});
				let _ = control.send(WsMessage::Text(frame.to_string().into()));
			}
			None => warn!(target: "server", id = run.id(), "no control page connected; run will not open"),
		}
		run
	}

	/// Starts a run whose page is created through the supervisor instead of
	/// the control page: `configure` runs against a fresh `about:blank`
	/// session — the place to install [bindings](Session::bind) — before the
	/// page navigates to the run URL, so nothing user-visible executes
	/// without them.
	pub async fn run_bound<F, Fut>(&self, html: impl Into<String>, configure: F) -> Result<Run>
	where
		F: FnOnce(Session) -> Fut,
		Fut: std::future::Future<Output = Result<()>>,
	{
		let run = self.create_run(html.into());
		let session = self.inner.headless.open("about:blank").await?;
		configure(session.clone()).await?;
		session.navigate(run.url()).await?;
		Ok(run)
	}

	pub fn port(&self) -> u16 {
		self.inner.port.load(Ordering::SeqCst)
	}

	fn create_run(&self, html: String) -> Run {
		let id = self.inner.next_run_id.fetch_add(1, Ordering::SeqCst) + 1;
		let port = self.inner.port.load(Ordering::SeqCst);
		let url = format!("http://localhost:{port}/_run_{id}");
		let (messages_tx, messages_rx) = mpsc::unbounded_channel();
		self.inner.runs.insert(
			id,
			RunSlot {
				html,
				url: url.clone(),
				messages: messages_tx,
				socket: Mutex::new(None),
			},
		);

		let token = CancellationToken::new();
		let watcher_token = token.clone();
		let weak = Arc::downgrade(&self.inner);
		tokio::spawn(async move {
			watcher_token.cancelled().await;
			if let Some(inner) = weak.upgrade() {
				inner.close_run(id);
			}
		});

		Run {
			id,
			url,
			messages: messages_rx,
			runner: Arc::downgrade(&self.inner),
			token,
		}
	}

	fn shutdown_server(&self) {
		if let Some(task) = self.inner.server.lock().take() {
			task.abort();
		}
	}
}

impl RunnerInner {
	/// Cancellation path: tell the page to wind down; if it never connected,
	/// end the run directly.
	fn close_run(&self, id: u64) {
		let target = self.runs.get(&id).map(|slot| (slot.socket.lock().clone(), slot.url.clone()));
		match target {
			Some((Some(socket), url)) => {
				let frame = json!({"method": "close", "params": {"url": url}});
				let _ = socket.send(WsMessage::Text(frame.to_string().into()));
			}
			// The page never connected; nothing will echo the close back.
			Some((None, _)) => self.end_run(id),
			None => {}
		}
	}

	/// Removes the run; dropping the slot's sender closes the messages
	/// channel. Both termination paths (cancel, page disconnect) funnel
	/// through here, and the map removal makes the close exactly-once.
	fn end_run(&self, id: u64) {
		if let Some((_, slot)) = self.runs.remove(&id) {
			if let Some(socket) = slot.socket.lock().take() {
				let _ = socket.send(WsMessage::Close(None));
			}
		}
	}

	pub(crate) fn respond(&self, run_id: u64, message_id: u64, result: Value) -> Result<()> {
		let Some(slot) = self.runs.get(&run_id) else {
			return Err(Error::Stopped);
		};
		let Some(socket) = slot.socket.lock().clone() else {
			return Err(Error::Stopped);
		};
		let frame = json!({"data": {"id": message_id, "result": result}});
		socket
			.send(WsMessage::Text(frame.to_string().into()))
			.map_err(|_| Error::Stopped)
	}

	fn handle_page_frame(&self, run_id: Option<u64>, raw: &str) {
		let Ok(frame) = serde_json::from_str::<Value>(raw) else {
			warn!(target: "server", "malformed page frame: {raw}");
			return;
		};
		let method = frame.get("method").and_then(Value::as_str).unwrap_or_default();
		match (method, run_id) {
			("connect", None) => {
				self.connected.send_replace(true);
			}
			("connect", Some(_)) => {}
			("close", Some(id)) => self.end_run(id),
			("close", None) => {}
			(_, Some(id)) => {
				let message = Message {
					method: method.to_string(),
					args: frame
						.pointer("/params/args")
						.and_then(Value::as_array)
						.cloned()
						.unwrap_or_default(),
					id: frame.get("id").and_then(Value::as_u64),
				};
				// A run removed by close/cancel drops late sends silently.
				if let Some(slot) = self.runs.get(&id) {
					let _ = slot.messages.send(message);
				}
			}
			(_, None) => debug!(target: "server", method, "ignoring control-channel frame"),
		}
	}
}

fn router(state: Arc<RunnerInner>) -> Router {
	Router::new().fallback(handle).with_state(state)
}

async fn handle(State(state): State<Arc<RunnerInner>>, request: Request<Body>) -> Response {
	let path = request.uri().path().to_string();
	if is_websocket_upgrade(request.headers()) {
		if !is_local_origin(request.headers()) {
			return StatusCode::UNAUTHORIZED.into_response();
		}
		let (mut parts, _body) = request.into_parts();
		return match WebSocketUpgrade::from_request_parts(&mut parts, &()).await {
			Ok(upgrade) => upgrade
				.on_upgrade(move |socket| handle_socket(state, path, socket))
				.into_response(),
			Err(rejection) => rejection.into_response(),
		};
	}
	if request.method() == Method::POST {
		return handle_post(state, request).await;
	}
	handle_get(state, path, request).await
}

async fn handle_get(state: Arc<RunnerInner>, path: String, request: Request<Body>) -> Response {
	if path == "/_main" {
		return Html(PAGE_HTML).into_response();
	}
	if let Some(id) = run_id_from_path(&path) {
		return match state.runs.get(&id) {
			Some(slot) => Html(slot.html.clone()).into_response(),
			None => StatusCode::NOT_FOUND.into_response(),
		};
	}
	if let Some(asset) = path.strip_prefix("/_headless/") {
		return match asset {
			"headless.mjs" => (
				[(header::CONTENT_TYPE, "application/javascript; charset=utf-8")],
				PAGE_MJS,
			)
				.into_response(),
			_ => StatusCode::NOT_FOUND.into_response(),
		};
	}
	// Working-directory file server. Caching is disabled so edited scripts
	// take effect on the next run.
	match ServeDir::new(".").oneshot(request).await {
		Ok(mut response) => {
			let headers = response.headers_mut();
			headers.insert(
				header::CACHE_CONTROL,
				HeaderValue::from_static("no-cache, no-store, must-revalidate"),
			);
			headers.insert(header::EXPIRES, HeaderValue::from_static("0"));
			response.map(Body::new).into_response()
		}
		Err(infallible) => match infallible {},
	}
}

async fn handle_post(state: Arc<RunnerInner>, request: Request<Body>) -> Response {
	if !is_local_origin(request.headers()) {
		return StatusCode::UNAUTHORIZED.into_response();
	}
	let path = request.uri().path().to_string();
	let query = request.uri().query().map(str::to_owned);
	let route = state.post_routes.lock().get(&path).cloned();
	if let Some(route) = route {
		let body = match axum::body::to_bytes(request.into_body(), 1 << 24).await {
			Ok(body) => body,
			Err(_) => return StatusCode::PAYLOAD_TOO_LARGE.into_response(),
		};
		return route(query.as_deref(), &body);
	}

	// Default: list the local directory behind the posted path, so page
	// scripts can discover their inputs.
	let dir = std::path::Path::new(".").join(path.trim_start_matches('/'));
	let mut names = Vec::new();
	if let Ok(mut entries) = tokio::fs::read_dir(&dir).await {
		while let Ok(Some(entry)) = entries.next_entry().await {
			names.push(entry.file_name().to_string_lossy().into_owned());
		}
	}
	names.sort();
	axum::Json(names).into_response()
}

async fn handle_socket(state: Arc<RunnerInner>, path: String, socket: WebSocket) {
	let run_id = run_id_from_path(&path);
	let (tx, rx) = mpsc::unbounded_channel::<WsMessage>();

	// First frame is always the connect directive with the debugger URL.
	let connect = json!({
		"method": "connect",
		"params": {"browserWebsocketUrl": state.browser_ws_url.lock().clone()}
	});
	let _ = tx.send(WsMessage::Text(connect.to_string().into()));

	match run_id {
		Some(id) => match state.runs.get(&id) {
			Some(slot) => *slot.socket.lock() = Some(tx.clone()),
			None => return,
		},
		None if path == "/_main" => {
			*state.control.lock() = Some(tx.clone());
			info!(target: "server", "control page connected");
		}
		None => {
			debug!(target: "server", %path, "websocket on unexpected path");
			return;
		}
	}

	let (mut ws_tx, mut ws_rx) = socket.split();
	let mut outbound = UnboundedReceiverStream::new(rx);
	let send_task = tokio::spawn(async move {
		while let Some(message) = outbound.next().await {
			if ws_tx.send(message).await.is_err() {
				break;
			}
		}
	});

	while let Some(message) = ws_rx.next().await {
		match message {
			Ok(WsMessage::Text(text)) => state.handle_page_frame(run_id, text.as_str()),
			Ok(WsMessage::Close(_)) => break,
			Ok(_) => {}
			Err(e) => {
				debug!(target: "server", %path, "websocket error: {e}");
				break;
			}
		}
	}

	match run_id {
		// Page disconnect ends the run even without an explicit close.
		Some(id) => state.end_run(id),
		None => {
			*state.control.lock() = None;
			state.connected.send_replace(false);
			info!(target: "server", "control page disconnected");
		}
	}
	send_task.abort();
}

/// Writes the request body to the path named in the query string, creating
/// parent directories. Register under `/create` to give page scripts write
/// access to the working directory.
pub fn create_route() -> PostRoute {
	Arc::new(|query, body| {
		let Some(path) = query.and_then(|q| q.split('&').find_map(|kv| kv.strip_prefix("path="))) else {
			return (StatusCode::BAD_REQUEST, "missing path").into_response();
		};
		let relative = std::path::Path::new(path);
		let escapes = relative.is_absolute()
			|| relative
				.components()
				.any(|c| matches!(c, std::path::Component::ParentDir));
		if escapes {
			return (StatusCode::BAD_REQUEST, "path escapes working directory").into_response();
		}
		let target = std::path::Path::new(".").join(relative);
		if let Some(parent) = target.parent() {
			if let Err(e) = std::fs::create_dir_all(parent) {
				return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
			}
		}
		match std::fs::write(&target, body) {
			Ok(()) => StatusCode::OK.into_response(),
			Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
		}
	})
}

fn run_id_from_path(path: &str) -> Option<u64> {
	path.strip_prefix("/_run_")?.parse().ok()
}

fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
	headers
		.get(header::UPGRADE)
		.and_then(|v| v.to_str().ok())
		.map(|v| v.eq_ignore_ascii_case("websocket"))
		.unwrap_or(false)
}

fn is_local_origin(headers: &HeaderMap) -> bool {
	headers
		.get(header::ORIGIN)
		.and_then(|v| v.to_str().ok())
		.map(|origin| origin.starts_with("http://localhost:"))
		.unwrap_or(false)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn run_ids_parse_from_paths() {
		assert_eq!(run_id_from_path("/_run_1"), Some(1));
		assert_eq!(run_id_from_path("/_run_42"), Some(42));
		assert_eq!(run_id_from_path("/_run_"), None);
		assert_eq!(run_id_from_path("/_run_x"), None);
		assert_eq!(run_id_from_path("/_main"), None);
		assert_eq!(run_id_from_path("/index.html"), None);
	}

	#[test]
	fn origin_check_requires_local_http() {
		let mut headers = HeaderMap::new();
		assert!(!is_local_origin(&headers));
		headers.insert(header::ORIGIN, HeaderValue::from_static("http://localhost:9001"));
		assert!(is_local_origin(&headers));
		headers.insert(header::ORIGIN, HeaderValue::from_static("https://localhost:9001"));
		assert!(!is_local_origin(&headers));
		headers.insert(header::ORIGIN, HeaderValue::from_static("http://evil.example"));
		assert!(!is_local_origin(&headers));
	}

	#[test]
	fn page_html_has_the_template_contract() {
		assert!(PAGE_HTML.contains("<template>"));
		assert!(PAGE_HTML.contains("/_headless/headless.mjs"));
	}

	#[test]
	fn page_script_speaks_the_frame_protocol() {
		for needle in ["onconnect", "onopen", "onclose", "browserWebsocketUrl", "console.clear(code)"] {
			assert!(PAGE_MJS.contains(needle), "missing {needle}");
		}
	}
}
