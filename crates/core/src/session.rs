//! Attached-target sessions.
//!
//! A [`Session`] scopes commands to one target over the supervisor's shared
//! connection (flat sessions). It holds a weak back-link: the session is only
//! usable while its supervisor lives, and every operation on a stopped
//! supervisor fails with [`Error::Stopped`].

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use headless_runtime::{Connection, Error, Result};
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::sync::oneshot;
use tracing::{error, warn};

use crate::bindings::{self, BindingEntry, BindingKind, BindingPayload};
use crate::console::{self, ConsoleEvent};
use crate::headless::HeadlessInner;

type ExceptionHandler = Box<dyn Fn(Error) + Send + Sync>;

pub(crate) struct SessionInner {
	id: String,
	target_id: String,
	headless: Weak<HeadlessInner>,
	bindings: Mutex<HashMap<String, BindingEntry>>,
	exception_handlers: Mutex<Vec<ExceptionHandler>>,
}

/// One attached target on the supervisor's connection.
#[derive(Clone)]
pub struct Session {
	inner: Arc<SessionInner>,
}

impl std::fmt::Debug for Session {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Session")
			.field("id", &self.inner.id)
			.field("target_id", &self.inner.target_id)
			.finish()
	}
}

impl Session {
	pub(crate) fn new(id: &str, target_id: &str, headless: Weak<HeadlessInner>) -> Session {
		Session {
			inner: Arc::new(SessionInner {
				id: id.to_string(),
				target_id: target_id.to_string(),
				headless,
				bindings: Mutex::new(HashMap::new()),
				exception_handlers: Mutex::new(Vec::new()),
			}),
		}
	}

	/// Enables the implicit domains and wires up the exception and binding
	/// event handlers.
	pub(crate) async fn init(&self, connection: &Arc<Connection>) -> Result<()> {
		connection.execute(&self.inner.id, "Page.enable", json!({})).await?;

		let weak = Arc::downgrade(&self.inner);
		connection
			.subscribe(
				&self.inner.id,
				"Runtime.exceptionThrown",
				Arc::new(move |params| {
					let Some(inner) = weak.upgrade() else { return };
					let details = params.get("exceptionDetails").cloned().unwrap_or(Value::Null);
					let text = console::format_exception(&details);
					let handlers = inner.exception_handlers.lock();
					if handlers.is_empty() {
						error!(target: "page", "uncaught exception: {text}");
					}
					for handler in handlers.iter() {
						handler(Error::ScriptException(text.clone()));
					}
				}),
			)
			.await?;

		let weak = Arc::downgrade(&self.inner);
		connection
			.subscribe(
				&self.inner.id,
				"Runtime.bindingCalled",
				Arc::new(move |params| {
					if let Some(inner) = weak.upgrade() {
						Session { inner }.on_binding_called(params);
					}
				}),
			)
			.await
	}

	pub fn id(&self) -> &str {
		&self.inner.id
	}

	pub fn target_id(&self) -> &str {
		&self.inner.target_id
	}

	/// Executes `method` scoped to this session.
	pub async fn execute(&self, method: &str, params: Value) -> Result<Value> {
		self.connection()?.execute(&self.inner.id, method, params).await
	}

	/// Starts a navigation. Does not wait for the load; combine with
	/// [`await_event`](Session::await_event) on `Page.frameStoppedLoading`
	/// when that matters.
	pub async fn navigate(&self, url: &str) -> Result<()> {
		self.execute("Page.navigate", json!({"url": url})).await.map(|_| ())
	}

	/// Evaluates an expression in the page, awaiting promises, and decodes
	/// `result.value`. A thrown exception surfaces as
	/// [`Error::ScriptException`].
	pub async fn eval<T: DeserializeOwned>(&self, expression: &str) -> Result<T> {
		let result = self
			.execute(
				"Runtime.evaluate",
				json!({
					"expression": expression,
					"returnByValue": true,
					"replMode": true,
					"awaitPromise": true,
				}),
			)
			.await?;
		if let Some(details) = result.get("exceptionDetails") {
			if !details.is_null() {
				return Err(Error::ScriptException(console::format_exception(details)));
			}
		}
		let value = result.pointer("/result/value").cloned().unwrap_or(Value::Null);
		Ok(serde_json::from_value(value)?)
	}

	/// Registers a typed handler for `"<Domain>.<event>"` on this session.
	/// `params` failing to decode as `T` is logged and skipped.
	pub async fn handle<T, F>(&self, method: &str, f: F) -> Result<()>
	where
		T: DeserializeOwned,
		F: Fn(T) + Send + Sync + 'static,
	{
		let connection = self.connection()?;
		let method_name = method.to_string();
		connection
			.subscribe(
				&self.inner.id,
				method,
				Arc::new(move |params| match serde_json::from_value::<T>(params) {
					Ok(event) => f(event),
					Err(e) => warn!(target: "page", method = %method_name, "event decode failed: {e}"),
				}),
			)
			.await
	}

	/// Registers a callback for uncaught page exceptions. Without one,
	/// exceptions are logged.
	pub fn on_exception<F>(&self, f: F)
	where
		F: Fn(Error) + Send + Sync + 'static,
	{
		self.inner.exception_handlers.lock().push(Box::new(f));
	}

	/// Registers a console callback. Arguments arrive decoded from their
	/// protocol previews, with `console.clear(n)` classified as an exit code
	/// (or the started sentinel).
	pub async fn on_console<F>(&self, f: F) -> Result<()>
	where
		F: Fn(ConsoleEvent) + Send + Sync + 'static,
	{
		let connection = self.connection()?;
		connection
			.subscribe(
				&self.inner.id,
				"Runtime.consoleAPICalled",
				Arc::new(move |params| {
					let kind = params.get("type").and_then(Value::as_str).unwrap_or_default();
					let args = params
						.get("args")
						.and_then(Value::as_array)
						.map(|args| args.iter().map(console::decode_remote_object).collect())
						.unwrap_or_default();
					f(console::classify(kind, args));
				}),
			)
			.await
	}

	/// Subscribes to the next occurrence of an event. Subscribe first, then
	/// trigger, then [`EventWaiter::wait`]:
	///
	/// ```no_run
	/// # async fn demo(session: &headless_core::Session) -> headless_runtime::Result<()> {
	/// let loaded = session.await_event("Page.frameStoppedLoading").await?;
	/// session.navigate("http://localhost:8000/").await?;
	/// loaded.wait().await?;
	/// # Ok(())
	/// # }
	/// ```
	pub async fn await_event(&self, method: &str) -> Result<EventWaiter> {
		let connection = self.connection()?;
		let (tx, rx) = oneshot::channel();
		let slot = Mutex::new(Some(tx));
		connection
			.subscribe(
				&self.inner.id,
				method,
				Arc::new(move |params| {
					if let Some(tx) = slot.lock().take() {
						let _ = tx.send(params);
					}
				}),
			)
			.await?;
		Ok(EventWaiter {
			rx,
			connection,
			session_id: self.inner.id.clone(),
			method: method.to_string(),
		})
	}

	/// Closes the target. The session is unusable afterwards.
	pub async fn close(&self) -> Result<()> {
		let connection = self.connection()?;
		let result = connection
			.execute("", "Target.closeTarget", json!({"targetId": self.inner.target_id}))
			.await?;
		if let Some(headless) = self.inner.headless.upgrade() {
			headless.sessions.lock().remove(&self.inner.id);
		}
		if result.get("success").and_then(Value::as_bool) != Some(true) {
			return Err(Error::Protocol {
				code: 0,
				message: format!("Target.closeTarget failed for {}", self.inner.target_id),
				data: None,
			});
		}
		Ok(())
	}

	/// Exposes a host function as `window[name]` returning a promise.
	///
	/// `A` is the parameter tuple the page arguments decode against (use
	/// `(T,)` for one parameter, `Vec<T>` for variadics); `R` is the resolved
	/// value. A `String` error — including arity and decode failures — rejects
	/// the page promise.
	pub async fn bind<A, R, F>(&self, name: &str, f: F) -> Result<()>
	where
		A: DeserializeOwned,
		R: Serialize,
		F: Fn(A) -> std::result::Result<R, String> + Send + Sync + 'static,
	{
		let func = Arc::new(move |args: Vec<Value>| -> std::result::Result<Value, String> {
			let decoded: A = bindings::decode_args(args)?;
			let result = f(decoded)?;
			serde_json::to_value(result).map_err(|e| format!("cannot marshal result: {e}"))
		});
		self.install(name, BindingEntry { kind: BindingKind::Returning, func }).await
	}

	/// Exposes a host function as `window[name]` with no reply channel.
	pub async fn bind_void<A, F>(&self, name: &str, f: F) -> Result<()>
	where
		A: DeserializeOwned,
		F: Fn(A) + Send + Sync + 'static,
	{
		let func = Arc::new(move |args: Vec<Value>| -> std::result::Result<Value, String> {
			let decoded: A = bindings::decode_args(args)?;
			f(decoded);
			Ok(Value::Null)
		});
		self.install(name, BindingEntry { kind: BindingKind::Void, func }).await
	}

	async fn install(&self, name: &str, entry: BindingEntry) -> Result<()> {
		if !bindings::is_identifier(name) {
			return Err(Error::Binding(format!("invalid binding name: {name:?}")));
		}
		let kind = entry.kind;
		let previous = self.inner.bindings.lock().insert(name.to_string(), entry);
		if previous.map(|p| p.kind) == Some(kind) {
			// Rebinding swaps the host callable; the installed shim keeps
			// working (last writer wins).
			return Ok(());
		}
		self.execute("Runtime.addBinding", json!({"name": name})).await?;
		let shim = bindings::shim(kind, name);
		self.execute("Page.addScriptToEvaluateOnNewDocument", json!({"source": shim})).await?;
		self.eval::<Value>(&shim).await?;
		Ok(())
	}

	/// `Runtime.bindingCalled` driver. Host code and the reply round-trip
	/// run on their own task, off the serial event dispatcher.
	fn on_binding_called(self, params: Value) {
		let Some(name) = params.get("name").and_then(Value::as_str).map(str::to_owned) else {
			return;
		};
		let Some(raw) = params.get("payload").and_then(Value::as_str).map(str::to_owned) else {
			return;
		};
		let Some(entry) = self.inner.bindings.lock().get(&name).cloned() else {
			return;
		};
		tokio::spawn(async move {
			let payload: BindingPayload = match serde_json::from_str(&raw) {
				Ok(payload) => payload,
				Err(e) => {
					warn!(target: "page", binding = %name, "malformed binding payload: {e}");
					return;
				}
			};
			let outcome = (entry.func)(payload.args);
			if entry.kind == BindingKind::Void {
				if let Err(e) = outcome {
					warn!(target: "page", binding = %name, "void binding failed: {e}");
				}
				return;
			}
			let Some(id) = payload.id else {
				warn!(target: "page", binding = %name, "call without id on a value-returning binding");
				return;
			};
			let script = bindings::reply_script(&name, &id, &outcome);
			if let Err(e) = self.eval::<Value>(&script).await {
				warn!(target: "page", binding = %name, "binding reply failed: {e}");
			}
		});
	}

	fn connection(&self) -> Result<Arc<Connection>> {
		self.inner.headless.upgrade().ok_or(Error::Stopped)?.connection()
	}
}

/// Pending one-shot event subscription from [`Session::await_event`].
///
/// `wait` drops this session's handlers for the method once the event
/// arrives.
pub struct EventWaiter {
	rx: oneshot::Receiver<Value>,
	connection: Arc<Connection>,
	session_id: String,
	method: String,
}

impl EventWaiter {
	pub async fn wait(self) -> Result<Value> {
		let params = self.rx.await.map_err(|_| Error::Stopped)?;
		self.connection.unsubscribe(&self.session_id, &self.method).await?;
		Ok(params)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn dangling_supervisor_fails_with_stopped() {
		let session = Session::new("sid", "tid", Weak::new());
		let err = session.execute("Runtime.evaluate", json!({})).await.unwrap_err();
		assert!(matches!(err, Error::Stopped));
		let err = session.bind("f", |(): ()| Ok(Value::Null)).await.unwrap_err();
		assert!(matches!(err, Error::Stopped));
	}

	#[tokio::test]
	async fn invalid_binding_names_are_rejected() {
		let session = Session::new("sid", "tid", Weak::new());
		let err = session.bind("not an identifier", |(): ()| Ok(Value::Null)).await.unwrap_err();
		assert!(matches!(err, Error::Binding(_)), "got: {err:?}");
	}
}
