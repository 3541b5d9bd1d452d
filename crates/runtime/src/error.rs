//! Error types for the headless runtime.

use thiserror::Error;

/// Result type alias for runtime operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while driving the browser.
#[derive(Debug, Error)]
pub enum Error {
	/// The browser child process failed to launch.
	#[error("failed to spawn browser: {0}")]
	Spawn(String),

	/// The remote debugging endpoint did not come up in time.
	#[error("timeout ({0}s) waiting for browser to start")]
	EndpointTimeout(u64),

	/// Read/write/parse failure on the transport. Fatal for the supervisor.
	#[error("transport error: {0}")]
	Transport(String),

	/// Error object returned by the browser for a single command.
	#[error("{code}: {message}{}", data.as_deref().map(|d| format!(" - {d}")).unwrap_or_default())]
	Protocol {
		code: i64,
		message: String,
		data: Option<String>,
	},

	/// Uncaught exception in the page.
	#[error("{0}")]
	ScriptException(String),

	/// Decode, marshal, or arity failure in a page binding.
	#[error("binding error: {0}")]
	Binding(String),

	/// An awaited operation cannot complete because the supervisor is gone.
	#[error("supervisor stopped")]
	Stopped,

	/// I/O error.
	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),

	/// JSON serialization/deserialization error.
	#[error("JSON error: {0}")]
	Json(#[from] serde_json::Error),
}

impl Error {
	/// Returns true if this error is fatal for the whole supervisor
	/// (as opposed to a single failed operation).
	pub fn is_fatal(&self) -> bool {
		matches!(
			self,
			Error::Spawn(_) | Error::EndpointTimeout(_) | Error::Transport(_) | Error::Stopped
		)
	}

	/// Returns true if the supervisor was torn down underneath the caller.
	pub fn is_stopped(&self) -> bool {
		matches!(self, Error::Stopped)
	}
}
