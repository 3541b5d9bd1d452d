//! Handles for individual script runs.

use std::sync::Weak;

use headless_runtime::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::server::RunnerInner;

/// One inbound message from a run page.
///
/// `method` is a console level (`log`, `info`, `warning`, …), `clear` (exit
/// code in `args[0]`), `exception`, or whatever the page sent through its
/// server channel. `id` is set when the page expects a reply via
/// [`Run::respond`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
	pub method: String,
	#[serde(default)]
	pub args: Vec<Value>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub id: Option<u64>,
}

/// A single script run: one page, one websocket, one message channel.
///
/// The channel closes exactly once — on [`cancel`](Run::cancel) (or drop) or
/// when the page disconnects, whichever comes first.
pub struct Run {
	pub(crate) id: u64,
	pub(crate) url: String,
	pub(crate) messages: mpsc::UnboundedReceiver<Message>,
	pub(crate) runner: Weak<RunnerInner>,
	pub(crate) token: CancellationToken,
}

impl Run {
	pub fn id(&self) -> u64 {
		self.id
	}

	/// The page URL for this run (`http://localhost:<port>/_run_<id>`).
	pub fn url(&self) -> &str {
		&self.url
	}

	/// Receives the next message; `None` once the run has ended.
	pub async fn recv(&mut self) -> Option<Message> {
		self.messages.recv().await
	}

	/// Asks the page to end the run. The messages channel closes once the
	/// page has let go (or immediately if it never connected).
	pub fn cancel(&self) {
		self.token.cancel();
	}

	/// Replies to a message that carried an id: sends `{data: {id, result}}`
	/// to the run page.
	pub fn respond(&self, message: &Message, result: Value) -> Result<()> {
		let id = message
			.id
			.ok_or_else(|| Error::Binding("cannot respond to a message without an id".into()))?;
		let runner = self.runner.upgrade().ok_or(Error::Stopped)?;
		runner.respond(self.id, id, result)
	}
}

impl Drop for Run {
	fn drop(&mut self) {
		self.token.cancel();
	}
}
