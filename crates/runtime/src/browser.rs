//! Browser child-process lifecycle.
//!
//! Launches the browser with the remote debugging surface enabled, waits for
//! the endpoint to come up, and tears the whole process group down on stop.
//! The executable and flag list are resolved at construction time so tests
//! can override them hermetically.

use std::time::Duration;

use serde_json::Value;
use tracing::debug;

use crate::error::{Error, Result};
use crate::port::free_port;

/// Flags always passed to the browser (plus the debugging flag and URL).
pub const DEFAULT_BROWSER_ARGS: &[&str] = &[
	"--headless",
	"--temp-profile",
	"--hide-scrollbars",
	"--autoplay-policy=no-user-gesture-required",
];

const ENDPOINT_POLL: Duration = Duration::from_millis(10);
const ENDPOINT_ATTEMPTS: u32 = 1000;

/// Supervised browser child process.
///
/// Created idle; [`start`](Browser::start) (or
/// [`start_piped`](Browser::start_piped)) launches the child and resolves the
/// debug endpoint; [`stop`](Browser::stop) kills the process group and is
/// idempotent.
#[derive(Debug)]
pub struct Browser {
	/// Browser executable. Defaults to `$HEADLESS_EXECUTABLE`, falling back
	/// to `chromium-browser`.
	pub executable: String,
	/// Remote debugging port; 0 picks a free one at start.
	pub port: u16,
	/// Launch flags. Defaults to [`DEFAULT_BROWSER_ARGS`].
	pub args: Vec<String>,
	/// Drop `--headless` and show a window (debugging aid).
	pub display_ui: bool,

	child: Option<tokio::process::Child>,
	websocket_url: Option<String>,
}

impl Default for Browser {
	fn default() -> Self {
		Self::new()
	}
}

impl Browser {
	pub fn new() -> Self {
		let executable = std::env::var("HEADLESS_EXECUTABLE")
			.ok()
			.filter(|e| !e.is_empty())
			.unwrap_or_else(|| "chromium-browser".to_string());
		Browser {
			executable,
			port: 0,
			args: DEFAULT_BROWSER_ARGS.iter().map(|a| a.to_string()).collect(),
			display_ui: false,
			child: None,
			websocket_url: None,
		}
	}

	/// Launches the browser at `url` with `--remote-debugging-port` and polls
	/// `/json/version` until the endpoint answers (10 ms × 1000).
	///
	/// On success [`websocket_url`](Browser::websocket_url) holds the
	/// browser-wide debugger URL.
	pub async fn start(&mut self, url: &str) -> Result<()> {
		if self.port == 0 {
			self.port = free_port()?;
		}
		let mut command = tokio::process::Command::new(&self.executable);
		command
			.args(self.launch_args())
			.arg(format!("--remote-debugging-port={}", self.port))
			.arg(url)
			.stdout(std::process::Stdio::null())
			.stderr(std::process::Stdio::null());
		new_process_group(&mut command);

		let child = command.spawn().map_err(|e| Error::Spawn(format!("{}: {e}", self.executable)))?;
		self.child = Some(child);

		let version_url = format!("http://localhost:{}/json/version", self.port);
		let client = reqwest::Client::new();
		for _ in 0..ENDPOINT_ATTEMPTS {
			if let Ok(response) = client.get(&version_url).send().await {
				if let Ok(version) = response.json::<Value>().await {
					if let Some(ws) = version.get("webSocketDebuggerUrl").and_then(Value::as_str) {
						debug!(target: "cdp", url = ws, "browser endpoint up");
						self.websocket_url = Some(ws.to_string());
						return Ok(());
					}
				}
			}
			tokio::time::sleep(ENDPOINT_POLL).await;
		}
		self.stop().await?;
		Err(Error::EndpointTimeout(10))
	}

	/// Launches the browser at `url` with `--remote-debugging-pipe`.
	///
	/// The child inherits a pipe pair at fds 3 (commands in) and 4 (frames
	/// out); the returned halves are the parent ends, ready for
	/// [`PipeTransport::new`](crate::PipeTransport::new).
	#[cfg(unix)]
	pub async fn start_piped(
		&mut self,
		url: &str,
	) -> Result<(tokio::net::unix::pipe::Sender, tokio::net::unix::pipe::Receiver)> {
		use std::os::fd::{FromRawFd, OwnedFd};

		// Pipe A carries commands parent→child (child reads fd 3), pipe B
		// carries frames child→parent (child writes fd 4). Parent ends are
		// CLOEXEC; the dup2 targets below are not, so only 3 and 4 survive
		// into the child.
		let (child_read, parent_write) = create_pipe()?;
		let (parent_read, child_write) = create_pipe()?;

		let mut command = tokio::process::Command::new(&self.executable);
		command
			.args(self.launch_args())
			.arg("--remote-debugging-pipe")
			.arg(url)
			.stdout(std::process::Stdio::null())
			.stderr(std::process::Stdio::null());
		new_process_group(&mut command);
		unsafe {
			command.pre_exec(move || {
				// Async-signal-safe only in here. A pipe end may already sit
				// on its target number (pipe2 hands out the lowest free fd),
				// where dup2 would be a no-op that leaves CLOEXEC set.
				for (fd, target) in [(child_read, 3), (child_write, 4)] {
					if fd == target {
						let flags = libc::fcntl(fd, libc::F_GETFD);
						if flags == -1 || libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) == -1 {
							return Err(std::io::Error::last_os_error());
						}
					} else if libc::dup2(fd, target) == -1 {
						return Err(std::io::Error::last_os_error());
					}
				}
				Ok(())
			});
		}

		let spawned = command.spawn();
		unsafe {
			libc::close(child_read);
			libc::close(child_write);
		}
		let child = match spawned {
			Ok(child) => child,
			Err(e) => {
				unsafe {
					libc::close(parent_write);
					libc::close(parent_read);
				}
				return Err(Error::Spawn(format!("{}: {e}", self.executable)));
			}
		};
		self.child = Some(child);

		set_nonblocking(parent_write)?;
		set_nonblocking(parent_read)?;
		let sender = tokio::net::unix::pipe::Sender::from_owned_fd(unsafe { OwnedFd::from_raw_fd(parent_write) })?;
		let receiver = tokio::net::unix::pipe::Receiver::from_owned_fd(unsafe { OwnedFd::from_raw_fd(parent_read) })?;
		Ok((sender, receiver))
	}

	/// Kills the whole process group and waits for the child. Safe to call
	/// twice and before `start`.
	pub async fn stop(&mut self) -> Result<()> {
		let Some(mut child) = self.child.take() else {
			return Ok(());
		};
		self.websocket_url = None;

		#[cfg(unix)]
		if let Some(pid) = child.id() {
			// The group includes every renderer/GPU helper the browser
			// forked. "No such process" just means it beat us to it.
			unsafe {
				libc::kill(-(pid as i32), libc::SIGKILL);
			}
		}
		let _ = child.kill().await;
		let _ = child.wait().await;
		Ok(())
	}

	/// The `webSocketDebuggerUrl` reported by the endpoint, once started in
	/// websocket mode.
	pub fn websocket_url(&self) -> Option<&str> {
		self.websocket_url.as_deref()
	}

	pub fn is_running(&self) -> bool {
		self.child.is_some()
	}

	fn launch_args(&self) -> Vec<String> {
		if self.display_ui {
			self.args.iter().filter(|a| a.as_str() != "--headless").cloned().collect()
		} else {
			self.args.clone()
		}
	}
}

fn new_process_group(command: &mut tokio::process::Command) {
	#[cfg(unix)]
	unsafe {
		command.pre_exec(|| {
			if libc::setpgid(0, 0) == -1 {
				return Err(std::io::Error::last_os_error());
			}
			Ok(())
		});
	}
	#[cfg(not(unix))]
	let _ = command;
}

#[cfg(unix)]
fn create_pipe() -> Result<(libc::c_int, libc::c_int)> {
	let mut fds = [0 as libc::c_int; 2];
	if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } == -1 {
		return Err(Error::Spawn(format!("pipe: {}", std::io::Error::last_os_error())));
	}
	Ok((fds[0], fds[1]))
}

#[cfg(unix)]
fn set_nonblocking(fd: libc::c_int) -> Result<()> {
	unsafe {
		let flags = libc::fcntl(fd, libc::F_GETFL);
		if flags == -1 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) == -1 {
			return Err(Error::Io(std::io::Error::last_os_error()));
		}
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn default_args_cover_required_flags() {
		let browser = Browser::new();
		for flag in ["--headless", "--temp-profile", "--hide-scrollbars"] {
			assert!(browser.args.iter().any(|a| a == flag), "missing {flag}");
		}
		assert!(browser.args.iter().any(|a| a.starts_with("--autoplay-policy=")));
	}

	#[test]
	fn display_ui_drops_headless() {
		let mut browser = Browser::new();
		browser.display_ui = true;
		assert!(!browser.launch_args().iter().any(|a| a == "--headless"));
		assert!(browser.launch_args().iter().any(|a| a == "--temp-profile"));
	}

	#[test]
	fn executable_resolved_at_construction() {
		// Resolution happens in `new`, so changing the variable afterwards
		// must not affect an existing instance.
		std::env::set_var("HEADLESS_EXECUTABLE", "/opt/test/chrome");
		let browser = Browser::new();
		std::env::remove_var("HEADLESS_EXECUTABLE");
		assert_eq!(browser.executable, "/opt/test/chrome");
		assert_eq!(Browser::new().executable, "chromium-browser");
	}

	#[tokio::test]
	async fn stop_without_start_is_noop() {
		let mut browser = Browser::new();
		browser.stop().await.unwrap();
		browser.stop().await.unwrap();
	}

	#[tokio::test]
	async fn spawn_failure_is_reported() {
		let mut browser = Browser::new();
		browser.executable = "/nonexistent/definitely-not-a-browser".into();
		let err = browser.start("about:blank").await.unwrap_err();
		assert!(matches!(err, Error::Spawn(_)), "got: {err:?}");
		assert!(!browser.is_running());
	}
}
