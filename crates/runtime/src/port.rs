//! OS-assigned free port lookup.

use std::net::TcpListener;

use crate::error::Result;

/// Binds an OS-chosen TCP port, closes the listener, and returns the number.
///
/// The port is only *probably* free afterwards; callers bind it again
/// immediately. That race is inherent to handing a port to a child process.
pub fn free_port() -> Result<u16> {
	let listener = TcpListener::bind(("127.0.0.1", 0))?;
	Ok(listener.local_addr()?.port())
}
