//! Headless core - sessions, page bindings, and the script run server.
//!
//! Two entry points, both built on [`headless_runtime`]:
//!
//! - [`Headless`]: the protocol supervisor. Owns the browser process and the
//!   multiplexed connection; hands out [`Session`]s for attached targets with
//!   typed event handlers, expression evaluation, and host-callable page
//!   [bindings](Session::bind).
//! - [`Runner`]: the script runner. Serves a control page plus per-run pages
//!   from a local HTTP server and exposes each run as a channel of
//!   [`Message`]s instead of raw protocol access.
//!
//! ```no_run
//! # async fn demo() -> headless_runtime::Result<()> {
//! let runner = headless_core::Runner::new();
//! runner.start().await?;
//! let mut run = runner.run(headless_core::html("console.log(1); close()", &[], &[]));
//! while let Some(message) = run.recv().await {
//! 	println!("{} {:?}", message.method, message.args);
//! }
//! # Ok(())
//! # }
//! ```

pub mod bindings;
pub mod console;
pub mod headless;
pub mod html;
pub mod run;
pub mod server;
pub mod session;

pub use console::{ConsoleEvent, classify, decode_remote_object, format_exception};
pub use headless::{Headless, Options};
pub use html::html;
pub use run::{Message, Run};
pub use server::{PostRoute, Runner, create_route};
pub use session::{EventWaiter, Session};

pub use headless_runtime::{Browser, Error, Result};
