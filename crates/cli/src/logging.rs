use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::MakeWriterExt;

/// Initializes stderr logging.
///
/// `DEBUG=true` switches on protocol frame logging (the `cdp` target)
/// regardless of `-v`; `RUST_LOG` overrides everything.
pub fn init_logging(verbosity: u8) {
	// 0 = errors only, 1 (-v) = info without protocol noise, 2+ (-vv) = everything
	let filter = if std::env::var("DEBUG").is_ok_and(|v| v == "true") {
		"debug"
	} else {
		match verbosity {
			0 => "error",
			1 => "info,cdp=warn",
			_ => "debug",
		}
	};

	let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
	let stderr = std::io::stderr.with_max_level(tracing::Level::TRACE);

	tracing_subscriber::fmt()
		.with_env_filter(env_filter)
		.with_writer(stderr)
		.with_target(false)
		.init();
}
