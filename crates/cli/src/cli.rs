use clap::Parser;

/// Runs browser-targeted scripts in a supervised headless browser, relaying
/// console output and exit codes.
#[derive(Debug, Parser)]
#[command(name = "headless", version, about)]
pub struct Cli {
	/// Code to run after the files have been imported.
	#[arg(short = 'c', long = "code", value_name = "CODE")]
	pub code: Option<String>,

	/// window.args for the page, split on whitespace.
	#[arg(short = 'a', long = "args", value_name = "ARGS")]
	pub args: Option<String>,

	/// Additional browser flags, split on whitespace.
	#[arg(short = 'b', long = "browser-args", value_name = "FLAGS", allow_hyphen_values = true)]
	pub browser_args: Option<String>,

	/// Display the browser UI instead of running headless.
	#[arg(short = 'd', long = "display")]
	pub display: bool,

	/// Allow page scripts to create files via POST /create.
	#[arg(long = "fs")]
	pub fs: bool,

	/// Increase log verbosity (-v info, -vv debug).
	#[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
	pub verbose: u8,

	/// Module files imported into the run page.
	#[arg(value_name = "FILE")]
	pub files: Vec<String>,
}
