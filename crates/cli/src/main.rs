mod cli;
mod color;
mod logging;

use anyhow::{Context, Result};
use clap::Parser;
use headless_core::{Browser, ConsoleEvent, Message, Options, Runner, html};
use serde_json::Value;

#[tokio::main]
async fn main() {
	let cli = cli::Cli::parse();
	logging::init_logging(cli.verbose);

	match run(cli).await {
		Ok(code) => std::process::exit(code),
		Err(err) => {
			eprintln!("error: {err:#}");
			std::process::exit(1);
		}
	}
}

async fn run(cli: cli::Cli) -> Result<i32> {
	let mut browser = Browser::new();
	browser.display_ui = cli.display;
	if let Some(extra) = &cli.browser_args {
		browser.args.extend(extra.split_whitespace().map(str::to_owned));
	}

	let runner = Runner::with_options(Options { browser, pipe: false });
	if cli.fs {
		runner.route_post("/create", headless_core::create_route());
	}
	runner.start().await.context("starting browser")?;

	let args: Vec<String> = cli
		.args
		.as_deref()
		.unwrap_or_default()
		.split_whitespace()
		.map(str::to_owned)
		.collect();
	let page = html(cli.code.as_deref().unwrap_or_default(), &cli.files, &args);

	let mut run = runner.run(page);
	eprintln!("Running on {}", run.url());

	while let Some(message) = run.recv().await {
		match headless_core::classify(&message.method, message.args.clone()) {
			ConsoleEvent::Started => {}
			ConsoleEvent::Exit(code) => {
				runner.stop().await.context("stopping browser")?;
				return Ok(code);
			}
			ConsoleEvent::Message(_) if message.method == "clear" && message.args.len() == 1 => {
				// clear with a single non-numeric argument
				runner.stop().await.context("stopping browser")?;
				return Ok(-1);
			}
			ConsoleEvent::Message(message) => print_message(&message),
		}
	}

	runner.stop().await.context("stopping browser")?;
	Ok(0)
}

fn print_message(message: &Message) {
	if message.method == "info" {
		println!("{}", color::colorize(message));
	} else {
		let rendered: Vec<String> = message.args.iter().map(render_arg).collect();
		println!("{} {}", message.method, rendered.join(" "));
	}
}

fn render_arg(value: &Value) -> String {
	match value {
		Value::String(text) => text.clone(),
		other => other.to_string(),
	}
}
