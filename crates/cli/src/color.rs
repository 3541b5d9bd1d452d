//! `%c` console directive colorizing.
//!
//! Pages emit `console.info("%chello", "color: green")` style messages; the
//! only CSS directive honored is `color: <name>`. Directives are stripped
//! when stdout is not a terminal.

use std::io::IsTerminal;

use headless_core::Message;
use serde_json::Value;

const COLORS: &[(&str, u8)] = &[
	("none", 0),
	("red", 31),
	("green", 32),
	("yellow", 33),
	("blue", 34),
	("purple", 35),
	("cyan", 36),
	("grey", 37),
];

pub fn colorize(message: &Message) -> String {
	colorize_for(message, std::io::stdout().is_terminal())
}

fn colorize_for(message: &Message, tty: bool) -> String {
	let Some(first) = message.args.first() else {
		return String::new();
	};
	let raw = first.as_str().unwrap_or_default();
	if !tty {
		return raw.replace("%c", "");
	}
	let parts: Vec<&str> = raw.split("%c").collect();
	let mut out = parts[0].to_string();
	for (i, part) in parts[1..].iter().enumerate() {
		match message.args.get(i + 1) {
			Some(style) => {
				if let Some(code) = style.as_str().and_then(color_code) {
					out.push_str(&format!("\x1b[{code}m"));
				}
			}
			// Directive without a style argument resets.
			None => out.push_str("\x1b[0m"),
		}
		out.push_str(part);
	}
	if parts.len() > 1 {
		out.push_str("\x1b[0m");
	}
	out
}

fn color_code(style: &str) -> Option<u8> {
	let value = style.split(';').find_map(|declaration| {
		let (key, value) = declaration.split_once(':')?;
		(key.trim() == "color").then(|| value.trim())
	})?;
	COLORS.iter().find(|(name, _)| *name == value).map(|(_, code)| *code)
}
