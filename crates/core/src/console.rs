//! Console argument and exception decoding.
//!
//! `Runtime.consoleAPICalled` delivers arguments as `RemoteObject`s; only
//! primitives carry a `value`, everything else has to be rendered from its
//! `description` or `preview`. `console.clear(n)` doubles as the exit-code
//! channel for page scripts (`window.close(code)` on the run page).

use serde_json::Value;

use crate::run::Message;

/// What a `Runtime.consoleAPICalled` event means for a script run.
#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleEvent {
	/// `console.clear(-1)`: the script has started executing.
	Started,
	/// `console.clear(n)`: the script asked to exit with `n`.
	Exit(i32),
	/// Anything else: a console message with decoded arguments.
	Message(Message),
}

/// Classifies a console call. `clear` with exactly one numeric argument is an
/// exit code; every other call surfaces as a message.
pub fn classify(kind: &str, args: Vec<Value>) -> ConsoleEvent {
	if kind == "clear" && args.len() == 1 {
		if let Some(code) = args[0].as_f64() {
			if code as i64 == -1 {
				return ConsoleEvent::Started;
			}
			return ConsoleEvent::Exit(code as i32);
		}
	}
	ConsoleEvent::Message(Message {
		method: kind.to_string(),
		args,
		id: None,
	})
}

/// Maps a protocol `RemoteObject` to a plain value.
///
/// Primitives (and `null`) keep their `value`; functions and regexps render
/// as their `description`; arrays and objects render from the preview the
/// browser computed, which is already stringified per property.
pub fn decode_remote_object(object: &Value) -> Value {
	let kind = object.get("type").and_then(Value::as_str).unwrap_or("");
	let subtype = object.get("subtype").and_then(Value::as_str);

	if matches!(kind, "string" | "number" | "boolean" | "undefined") || subtype == Some("null") {
		return object.get("value").cloned().unwrap_or(Value::Null);
	}
	if kind == "function" || subtype == Some("regexp") {
		return object.get("description").cloned().unwrap_or(Value::Null);
	}

	let properties = object
		.pointer("/preview/properties")
		.and_then(Value::as_array)
		.map(Vec::as_slice)
		.unwrap_or_default();
	let rendered: Vec<String> = properties
		.iter()
		.map(|p| {
			let value = p.get("value").and_then(Value::as_str).unwrap_or_default();
			if subtype == Some("array") {
				value.to_string()
			} else {
				format!("{}: {}", p.get("name").and_then(Value::as_str).unwrap_or_default(), value)
			}
		})
		.collect();
	if subtype == Some("array") {
		Value::String(format!("[{}]", rendered.join(", ")))
	} else {
		Value::String(format!("{{{}}}", rendered.join(", ")))
	}
}

/// Renders `exceptionDetails` as the one-line form used everywhere:
/// `<description>\n    at <url>:<line>:<col>`.
pub fn format_exception(details: &Value) -> String {
	let description = details
		.pointer("/exception/description")
		.and_then(Value::as_str)
		.or_else(|| details.get("text").and_then(Value::as_str))
		.unwrap_or("unknown exception");
	let url = details.get("url").and_then(Value::as_str).unwrap_or("");
	let line = details.get("lineNumber").and_then(Value::as_i64).unwrap_or(0);
	let column = details.get("columnNumber").and_then(Value::as_i64).unwrap_or(0);
	format!("{description}\n    at {url}:{line}:{column}")
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;

	#[test]
	fn primitives_keep_their_value() {
		for value in [json!("foo"), json!(1.5), json!(true), json!(null)] {
			let object = match &value {
				Value::String(_) => json!({"type": "string", "value": value}),
				Value::Number(_) => json!({"type": "number", "value": value}),
				Value::Bool(_) => json!({"type": "boolean", "value": value}),
				Value::Null => json!({"type": "object", "subtype": "null", "value": value}),
				_ => unreachable!(),
			};
			assert_eq!(decode_remote_object(&object), value);
		}
	}

	#[test]
	fn undefined_has_no_value() {
		assert_eq!(decode_remote_object(&json!({"type": "undefined"})), Value::Null);
	}

	#[test]
	fn functions_and_regexps_use_description() {
		let function = json!({"type": "function", "description": "function foo() {}"});
		assert_eq!(decode_remote_object(&function), json!("function foo() {}"));

		let regexp = json!({"type": "object", "subtype": "regexp", "description": "/a+/g"});
		assert_eq!(decode_remote_object(&regexp), json!("/a+/g"));
	}

	#[test]
	fn arrays_render_from_preview() {
		let array = json!({
			"type": "object",
			"subtype": "array",
			"preview": {"properties": [
				{"name": "0", "type": "number", "value": "1"},
				{"name": "1", "type": "string", "value": "two"}
			]}
		});
		assert_eq!(decode_remote_object(&array), json!("[1, two]"));
	}

	#[test]
	fn objects_render_name_value_pairs() {
		let object = json!({
			"type": "object",
			"preview": {"properties": [
				{"name": "foo", "type": "string", "value": "bar"}
			]}
		});
		assert_eq!(decode_remote_object(&object), json!("{foo: bar}"));
	}

	#[test]
	fn clear_with_one_number_is_an_exit_code() {
		assert_eq!(classify("clear", vec![json!(0)]), ConsoleEvent::Exit(0));
		assert_eq!(classify("clear", vec![json!(3)]), ConsoleEvent::Exit(3));
		assert_eq!(classify("clear", vec![json!(-1)]), ConsoleEvent::Started);
	}

	#[test]
	fn other_clears_are_messages() {
		assert!(matches!(classify("clear", vec![]), ConsoleEvent::Message(_)));
		assert!(matches!(classify("clear", vec![json!("x")]), ConsoleEvent::Message(_)));
		assert!(matches!(classify("clear", vec![json!(1), json!(2)]), ConsoleEvent::Message(_)));
	}

	#[test]
	fn log_calls_are_messages() {
		let event = classify("warning", vec![json!("{foo: bar}")]);
		assert_eq!(
			event,
			ConsoleEvent::Message(Message {
				method: "warning".into(),
				args: vec![json!("{foo: bar}")],
				id: None,
			})
		);
	}

	#[test]
	fn exception_formatting() {
		let details = json!({
			"exception": {"description": "SyntaxError: Unexpected identifier"},
			"url": "http://localhost:9001/_run_1",
			"lineNumber": 27,
			"columnNumber": 12
		});
		assert_eq!(
			format_exception(&details),
			"SyntaxError: Unexpected identifier\n    at http://localhost:9001/_run_1:27:12"
		);
	}

	#[test]
	fn exception_falls_back_to_text() {
		let details = json!({"text": "Uncaught", "url": "u", "lineNumber": 1, "columnNumber": 2});
		assert_eq!(format_exception(&details), "Uncaught\n    at u:1:2");
	}
}
