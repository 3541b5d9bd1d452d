//! Host-callable page bindings.
//!
//! A bound name is installed three ways at once: a `Runtime.addBinding`
//! registration (the raw callback channel), a bootstrap script on every new
//! document, and one immediate evaluation for the current document. The
//! bootstrap wraps the raw binding in a shim; value-returning bindings get a
//! promise with a per-call pending map, void bindings stay fire-and-forget.

use std::sync::Arc;

use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

/// Type-erased host callable: JSON args in, JSON result or rejection out.
pub(crate) type BindingFunc = Arc<dyn Fn(Vec<Value>) -> std::result::Result<Value, String> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BindingKind {
	/// No reply; the page call returns undefined.
	Void,
	/// The page call returns a promise settled by the host reply.
	Returning,
}

#[derive(Clone)]
pub(crate) struct BindingEntry {
	pub(crate) kind: BindingKind,
	pub(crate) func: BindingFunc,
}

/// What the shim serializes into the raw binding call.
#[derive(Debug, Deserialize)]
pub(crate) struct BindingPayload {
	#[serde(default)]
	pub(crate) id: Option<String>,
	#[serde(default)]
	pub(crate) args: Vec<Value>,
}

/// Bound names become `window` properties, so they must be identifiers.
pub(crate) fn is_identifier(name: &str) -> bool {
	let mut chars = name.chars();
	match chars.next() {
		Some(c) if c.is_ascii_alphabetic() || c == '_' || c == '$' => {}
		_ => return false,
	}
	chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
}

/// Decodes a binding argument list against the declared parameter tuple.
/// Arity mismatches surface as decode errors carrying the actual count.
pub(crate) fn decode_args<A: DeserializeOwned>(args: Vec<Value>) -> std::result::Result<A, String> {
	let arity = args.len();
	serde_json::from_value(Value::Array(args)).map_err(|e| format!("cannot decode {arity} argument(s): {e}"))
}

pub(crate) fn shim(kind: BindingKind, name: &str) -> String {
	match kind {
		BindingKind::Returning => format!(
			r#"(() => {{
  const binding = window["{name}"];
  window["{name}"] = (...args) => new Promise((resolve, reject) => {{
    const id = String(window["{name}"].nextId++);
    window["{name}"].pending[id] = {{resolve, reject}};
    binding(JSON.stringify({{id, args}}));
  }});
  Object.assign(window["{name}"], {{pending: {{}}, nextId: 0}});
}})()"#
		),
		BindingKind::Void => format!(
			r#"(() => {{
  const binding = window["{name}"];
  window["{name}"] = (...args) => binding(JSON.stringify({{args}}));
}})()"#
		),
	}
}

/// Script that settles the pending promise for one call id.
pub(crate) fn reply_script(name: &str, id: &str, outcome: &std::result::Result<Value, String>) -> String {
	let (is_err, arg) = match outcome {
		Ok(value) => ("false", value.to_string()),
		Err(message) => ("true", format!("new Error({})", Value::String(message.clone()))),
	};
	let id = Value::String(id.to_string());
	format!(
		r#"(() => {{
  const id = {id}, isErr = {is_err}, arg = {arg};
  window["{name}"].pending[id][isErr ? "reject" : "resolve"](arg);
  delete window["{name}"].pending[id];
}})()"#
	)
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;

	#[test]
	fn identifier_validation() {
		for valid in ["writeFile", "_private", "$jq", "a1"] {
			assert!(is_identifier(valid), "{valid} should be valid");
		}
		for invalid in ["", "1a", "foo-bar", "foo.bar", "foo bar", "日本"] {
			assert!(!is_identifier(invalid), "{invalid} should be invalid");
		}
	}

	#[test]
	fn payload_with_and_without_id() {
		let returning: BindingPayload = serde_json::from_str(r#"{"id": "0", "args": [1, "x"]}"#).unwrap();
		assert_eq!(returning.id.as_deref(), Some("0"));
		assert_eq!(returning.args, vec![json!(1), json!("x")]);

		let void: BindingPayload = serde_json::from_str(r#"{"args": []}"#).unwrap();
		assert!(void.id.is_none());
		assert!(void.args.is_empty());
	}

	#[test]
	fn typed_argument_decoding() {
		let pair: (String, String) = decode_args(vec![json!("a/b"), json!("x")]).unwrap();
		assert_eq!(pair, ("a/b".to_string(), "x".to_string()));

		let single: (i64,) = decode_args(vec![json!(7)]).unwrap();
		assert_eq!(single.0, 7);

		let variadic: Vec<Value> = decode_args(vec![json!(1), json!(2), json!(3)]).unwrap();
		assert_eq!(variadic.len(), 3);
	}

	#[test]
	fn arity_mismatch_reports_count() {
		let err = decode_args::<(String, String)>(vec![json!("only one")]).unwrap_err();
		assert!(err.contains("1 argument"), "got: {err}");
	}

	#[test]
	fn returning_shim_wraps_in_promise() {
		let shim = shim(BindingKind::Returning, "writeFile");
		assert!(shim.contains(r#"window["writeFile"]"#));
		assert!(shim.contains("new Promise"));
		assert!(shim.contains("pending[id] = {resolve, reject}"));
		assert!(shim.contains("JSON.stringify({id, args})"));
	}

	#[test]
	fn void_shim_has_no_promise() {
		let shim = shim(BindingKind::Void, "report");
		assert!(shim.contains("JSON.stringify({args})"));
		assert!(!shim.contains("Promise"));
	}

	#[test]
	fn reply_scripts_resolve_and_reject() {
		let ok = reply_script("f", "3", &Ok(json!({"ok": true})));
		assert!(ok.contains(r#"const id = "3", isErr = false, arg = {"ok":true};"#));
		assert!(ok.contains(r#"window["f"].pending[id]"#));

		let err = reply_script("f", "3", &Err("boom \"quoted\"".to_string()));
		assert!(err.contains(r#"isErr = true, arg = new Error("boom \"quoted\"")"#));
	}
}
