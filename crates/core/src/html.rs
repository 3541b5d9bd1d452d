//! Run-page HTML templating.
//!
//! Builds the document for a single script run: `window.args`, one module
//! script per imported file (with an import-failure trap), and the inline
//! code block, all spliced into the fixed run-page template. The content
//! lands inside the page `<template>` so nothing executes until the page has
//! attached its debugging session.

use serde_json::json;

use crate::server::PAGE_HTML;

/// Builds a run document from inline `code`, module `files`, and
/// `window.args`.
pub fn html(code: &str, files: &[String], args: &[String]) -> String {
	let mut content = format!("<script>window.args = {}</script>\n", json!(args));
	for file in files {
		content.push_str(&format!(
			"<script type=\"module\" src=\"{file}\" onerror=\"throw new Error('failed to import {file}')\"></script>\n"
		));
	}
	if !code.is_empty() {
		content.push_str(&format!("<script type=\"module\">\n{code}\n</script>"));
	}
	PAGE_HTML.replace("</template>", &format!("{content}</template>"))
}
