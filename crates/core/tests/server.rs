//! Run-server integration tests.
//!
//! These start the real HTTP server on a free port and play the part of the
//! control and run pages over plain websocket clients, so the whole
//! orchestration surface is exercised without a browser.

use std::sync::Arc;
use std::time::Duration;

use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use headless_core::{Message, Runner, create_route, html};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn connect_page(port: u16, path: &str) -> WsStream {
	let mut request = format!("ws://localhost:{port}{path}").into_client_request().unwrap();
	request
		.headers_mut()
		.insert("Origin", HeaderValue::from_str(&format!("http://localhost:{port}")).unwrap());
	let (stream, _) = connect_async(request).await.expect("websocket connect");
	stream
}

async fn next_json(ws: &mut WsStream) -> Value {
	loop {
		let message = tokio::time::timeout(Duration::from_secs(5), ws.next())
			.await
			.expect("timed out waiting for frame")
			.expect("websocket closed")
			.expect("websocket error");
		match message {
			tungstenite::Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
			tungstenite::Message::Close(_) => panic!("websocket closed mid-test"),
			_ => continue,
		}
	}
}

async fn send_json(ws: &mut WsStream, frame: Value) {
	ws.send(tungstenite::Message::Text(frame.to_string().into())).await.unwrap();
}

#[tokio::test]
async fn stop_without_start_is_safe() {
	let runner = Runner::new();
	runner.stop().await.unwrap();
	runner.stop().await.unwrap();
}

#[tokio::test]
async fn serve_is_idempotent() {
	let runner = Runner::new();
	let port = runner.serve().await.unwrap();
	assert_eq!(runner.serve().await.unwrap(), port);
	assert_eq!(runner.port(), port);
}

#[tokio::test]
async fn main_serves_the_control_page() {
	let runner = Runner::new();
	let port = runner.serve().await.unwrap();

	let body = reqwest::get(format!("http://localhost:{port}/_main"))
		.await
		.unwrap()
		.text()
		.await
		.unwrap();
	assert!(body.contains("<template>"));
	assert!(body.contains("/_headless/headless.mjs"));

	let asset = reqwest::get(format!("http://localhost:{port}/_headless/headless.mjs")).await.unwrap();
	assert_eq!(asset.headers()["content-type"], "application/javascript; charset=utf-8");
	assert!(asset.text().await.unwrap().contains("formatConsoleArg"));
}

#[tokio::test]
async fn run_pages_serve_their_html_verbatim() {
	let runner = Runner::new();
	let port = runner.serve().await.unwrap();
	let page = html("console.log(1); close()", &[], &[]);
	let run = runner.run(page.clone());

	let body = reqwest::get(run.url()).await.unwrap().text().await.unwrap();
	assert_eq!(body, page);

	let missing = reqwest::get(format!("http://localhost:{port}/_run_999")).await.unwrap();
	assert_eq!(missing.status(), 404);
}

#[tokio::test]
async fn static_files_are_served_without_caching() {
	let runner = Runner::new();
	let port = runner.serve().await.unwrap();

	// The test process runs in the package root, so the manifest is a file
	// the cwd server must expose.
	let response = reqwest::get(format!("http://localhost:{port}/Cargo.toml")).await.unwrap();
	assert_eq!(response.status(), 200);
	assert_eq!(response.headers()["cache-control"], "no-cache, no-store, must-revalidate");
	assert_eq!(response.headers()["expires"], "0");
	assert!(response.text().await.unwrap().contains("headless-core"));
}

#[tokio::test]
async fn post_lists_directories_for_local_origins_only() {
	let runner = Runner::new();
	let port = runner.serve().await.unwrap();
	let client = reqwest::Client::new();

	let denied = client
		.post(format!("http://localhost:{port}/src"))
		.send()
		.await
		.unwrap();
	assert_eq!(denied.status(), 401);

	let denied = client
		.post(format!("http://localhost:{port}/src"))
		.header("Origin", "http://evil.example")
		.send()
		.await
		.unwrap();
	assert_eq!(denied.status(), 401);

	let listing: Vec<String> = client
		.post(format!("http://localhost:{port}/src"))
		.header("Origin", format!("http://localhost:{port}"))
		.send()
		.await
		.unwrap()
		.json()
		.await
		.unwrap();
	assert!(listing.iter().any(|name| name == "lib.rs"), "got: {listing:?}");
}

#[tokio::test]
async fn injected_post_routes_run_before_the_listing() {
	let runner = Runner::new();
	let port = runner.serve().await.unwrap();

	let seen: Arc<parking_lot::Mutex<Vec<(Option<String>, Vec<u8>)>>> = Arc::default();
	let sink = seen.clone();
	runner.route_post(
		"/hook",
		Arc::new(move |query, body| {
			sink.lock().push((query.map(str::to_owned), body.to_vec()));
			"ok".into_response()
		}),
	);

	let response = reqwest::Client::new()
		.post(format!("http://localhost:{port}/hook?tag=1"))
		.header("Origin", format!("http://localhost:{port}"))
		.body("payload")
		.send()
		.await
		.unwrap();
	assert_eq!(response.status(), 200);
	assert_eq!(response.text().await.unwrap(), "ok");
	let seen = seen.lock();
	assert_eq!(seen.as_slice(), &[(Some("tag=1".to_string()), b"payload".to_vec())]);
}

#[tokio::test]
async fn create_route_writes_files_under_the_working_directory() {
	let route = create_route();
	let path = "target/create-route-test/a/b.txt";
	let _ = std::fs::remove_file(path);

	let response = route(Some(&format!("path={path}")), b"x");
	assert_eq!(response.status(), 200);
	assert_eq!(std::fs::read_to_string(path).unwrap(), "x");
	let _ = std::fs::remove_dir_all("target/create-route-test");

	assert_eq!(route(Some("path=../escape.txt"), b"x").status(), 400);
	assert_eq!(route(Some("path=/etc/escape.txt"), b"x").status(), 400);
	assert_eq!(route(None, b"x").status(), 400);
}

#[tokio::test]
async fn websocket_upgrades_require_a_local_origin() {
	let runner = Runner::new();
	let port = runner.serve().await.unwrap();

	let request = format!("ws://localhost:{port}/_main").into_client_request().unwrap();
	let err = connect_async(request).await.unwrap_err();
	match err {
		tungstenite::Error::Http(response) => assert_eq!(response.status(), 401),
		other => panic!("expected 401 rejection, got {other:?}"),
	}
}

#[tokio::test]
async fn control_page_gets_connect_then_open_directives() {
	let runner = Runner::new();
	let port = runner.serve().await.unwrap();

	let mut control = connect_page(port, "/_main").await;
	let connect = next_json(&mut control).await;
	assert_eq!(connect["method"], "connect");
	assert!(connect["params"].get("browserWebsocketUrl").is_some());
	send_json(&mut control, json!({"method": "connect"})).await;

	let run = runner.run("<html></html>");
	let open = next_json(&mut control).await;
	assert_eq!(open["method"], "open");
	assert_eq!(open["params"]["url"], run.url());
}

#[tokio::test]
async fn run_messages_flow_to_the_channel_until_close() {
	let runner = Runner::new();
	let port = runner.serve().await.unwrap();
	let mut run = runner.run("<html></html>");

	let mut page = connect_page(port, &format!("/_run_{}", run.id())).await;
	assert_eq!(next_json(&mut page).await["method"], "connect");

	send_json(&mut page, json!({"method": "log", "params": {"url": run.url(), "args": [1]}})).await;
	send_json(
		&mut page,
		json!({"method": "clear", "params": {"url": run.url(), "args": [0]}}),
	)
	.await;

	assert_eq!(
		run.recv().await,
		Some(Message { method: "log".into(), args: vec![json!(1)], id: None })
	);
	assert_eq!(
		run.recv().await,
		Some(Message { method: "clear".into(), args: vec![json!(0)], id: None })
	);

	send_json(&mut page, json!({"method": "close", "params": {"url": run.url()}})).await;
	assert_eq!(run.recv().await, None);
}

#[tokio::test]
async fn cancel_sends_close_to_the_run_page() {
	let runner = Runner::new();
	let port = runner.serve().await.unwrap();
	let mut run = runner.run("<html></html>");

	let mut page = connect_page(port, &format!("/_run_{}", run.id())).await;
	assert_eq!(next_json(&mut page).await["method"], "connect");

	run.cancel();
	let close = next_json(&mut page).await;
	assert_eq!(close["method"], "close");
	assert_eq!(close["params"]["url"], run.url());

	// The page acknowledges by dropping its socket; the channel then closes.
	drop(page);
	assert_eq!(run.recv().await, None);
}

#[tokio::test]
async fn page_disconnect_closes_the_channel() {
	let runner = Runner::new();
	let port = runner.serve().await.unwrap();
	let mut run = runner.run("<html></html>");

	let page = connect_page(port, &format!("/_run_{}", run.id())).await;
	drop(page);
	assert_eq!(run.recv().await, None);
}

#[tokio::test]
async fn cancel_before_the_page_connects_closes_the_channel() {
	let runner = Runner::new();
	runner.serve().await.unwrap();
	let mut run = runner.run("<html></html>");
	run.cancel();
	assert_eq!(run.recv().await, None);
}

#[tokio::test]
async fn respond_reaches_the_run_socket() {
	let runner = Runner::new();
	let port = runner.serve().await.unwrap();
	let mut run = runner.run("<html></html>");

	let mut page = connect_page(port, &format!("/_run_{}", run.id())).await;
	assert_eq!(next_json(&mut page).await["method"], "connect");

	send_json(
		&mut page,
		json!({"method": "readFile", "id": 7, "params": {"url": run.url(), "args": ["a.txt"]}}),
	)
	.await;
	let request = run.recv().await.unwrap();
	assert_eq!(request.method, "readFile");
	assert_eq!(request.id, Some(7));

	run.respond(&request, json!("contents")).unwrap();
	let reply = next_json(&mut page).await;
	assert_eq!(reply["data"]["id"], 7);
	assert_eq!(reply["data"]["result"], "contents");
}

#[tokio::test]
async fn late_messages_after_close_are_dropped() {
	let runner = Runner::new();
	let port = runner.serve().await.unwrap();
	let mut run = runner.run("<html></html>");

	let mut page = connect_page(port, &format!("/_run_{}", run.id())).await;
	assert_eq!(next_json(&mut page).await["method"], "connect");

	send_json(&mut page, json!({"method": "close", "params": {"url": run.url()}})).await;
	assert_eq!(run.recv().await, None);

	// The run is gone; this must neither crash the server nor reopen it.
	send_json(&mut page, json!({"method": "log", "params": {"url": run.url(), "args": [2]}})).await;
	let body = reqwest::get(format!("http://localhost:{port}/_main")).await.unwrap();
	assert_eq!(body.status(), 200);
}
