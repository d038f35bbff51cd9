//! End-to-end flows over a real socket: registration, status reporting,
//! and forwarding with streamed responses.

mod common;

use anyhow::{Result, bail};
use common::{init_logs, temp_endpoint, wait_for, wait_until_accepting};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use warden::monitor::memory::{MemoryMonitor, RssCluster};
use warden::{Call, Client, Connection, Dispatch, Message, Role, Server, Worker};

const CALL_TIMEOUT: Option<Duration> = Some(Duration::from_secs(5));

/// Worker-side dispatcher that streams three intermediates before the
/// terminal, so forwarding order is observable.
struct DripOperations;

impl Dispatch for DripOperations {
  fn dispatch(&self, _connection: &Arc<Connection>, call: &Arc<Call>) -> Result<()> {
    match call.message().op.as_deref() {
      Some("drip") => {
        for n in 1..=3 {
          call.push(Message::default().with("n", n));
        }
        call.finish(Message::default().with("done", true));
        Ok(())
      }
      other => bail!("unknown operation '{}'", other.unwrap_or_default()),
    }
  }
}

fn start_server() -> (tempfile::TempDir, Arc<Server>, warden::Endpoint) {
  init_logs();
  let (dir, endpoint) = temp_endpoint();
  let monitor = MemoryMonitor::new(
    Duration::from_secs(3600),
    Arc::new(RssCluster::new(None)),
  );
  let server = Arc::new(Server::new(endpoint.clone()).with_monitor(Arc::new(monitor)));
  server.spawn().expect("spawn server");
  wait_until_accepting(&endpoint);
  (dir, server, endpoint)
}

/// Registers a hand-rolled worker connection with the given state and
/// returns it along with the connection id the server assigned.
fn register_peer(
  endpoint: &warden::Endpoint,
  state: Value,
  target: Arc<dyn Dispatch>,
) -> (Arc<Connection>, String) {
  let stream = endpoint.connect().expect("connect");
  let connection = Connection::new(stream, Role::Client).expect("connection");
  let reader = connection.clone();
  std::thread::spawn(move || {
    let _ = reader.run(target);
  });
  let response = connection
    .call(Message::request("register").with("state", state), CALL_TIMEOUT)
    .expect("register response");
  assert!(response.is_terminal());
  assert!(!response.is_failed());
  let connection_id = response
    .get("connection_id")
    .and_then(Value::as_str)
    .expect("assigned connection id")
    .to_string();
  (connection, connection_id)
}

#[test]
fn register_indexes_the_connection_under_its_id() {
  let (_dir, server, endpoint) = start_server();
  let (_connection, connection_id) = register_peer(
    &endpoint,
    json!({"process_id": 4242}),
    Arc::new(DripOperations),
  );

  let connections = server.connections();
  assert_eq!(connections.len(), 1);
  assert_eq!(connections[0].0, connection_id);
  assert_eq!(connections[0].1.process_id(), Some(4242));
  assert_eq!(
    connections[0].1.connection_id().as_deref(),
    Some(connection_id.as_str())
  );
}

#[test]
fn status_reports_monitors_and_connections() {
  let (_dir, _server, endpoint) = start_server();
  let (_connection, connection_id) = register_peer(
    &endpoint,
    json!({"process_id": 4242, "instance": "w1"}),
    Arc::new(DripOperations),
  );

  let client = Client::connect(&endpoint).expect("client");
  let mut frames = Vec::new();
  client
    .call_stream(Message::request("status"), CALL_TIMEOUT, |frame| {
      frames.push(frame)
    })
    .expect("status stream");

  // The memory monitor pushes its snapshot as an intermediate, then the
  // terminal lists the registered connections with their state.
  assert!(frames.len() >= 2);
  assert!(
    frames
      .iter()
      .any(|frame| frame.get("memory_monitor").is_some())
  );
  let terminal = frames.last().expect("terminal frame");
  assert!(terminal.is_terminal());
  let connections = terminal
    .get("connections")
    .and_then(Value::as_array)
    .expect("connections list");
  assert_eq!(connections.len(), 1);
  assert_eq!(connections[0]["connection_id"], json!(connection_id));
  assert_eq!(connections[0]["process_id"], json!(4242));
  assert_eq!(connections[0]["state"]["instance"], json!("w1"));
}

#[test]
fn forward_streams_responses_in_real_time() {
  let (_dir, _server, endpoint) = start_server();
  let (_connection, connection_id) = register_peer(
    &endpoint,
    json!({"process_id": 4242}),
    Arc::new(DripOperations),
  );

  let client = Client::connect(&endpoint).expect("client");
  let mut frames = Vec::new();
  client
    .call_stream(
      Message::request("forward")
        .with("operation", json!({"do": "drip"}))
        .with("connection_id", connection_id),
      CALL_TIMEOUT,
      |frame| frames.push(frame),
    )
    .expect("forward stream");

  assert_eq!(frames.len(), 4);
  for (index, frame) in frames.iter().take(3).enumerate() {
    assert_eq!(frame.get("n"), Some(&json!(index as u64 + 1)));
    assert!(!frame.is_terminal());
  }
  assert!(frames[3].is_terminal());
  assert_eq!(frames[3].get("done"), Some(&json!(true)));
}

#[test]
fn failing_monitor_fails_status_but_the_connection_survives() {
  init_logs();
  let (_dir, endpoint) = temp_endpoint();

  struct FailingMonitor;
  impl warden::Monitor for FailingMonitor {
    fn status(&self, _call: &Arc<Call>) -> Result<()> {
      bail!("Monitor failed to get status!")
    }
  }

  let server = Arc::new(Server::new(endpoint.clone()).with_monitor(Arc::new(FailingMonitor)));
  server.spawn().expect("spawn server");
  wait_until_accepting(&endpoint);

  let client = Client::connect(&endpoint).expect("client");
  let response = client
    .call(Message::request("status"), CALL_TIMEOUT)
    .expect("terminal still arrives");
  assert!(response.is_terminal());
  assert!(response.is_failed());
  let error = response.error.expect("error detail");
  assert_eq!(error["message"], json!("Monitor failed to get status!"));

  // The connection survives the monitor failure.
  let response = client
    .call(Message::request("status"), CALL_TIMEOUT)
    .expect("second status call");
  assert!(response.is_terminal());
}

#[test]
fn forward_to_an_unknown_connection_fails() {
  let (_dir, _server, endpoint) = start_server();
  let client = Client::connect(&endpoint).expect("client");

  let response = client
    .call(
      Message::request("forward")
        .with("operation", json!({"do": "drip"}))
        .with("connection_id", "no-such"),
      CALL_TIMEOUT,
    )
    .expect("failed terminal");
  assert!(response.is_terminal());
  assert!(response.is_failed());
  assert_eq!(response.error, Some(json!("Connection not found")));
  assert_eq!(response.get("connection_id"), Some(&json!("no-such")));
}

#[test]
fn forward_without_a_connection_id_fails() {
  let (_dir, _server, endpoint) = start_server();
  let client = Client::connect(&endpoint).expect("client");

  let response = client
    .call(
      Message::request("forward").with("operation", json!({"do": "drip"})),
      CALL_TIMEOUT,
    )
    .expect("failed terminal");
  assert!(response.is_failed());
  assert_eq!(
    response.error,
    Some(json!("Missing 'connection_id' parameter"))
  );
}

#[test]
fn worker_serves_forwarded_diagnostics() {
  let (_dir, server, endpoint) = start_server();
  let worker = Worker::new(endpoint.clone());
  worker.set_state("instance", "w1");
  let handle = worker.spawn().expect("spawn worker");

  assert!(
    wait_for(Duration::from_secs(5), || server.connections().len() == 1),
    "worker did not register"
  );
  let (connection_id, connection) = {
    let connections = server.connections();
    (connections[0].0.clone(), connections[0].1.clone())
  };
  assert_eq!(connection.process_id(), Some(std::process::id() as i32));

  let client = Client::connect(&endpoint).expect("client");
  let response = client
    .call(
      Message::request("forward")
        .with("operation", json!({"do": "memory_sample", "duration": 0.05}))
        .with("connection_id", connection_id.clone()),
      CALL_TIMEOUT,
    )
    .expect("forwarded sample");
  assert!(response.is_terminal());
  assert!(!response.is_failed());
  let report = response.get("data").expect("sample report");
  assert!(report["samples"].as_u64().expect("sample count") >= 1);

  let response = client
    .call(
      Message::request("forward")
        .with("operation", json!({"do": "thread_dump"}))
        .with("connection_id", connection_id),
      CALL_TIMEOUT,
    )
    .expect("forwarded thread dump");
  assert!(!response.is_failed());
  assert!(
    response
      .get("data")
      .and_then(Value::as_str)
      .expect("dump text")
      .contains("thread ")
  );

  worker.stop();
  handle.join().expect("worker loop");
}
