//! Supervisor side: accepts worker connections, tracks them by connection
//! id, fans lifecycle events out to monitors, and serves the built-in
//! operations (`register`, `forward`, `status`, `restart`).

use crate::call::Call;
use crate::connection::{Connection, Role};
use crate::dispatch::Dispatch;
use crate::endpoint::Endpoint;
use crate::monitor::Monitor;
use crate::protocol::Message;
use anyhow::{Context, Result, anyhow, bail};
use log::{error, info, warn};
use nix::sys::signal::{self, Signal};
use nix::unistd;
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use uuid::Uuid;

pub struct Server {
  endpoint: Endpoint,
  monitors: Vec<Arc<dyn Monitor>>,
  connections: Mutex<HashMap<String, Arc<Connection>>>,
}

impl Server {
  #[must_use]
  pub fn new(endpoint: Endpoint) -> Self {
    Self {
      endpoint,
      monitors: Vec::new(),
      connections: Mutex::new(HashMap::new()),
    }
  }

  #[must_use]
  pub fn with_monitor(mut self, monitor: Arc<dyn Monitor>) -> Self {
    self.monitors.push(monitor);
    self
  }

  #[must_use]
  pub fn endpoint(&self) -> &Endpoint {
    &self.endpoint
  }

  /// Registered connections, keyed by connection id.
  #[must_use]
  pub fn connections(&self) -> Vec<(String, Arc<Connection>)> {
    self
      .connections
      .lock()
      .iter()
      .map(|(id, connection)| (id.clone(), connection.clone()))
      .collect()
  }

  #[must_use]
  pub fn connection(&self, connection_id: &str) -> Option<Arc<Connection>> {
    self.connections.lock().get(connection_id).cloned()
  }

  /// Binds the endpoint, starts monitor loops, and accepts connections
  /// until the listener fails. Each accepted peer gets its own reader
  /// thread with this server as dispatch target.
  pub fn serve(self: &Arc<Self>) -> Result<()> {
    let listener = self.endpoint.bind()?;
    self.start_monitors();
    for stream in listener.incoming() {
      match stream {
        Ok(stream) => self.accept(stream),
        Err(err) => {
          error!("Accept error: {err}");
          thread::sleep(Duration::from_millis(100));
        }
      }
    }
    Ok(())
  }

  /// Runs `serve` on a named background thread.
  pub fn spawn(self: &Arc<Self>) -> Result<thread::JoinHandle<()>> {
    let server = self.clone();
    thread::Builder::new()
      .name("warden-server".to_string())
      .spawn(move || {
        if let Err(err) = server.serve() {
          error!("Server stopped: {err:#}");
        }
      })
      .context("spawn server thread")
  }

  /// Each monitor loop runs on its own thread; a stuck or panicking
  /// monitor cannot stall the accept loop or its siblings.
  fn start_monitors(&self) {
    for (index, monitor) in self.monitors.iter().enumerate() {
      let monitor = monitor.clone();
      let spawned = thread::Builder::new()
        .name(format!("monitor-{index}"))
        .spawn(move || monitor.run());
      if let Err(err) = spawned {
        error!("Failed to spawn monitor thread: {err}");
      }
    }
  }

  fn accept(self: &Arc<Self>, stream: UnixStream) {
    let server = self.clone();
    let spawned = thread::Builder::new()
      .name("server-connection".to_string())
      .spawn(move || {
        let connection = match Connection::new(stream, Role::Server) {
          Ok(connection) => connection,
          Err(err) => {
            error!("Failed to set up connection: {err:#}");
            return;
          }
        };
        let target: Arc<dyn Dispatch> = server.clone();
        if let Err(err) = connection.run(target) {
          warn!("Connection failed: {err:#}");
        }
        connection.close();
        server.remove(&connection);
      });
    if let Err(err) = spawned {
      error!("Failed to spawn connection thread: {err}");
    }
  }

  /// Forgets a disconnected peer and notifies monitors.
  ///
  /// The registry entry is dropped only while it still points at this very
  /// connection: after a quick reconnect the id slot belongs to the new
  /// connection and must survive the old reader's teardown.
  fn remove(&self, connection: &Arc<Connection>) {
    if let Some(connection_id) = connection.connection_id() {
      let mut connections = self.connections.lock();
      if connections
        .get(&connection_id)
        .is_some_and(|held| Arc::ptr_eq(held, connection))
      {
        connections.remove(&connection_id);
        info!("Removed connection {connection_id}");
      }
    }
    for monitor in &self.monitors {
      if let Err(err) = monitor.remove(connection) {
        error!("Monitor remove failed: {err:#}");
      }
    }
  }

  fn do_register(&self, connection: &Arc<Connection>, call: &Arc<Call>) -> Result<()> {
    if let Some(Value::Object(state)) = call.message().get("state") {
      connection.merge_state(state);
    }
    let connection_id = Uuid::new_v4().to_string();
    connection.set_state("connection_id", connection_id.clone());
    self
      .connections
      .lock()
      .insert(connection_id.clone(), connection.clone());
    for monitor in &self.monitors {
      // One faulty monitor must not abort registration or starve the rest.
      if let Err(err) = monitor.register(connection) {
        error!("Monitor register failed: {err:#}");
      }
    }
    info!(
      "Registered connection {connection_id} (process {:?})",
      connection.process_id()
    );
    call.finish(Message::default().with("connection_id", connection_id));
    Ok(())
  }

  fn do_forward(&self, _connection: &Arc<Connection>, call: &Arc<Call>) -> Result<()> {
    let message = call.message();
    let Some(connection_id) = message.get("connection_id").and_then(Value::as_str) else {
      call.fail(Message::default().with_error("Missing 'connection_id' parameter"));
      return Ok(());
    };
    let operation: Message = match message.get("operation") {
      Some(operation) => {
        serde_json::from_value(operation.clone()).context("invalid 'operation' parameter")?
      }
      None => {
        call.fail(Message::default().with_error("Missing 'operation' parameter"));
        return Ok(());
      }
    };
    if !operation.is_request() {
      call.fail(Message::default().with_error("Operation requires a 'do' field"));
      return Ok(());
    }
    let Some(target) = self.connection(connection_id) else {
      call.fail(
        Message::default()
          .with_error("Connection not found")
          .with("connection_id", connection_id),
      );
      return Ok(());
    };
    call.forward(&target, operation)
  }

  fn do_status(&self, _connection: &Arc<Connection>, call: &Arc<Call>) -> Result<()> {
    for monitor in &self.monitors {
      monitor.status(call)?;
    }
    let connections: Vec<Value> = self
      .connections
      .lock()
      .iter()
      .map(|(connection_id, connection)| {
        json!({
          "connection_id": connection_id,
          "process_id": connection.process_id(),
          "state": Value::Object(connection.state()),
        })
      })
      .collect();
    call.finish(Message::default().with("connections", connections));
    Ok(())
  }

  /// Finishes the call, then signals the supervisor's own process group.
  ///
  /// The supervisor is a child of a controller that respawns it, so the
  /// default interrupt doubles as a restart request; other signals carry
  /// whatever meaning the host assigns them (graceful reload).
  fn do_restart(&self, _connection: &Arc<Connection>, call: &Arc<Call>) -> Result<()> {
    let signal = match call.message().get("signal").and_then(Value::as_str) {
      Some(name) => parse_signal(name)?,
      None => Signal::SIGINT,
    };
    call.finish(Message::default());
    // The terminal frame must reach the wire before the group dies.
    thread::sleep(Duration::from_millis(100));
    info!("Signalling own process group with {signal}");
    signal::killpg(unistd::getpgrp(), signal).context("signal process group")?;
    Ok(())
  }
}

impl Dispatch for Server {
  fn dispatch(&self, connection: &Arc<Connection>, call: &Arc<Call>) -> Result<()> {
    match call.message().op.as_deref() {
      Some("register") => self.do_register(connection, call),
      Some("forward") => self.do_forward(connection, call),
      Some("status") => self.do_status(connection, call),
      Some("restart") => self.do_restart(connection, call),
      other => bail!("unknown operation '{}'", other.unwrap_or_default()),
    }
  }
}

/// Parses a conventional signal name; the `SIG` prefix is optional.
pub fn parse_signal(name: &str) -> Result<Signal> {
  let canonical = if name.starts_with("SIG") {
    name.to_string()
  } else {
    format!("SIG{name}")
  };
  canonical
    .parse::<Signal>()
    .map_err(|_| anyhow!("unknown signal '{name}'"))
}
