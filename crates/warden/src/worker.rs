//! Worker side: keeps one live connection to the supervisor, re-registering
//! on every reconnect, and hosts the diagnostic operations the supervisor
//! (or a forwarding client) may invoke on it.

use crate::call::Call;
use crate::connection::{Connection, Role};
use crate::diagnostics::{self, AllocationProfile};
use crate::dispatch::Dispatch;
use crate::endpoint::Endpoint;
use crate::protocol::Message;
use anyhow::{Result, bail};
use log::{debug, warn};
use parking_lot::Mutex;
use rand::Rng;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

pub struct Worker {
  endpoint: Endpoint,
  state: Mutex<Map<String, Value>>,
  connection: Mutex<Option<Arc<Connection>>>,
  running: AtomicBool,
  profile: AllocationProfile,
}

impl Worker {
  /// A worker for the given endpoint. The registration state starts with
  /// this process's id; callers may tag on more with [`Worker::set_state`].
  #[must_use]
  pub fn new(endpoint: Endpoint) -> Arc<Self> {
    let mut state = Map::new();
    state.insert("process_id".to_string(), Value::from(std::process::id()));
    Arc::new(Self {
      endpoint,
      state: Mutex::new(state),
      connection: Mutex::new(None),
      running: AtomicBool::new(false),
      profile: AllocationProfile::default(),
    })
  }

  /// Adds a field to the state sent with every `register`.
  pub fn set_state(&self, key: impl Into<String>, value: impl Into<Value>) {
    self.state.lock().insert(key.into(), value.into());
  }

  /// The currently live connection, if any.
  #[must_use]
  pub fn connection(&self) -> Option<Arc<Connection>> {
    self.connection.lock().clone()
  }

  /// Opens one connection without running its reader.
  pub fn connect(self: &Arc<Self>) -> Result<Arc<Connection>> {
    let stream = self.endpoint.connect()?;
    let connection = Connection::new(stream, Role::Client)?;
    *self.connection.lock() = Some(connection.clone());
    Ok(connection)
  }

  /// Reconnect loop: connect, register asynchronously, run the reader to
  /// completion, and on any error back off a random 0..1s before trying
  /// again. Returns only after [`Worker::stop`].
  pub fn run(self: &Arc<Self>) -> Result<()> {
    self.running.store(true, Ordering::SeqCst);
    while self.running.load(Ordering::SeqCst) {
      match self.connect() {
        Ok(connection) => {
          self.spawn_register(&connection);
          let target: Arc<dyn Dispatch> = self.clone();
          if let Err(err) = connection.run(target) {
            warn!("Supervisor connection failed: {err:#}");
          }
          connection.close();
          *self.connection.lock() = None;
        }
        Err(err) => warn!("Supervisor connection failed: {err:#}"),
      }
      if !self.running.load(Ordering::SeqCst) {
        break;
      }
      let backoff = Duration::from_secs_f64(rand::thread_rng().gen_range(0.0..1.0));
      thread::sleep(backoff);
    }
    Ok(())
  }

  /// Runs the reconnect loop on a named background thread.
  ///
  /// The loop does not keep the host alive on its own and ignores the
  /// host's shutdown signalling; it ends only through [`Worker::stop`].
  /// The host decides whether to join the handle.
  pub fn spawn(self: &Arc<Self>) -> Result<JoinHandle<()>> {
    let worker = self.clone();
    thread::Builder::new()
      .name("worker-supervisor".to_string())
      .spawn(move || {
        if let Err(err) = worker.run() {
          warn!("Worker loop stopped: {err:#}");
        }
      })
      .map_err(Into::into)
  }

  /// Ends the reconnect loop and closes the live connection.
  pub fn stop(&self) {
    self.running.store(false, Ordering::SeqCst);
    if let Some(connection) = self.connection.lock().clone() {
      connection.close();
    }
  }

  /// Registration runs beside the reader so the response can be routed.
  /// The response carries the assigned connection id; the worker has no
  /// use for it.
  fn spawn_register(self: &Arc<Self>, connection: &Arc<Connection>) {
    let connection = connection.clone();
    let state = self.state.lock().clone();
    let spawned = thread::Builder::new()
      .name("worker-register".to_string())
      .spawn(move || {
        let request = Message::request("register").with("state", Value::Object(state));
        if let Err(err) = connection.call(request, None) {
          debug!("Register did not complete: {err:#}");
        }
      });
    if let Err(err) = spawned {
      warn!("Failed to spawn register thread: {err}");
    }
  }
}

impl Dispatch for Worker {
  fn dispatch(&self, _connection: &Arc<Connection>, call: &Arc<Call>) -> Result<()> {
    match call.message().op.as_deref() {
      Some("scheduler_dump") => diagnostics::scheduler_dump(call),
      Some("thread_dump") => diagnostics::thread_dump(call),
      Some("memory_dump") => diagnostics::memory_dump(call),
      Some("memory_sample") => diagnostics::memory_sample(call),
      Some("garbage_profile_start") => self.profile.start(call),
      Some("garbage_profile_stop") => self.profile.stop(call),
      other => bail!("unknown operation '{}'", other.unwrap_or_default()),
    }
  }
}
