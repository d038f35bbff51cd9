//! One bidirectional stream plus its call table.
//!
//! The same type serves both endpoints: the supervisor runs it with the
//! server as dispatch target, workers run it with themselves. Frames with an
//! id that matches a live call are routed to that call's queue; frames that
//! carry `do` start a new inbound call (handler thread plus a drain thread
//! writing its responses); anything else is a stale response and is ignored.

use crate::call::{Call, CallError};
use crate::dispatch::{self, Dispatch};
use crate::protocol::{self, Message, MessageReader};
use anyhow::{Context, Result};
use log::{debug, error, warn};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

/// Which endpoint of the channel this connection is.
///
/// Call ids advance by two from a per-role start, so the ids issued by the
/// two endpoints of one channel can never collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
  Client,
  Server,
}

impl Role {
  fn first_id(self) -> u64 {
    match self {
      Role::Client => 0,
      Role::Server => 1,
    }
  }
}

pub struct Connection {
  stream: UnixStream,
  writer: Mutex<UnixStream>,
  next_id: AtomicU64,
  calls: Mutex<HashMap<u64, Arc<Call>>>,
  state: Mutex<Map<String, Value>>,
  closed: AtomicBool,
}

impl Connection {
  pub fn new(stream: UnixStream, role: Role) -> Result<Arc<Self>> {
    let writer = stream.try_clone().context("clone stream for writing")?;
    Ok(Arc::new(Self {
      stream,
      writer: Mutex::new(writer),
      next_id: AtomicU64::new(role.first_id()),
      calls: Mutex::new(HashMap::new()),
      state: Mutex::new(Map::new()),
      closed: AtomicBool::new(false),
    }))
  }

  /// Snapshot of the connection state map.
  #[must_use]
  pub fn state(&self) -> Map<String, Value> {
    self.state.lock().clone()
  }

  pub fn set_state(&self, key: impl Into<String>, value: impl Into<Value>) {
    self.state.lock().insert(key.into(), value.into());
  }

  pub fn merge_state(&self, fields: &Map<String, Value>) {
    let mut state = self.state.lock();
    for (key, value) in fields {
      state.insert(key.clone(), value.clone());
    }
  }

  /// The peer's process id, once it registered one.
  #[must_use]
  pub fn process_id(&self) -> Option<i32> {
    let state = self.state.lock();
    let pid = state.get("process_id")?.as_i64()?;
    i32::try_from(pid).ok()
  }

  /// The id the server assigned at registration.
  #[must_use]
  pub fn connection_id(&self) -> Option<String> {
    let state = self.state.lock();
    Some(state.get("connection_id")?.as_str()?.to_string())
  }

  /// Number of live calls, both directions.
  #[must_use]
  pub fn pending_calls(&self) -> usize {
    self.calls.lock().len()
  }

  /// Serializes and flushes one frame. The writer mutex makes concurrent
  /// writes interleave at frame granularity, never mid-frame.
  pub fn write(&self, message: &Message) -> Result<()> {
    let mut writer = self.writer.lock();
    protocol::write_message(&mut *writer, message)
  }

  /// Issues a point query and returns its terminal response.
  ///
  /// Intermediate responses are discarded; use [`Connection::call_stream`]
  /// to observe them. On timeout, I/O failure, or connection close the call
  /// is removed from the table and the failure surfaces to the caller.
  pub fn call(self: &Arc<Self>, message: Message, timeout: Option<Duration>) -> Result<Message> {
    let op = message.op.clone().unwrap_or_default();
    let call = self.issue(message)?;
    loop {
      match call.pop(timeout) {
        Ok(Some(response)) => {
          if response.is_terminal() {
            self.remove_call(call.id());
            return Ok(response);
          }
        }
        Ok(None) => {
          self.remove_call(call.id());
          return Err(CallError::Closed).with_context(|| format!("call '{op}' aborted"));
        }
        Err(err) => {
          self.remove_call(call.id());
          call.close();
          return Err(err).with_context(|| format!("call '{op}' timed out"));
        }
      }
    }
  }

  /// Issues a call and delivers every response frame, in order, terminal
  /// last. Returns once the terminal frame was delivered.
  pub fn call_stream(
    self: &Arc<Self>,
    message: Message,
    timeout: Option<Duration>,
    mut deliver: impl FnMut(Message),
  ) -> Result<()> {
    let op = message.op.clone().unwrap_or_default();
    let call = self.issue(message)?;
    loop {
      match call.pop(timeout) {
        Ok(Some(response)) => {
          let terminal = response.is_terminal();
          deliver(response);
          if terminal {
            self.remove_call(call.id());
            return Ok(());
          }
        }
        Ok(None) => {
          self.remove_call(call.id());
          return Err(CallError::Closed).with_context(|| format!("call '{op}' aborted"));
        }
        Err(err) => {
          self.remove_call(call.id());
          call.close();
          return Err(err).with_context(|| format!("call '{op}' timed out"));
        }
      }
    }
  }

  /// Allocates an id, registers the call, and writes the request frame.
  fn issue(self: &Arc<Self>, mut message: Message) -> Result<Arc<Call>> {
    let id = self.next_id.fetch_add(2, Ordering::Relaxed);
    message.id = Some(id);
    let call = Call::new(id, message.clone());
    self.calls.lock().insert(id, call.clone());
    if let Err(err) = self.write(&message) {
      self.remove_call(id);
      call.close();
      return Err(err);
    }
    Ok(call)
  }

  /// Reads frames until EOF or I/O failure and routes each one.
  ///
  /// Blocks the current thread; both sides run this on a dedicated reader
  /// thread. Returns `Ok(())` on clean EOF or local close.
  pub fn run(self: &Arc<Self>, target: Arc<dyn Dispatch>) -> Result<()> {
    let reader = self.stream.try_clone().context("clone stream for reading")?;
    let mut messages = MessageReader::new(reader);
    loop {
      match messages.read() {
        Ok(Some(message)) => self.route(message, &target),
        Ok(None) => return Ok(()),
        Err(err) => {
          if self.closed.load(Ordering::SeqCst) {
            return Ok(());
          }
          return Err(err).context("read from peer");
        }
      }
    }
  }

  fn route(self: &Arc<Self>, mut message: Message, target: &Arc<dyn Dispatch>) {
    let Some(id) = message.id.take() else {
      error!("Protocol violation: frame without an id");
      return;
    };

    // Response path: the id belongs to a call we issued.
    let live = self.calls.lock().get(&id).cloned();
    if let Some(call) = live {
      call.push(message);
      return;
    }

    if message.is_request() {
      message.id = Some(id);
      let call = Call::new(id, message);
      self.calls.lock().insert(id, call.clone());
      self.spawn_drain(id, call.clone());
      self.spawn_dispatch(call, target.clone());
    } else {
      // A reply for a call the caller already timed out and deleted.
      // Correct handling is to ignore it; never frame an error here.
      debug!("Ignoring response for unknown call {id}");
    }
  }

  /// Writes each queued response of an inbound call as `{id, ...payload}`.
  fn spawn_drain(self: &Arc<Self>, id: u64, call: Arc<Call>) {
    let connection = self.clone();
    let spawned = thread::Builder::new()
      .name(format!("call-drain-{id}"))
      .spawn(move || {
        while let Ok(Some(mut response)) = call.pop(None) {
          response.id = Some(id);
          if let Err(err) = connection.write(&response) {
            // The peer is gone; remaining responses have nowhere to go.
            debug!("Dropping responses for call {id}: {err:#}");
            break;
          }
        }
      });
    if let Err(err) = spawned {
      error!("Failed to spawn drain thread for call {id}: {err}");
    }
  }

  /// Runs the dispatch target for an inbound call on its own thread.
  ///
  /// A handler that returns without closing the call gets a synthetic
  /// terminal; an error becomes a `fail` response. The call is removed from
  /// the table on handler exit no matter what.
  fn spawn_dispatch(self: &Arc<Self>, call: Arc<Call>, target: Arc<dyn Dispatch>) {
    let connection = self.clone();
    let id = call.id();
    let dispatched = call.clone();
    let spawned = thread::Builder::new()
      .name(format!("call-dispatch-{id}"))
      .spawn(move || {
        if let Err(err) = target.dispatch(&connection, &dispatched) {
          let op = dispatched.message().op.as_deref().unwrap_or_default();
          warn!("Operation '{op}' failed: {err:#}");
          dispatched.fail(dispatch::error_payload(&err));
        }
        if !dispatched.closed() {
          dispatched.finish(Message::default());
        }
        connection.remove_call(id);
      });
    if let Err(err) = spawned {
      error!("Failed to spawn dispatch thread for call {id}: {err}");
      call.fail(Message::default().with_error("dispatch failed"));
      self.remove_call(id);
    }
  }

  fn remove_call(&self, id: u64) {
    self.calls.lock().remove(&id);
  }

  /// Tears the connection down. Idempotent: shuts the stream down (which
  /// unblocks the reader), closes every live call's queue without framing a
  /// terminal, and clears the call table.
  pub fn close(&self) {
    if self.closed.swap(true, Ordering::SeqCst) {
      return;
    }
    let _ = self.stream.shutdown(Shutdown::Both);
    let calls: Vec<Arc<Call>> = {
      let mut calls = self.calls.lock();
      calls.drain().map(|(_, call)| call).collect()
    };
    for call in calls {
      call.close();
    }
  }
}
