use crate::connection::{Connection, Role};
use crate::dispatch::NoOperations;
use crate::endpoint::Endpoint;
use crate::protocol::Message;
use anyhow::{Context, Result};
use log::debug;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Supervisor-side caller: dials the endpoint, runs a background reader,
/// and exposes the call API. Accepts no inbound operations; anything the
/// peer dispatches at it is failed as unknown.
///
/// This is the programmable boundary for tooling that wants to talk to a
/// running supervisor (status queries, forwards, restart requests).
pub struct Client {
  connection: Arc<Connection>,
  reader: Option<JoinHandle<()>>,
}

impl Client {
  pub fn connect(endpoint: &Endpoint) -> Result<Self> {
    let stream = endpoint.connect()?;
    let connection = Connection::new(stream, Role::Client)?;
    let reader_connection = connection.clone();
    let reader = thread::Builder::new()
      .name("client-reader".to_string())
      .spawn(move || {
        if let Err(err) = reader_connection.run(Arc::new(NoOperations)) {
          debug!("Client reader stopped: {err:#}");
        }
        reader_connection.close();
      })
      .context("spawn client reader thread")?;
    Ok(Self {
      connection,
      reader: Some(reader),
    })
  }

  #[must_use]
  pub fn connection(&self) -> &Arc<Connection> {
    &self.connection
  }

  /// Point query; returns the terminal response.
  pub fn call(&self, message: Message, timeout: Option<Duration>) -> Result<Message> {
    self.connection.call(message, timeout)
  }

  /// Streaming query; delivers every response frame, terminal last.
  pub fn call_stream(
    &self,
    message: Message,
    timeout: Option<Duration>,
    deliver: impl FnMut(Message),
  ) -> Result<()> {
    self.connection.call_stream(message, timeout, deliver)
  }
}

impl Drop for Client {
  fn drop(&mut self) {
    self.connection.close();
    if let Some(reader) = self.reader.take() {
      let _ = reader.join();
    }
  }
}
