use crate::call::Call;
use crate::connection::Connection;
use anyhow::Result;
use std::sync::Arc;

pub mod memory;

/// Pluggable observer of the supervisor's connection lifecycle.
///
/// The server calls `register`/`remove` as workers come and go, lets each
/// monitor contribute intermediate frames to `status` calls, and runs each
/// monitor's `run` loop on its own thread. A monitor error is logged by the
/// server and never propagates to other monitors or to the accept loop.
pub trait Monitor: Send + Sync {
  /// A worker connection completed registration.
  fn register(&self, _connection: &Arc<Connection>) -> Result<()> {
    Ok(())
  }

  /// A registered connection went away.
  fn remove(&self, _connection: &Arc<Connection>) -> Result<()> {
    Ok(())
  }

  /// Contribute intermediate frames to a `status` call.
  fn status(&self, _call: &Arc<Call>) -> Result<()> {
    Ok(())
  }

  /// Long-running periodic loop. Called once, on a dedicated thread; must
  /// log failures and keep looping rather than exit.
  fn run(&self) {}
}
