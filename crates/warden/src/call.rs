use crate::connection::Connection;
use crate::protocol::Message;
use anyhow::Result;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// Failure kinds callers need to tell apart when waiting on a call.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum CallError {
  #[error("timed out waiting for a response")]
  Timeout,
  #[error("connection closed before a terminal response")]
  Closed,
}

/// One in-flight request/response exchange on a connection.
///
/// The call owns the sender side of its response queue; closing the queue is
/// dropping that sender, which can happen at most once. On the caller side
/// the queue receives routed response frames; on the dispatch side it holds
/// outbound responses that a drain thread writes to the peer.
pub struct Call {
  id: u64,
  message: Message,
  queue_tx: Mutex<Option<Sender<Message>>>,
  queue_rx: Receiver<Message>,
}

impl Call {
  pub fn new(id: u64, message: Message) -> Arc<Self> {
    let (queue_tx, queue_rx) = unbounded();
    Arc::new(Self {
      id,
      message,
      queue_tx: Mutex::new(Some(queue_tx)),
      queue_rx,
    })
  }

  #[must_use]
  pub fn id(&self) -> u64 {
    self.id
  }

  /// The request that created this call.
  #[must_use]
  pub fn message(&self) -> &Message {
    &self.message
  }

  /// True once the queue has been closed by `finish`, `fail`, or `close`.
  #[must_use]
  pub fn closed(&self) -> bool {
    self.queue_tx.lock().is_none()
  }

  /// Enqueues a non-terminal response. Silently a no-op once closed; late
  /// pushes race with call teardown and must not error.
  pub fn push(&self, response: Message) {
    if let Some(queue_tx) = self.queue_tx.lock().as_ref() {
      let _ = queue_tx.send(response);
    }
  }

  /// Enqueues the terminal response and closes the queue. No-op if closed.
  pub fn finish(&self, mut response: Message) {
    let Some(queue_tx) = self.queue_tx.lock().take() else {
      return;
    };
    response.finished = Some(true);
    let _ = queue_tx.send(response);
  }

  /// Terminal failure: `finish` with `failed: true`.
  pub fn fail(&self, mut response: Message) {
    response.failed = Some(true);
    self.finish(response);
  }

  /// Closes the queue without framing a terminal response. Only used during
  /// connection teardown and forwarding.
  pub fn close(&self) {
    self.queue_tx.lock().take();
  }

  /// Removes the next response from the queue.
  ///
  /// Returns `Ok(None)` once the queue is closed and drained. With a timeout,
  /// returns `Err(CallError::Timeout)` when nothing arrived in time.
  pub fn pop(&self, timeout: Option<Duration>) -> Result<Option<Message>, CallError> {
    match timeout {
      None => Ok(self.queue_rx.recv().ok()),
      Some(limit) => match self.queue_rx.recv_timeout(limit) {
        Ok(message) => Ok(Some(message)),
        Err(RecvTimeoutError::Disconnected) => Ok(None),
        Err(RecvTimeoutError::Timeout) => Err(CallError::Timeout),
      },
    }
  }

  /// Delivers queued responses to `f` until the queue closes. With a
  /// timeout, stops with `CallError::Timeout` when nothing arrives in time.
  pub fn each(
    &self,
    timeout: Option<Duration>,
    mut f: impl FnMut(Message),
  ) -> Result<(), CallError> {
    while let Some(message) = self.pop(timeout)? {
      f(message);
    }
    Ok(())
  }

  /// Issues `operation` on `target` and pipes every response frame of the
  /// forwarded call (intermediates and the terminal alike) into this call's
  /// queue as it arrives, then closes this call's queue.
  ///
  /// Runs on the current thread until the forwarded call terminates. The
  /// originating caller still sees frames in real time: the connection's
  /// drain thread writes each piped frame immediately.
  pub fn forward(self: &Arc<Self>, target: &Arc<Connection>, operation: Message) -> Result<()> {
    let piped = self.clone();
    let result = target.call_stream(operation, None, move |response| {
      piped.push(response);
    });
    self.close();
    result
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn push_then_pop_preserves_order() {
    let call = Call::new(4, Message::request("memory_sample"));
    call.push(Message::default().with("n", 1));
    call.push(Message::default().with("n", 2));
    call.finish(Message::default().with("n", 3));

    let first = call.pop(None).unwrap().unwrap();
    assert_eq!(first.get("n"), Some(&json!(1)));
    let second = call.pop(None).unwrap().unwrap();
    assert_eq!(second.get("n"), Some(&json!(2)));
    let terminal = call.pop(None).unwrap().unwrap();
    assert!(terminal.is_terminal());
    assert_eq!(terminal.get("n"), Some(&json!(3)));
    assert!(call.pop(None).unwrap().is_none());
  }

  #[test]
  fn finish_closes_and_later_terminals_are_dropped() {
    let call = Call::new(0, Message::request("status"));
    call.finish(Message::default());
    assert!(call.closed());

    // A second terminal and late pushes disappear without error.
    call.finish(Message::default().with("late", true));
    call.push(Message::default().with("late", true));

    let terminal = call.pop(None).unwrap().unwrap();
    assert!(terminal.is_terminal());
    assert!(terminal.get("late").is_none());
    assert!(call.pop(None).unwrap().is_none());
  }

  #[test]
  fn fail_marks_the_terminal_response() {
    let call = Call::new(2, Message::request("status"));
    call.fail(Message::default().with_error("boom"));
    let terminal = call.pop(None).unwrap().unwrap();
    assert!(terminal.is_terminal());
    assert!(terminal.is_failed());
    assert_eq!(terminal.error, Some(json!("boom")));
  }

  #[test]
  fn close_frames_no_terminal() {
    let call = Call::new(6, Message::request("status"));
    call.push(Message::default().with("n", 1));
    call.close();
    assert!(call.closed());

    let intermediate = call.pop(None).unwrap().unwrap();
    assert!(!intermediate.is_terminal());
    assert!(call.pop(None).unwrap().is_none());
  }

  #[test]
  fn each_drains_until_close() {
    let call = Call::new(10, Message::request("drip"));
    call.push(Message::default().with("n", 1));
    call.push(Message::default().with("n", 2));
    call.finish(Message::default());

    let mut seen = Vec::new();
    call.each(None, |message| seen.push(message)).unwrap();
    assert_eq!(seen.len(), 3);
    assert!(seen[2].is_terminal());
  }

  #[test]
  fn pop_times_out_while_the_call_is_live() {
    let call = Call::new(8, Message::request("status"));
    let result = call.pop(Some(Duration::from_millis(10)));
    assert_eq!(result, Err(CallError::Timeout));

    call.close();
    assert_eq!(call.pop(Some(Duration::from_millis(10))), Ok(None));
  }
}
