use crate::call::Call;
use crate::connection::Connection;
use crate::protocol::Message;
use anyhow::{Result, bail};
use serde_json::{Value, json};
use std::sync::Arc;

/// Routes an inbound call to a handler.
///
/// Implementors match on the request's `do` value and route to concrete
/// methods; there is no reflective lookup. An unknown operation is reported
/// by returning an error, which the dispatching connection converts into a
/// `fail` response. Frames without `do` never reach a dispatch target; the
/// connection router drops them.
pub trait Dispatch: Send + Sync {
  fn dispatch(&self, connection: &Arc<Connection>, call: &Arc<Call>) -> Result<()>;
}

/// Dispatch target for endpoints that accept no inbound operations.
pub struct NoOperations;

impl Dispatch for NoOperations {
  fn dispatch(&self, _connection: &Arc<Connection>, call: &Arc<Call>) -> Result<()> {
    bail!(
      "unknown operation '{}'",
      call.message().op.as_deref().unwrap_or_default()
    )
  }
}

/// Renders a handler error as a `fail` payload.
///
/// The error detail is `{message, chain}` where `chain` lists the causes
/// from outermost context to root.
#[must_use]
pub fn error_payload(error: &anyhow::Error) -> Message {
  let chain: Vec<Value> = error
    .chain()
    .skip(1)
    .map(|cause| Value::String(cause.to_string()))
    .collect();
  Message::default().with_error(json!({
    "message": error.to_string(),
    "chain": chain,
  }))
}

#[cfg(test)]
mod tests {
  use super::*;
  use anyhow::anyhow;

  #[test]
  fn error_payload_carries_message_and_cause_chain() {
    let error = anyhow!("socket gone").context("write frame").context("register failed");
    let payload = error_payload(&error);
    let detail = payload.error.expect("error detail");
    assert_eq!(detail["message"], json!("register failed"));
    assert_eq!(detail["chain"], json!(["write frame", "socket gone"]));
  }

  #[test]
  fn error_payload_without_causes_has_empty_chain() {
    let error = anyhow!("plain failure");
    let payload = error_payload(&error);
    let detail = payload.error.expect("error detail");
    assert_eq!(detail["message"], json!("plain failure"));
    assert_eq!(detail["chain"], json!([]));
  }
}
