use anyhow::{Context, Result};
use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::io::{BufRead, BufReader, Read, Write};

/// One frame on the wire: a JSON object followed by a newline.
///
/// The recognized fields are typed; everything else (operation parameters on
/// requests, result payloads on responses) lands in the flattened `fields`
/// map. Absent optional fields are not serialized, so a plain response frame
/// is exactly `{"id":N,...payload}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Message {
  /// Identifies the call this frame belongs to, unique per connection.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub id: Option<u64>,
  /// Operation name. Present on requests only; its presence is what
  /// distinguishes a request from a response.
  #[serde(rename = "do", default, skip_serializing_if = "Option::is_none")]
  pub op: Option<String>,
  /// Terminal response marker.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub finished: Option<bool>,
  /// Set on a terminal response that carries an error.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub failed: Option<bool>,
  /// Error detail when `failed`.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub error: Option<Value>,
  /// Operation parameters or result payload.
  #[serde(flatten)]
  pub fields: Map<String, Value>,
}

impl Message {
  /// A request frame for the given operation.
  #[must_use]
  pub fn request(op: impl Into<String>) -> Self {
    Self {
      op: Some(op.into()),
      ..Self::default()
    }
  }

  /// Adds a payload field.
  #[must_use]
  pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
    self.fields.insert(key.into(), value.into());
    self
  }

  /// Sets the error detail.
  #[must_use]
  pub fn with_error(mut self, error: impl Into<Value>) -> Self {
    self.error = Some(error.into());
    self
  }

  #[must_use]
  pub fn get(&self, key: &str) -> Option<&Value> {
    self.fields.get(key)
  }

  /// True for frames that carry an operation name.
  #[must_use]
  pub fn is_request(&self) -> bool {
    self.op.is_some()
  }

  /// True for the final response of a call.
  #[must_use]
  pub fn is_terminal(&self) -> bool {
    self.finished == Some(true)
  }

  #[must_use]
  pub fn is_failed(&self) -> bool {
    self.failed == Some(true)
  }
}

/// Writes one framed message: serialized JSON, a newline, then a flush.
pub fn write_message<W: Write>(mut writer: W, message: &Message) -> Result<()> {
  let mut line = serde_json::to_string(message).context("encode message as JSON")?;
  line.push('\n');
  writer
    .write_all(line.as_bytes())
    .context("write message frame")?;
  writer.flush().context("flush message frame")?;
  Ok(())
}

/// Reads newline-delimited messages from a byte stream.
///
/// Malformed lines are logged at warn level and skipped; frames are
/// self-delimited, so one bad line never corrupts the next. EOF yields
/// `Ok(None)`; I/O errors are returned to the caller.
pub struct MessageReader<R> {
  inner: BufReader<R>,
}

impl<R: Read> MessageReader<R> {
  pub fn new(inner: R) -> Self {
    Self {
      inner: BufReader::new(inner),
    }
  }

  /// Returns the next well-formed message, or `None` at end of stream.
  pub fn read(&mut self) -> std::io::Result<Option<Message>> {
    loop {
      let mut line = String::new();
      let bytes_read = self.inner.read_line(&mut line)?;
      if bytes_read == 0 {
        return Ok(None);
      }
      let line = line.trim();
      if line.is_empty() {
        continue;
      }
      match serde_json::from_str::<Message>(line) {
        Ok(message) => return Ok(Some(message)),
        Err(err) => {
          warn!("Discarding malformed frame: {err}");
        }
      }
    }
  }
}
