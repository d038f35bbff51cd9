//! Diagnostic operation handlers hosted by workers.
//!
//! Every handler follows one dump convention: a `path` parameter writes the
//! output to that file and finishes with `{path}`; a `log` parameter (a
//! label) logs the buffered output and finishes empty; neither buffers the
//! output into the terminal response as `{data}`. The producers read the
//! kernel's own account of the process under `/proc`.

use crate::call::Call;
use crate::protocol::Message;
use anyhow::{Context, Result, bail};
use log::info;
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Where a dump handler sends its output.
enum DumpTarget {
  Path(PathBuf),
  Log(String),
  Buffer,
}

impl DumpTarget {
  fn from_call(call: &Call) -> Self {
    let message = call.message();
    if let Some(path) = message.get("path").and_then(Value::as_str) {
      DumpTarget::Path(PathBuf::from(path))
    } else if let Some(label) = message.get("log").and_then(Value::as_str) {
      DumpTarget::Log(label.to_string())
    } else {
      DumpTarget::Buffer
    }
  }

  fn deliver_text(self, call: &Arc<Call>, data: String) -> Result<()> {
    match self {
      DumpTarget::Path(path) => {
        fs::write(&path, data).with_context(|| format!("write dump to {}", path.display()))?;
        call.finish(Message::default().with("path", path.display().to_string()));
      }
      DumpTarget::Log(label) => {
        info!("{label}:\n{data}");
        call.finish(Message::default());
      }
      DumpTarget::Buffer => {
        call.finish(Message::default().with("data", data));
      }
    }
    Ok(())
  }

  fn deliver_report(self, call: &Arc<Call>, report: Value) -> Result<()> {
    match self {
      DumpTarget::Path(path) => {
        let rendered = serde_json::to_string_pretty(&report).context("encode report")?;
        fs::write(&path, rendered)
          .with_context(|| format!("write report to {}", path.display()))?;
        call.finish(Message::default().with("path", path.display().to_string()));
      }
      DumpTarget::Log(label) => {
        info!("{label}: {report}");
        call.finish(Message::default());
      }
      DumpTarget::Buffer => {
        call.finish(Message::default().with("data", report));
      }
    }
    Ok(())
  }
}

/// Resident and virtual size of this process, in bytes.
#[derive(Debug, Clone, Copy)]
struct MemoryUsage {
  resident: u64,
  vsize: u64,
}

fn self_usage() -> Result<MemoryUsage> {
  let status = fs::read_to_string("/proc/self/status").context("read /proc/self/status")?;
  let mut resident = None;
  let mut vsize = None;
  for line in status.lines() {
    if let Some(rest) = line.strip_prefix("VmRSS:") {
      resident = parse_kilobytes(rest);
    } else if let Some(rest) = line.strip_prefix("VmSize:") {
      vsize = parse_kilobytes(rest);
    }
  }
  match (resident, vsize) {
    (Some(resident), Some(vsize)) => Ok(MemoryUsage { resident, vsize }),
    _ => bail!("missing VmRSS/VmSize in /proc/self/status"),
  }
}

fn parse_kilobytes(field: &str) -> Option<u64> {
  let kilobytes: u64 = field.trim().trim_end_matches("kB").trim().parse().ok()?;
  Some(kilobytes * 1024)
}

/// The scheduler's own account of this process: `/proc/self/sched` plus the
/// context-switch counters from `/proc/self/status`.
pub fn scheduler_dump(call: &Arc<Call>) -> Result<()> {
  let target = DumpTarget::from_call(call);
  let mut report = String::new();
  if let Ok(sched) = fs::read_to_string("/proc/self/sched") {
    report.push_str(&sched);
  }
  if let Ok(status) = fs::read_to_string("/proc/self/status") {
    for line in status.lines() {
      if line.starts_with("Threads:") || line.contains("ctxt_switches") {
        report.push_str(line);
        report.push('\n');
      }
    }
  }
  if report.is_empty() {
    bail!("scheduler information unavailable");
  }
  target.deliver_text(call, report)
}

/// One section per thread of this process, from `/proc/self/task`.
pub fn thread_dump(call: &Arc<Call>) -> Result<()> {
  let target = DumpTarget::from_call(call);
  let mut report = String::new();
  let tasks = fs::read_dir("/proc/self/task").context("read /proc/self/task")?;
  for entry in tasks {
    let entry = entry.context("read task entry")?;
    let tid = entry.file_name().to_string_lossy().into_owned();
    let name = fs::read_to_string(entry.path().join("comm")).unwrap_or_default();
    let state = fs::read_to_string(entry.path().join("status"))
      .ok()
      .and_then(|status| {
        status
          .lines()
          .find(|line| line.starts_with("State:"))
          .map(|line| line.trim_start_matches("State:").trim().to_string())
      })
      .unwrap_or_default();
    report.push_str(&format!("thread {tid} [{}] {state}\n", name.trim()));
    // Kernel stacks are root-only on most systems; include them when we can.
    if let Ok(stack) = fs::read_to_string(entry.path().join("stack")) {
      for line in stack.lines() {
        report.push_str("  ");
        report.push_str(line);
        report.push('\n');
      }
    }
  }
  target.deliver_text(call, report)
}

/// Full memory map dump from `/proc/self/smaps`. Output is large, so
/// buffered mode is refused; callers must supply `path` or `log`.
pub fn memory_dump(call: &Arc<Call>) -> Result<()> {
  let target = DumpTarget::from_call(call);
  if matches!(target, DumpTarget::Buffer) {
    bail!("memory_dump requires a 'path' or 'log' target");
  }
  let data = fs::read_to_string("/proc/self/smaps").context("read /proc/self/smaps")?;
  target.deliver_text(call, data)
}

/// Samples resident and virtual size for `duration` seconds and reports the
/// aggregates. `duration` must be positive.
pub fn memory_sample(call: &Arc<Call>) -> Result<()> {
  let duration = call
    .message()
    .get("duration")
    .and_then(Value::as_f64)
    .unwrap_or_default();
  if !duration.is_finite() || duration <= 0.0 {
    bail!("memory_sample requires a positive 'duration'");
  }
  let target = DumpTarget::from_call(call);

  let interval = Duration::from_millis(100).min(Duration::from_secs_f64(duration));
  let deadline = Instant::now() + Duration::from_secs_f64(duration);
  let mut resident = Vec::new();
  let mut vsize = Vec::new();
  loop {
    let usage = self_usage()?;
    resident.push(usage.resident);
    vsize.push(usage.vsize);
    if Instant::now() >= deadline {
      break;
    }
    thread::sleep(interval);
  }

  let report = json!({
    "duration": duration,
    "interval": interval.as_secs_f64(),
    "samples": resident.len(),
    "resident_bytes": series_summary(&resident),
    "virtual_bytes": series_summary(&vsize),
  });
  target.deliver_report(call, report)
}

fn series_summary(samples: &[u64]) -> Value {
  let first = samples.first().copied().unwrap_or_default();
  let last = samples.last().copied().unwrap_or_default();
  let min = samples.iter().min().copied().unwrap_or_default();
  let max = samples.iter().max().copied().unwrap_or_default();
  let mean = if samples.is_empty() {
    0
  } else {
    samples.iter().sum::<u64>() / samples.len() as u64
  };
  json!({
    "first": first,
    "last": last,
    "min": min,
    "max": max,
    "mean": mean,
    "delta": last as i64 - first as i64,
  })
}

/// Allocation profile session: captures a baseline at start and reports the
/// growth since then at stop.
#[derive(Default)]
pub struct AllocationProfile {
  baseline: Mutex<Option<Baseline>>,
}

struct Baseline {
  started: Instant,
  usage: MemoryUsage,
}

impl AllocationProfile {
  pub fn start(&self, call: &Arc<Call>) -> Result<()> {
    let mut baseline = self.baseline.lock();
    if baseline.is_some() {
      bail!("allocation profile already running");
    }
    *baseline = Some(Baseline {
      started: Instant::now(),
      usage: self_usage()?,
    });
    call.finish(Message::default().with("started", true));
    Ok(())
  }

  pub fn stop(&self, call: &Arc<Call>) -> Result<()> {
    let Some(baseline) = self.baseline.lock().take() else {
      bail!("no allocation profile running");
    };
    let target = DumpTarget::from_call(call);
    let usage = self_usage()?;
    let report = json!({
      "elapsed": baseline.started.elapsed().as_secs_f64(),
      "resident_bytes": {
        "start": baseline.usage.resident,
        "end": usage.resident,
        "delta": usage.resident as i64 - baseline.usage.resident as i64,
      },
      "virtual_bytes": {
        "start": baseline.usage.vsize,
        "end": usage.vsize,
        "delta": usage.vsize as i64 - baseline.usage.vsize as i64,
      },
    });
    target.deliver_report(call, report)
  }
}
