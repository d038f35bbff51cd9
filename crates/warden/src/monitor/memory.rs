//! Memory policy: track each worker process's footprint and interrupt
//! offenders, optionally sampling them first so the logs show what grew.

use crate::call::Call;
use crate::connection::Connection;
use crate::monitor::Monitor;
use crate::protocol::Message;
use anyhow::Result;
use log::{debug, info, warn};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::fs;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// External per-process memory tracker the monitor drives.
///
/// Implementations decide what "too much" means. `check` invokes the
/// callback for every offending pid; a `true` return confirms the offender
/// was dealt with (signalled).
pub trait Cluster: Send + Sync {
  fn add(&self, pid: i32, limit: Option<u64>);
  fn remove(&self, pid: i32);
  fn check(&self, offender: &mut dyn FnMut(i32) -> bool);
  /// Current view of the tracked processes, for `status` reporting.
  fn snapshot(&self) -> Value;
}

/// Default cluster: flags processes whose resident set exceeds a per-process
/// byte limit, read from `/proc/<pid>/status`.
pub struct RssCluster {
  default_limit: Option<u64>,
  tracked: Mutex<HashMap<i32, Option<u64>>>,
}

impl RssCluster {
  #[must_use]
  pub fn new(default_limit: Option<u64>) -> Self {
    Self {
      default_limit,
      tracked: Mutex::new(HashMap::new()),
    }
  }
}

impl Cluster for RssCluster {
  fn add(&self, pid: i32, limit: Option<u64>) {
    self.tracked.lock().insert(pid, limit.or(self.default_limit));
  }

  fn remove(&self, pid: i32) {
    self.tracked.lock().remove(&pid);
  }

  fn check(&self, offender: &mut dyn FnMut(i32) -> bool) {
    let tracked: Vec<(i32, Option<u64>)> =
      self.tracked.lock().iter().map(|(pid, limit)| (*pid, *limit)).collect();
    for (pid, limit) in tracked {
      let Some(limit) = limit else { continue };
      match resident_bytes(pid) {
        Some(resident) if resident > limit => {
          warn!("Process {pid} resident set {resident} exceeds limit {limit}");
          offender(pid);
        }
        Some(_) => {}
        None => debug!("Process {pid} has no readable /proc entry"),
      }
    }
  }

  fn snapshot(&self) -> Value {
    let tracked = self.tracked.lock();
    let mut processes = Map::new();
    for (pid, limit) in tracked.iter() {
      processes.insert(
        pid.to_string(),
        json!({
          "limit": limit,
          "resident_bytes": resident_bytes(*pid),
        }),
      );
    }
    Value::Object(processes)
  }
}

/// Resident set size of `pid` in bytes, from `/proc/<pid>/status` (`VmRSS`).
fn resident_bytes(pid: i32) -> Option<u64> {
  let status = fs::read_to_string(format!("/proc/{pid}/status")).ok()?;
  for line in status.lines() {
    if let Some(rest) = line.strip_prefix("VmRSS:") {
      let kilobytes: u64 = rest.trim().trim_end_matches("kB").trim().parse().ok()?;
      return Some(kilobytes * 1024);
    }
  }
  None
}

/// Options for sampling an offender before it is interrupted.
#[derive(Debug, Clone)]
pub struct SampleOptions {
  /// Seconds the worker should sample for.
  pub duration: f64,
  /// How long to wait for the report.
  pub timeout: Duration,
}

/// Watches registered worker processes and interrupts the ones the cluster
/// flags. A process can hold several connections at once (restart overlap),
/// so connections are tracked per pid in an identity-keyed map.
///
/// One mutex serializes `register`, `remove`, and the periodic check; that
/// ordering edge is what keeps the cluster membership invariant (a pid is
/// tracked iff its connection set is non-empty) intact.
pub struct MemoryMonitor {
  interval: Duration,
  cluster: Arc<dyn Cluster>,
  limit: Option<u64>,
  sample: Option<SampleOptions>,
  processes: Mutex<HashMap<i32, HashMap<usize, Arc<Connection>>>>,
}

impl MemoryMonitor {
  #[must_use]
  pub fn new(interval: Duration, cluster: Arc<dyn Cluster>) -> Self {
    Self {
      interval,
      cluster,
      limit: None,
      sample: None,
      processes: Mutex::new(HashMap::new()),
    }
  }

  /// Per-process limit handed to the cluster at registration.
  #[must_use]
  pub fn with_limit(mut self, limit: u64) -> Self {
    self.limit = Some(limit);
    self
  }

  /// Sample offenders with `memory_sample` before interrupting them.
  #[must_use]
  pub fn with_sample(mut self, sample: SampleOptions) -> Self {
    self.sample = Some(sample);
    self
  }

  /// One check pass. Split out of `run` so tests can drive it directly.
  pub fn check(&self) {
    let processes = self.processes.lock();
    self.cluster.check(&mut |pid| {
      if let (Some(sample), Some(connections)) = (&self.sample, processes.get(&pid)) {
        for connection in connections.values() {
          let request = Message::request("memory_sample")
            .with("duration", sample.duration)
            .with("timeout", sample.timeout.as_secs_f64());
          match connection.call(request, Some(sample.timeout)) {
            Ok(report) => info!(
              "Memory sample for process {pid}: {}",
              serde_json::to_string(&report).unwrap_or_default()
            ),
            Err(err) => warn!("Memory sample for process {pid} failed: {err:#}"),
          }
        }
      }
      info!("Interrupting process {pid}");
      if let Err(err) = signal::kill(Pid::from_raw(pid), Signal::SIGINT) {
        warn!("Failed to signal process {pid}: {err}");
      }
      true
    });
  }
}

impl Monitor for MemoryMonitor {
  fn register(&self, connection: &Arc<Connection>) -> Result<()> {
    // A worker that registered no process id is simply not tracked.
    let Some(pid) = connection.process_id() else {
      return Ok(());
    };
    let mut processes = self.processes.lock();
    let connections = processes.entry(pid).or_default();
    let was_empty = connections.is_empty();
    connections.insert(Arc::as_ptr(connection) as usize, connection.clone());
    if was_empty {
      self.cluster.add(pid, self.limit);
    }
    Ok(())
  }

  fn remove(&self, connection: &Arc<Connection>) -> Result<()> {
    let Some(pid) = connection.process_id() else {
      return Ok(());
    };
    let mut processes = self.processes.lock();
    if let Some(connections) = processes.get_mut(&pid) {
      connections.remove(&(Arc::as_ptr(connection) as usize));
      if connections.is_empty() {
        processes.remove(&pid);
        self.cluster.remove(pid);
      }
    }
    Ok(())
  }

  fn status(&self, call: &Arc<Call>) -> Result<()> {
    call.push(Message::default().with("memory_monitor", self.cluster.snapshot()));
    Ok(())
  }

  fn run(&self) {
    loop {
      thread::sleep(self.interval);
      self.check();
    }
  }
}
