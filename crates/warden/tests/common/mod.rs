use std::time::{Duration, Instant};
use warden::Endpoint;

/// Capture crate logs in test output.
pub fn init_logs() {
  let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug"))
    .is_test(true)
    .try_init();
}

/// Poll a condition repeatedly until it returns true or times out.
/// Returns true if condition met, false on timeout.
pub fn wait_for(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
  let start = Instant::now();
  loop {
    if check() {
      return true;
    }
    if start.elapsed() >= deadline {
      return false;
    }
    std::thread::sleep(Duration::from_millis(20));
  }
}

/// An endpoint on a fresh temporary directory. Keep the directory alive for
/// the duration of the test.
pub fn temp_endpoint() -> (tempfile::TempDir, Endpoint) {
  let dir = tempfile::tempdir().expect("temp dir");
  let endpoint = Endpoint::new(dir.path().join("supervisor.ipc"));
  (dir, endpoint)
}

/// Block until the server behind `endpoint` accepts connections.
pub fn wait_until_accepting(endpoint: &Endpoint) {
  let endpoint = endpoint.clone();
  assert!(
    wait_for(Duration::from_secs(5), move || endpoint.connect().is_ok()),
    "server did not come up"
  );
}
