use anyhow::{Context, Result};
use log::info;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};

/// Default socket path, relative to the service root.
pub const DEFAULT_SOCKET_PATH: &str = "./supervisor.ipc";

/// Address of the supervisor socket: binds for the server, dials for
/// clients and workers. Trust is filesystem permissions on the socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
  path: PathBuf,
}

impl Default for Endpoint {
  fn default() -> Self {
    Self::new(DEFAULT_SOCKET_PATH)
  }
}

impl Endpoint {
  pub fn new(path: impl Into<PathBuf>) -> Self {
    Self { path: path.into() }
  }

  #[must_use]
  pub fn path(&self) -> &Path {
    &self.path
  }

  /// Binds the listener, replacing a stale socket file from a previous run.
  /// The parent directory is created with mode 0700 when missing. Logs
  /// readiness once bound; the host's readiness probe keys off that.
  pub fn bind(&self) -> Result<UnixListener> {
    if let Some(dir) = self.path.parent()
      && !dir.as_os_str().is_empty()
    {
      let _ = fs::create_dir_all(dir);
      let _ = fs::set_permissions(dir, fs::Permissions::from_mode(0o700));
    }
    if self.path.exists() {
      // Best-effort remove stale
      let _ = fs::remove_file(&self.path);
    }
    let listener = UnixListener::bind(&self.path)
      .with_context(|| format!("failed to bind {}", self.path.display()))?;
    info!("Listening on {}", self.path.display());
    Ok(listener)
  }

  pub fn connect(&self) -> Result<UnixStream> {
    UnixStream::connect(&self.path)
      .with_context(|| format!("failed to connect to supervisor socket {}", self.path.display()))
  }
}
