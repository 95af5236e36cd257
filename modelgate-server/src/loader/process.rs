//! Backend subprocess management.
//!
//! One process per loaded model. The process is handed its listen address
//! via `--addr` and inherits the gateway environment plus model-specific
//! keys. Teardown escalates: Shutdown RPC first (caller's job), then
//! SIGTERM, then SIGKILL.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::sync::Mutex;

use crate::error::{Error, Result};

pub struct BackendProcess {
    child: Mutex<Option<Child>>,
    pid: Option<u32>,
}

impl BackendProcess {
    /// Spawn a backend executable listening on `address`.
    pub fn spawn(
        executable: &Path,
        address: &str,
        environment: &HashMap<String, String>,
        log_output: bool,
    ) -> Result<Self> {
        ensure_executable(executable)?;

        let mut cmd = Command::new(executable);
        cmd.arg("--addr")
            .arg(address)
            .envs(environment)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        if let Some(dir) = executable.parent() {
            cmd.current_dir(dir);
        }

        if log_output {
            cmd.stdout(Stdio::inherit()).stderr(Stdio::inherit());
        } else {
            cmd.stdout(Stdio::null()).stderr(Stdio::null());
        }

        let child = cmd.spawn().map_err(|e| {
            Error::BackendLoadFailed(format!(
                "failed to spawn {}: {}",
                executable.display(),
                e
            ))
        })?;
        let pid = child.id();

        tracing::info!(
            executable = %executable.display(),
            address = %address,
            pid = ?pid,
            "spawned backend process"
        );

        Ok(Self {
            child: Mutex::new(Some(child)),
            pid,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// True while the OS still reports the child as running.
    pub async fn is_alive(&self) -> bool {
        let mut child = self.child.lock().await;
        match child.as_mut() {
            Some(c) => matches!(c.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// SIGTERM, wait up to `grace`, then SIGKILL. Returns once the OS has
    /// reported the exit.
    pub async fn terminate(&self, grace: Duration) {
        let mut guard = self.child.lock().await;
        let mut child = match guard.take() {
            Some(c) => c,
            None => return,
        };

        #[cfg(unix)]
        {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;

            if let Some(pid) = child.id() {
                let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
            }
        }

        match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!(pid = ?self.pid, status = %status, "backend process exited");
            }
            Ok(Err(e)) => {
                tracing::warn!(pid = ?self.pid, error = %e, "error waiting for backend process");
            }
            Err(_) => {
                tracing::warn!(pid = ?self.pid, "backend process ignored SIGTERM, killing");
                let _ = child.kill().await;
                let _ = child.wait().await;
            }
        }
    }
}

/// Make sure the entry point has an executable bit; installed archives do
/// not always preserve permissions.
fn ensure_executable(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;

        let metadata = std::fs::metadata(path)?;
        let mode = metadata.permissions().mode();
        if mode & 0o111 == 0 {
            tracing::debug!(path = %path.display(), "adding executable bit");
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))?;
        }
    }
    let _ = path;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[cfg(unix)]
    fn write_script(dir: &TempDir, body: &str) -> std::path::PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.path().join("backend");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawn_and_terminate() {
        let tmp = TempDir::new().unwrap();
        let script = write_script(&tmp, "sleep 30");

        let process =
            BackendProcess::spawn(&script, "127.0.0.1:19999", &HashMap::new(), false).unwrap();
        assert!(process.is_alive().await);

        process.terminate(Duration::from_secs(2)).await;
        assert!(!process.is_alive().await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_terminate_reports_exit_of_short_lived_process() {
        let tmp = TempDir::new().unwrap();
        let script = write_script(&tmp, "exit 0");

        let process =
            BackendProcess::spawn(&script, "127.0.0.1:19998", &HashMap::new(), false).unwrap();
        // Let it exit on its own, then terminate must be a no-op.
        tokio::time::sleep(Duration::from_millis(200)).await;
        process.terminate(Duration::from_secs(1)).await;
        assert!(!process.is_alive().await);
    }

    #[test]
    fn test_spawn_missing_executable() {
        let result = BackendProcess::spawn(
            Path::new("/nonexistent/backend"),
            "127.0.0.1:1",
            &HashMap::new(),
            false,
        );
        assert!(result.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_ensure_executable_fixes_mode() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("backend");
        std::fs::write(&path, "#!/bin/sh\nexit 0\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600)).unwrap();

        ensure_executable(&path).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert!(mode & 0o100 != 0);
    }
}
