//! `nvidia-smi` process executor.

use std::io::Read;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::{DEVICE_INDEX_PARAMETER, DeviceQueryExecutor};
use crate::error::ExecError;

/// Interval between child exit checks while waiting with a timeout.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Settings for running `nvidia-smi`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NvidiaSmiConfig {
    /// Path to the binary. Resolved through `PATH` when relative.
    pub binary: PathBuf,
    /// Kill the process if it runs longer than this. `None` waits forever.
    pub timeout: Option<Duration>,
}

impl Default for NvidiaSmiConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("nvidia-smi"),
            timeout: Some(Duration::from_secs(10)),
        }
    }
}

impl NvidiaSmiConfig {
    pub fn with_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.binary = binary.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Executor that runs `nvidia-smi --query-gpu=... --format=csv,noheader`.
#[derive(Debug, Clone, Default)]
pub struct NvidiaSmi {
    config: NvidiaSmiConfig,
}

impl NvidiaSmi {
    pub fn new(config: NvidiaSmiConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &NvidiaSmiConfig {
        &self.config
    }

    fn run(&self, args: &[String]) -> Result<String, ExecError> {
        let binary = &self.config.binary;
        debug!(binary = %binary.display(), ?args, "running query tool");

        let mut child = Command::new(binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| ExecError::Spawn(format!("{}: {}", binary.display(), e)))?;

        // Drain pipes concurrently so a chatty child cannot block on a full pipe.
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let status = match self.config.timeout {
            Some(timeout) => wait_with_timeout(&mut child, timeout)?,
            None => child
                .wait()
                .map_err(|e| ExecError::Spawn(format!("wait failed: {}", e)))?,
        };

        let stdout = collect(stdout);
        let stderr = collect(stderr);

        if !status.success() {
            let stderr = String::from_utf8_lossy(&stderr).trim().to_string();
            return Err(ExecError::NonZeroExit {
                status: status.to_string(),
                stderr,
            });
        }

        String::from_utf8(stdout).map_err(|e| ExecError::Output(e.to_string()))
    }
}

impl DeviceQueryExecutor for NvidiaSmi {
    fn list_device_indices(&self) -> Result<String, ExecError> {
        self.run(&[
            format!("--query-gpu={}", DEVICE_INDEX_PARAMETER),
            "--format=csv,noheader".to_string(),
        ])
    }

    fn query(&self, parameters: &[&str], device: Option<u32>) -> Result<String, ExecError> {
        let mut args = vec![format!("--query-gpu={}", parameters.join(","))];
        if let Some(device) = device {
            args.push(format!("--id={}", device));
        }
        args.push("--format=csv,noheader,nounits".to_string());
        self.run(&args)
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<JoinHandle<Vec<u8>>> {
    pipe.map(|mut pipe| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf);
            buf
        })
    })
}

fn collect(handle: Option<JoinHandle<Vec<u8>>>) -> Vec<u8> {
    handle.and_then(|h| h.join().ok()).unwrap_or_default()
}

fn wait_with_timeout(
    child: &mut Child,
    timeout: Duration,
) -> Result<std::process::ExitStatus, ExecError> {
    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Ok(status),
            Ok(None) if Instant::now() >= deadline => {
                warn!(timeout_ms = timeout.as_millis() as u64, "query tool timed out, killing");
                let _ = child.kill();
                let _ = child.wait();
                return Err(ExecError::Timeout(timeout));
            }
            Ok(None) => thread::sleep(POLL_INTERVAL),
            Err(e) => return Err(ExecError::Spawn(format!("wait failed: {}", e))),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    /// Writes an executable shell script standing in for `nvidia-smi`.
    fn fake_tool(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("nvidia-smi");
        fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[test]
    fn test_query_passes_arguments() {
        let dir = tempfile::tempdir().unwrap();
        let binary = fake_tool(dir.path(), "echo \"$@\"");
        let smi = NvidiaSmi::new(NvidiaSmiConfig::default().with_binary(binary));

        let output = smi.query(&["memory.used", "index"], Some(1)).unwrap();
        assert_eq!(
            output.trim(),
            "--query-gpu=memory.used,index --id=1 --format=csv,noheader,nounits"
        );

        let output = smi.list_device_indices().unwrap();
        assert_eq!(output.trim(), "--query-gpu=index --format=csv,noheader");
    }

    #[test]
    fn test_non_zero_exit() {
        let dir = tempfile::tempdir().unwrap();
        let binary = fake_tool(dir.path(), "echo 'NVIDIA-SMI has failed' >&2\nexit 9");
        let smi = NvidiaSmi::new(NvidiaSmiConfig::default().with_binary(binary));

        match smi.query(&["index"], None) {
            Err(ExecError::NonZeroExit { stderr, .. }) => {
                assert_eq!(stderr, "NVIDIA-SMI has failed");
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_timeout_kills_child() {
        let dir = tempfile::tempdir().unwrap();
        let binary = fake_tool(dir.path(), "exec sleep 5");
        let timeout = Duration::from_millis(100);
        let smi = NvidiaSmi::new(
            NvidiaSmiConfig::default()
                .with_binary(binary)
                .with_timeout(Some(timeout)),
        );

        let start = Instant::now();
        assert_eq!(smi.query(&["index"], None), Err(ExecError::Timeout(timeout)));
        assert!(start.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn test_missing_binary() {
        let smi = NvidiaSmi::new(
            NvidiaSmiConfig::default().with_binary("/nonexistent/path/nvidia-smi"),
        );
        assert!(matches!(
            smi.list_device_indices(),
            Err(ExecError::Spawn(_))
        ));
    }
}
