//! OpenSSH-backed remote shell
//!
//! A single multiplexed master connection is opened by [`SshSession::connect`]
//! and reused for every command until [`SshSession::close`]. Commands run
//! through the local `ssh` client so existing agent, known_hosts and
//! `~/.ssh/config` settings apply.

use async_trait::async_trait;
use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::{CommandInput, RemoteCommand, RemoteCommandResult, RemoteShell};
use crate::DeployError;

/// Exit status the OpenSSH client uses for its own failures
const SSH_ERROR_STATUS: i32 = 255;

/// Connection settings for [`SshSession`]
#[derive(Debug, Clone)]
pub struct SshOptions {
    pub host: String,
    pub user: String,
    pub port: u16,
    pub identity_file: Option<PathBuf>,
    pub connect_timeout: Duration,
    /// Attempts made to establish the master connection
    pub connect_retries: u32,
    /// Local ssh client binary
    pub program: String,
}

impl SshOptions {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            user: "root".to_string(),
            port: 22,
            identity_file: None,
            connect_timeout: Duration::from_secs(10),
            connect_retries: 3,
            program: "ssh".to_string(),
        }
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_identity_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.identity_file = Some(path.into());
        self
    }

    /// Arguments shared by every invocation of the ssh client
    fn base_args(&self, control_path: &Path) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ControlPath={}", control_path.display()),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)),
            "-p".to_string(),
            self.port.to_string(),
            "-l".to_string(),
            self.user.clone(),
        ];

        if let Some(identity) = &self.identity_file {
            args.push("-i".to_string());
            args.push(identity.display().to_string());
        }

        args
    }
}

/// An open, multiplexed SSH connection to the cluster host
///
/// The connection lives from `connect` until `close` (or drop).
pub struct SshSession {
    options: SshOptions,
    // Holds the control socket; removed with the session
    _control_dir: TempDir,
    control_path: PathBuf,
    open: bool,
}

impl SshSession {
    /// Establish the master connection, retrying a bounded number of times
    pub async fn connect(options: SshOptions) -> Result<Self, DeployError> {
        let control_dir = tempfile::Builder::new()
            .prefix("proxmox-deploy-ssh-")
            .tempdir()
            .map_err(|e| DeployError::Connection(format!("failed to create control directory: {}", e)))?;
        let control_path = control_dir.path().join("master.sock");

        let attempts = options.connect_retries.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            info!(
                "Connecting to {}@{}:{} (attempt {}/{})",
                options.user, options.host, options.port, attempt, attempts
            );

            match open_master(&options, &control_path).await {
                Ok(()) => {
                    debug!("SSH master connection established");
                    return Ok(Self {
                        options,
                        _control_dir: control_dir,
                        control_path,
                        open: true,
                    });
                }
                Err(e) => {
                    warn!("SSH connection attempt {} failed: {}", attempt, e);
                    last_error = e;
                }
            }

            if attempt < attempts {
                tokio::time::sleep(Duration::from_secs(u64::from(attempt))).await;
            }
        }

        Err(DeployError::Connection(format!(
            "could not connect to {} after {} attempts: {}",
            options.host, attempts, last_error
        )))
    }

    /// Close the master connection
    pub async fn close(mut self) -> Result<(), DeployError> {
        self.open = false;

        let output = Command::new(&self.options.program)
            .args(self.options.base_args(&self.control_path))
            .args(["-O", "exit"])
            .arg(&self.options.host)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| DeployError::Connection(format!("failed to close ssh master: {}", e)))?;

        if !output.status.success() {
            debug!(
                "ssh -O exit reported: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        info!("Closed connection to {}", self.options.host);
        Ok(())
    }
}

async fn open_master(options: &SshOptions, control_path: &Path) -> Result<(), String> {
    let child = Command::new(&options.program)
        .args(options.base_args(control_path))
        .args(["-o", "ControlMaster=yes", "-o", "ControlPersist=yes", "-f", "-N"])
        .arg(&options.host)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| format!("failed to spawn {}: {}", options.program, e))?;

    // `-f` returns once authentication completed
    let wait = options.connect_timeout + Duration::from_secs(5);
    let output = tokio::time::timeout(wait, child.wait_with_output())
        .await
        .map_err(|_| format!("timed out after {:?}", wait))?
        .map_err(|e| e.to_string())?;

    if output.status.success() {
        Ok(())
    } else {
        Err(String::from_utf8_lossy(&output.stderr).trim().to_string())
    }
}

/// Whether a 255 exit came from the ssh client rather than the remote
/// command; `pvesh` also exits 255 on API errors
fn is_client_failure(stderr: &str) -> bool {
    const MARKERS: [&str; 6] = [
        "ssh:",
        "client_loop:",
        "mux_client",
        "Control socket",
        "Connection closed by",
        "kex_exchange_identification",
    ];

    stderr.lines().map(str::trim).any(|line| {
        MARKERS.iter().any(|m| line.starts_with(m))
            || (line.starts_with("Connection to ") && line.ends_with("closed."))
    })
}

async fn feed_input(mut stdin: tokio::process::ChildStdin, input: CommandInput) -> std::io::Result<u64> {
    let written = match input {
        CommandInput::None => 0,
        CommandInput::Bytes(data) => {
            stdin.write_all(&data).await?;
            data.len() as u64
        }
        CommandInput::File(path) => {
            let mut file = tokio::fs::File::open(&path).await?;
            tokio::io::copy(&mut file, &mut stdin).await?
        }
    };

    stdin.shutdown().await?;
    Ok(written)
}

#[async_trait]
impl RemoteShell for SshSession {
    fn host(&self) -> &str {
        &self.options.host
    }

    async fn run(&self, command: &RemoteCommand) -> Result<RemoteCommandResult, DeployError> {
        let line = command.command_line();
        debug!("Running remote command: {}", line);

        let has_input = command.input != CommandInput::None;
        let mut child = Command::new(&self.options.program)
            .args(self.options.base_args(&self.control_path))
            .arg(&self.options.host)
            .arg("--")
            .arg(&line)
            .stdin(if has_input { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| DeployError::Connection(format!("failed to spawn ssh: {}", e)))?;

        let writer = match child.stdin.take() {
            Some(stdin) => Some(tokio::spawn(feed_input(stdin, command.input.clone()))),
            None => None,
        };

        let output = tokio::time::timeout(command.timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                DeployError::Connection(format!(
                    "command timed out after {}s: {}",
                    command.timeout.as_secs(),
                    line
                ))
            })?
            .map_err(|e| DeployError::Connection(format!("lost ssh channel: {}", e)))?;

        if let Some(writer) = writer {
            match writer.await {
                Ok(Ok(bytes)) => debug!("Streamed {} bytes to remote command", bytes),
                // The remote side stopped reading; its exit status tells why
                Ok(Err(e)) if e.kind() == IoErrorKind::BrokenPipe => {}
                Ok(Err(e)) => return Err(DeployError::Transfer(format!("failed to stream input: {}", e))),
                Err(e) => return Err(DeployError::Transfer(format!("input writer panicked: {}", e))),
            }
        }

        let status = output
            .status
            .code()
            .ok_or_else(|| DeployError::Connection("ssh terminated by signal".into()))?;
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        if status == SSH_ERROR_STATUS && is_client_failure(&stderr) {
            return Err(DeployError::Connection(format!(
                "ssh channel to {} failed: {}",
                self.options.host,
                stderr.trim()
            )));
        }

        Ok(RemoteCommandResult {
            status,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr,
        })
    }
}

impl Drop for SshSession {
    fn drop(&mut self) {
        if !self.open {
            return;
        }

        // Best effort; the master would otherwise outlive the process
        let result = std::process::Command::new(&self.options.program)
            .args(self.options.base_args(&self.control_path))
            .args(["-O", "exit"])
            .arg(&self.options.host)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();

        if let Err(e) = result {
            debug!("Failed to stop ssh master on drop: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_args() {
        let options = SshOptions::new("pve1.example.com")
            .with_user("deploy")
            .with_port(2222)
            .with_identity_file("/home/deploy/.ssh/id_ed25519");

        let args = options.base_args(Path::new("/tmp/ctl/master.sock"));
        assert!(args.contains(&"ControlPath=/tmp/ctl/master.sock".to_string()));
        assert!(args.contains(&"BatchMode=yes".to_string()));
        assert!(args.windows(2).any(|w| w == ["-p", "2222"]));
        assert!(args.windows(2).any(|w| w == ["-l", "deploy"]));
        assert!(args.windows(2).any(|w| w == ["-i", "/home/deploy/.ssh/id_ed25519"]));
    }

    #[test]
    fn test_default_options() {
        let options = SshOptions::new("pve1");
        assert_eq!(options.user, "root");
        assert_eq!(options.port, 22);
        assert_eq!(options.connect_retries, 3);
        assert!(options.identity_file.is_none());
    }

    #[test]
    fn test_client_failure_detection() {
        assert!(is_client_failure("ssh: connect to host pve1 port 22: Connection refused\n"));
        assert!(is_client_failure("client_loop: send disconnect: Broken pipe\n"));
        assert!(is_client_failure("Connection to pve1 closed.\n"));
        assert!(!is_client_failure("unable to create VM 100 - VM 100 already exists on node 'pve2'\n"));
        assert!(!is_client_failure(""));
    }

    #[tokio::test]
    async fn test_connect_fails_with_missing_client() {
        let mut options = SshOptions::new("pve1");
        options.program = "/nonexistent/ssh-client".to_string();
        options.connect_retries = 1;

        let result = SshSession::connect(options).await;
        assert!(matches!(result, Err(DeployError::Connection(_))));
    }
}
