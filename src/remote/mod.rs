//! Remote command execution on the cluster host
//!
//! Every privileged operation is expressed as a single [`RemoteCommand`]
//! run through a [`RemoteShell`]. A command that runs but exits non-zero is
//! returned as a normal [`RemoteCommandResult`]; only a channel that cannot
//! be established, drops, or times out is an error.

pub mod mock;
pub mod ssh;

use async_trait::async_trait;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::DeployError;

pub use ssh::{SshOptions, SshSession};

/// Default timeout applied to remote commands
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(600);

/// Trait for executing commands on the cluster host
///
/// Implementations must not retry commands: some of them (storage
/// allocation, VM creation) are not safe to repeat blindly.
#[async_trait]
pub trait RemoteShell: Send + Sync {
    /// Host this shell is connected to
    fn host(&self) -> &str;

    /// Run a command, waiting at most `command.timeout`
    ///
    /// A timeout is reported as [`DeployError::Connection`].
    async fn run(&self, command: &RemoteCommand) -> Result<RemoteCommandResult, DeployError>;
}

/// Data fed to a remote command's standard input
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum CommandInput {
    #[default]
    None,
    /// Small in-memory payload
    Bytes(Vec<u8>),
    /// Local file, streamed without loading it into memory
    File(PathBuf),
}

/// A single remote command invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCommand {
    pub program: String,
    pub args: Vec<String>,
    pub input: CommandInput,
    pub timeout: Duration,
}

impl RemoteCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            input: CommandInput::None,
            timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Stream a local file into the command's standard input
    pub fn input_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.input = CommandInput::File(path.into());
        self
    }

    pub fn input_bytes(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.input = CommandInput::Bytes(data.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Render the command as a single line for the remote shell, each word quoted
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .map(shell_quote)
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl fmt::Display for RemoteCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.command_line())
    }
}

/// Outcome of a remote command that ran to completion
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteCommandResult {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl RemoteCommandResult {
    /// Successful result with the given stdout
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            status: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Failed result with the given exit status and stderr
    pub fn failed(status: i32, stderr: impl Into<String>) -> Self {
        Self {
            status,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.status == 0
    }

    /// Last non-empty line of stderr, which carries the reason for most
    /// Proxmox CLI failures
    pub fn reason(&self) -> String {
        let reason = self
            .stderr
            .lines()
            .rev()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .unwrap_or_default();

        if reason.is_empty() {
            format!("exit status {}", self.status)
        } else {
            reason.to_string()
        }
    }

    /// Turn a non-zero exit status into an error built by `err`
    pub fn check<F>(self, err: F) -> Result<Self, DeployError>
    where
        F: FnOnce(&Self) -> DeployError,
    {
        if self.success() { Ok(self) } else { Err(err(&self)) }
    }
}

/// Quote a word for a POSIX shell
///
/// Words made only of safe characters are left as-is so logged command
/// lines stay readable.
pub fn shell_quote(word: &str) -> String {
    let safe = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=,@%+".contains(c));

    if safe {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("pvesm"), "pvesm");
        assert_eq!(shell_quote("local-lvm:vm-100-base-disk"), "local-lvm:vm-100-base-disk");
        assert_eq!(shell_quote("my image.img"), "'my image.img'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
        assert_eq!(shell_quote("$(reboot)"), "'$(reboot)'");
    }

    #[test]
    fn test_command_line() {
        let cmd = RemoteCommand::new("pvesm")
            .arg("alloc")
            .args(["local", "100", "vm-100-base disk.qcow2"]);
        assert_eq!(cmd.command_line(), "pvesm alloc local 100 'vm-100-base disk.qcow2'");
        assert_eq!(cmd.timeout, DEFAULT_COMMAND_TIMEOUT);
    }

    #[test]
    fn test_result_reason() {
        let result = RemoteCommandResult::failed(2, "warning\nstorage 'x' does not exist\n\n");
        assert_eq!(result.reason(), "storage 'x' does not exist");

        let result = RemoteCommandResult::failed(5, "");
        assert_eq!(result.reason(), "exit status 5");
    }

    #[test]
    fn test_result_check() {
        let ok = RemoteCommandResult::ok("done").check(|r| DeployError::Api(r.reason()));
        assert_eq!(ok.unwrap().stdout, "done");

        let err = RemoteCommandResult::failed(1, "boom").check(|r| DeployError::Api(r.reason()));
        assert!(matches!(err, Err(DeployError::Api(m)) if m == "boom"));
    }
}
