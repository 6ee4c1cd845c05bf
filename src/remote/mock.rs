//! Mock remote shell for testing
//!
//! Provides a scripted [`RemoteShell`] that records every command line it
//! receives and answers with canned results.

use async_trait::async_trait;
use std::sync::Mutex;
use std::time::Duration;

use super::{CommandInput, RemoteCommand, RemoteCommandResult, RemoteShell};
use crate::DeployError;

#[derive(Debug, Clone)]
enum Response {
    Result(RemoteCommandResult),
    ConnectionError(String),
}

#[derive(Debug, Clone)]
struct Rule {
    pattern: String,
    response: Response,
    delay: Option<Duration>,
    once: bool,
}

/// Mock remote shell for testing
///
/// Rules match when their pattern is a substring of the quoted command
/// line. The most recently added matching rule wins; commands matching no
/// rule succeed with empty output.
///
/// # Example
/// ```
/// use proxmox_deploy_rs::remote::mock::MockShell;
/// use proxmox_deploy_rs::remote::RemoteCommandResult;
///
/// let shell = MockShell::new()
///     .on("pvesh get /cluster/nextid", RemoteCommandResult::ok("\"100\"\n"))
///     .on("pvesm alloc", RemoteCommandResult::failed(255, "no space left"));
/// ```
#[derive(Debug)]
pub struct MockShell {
    host: String,
    rules: Mutex<Vec<Rule>>,
    history: Mutex<Vec<(String, CommandInput, Duration)>>,
}

impl MockShell {
    pub fn new() -> Self {
        Self {
            host: "mock-host".to_string(),
            rules: Mutex::new(Vec::new()),
            history: Mutex::new(Vec::new()),
        }
    }

    /// Set the reported host name
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Answer commands containing `pattern` with `result`
    pub fn on(self, pattern: impl Into<String>, result: RemoteCommandResult) -> Self {
        self.push(pattern, Response::Result(result), None, false)
    }

    /// Like [`MockShell::on`], but the rule is used only once
    pub fn on_once(self, pattern: impl Into<String>, result: RemoteCommandResult) -> Self {
        self.push(pattern, Response::Result(result), None, true)
    }

    /// Answer after `delay`; a delay longer than the command timeout
    /// surfaces as a connection error
    pub fn on_delayed(
        self,
        pattern: impl Into<String>,
        result: RemoteCommandResult,
        delay: Duration,
    ) -> Self {
        self.push(pattern, Response::Result(result), Some(delay), false)
    }

    /// Fail commands containing `pattern` as if the channel dropped
    pub fn on_connection_error(self, pattern: impl Into<String>, message: impl Into<String>) -> Self {
        self.push(pattern, Response::ConnectionError(message.into()), None, false)
    }

    fn push(self, pattern: impl Into<String>, response: Response, delay: Option<Duration>, once: bool) -> Self {
        self.rules
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Rule {
                pattern: pattern.into(),
                response,
                delay,
                once,
            });
        self
    }

    /// Command lines received so far, in order
    pub fn commands(&self) -> Vec<String> {
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(line, _, _)| line.clone())
            .collect()
    }

    /// Inputs attached to the commands received so far
    pub fn inputs(&self) -> Vec<CommandInput> {
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, input, _)| input.clone())
            .collect()
    }

    /// Timeouts of the commands received so far
    pub fn timeouts(&self) -> Vec<Duration> {
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, _, timeout)| *timeout)
            .collect()
    }

    /// Number of received commands containing `pattern`
    pub fn count(&self, pattern: &str) -> usize {
        self.commands().iter().filter(|c| c.contains(pattern)).count()
    }

    /// Index of the first received command containing `pattern`
    pub fn position(&self, pattern: &str) -> Option<usize> {
        self.commands().iter().position(|c| c.contains(pattern))
    }

    fn take_rule(&self, line: &str) -> Option<Rule> {
        let mut rules = self.rules.lock().unwrap_or_else(|e| e.into_inner());
        let index = rules.iter().rposition(|r| line.contains(&r.pattern))?;

        if rules[index].once {
            Some(rules.remove(index))
        } else {
            Some(rules[index].clone())
        }
    }
}

impl Default for MockShell {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteShell for MockShell {
    fn host(&self) -> &str {
        &self.host
    }

    async fn run(&self, command: &RemoteCommand) -> Result<RemoteCommandResult, DeployError> {
        let line = command.command_line();
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((line.clone(), command.input.clone(), command.timeout));

        let Some(rule) = self.take_rule(&line) else {
            return Ok(RemoteCommandResult::default());
        };

        if let Some(delay) = rule.delay {
            if delay > command.timeout {
                tokio::time::sleep(command.timeout).await;
                return Err(DeployError::Connection(format!(
                    "command timed out after {}s: {}",
                    command.timeout.as_secs(),
                    line
                )));
            }
            tokio::time::sleep(delay).await;
        }

        match rule.response {
            Response::Result(result) => Ok(result),
            Response::ConnectionError(message) => Err(DeployError::Connection(message)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_shell_default_success() {
        let shell = MockShell::new();
        let result = shell.run(&RemoteCommand::new("true")).await.unwrap();

        assert!(result.success());
        assert_eq!(shell.commands(), vec!["true"]);
        assert_eq!(shell.host(), "mock-host");
    }

    #[tokio::test]
    async fn test_mock_shell_latest_rule_wins() {
        let shell = MockShell::new()
            .on("pvesm", RemoteCommandResult::ok("first"))
            .on("pvesm alloc", RemoteCommandResult::ok("second"));

        let alloc = shell.run(&RemoteCommand::new("pvesm").arg("alloc")).await.unwrap();
        assert_eq!(alloc.stdout, "second");

        let path = shell.run(&RemoteCommand::new("pvesm").arg("path")).await.unwrap();
        assert_eq!(path.stdout, "first");
    }

    #[tokio::test]
    async fn test_mock_shell_once_rule() {
        let shell = MockShell::new().on_once("qm", RemoteCommandResult::failed(2, "busy"));

        let first = shell.run(&RemoteCommand::new("qm")).await.unwrap();
        let second = shell.run(&RemoteCommand::new("qm")).await.unwrap();
        assert!(!first.success());
        assert!(second.success());
    }

    #[tokio::test]
    async fn test_mock_shell_connection_error() {
        let shell = MockShell::new().on_connection_error("dd", "channel closed");

        let result = shell.run(&RemoteCommand::new("dd")).await;
        assert!(matches!(result, Err(DeployError::Connection(m)) if m == "channel closed"));
        assert_eq!(shell.count("dd"), 1);
    }

    #[tokio::test]
    async fn test_mock_shell_delay_past_timeout() {
        let shell = MockShell::new().on_delayed("sleep", RemoteCommandResult::ok(""), Duration::from_secs(30));

        let cmd = RemoteCommand::new("sleep").timeout(Duration::from_millis(10));
        let result = shell.run(&cmd).await;
        assert!(matches!(result, Err(DeployError::Connection(_))));
    }

    #[tokio::test]
    async fn test_mock_shell_records_input() {
        let shell = MockShell::new();
        let cmd = RemoteCommand::new("dd").arg("of=/tmp/x").input_file("/images/base.img");
        shell.run(&cmd).await.unwrap();

        assert_eq!(shell.inputs(), vec![CommandInput::File("/images/base.img".into())]);
    }

    #[tokio::test]
    async fn test_mock_shell_records_timeout() {
        let shell = MockShell::new();
        shell.run(&RemoteCommand::new("true")).await.unwrap();
        shell
            .run(&RemoteCommand::new("true").timeout(Duration::from_secs(5)))
            .await
            .unwrap();

        assert_eq!(
            shell.timeouts(),
            vec![crate::remote::DEFAULT_COMMAND_TIMEOUT, Duration::from_secs(5)]
        );
    }
}
