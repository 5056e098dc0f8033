use crate::error::MonitorError;
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time;
use tracing::debug;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// -1 when the process was killed by a signal.
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Runs an external tool. Non-zero exit codes are data, not errors; only a
/// spawn failure or an exceeded timeout is an `Err`.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, argv: &[String], timeout: Duration) -> Result<CommandOutput, MonitorError>;
}

#[derive(Debug, Clone, Default)]
pub struct SystemCommandRunner;

#[async_trait]
impl CommandRunner for SystemCommandRunner {
    async fn run(&self, argv: &[String], timeout: Duration) -> Result<CommandOutput, MonitorError> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| MonitorError::invalid("empty command line"))?;

        debug!(program = %program, ?args, "running command");
        // kill_on_drop reaps the child when the timeout (or a cancelled
        // cycle) drops the future.
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        match time::timeout(timeout, child).await {
            Ok(Ok(output)) => Ok(CommandOutput {
                stdout: output.stdout,
                stderr: output.stderr,
                exit_code: output.status.code().unwrap_or(-1),
            }),
            Ok(Err(source)) => Err(MonitorError::Command {
                program: program.clone(),
                source,
            }),
            Err(_elapsed) => Err(MonitorError::ProbeTimeout {
                target: argv.join(" "),
                after: timeout,
            }),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Replies with canned output keyed by the full command line.
    #[derive(Default)]
    pub struct ScriptedRunner {
        replies: Mutex<HashMap<String, Reply>>,
        pub calls: Mutex<Vec<String>>,
    }

    #[derive(Clone)]
    pub enum Reply {
        Output(CommandOutput),
        Timeout,
        Hang,
    }

    impl ScriptedRunner {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn reply(self, command: &str, exit_code: i32, stdout: &str, stderr: &str) -> Self {
            self.replies.lock().unwrap().insert(
                command.to_string(),
                Reply::Output(CommandOutput {
                    stdout: stdout.as_bytes().to_vec(),
                    stderr: stderr.as_bytes().to_vec(),
                    exit_code,
                }),
            );
            self
        }

        pub fn timeout(self, command: &str) -> Self {
            self.replies
                .lock()
                .unwrap()
                .insert(command.to_string(), Reply::Timeout);
            self
        }

        pub fn hang(self, command: &str) -> Self {
            self.replies
                .lock()
                .unwrap()
                .insert(command.to_string(), Reply::Hang);
            self
        }
    }

    #[async_trait]
    impl CommandRunner for ScriptedRunner {
        async fn run(&self, argv: &[String], timeout: Duration) -> Result<CommandOutput, MonitorError> {
            let line = argv.join(" ");
            self.calls.lock().unwrap().push(line.clone());
            let reply = self.replies.lock().unwrap().get(&line).cloned();
            match reply {
                Some(Reply::Output(out)) => Ok(out),
                Some(Reply::Timeout) => Err(MonitorError::ProbeTimeout {
                    target: line,
                    after: timeout,
                }),
                Some(Reply::Hang) => std::future::pending().await,
                None => Err(MonitorError::Command {
                    program: line,
                    source: std::io::Error::new(std::io::ErrorKind::NotFound, "not scripted"),
                }),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let out = SystemCommandRunner
            .run(&argv(&["sh", "-c", "echo hello; exit 2"]), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(out.stdout_text().trim(), "hello");
        assert_eq!(out.exit_code, 2);
        assert!(!out.success());
    }

    #[tokio::test]
    async fn slow_command_times_out() {
        let err = SystemCommandRunner
            .run(&argv(&["sleep", "5"]), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, MonitorError::ProbeTimeout { .. }));
    }

    #[tokio::test]
    async fn missing_program_is_command_error() {
        let err = SystemCommandRunner
            .run(&argv(&["/nonexistent/netmond-tool"]), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, MonitorError::Command { .. }));
        assert!(SystemCommandRunner.run(&[], Duration::from_secs(1)).await.is_err());
    }
}
