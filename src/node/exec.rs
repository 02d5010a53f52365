//! Host command execution

use crate::error::{Error, Result};
use tokio::process::Command;
use tracing::trace;

/// Exit status and captured streams of a finished command
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Turn a non-zero exit into an error naming `command`
    pub fn check(self, command: &str) -> Result<Self> {
        if self.success() {
            Ok(self)
        } else {
            Err(Error::Command {
                command: command.to_string(),
                reason: format!("exit code {:?}: {}", self.code, self.stderr.trim()),
            })
        }
    }
}

/// Run `program` with `args` and capture its output
///
/// Arguments are not logged, they may carry CHAP secrets.
pub async fn run<S: AsRef<str>>(program: &str, args: &[S]) -> Result<CommandOutput> {
    trace!("Running {} with {} arguments", program, args.len());
    let output = Command::new(program)
        .args(args.iter().map(|a| a.as_ref()))
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| Error::Command {
            command: program.to_string(),
            reason: e.to_string(),
        })?;

    Ok(CommandOutput {
        code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}
