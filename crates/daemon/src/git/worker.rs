use std::path::Path;
use std::process::Command;

use thiserror::Error;

use super::FingerprintSource;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FingerprintError {
    #[error("failed to run `{command}` in {repo}: {message}")]
    SpawnFailed { command: String, repo: String, message: String },

    #[error("`{command}` in {repo} failed with code {code:?}: {}", .stderr.trim())]
    CommandFailed { command: String, repo: String, code: Option<i32>, stderr: String },

    #[error("`{command}` in {repo} printed no commit id")]
    EmptyOutput { command: String, repo: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

pub trait CommandExecutor: Send + Sync {
    fn execute(
        &self,
        program: &str,
        args: &[String],
        cwd: &Path,
    ) -> Result<CommandResult, std::io::Error>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessCommandExecutor;

impl CommandExecutor for ProcessCommandExecutor {
    fn execute(
        &self,
        program: &str,
        args: &[String],
        cwd: &Path,
    ) -> Result<CommandResult, std::io::Error> {
        let output = Command::new(program).args(args).current_dir(cwd).output()?;
        Ok(CommandResult {
            success: output.status.success(),
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Reads repository state through the `git` binary.
#[derive(Debug, Clone, Default)]
pub struct GitWorker<E = ProcessCommandExecutor> {
    executor: E,
}

impl GitWorker<ProcessCommandExecutor> {
    pub fn new() -> Self {
        Self { executor: ProcessCommandExecutor }
    }
}

impl<E: CommandExecutor> GitWorker<E> {
    pub fn with_executor(executor: E) -> Self {
        Self { executor }
    }

    /// Commit id checked out in `repo_path`.
    pub fn head_commit(&self, repo_path: &Path) -> Result<String, FingerprintError> {
        let args = vec!["rev-parse".to_string(), "HEAD".to_string()];
        let command = format!("git {}", args.join(" "));
        let repo = repo_path.display().to_string();

        let result = self.executor.execute("git", &args, repo_path).map_err(|error| {
            FingerprintError::SpawnFailed {
                command: command.clone(),
                repo: repo.clone(),
                message: error.to_string(),
            }
        })?;

        if !result.success {
            let stderr =
                if result.stderr.trim().is_empty() { result.stdout } else { result.stderr };
            return Err(FingerprintError::CommandFailed {
                command,
                repo,
                code: result.code,
                stderr,
            });
        }

        let commit = result.stdout.trim();
        if commit.is_empty() {
            return Err(FingerprintError::EmptyOutput { command, repo });
        }
        Ok(commit.to_owned())
    }
}

impl<E: CommandExecutor> FingerprintSource for GitWorker<E> {
    fn fingerprint(&self, repo_path: &Path) -> Result<String, FingerprintError> {
        self.head_commit(repo_path)
    }
}
