//! Starting the serving binary.
//!
//! Purpose
//! - Turn a program, an argument vector and an `EnvSet` into a child process,
//!   either spawned and awaited (`run`) or replacing this process (`exec`).
//! - The child's exit code is handed back untouched; there is no retry.

use crate::env::EnvSet;
use serde::Serialize;
use std::fmt;
use std::io;
use std::process::{Command, ExitStatus};

/// Exit code reported by shells when a command cannot be found.
pub const EXIT_NOT_FOUND: i32 = 127;
/// Exit code reported by shells when a command is found but cannot be executed.
pub const EXIT_NOT_EXECUTABLE: i32 = 126;

#[derive(Debug)]
pub enum LaunchError {
    /// The program could not be started (missing, not executable, ...).
    Spawn { program: String, source: io::Error },
    /// The child was started but waiting on it failed.
    Wait { program: String, source: io::Error },
}

impl LaunchError {
    /// Shell-style exit code for a launch that never produced a child status.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Spawn { source, .. } if source.kind() == io::ErrorKind::PermissionDenied => {
                EXIT_NOT_EXECUTABLE
            }
            Self::Spawn { .. } => EXIT_NOT_FOUND,
            Self::Wait { .. } => 1,
        }
    }
}

impl fmt::Display for LaunchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Spawn { program, source } => write!(f, "failed to start {program}: {source}"),
            Self::Wait { program, source } => write!(f, "failed waiting on {program}: {source}"),
        }
    }
}

impl std::error::Error for LaunchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Spawn { source, .. } | Self::Wait { source, .. } => Some(source),
        }
    }
}

/// Everything needed to start the child, built once and never mutated.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct LaunchPlan {
    pub program: String,
    pub args: Vec<String>,
    pub env: EnvSet,
}

impl LaunchPlan {
    pub fn new(program: impl Into<String>, args: Vec<String>, env: EnvSet) -> Self {
        Self {
            program: program.into(),
            args,
            env,
        }
    }

    /// Child command with the plan's arguments and environment; stdio is inherited.
    pub fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        self.env.apply(&mut cmd);
        cmd
    }

    /// Spawn the child, block until it exits, and return its exit code.
    ///
    /// A terminal Ctrl-C reaches both processes and ends this one at once, so the
    /// child's own shutdown code is lost; use `exec` when that code matters.
    pub fn run(&self) -> Result<i32, LaunchError> {
        tracing::info!(program = %self.program, argc = self.args.len(), "launch");
        let mut child = self.command().spawn().map_err(|source| LaunchError::Spawn {
            program: self.program.clone(),
            source,
        })?;
        let status = child.wait().map_err(|source| LaunchError::Wait {
            program: self.program.clone(),
            source,
        })?;
        let code = exit_code(status);
        tracing::info!(program = %self.program, code, "child exited");
        Ok(code)
    }

    /// Replace the current process image with the child. Returns only on failure.
    #[cfg(unix)]
    pub fn exec(&self) -> LaunchError {
        use std::os::unix::process::CommandExt;
        tracing::info!(program = %self.program, argc = self.args.len(), "exec");
        let source = self.command().exec();
        LaunchError::Spawn {
            program: self.program.clone(),
            source,
        }
    }

    /// Single-line, shell-like rendering (`K=V ... program args...`) for logs.
    pub fn display(&self) -> String {
        let mut parts: Vec<String> = self
            .env
            .iter()
            .map(|(name, value)| format!("{name}={}", shell_quote(value)))
            .collect();
        parts.push(shell_quote(&self.program));
        parts.extend(self.args.iter().map(|a| shell_quote(a)));
        parts.join(" ")
    }
}

/// Map a child status to the code a shell would report.
#[cfg(unix)]
fn exit_code(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(sig)) => 128 + sig,
        (None, None) => 1,
    }
}

#[cfg(not(unix))]
fn exit_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(1)
}

fn shell_quote(s: &str) -> String {
    let plain = !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=,@+%".contains(c));
    if plain {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', r"'\''"))
    }
}
