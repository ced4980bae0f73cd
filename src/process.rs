use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

const MAX_OUTPUT: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("empty argv")]
    EmptyCommand,

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("process error: {0}")]
    Io(#[from] std::io::Error),

    #[error("command timed out after {}s", .0.as_secs())]
    TimedOut(Duration),
}

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

pub fn truncate_output(raw: &[u8]) -> String {
    if raw.len() <= MAX_OUTPUT {
        String::from_utf8_lossy(raw).to_string()
    } else {
        let t = String::from_utf8_lossy(&raw[..MAX_OUTPUT]).to_string();
        format!(
            "{}\n\n... [truncated at {} bytes, total {}]",
            t,
            MAX_OUTPUT,
            raw.len()
        )
    }
}

/// Spawn `argv` and wait for it, killing the child if `timeout` elapses first.
pub async fn run_cmd(
    argv: &[String],
    cwd: Option<&Path>,
    timeout: Duration,
) -> Result<CommandOutput, ProcessError> {
    let (program, args) = argv.split_first().ok_or(ProcessError::EmptyCommand)?;

    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }

    debug!("Running command: {}", argv.join(" "));

    let child = cmd.spawn().map_err(|source| ProcessError::Spawn {
        program: program.clone(),
        source,
    })?;

    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(o)) => o,
        Ok(Err(e)) => return Err(ProcessError::Io(e)),
        Err(_) => return Err(ProcessError::TimedOut(timeout)),
    };

    Ok(CommandOutput {
        stdout: truncate_output(&output.stdout),
        stderr: truncate_output(&output.stderr),
        exit_code: output.status.code().unwrap_or(-1),
    })
}
