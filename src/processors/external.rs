//! Running external programs with their output forwarded to the log.

use std::io::{BufRead, BufReader};
use std::process::{Command, ExitStatus, Stdio};
use std::thread;

use log::{debug, info, warn};
use thiserror::Error;

/// Errors raised while running an external program.
#[derive(Debug, Error)]
pub enum ExternalError {
    #[error("Failed to launch '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed while waiting for '{program}': {source}")]
    Wait {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("'{program}' exited with {status}")]
    Failed { program: String, status: ExitStatus },
}

/// Result type for external program runs.
pub type Result<T> = std::result::Result<T, ExternalError>;

/// Program name of `command` for messages.
pub fn program_name(command: &Command) -> String {
    command.get_program().to_string_lossy().into_owned()
}

/// Render `command` as a single line for logging.
pub fn describe(command: &Command) -> String {
    std::iter::once(command.get_program())
        .chain(command.get_args())
        .map(|s| s.to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Run `command` to completion, streaming its output line by line.
///
/// Standard output goes to the log at info level and standard error at
/// warn level. Blocks until the program exits; a non-zero exit status is an
/// error.
pub fn run_streaming(mut command: Command) -> Result<()> {
    let program = program_name(&command);
    debug!("Running: {}", describe(&command));

    let mut child = command
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| ExternalError::Spawn {
            program: program.clone(),
            source: e,
        })?;

    let stderr_thread = child.stderr.take().map(|stderr| {
        thread::spawn(move || {
            for line in BufReader::new(stderr).lines().map_while(|l| l.ok()) {
                warn!("{}", line);
            }
        })
    });

    if let Some(stdout) = child.stdout.take() {
        for line in BufReader::new(stdout).lines().map_while(|l| l.ok()) {
            info!("{}", line);
        }
    }

    let status = child.wait().map_err(|e| ExternalError::Wait {
        program: program.clone(),
        source: e,
    })?;

    if let Some(handle) = stderr_thread {
        let _ = handle.join();
    }

    if !status.success() {
        return Err(ExternalError::Failed { program, status });
    }

    Ok(())
}
