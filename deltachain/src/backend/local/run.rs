//! External tool invocation.

use std::io;
use std::path::Path;
use std::process::{Command, Output};

use deltachain_shared::errors::{DeltaError, DeltaResult};

/// Run `cmd` and fail with its stderr unless it exits successfully.
pub fn run(cmd: &mut Command, what: &str) -> DeltaResult<Output> {
    let program = cmd.get_program().to_owned();
    tracing::debug!(command = ?cmd, "Running");
    check_output(cmd.output(), Path::new(&program), what)
}

/// Like [`run`], accepting any exit code in `ok_codes`.
pub fn run_allowing(cmd: &mut Command, what: &str, ok_codes: &[i32]) -> DeltaResult<Output> {
    let program = cmd.get_program().to_owned();
    tracing::debug!(command = ?cmd, "Running");
    let output = spawn_result(cmd.output(), Path::new(&program))?;
    match output.status.code() {
        Some(code) if ok_codes.contains(&code) => Ok(output),
        _ => Err(failed(&output, what)),
    }
}

pub fn check_output(output: io::Result<Output>, program: &Path, what: &str) -> DeltaResult<Output> {
    let output = spawn_result(output, program)?;
    if !output.status.success() {
        return Err(failed(&output, what));
    }
    Ok(output)
}

fn spawn_result(output: io::Result<Output>, program: &Path) -> DeltaResult<Output> {
    output.map_err(|e| {
        DeltaError::Storage(format!(
            "Failed to run {} (is it installed?): {}",
            program.display(),
            e
        ))
    })
}

fn failed(output: &Output, what: &str) -> DeltaError {
    DeltaError::Storage(format!(
        "Failed to {} ({}): {}",
        what,
        output.status,
        String::from_utf8_lossy(&output.stderr).trim()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_success() {
        let output = run(Command::new("true").arg("x"), "run true").unwrap();
        assert!(output.status.success());
    }

    #[test]
    fn test_run_failure_carries_context() {
        let err = run(&mut Command::new("false"), "run false").unwrap_err();
        match err {
            DeltaError::Storage(msg) => assert!(msg.contains("run false")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_run_allowing_codes() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "exit 1"]);
        assert!(run_allowing(&mut cmd, "exit one", &[0, 1]).is_ok());

        let mut cmd = Command::new("sh");
        cmd.args(["-c", "exit 4"]);
        assert!(run_allowing(&mut cmd, "exit four", &[0, 1]).is_err());
    }

    #[test]
    fn test_missing_binary() {
        let err = run(&mut Command::new("/nonexistent/tool"), "run tool").unwrap_err();
        match err {
            DeltaError::Storage(msg) => assert!(msg.contains("is it installed")),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
