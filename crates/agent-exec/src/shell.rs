//! Shell execution shared by `execute_command` and `process_list`.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::Command as TokioCommand;

const MAX_OUTPUT_BYTES: usize = 10 * 1024 * 1024;
const TRUNCATION_MARKER: &str = "\n... [output truncated]";

pub struct ShellOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug)]
pub enum ShellError {
    TimedOut(u64),
    NotFound(String),
    PermissionDenied(String),
    Spawn(String),
}

impl std::fmt::Display for ShellError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShellError::TimedOut(ms) => write!(f, "Command timed out after {ms}ms"),
            ShellError::NotFound(shell) => write!(f, "Command not found: {shell}"),
            ShellError::PermissionDenied(shell) => write!(f, "Permission denied: {shell}"),
            ShellError::Spawn(msg) => write!(f, "{msg}"),
        }
    }
}

#[cfg(unix)]
const SHELL: &str = "/bin/sh";
#[cfg(windows)]
const SHELL: &str = "cmd.exe";

/// Spawn `command` under the platform shell with a scrubbed environment,
/// collecting stdout/stderr up to 10 MiB combined and enforcing
/// `timeout_ms` with a `SIGKILL` escalation on expiry.
pub async fn run_shell(command: &str, cwd: Option<&Path>, timeout_ms: u64) -> Result<ShellOutput, ShellError> {
    let mut cmd = TokioCommand::new(SHELL);
    #[cfg(unix)]
    cmd.arg("-c").arg(command);
    #[cfg(windows)]
    cmd.arg("/c").arg(command);

    cmd.env_clear();
    cmd.envs(agent_safety::build_safe_env());
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }
    cmd.stdout(std::process::Stdio::piped());
    cmd.stderr(std::process::Stdio::piped());
    cmd.stdin(std::process::Stdio::null());

    let mut child = cmd.spawn().map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => ShellError::NotFound(SHELL.to_string()),
        std::io::ErrorKind::PermissionDenied => ShellError::PermissionDenied(SHELL.to_string()),
        _ => ShellError::Spawn(e.to_string()),
    })?;

    let mut stdout_pipe = child.stdout.take().expect("piped stdout");
    let mut stderr_pipe = child.stderr.take().expect("piped stderr");
    let budget = AtomicUsize::new(MAX_OUTPUT_BYTES);

    let collect = async {
        let (stdout, stderr) = tokio::join!(
            read_capped(&mut stdout_pipe, &budget),
            read_capped(&mut stderr_pipe, &budget)
        );
        let status = child.wait().await;
        (status, stdout, stderr)
    };
    tokio::pin!(collect);

    match tokio::time::timeout(Duration::from_millis(timeout_ms), &mut collect).await {
        Ok((status, stdout, stderr)) => {
            let status = status.map_err(|e| ShellError::Spawn(e.to_string()))?;
            Ok(ShellOutput {
                exit_code: status.code(),
                stdout,
                stderr,
            })
        }
        Err(_) => {
            drop(collect);
            let _ = child.kill().await;
            let _ = child.wait().await;
            Err(ShellError::TimedOut(timeout_ms))
        }
    }
}

/// Claims up to `want` bytes from a budget shared across stdout and
/// stderr, so the two streams' combined capture — not each one
/// individually — is bounded by `MAX_OUTPUT_BYTES`.
fn claim_budget(budget: &AtomicUsize, want: usize) -> usize {
    loop {
        let available = budget.load(Ordering::SeqCst);
        let take = available.min(want);
        if budget
            .compare_exchange(available, available - take, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            return take;
        }
    }
}

async fn read_capped(pipe: &mut (impl tokio::io::AsyncRead + Unpin), budget: &AtomicUsize) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 8192];
    let mut truncated = false;
    loop {
        match pipe.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                let take = claim_budget(budget, n);
                buf.extend_from_slice(&chunk[..take]);
                if take < n {
                    truncated = true;
                }
            }
            Err(_) => break,
        }
    }
    let mut s = String::from_utf8_lossy(&buf).into_owned();
    if truncated {
        s.push_str(TRUNCATION_MARKER);
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn echo_succeeds() {
        let out = run_shell("echo hi", None, 5_000).await.expect("run");
        assert_eq!(out.exit_code, Some(0));
        assert_eq!(out.stdout, "hi\n");
    }

    #[tokio::test]
    async fn nonzero_exit_reports_stderr() {
        let out = run_shell("echo boom 1>&2; exit 3", None, 5_000).await.expect("run");
        assert_eq!(out.exit_code, Some(3));
        assert_eq!(out.stderr.trim(), "boom");
    }

    #[tokio::test]
    async fn timeout_is_reported() {
        let err = run_shell("sleep 5", None, 100).await.unwrap_err();
        assert!(matches!(err, ShellError::TimedOut(100)));
    }

    #[tokio::test]
    async fn output_cap_is_shared_across_stdout_and_stderr() {
        let per_stream = MAX_OUTPUT_BYTES - 1024;
        let cmd = format!(
            "head -c {per_stream} /dev/zero | tr '\\0' 'a'; head -c {per_stream} /dev/zero | tr '\\0' 'b' 1>&2"
        );
        let out = run_shell(&cmd, None, 20_000).await.expect("run");
        let stdout_len = out.stdout.trim_end_matches(TRUNCATION_MARKER).len();
        let stderr_len = out.stderr.trim_end_matches(TRUNCATION_MARKER).len();
        assert!(stdout_len + stderr_len <= MAX_OUTPUT_BYTES);
        assert!(out.stdout.ends_with(TRUNCATION_MARKER) || out.stderr.ends_with(TRUNCATION_MARKER));
    }

    #[tokio::test]
    async fn safe_env_is_used_not_parent_env() {
        std::env::set_var("SOME_SECRET_FOR_TEST", "shhh");
        let out = run_shell("echo $SOME_SECRET_FOR_TEST", None, 5_000).await.expect("run");
        std::env::remove_var("SOME_SECRET_FOR_TEST");
        assert_eq!(out.stdout.trim(), "");
    }
}
