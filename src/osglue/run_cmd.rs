//! Shell-command execution, grounded on `original_source/lib/run_lib.py`.
//!
//! The original selects over non-blocking pipes by hand; `tokio::process`
//! already gives us that as `Command::output()`, so the non-real-time
//! helpers (`run_cmd`, `run_cmd_result`, `open_cmd`) collapse to a single
//! `output().await`. The real-time/streaming variants (`run_cmd_real_time_out`,
//! `run_cmd_read_lines`) are the ones with their own state machines, and
//! those live in [`crate::task::ltc`] instead of here.

use tracing::debug;

use crate::rpc::types::CmdResult;

/// Run `cmd` through `sh -c`, returning its exit code, stdout and stderr in
/// full. Errors starting the process itself (not the command's own
/// failure) come back as `ret_code == -1` with the spawn error in `stderr`.
pub async fn run_cmd_result(cmd: &str) -> CmdResult {
    debug!("Run {cmd}");
    match tokio::process::Command::new("sh").arg("-c").arg(cmd).output().await {
        Ok(out) => CmdResult {
            ret_code: out.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
        },
        Err(e) => CmdResult {
            ret_code: -1,
            stdout: String::new(),
            stderr: e.to_string(),
        },
    }
}

/// Fire-and-forget: run `cmd` and discard its output, returning only the
/// exit code. Used for best-effort cleanup commands like `fuser -km`.
pub async fn run_cmd(cmd: &str) -> i32 {
    run_cmd_result(cmd).await.ret_code
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let result = run_cmd_result("echo hi").await;
        assert_eq!(result.ret_code, 0);
        assert_eq!(result.stdout.trim(), "hi");
    }

    #[tokio::test]
    async fn nonzero_exit_is_reported() {
        let result = run_cmd_result("exit 7").await;
        assert_eq!(result.ret_code, 7);
    }
}
