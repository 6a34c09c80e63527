//! Long-term command execution (LTC, C5).
//!
//! Grounded on `original_source/lib/long_term_cmd.py`: background a shell
//! command in its own process group, drain stdout/stderr into bounded
//! queues, accept a "terminate" control token, expose state/err_code/
//! err_msg plus a destructive drain of the output queues.
//!
//! The worker is a `tokio::spawn`ed task
//! rather than an OS thread, and the readiness-driven `select()` loop of
//! the original becomes `tokio::select!` over two line streams and a
//! control channel — functionally the same suspension points, expressed
//! the way this stack expresses them. The bounded queues keep their exact
//! capacities (10 for stdout/stderr, 1 for the control channel).

use std::collections::HashMap;
use std::os::unix::process::CommandExt;
use std::process::Stdio;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::{info, warn};

use crate::rpc::types::{LtcState, TaskState, TaskStateWire};
use crate::shutdown::ShutdownGuard;

const STDERR_EMPTY_READ_LIMIT: u32 = crate::defaults::LTC_STDERR_EMPTY_READ_LIMIT;

pub struct LtcRecord {
    pub cmd: String,
    state: StdMutex<TaskState>,
    ret_code: StdMutex<i32>,
    stdout_rx: AsyncMutex<mpsc::Receiver<String>>,
    stderr_rx: AsyncMutex<mpsc::Receiver<String>>,
    control_tx: mpsc::Sender<()>,
}

impl LtcRecord {
    fn drain(rx: &mut mpsc::Receiver<String>) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(line) = rx.try_recv() {
            out.push(line);
        }
        out
    }

    pub async fn state_snapshot(&self) -> LtcState {
        let state = self.state.lock().unwrap().clone();
        let mut stdout_rx = self.stdout_rx.lock().await;
        let mut stderr_rx = self.stderr_rx.lock().await;
        LtcState {
            err_code: state.err_code(),
            err_msg: state.err_msg(),
            state: TaskStateWire::from(&state),
            stdout_lines: Self::drain(&mut stdout_rx),
            stderr_lines: Self::drain(&mut stderr_rx),
        }
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().unwrap().is_running()
    }
}

#[derive(Default)]
pub struct LtcTable {
    records: StdMutex<HashMap<i64, std::sync::Arc<LtcRecord>>>,
}

impl LtcTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawn(
        &self,
        cmd: String,
        output_qsize: usize,
        output_timeout: Duration,
        shutdown: ShutdownGuard,
    ) -> i64 {
        let cmd_id = crate::task::new_task_id();
        let (stdout_tx, stdout_rx) = mpsc::channel(output_qsize);
        let (stderr_tx, stderr_rx) = mpsc::channel(output_qsize);
        let (control_tx, control_rx) = mpsc::channel(1);

        let record = std::sync::Arc::new(LtcRecord {
            cmd: cmd.clone(),
            state: StdMutex::new(TaskState::Running),
            ret_code: StdMutex::new(0),
            stdout_rx: AsyncMutex::new(stdout_rx),
            stderr_rx: AsyncMutex::new(stderr_rx),
            control_tx,
        });

        self.records.lock().unwrap().insert(cmd_id, record.clone());

        tokio::spawn(async move {
            let _ticket = shutdown.track();
            let (final_state, ret_code) =
                run_worker(cmd, stdout_tx, stderr_tx, control_rx, output_timeout).await;
            *record.state.lock().unwrap() = final_state;
            *record.ret_code.lock().unwrap() = ret_code;
        });

        cmd_id
    }

    pub async fn get_state(&self, cmd_id: i64) -> Option<LtcState> {
        let record = self.records.lock().unwrap().get(&cmd_id).cloned()?;
        Some(record.state_snapshot().await)
    }

    /// Requires the task to be non-running, unlike the original's
    /// unconditional delete.
    pub fn remove(&self, cmd_id: i64) -> Result<(), &'static str> {
        let mut records = self.records.lock().unwrap();
        match records.get(&cmd_id) {
            None => Err("not exists"),
            Some(r) if r.is_running() => Err("cmd is still running"),
            Some(_) => {
                records.remove(&cmd_id);
                Ok(())
            }
        }
    }

    pub async fn terminate(&self, cmd_id: i64) -> Result<(), String> {
        let record = {
            let records = self.records.lock().unwrap();
            records
                .get(&cmd_id)
                .cloned()
                .ok_or_else(|| format!("cmd({cmd_id}) not exists"))?
        };
        // best-effort, mirrors the original's `except Exception: pass`
        let _ = tokio::time::timeout(Duration::from_secs(10), record.control_tx.send(())).await;
        Ok(())
    }
}

async fn run_worker(
    cmd: String,
    stdout_tx: mpsc::Sender<String>,
    stderr_tx: mpsc::Sender<String>,
    mut control_rx: mpsc::Receiver<()>,
    output_timeout: Duration,
) -> (TaskState, i32) {
    let mut child = match unsafe {
        Command::new("sh")
            .arg("-c")
            .arg(&cmd)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .pre_exec(|| {
                nix::unistd::setsid().map_err(std::io::Error::from)?;
                Ok(())
            })
            .spawn()
    } {
        Ok(c) => c,
        Err(e) => return (TaskState::Failed(e.to_string()), -1),
    };

    let pid = child.id().map(|p| p as i32);
    let mut stdout_lines = BufReader::new(child.stdout.take().unwrap()).lines();
    let mut stderr_lines = BufReader::new(child.stderr.take().unwrap()).lines();

    let mut stdout_done = false;
    let mut stderr_done = false;
    let mut stderr_empty_reads = 0u32;
    let mut err_code = 0;
    let mut err_msg = String::new();
    let mut terminated = false;

    loop {
        if stdout_done && stderr_done {
            break;
        }
        tokio::select! {
            line = stdout_lines.next_line(), if !stdout_done => {
                match line {
                    Ok(Some(l)) => {
                        if tokio::time::timeout(output_timeout, stdout_tx.send(l)).await.is_err() {
                            err_code = -1;
                            err_msg = "write to output timeout".to_string();
                            break;
                        }
                    }
                    Ok(None) => stdout_done = true,
                    Err(e) => { err_code = -1; err_msg = e.to_string(); break; }
                }
            }
            line = stderr_lines.next_line(), if !stderr_done => {
                match line {
                    Ok(Some(l)) => {
                        stderr_empty_reads = 0;
                        if tokio::time::timeout(output_timeout, stderr_tx.send(l)).await.is_err() {
                            err_code = -1;
                            err_msg = "write to output timeout".to_string();
                            break;
                        }
                    }
                    Ok(None) => {
                        stderr_empty_reads += 1;
                        if stderr_empty_reads > STDERR_EMPTY_READ_LIMIT {
                            err_code = -1;
                            stderr_done = true;
                        }
                    }
                    Err(e) => { err_code = -1; err_msg = e.to_string(); break; }
                }
            }
            _ = control_rx.recv() => {
                err_msg = "强制停止".to_string();
                if let Some(pid) = pid {
                    if let Err(e) = signal::killpg(Pid::from_raw(pid), Signal::SIGKILL) {
                        warn!("killpg({pid}) failed: {e}");
                    }
                }
                terminated = true;
                break;
            }
        }
    }

    let ret_code = match child.wait().await {
        Ok(status) => status.code().unwrap_or(-1),
        Err(e) => {
            err_code = -1;
            if err_msg.is_empty() {
                err_msg = e.to_string();
            }
            -1
        }
    };

    if terminated {
        info!("long term cmd({cmd}) terminated");
        return (TaskState::Failed(err_msg), ret_code);
    }

    if err_code != 0 || ret_code != 0 {
        let msg = if err_msg.is_empty() {
            format!("command exited with code {ret_code}")
        } else {
            err_msg
        };
        (TaskState::Failed(msg), ret_code)
    } else {
        (TaskState::Success, ret_code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn short_command_completes_successfully() {
        let table = LtcTable::new();
        let shutdown = ShutdownGuard::new();
        let id = table.spawn(
            "echo hello".to_string(),
            10,
            Duration::from_secs(5),
            shutdown,
        );
        tokio::time::sleep(Duration::from_millis(200)).await;
        let state = table.get_state(id).await.unwrap();
        assert_eq!(state.state, TaskStateWire::Success);
        assert_eq!(state.stdout_lines, vec!["hello".to_string()]);
    }

    #[tokio::test]
    async fn terminate_kills_long_running_command() {
        let table = LtcTable::new();
        let shutdown = ShutdownGuard::new();
        let id = table.spawn(
            "sleep 3600".to_string(),
            10,
            Duration::from_secs(600),
            shutdown,
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
        table.terminate(id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        let state = table.get_state(id).await.unwrap();
        assert_eq!(state.state, TaskStateWire::Failed);
        assert!(state.err_msg.contains("强制停止"));
    }

    #[test]
    fn remove_requires_non_running() {
        let table = LtcTable::new();
        table
            .records
            .lock()
            .unwrap()
            .insert(1, std::sync::Arc::new(LtcRecord {
                cmd: "x".to_string(),
                state: StdMutex::new(TaskState::Running),
                ret_code: StdMutex::new(0),
                stdout_rx: AsyncMutex::new(mpsc::channel(1).1),
                stderr_rx: AsyncMutex::new(mpsc::channel(1).1),
                control_tx: mpsc::channel(1).0,
            }));
        assert_eq!(table.remove(1), Err("cmd is still running"));
    }
}
