//! Cross-host pipe (CHP, C6): stitches a remote command's stdout into a
//! local command's stdin through a pair of cooperating agents.
//!
//! Grounded on `original_source/lib/cross_host_pipe.py`. Two tables:
//! `PipeOutTable` is the responder side (`chp_create_pipe_out_cmd` spawns
//! `dst_cmd` and streams its stdout back via RPC); `ChpTable` is the
//! initiator side (runs `src_cmd` locally, feeding it from the peer's
//! stream). The capacity-1 `tokio::sync::mpsc` channel between the RPC
//! handler (producer) and the local writer (consumer) is the backpressure
//! device that keeps a slow peer from stalling the whole pipe.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::defaults::{CHP_PIPE_OUT_TASK_TTL, CHP_PROGRESS_INTERVAL, CHP_STDERR_CHUNK, CHP_STDOUT_CHUNK, CHP_TASK_TTL};
use crate::rpc::client::AgentClient;
use crate::rpc::types::{ChpMessage, ChpState, RpcOutcome, TaskState, TaskStateWire};
use crate::shutdown::ShutdownGuard;

struct Finished {
    at: Instant,
}

struct PipeOutRecord {
    state: StdMutex<TaskState>,
    finished: StdMutex<Option<Finished>>,
}

#[derive(Default)]
pub struct PipeOutTable {
    records: StdMutex<HashMap<i64, Arc<PipeOutRecord>>>,
}

impl PipeOutTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn gc(records: &mut HashMap<i64, Arc<PipeOutRecord>>) {
        records.retain(|_, r| match &*r.finished.lock().unwrap() {
            Some(f) => f.at.elapsed() < CHP_PIPE_OUT_TASK_TTL,
            None => true,
        });
    }

    /// Responder side of the pipe: spawns a worker running
    /// `dst_cmd`, streaming its stdout back to `src_host` via
    /// `chp_send_pipe_out_data`.
    pub fn create(
        &self,
        cmd_id: i64,
        src_host: SocketAddr,
        dst_cmd: String,
        secret: String,
        shutdown: ShutdownGuard,
    ) {
        let record = Arc::new(PipeOutRecord {
            state: StdMutex::new(TaskState::Running),
            finished: StdMutex::new(None),
        });
        {
            let mut records = self.records.lock().unwrap();
            Self::gc(&mut records);
            records.insert(cmd_id, record.clone());
        }

        tokio::spawn(async move {
            let _ticket = shutdown.track();
            let (err_code, err_msg) = run_pipe_out(cmd_id, src_host, &dst_cmd, &secret).await;
            let final_state = if err_code == 0 {
                TaskState::Success
            } else {
                TaskState::Failed(err_msg)
            };
            *record.state.lock().unwrap() = final_state;
            *record.finished.lock().unwrap() = Some(Finished { at: Instant::now() });
        });
    }

    pub fn remove(&self, cmd_id: i64) -> Result<(), String> {
        let mut records = self.records.lock().unwrap();
        match records.get(&cmd_id) {
            None => Err(format!("chp pipe out cmd({cmd_id}) not exists!")),
            Some(r) if r.state.lock().unwrap().is_running() => {
                Err(format!("chp pipe out cmd({cmd_id}) is running!"))
            }
            Some(_) => {
                records.remove(&cmd_id);
                Ok(())
            }
        }
    }
}

async fn run_pipe_out(cmd_id: i64, src_host: SocketAddr, dst_cmd: &str, secret: &str) -> (i32, String) {
    info!("begin run pipe_out_cmd(cmd_id={cmd_id})...");
    let client = match AgentClient::connect(src_host, secret).await {
        Ok(c) => c,
        Err(e) => {
            error!("pipe_out_cmd(cmd_id={cmd_id}) failed: can not connect {src_host}: {e}");
            return (-1, e.to_string());
        }
    };

    let mut child = match Command::new("sh")
        .arg("-c")
        .arg(dst_cmd)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
    {
        Ok(c) => c,
        Err(e) => return (-1, e.to_string()),
    };

    let mut stdout = child.stdout.take().unwrap();
    let mut stderr = child.stderr.take().unwrap();
    let mut total_err = Vec::new();
    let mut err_code = 0;
    let mut err_msg = String::new();

    let mut out_buf = vec![0u8; CHP_STDOUT_CHUNK];
    let mut err_buf = vec![0u8; CHP_STDERR_CHUNK];
    let mut stdout_done = false;
    let mut stderr_done = false;

    while !stdout_done || !stderr_done {
        tokio::select! {
            n = stdout.read(&mut out_buf), if !stdout_done => {
                match n {
                    Ok(0) => stdout_done = true,
                    Ok(n) => {
                        let ctx = tarpc::context::current();
                        match client.inner.chp_send_pipe_out_data(ctx, cmd_id, ChpMessage::Data(out_buf[..n].to_vec())).await {
                            Ok(RpcOutcome::Ok(())) => {}
                            Ok(RpcOutcome::Domain(_, msg)) | Ok(RpcOutcome::Transient(msg)) => {
                                err_code = -1;
                                err_msg = msg;
                                break;
                            }
                            Err(e) => { err_code = -1; err_msg = e.to_string(); break; }
                        }
                    }
                    Err(e) => { err_code = -1; err_msg = e.to_string(); break; }
                }
            }
            n = stderr.read(&mut err_buf), if !stderr_done => {
                match n {
                    Ok(0) => stderr_done = true,
                    Ok(n) => {
                        if total_err.len() < CHP_STDERR_CHUNK {
                            total_err.extend_from_slice(&err_buf[..n]);
                        }
                        error!("pipe_cmd(cmd_id={cmd_id}): {}", String::from_utf8_lossy(&err_buf[..n]));
                    }
                    Err(e) => { warn!("pipe_out_cmd(cmd_id={cmd_id}) stderr read error: {e}"); stderr_done = true; }
                }
            }
        }
    }

    let status = child.wait().await;
    if err_code == 0 {
        err_code = match status {
            Ok(s) => s.code().unwrap_or(-1),
            Err(_) => -1,
        };
    }
    if err_code != 0 && err_msg.is_empty() {
        err_msg = String::from_utf8_lossy(&total_err).to_string();
    }

    let close_msg = ChpMessage::Close {
        err_code,
        err_msg: err_msg.clone(),
    };
    if let Err(e) = client
        .inner
        .chp_send_pipe_out_data(tarpc::context::current(), cmd_id, close_msg)
        .await
    {
        error!("pipe_out_cmd(cmd_id={cmd_id}) final chp_send_pipe_out_data failed: {e}");
    }

    (err_code, err_msg)
}

struct ChpRecord {
    state: StdMutex<TaskState>,
    transferred_size: AtomicU64,
    finished: StdMutex<Option<Finished>>,
    data_tx: mpsc::Sender<ChpMessage>,
}

#[derive(Default)]
pub struct ChpTable {
    records: StdMutex<HashMap<i64, Arc<ChpRecord>>>,
}

impl ChpTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn gc(records: &mut HashMap<i64, Arc<ChpRecord>>) {
        records.retain(|_, r| match &*r.finished.lock().unwrap() {
            Some(f) => f.at.elapsed() < CHP_TASK_TTL,
            None => true,
        });
    }

    /// Initiator side of the pipe: spawns `src_cmd` locally, after
    /// telling the peer to run `dst_cmd` and stream its stdout back here.
    pub fn create(
        &self,
        src_cmd: String,
        dst_addr: SocketAddr,
        dst_cmd: String,
        my_ip: String,
        secret: String,
        shutdown: ShutdownGuard,
    ) -> i64 {
        let cmd_id = crate::task::new_task_id();
        let (data_tx, data_rx) = mpsc::channel(1);
        let record = Arc::new(ChpRecord {
            state: StdMutex::new(TaskState::Running),
            transferred_size: AtomicU64::new(0),
            finished: StdMutex::new(None),
            data_tx,
        });
        {
            let mut records = self.records.lock().unwrap();
            Self::gc(&mut records);
            records.insert(cmd_id, record.clone());
        }

        tokio::spawn(async move {
            let _ticket = shutdown.track();
            let (err_code, err_msg) =
                run_pipe_cmd(cmd_id, &src_cmd, dst_addr, &dst_cmd, &my_ip, &secret, data_rx, &record).await;
            let final_state = if err_code == 0 {
                TaskState::Success
            } else {
                TaskState::Failed(err_msg)
            };
            *record.state.lock().unwrap() = final_state;
            *record.finished.lock().unwrap() = Some(Finished { at: Instant::now() });
        });

        cmd_id
    }

    /// Called by the RPC server handler for `chp_send_pipe_out_data`. The
    /// channel capacity (1) is what makes this call block until the local
    /// writer drains the previous chunk — the backpressure invariant.
    pub async fn recv_pipe_out_data(&self, cmd_id: i64, msg: ChpMessage) -> Result<(), String> {
        let record = {
            let records = self.records.lock().unwrap();
            records
                .get(&cmd_id)
                .cloned()
                .ok_or_else(|| format!("recv pipe cmd({cmd_id}) not exists!"))?
        };
        if !record.state.lock().unwrap().is_running() {
            return Err(format!("pipe cmd({cmd_id}) already finished!"));
        }
        record
            .data_tx
            .send(msg)
            .await
            .map_err(|_| format!("pipe cmd({cmd_id}) receiver gone"))
    }

    pub fn get_state(&self, cmd_id: i64) -> Option<ChpState> {
        let record = self.records.lock().unwrap().get(&cmd_id).cloned()?;
        let state = record.state.lock().unwrap().clone();
        Some(ChpState {
            err_msg: state.err_msg(),
            state: TaskStateWire::from(&state),
            transferred_size: record.transferred_size.load(Ordering::Relaxed),
        })
    }

    pub fn remove(&self, cmd_id: i64) -> Result<(), String> {
        let mut records = self.records.lock().unwrap();
        match records.get(&cmd_id) {
            None => Err(format!("recv pipe cmd({cmd_id}) not exists!")),
            Some(r) if r.state.lock().unwrap().is_running() => {
                Err(format!("recv pipe cmd({cmd_id}) is running!"))
            }
            Some(_) => {
                records.remove(&cmd_id);
                Ok(())
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_pipe_cmd(
    cmd_id: i64,
    src_cmd: &str,
    dst_addr: SocketAddr,
    dst_cmd: &str,
    my_ip: &str,
    secret: &str,
    mut data_rx: mpsc::Receiver<ChpMessage>,
    record: &ChpRecord,
) -> (i32, String) {
    let client = match AgentClient::connect(dst_addr, secret).await {
        Ok(c) => c,
        Err(e) => return (-1, format!("Can not connect {dst_addr}: {e}")),
    };

    match client
        .inner
        .chp_create_pipe_out_cmd(tarpc::context::current(), cmd_id, my_ip.to_string(), dst_cmd.to_string())
        .await
    {
        Ok(RpcOutcome::Ok(())) => {}
        Ok(RpcOutcome::Domain(_, msg)) | Ok(RpcOutcome::Transient(msg)) => {
            return (-1, format!("rpc.chp_create_pipe_out_cmd({dst_addr}) failed: {msg}"));
        }
        Err(e) => return (-1, format!("rpc.chp_create_pipe_out_cmd({dst_addr}) failed: {e}")),
    }

    let mut child = match Command::new("sh")
        .arg("-c")
        .arg(src_cmd)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
    {
        Ok(c) => c,
        Err(e) => return (-1, e.to_string()),
    };
    let mut stdin = child.stdin.take().unwrap();
    let mut stderr = child.stderr.take().unwrap();

    let mut transferred: u64 = 0;
    let mut log_time = Instant::now();
    let mut err_code = 0;
    let mut err_msg = String::new();
    let mut broken_pipe = false;
    let mut err_buf = [0u8; 4096];

    'outer: loop {
        tokio::select! {
            n = stderr.read(&mut err_buf) => {
                if let Ok(n) = n {
                    if n > 0 {
                        warn!("pipe_cmd(cmd_id={cmd_id}): {}", String::from_utf8_lossy(&err_buf[..n]));
                    }
                }
            }
            msg = data_rx.recv() => {
                let Some(msg) = msg else { break 'outer };
                match msg {
                    ChpMessage::Data(bytes) => {
                        if broken_pipe {
                            continue;
                        }
                        if let Err(e) = stdin.write_all(&bytes).await {
                            warn!("pipe_cmd(cmd_id={cmd_id}) maybe exit, because write data error: {e}");
                            broken_pipe = true;
                            err_code = -1;
                            err_msg = format!("broken pipe: {e}");
                            continue;
                        }
                        transferred += bytes.len() as u64;
                        if log_time.elapsed() >= CHP_PROGRESS_INTERVAL {
                            record.transferred_size.store(transferred, Ordering::Relaxed);
                            log_time = Instant::now();
                        }
                    }
                    ChpMessage::Close { err_code: remote_code, err_msg: remote_msg } => {
                        let _ = stdin.shutdown().await;
                        if remote_code != 0 {
                            err_code = remote_code;
                            err_msg = if err_msg.is_empty() {
                                remote_msg
                            } else {
                                format!("{err_msg} *** {remote_msg}")
                            };
                        }
                        break 'outer;
                    }
                }
            }
        }
    }

    record.transferred_size.store(transferred, Ordering::Relaxed);

    let status = child.wait().await;
    if err_code == 0 {
        err_code = match status {
            Ok(s) => s.code().unwrap_or(-1),
            Err(_) => -1,
        };
    }

    match AgentClient::connect(dst_addr, secret).await {
        Ok(c) => {
            if let Err(e) = c
                .inner
                .chp_remove_pipe_out_cmd(tarpc::context::current(), cmd_id)
                .await
            {
                error!("rpc.chp_remove_pipe_out_cmd({cmd_id}) failed: {e}");
            }
        }
        Err(e) => error!("can not connect {dst_addr} to remove pipe out cmd: {e}"),
    }

    (err_code, err_msg)
}

/// `trans_dir`: pipes `tar -cf - -C <remote_dir> .` into
/// `tar -xf - -C <local_dir>` — the primary pull-direction whole-tree
/// replication mechanism.
pub async fn trans_dir(
    table: &ChpTable,
    dst_addr: SocketAddr,
    remote_dir: &str,
    local_dir: &str,
    my_ip: String,
    secret: String,
    shutdown: ShutdownGuard,
) -> Result<(), String> {
    let local_cmd = format!("tar -xf - -C {local_dir}");
    let remote_cmd = format!("tar -cf - -C {remote_dir} .");
    let cmd_id = table.create(local_cmd, dst_addr, remote_cmd, my_ip, secret, shutdown);

    loop {
        let Some(state) = table.get_state(cmd_id) else {
            return Err(format!("chp task {cmd_id} vanished"));
        };
        match state.state {
            TaskStateWire::Running => {
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
            TaskStateWire::Success => {
                let _ = table.remove(cmd_id);
                return Ok(());
            }
            TaskStateWire::Failed => {
                let _ = table.remove(cmd_id);
                return Err(if state.err_msg.is_empty() {
                    "remote command failed!".to_string()
                } else {
                    state.err_msg
                });
            }
        }
    }
}
