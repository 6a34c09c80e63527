//! Wire types shared between the RPC trait, the server handlers and the
//! controller/agent clients. The task record shape and the
//! `(err_code, payload)` wire convention are translated into a Rust shape
//! per `storage_controller/src/peer_client.rs`'s style of a small
//! `thiserror` enum at each RPC seam.

use serde::{Deserialize, Serialize};

/// `err_code == 0` success / `> 0` permanent domain error / `< 0` transient,
/// retryable error, kept as data rather than folded into
/// `Result` so handlers can serialize it unchanged over the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RpcOutcome<T> {
    Ok(T),
    /// Caller MUST NOT retry.
    Domain(i32, String),
    /// Caller MAY retry.
    Transient(String),
}

impl<T> RpcOutcome<T> {
    pub fn domain(code: i32, msg: impl Into<String>) -> Self {
        assert!(code > 0, "domain error codes must be positive");
        RpcOutcome::Domain(code, msg.into())
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        RpcOutcome::Transient(msg.into())
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, RpcOutcome::Ok(_))
    }
}

impl<T> From<anyhow::Result<T>> for RpcOutcome<T> {
    fn from(r: anyhow::Result<T>) -> Self {
        match r {
            Ok(v) => RpcOutcome::Ok(v),
            Err(e) => RpcOutcome::Transient(e.to_string()),
        }
    }
}

/// Tri-state task record status. `Failed`/
/// `Success` carry no field implying "still running", so the
/// `end_time ⇔ state != Running` invariant holds by construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    Running,
    Success,
    Failed(String),
}

impl TaskState {
    pub fn is_running(&self) -> bool {
        matches!(self, TaskState::Running)
    }

    pub fn err_code(&self) -> i32 {
        match self {
            TaskState::Running => 0,
            TaskState::Success => 0,
            TaskState::Failed(_) => -1,
        }
    }

    pub fn err_msg(&self) -> String {
        match self {
            TaskState::Failed(msg) => msg.clone(),
            _ => String::new(),
        }
    }
}

/// The controller's answer to `get_clup_node_info` (grounded on
/// `original_source/lib/rpc_utils.py::get_server_connect`'s
/// `primary_host, clup_host_list = c1.get_clup_node_info()` call).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClupNodeInfo {
    pub primary: Option<String>,
    pub cluster_hosts: Vec<String>,
}

/// File/dir attribute bundle used by CFT.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileAttr {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub atime: i64,
    pub mtime: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    Dir,
    Link,
    File,
}

/// One entry in a CFT batch request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CftEntry {
    pub path: String,
    pub attr: FileAttr,
    pub kind: EntryKind,
    /// Populated for small, inlined files; `None` for dirs, symlinks
    /// (whose target is carried in `link_target`), and big files.
    pub data: Option<Vec<u8>>,
    pub link_target: Option<String>,
}

/// CHP pipe-out protocol envelope, dispatched on in `chp_send_pipe_out_data`:
/// any tag other than these two is a protocol error, which falls out
/// naturally from deserialization here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ChpMessage {
    Data(Vec<u8>),
    Close { err_code: i32, err_msg: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LtcState {
    pub state: TaskStateWire,
    pub err_code: i32,
    pub err_msg: String,
    pub stdout_lines: Vec<String>,
    pub stderr_lines: Vec<String>,
}

/// `TaskState` without its payload, for compact wire transfer next to the
/// `stdout_lines`/`stderr_lines` drain returned by `get_long_term_cmd_state`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStateWire {
    Running,
    Success,
    Failed,
}

impl From<&TaskState> for TaskStateWire {
    fn from(s: &TaskState) -> Self {
        match s {
            TaskState::Running => TaskStateWire::Running,
            TaskState::Success => TaskStateWire::Success,
            TaskState::Failed(_) => TaskStateWire::Failed,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChpState {
    pub state: TaskStateWire,
    pub err_msg: String,
    pub transferred_size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CftState {
    pub state: TaskStateWire,
    pub err_msg: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PwdEntry {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
    pub home: String,
    pub shell: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupEntry {
    pub name: String,
    pub gid: u32,
    pub members: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CmdResult {
    pub ret_code: i32,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatInfo {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub atime: i64,
    pub mtime: i64,
    pub is_dir: bool,
    pub is_symlink: bool,
}
