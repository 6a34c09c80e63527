//! Cross-host file transfer (CFT, C7): walk a local directory tree and
//! replicate it to a peer agent, batching small files and streaming large
//! ones.
//!
//! Grounded on `original_source/lib/csu_file_trans.py`: `WalkHandler`'s
//! accumulate/flush logic becomes `BatchAccumulator`, `scandir`'s
//! recursive, symlink-first classification becomes a `walkdir::WalkDir`
//! pass with the same ordering rule.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::os::unix::fs::MetadataExt;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use tarpc::context;
use tracing::error;
use walkdir::WalkDir;

use crate::defaults::{CFT_BATCH_MAX_ENTRIES, CFT_BIG_FILE_SIZE, CFT_PROGRESS_INTERVAL, CFT_TASK_TTL, CFT_TRANS_BLOCK_SIZE};
use crate::rpc::client::AgentClient;
use crate::rpc::types::{CftEntry, CftState, EntryKind, FileAttr, RpcOutcome, TaskState, TaskStateWire};
use crate::shutdown::ShutdownGuard;

struct Finished {
    at: Instant,
}

struct CftRecord {
    state: StdMutex<TaskState>,
    finished: StdMutex<Option<Finished>>,
}

#[derive(Default)]
pub struct CftTable {
    records: StdMutex<HashMap<i64, Arc<CftRecord>>>,
}

impl CftTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn gc(records: &mut HashMap<i64, Arc<CftRecord>>) {
        records.retain(|_, r| match &*r.finished.lock().unwrap() {
            Some(f) => f.at.elapsed() < CFT_TASK_TTL,
            None => true,
        });
    }

    #[allow(clippy::too_many_arguments)]
    pub fn create(
        &self,
        src_dir: String,
        dst_addr: SocketAddr,
        dst_dir: String,
        task_id: Option<i64>,
        secret: String,
        controller: Option<Arc<crate::controller_client::ControllerClient>>,
        shutdown: ShutdownGuard,
    ) -> i64 {
        let cft_id = crate::task::new_task_id();
        let record = Arc::new(CftRecord {
            state: StdMutex::new(TaskState::Running),
            finished: StdMutex::new(None),
        });
        {
            let mut records = self.records.lock().unwrap();
            Self::gc(&mut records);
            records.insert(cft_id, record.clone());
        }

        tokio::spawn(async move {
            let _ticket = shutdown.track();
            let result = run_cft(&src_dir, dst_addr, &dst_dir, task_id, &secret, controller).await;
            let final_state = match result {
                Ok(()) => TaskState::Success,
                Err(msg) => TaskState::Failed(msg),
            };
            *record.state.lock().unwrap() = final_state;
            *record.finished.lock().unwrap() = Some(Finished { at: Instant::now() });
        });

        cft_id
    }

    pub fn get_state(&self, cft_id: i64) -> Option<CftState> {
        let record = self.records.lock().unwrap().get(&cft_id).cloned()?;
        let state = record.state.lock().unwrap().clone();
        Some(CftState {
            err_msg: state.err_msg(),
            state: TaskStateWire::from(&state),
        })
    }

    pub fn remove(&self, cft_id: i64) -> Result<(), String> {
        let mut records = self.records.lock().unwrap();
        match records.get(&cft_id) {
            None => Err(format!("recv pipe cmd({cft_id}) not exists!")),
            Some(r) if r.state.lock().unwrap().is_running() => {
                Err(format!("async copy cmd({cft_id}) is running!"))
            }
            Some(_) => {
                records.remove(&cft_id);
                Ok(())
            }
        }
    }
}

struct BatchAccumulator {
    entries: Vec<CftEntry>,
    inlined_bytes: u64,
}

impl BatchAccumulator {
    fn new() -> Self {
        BatchAccumulator {
            entries: Vec::new(),
            inlined_bytes: 0,
        }
    }

    fn should_flush(&self) -> bool {
        self.entries.len() > CFT_BATCH_MAX_ENTRIES || self.inlined_bytes >= CFT_BIG_FILE_SIZE
    }

    fn take(&mut self) -> Vec<CftEntry> {
        self.inlined_bytes = 0;
        std::mem::take(&mut self.entries)
    }
}

async fn flush_batch(client: &AgentClient, entries: Vec<CftEntry>) -> Result<(), String> {
    if entries.is_empty() {
        return Ok(());
    }
    match client.inner.cft_batch_cmd(context::current(), entries).await {
        Ok(RpcOutcome::Ok(())) => Ok(()),
        Ok(RpcOutcome::Domain(_, msg)) | Ok(RpcOutcome::Transient(msg)) => Err(msg),
        Err(e) => Err(e.to_string()),
    }
}

async fn send_big_file(
    client: &AgentClient,
    local_file: &std::path::Path,
    remote_path: &str,
    attr: FileAttr,
    size: u64,
) -> Result<(), String> {
    let mut file = tokio::fs::File::open(local_file)
        .await
        .map_err(|e| format!("read {}: {e}", local_file.display()))?;
    use tokio::io::AsyncReadExt;

    let mut offset: u64 = 0;
    let mut buf = vec![0u8; CFT_TRANS_BLOCK_SIZE];
    while offset < size {
        let n = file.read(&mut buf).await.map_err(|e| e.to_string())?;
        if n == 0 {
            break;
        }
        match client
            .inner
            .os_write_file(context::current(), remote_path.to_string(), offset, buf[..n].to_vec())
            .await
        {
            Ok(RpcOutcome::Ok(())) => {}
            Ok(RpcOutcome::Domain(_, msg)) | Ok(RpcOutcome::Transient(msg)) => return Err(msg),
            Err(e) => return Err(e.to_string()),
        }
        offset += n as u64;
    }

    match client
        .inner
        .set_file_attr(context::current(), remote_path.to_string(), attr)
        .await
    {
        Ok(RpcOutcome::Ok(())) => Ok(()),
        Ok(RpcOutcome::Domain(_, msg)) | Ok(RpcOutcome::Transient(msg)) => Err(msg),
        Err(e) => Err(e.to_string()),
    }
}

fn attr_of(meta: &std::fs::Metadata) -> FileAttr {
    FileAttr {
        mode: meta.mode(),
        uid: meta.uid(),
        gid: meta.gid(),
        atime: meta.atime(),
        mtime: meta.mtime(),
    }
}

async fn run_cft(
    src_dir: &str,
    dst_addr: SocketAddr,
    dst_dir: &str,
    task_id: Option<i64>,
    secret: &str,
    controller: Option<Arc<crate::controller_client::ControllerClient>>,
) -> Result<(), String> {
    let client = AgentClient::connect(dst_addr, secret)
        .await
        .map_err(|e| e.to_string())?;

    let mut batch = BatchAccumulator::new();
    let mut transed_size: u64 = 0;
    let mut transed_file_count: u64 = 0;
    let mut last_notify = Instant::now();

    for entry in WalkDir::new(src_dir).min_depth(1).follow_links(false) {
        let entry = entry.map_err(|e| e.to_string())?;
        let meta = entry
            .path()
            .symlink_metadata()
            .map_err(|e| format!("stat {}: {e}", entry.path().display()))?;
        let attr = attr_of(&meta);
        let rel = entry
            .path()
            .strip_prefix(src_dir)
            .map_err(|e| e.to_string())?;
        let remote_path = format!("{}/{}", dst_dir.trim_end_matches('/'), rel.to_string_lossy());

        if meta.file_type().is_symlink() {
            let target = std::fs::read_link(entry.path()).map_err(|e| e.to_string())?;
            batch.entries.push(CftEntry {
                path: remote_path,
                attr,
                kind: EntryKind::Link,
                data: None,
                link_target: Some(target.to_string_lossy().to_string()),
            });
        } else if meta.is_dir() {
            batch.entries.push(CftEntry {
                path: remote_path,
                attr,
                kind: EntryKind::Dir,
                data: None,
                link_target: None,
            });
            if batch.should_flush() {
                flush_batch(&client, batch.take()).await?;
                maybe_notify(task_id, &controller, &mut last_notify, transed_file_count, transed_size).await;
            }
        } else {
            transed_file_count += 1;
            let size = meta.len();
            if size >= CFT_BIG_FILE_SIZE {
                if !batch.entries.is_empty() {
                    flush_batch(&client, batch.take()).await?;
                    maybe_notify(task_id, &controller, &mut last_notify, transed_file_count, transed_size).await;
                }
                send_big_file(&client, entry.path(), &remote_path, attr, size).await?;
                transed_size += size;
                maybe_notify(task_id, &controller, &mut last_notify, transed_file_count, transed_size).await;
                continue;
            }
            let data = std::fs::read(entry.path()).map_err(|e| e.to_string())?;
            transed_size += data.len() as u64;
            batch.inlined_bytes += data.len() as u64;
            batch.entries.push(CftEntry {
                path: remote_path,
                attr,
                kind: EntryKind::File,
                data: Some(data),
                link_target: None,
            });
            if batch.should_flush() {
                flush_batch(&client, batch.take()).await?;
                maybe_notify(task_id, &controller, &mut last_notify, transed_file_count, transed_size).await;
            }
        }
    }

    flush_batch(&client, batch.take()).await?;
    Ok(())
}

async fn maybe_notify(
    task_id: Option<i64>,
    controller: &Option<Arc<crate::controller_client::ControllerClient>>,
    last_notify: &mut Instant,
    file_count: u64,
    transed_size: u64,
) {
    let Some(task_id) = task_id else { return };
    let Some(controller) = controller else { return };
    if last_notify.elapsed() < CFT_PROGRESS_INTERVAL {
        return;
    }
    *last_notify = Instant::now();
    let msg = format!("{file_count} files , {} MB has been transmitted.", transed_size / (1024 * 1024));
    if let Ok(rpc) = controller.get_server_connect().await {
        if let Err(e) = rpc
            .task_insert_log(context::current(), task_id, "0".to_string(), msg, "general".to_string())
            .await
        {
            error!("notice progress failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_flushes_past_entry_count() {
        let mut b = BatchAccumulator::new();
        for _ in 0..=CFT_BATCH_MAX_ENTRIES {
            b.entries.push(CftEntry {
                path: "x".to_string(),
                attr: FileAttr { mode: 0, uid: 0, gid: 0, atime: 0, mtime: 0 },
                kind: EntryKind::Dir,
                data: None,
                link_target: None,
            });
        }
        assert!(b.should_flush());
    }

    #[test]
    fn batch_flushes_past_inlined_byte_threshold() {
        let mut b = BatchAccumulator::new();
        b.inlined_bytes = CFT_BIG_FILE_SIZE;
        assert!(b.should_flush());
    }
}
