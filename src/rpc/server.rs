//! The RPC handler surface (C10): implements [`ClupAgentRpc`] and binds the
//! accept loop.
//!
//! Grounded on `original_source/lib/service_hander.py`'s `ServiceHandle`
//! (one method per RPC, each a thin wrapper over a helper module) and on
//! `other_examples`'s `metjm-planning-agent` daemon server for the
//! `authenticate`-gates-everything-else shape and the
//! `tarpc::serde_transport::tcp::listen` + `BaseChannel` accept loop.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context as _;
use futures::StreamExt;
use tarpc::context::Context;
use tarpc::server::{self, Channel};
use tarpc::tokio_serde::formats::Bincode;
use tracing::{error, info, warn};

use crate::cfgfile::{self, DeliType};
use crate::config::Config;
use crate::controller_client::ControllerClient;
use crate::defaults::{DEFAULT_AGENT_RPC_PORT, DEFAULT_LTC_OUTPUT_QSIZE, DEFAULT_LTC_OUTPUT_TIMEOUT};
use crate::osglue::{mount, run_cmd as run_cmd_glue, vip};
use crate::pg::wal;
use crate::rpc::service::ClupAgentRpc;
use crate::rpc::types::*;
use crate::shutdown::ShutdownGuard;
use crate::task::cft::CftTable;
use crate::task::chp::{ChpTable, PipeOutTable};
use crate::task::ltc::LtcTable;

/// One instance is cloned per accepted connection; `authenticated` is
/// wrapped in its own `Arc` so every clone made *for that connection*
/// shares it, while a fresh connection gets a fresh flag.
#[derive(Clone)]
pub struct ClupAgentServer {
    config: Arc<Config>,
    secret: Arc<str>,
    authenticated: Arc<AtomicBool>,
    ltc: Arc<LtcTable>,
    chp: Arc<ChpTable>,
    pipe_out: Arc<PipeOutTable>,
    cft: Arc<CftTable>,
    controller: Arc<ControllerClient>,
    shutdown: ShutdownGuard,
}

impl ClupAgentServer {
    /// A fresh connection gets its own `authenticated` flag; everything
    /// else is shared.
    fn for_connection(&self) -> Self {
        ClupAgentServer {
            config: self.config.clone(),
            secret: self.secret.clone(),
            authenticated: Arc::new(AtomicBool::new(false)),
            ltc: self.ltc.clone(),
            chp: self.chp.clone(),
            pipe_out: self.pipe_out.clone(),
            cft: self.cft.clone(),
            controller: self.controller.clone(),
            shutdown: self.shutdown.clone(),
        }
    }

    fn check_auth<T>(&self) -> Result<(), RpcOutcome<T>> {
        if self.authenticated.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RpcOutcome::domain(1, "not authenticated, call authenticate() first"))
        }
    }

    fn agent_port(&self) -> u16 {
        self.config
            .get_int("agent_rpc_port")
            .ok()
            .and_then(|p| u16::try_from(p).ok())
            .unwrap_or(DEFAULT_AGENT_RPC_PORT)
    }

    fn resolve_peer(&self, host: &str) -> Result<SocketAddr, String> {
        format!("{host}:{}", self.agent_port())
            .parse()
            .map_err(|e| format!("invalid host {host}: {e}"))
    }

    fn my_ip(&self) -> String {
        self.config.get_or("my_ip", "")
    }
}

#[allow(clippy::too_many_arguments)]
pub fn new_server(
    config: Arc<Config>,
    controller: Arc<ControllerClient>,
    shutdown: ShutdownGuard,
) -> ClupAgentServer {
    let secret: Arc<str> = Arc::from(config.get_or("internal_rpc_pass", ""));
    ClupAgentServer {
        config,
        secret,
        authenticated: Arc::new(AtomicBool::new(false)),
        ltc: Arc::new(LtcTable::new()),
        chp: Arc::new(ChpTable::new()),
        pipe_out: Arc::new(PipeOutTable::new()),
        cft: Arc::new(CftTable::new()),
        controller,
        shutdown,
    }
}

/// Expands a `*`-wildcard path pattern (one wildcard per path segment, no
/// `**`/`?`) against the filesystem, in place of pulling in a dedicated
/// glob crate for this single call site.
fn expand_glob(pattern: &str) -> Vec<std::path::PathBuf> {
    let is_absolute = pattern.starts_with('/');
    let segments: Vec<&str> = pattern.split('/').filter(|s| !s.is_empty()).collect();
    let base = if is_absolute { Path::new("/") } else { Path::new(".") };
    let mut out = Vec::new();
    expand_glob_segments(&segments, base.to_path_buf(), &mut out);
    out
}

fn expand_glob_segments(segments: &[&str], base: std::path::PathBuf, out: &mut Vec<std::path::PathBuf>) {
    let Some((seg, rest)) = segments.split_first() else {
        out.push(base);
        return;
    };
    if !seg.contains('*') {
        expand_glob_segments(rest, base.join(seg), out);
        return;
    }
    let Ok(re) = regex::Regex::new(&format!("^{}$", regex::escape(seg).replace(r"\*", ".*"))) else {
        return;
    };
    let Ok(entries) = std::fs::read_dir(&base) else { return };
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        if re.is_match(&name) {
            expand_glob_segments(rest, entry.path(), out);
        }
    }
}

fn stat_info(meta: &std::fs::Metadata) -> StatInfo {
    StatInfo {
        mode: meta.mode(),
        uid: meta.uid(),
        gid: meta.gid(),
        size: meta.len(),
        atime: meta.atime(),
        mtime: meta.mtime(),
        is_dir: meta.is_dir(),
        is_symlink: meta.file_type().is_symlink(),
    }
}

impl ClupAgentRpc for ClupAgentServer {
    async fn authenticate(self, _: Context, secret: String) -> RpcOutcome<()> {
        if secret == *self.secret {
            self.authenticated.store(true, Ordering::SeqCst);
            RpcOutcome::Ok(())
        } else {
            warn!("authentication failed: bad secret");
            RpcOutcome::domain(1, "bad secret")
        }
    }

    // --- filesystem / process primitives ---

    async fn copy_file(self, _: Context, src: String, dst: String) -> RpcOutcome<()> {
        if let Err(e) = self.check_auth() { return e; }
        tokio::fs::copy(&src, &dst).await.map(|_| ()).map_err(anyhow::Error::from).into()
    }

    async fn delete_file(self, _: Context, path: String) -> RpcOutcome<()> {
        if let Err(e) = self.check_auth() { return e; }
        let p = Path::new(&path);
        let meta = match tokio::fs::symlink_metadata(p).await {
            Ok(m) => m,
            Err(_) => return RpcOutcome::domain(1, "file not exists"),
        };
        let result = if meta.is_dir() && !meta.file_type().is_symlink() {
            tokio::fs::remove_dir_all(p).await
        } else {
            tokio::fs::remove_file(p).await
        };
        result.map_err(anyhow::Error::from).into()
    }

    async fn change_file_name(self, _: Context, src: String, dst: String) -> RpcOutcome<()> {
        if let Err(e) = self.check_auth() { return e; }
        if !Path::new(&src).exists() {
            return RpcOutcome::domain(1, "file not exists");
        }
        tokio::fs::rename(&src, &dst).await.map_err(anyhow::Error::from).into()
    }

    async fn os_path_exists(self, _: Context, path: String) -> RpcOutcome<bool> {
        if let Err(e) = self.check_auth() { return e; }
        RpcOutcome::Ok(Path::new(&path).exists())
    }

    async fn os_read_file(self, _: Context, path: String, offset: u64, len: u32) -> RpcOutcome<Vec<u8>> {
        if let Err(e) = self.check_auth() { return e; }
        (|| -> anyhow::Result<Vec<u8>> {
            use std::io::{Read, Seek, SeekFrom};
            let mut f = std::fs::File::open(&path)?;
            f.seek(SeekFrom::Start(offset))?;
            let mut buf = vec![0u8; len as usize];
            let n = f.read(&mut buf)?;
            buf.truncate(n);
            Ok(buf)
        })()
        .into()
    }

    async fn os_write_file(self, _: Context, path: String, offset: u64, data: Vec<u8>) -> RpcOutcome<()> {
        if let Err(e) = self.check_auth() { return e; }
        (|| -> anyhow::Result<()> {
            use std::io::{Seek, SeekFrom, Write};
            let mut f = std::fs::OpenOptions::new().write(true).create(true).open(&path)?;
            f.seek(SeekFrom::Start(offset))?;
            f.write_all(&data)?;
            Ok(())
        })()
        .into()
    }

    async fn os_listdir(self, _: Context, path: String) -> RpcOutcome<Vec<String>> {
        if let Err(e) = self.check_auth() { return e; }
        (|| -> anyhow::Result<Vec<String>> {
            let mut names = Vec::new();
            for entry in std::fs::read_dir(&path)? {
                names.push(entry?.file_name().to_string_lossy().to_string());
            }
            Ok(names)
        })()
        .into()
    }

    async fn os_stat(self, _: Context, path: String) -> RpcOutcome<StatInfo> {
        if let Err(e) = self.check_auth() { return e; }
        std::fs::metadata(&path).map(|m| stat_info(&m)).map_err(anyhow::Error::from).into()
    }

    async fn os_chown(self, _: Context, path: String, uid: u32, gid: u32) -> RpcOutcome<()> {
        if let Err(e) = self.check_auth() { return e; }
        nix::unistd::chown(path.as_str(), Some(nix::unistd::Uid::from_raw(uid)), Some(nix::unistd::Gid::from_raw(gid)))
            .map_err(|e| anyhow::anyhow!(e))
            .into()
    }

    async fn os_chmod(self, _: Context, path: String, mode: u32) -> RpcOutcome<()> {
        if let Err(e) = self.check_auth() { return e; }
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode))
            .map_err(anyhow::Error::from)
            .into()
    }

    async fn os_makedirs(self, _: Context, path: String, mode: u32) -> RpcOutcome<()> {
        if let Err(e) = self.check_auth() { return e; }
        (|| -> anyhow::Result<()> {
            std::fs::create_dir_all(&path)?;
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode))?;
            Ok(())
        })()
        .into()
    }

    async fn os_readlink(self, _: Context, path: String) -> RpcOutcome<String> {
        if let Err(e) = self.check_auth() { return e; }
        std::fs::read_link(&path)
            .map(|p| p.to_string_lossy().to_string())
            .map_err(anyhow::Error::from)
            .into()
    }

    async fn os_real_path(self, _: Context, path: String) -> RpcOutcome<String> {
        if let Err(e) = self.check_auth() { return e; }
        std::fs::canonicalize(&path)
            .map(|p| p.to_string_lossy().to_string())
            .map_err(anyhow::Error::from)
            .into()
    }

    async fn os_rename(self, _: Context, src: String, dst: String) -> RpcOutcome<()> {
        if let Err(e) = self.check_auth() { return e; }
        std::fs::rename(&src, &dst).map_err(anyhow::Error::from).into()
    }

    async fn os_kill(self, _: Context, pid: i32, signal: i32) -> RpcOutcome<()> {
        if let Err(e) = self.check_auth() { return e; }
        let Ok(sig) = nix::sys::signal::Signal::try_from(signal) else {
            return RpcOutcome::domain(1, format!("invalid signal {signal}"));
        };
        nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), sig)
            .map_err(|e| anyhow::anyhow!(e))
            .into()
    }

    async fn get_child_pid_list(self, _: Context, pid: i32) -> RpcOutcome<Vec<i32>> {
        if let Err(e) = self.check_auth() { return e; }
        (|| -> anyhow::Result<Vec<i32>> {
            let mut out = Vec::new();
            for entry in std::fs::read_dir("/proc")? {
                let entry = entry?;
                let Some(child_pid) = entry.file_name().to_string_lossy().parse::<i32>().ok() else {
                    continue;
                };
                let stat = std::fs::read_to_string(format!("/proc/{child_pid}/stat")).unwrap_or_default();
                if let Some(ppid) = stat.rsplit(')').next().and_then(|rest| rest.split_whitespace().nth(1)) {
                    if ppid.parse::<i32>() == Ok(pid) {
                        out.push(child_pid);
                    }
                }
            }
            Ok(out)
        })()
        .into()
    }

    async fn file_read(self, _: Context, path: String) -> RpcOutcome<Vec<u8>> {
        if let Err(e) = self.check_auth() { return e; }
        tokio::fs::read(&path).await.map_err(anyhow::Error::from).into()
    }

    async fn file_write(self, _: Context, path: String, data: Vec<u8>) -> RpcOutcome<()> {
        if let Err(e) = self.check_auth() { return e; }
        tokio::fs::write(&path, data).await.map_err(anyhow::Error::from).into()
    }

    async fn append_file(self, _: Context, path: String, data: Vec<u8>) -> RpcOutcome<()> {
        if let Err(e) = self.check_auth() { return e; }
        (|| -> anyhow::Result<()> {
            use std::io::Write;
            let mut f = std::fs::OpenOptions::new().create(true).append(true).open(&path)?;
            f.write_all(&data)?;
            Ok(())
        })()
        .into()
    }

    async fn mktemp(self, _: Context, prefix: String) -> RpcOutcome<String> {
        if let Err(e) = self.check_auth() { return e; }
        let unique = crate::task::new_task_id();
        RpcOutcome::Ok(format!("{}clup-agent-{unique}", prefix))
    }

    async fn receive_file(self, _: Context, path: String, data: Vec<u8>) -> RpcOutcome<()> {
        if let Err(e) = self.check_auth() { return e; }
        (|| -> anyhow::Result<()> {
            if let Some(parent) = Path::new(&path).parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&path, data)?;
            Ok(())
        })()
        .into()
    }

    async fn extract_file(self, _: Context, tar_path: String, dest_dir: String) -> RpcOutcome<()> {
        if let Err(e) = self.check_auth() { return e; }
        std::fs::create_dir_all(&dest_dir).ok();
        let result = run_cmd_glue::run_cmd_result(&format!("tar -xf {tar_path} -C {dest_dir}")).await;
        if result.ret_code == 0 {
            RpcOutcome::Ok(())
        } else {
            RpcOutcome::domain(1, result.stderr)
        }
    }

    async fn get_file_size(self, _: Context, path: String) -> RpcOutcome<u64> {
        if let Err(e) = self.check_auth() { return e; }
        std::fs::metadata(&path).map(|m| m.len()).map_err(anyhow::Error::from).into()
    }

    // --- users/groups ---

    async fn pwd_getpwnam(self, _: Context, name: String) -> RpcOutcome<PwdEntry> {
        if let Err(e) = self.check_auth() { return e; }
        match nix::unistd::User::from_name(&name) {
            Ok(Some(u)) => RpcOutcome::Ok(PwdEntry {
                name: u.name,
                uid: u.uid.as_raw(),
                gid: u.gid.as_raw(),
                home: u.dir.to_string_lossy().to_string(),
                shell: u.shell.to_string_lossy().to_string(),
            }),
            Ok(None) => RpcOutcome::domain(1, format!("user {name} not exists!")),
            Err(e) => RpcOutcome::transient(e.to_string()),
        }
    }

    async fn pwd_getpwuid(self, _: Context, uid: u32) -> RpcOutcome<PwdEntry> {
        if let Err(e) = self.check_auth() { return e; }
        match nix::unistd::User::from_uid(nix::unistd::Uid::from_raw(uid)) {
            Ok(Some(u)) => RpcOutcome::Ok(PwdEntry {
                name: u.name,
                uid: u.uid.as_raw(),
                gid: u.gid.as_raw(),
                home: u.dir.to_string_lossy().to_string(),
                shell: u.shell.to_string_lossy().to_string(),
            }),
            Ok(None) => RpcOutcome::domain(1, format!("user(uid={uid}) not exists!")),
            Err(e) => RpcOutcome::transient(e.to_string()),
        }
    }

    async fn grp_getgrall(self, _: Context) -> RpcOutcome<Vec<GroupEntry>> {
        if let Err(e) = self.check_auth() { return e; }
        let contents = match std::fs::read_to_string("/etc/group") {
            Ok(c) => c,
            Err(e) => return RpcOutcome::transient(e.to_string()),
        };
        let mut out = Vec::new();
        for line in contents.lines() {
            let cells: Vec<&str> = line.split(':').collect();
            if cells.len() < 4 {
                continue;
            }
            let Ok(gid) = cells[2].parse::<u32>() else { continue };
            out.push(GroupEntry {
                name: cells[0].to_string(),
                gid,
                members: cells[3].split(',').filter(|s| !s.is_empty()).map(str::to_string).collect(),
            });
        }
        RpcOutcome::Ok(out)
    }

    async fn os_user_exists(self, _: Context, name: String) -> RpcOutcome<bool> {
        if let Err(e) = self.check_auth() { return e; }
        nix::unistd::User::from_name(&name).map(|u| u.is_some()).map_err(|e| anyhow::anyhow!(e)).into()
    }

    async fn os_uid_exists(self, _: Context, uid: u32) -> RpcOutcome<bool> {
        if let Err(e) = self.check_auth() { return e; }
        nix::unistd::User::from_uid(nix::unistd::Uid::from_raw(uid))
            .map(|u| u.is_some())
            .map_err(|e| anyhow::anyhow!(e))
            .into()
    }

    // --- shell execution ---

    async fn run_cmd(self, _: Context, cmd: String) -> RpcOutcome<i32> {
        if let Err(e) = self.check_auth() { return e; }
        RpcOutcome::Ok(run_cmd_glue::run_cmd(&cmd).await)
    }

    async fn run_cmd_result(self, _: Context, cmd: String) -> RpcOutcome<CmdResult> {
        if let Err(e) = self.check_auth() { return e; }
        RpcOutcome::Ok(run_cmd_glue::run_cmd_result(&cmd).await)
    }

    async fn send_to_exec(self, _: Context, cmd: String, stdin: String) -> RpcOutcome<CmdResult> {
        if let Err(e) = self.check_auth() { return e; }
        use tokio::io::AsyncWriteExt;
        let mut child = match tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&cmd)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
        {
            Ok(c) => c,
            Err(e) => return RpcOutcome::transient(e.to_string()),
        };
        if let Some(mut pipe) = child.stdin.take() {
            let _ = pipe.write_all(format!("{stdin}\n").as_bytes()).await;
        }
        match child.wait_with_output().await {
            Ok(out) => RpcOutcome::Ok(CmdResult {
                ret_code: out.status.code().unwrap_or(-1),
                stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
            }),
            Err(e) => RpcOutcome::transient(e.to_string()),
        }
    }

    async fn run_long_term_cmd(self, _: Context, cmd: String, output_qsize: usize, output_timeout_secs: u64) -> RpcOutcome<i64> {
        if let Err(e) = self.check_auth() { return e; }
        let qsize = if output_qsize == 0 { DEFAULT_LTC_OUTPUT_QSIZE } else { output_qsize };
        let timeout = if output_timeout_secs == 0 {
            DEFAULT_LTC_OUTPUT_TIMEOUT
        } else {
            std::time::Duration::from_secs(output_timeout_secs)
        };
        RpcOutcome::Ok(self.ltc.spawn(cmd, qsize, timeout, self.shutdown.clone()))
    }

    async fn get_long_term_cmd_state(self, _: Context, cmd_id: i64) -> RpcOutcome<LtcState> {
        if let Err(e) = self.check_auth() { return e; }
        match self.ltc.get_state(cmd_id).await {
            Some(s) => RpcOutcome::Ok(s),
            None => RpcOutcome::domain(1, format!("cmd({cmd_id}) not exists")),
        }
    }

    async fn remove_long_term_cmd(self, _: Context, cmd_id: i64) -> RpcOutcome<()> {
        if let Err(e) = self.check_auth() { return e; }
        self.ltc.remove(cmd_id).map_err(|e| anyhow::anyhow!(e)).into()
    }

    async fn terminate_long_term_cmd(self, _: Context, cmd_id: i64) -> RpcOutcome<()> {
        if let Err(e) = self.check_auth() { return e; }
        self.ltc.terminate(cmd_id).await.map_err(|e| anyhow::anyhow!(e)).into()
    }

    // --- host info ---

    async fn get_agent_version(self, _: Context) -> RpcOutcome<String> {
        if let Err(e) = self.check_auth() { return e; }
        RpcOutcome::Ok(env!("CARGO_PKG_VERSION").to_string())
    }

    async fn check_os_env(self, _: Context) -> RpcOutcome<HashMap<String, String>> {
        if let Err(e) = self.check_auth() { return e; }
        let mut missing = HashMap::new();
        if !Path::new("/usr/sbin/ip").exists() && !Path::new("/sbin/ip").exists() {
            missing.insert("ip".to_string(), "iproute package is not installed".to_string());
        }
        if !Path::new("/usr/sbin/arping").exists() {
            missing.insert("arping".to_string(), "iputils package is not installed".to_string());
        }
        if !Path::new("/usr/sbin/fuser").exists() && !Path::new("/sbin/fuser").exists() {
            missing.insert("fuser".to_string(), "psmisc package is not installed".to_string());
        }
        RpcOutcome::Ok(missing)
    }

    async fn get_data_disk_use(self, _: Context, dir: String) -> RpcOutcome<u64> {
        if let Err(e) = self.check_auth() { return e; }
        match nix::sys::statvfs::statvfs(dir.as_str()) {
            Ok(s) => RpcOutcome::Ok((s.blocks() - s.blocks_free()) * s.fragment_size()),
            Err(e) => RpcOutcome::transient(e.to_string()),
        }
    }

    async fn check_port_used(self, _: Context, port: u16) -> RpcOutcome<bool> {
        if let Err(e) = self.check_auth() { return e; }
        let used = tokio::net::TcpListener::bind(("0.0.0.0", port)).await.is_err();
        RpcOutcome::Ok(used)
    }

    async fn get_pg_bin_path_list(self, _: Context, glob_pattern: String) -> RpcOutcome<Vec<String>> {
        if let Err(e) = self.check_auth() { return e; }
        let candidates = expand_glob(&glob_pattern);
        let out: std::collections::BTreeSet<String> = candidates
            .into_iter()
            .filter(|p| p.join("postgres").exists() && p.join("initdb").exists())
            .map(|p| p.to_string_lossy().to_string())
            .collect();
        RpcOutcome::Ok(out.into_iter().collect())
    }

    // --- networking ---

    async fn vip_exists(self, _: Context, ip: String) -> RpcOutcome<bool> {
        if let Err(e) = self.check_auth() { return e; }
        let Ok(addr) = ip.parse() else { return RpcOutcome::domain(1, format!("invalid vip {ip}")) };
        vip::vip_exists(addr).map_err(anyhow::Error::from).into()
    }

    async fn check_and_add_vip(self, _: Context, ip: String, _nic: String, _prefix_len: u8) -> RpcOutcome<()> {
        if let Err(e) = self.check_auth() { return e; }
        let Ok(addr) = ip.parse() else { return RpcOutcome::domain(1, format!("invalid vip {ip}")) };
        vip::check_and_add_vip(addr).await.map_err(|msg| anyhow::anyhow!(msg)).into()
    }

    async fn check_and_del_vip(self, _: Context, ip: String, _nic: String) -> RpcOutcome<()> {
        if let Err(e) = self.check_auth() { return e; }
        let Ok(addr) = ip.parse() else { return RpcOutcome::domain(1, format!("invalid vip {ip}")) };
        vip::check_and_del_vip(addr).await.map_err(|msg| anyhow::anyhow!(msg)).into()
    }

    // --- mounts ---

    async fn mount_dev(self, _: Context, dev: String, mount_point: String, _fs_type: String, _options: String) -> RpcOutcome<()> {
        if let Err(e) = self.check_auth() { return e; }
        mount::mount(&dev, &mount_point).await.map_err(|msg| anyhow::anyhow!(msg)).into()
    }

    async fn umount_dev(self, _: Context, mount_point: String) -> RpcOutcome<()> {
        if let Err(e) = self.check_auth() { return e; }
        mount::umount(&mount_point).await.map_err(|msg| anyhow::anyhow!(msg)).into()
    }

    async fn check_is_mount(self, _: Context, path: String) -> RpcOutcome<bool> {
        if let Err(e) = self.check_auth() { return e; }
        mount::is_mount(&path).await.into()
    }

    async fn check_and_mount(self, _: Context, dev: String, mount_point: String, _fs_type: String, _options: String) -> RpcOutcome<()> {
        if let Err(e) = self.check_auth() { return e; }
        match mount::is_mount(&mount_point).await {
            Ok(true) => RpcOutcome::Ok(()),
            Ok(false) => mount::mount(&dev, &mount_point).await.map_err(|msg| anyhow::anyhow!(msg)).into(),
            Err(e) => RpcOutcome::transient(e.to_string()),
        }
    }

    // --- config file ops ---

    async fn read_config_file_items(self, _: Context, path: String, keys: Vec<String>) -> RpcOutcome<HashMap<String, String>> {
        if let Err(e) = self.check_auth() { return e; }
        let keys_ref: Vec<&str> = keys.iter().map(String::as_str).collect();
        cfgfile::read_config_file_items(Path::new(&path), &keys_ref, keys.is_empty()).into()
    }

    async fn modify_config_type1(self, _: Context, path: String, kv: Vec<(String, String)>, backup: bool) -> RpcOutcome<()> {
        if let Err(e) = self.check_auth() { return e; }
        let map: HashMap<String, String> = kv.into_iter().collect();
        let stamp = backup.then(|| task_id_stamp());
        cfgfile::modify_config_type1(Path::new(&path), &map, DeliType::Equals, stamp.as_deref()).into()
    }

    async fn modify_config_type2(self, _: Context, path: String, rules: Vec<(String, String, bool)>, backup: bool) -> RpcOutcome<()> {
        if let Err(e) = self.check_auth() { return e; }
        let append_if_not = rules.iter().any(|(_, _, append)| *append);
        let compiled: anyhow::Result<Vec<(regex::Regex, String)>> = rules
            .into_iter()
            .map(|(pattern, replacement, _)| Ok((regex::Regex::new(&pattern)?, replacement)))
            .collect();
        let compiled = match compiled {
            Ok(c) => c,
            Err(e) => return RpcOutcome::domain(1, e.to_string()),
        };
        let stamp = backup.then(|| task_id_stamp());
        cfgfile::modify_config_type2(Path::new(&path), &compiled, stamp.as_deref(), append_if_not).into()
    }

    async fn config_file_set_tag_content(self, _: Context, path: String, tag: String, content: String, at_head: bool) -> RpcOutcome<()> {
        if let Err(e) = self.check_auth() { return e; }
        if at_head {
            cfgfile::config_file_set_tag_in_head(Path::new(&path), &tag, &content).into()
        } else {
            cfgfile::config_file_set_tag_content(Path::new(&path), &tag, &content).into()
        }
    }

    async fn config_file_set_tag_in_head(self, _: Context, path: String, tag: String, content: String) -> RpcOutcome<()> {
        if let Err(e) = self.check_auth() { return e; }
        cfgfile::config_file_set_tag_in_head(Path::new(&path), &tag, &content).into()
    }

    // --- postgres ---

    async fn pg_get_last_valid_wal_file(self, _: Context, pgdata: String) -> RpcOutcome<Option<String>> {
        if let Err(e) = self.check_auth() { return e; }
        wal::get_last_valid_wal_file(Path::new(&pgdata))
            .map(|p| p.map(|p| p.to_string_lossy().to_string()))
            .into()
    }

    async fn pg_get_valid_wal_list_le_pt(self, _: Context, pgdata: String, pt: String) -> RpcOutcome<Vec<String>> {
        if let Err(e) = self.check_auth() { return e; }
        wal::valid_wal_segments_from(Path::new(&pgdata), &pt)
            .map(|files| files.into_iter().map(|p| p.to_string_lossy().to_string()).collect())
            .into()
    }

    async fn pg_cp_delay_wal_from_pri(self, _: Context, pri_ip: String, pri_pgdata: String, stb_pgdata: String) -> RpcOutcome<()> {
        if let Err(e) = self.check_auth() { return e; }
        let Ok(addr) = self.resolve_peer(&pri_ip) else {
            return RpcOutcome::domain(1, format!("invalid host {pri_ip}"));
        };
        wal::cp_delayed_wal_from_pri(addr, &self.secret, &pri_pgdata, Path::new(&stb_pgdata))
            .await
            .into()
    }

    async fn modify_hba_conf(self, _: Context, pgdata: String, lines: Vec<String>) -> RpcOutcome<()> {
        if let Err(e) = self.check_auth() { return e; }
        let conf_file = format!("{pgdata}/pg_hba.conf");
        (|| -> anyhow::Result<()> {
            let content = std::fs::read_to_string(&conf_file).context("read pg_hba.conf")?;
            let mut appended = content;
            for line in &lines {
                if !appended.contains(line.as_str()) {
                    appended.push('\n');
                    appended.push_str(line);
                }
            }
            std::fs::write(&conf_file, appended).context("write pg_hba.conf")
        })()
        .into()
    }

    async fn modify_standby_delay(self, _: Context, pgdata: String, delay_secs: u64) -> RpcOutcome<()> {
        if let Err(e) = self.check_auth() { return e; }
        let conf_file = format!("{pgdata}/postgresql.auto.conf");
        let mut item = HashMap::new();
        item.insert("recovery_min_apply_delay".to_string(), format!("{delay_secs}s"));
        cfgfile::modify_config_type1(Path::new(&conf_file), &item, DeliType::Equals, None).into()
    }

    // --- CHP ---

    async fn chp_create_pipe_out_cmd(self, _: Context, cmd_id: i64, src_host: String, dst_cmd: String) -> RpcOutcome<()> {
        if let Err(e) = self.check_auth() { return e; }
        let Ok(addr) = self.resolve_peer(&src_host) else {
            return RpcOutcome::domain(1, format!("invalid host {src_host}"));
        };
        self.pipe_out.create(cmd_id, addr, dst_cmd, self.secret.to_string(), self.shutdown.clone());
        RpcOutcome::Ok(())
    }

    async fn chp_remove_pipe_out_cmd(self, _: Context, cmd_id: i64) -> RpcOutcome<()> {
        if let Err(e) = self.check_auth() { return e; }
        self.pipe_out.remove(cmd_id).map_err(|e| anyhow::anyhow!(e)).into()
    }

    async fn chp_send_pipe_out_data(self, _: Context, cmd_id: i64, msg: ChpMessage) -> RpcOutcome<()> {
        if let Err(e) = self.check_auth() { return e; }
        self.chp.recv_pipe_out_data(cmd_id, msg).await.map_err(|e| anyhow::anyhow!(e)).into()
    }

    async fn create_chp(self, _: Context, src_cmd: String, dst_host: String, dst_cmd: String) -> RpcOutcome<i64> {
        if let Err(e) = self.check_auth() { return e; }
        let Ok(addr) = self.resolve_peer(&dst_host) else {
            return RpcOutcome::domain(1, format!("invalid host {dst_host}"));
        };
        RpcOutcome::Ok(self.chp.create(src_cmd, addr, dst_cmd, self.my_ip(), self.secret.to_string(), self.shutdown.clone()))
    }

    async fn remove_chp(self, _: Context, cmd_id: i64) -> RpcOutcome<()> {
        if let Err(e) = self.check_auth() { return e; }
        self.chp.remove(cmd_id).map_err(|e| anyhow::anyhow!(e)).into()
    }

    async fn get_chp_state(self, _: Context, cmd_id: i64) -> RpcOutcome<ChpState> {
        if let Err(e) = self.check_auth() { return e; }
        match self.chp.get_state(cmd_id) {
            Some(s) => RpcOutcome::Ok(s),
            None => RpcOutcome::domain(1, format!("chp({cmd_id}) not exists")),
        }
    }

    // --- CFT ---

    async fn create_cft(self, _: Context, src_dir: String, dst_host: String, dst_dir: String, task_id: Option<i64>) -> RpcOutcome<i64> {
        if let Err(e) = self.check_auth() { return e; }
        let Ok(addr) = self.resolve_peer(&dst_host) else {
            return RpcOutcome::domain(1, format!("invalid host {dst_host}"));
        };
        RpcOutcome::Ok(self.cft.create(
            src_dir,
            addr,
            dst_dir,
            task_id,
            self.secret.to_string(),
            Some(self.controller.clone()),
            self.shutdown.clone(),
        ))
    }

    async fn get_cft_state(self, _: Context, cft_id: i64) -> RpcOutcome<CftState> {
        if let Err(e) = self.check_auth() { return e; }
        match self.cft.get_state(cft_id) {
            Some(s) => RpcOutcome::Ok(s),
            None => RpcOutcome::domain(1, format!("cft({cft_id}) not exists")),
        }
    }

    async fn remove_cft(self, _: Context, cft_id: i64) -> RpcOutcome<()> {
        if let Err(e) = self.check_auth() { return e; }
        self.cft.remove(cft_id).map_err(|e| anyhow::anyhow!(e)).into()
    }

    async fn cft_batch_cmd(self, _: Context, entries: Vec<CftEntry>) -> RpcOutcome<()> {
        if let Err(e) = self.check_auth() { return e; }
        (|| -> anyhow::Result<()> {
            for entry in entries {
                apply_cft_entry(&entry)?;
            }
            Ok(())
        })()
        .into()
    }

    async fn set_file_attr(self, _: Context, path: String, attr: FileAttr) -> RpcOutcome<()> {
        if let Err(e) = self.check_auth() { return e; }
        apply_file_attr(&path, &attr).into()
    }

    // --- logging ---

    async fn get_log_level(self, _: Context) -> RpcOutcome<String> {
        if let Err(e) = self.check_auth() { return e; }
        RpcOutcome::Ok(self.config.get_or("log_level", "info"))
    }

    async fn set_log_level(self, _: Context, level: String) -> RpcOutcome<()> {
        if let Err(e) = self.check_auth() { return e; }
        self.config.set("log_level", level);
        RpcOutcome::Ok(())
    }

    // --- self ---

    async fn restart_agent(self, _: Context) -> RpcOutcome<()> {
        if let Err(e) = self.check_auth() { return e; }
        let cmd = if Path::new("/usr/bin/systemctl").exists() {
            "systemctl restart clup-agent"
        } else {
            "service clup-agent restart"
        };
        let result = run_cmd_glue::run_cmd_result(cmd).await;
        if result.ret_code == 0 {
            RpcOutcome::Ok(())
        } else {
            RpcOutcome::transient(result.stderr)
        }
    }
}

fn task_id_stamp() -> String {
    crate::task::new_task_id().to_string()
}

fn apply_file_attr(path: &str, attr: &FileAttr) -> anyhow::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    use nix::sys::stat::{utimensat, UtimensatFlags};
    use nix::sys::time::TimeSpec;

    std::fs::set_permissions(path, std::fs::Permissions::from_mode(attr.mode))?;
    nix::unistd::chown(path, Some(nix::unistd::Uid::from_raw(attr.uid)), Some(nix::unistd::Gid::from_raw(attr.gid)))?;
    utimensat(
        None,
        path,
        &TimeSpec::new(attr.atime, 0),
        &TimeSpec::new(attr.mtime, 0),
        UtimensatFlags::NoFollowSymlink,
    )
    .map_err(|e| anyhow::anyhow!(e))?;
    Ok(())
}

fn apply_cft_entry(entry: &CftEntry) -> anyhow::Result<()> {
    match entry.kind {
        EntryKind::Dir => {
            std::fs::create_dir_all(&entry.path)?;
        }
        EntryKind::Link => {
            let target = entry
                .link_target
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("link entry {} missing target", entry.path))?;
            let _ = std::fs::remove_file(&entry.path);
            std::os::unix::fs::symlink(target, &entry.path)?;
            return Ok(());
        }
        EntryKind::File => {
            let data = entry
                .data
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("file entry {} missing inline data", entry.path))?;
            std::fs::write(&entry.path, data)?;
        }
    }
    apply_file_attr(&entry.path, &entry.attr)
}

/// Accepts connections on `addr`, giving each its own [`ClupAgentServer`]
/// clone (and thus its own `authenticated` flag), exactly the shape of
/// `run_daemon_server`/`run_subscriber_listener`: `tcp::listen` +
/// `BaseChannel::with_defaults` + `channel.execute(...).for_each(spawn)`.
pub async fn run(server: ClupAgentServer, addr: SocketAddr, shutdown: ShutdownGuard) -> anyhow::Result<()> {
    let mut listener = tarpc::serde_transport::tcp::listen(addr, Bincode::default)
        .await
        .with_context(|| format!("bind agent rpc service on {addr}"))?;
    info!("clup-agent listening on {addr}");

    loop {
        tokio::select! {
            Some(result) = listener.next() => {
                match result {
                    Ok(transport) => {
                        let conn_server = server.for_connection();
                        let channel = server::BaseChannel::with_defaults(transport);
                        tokio::spawn(async move {
                            channel.execute(conn_server.serve()).for_each(|resp| async {
                                tokio::spawn(resp);
                            }).await;
                        });
                    }
                    Err(e) => error!("accept error: {e}"),
                }
            }
            _ = shutdown.cancelled() => {
                info!("rpc accept loop stopping");
                break;
            }
        }
    }

    Ok(())
}
