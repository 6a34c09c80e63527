//! The RPC handler surface (C10), as a `tarpc` service trait.
//!
//! Grounded on `other_examples`'s `metjm-planning-agent` daemon RPC server
//! (a `tarpc`-based service gated by a shared auth token) for the framework
//! choice, and grouped the way the method surface is organized below.
//! Every method returns an `RpcOutcome<T>` so the `(err_code,
//! payload)` convention survives unchanged on the wire.

use crate::rpc::types::*;

#[tarpc::service]
pub trait ClupAgentRpc {
    /// Must be the first call on a fresh connection; every other handler
    /// rejects with `RpcOutcome::Domain` until this succeeds (grounded on
    /// the `authenticate`-then-`check_authenticated()` gate pattern).
    async fn authenticate(secret: String) -> RpcOutcome<()>;

    // --- filesystem / process primitives ---
    async fn copy_file(src: String, dst: String) -> RpcOutcome<()>;
    async fn delete_file(path: String) -> RpcOutcome<()>;
    async fn change_file_name(src: String, dst: String) -> RpcOutcome<()>;
    async fn os_path_exists(path: String) -> RpcOutcome<bool>;
    async fn os_read_file(path: String, offset: u64, len: u32) -> RpcOutcome<Vec<u8>>;
    async fn os_write_file(path: String, offset: u64, data: Vec<u8>) -> RpcOutcome<()>;
    async fn os_listdir(path: String) -> RpcOutcome<Vec<String>>;
    async fn os_stat(path: String) -> RpcOutcome<StatInfo>;
    async fn os_chown(path: String, uid: u32, gid: u32) -> RpcOutcome<()>;
    async fn os_chmod(path: String, mode: u32) -> RpcOutcome<()>;
    async fn os_makedirs(path: String, mode: u32) -> RpcOutcome<()>;
    async fn os_readlink(path: String) -> RpcOutcome<String>;
    async fn os_real_path(path: String) -> RpcOutcome<String>;
    async fn os_rename(src: String, dst: String) -> RpcOutcome<()>;
    async fn os_kill(pid: i32, signal: i32) -> RpcOutcome<()>;
    async fn get_child_pid_list(pid: i32) -> RpcOutcome<Vec<i32>>;
    async fn file_read(path: String) -> RpcOutcome<Vec<u8>>;
    async fn file_write(path: String, data: Vec<u8>) -> RpcOutcome<()>;
    async fn append_file(path: String, data: Vec<u8>) -> RpcOutcome<()>;
    async fn mktemp(prefix: String) -> RpcOutcome<String>;
    async fn receive_file(path: String, data: Vec<u8>) -> RpcOutcome<()>;
    async fn extract_file(tar_path: String, dest_dir: String) -> RpcOutcome<()>;
    async fn get_file_size(path: String) -> RpcOutcome<u64>;

    // --- users/groups ---
    async fn pwd_getpwnam(name: String) -> RpcOutcome<PwdEntry>;
    async fn pwd_getpwuid(uid: u32) -> RpcOutcome<PwdEntry>;
    async fn grp_getgrall() -> RpcOutcome<Vec<GroupEntry>>;
    async fn os_user_exists(name: String) -> RpcOutcome<bool>;
    async fn os_uid_exists(uid: u32) -> RpcOutcome<bool>;

    // --- shell execution ---
    async fn run_cmd(cmd: String) -> RpcOutcome<i32>;
    async fn run_cmd_result(cmd: String) -> RpcOutcome<CmdResult>;
    async fn send_to_exec(cmd: String, stdin: String) -> RpcOutcome<CmdResult>;
    async fn run_long_term_cmd(cmd: String, output_qsize: usize, output_timeout_secs: u64) -> RpcOutcome<i64>;
    async fn get_long_term_cmd_state(cmd_id: i64) -> RpcOutcome<LtcState>;
    async fn remove_long_term_cmd(cmd_id: i64) -> RpcOutcome<()>;
    async fn terminate_long_term_cmd(cmd_id: i64) -> RpcOutcome<()>;

    // --- host info ---
    async fn get_agent_version() -> RpcOutcome<String>;
    async fn check_os_env() -> RpcOutcome<std::collections::HashMap<String, String>>;
    async fn get_data_disk_use(dir: String) -> RpcOutcome<u64>;
    async fn check_port_used(port: u16) -> RpcOutcome<bool>;
    async fn get_pg_bin_path_list(glob_pattern: String) -> RpcOutcome<Vec<String>>;

    // --- networking ---
    async fn vip_exists(vip: String) -> RpcOutcome<bool>;
    async fn check_and_add_vip(vip: String, nic: String, prefix_len: u8) -> RpcOutcome<()>;
    async fn check_and_del_vip(vip: String, nic: String) -> RpcOutcome<()>;

    // --- mounts ---
    async fn mount_dev(dev: String, mount_point: String, fs_type: String, options: String) -> RpcOutcome<()>;
    async fn umount_dev(mount_point: String) -> RpcOutcome<()>;
    async fn check_is_mount(path: String) -> RpcOutcome<bool>;
    async fn check_and_mount(dev: String, mount_point: String, fs_type: String, options: String) -> RpcOutcome<()>;

    // --- config file ops ---
    async fn read_config_file_items(path: String, keys: Vec<String>) -> RpcOutcome<std::collections::HashMap<String, String>>;
    async fn modify_config_type1(path: String, kv: Vec<(String, String)>, backup: bool) -> RpcOutcome<()>;
    async fn modify_config_type2(path: String, rules: Vec<(String, String, bool)>, backup: bool) -> RpcOutcome<()>;
    async fn config_file_set_tag_content(path: String, tag: String, content: String, at_head: bool) -> RpcOutcome<()>;
    async fn config_file_set_tag_in_head(path: String, tag: String, content: String) -> RpcOutcome<()>;

    // --- postgres ---
    async fn pg_get_last_valid_wal_file(pgdata: String) -> RpcOutcome<Option<String>>;
    async fn pg_get_valid_wal_list_le_pt(pgdata: String, pt: String) -> RpcOutcome<Vec<String>>;
    async fn pg_cp_delay_wal_from_pri(pri_ip: String, pri_pgdata: String, stb_pgdata: String) -> RpcOutcome<()>;
    async fn modify_hba_conf(pgdata: String, lines: Vec<String>) -> RpcOutcome<()>;
    async fn modify_standby_delay(pgdata: String, delay_secs: u64) -> RpcOutcome<()>;

    // --- CHP ---
    async fn chp_create_pipe_out_cmd(cmd_id: i64, src_host: String, dst_cmd: String) -> RpcOutcome<()>;
    async fn chp_remove_pipe_out_cmd(cmd_id: i64) -> RpcOutcome<()>;
    async fn chp_send_pipe_out_data(cmd_id: i64, msg: ChpMessage) -> RpcOutcome<()>;
    async fn create_chp(src_cmd: String, dst_host: String, dst_cmd: String) -> RpcOutcome<i64>;
    async fn remove_chp(cmd_id: i64) -> RpcOutcome<()>;
    async fn get_chp_state(cmd_id: i64) -> RpcOutcome<ChpState>;

    // --- CFT ---
    async fn create_cft(src_dir: String, dst_host: String, dst_dir: String, task_id: Option<i64>) -> RpcOutcome<i64>;
    async fn get_cft_state(cft_id: i64) -> RpcOutcome<CftState>;
    async fn remove_cft(cft_id: i64) -> RpcOutcome<()>;
    async fn cft_batch_cmd(entries: Vec<CftEntry>) -> RpcOutcome<()>;
    async fn set_file_attr(path: String, attr: FileAttr) -> RpcOutcome<()>;

    // --- logging ---
    async fn get_log_level() -> RpcOutcome<String>;
    async fn set_log_level(level: String) -> RpcOutcome<()>;

    // --- self ---
    async fn restart_agent() -> RpcOutcome<()>;
}
