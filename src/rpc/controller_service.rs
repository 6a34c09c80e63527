//! The subset of the RPC surface the agent calls *on the controller*
//! (`register_node`, `get_clup_node_info`, `task_insert_log`). The
//! controller itself lives in a separate process; this crate only needs
//! the client-side stub shape to talk to it, the way
//! `original_source/lib/rpc_utils.py` and `register_node.py` call it.

use std::collections::HashMap;

use crate::rpc::types::{ClupNodeInfo, RpcOutcome};

#[tarpc::service]
pub trait ClupControllerRpc {
    async fn authenticate(secret: String) -> RpcOutcome<()>;

    async fn register_node(
        hostname: String,
        my_ip: String,
        mem_size: u64,
        cpu_info: String,
        os_type: String,
    ) -> RpcOutcome<HashMap<String, String>>;

    async fn get_clup_node_info() -> RpcOutcome<ClupNodeInfo>;

    async fn task_insert_log(task_id: i64, task_state: String, msg: String, task_type: String) -> RpcOutcome<()>;
}
