//! Registration loop (C4), grounded on
//! `original_source/lib/register_node.py::register_node`.

use std::sync::Arc;

use anyhow::Result;
use tarpc::context;
use tracing::{error, info};

use crate::config::Config;
use crate::controller_client::ControllerClient;
use crate::defaults::REGISTER_RETRY_SLEEP;
use crate::rpc::types::RpcOutcome;

/// Repeat until registration succeeds or is permanently rejected.
/// On success, merges the controller's response key/values into the
/// config (e.g. any server-assigned overrides) and returns. On permanent
/// rejection, exits the process with status 1, matching the original's
/// `os._exit(1)` on a fatal registration error.
pub async fn run_registration_loop(config: Arc<Config>, controller: &ControllerClient) -> Result<()> {
    loop {
        match try_register(&config, controller).await {
            Ok(()) => {
                info!("registered with controller");
                return Ok(());
            }
            Err(RegisterOutcome::Permanent(msg)) => {
                error!("register failed: {msg}");
                std::process::exit(1);
            }
            Err(RegisterOutcome::Transient(msg)) => {
                info!("register failed, will retry in {:?}: {msg}", REGISTER_RETRY_SLEEP);
                tokio::time::sleep(REGISTER_RETRY_SLEEP).await;
            }
        }
    }
}

enum RegisterOutcome {
    Permanent(String),
    Transient(String),
}

async fn try_register(config: &Config, controller: &ControllerClient) -> std::result::Result<(), RegisterOutcome> {
    let rpc = controller
        .get_server_connect()
        .await
        .map_err(|e| RegisterOutcome::Transient(e.to_string()))?;

    let hostname = hostname()?;
    let my_ip = config.get_or("my_ip", "");
    let mem_size = crate::hostinfo::get_mem_size();
    let cpu_info = crate::hostinfo::get_cpu_info()
        .map(|m| serde_json::to_string(&m).unwrap_or_default())
        .unwrap_or_default();
    let os_type = crate::hostinfo::get_os_type();

    let result = rpc
        .register_node(context::current(), hostname, my_ip, mem_size, cpu_info, os_type)
        .await
        .map_err(|e| RegisterOutcome::Transient(e.to_string()))?;

    match result {
        RpcOutcome::Ok(payload) => {
            for (k, v) in payload {
                config.set(k, v);
            }
            Ok(())
        }
        RpcOutcome::Domain(_, msg) => Err(RegisterOutcome::Permanent(msg)),
        RpcOutcome::Transient(msg) => Err(RegisterOutcome::Transient(msg)),
    }
}

fn hostname() -> std::result::Result<String, RegisterOutcome> {
    nix::unistd::gethostname()
        .map_err(|e| RegisterOutcome::Transient(format!("gethostname: {e}")))?
        .into_string()
        .map_err(|_| RegisterOutcome::Transient("hostname is not valid UTF-8".to_string()))
}
