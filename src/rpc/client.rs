//! Agent-to-agent RPC client (C3): authenticated connection to a peer
//! agent by IP + port.
//!
//! Grounded on `original_source/lib/rpc_utils.py::get_rpc_connect` for the
//! connect-then-authenticate shape, and on `other_examples`'s
//! `metjm-planning-agent` (`authenticate(token)` as the first call on a
//! fresh transport) for the tarpc idiom.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tarpc::client;
use tarpc::context;
use tarpc::tokio_serde::formats::Bincode;

use crate::rpc::service::ClupAgentRpcClient;
use crate::rpc::types::RpcOutcome;

/// An authenticated handle to a peer agent's RPC surface.
pub struct AgentClient {
    pub inner: ClupAgentRpcClient,
}

impl AgentClient {
    pub async fn connect(addr: SocketAddr, secret: &str) -> Result<Self> {
        let transport = tarpc::serde_transport::tcp::connect(addr, Bincode::default)
            .await
            .with_context(|| format!("connect to agent at {addr}"))?;
        let inner = ClupAgentRpcClient::new(client::Config::default(), transport).spawn();

        match inner
            .authenticate(context::current(), secret.to_string())
            .await
            .context("authenticate RPC call")?
        {
            RpcOutcome::Ok(()) => Ok(AgentClient { inner }),
            RpcOutcome::Domain(code, msg) => bail!("authentication rejected by {addr} ({code}): {msg}"),
            RpcOutcome::Transient(msg) => bail!("authentication failed against {addr}: {msg}"),
        }
    }

    pub async fn connect_with_timeout(addr: SocketAddr, secret: &str, timeout: Duration) -> Result<Self> {
        tokio::time::timeout(timeout, Self::connect(addr, secret))
            .await
            .with_context(|| format!("connect to {addr} timed out after {timeout:?}"))?
    }
}
