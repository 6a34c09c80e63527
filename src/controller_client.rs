//! Controller client (C2): locates the current primary controller among N
//! configured addresses by quorum, opens an authenticated RPC connection.
//!
//! Grounded on `original_source/lib/rpc_utils.py::get_server_connect` for
//! the election algorithm and on `storage_controller/src/peer_client.rs`
//! for the Rust error-handling shape (a small `thiserror` enum, a
//! module-local `Result<T>` alias).

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tarpc::client;
use tarpc::context;
use tarpc::tokio_serde::formats::Bincode;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::defaults::CONTROLLER_ELECTION_CACHE_TTL;
use crate::rpc::controller_service::ClupControllerRpcClient;
use crate::rpc::types::RpcOutcome;

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("can not find server_address config in clup-agent.conf")]
    NoServerAddress,
    #[error("cluster misconfigured: {0}")]
    ClusterMismatch(String),
    #[error("no primary controller elected")]
    NoQuorum,
    #[error("can not connect to controller {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("controller rejected the call: {0}")]
    Domain(String),
}

pub(crate) type Result<T> = std::result::Result<T, ControllerError>;

struct ElectedPrimary {
    address: (String, u16),
    elected_at: Instant,
}

pub struct ControllerClient {
    config: std::sync::Arc<Config>,
    cached: Mutex<Option<ElectedPrimary>>,
}

impl ControllerClient {
    pub fn new(config: std::sync::Arc<Config>) -> Self {
        ControllerClient {
            config,
            cached: Mutex::new(None),
        }
    }

    /// Returns an authenticated RPC handle to the current primary
    /// controller. Fatal configuration errors (empty
    /// `server_address`, cluster membership disagreement) are reported as
    /// `ControllerError` variants; callers that should treat them as
    /// process-fatal (C4 registration loop, C10 startup) decide that.
    pub async fn get_server_connect(&self) -> Result<ClupControllerRpcClient> {
        let addresses = self
            .config
            .controller_addresses()
            .map_err(|_| ControllerError::NoServerAddress)?;
        let secret = self.config.get_or("internal_rpc_pass", "");

        if addresses.len() == 1 {
            let (host, port) = &addresses[0];
            return connect_and_auth(host, *port, &secret).await;
        }

        let elected = self.elect_primary(&addresses, &secret).await?;
        connect_and_auth(&elected.0, elected.1, &secret).await
    }

    async fn elect_primary(&self, addresses: &[(String, u16)], secret: &str) -> Result<(String, u16)> {
        {
            let cached = self.cached.lock().unwrap();
            if let Some(p) = cached.as_ref() {
                if p.elected_at.elapsed() < CONTROLLER_ELECTION_CACHE_TTL {
                    return Ok(p.address.clone());
                }
            }
        }

        let my_hosts: HashSet<String> = addresses.iter().map(|(h, _)| h.clone()).collect();
        let mut votes: HashMap<String, usize> = addresses.iter().map(|(h, _)| (h.clone(), 0)).collect();

        for (host, port) in addresses {
            let info = match connect_controller(host, *port, secret).await {
                Ok(client) => match client.get_clup_node_info(context::current()).await {
                    Ok(RpcOutcome::Ok(info)) => info,
                    Ok(RpcOutcome::Domain(_, msg)) | Ok(RpcOutcome::Transient(msg)) => {
                        info!("get_clup_node_info on {host} failed: {msg}");
                        continue;
                    }
                    Err(e) => {
                        info!("can not connect to {host}:{port}: {e}");
                        continue;
                    }
                },
                Err(e) => {
                    info!("can not connect to {host}:{port}: {e}");
                    continue;
                }
            };

            debug!(
                "{host} reports primary={:?}, cluster_hosts={:?}",
                info.primary, info.cluster_hosts
            );

            if info.cluster_hosts.is_empty() {
                return Err(ControllerError::ClusterMismatch(format!(
                    "{host} is not running in multi-controller mode"
                )));
            }
            let reported: HashSet<String> = info.cluster_hosts.into_iter().collect();
            if reported.symmetric_difference(&my_hosts).next().is_some() {
                return Err(ControllerError::ClusterMismatch(format!(
                    "{host} reports cluster membership {reported:?}, configured is {my_hosts:?}"
                )));
            }

            let Some(primary) = info.primary else { continue };
            if !votes.contains_key(&primary) {
                return Err(ControllerError::ClusterMismatch(format!(
                    "{host} reports primary {primary} which is not a configured controller"
                )));
            }
            *votes.get_mut(&primary).unwrap() += 1;
        }

        let elected = votes
            .iter()
            .find(|(_, &count)| count >= crate::defaults::CONTROLLER_ELECTION_QUORUM)
            .map(|(host, _)| host.clone());

        let Some(primary_host) = elected else {
            return Err(ControllerError::NoQuorum);
        };

        let port = addresses
            .iter()
            .find(|(h, _)| h == &primary_host)
            .map(|(_, p)| *p)
            .unwrap();

        let mut cached = self.cached.lock().unwrap();
        if let Some(old) = cached.as_ref() {
            if old.address.0 != primary_host {
                warn!("switch clup server from {} to {}", old.address.0, primary_host);
            }
        }
        *cached = Some(ElectedPrimary {
            address: (primary_host.clone(), port),
            elected_at: Instant::now(),
        });

        Ok((primary_host, port))
    }
}

async fn connect_controller(host: &str, port: u16, secret: &str) -> anyhow::Result<ClupControllerRpcClient> {
    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .or_else(|_| resolve_hostname(host, port))?;
    let transport = tokio::time::timeout(
        Duration::from_secs(5),
        tarpc::serde_transport::tcp::connect(addr, Bincode::default),
    )
    .await
    .map_err(|_| anyhow::anyhow!("connect to {host}:{port} timed out"))??;
    let client = ClupControllerRpcClient::new(client::Config::default(), transport).spawn();
    match client.authenticate(context::current(), secret.to_string()).await? {
        RpcOutcome::Ok(()) => Ok(client),
        RpcOutcome::Domain(_, msg) | RpcOutcome::Transient(msg) => anyhow::bail!(msg),
    }
}

fn resolve_hostname(host: &str, port: u16) -> anyhow::Result<SocketAddr> {
    use std::net::ToSocketAddrs;
    (host, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| anyhow::anyhow!("no addresses for {host}"))
}

async fn connect_and_auth(host: &str, port: u16, secret: &str) -> Result<ClupControllerRpcClient> {
    connect_controller(host, port, secret)
        .await
        .map_err(|e| ControllerError::Connect {
            addr: format!("{host}:{port}"),
            source: e,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn votes_from(reports: &[(&str, Option<&str>, &[&str])]) -> Result<String> {
        let my_hosts: HashSet<String> = reports.iter().map(|(h, _, _)| h.to_string()).collect();
        let mut votes: HashMap<String, usize> = my_hosts.iter().map(|h| (h.clone(), 0)).collect();
        for (host, primary, cluster) in reports {
            let reported: HashSet<String> = cluster.iter().map(|s| s.to_string()).collect();
            if reported.symmetric_difference(&my_hosts).next().is_some() {
                return Err(ControllerError::ClusterMismatch(format!("{host} mismatch")));
            }
            if let Some(p) = primary {
                *votes.entry(p.to_string()).or_insert(0) += 1;
            }
        }
        votes
            .into_iter()
            .find(|(_, c)| *c >= 2)
            .map(|(h, _)| h)
            .ok_or(ControllerError::NoQuorum)
    }

    #[test]
    fn quorum_of_two_elects_primary() {
        // A,A reachable agreeing on A, C unreachable.
        let got = votes_from(&[
            ("a", Some("a"), &["a", "b", "c"]),
            ("b", Some("a"), &["a", "b", "c"]),
        ])
        .unwrap();
        assert_eq!(got, "a");
    }

    #[test]
    fn three_way_split_has_no_quorum() {
        let err = votes_from(&[
            ("a", Some("a"), &["a", "b", "c"]),
            ("b", Some("b"), &["a", "b", "c"]),
            ("c", Some("c"), &["a", "b", "c"]),
        ])
        .unwrap_err();
        assert!(matches!(err, ControllerError::NoQuorum));
    }

    #[test]
    fn cluster_membership_disagreement_is_fatal() {
        let err = votes_from(&[
            ("a", Some("a"), &["a", "b", "c"]),
            ("b", Some("a"), &["a", "b"]),
        ])
        .unwrap_err();
        assert!(matches!(err, ControllerError::ClusterMismatch(_)));
    }
}
