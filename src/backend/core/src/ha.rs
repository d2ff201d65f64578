//! Leader gate: TCP liveness links plus a store-backed leader key.
//!
//! Every replica runs the liveness listener. Election works against the
//! `/leader` key: the first replica to claim it with a create-if-absent
//! write leads; the rest dial the leader's listener and block on a read
//! that never completes. EOF or a refused connection means the leader
//! died: delete the key and re-enter the election. A dial timeout means
//! the leader may merely be slow, so the follower retries without
//! touching the key.
//!
//! Only the leader runs the scheduler core; followers run nothing but
//! this gate.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use crate::config::{AddressFamily, LeaderConfig};
use crate::error::{CaravelError, ErrorCode, Result};
use crate::storage::Storage;

/// Store key holding the current leader's reachable address.
pub const LEADER_KEY: &str = "/leader";

/// How long a follower waits for the leader's listener to answer.
const DIAL_TIMEOUT: Duration = Duration::from_secs(2);

/// Coordinates leadership across the replica set.
pub struct LeaderGate {
    storage: Arc<dyn Storage>,
    config: LeaderConfig,
}

impl LeaderGate {
    pub fn new(storage: Arc<dyn Storage>, config: LeaderConfig) -> Self {
        Self { storage, config }
    }

    /// The address this replica writes into the leader key.
    pub fn advertised(&self) -> &str {
        &self.config.ip
    }

    fn listen_addr(&self) -> Result<SocketAddr> {
        let ip: IpAddr = if self.config.ip.is_empty() {
            match self.config.address_family {
                AddressFamily::Ipv4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                AddressFamily::Ipv6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
            }
        } else {
            self.config.ip.parse().map_err(|_| {
                CaravelError::new(
                    ErrorCode::ConfigurationError,
                    format!("Invalid leader address: {}", self.config.ip),
                )
            })?
        };
        Ok(SocketAddr::new(ip, self.config.server_port))
    }

    /// Liveness listener. Accepts connections, sets keepalive, and never
    /// transmits: the open socket itself is the signal. Runs forever.
    pub async fn serve(&self) -> Result<()> {
        let addr = self.listen_addr()?;
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            CaravelError::with_internal(
                ErrorCode::ElectionFailed,
                format!("Leader listener failed to bind {}", addr),
                e.to_string(),
            )
        })?;
        info!(%addr, "Leader liveness listener up");

        let mut connections = tokio::task::JoinSet::new();
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        set_keepalive(&stream);
                        debug!(%peer, "Replica connected");
                        connections.spawn(hold_open(stream));
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to accept replica connection");
                        tokio::time::sleep(self.config.server_retry).await;
                    }
                },
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }
    }

    /// Block until this replica holds the leader key.
    pub async fn elect(&self) -> Result<()> {
        loop {
            let current = match self.storage.read(LEADER_KEY).await {
                Ok(value) => value,
                Err(e) => {
                    warn!(error = %e, "Leader key read failed; retrying");
                    tokio::time::sleep(self.config.retry_interval).await;
                    continue;
                }
            };

            match current {
                None => match self
                    .storage
                    .create_if_absent(LEADER_KEY, self.advertised())
                    .await
                {
                    Ok(true) => {
                        info!(address = self.advertised(), "Elected leader");
                        return Ok(());
                    }
                    Ok(false) => {
                        debug!("Lost the election race; re-reading leader key");
                    }
                    Err(e) => {
                        warn!(error = %e, "Leader claim failed; retrying");
                        tokio::time::sleep(self.config.retry_interval).await;
                    }
                },
                Some(addr) if addr == self.advertised() => {
                    // Our own address survived a restart.
                    info!(address = %addr, "Resuming leadership");
                    return Ok(());
                }
                Some(addr) => {
                    debug!(leader = %addr, "Following current leader");
                    self.watch_leader(&addr).await;
                }
            }
        }
    }

    /// Follow the incumbent until it is presumed dead or worth
    /// re-checking. Deletes the leader key only on EOF or a refused
    /// connection, never on a timeout.
    async fn watch_leader(&self, leader: &str) {
        let ip: IpAddr = match leader.parse() {
            Ok(ip) => ip,
            Err(_) => {
                warn!(leader, "Unparseable leader address; deleting key");
                self.delete_leader_key().await;
                return;
            }
        };
        let target = SocketAddr::new(ip, self.config.server_port);

        let mut stream =
            match tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(target)).await {
                Err(_) => {
                    // The leader may still be alive behind a slow network.
                    debug!(%target, "Leader dial timed out; retrying");
                    tokio::time::sleep(self.config.retry_interval).await;
                    return;
                }
                Ok(Err(e)) => {
                    warn!(%target, error = %e, "Leader unreachable; deleting key");
                    self.delete_leader_key().await;
                    return;
                }
                Ok(Ok(stream)) => stream,
            };
        set_keepalive(&stream);
        info!(%target, "Watching leader");

        // The leader never sends; this read completes only when the
        // connection dies.
        let mut buf = [0u8; 1];
        loop {
            match stream.read(&mut buf).await {
                Ok(0) => {
                    warn!(%target, "Leader connection closed; deleting key");
                    self.delete_leader_key().await;
                    return;
                }
                Ok(_) => continue,
                Err(e) => {
                    warn!(%target, error = %e, "Leader connection lost; deleting key");
                    self.delete_leader_key().await;
                    return;
                }
            }
        }
    }

    /// Release leadership on graceful shutdown so a standby can take over
    /// without waiting for EOF detection.
    pub async fn resign(&self) -> Result<()> {
        info!("Releasing leader key");
        self.storage.delete(LEADER_KEY).await
    }

    async fn delete_leader_key(&self) {
        if let Err(e) = self.storage.delete(LEADER_KEY).await {
            warn!(error = %e, "Failed to delete leader key");
        }
    }
}

/// Keep the liveness socket open, discarding anything received, until
/// the peer goes away.
async fn hold_open(mut stream: TcpStream) {
    let mut buf = [0u8; 1];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(_) => continue,
        }
    }
}

fn set_keepalive(stream: &TcpStream) {
    let keepalive = socket2::TcpKeepalive::new()
        .with_time(Duration::from_secs(30))
        .with_interval(Duration::from_secs(10));
    let sock = socket2::SockRef::from(stream);
    if let Err(e) = sock.set_tcp_keepalive(&keepalive) {
        warn!(error = %e, "Failed to set keepalive");
    }
}
