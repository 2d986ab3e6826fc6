//! Pool manager: all per-server pools plus cross-server article fetch
//!
//! Holds one [`ServerPool`] per enabled server, keyed by server identity,
//! and the current VPN interface name used to dial new connections. An
//! interface change closes every pool and resets the map; connections
//! bound to the old interface are never reused.

use crate::config::ServerConfig;
use crate::error::{Error, NntpError, Result};
use crate::nntp::pool::ServerPool;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Fetch rounds across all pools before giving up on an article
const FETCH_ROUNDS: u32 = 3;

struct ManagerState {
    pools: HashMap<String, Arc<ServerPool>>,
    interface: String,
}

/// Owner of all per-server pools
pub struct PoolManager {
    state: RwLock<ManagerState>,
}

/// Pools are keyed by server id, falling back to the (unique) name for
/// servers configured without one.
fn server_key(server: &ServerConfig) -> String {
    if server.id.is_empty() {
        server.name.clone()
    } else {
        server.id.clone()
    }
}

impl PoolManager {
    /// Create a manager dialing through `interface` ("" = unbound)
    pub fn new(interface: impl Into<String>) -> Self {
        Self {
            state: RwLock::new(ManagerState {
                pools: HashMap::new(),
                interface: interface.into(),
            }),
        }
    }

    /// Reconcile pools against the enabled subset of `servers`.
    ///
    /// Pools for servers that disappeared, were disabled, or whose settings
    /// changed are closed and removed; new enabled servers get fresh pools;
    /// untouched entries keep their idle connections. Applying the same
    /// list twice is a no-op.
    pub async fn update_servers(&self, servers: &[ServerConfig]) {
        let mut to_close = Vec::new();
        {
            let mut state = self.state.write().await;

            let desired: HashMap<String, &ServerConfig> = servers
                .iter()
                .filter(|s| s.enabled)
                .map(|s| (server_key(s), s))
                .collect();

            let stale: Vec<String> = state
                .pools
                .iter()
                .filter(|(key, pool)| {
                    desired
                        .get(*key)
                        .map_or(true, |server| pool.server() != *server)
                })
                .map(|(key, _)| key.clone())
                .collect();
            for key in stale {
                if let Some(pool) = state.pools.remove(&key) {
                    to_close.push(pool);
                }
            }

            let interface = state.interface.clone();
            for (key, server) in desired {
                if !state.pools.contains_key(&key) {
                    info!(
                        server = %server.name,
                        connections = server.connections,
                        "created connection pool"
                    );
                    state
                        .pools
                        .insert(key, Arc::new(ServerPool::new(server.clone(), interface.clone())));
                }
            }
        }
        for pool in to_close {
            pool.close().await;
        }
    }

    /// Fetch one article body, retrying across every pool.
    ///
    /// Pools are tried in server-id order; up to three rounds with 1 s and
    /// 2 s pauses between rounds. A successful fetch returns the connection
    /// to its pool; any article or transport error discards it and moves
    /// on. When everything fails the last error is carried in
    /// [`Error::FetchExhausted`].
    pub async fn fetch_article(
        &self,
        cancel: &CancellationToken,
        message_id: &str,
    ) -> Result<Vec<u8>> {
        let mut last_err = NntpError::Protocol("no NNTP servers available".into());

        for round in 0..FETCH_ROUNDS {
            if round > 0 {
                let backoff = Duration::from_secs(1 << (round - 1));
                tokio::select! {
                    _ = cancel.cancelled() => return Err(Error::Cancelled),
                    _ = tokio::time::sleep(backoff) => {}
                }
            }

            for pool in self.pools_in_order().await {
                let conn = match pool.lease(cancel).await {
                    Ok(conn) => conn,
                    Err(NntpError::Cancelled) => return Err(Error::Cancelled),
                    Err(e) => {
                        last_err = e;
                        continue;
                    }
                };

                let mut conn = conn;
                match conn.fetch_body(message_id).await {
                    Ok(body) => {
                        pool.put(conn).await;
                        return Ok(body);
                    }
                    Err(e) => {
                        debug!(
                            server = %pool.server().name,
                            message_id,
                            error = %e,
                            "article fetch failed, discarding connection"
                        );
                        pool.discard(conn).await;
                        last_err = e;
                    }
                }
            }
        }

        warn!(message_id, error = %last_err, "article exhausted all servers");
        Err(Error::FetchExhausted {
            message_id: message_id.to_string(),
            source: Box::new(last_err),
        })
    }

    /// Install a new dialer interface: every pool is closed and the map
    /// reset, so subsequent leases dial connections bound to the new
    /// interface. Callers re-populate with [`Self::update_servers`].
    pub async fn set_interface(&self, interface: &str) {
        let to_close = {
            let mut state = self.state.write().await;
            state.interface = interface.to_string();
            state.pools.drain().map(|(_, pool)| pool).collect::<Vec<_>>()
        };
        for pool in to_close {
            pool.close().await;
        }
        info!(interface, "pool manager interface updated, pools reset");
    }

    /// The interface new connections are bound to
    pub async fn interface(&self) -> String {
        self.state.read().await.interface.clone()
    }

    /// Close every pool; in-flight fetches surface transport errors
    pub async fn close_all(&self) {
        let to_close = {
            let mut state = self.state.write().await;
            state.pools.drain().map(|(_, pool)| pool).collect::<Vec<_>>()
        };
        for pool in to_close {
            pool.close().await;
        }
    }

    /// Number of live pools (enabled servers)
    pub async fn pool_count(&self) -> usize {
        self.state.read().await.pools.len()
    }

    /// Snapshot pools sorted by key for a deterministic retry order
    async fn pools_in_order(&self) -> Vec<Arc<ServerPool>> {
        let state = self.state.read().await;
        let mut entries: Vec<(&String, &Arc<ServerPool>)> = state.pools.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        entries.into_iter().map(|(_, pool)| pool.clone()).collect()
    }
}
