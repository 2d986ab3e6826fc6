//! Per-server connection pool
//!
//! A bounded reusable set of authenticated NNTP sessions to one server.
//! Leases are exclusive; a leased connection must come back through exactly
//! one of [`ServerPool::put`] (healthy) or [`ServerPool::discard`] (broken).
//! The pool is the only component that closes connections.

use crate::config::ServerConfig;
use crate::error::NntpError;
use crate::nntp::connection::NntpConnection;
use std::pin::pin;
use std::sync::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Hard ceiling on connections to a single server
const MAX_CONNECTIONS: usize = 50;
/// Used when a server is configured with zero connections
const DEFAULT_CONNECTIONS: usize = 10;

struct PoolState {
    idle: Vec<NntpConnection>,
    /// Connections created and not yet destroyed (idle + leased)
    active: usize,
    closed: bool,
}

/// Bounded pool of NNTP connections to one server
pub struct ServerPool {
    server: ServerConfig,
    interface: String,
    capacity: usize,
    state: Mutex<PoolState>,
    returned: Notify,
}

impl ServerPool {
    /// Create an empty pool; connections are dialed lazily on lease.
    ///
    /// Capacity is the server's desired connection count clamped to
    /// [1, 50] (default 10 when unset). `interface` is baked in: an
    /// interface change replaces the pool rather than rebinding sockets.
    pub fn new(server: ServerConfig, interface: String) -> Self {
        let capacity = if server.connections == 0 {
            DEFAULT_CONNECTIONS
        } else {
            server.connections.clamp(1, MAX_CONNECTIONS)
        };
        Self {
            server,
            interface,
            capacity,
            state: Mutex::new(PoolState {
                idle: Vec::with_capacity(capacity),
                active: 0,
                closed: false,
            }),
            returned: Notify::new(),
        }
    }

    /// The server this pool connects to
    pub fn server(&self) -> &ServerConfig {
        &self.server
    }

    /// Maximum simultaneous connections
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Connections created and not yet destroyed
    pub fn active_count(&self) -> usize {
        self.lock().active
    }

    /// Lease a connection: reuse an idle one, dial a new one if under
    /// capacity, otherwise wait until one is returned.
    ///
    /// Cancellation while waiting yields [`NntpError::Cancelled`]; a closed
    /// pool yields [`NntpError::PoolClosed`]. A dial failure releases the
    /// reserved capacity slot before surfacing the error.
    pub async fn lease(&self, cancel: &CancellationToken) -> Result<NntpConnection, NntpError> {
        loop {
            // Register for wakeups before inspecting state so a concurrent
            // put/close between the check and the await is not lost.
            let mut notified = pin!(self.returned.notified());
            notified.as_mut().enable();

            enum Action {
                Dial,
                Wait,
            }
            let action = {
                let mut state = self.lock();
                if state.closed {
                    return Err(NntpError::PoolClosed);
                }
                if let Some(conn) = state.idle.pop() {
                    return Ok(conn);
                }
                if state.active < self.capacity {
                    state.active += 1;
                    Action::Dial
                } else {
                    Action::Wait
                }
            };

            match action {
                Action::Dial => {
                    match NntpConnection::connect(&self.server, &self.interface).await {
                        Ok(conn) => return Ok(conn),
                        Err(e) => {
                            self.lock().active -= 1;
                            // A waiter may now dial instead
                            self.returned.notify_one();
                            warn!(server = %self.server.name, error = %e, "NNTP dial failed");
                            return Err(e);
                        }
                    }
                }
                Action::Wait => {
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(NntpError::Cancelled),
                        _ = &mut notified => {}
                    }
                }
            }
        }
    }

    /// Return a healthy connection to the idle set.
    ///
    /// If the pool is closed or the idle set is full, the connection is
    /// closed and the active count decremented instead.
    pub async fn put(&self, conn: NntpConnection) {
        let overflow = {
            let mut state = self.lock();
            if state.closed || state.idle.len() >= self.capacity {
                state.active -= 1;
                Some(conn)
            } else {
                state.idle.push(conn);
                None
            }
        };
        if let Some(conn) = overflow {
            conn.close().await;
        }
        self.returned.notify_one();
    }

    /// Destroy a connection that hit a transport or protocol error
    pub async fn discard(&self, conn: NntpConnection) {
        self.lock().active -= 1;
        conn.close().await;
        self.returned.notify_one();
    }

    /// Close the pool: idle connections are closed, waiters fail with
    /// [`NntpError::PoolClosed`], and future leases are refused. Leased
    /// connections are drained by their holders via `put`/`discard`.
    pub async fn close(&self) {
        let drained = {
            let mut state = self.lock();
            state.closed = true;
            state.active -= state.idle.len();
            std::mem::take(&mut state.idle)
        };
        let count = drained.len();
        for conn in drained {
            conn.close().await;
        }
        self.returned.notify_waiters();
        debug!(server = %self.server.name, closed_idle = count, "connection pool closed");
    }

    #[allow(clippy::unwrap_used)]
    fn lock(&self) -> std::sync::MutexGuard<'_, PoolState> {
        // Poisoning is unreachable: no code path panics while holding the lock
        self.state.lock().unwrap()
    }
}
