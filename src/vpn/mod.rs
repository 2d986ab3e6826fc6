//! VPN coordination
//!
//! [`VpnManager`] owns the interface monitor and, in managed mode, a
//! tunnel connector. It translates link transitions into the pause/resume
//! and pool-reset signals the download engine depends on:
//!
//! - interface down → pause the queue, close every connection pool
//! - interface up → rebind the pool manager to the (possibly new)
//!   interface, refresh the server list, resume the queue
//!
//! Modes, selected from configuration at [`VpnManager::start`]:
//!
//! - **passive** — a pre-existing interface is monitored by name
//! - **managed** — an external [`TunnelConnector`] brings the tunnel up;
//!   connect failures and down transitions enter a bounded reconnect loop

pub mod connector;
pub mod monitor;

pub use connector::{ConnectorState, ConnectorStatus, TunnelConnector};
pub use monitor::{InterfaceMonitor, LinkProbe, SysfsProbe};

use crate::config::{SharedConfig, VpnConfig};
use crate::error::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Reconnect attempts before giving up
const RECONNECT_ATTEMPTS: u32 = 10;
/// First reconnect delay; doubles per attempt
const RECONNECT_BACKOFF: Duration = Duration::from_secs(5);
/// Reconnect delay ceiling
const RECONNECT_BACKOFF_CAP: Duration = Duration::from_secs(60);

/// Builds a connector for a managed-mode VPN configuration.
///
/// Returns `None` when no connector is available for the configured
/// protocol, in which case the coordinator falls back to passive mode.
pub type ConnectorFactory =
    Arc<dyn Fn(&VpnConfig) -> Option<Arc<dyn TunnelConnector>> + Send + Sync>;

type DownCallback = Arc<dyn Fn() + Send + Sync>;
type UpCallback = Arc<dyn Fn(String) + Send + Sync>;

#[derive(Default)]
struct VpnState {
    monitor: Option<InterfaceMonitor>,
    connector: Option<Arc<dyn TunnelConnector>>,
    managed: bool,
    cancel: Option<CancellationToken>,
    reconnect: Option<JoinHandle<()>>,
}

struct VpnInner {
    config: SharedConfig,
    connector_factory: Option<ConnectorFactory>,
    probe: Arc<dyn LinkProbe>,
    state: Mutex<VpnState>,
    on_down: Mutex<Option<DownCallback>>,
    on_up: Mutex<Option<UpCallback>>,
    reconnecting: AtomicBool,
}

/// Coordinates VPN state with the engine and pool manager
#[derive(Clone)]
pub struct VpnManager {
    inner: Arc<VpnInner>,
}

impl VpnManager {
    /// Create a coordinator over the shared configuration.
    ///
    /// `connector_factory` supplies managed-mode connectors; pass `None`
    /// when the embedding application provides none (managed protocols then
    /// fall back to passive monitoring).
    pub fn new(config: SharedConfig, connector_factory: Option<ConnectorFactory>) -> Self {
        Self::with_probe(config, connector_factory, Arc::new(SysfsProbe))
    }

    /// Like [`Self::new`] with an injected link probe (tests)
    pub fn with_probe(
        config: SharedConfig,
        connector_factory: Option<ConnectorFactory>,
        probe: Arc<dyn LinkProbe>,
    ) -> Self {
        Self {
            inner: Arc::new(VpnInner {
                config,
                connector_factory,
                probe,
                state: Mutex::new(VpnState::default()),
                on_down: Mutex::new(None),
                on_up: Mutex::new(None),
                reconnecting: AtomicBool::new(false),
            }),
        }
    }

    /// Register the callback fired when the VPN goes down
    pub fn on_down(&self, callback: impl Fn() + Send + Sync + 'static) {
        *lock(&self.inner.on_down) = Some(Arc::new(callback));
    }

    /// Register the callback fired when the VPN comes up; receives the
    /// interface name so pools can be rebound.
    pub fn on_up(&self, callback: impl Fn(String) + Send + Sync + 'static) {
        *lock(&self.inner.on_up) = Some(Arc::new(callback));
    }

    /// Start coordination in the mode selected by configuration
    pub async fn start(&self) {
        let vpn = self.inner.config.vpn().await;
        let cancel = CancellationToken::new();
        lock(&self.inner.state).cancel = Some(cancel.clone());

        let connector = match vpn.protocol.as_str() {
            "" => None,
            protocol => {
                let built = self
                    .inner
                    .connector_factory
                    .as_ref()
                    .and_then(|factory| factory(&vpn));
                if built.is_none() {
                    warn!(protocol, "no tunnel connector available, falling back to passive mode");
                }
                built
            }
        };

        match connector {
            None => self.start_passive(&vpn.interface),
            Some(connector) => self.start_managed(connector, &vpn, cancel).await,
        }
    }

    fn start_passive(&self, interface: &str) {
        let monitor = InterfaceMonitor::with_probe(interface, self.inner.probe.clone());
        let inner = self.inner.clone();
        monitor.on_down(move || fire_down(&inner));
        let inner = self.inner.clone();
        let name = interface.to_string();
        monitor.on_up(move || fire_up(&inner, name.clone()));
        monitor.start();

        let mut state = lock(&self.inner.state);
        state.managed = false;
        state.connector = None;
        state.monitor = Some(monitor);
        info!(interface, "VPN coordinator started in passive mode");
    }

    async fn start_managed(
        &self,
        connector: Arc<dyn TunnelConnector>,
        vpn: &VpnConfig,
        cancel: CancellationToken,
    ) {
        {
            let mut state = lock(&self.inner.state);
            state.managed = true;
            state.connector = Some(connector.clone());
        }
        info!(protocol = %vpn.protocol, "VPN coordinator starting in managed mode");

        // The user's last explicit decision wins: auto_connect is only ever
        // set to false when they disconnected in a previous session.
        if vpn.auto_connect == Some(false) {
            info!("VPN auto-connect disabled by prior disconnect, staying down");
            return;
        }

        match connector.connect(&cancel).await {
            Ok(interface) => {
                info!(interface = %interface, "VPN connected");
                install_managed_monitor(&self.inner, interface);
            }
            Err(e) => {
                warn!(error = %e, "initial VPN connection failed, scheduling reconnect");
                spawn_reconnect(&self.inner);
            }
        }
    }

    /// Cancel any in-progress connect, wait for the reconnect loop to
    /// exit, stop the monitor, then disconnect a managed tunnel.
    ///
    /// The reconnect loop is awaited *before* disconnecting so a racing
    /// attempt cannot re-create the tunnel after teardown.
    pub async fn stop(&self) {
        let (cancel, reconnect) = {
            let mut state = lock(&self.inner.state);
            (state.cancel.take(), state.reconnect.take())
        };
        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        if let Some(handle) = reconnect {
            let _ = handle.await;
        }

        let (monitor, connector, managed) = {
            let mut state = lock(&self.inner.state);
            (state.monitor.take(), state.connector.take(), state.managed)
        };
        if let Some(monitor) = monitor {
            monitor.stop();
        }
        if managed {
            if let Some(connector) = connector {
                if let Err(e) = connector.disconnect().await {
                    warn!(error = %e, "VPN disconnect error during shutdown");
                }
            }
        }
    }

    /// Tear down and restart with the current configuration
    pub async fn reconfigure(&self) {
        self.stop().await;
        self.inner.reconnecting.store(false, Ordering::SeqCst);
        self.start().await;
    }

    /// Explicitly bring the managed tunnel up (admin API). Passive mode is
    /// a no-op.
    pub async fn connect(&self) -> Result<()> {
        let (connector, cancel) = {
            let state = lock(&self.inner.state);
            if !state.managed {
                return Ok(());
            }
            (state.connector.clone(), state.cancel.clone())
        };
        let Some(connector) = connector else {
            return Ok(());
        };
        let cancel = cancel.unwrap_or_default();

        let interface = connector.connect(&cancel).await?;
        install_managed_monitor(&self.inner, interface);
        Ok(())
    }

    /// Explicitly tear the managed tunnel down (admin API). Passive mode
    /// is a no-op.
    pub async fn disconnect(&self) -> Result<()> {
        let (connector, monitor, managed) = {
            let mut state = lock(&self.inner.state);
            (state.connector.clone(), state.monitor.take(), state.managed)
        };
        if !managed {
            return Ok(());
        }
        if let Some(monitor) = monitor {
            monitor.stop();
        }
        match connector {
            Some(connector) => connector.disconnect().await,
            None => Ok(()),
        }
    }

    /// Whether the monitored interface is currently up
    pub fn is_up(&self) -> bool {
        lock(&self.inner.state)
            .monitor
            .as_ref()
            .map(InterfaceMonitor::is_up)
            .unwrap_or(false)
    }

    /// The current VPN interface name, if any
    pub fn interface_name(&self) -> String {
        let state = lock(&self.inner.state);
        if state.managed {
            if let Some(connector) = &state.connector {
                let name = connector.status().interface_name;
                if !name.is_empty() {
                    return name;
                }
            }
        }
        state
            .monitor
            .as_ref()
            .map(InterfaceMonitor::interface_name)
            .unwrap_or_default()
    }

    /// Whether the coordinator owns the tunnel
    pub fn is_managed(&self) -> bool {
        lock(&self.inner.state).managed
    }

    /// Connector status; synthesized from the monitor in passive mode
    pub fn status(&self) -> ConnectorStatus {
        let state = lock(&self.inner.state);
        if state.managed {
            if let Some(connector) = &state.connector {
                return connector.status();
            }
        }
        match &state.monitor {
            Some(monitor) => ConnectorStatus {
                state: if monitor.is_up() {
                    ConnectorState::Connected
                } else {
                    ConnectorState::Disconnected
                },
                interface_name: monitor.interface_name(),
                error: None,
                connected_at: None,
            },
            None => ConnectorStatus::disconnected(),
        }
    }

    /// Rename the monitored interface in passive mode (admin API)
    pub fn set_passive_interface(&self, interface: &str) {
        let monitor = lock(&self.inner.state).monitor.clone();
        if let Some(monitor) = monitor {
            monitor.set_interface(interface);
        }
    }
}

fn fire_down(inner: &Arc<VpnInner>) {
    let callback = lock(&inner.on_down).clone();
    if let Some(callback) = callback {
        callback();
    }
    // Managed tunnels try to come back by themselves
    let managed = lock(&inner.state).managed;
    if managed {
        spawn_reconnect(inner);
    }
}

fn fire_up(inner: &Arc<VpnInner>, interface: String) {
    let callback = lock(&inner.on_up).clone();
    if let Some(callback) = callback {
        callback(interface);
    }
}

/// Install (replacing any previous) the monitor for a managed tunnel's
/// interface. The monitor's initial check fires `on_up` once the interface
/// reports up.
fn install_managed_monitor(inner: &Arc<VpnInner>, interface: String) {
    let monitor = InterfaceMonitor::with_probe(&interface, inner.probe.clone());
    let down_inner = inner.clone();
    monitor.on_down(move || fire_down(&down_inner));
    let up_inner = inner.clone();
    let up_name = interface.clone();
    monitor.on_up(move || fire_up(&up_inner, up_name.clone()));

    let previous = {
        let mut state = lock(&inner.state);
        state.monitor.replace(monitor.clone())
    };
    if let Some(previous) = previous {
        previous.stop();
    }
    monitor.start();
}

/// Start the reconnect loop unless one is already running (single-flight)
fn spawn_reconnect(inner: &Arc<VpnInner>) {
    if inner.reconnecting.swap(true, Ordering::SeqCst) {
        return;
    }
    let loop_inner = inner.clone();
    let handle = tokio::spawn(async move {
        reconnect_loop(&loop_inner).await;
        loop_inner.reconnecting.store(false, Ordering::SeqCst);
    });
    lock(&inner.state).reconnect = Some(handle);
}

async fn reconnect_loop(inner: &Arc<VpnInner>) {
    let (connector, cancel) = {
        let state = lock(&inner.state);
        (state.connector.clone(), state.cancel.clone())
    };
    let Some(connector) = connector else { return };
    let Some(cancel) = cancel else { return };

    let mut backoff = RECONNECT_BACKOFF;
    for attempt in 1..=RECONNECT_ATTEMPTS {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(backoff) => {}
        }

        info!(attempt, max = RECONNECT_ATTEMPTS, "VPN reconnect attempt");

        // Clear stale tunnel state before retrying
        let _ = connector.disconnect().await;

        match connector.connect(&cancel).await {
            Ok(interface) => {
                info!(interface = %interface, "VPN reconnected");
                install_managed_monitor(inner, interface);
                return;
            }
            Err(e) => {
                warn!(attempt, error = %e, "VPN reconnect failed");
                backoff = (backoff * 2).min(RECONNECT_BACKOFF_CAP);
            }
        }
    }
    warn!(
        attempts = RECONNECT_ATTEMPTS,
        "VPN reconnect exhausted, giving up"
    );
}

#[allow(clippy::unwrap_used)]
fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    // Poisoning is unreachable: no code path panics while holding these locks
    mutex.lock().unwrap()
}
