//! Network interface monitoring
//!
//! Polls a named interface every 2 seconds and fires edge-triggered
//! callbacks on up/down transitions. The actual link check is behind
//! [`LinkProbe`] so tests can drive transitions without a real interface.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Poll cadence for the monitored interface
const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// IFF_UP from `<linux/if.h>`
const IFF_UP: u64 = 0x1;

/// Answers "is this interface present and up?"
pub trait LinkProbe: Send + Sync {
    /// Whether the named interface exists and is flagged up
    fn is_up(&self, interface: &str) -> bool;
}

/// Production probe: reads `/sys/class/net/<name>/flags`
pub struct SysfsProbe;

impl LinkProbe for SysfsProbe {
    fn is_up(&self, interface: &str) -> bool {
        if interface.is_empty() {
            return false;
        }
        let path = format!("/sys/class/net/{interface}/flags");
        match std::fs::read_to_string(&path) {
            Ok(text) => {
                let text = text.trim().trim_start_matches("0x");
                u64::from_str_radix(text, 16)
                    .map(|flags| flags & IFF_UP != 0)
                    .unwrap_or(false)
            }
            // Missing file = interface does not exist
            Err(_) => false,
        }
    }
}

type Callback = Arc<dyn Fn() + Send + Sync>;

struct MonitorInner {
    probe: Arc<dyn LinkProbe>,
    interface: RwLock<String>,
    is_up: AtomicBool,
    on_up: Mutex<Option<Callback>>,
    on_down: Mutex<Option<Callback>>,
    cancel: CancellationToken,
}

/// Watches one network interface and reports its status
#[derive(Clone)]
pub struct InterfaceMonitor {
    inner: Arc<MonitorInner>,
}

impl InterfaceMonitor {
    /// Monitor `interface` using the sysfs probe
    pub fn new(interface: impl Into<String>) -> Self {
        Self::with_probe(interface, Arc::new(SysfsProbe))
    }

    /// Monitor `interface` using a custom probe (tests)
    pub fn with_probe(interface: impl Into<String>, probe: Arc<dyn LinkProbe>) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                probe,
                interface: RwLock::new(interface.into()),
                is_up: AtomicBool::new(false),
                on_up: Mutex::new(None),
                on_down: Mutex::new(None),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Register the callback fired when the interface comes up
    pub fn on_up(&self, callback: impl Fn() + Send + Sync + 'static) {
        *self.lock_cb(&self.inner.on_up) = Some(Arc::new(callback));
    }

    /// Register the callback fired when the interface goes down
    pub fn on_down(&self, callback: impl Fn() + Send + Sync + 'static) {
        *self.lock_cb(&self.inner.on_down) = Some(Arc::new(callback));
    }

    /// Current link state as of the last poll
    pub fn is_up(&self) -> bool {
        self.inner.is_up.load(Ordering::SeqCst)
    }

    /// The monitored interface name
    #[allow(clippy::unwrap_used)]
    pub fn interface_name(&self) -> String {
        self.inner.interface.read().unwrap().clone()
    }

    /// Change the monitored interface and re-check immediately
    #[allow(clippy::unwrap_used)]
    pub fn set_interface(&self, interface: impl Into<String>) {
        let name = interface.into();
        info!(interface = %name, "monitored interface changed");
        *self.inner.interface.write().unwrap() = name;
        self.check();
    }

    /// Perform the initial check and begin polling every 2 s.
    ///
    /// An interface that is already up fires `on_up` from the initial
    /// check.
    pub fn start(&self) {
        self.check();
        let monitor = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = monitor.inner.cancel.cancelled() => return,
                    _ = tokio::time::sleep(POLL_INTERVAL) => monitor.check(),
                }
            }
        });
    }

    /// Stop polling; safe to call multiple times
    pub fn stop(&self) {
        self.inner.cancel.cancel();
    }

    fn check(&self) {
        let name = self.interface_name();
        let up = self.inner.probe.is_up(&name);
        let was_up = self.inner.is_up.swap(up, Ordering::SeqCst);

        if was_up && !up {
            warn!(interface = %name, "VPN interface went DOWN");
            let callback = self.lock_cb(&self.inner.on_down).clone();
            if let Some(callback) = callback {
                callback();
            }
        } else if !was_up && up {
            info!(interface = %name, "VPN interface is UP");
            let callback = self.lock_cb(&self.inner.on_up).clone();
            if let Some(callback) = callback {
                callback();
            }
        }
    }

    #[allow(clippy::unwrap_used)]
    fn lock_cb<'a>(
        &self,
        cell: &'a Mutex<Option<Callback>>,
    ) -> std::sync::MutexGuard<'a, Option<Callback>> {
        // Poisoning is unreachable: callbacks are stored, not run, under
        // this lock
        cell.lock().unwrap()
    }
}
