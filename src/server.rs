//! TCP dispatcher and server façade.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backend::UsbBackend;
use crate::bindings::BindingStore;
use crate::claim::ClaimManager;
use crate::codec::DecodeLimits;
use crate::config::{ConfigStore, ServerConfig};
use crate::device::DeviceRegistry;
use crate::error::{Error, Result};
use crate::session::{self, SessionParams, Shared};

/// How often the registry is re-scanned for hotplug while running.
const RESCAN_INTERVAL: std::time::Duration = std::time::Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerStatus {
    pub running: bool,
    pub port: u16,
    pub connections: usize,
    pub claimed_devices: usize,
}

struct Running {
    port: u16,
    shutdown_tx: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
    rescan_task: JoinHandle<()>,
}

/// Owns every subsystem; their lifetimes nest inside the façade's.
pub struct Server {
    config: ServerConfig,
    shared: Arc<Shared>,
    state: tokio::sync::Mutex<Option<Running>>,
    sessions: Arc<Mutex<Vec<JoinHandle<()>>>>,
    conn_count: Arc<AtomicUsize>,
    next_conn_id: Arc<AtomicU64>,
}

impl Server {
    /// Wire up the subsystems. Fails fast if the persisted config cannot
    /// be loaded (corruption is fatal at startup).
    pub fn new(backend: Arc<dyn UsbBackend>, store: Arc<dyn ConfigStore>) -> Result<Self> {
        let bindings =
            Arc::new(BindingStore::open(store).map_err(|e| Error::Config(e.to_string()))?);
        let config = bindings.config();
        let registry = Arc::new(DeviceRegistry::new());
        let claims = Arc::new(ClaimManager::new(
            backend.clone(),
            registry.clone(),
            bindings.clone(),
        ));
        Ok(Self {
            config,
            shared: Arc::new(Shared {
                backend,
                registry,
                bindings,
                claims,
            }),
            state: tokio::sync::Mutex::new(None),
            sessions: Arc::new(Mutex::new(Vec::new())),
            conn_count: Arc::new(AtomicUsize::new(0)),
            next_conn_id: Arc::new(AtomicU64::new(0)),
        })
    }

    pub fn bindings(&self) -> &Arc<BindingStore> {
        &self.shared.bindings
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.shared.registry
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Bind the listener and start serving. Idempotent once running.
    pub async fn start(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.is_some() {
            debug!("start called while running");
            return Ok(());
        }

        // First scan decides whether the backend is usable at all.
        match self.shared.registry.refresh(&self.shared.backend).await {
            Ok(devices) => {
                info!(count = devices.len(), "initial device scan");
                self.auto_bind();
            }
            Err(e) if e.is_fatal() => return Err(e.into()),
            Err(e) => warn!(error = %e, "initial device scan failed, will retry"),
        }

        let listener =
            TcpListener::bind((Ipv4Addr::UNSPECIFIED, self.config.port)).await?;
        let port = listener.local_addr()?.port();
        info!(port, "listening");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let accept_task = tokio::spawn(accept_loop(
            listener,
            self.shared.clone(),
            self.config.clone(),
            self.sessions.clone(),
            self.conn_count.clone(),
            // Connection ids stay unique across restarts of the listener.
            self.next_conn_id.clone(),
            shutdown_rx.clone(),
        ));
        let rescan_task = tokio::spawn(rescan_loop(
            self.shared.clone(),
            self.config.auto_bind_devices,
            shutdown_rx,
        ));

        *state = Some(Running {
            port,
            shutdown_tx,
            accept_task,
            rescan_task,
        });
        Ok(())
    }

    /// Ordered stop: close the accept path, signal sessions, wait out the
    /// grace period, then force whatever is left.
    pub async fn stop(&self) {
        let Some(running) = self.state.lock().await.take() else {
            return;
        };
        info!("stopping");

        let _ = running.shutdown_tx.send(true);
        let _ = running.accept_task.await;
        let _ = running.rescan_task.await;

        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.sessions.lock());
        let deadline = Instant::now() + self.config.shutdown_grace();
        for mut handle in handles {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if tokio::time::timeout(remaining, &mut handle).await.is_err() {
                warn!("session overran shutdown grace, aborting");
                handle.abort();
            }
        }

        // Anything a misbehaving session left behind.
        self.shared.claims.release_all().await;
        info!(port = running.port, "stopped");
    }

    pub async fn status(&self) -> ServerStatus {
        let state = self.state.lock().await;
        ServerStatus {
            running: state.is_some(),
            port: state.as_ref().map(|r| r.port).unwrap_or(self.config.port),
            connections: self.conn_count.load(Ordering::Relaxed),
            claimed_devices: self.shared.claims.claimed_count(),
        }
    }

    /// Actual listening port while running (differs from the configured
    /// one when configured as 0).
    pub async fn port(&self) -> Option<u16> {
        self.state.lock().await.as_ref().map(|r| r.port)
    }

    fn auto_bind(&self) {
        if self.config.auto_bind_devices {
            auto_bind_present(&self.shared);
        }
    }
}

fn auto_bind_present(shared: &Shared) {
    for dev in shared.registry.snapshot() {
        if !shared.bindings.is_bound(&dev.busid) {
            if let Err(e) = shared.bindings.bind(dev.busid) {
                warn!(busid = %dev.busid, error = %e, "auto-bind failed");
            }
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    shared: Arc<Shared>,
    config: ServerConfig,
    sessions: Arc<Mutex<Vec<JoinHandle<()>>>>,
    conn_count: Arc<AtomicUsize>,
    next_id: Arc<AtomicU64>,
    mut shutdown: watch::Receiver<bool>,
) {
    let params = SessionParams {
        urb_timeout: config.urb_timeout(),
        idle_timeout: config.idle_timeout(),
        limits: DecodeLimits {
            max_transfer_len: config.max_transfer_bytes,
            max_iso_packets: DecodeLimits::default().max_iso_packets,
        },
    };

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                        continue;
                    }
                };

                if conn_count.load(Ordering::Relaxed) >= config.max_connections {
                    warn!(peer = %peer, "connection limit reached, refusing");
                    drop(stream);
                    continue;
                }

                let id = next_id.fetch_add(1, Ordering::Relaxed) + 1;
                conn_count.fetch_add(1, Ordering::Relaxed);
                let task = tokio::spawn({
                    let shared = shared.clone();
                    let params = params.clone();
                    let shutdown = shutdown.clone();
                    let conn_count = conn_count.clone();
                    async move {
                        session::run(id, stream, peer.to_string(), shared, params, shutdown).await;
                        conn_count.fetch_sub(1, Ordering::Relaxed);
                    }
                });

                let mut sessions = sessions.lock();
                sessions.retain(|h| !h.is_finished());
                sessions.push(task);
            }
            _ = shutdown.changed() => {
                debug!("accept loop exiting");
                break;
            }
        }
    }
}

/// Periodic hotplug rescan. Newly attached devices are picked up here,
/// and bound on arrival when auto-bind is on.
async fn rescan_loop(shared: Arc<Shared>, auto_bind: bool, mut shutdown: watch::Receiver<bool>) {
    let mut tick = tokio::time::interval(RESCAN_INTERVAL);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = tick.tick() => {
                match shared.registry.refresh(&shared.backend).await {
                    Ok(_) if auto_bind => auto_bind_present(&shared),
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "device rescan failed"),
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}
