use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{watch, RwLock};
use tracing::{error, info, warn};

use crate::auth::pam::CredentialVerifier;
use crate::config::Config;
use crate::error::{GatewayError, Result};
use crate::http::connection::{serve_connection, ConnectionContext};
use crate::http::timer_queue::SharedTimerQueue;
use crate::router::Router;
use crate::session::persistence::PersistentStore;
use crate::session::SessionStore;
use crate::tls::{build_tls_context, certificate, TlsContext};

const DATE_REFRESH: Duration = Duration::from_secs(10);

/// Process-wide cached `Date:` header string in IMF-fixdate form,
/// recomputed at most every ten seconds.
pub struct DateCache(Mutex<(Instant, String)>);

impl Default for DateCache {
    fn default() -> Self {
        Self::new()
    }
}

impl DateCache {
    pub fn new() -> Self {
        Self(Mutex::new((Instant::now(), Self::render())))
    }

    pub fn get(&self) -> String {
        let mut cached = match self.0.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if cached.0.elapsed() >= DATE_REFRESH {
            *cached = (Instant::now(), Self::render());
        }
        cached.1.clone()
    }

    fn render() -> String {
        chrono::Utc::now()
            .format("%a, %d %b %Y %H:%M:%S GMT")
            .to_string()
    }
}

/// Decrements the live-connection count and notifies the drain waiter
/// when the last connection closes.
struct ConnectionGuard {
    counter: Arc<AtomicUsize>,
    notifier: watch::Sender<()>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        if self.counter.fetch_sub(1, Ordering::Relaxed) == 1 {
            let _ = self.notifier.send(());
        }
    }
}

/// Owns the listening socket, the TLS context, and the signal policy:
/// SIGHUP reloads the certificate, SIGINT/SIGTERM drain and stop.
pub struct Acceptor {
    config: Arc<Config>,
    store: Arc<SessionStore>,
    router: Arc<dyn Router>,
    verifier: Arc<dyn CredentialVerifier>,
    persistent: Option<Arc<PersistentStore>>,
}

impl Acceptor {
    pub fn new(
        config: Arc<Config>,
        store: Arc<SessionStore>,
        router: Arc<dyn Router>,
        verifier: Arc<dyn CredentialVerifier>,
    ) -> Self {
        Self { config, store, router, verifier, persistent: None }
    }

    /// Attach the persister that flushes dirty session state to disk.
    pub fn with_persistence(mut self, persistent: Arc<PersistentStore>) -> Self {
        self.persistent = Some(persistent);
        self
    }

    /// Bind the configured address and serve until a stop signal.
    pub async fn run(self) -> Result<()> {
        let addr = SocketAddr::new(self.config.listen, self.config.port());
        let listener = TcpListener::bind(addr).await.map_err(GatewayError::Io)?;
        self.run_on(listener).await
    }

    /// Serve on a socket the caller already bound (socket activation or
    /// an inherited listener).
    pub async fn run_with_listener(self, listener: std::net::TcpListener) -> Result<()> {
        listener.set_nonblocking(true).map_err(GatewayError::Io)?;
        let listener = TcpListener::from_std(listener).map_err(GatewayError::Io)?;
        self.run_on(listener).await
    }

    fn build_tls(&self) -> Result<Arc<TlsContext>> {
        let tls_config = &self.config.tls;
        let pem = certificate::ensure_certificate(&tls_config.cert_path, &self.config.hostname())?;
        let context = build_tls_context(
            &pem,
            &self.store.auth_config(),
            self.router.has_webui(),
            &tls_config.trust_store,
        )?;
        Ok(Arc::new(context))
    }

    async fn run_on(self, listener: TcpListener) -> Result<()> {
        let addr = listener.local_addr().map_err(GatewayError::Io)?;

        let tls: Arc<RwLock<Option<Arc<TlsContext>>>> = if self.config.tls.enabled {
            Arc::new(RwLock::new(Some(self.build_tls()?)))
        } else {
            Arc::new(RwLock::new(None))
        };

        let timers = SharedTimerQueue::new();
        let ticker = timers.spawn_ticker();

        let ctx = Arc::new(ConnectionContext {
            store: Arc::clone(&self.store),
            router: Arc::clone(&self.router),
            verifier: Arc::clone(&self.verifier),
            date: Arc::new(DateCache::new()),
            timers,
            hostname: self.config.hostname(),
            body_limit: self.config.body_limit(),
        });

        // background flush of dirty session state
        let persist_task = self.persistent.clone().map(|persistent| {
            let store = Arc::clone(&self.store);
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(Duration::from_secs(1));
                loop {
                    tick.tick().await;
                    if let Err(e) = persistent.flush_if_dirty(&store) {
                        error!("failed to persist session state: {e}");
                    }
                }
            })
        });

        let mut sighup = signal(SignalKind::hangup()).map_err(GatewayError::Io)?;
        let mut sigint = signal(SignalKind::interrupt()).map_err(GatewayError::Io)?;
        let mut sigterm = signal(SignalKind::terminate()).map_err(GatewayError::Io)?;
        let mut reconfigure = self.store.subscribe_reconfigure();

        let active_connections = Arc::new(AtomicUsize::new(0));
        let (connections_closed_tx, mut connections_closed_rx) = watch::channel(());

        info!(%addr, tls = self.config.tls.enabled, "starting gateway");

        loop {
            tokio::select! {
                _ = sigint.recv() => {
                    info!("received SIGINT, initiating graceful shutdown");
                    break;
                }
                _ = sigterm.recv() => {
                    info!("received SIGTERM, initiating graceful shutdown");
                    break;
                }
                _ = sighup.recv() => {
                    info!("received reload signal");
                    self.reload_tls(&tls).await;
                }
                changed = reconfigure.changed() => {
                    if changed.is_ok() {
                        info!("auth policy changed, rebuilding TLS context");
                        self.reload_tls(&tls).await;
                    }
                }
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!("accept error: {e}");
                            continue;
                        }
                    };

                    active_connections.fetch_add(1, Ordering::Relaxed);
                    let guard = ConnectionGuard {
                        counter: Arc::clone(&active_connections),
                        notifier: connections_closed_tx.clone(),
                    };

                    let tls_ctx = tls.read().await.clone();
                    let ctx = Arc::clone(&ctx);
                    tokio::spawn(async move {
                        let _guard = guard;
                        serve_connection(stream, peer, tls_ctx, ctx).await;
                    });
                }
            }
        }

        drop(listener);

        // let live connections drain, bounded by the shutdown timeout
        let timeout = Duration::from_secs(self.config.shutdown_secs);
        if active_connections.load(Ordering::Relaxed) > 0 {
            info!(timeout_secs = timeout.as_secs(), "waiting for active connections to finish");
            tokio::select! {
                _ = connections_closed_rx.changed() => {}
                _ = tokio::time::sleep(timeout) => {
                    warn!(
                        active = active_connections.load(Ordering::Relaxed),
                        "shutdown timeout reached with connections still active"
                    );
                }
            }
        }

        ticker.abort();
        if let Some(task) = persist_task {
            task.abort();
        }
        if let Some(persistent) = &self.persistent {
            if let Err(e) = persistent.flush_if_dirty(&self.store) {
                error!("final session-state flush failed: {e}");
            }
        }

        info!("gateway stopped");
        Ok(())
    }

    /// Rebuild the TLS context from disk.  On failure the previous
    /// context stays in place; live connections always keep the context
    /// they started with.
    async fn reload_tls(&self, tls: &Arc<RwLock<Option<Arc<TlsContext>>>>) {
        if !self.config.tls.enabled {
            return;
        }
        match self.build_tls() {
            Ok(context) => {
                *tls.write().await = Some(context);
                info!("TLS context reloaded");
            }
            Err(e) => {
                error!("TLS reload failed, keeping previous context: {e}");
            }
        }
    }
}
