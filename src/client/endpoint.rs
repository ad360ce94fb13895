use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use rmpv::Value;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::constant::{KEEPALIVE_INTERVAL, TimePrecision};
use crate::error::{Error, Result};
use crate::opts::{Opts, Server};

use super::proto::{Credentials, Proto, ProtoObserver, spawn_keepalive};

/// One named endpoint of the cluster: static config plus the engine for
/// its current connection, if any.
///
/// `available` tracks whether the cluster considers this server healthy.
/// It is raised when authentication completes, dropped on connection loss
/// or after a transient failure, and re-armed after the inactive cool-down
/// as long as the connection survived it.
pub(crate) struct ServerConn {
    server: Server,
    proto: Mutex<Option<Arc<Proto>>>,
    available: AtomicBool,
    keepalive: Mutex<Option<JoinHandle<()>>>,
}

/// Engine hooks for a cluster endpoint: availability bookkeeping and the
/// reconnect trigger. Holds the endpoint weakly; a dropped cluster must
/// not be kept alive by its reader tasks.
struct EndpointObserver {
    endpoint: Weak<ServerConn>,
    trigger: UnboundedSender<()>,
}

impl ProtoObserver for EndpointObserver {
    fn on_authenticated(&self) {
        if let Some(endpoint) = self.endpoint.upgrade() {
            endpoint.available.store(true, Ordering::SeqCst);
        }
    }

    fn on_connection_lost(&self) {
        if let Some(endpoint) = self.endpoint.upgrade() {
            endpoint.available.store(false, Ordering::SeqCst);
        }
        let _ = self.trigger.send(());
    }
}

impl ServerConn {
    pub(crate) fn new(server: Server) -> Arc<Self> {
        Arc::new(Self {
            server,
            proto: Mutex::new(None),
            available: AtomicBool::new(false),
            keepalive: Mutex::new(None),
        })
    }

    pub(crate) fn server(&self) -> &Server {
        &self.server
    }

    fn proto(&self) -> Option<Arc<Proto>> {
        self.proto
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn connected(&self) -> bool {
        self.proto().is_some_and(|proto| proto.is_connected())
    }

    pub(crate) fn available(&self) -> bool {
        self.available.load(Ordering::SeqCst) && self.connected()
    }

    pub(crate) async fn connect(
        self: &Arc<Self>,
        opts: &Opts,
        trigger: &UnboundedSender<()>,
        timeout: Option<Duration>,
    ) -> Result<()> {
        if self.connected() {
            return Ok(());
        }

        let observer = Arc::new(EndpointObserver {
            endpoint: Arc::downgrade(self),
            trigger: trigger.clone(),
        });
        let credentials = Credentials {
            username: opts.username.clone(),
            password: opts.password.clone(),
            dbname: opts.dbname.clone(),
        };
        let proto = Arc::new(
            Proto::open(
                &self.server.host,
                self.server.port,
                credentials,
                timeout.unwrap_or(opts.connect_timeout),
                observer,
            )
            .await?,
        );

        if opts.keepalive {
            let handle = spawn_keepalive(Arc::clone(&proto), KEEPALIVE_INTERVAL);
            let old = self
                .keepalive
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .replace(handle);
            if let Some(old) = old {
                old.abort();
            }
        }

        *self.proto.lock().unwrap_or_else(PoisonError::into_inner) = Some(proto);
        Ok(())
    }

    pub(crate) async fn query(
        &self,
        query: &str,
        time_precision: Option<TimePrecision>,
        timeout: Duration,
    ) -> Result<Value> {
        self.engine()?.query(query, time_precision, timeout).await
    }

    pub(crate) async fn insert(&self, data: &Value, timeout: Duration) -> Result<Value> {
        self.engine()?.insert(data, timeout).await
    }

    pub(crate) async fn ping(&self, timeout: Duration) -> Result<()> {
        self.engine()?.ping(timeout).await
    }

    /// Demote this endpoint after a transient failure. The cool-down task
    /// re-arms availability, but only if the connection is still up by
    /// then; a lost connection stays unavailable until re-authenticated.
    pub(crate) fn set_not_available(self: &Arc<Self>, inactive_time: Duration) {
        if self.available.swap(false, Ordering::SeqCst) {
            debug!(host = %self.server.host, port = self.server.port,
                "marking server not available for {inactive_time:?}");
            let endpoint = Arc::downgrade(self);
            tokio::spawn(async move {
                tokio::time::sleep(inactive_time).await;
                if let Some(endpoint) = endpoint.upgrade() {
                    endpoint.set_available();
                }
            });
        }
    }

    fn set_available(&self) {
        if self.connected() {
            self.available.store(true, Ordering::SeqCst);
        }
    }

    pub(crate) async fn close(&self) {
        let keepalive = self
            .keepalive
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = keepalive {
            handle.abort();
        }
        self.available.store(false, Ordering::SeqCst);
        let proto = self
            .proto
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(proto) = proto {
            proto.close().await;
        }
    }

    fn engine(&self) -> Result<Arc<Proto>> {
        self.proto().ok_or_else(|| {
            Error::ConnectionError(format!(
                "no connection to {}:{}",
                self.server.host, self.server.port
            ))
        })
    }
}
