use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use futures::future;
use rand::Rng;
use rmpv::Value;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error};

use crate::constant::TimePrecision;
use crate::error::{Error, Result};
use crate::opts::Opts;

use super::endpoint::ServerConn;

/// How long a request loop waits after running out of endpoints before
/// trying again (until its deadline expires).
const POOL_RETRY_SLEEP: Duration = Duration::from_secs(2);

/// A client for a SiriDB cluster.
///
/// Maintains one authenticated connection per configured server, routes
/// each query or insert to a healthy server using weighted-random
/// selection, and keeps reconnecting lost servers in the background with
/// exponential backoff.
///
/// Error handling:
///
/// - [`Error::InsertError`] / [`Error::QueryError`]: the request itself is
///   wrong and likely to fail again; surfaced without retry.
/// - [`Error::ServerError`] / [`Error::ConnectionError`]: the chosen server
///   is unhealthy; it is demoted for `inactive_time` and the request is
///   retried on another server.
/// - [`Error::PoolError`]: no server can take the request right now; the
///   loop polls every two seconds until the call's deadline.
/// - [`Error::AuthError`] / [`Error::UserAuthError`]: credentials or
///   privileges are insufficient; surfaced without retry.
pub struct Cluster {
    inner: Arc<Inner>,
}

struct Inner {
    opts: Opts,
    /// One entry per configured server.
    servers: Vec<Arc<ServerConn>>,
    /// Selection pool: each server appears `weight` times.
    pool: Vec<Arc<ServerConn>>,
    retry_connect: AtomicBool,
    connect_task: Mutex<Option<JoinHandle<()>>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    trigger: UnboundedSender<()>,
    trigger_rx: Mutex<Option<UnboundedReceiver<()>>>,
}

impl Cluster {
    pub fn new(opts: Opts) -> Result<Self> {
        opts.validate()?;

        let servers: Vec<_> = opts
            .servers
            .iter()
            .cloned()
            .map(ServerConn::new)
            .collect();
        let mut pool = Vec::new();
        for server in &servers {
            for _ in 0..server.server().weight {
                pool.push(Arc::clone(server));
            }
        }

        let (trigger, trigger_rx) = mpsc::unbounded_channel();
        Ok(Self {
            inner: Arc::new(Inner {
                opts,
                servers,
                pool,
                retry_connect: AtomicBool::new(true),
                connect_task: Mutex::new(None),
                supervisor: Mutex::new(None),
                trigger,
                trigger_rx: Mutex::new(Some(trigger_rx)),
            }),
        })
    }

    /// Run one parallel connect attempt against every server. Servers that
    /// stay down are handed to the background reconnect loop.
    ///
    /// Fails only when no server could be reached at all; the background
    /// loop keeps trying either way until [`close`](Self::close).
    pub async fn connect(&self, timeout: Option<Duration>) -> Result<()> {
        self.inner.retry_connect.store(true, Ordering::SeqCst);
        self.spawn_supervisor();
        self.inner.connect_all(timeout).await;
        if self.inner.servers.iter().any(|server| !server.connected()) {
            self.inner.trigger_connect();
        }
        if self.connected() {
            Ok(())
        } else {
            Err(Error::ConnectError(
                "could not connect to any siridb server".to_string(),
            ))
        }
    }

    /// Stop reconnecting and close every connection. Idempotent.
    pub async fn close(&self) {
        self.inner.retry_connect.store(false, Ordering::SeqCst);
        let connect_task = lock(&self.inner.connect_task).take();
        if let Some(task) = connect_task {
            task.abort();
        }
        for server in &self.inner.servers {
            server.close().await;
        }
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        !self.inner.retry_connect.load(Ordering::SeqCst)
    }

    /// Whether the client has any active connection.
    pub fn connected(&self) -> bool {
        self.inner.servers.iter().any(|server| server.connected())
    }

    /// Run a query, retrying on another server after transient failures
    /// until `timeout` has passed.
    pub async fn query(
        &self,
        query: &str,
        time_precision: Option<TimePrecision>,
        timeout: Duration,
    ) -> Result<Value> {
        let deadline = Instant::now() + timeout;
        // The very first pick may fall back to servers that are connected
        // but flagged unavailable; afterwards only healthy ones count.
        let mut try_unavailable = true;
        loop {
            match self.inner.pick(try_unavailable) {
                Ok(server) => match server.query(query, time_precision, timeout).await {
                    Ok(result) => return Ok(result),
                    Err(e) if e.is_transient() => {
                        debug!(
                            "query failed with error {e:?}, trying another server \
                             if one is available..."
                        );
                        server.set_not_available(self.inner.opts.inactive_time);
                    }
                    Err(e @ Error::PoolError(_)) => self.pool_wait(deadline, e).await?,
                    Err(e) => return Err(e),
                },
                Err(e) => self.pool_wait(deadline, e).await?,
            }
            try_unavailable = false;
        }
    }

    /// Insert points, retrying on another server after transient failures
    /// until `timeout` has passed. An insert is never routed to a server
    /// that is flagged unavailable.
    pub async fn insert(&self, data: &Value, timeout: Duration) -> Result<Value> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.inner.pick(false) {
                Ok(server) => match server.insert(data, timeout).await {
                    Ok(result) => return Ok(result),
                    Err(e) if e.is_transient() => {
                        debug!(
                            "insert failed with error {e:?}, trying another server \
                             if one is available..."
                        );
                        server.set_not_available(self.inner.opts.inactive_time);
                    }
                    Err(e @ Error::PoolError(_)) => self.pool_wait(deadline, e).await?,
                    Err(e) => return Err(e),
                },
                Err(e) => self.pool_wait(deadline, e).await?,
            }
        }
    }

    async fn pool_wait(&self, deadline: Instant, err: Error) -> Result<()> {
        if Instant::now() > deadline {
            return Err(err);
        }
        debug!("{err}");
        tokio::time::sleep(POOL_RETRY_SLEEP).await;
        Ok(())
    }

    /// The supervisor turns connection-lost notifications from endpoint
    /// observers into (at most one) reconnect loop.
    fn spawn_supervisor(&self) {
        let mut slot = lock(&self.inner.supervisor);
        if slot.is_none() {
            if let Some(rx) = lock(&self.inner.trigger_rx).take() {
                *slot = Some(tokio::spawn(supervise(Arc::downgrade(&self.inner), rx)));
            }
        }
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        if let Some(task) = lock(&self.inner.connect_task).take() {
            task.abort();
        }
        if let Some(task) = lock(&self.inner.supervisor).take() {
            task.abort();
        }
    }
}

impl Inner {
    fn trigger_connect(self: &Arc<Self>) {
        if !self.retry_connect.load(Ordering::SeqCst) {
            return;
        }
        let mut slot = lock(&self.connect_task);
        if slot.is_none() {
            *slot = Some(tokio::spawn(connect_loop(Arc::clone(self))));
        }
    }

    async fn connect_all(&self, timeout: Option<Duration>) {
        let pending: Vec<_> = self
            .servers
            .iter()
            .filter(|server| !server.connected())
            .map(Arc::clone)
            .collect();
        if pending.is_empty() {
            return;
        }
        debug!("trying to connect to {} servers...", pending.len());
        let attempts = pending
            .iter()
            .map(|server| server.connect(&self.opts, &self.trigger, timeout));
        for (server, outcome) in pending.iter().zip(future::join_all(attempts).await) {
            if let Err(e) = outcome {
                error!(
                    host = %server.server().host,
                    port = server.server().port,
                    "connect failed: {e}"
                );
            }
        }
    }

    fn pick(&self, try_unavailable: bool) -> Result<Arc<ServerConn>> {
        let snapshot: Vec<PickState> = self
            .pool
            .iter()
            .map(|server| PickState {
                available: server.available(),
                connected: server.connected(),
                backup: server.server().backup,
            })
            .collect();
        let index = choose(&snapshot, try_unavailable, &mut rand::thread_rng())?;
        Ok(Arc::clone(&self.pool[index]))
    }
}

async fn supervise(inner: Weak<Inner>, mut rx: UnboundedReceiver<()>) {
    while rx.recv().await.is_some() {
        match inner.upgrade() {
            Some(inner) => inner.trigger_connect(),
            None => break,
        }
    }
}

/// Background reconnect: sleep, attempt all disconnected servers in
/// parallel, double the sleep, until everything is connected or the
/// cluster is closed.
async fn connect_loop(inner: Arc<Inner>) {
    let mut backoff = Backoff::new(inner.opts.max_wait_retry);
    while inner.servers.iter().any(|server| !server.connected()) {
        let wait = backoff.next_wait();
        debug!("reconnecting in {} seconds...", wait.as_secs());
        tokio::time::sleep(wait).await;
        if !inner.retry_connect.load(Ordering::SeqCst) {
            break;
        }
        inner.connect_all(None).await;
    }
    *lock(&inner.connect_task) = None;
}

/// Doubling reconnect delay: 1, 2, 4, ... seconds, capped at the
/// configured maximum.
struct Backoff {
    wait: Duration,
    max: Duration,
}

impl Backoff {
    fn new(max: Duration) -> Self {
        Self {
            wait: Duration::from_secs(1),
            max,
        }
    }

    /// The delay for this pass; doubles for the next one.
    fn next_wait(&mut self) -> Duration {
        let wait = self.wait;
        self.wait = (self.wait * 2).min(self.max);
        wait
    }
}

struct PickState {
    available: bool,
    connected: bool,
    backup: bool,
}

/// Selection over the weight-replicated pool.
///
/// Strictly prefers available non-backups, then available backups. With
/// `try_unavailable`, falls back to any endpoint whose transport is merely
/// connected. Weighting comes from the pool replication: filtering keeps
/// an endpoint's surviving duplicates proportional to its weight.
fn choose(pool: &[PickState], try_unavailable: bool, rng: &mut impl Rng) -> Result<usize> {
    let available: Vec<usize> = pool
        .iter()
        .enumerate()
        .filter(|(_, state)| state.available)
        .map(|(index, _)| index)
        .collect();

    let non_backups: Vec<usize> = available
        .iter()
        .copied()
        .filter(|&index| !pool[index].backup)
        .collect();

    if !non_backups.is_empty() {
        return Ok(non_backups[rng.gen_range(0..non_backups.len())]);
    }
    if !available.is_empty() {
        return Ok(available[rng.gen_range(0..available.len())]);
    }
    if try_unavailable {
        let connected: Vec<usize> = pool
            .iter()
            .enumerate()
            .filter(|(_, state)| state.connected)
            .map(|(index, _)| index)
            .collect();
        if !connected.is_empty() {
            return Ok(connected[rng.gen_range(0..connected.len())]);
        }
    }
    Err(Error::PoolError("No available connections found".to_string()))
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn state(available: bool, connected: bool, backup: bool) -> PickState {
        PickState {
            available,
            connected,
            backup,
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let mut backoff = Backoff::new(Duration::from_secs(90));
        let waits: Vec<u64> = (0..10).map(|_| backoff.next_wait().as_secs()).collect();
        assert_eq!(waits, [1, 2, 4, 8, 16, 32, 64, 90, 90, 90]);
    }

    #[test]
    fn backup_is_never_chosen_while_a_non_backup_is_available() {
        let pool = vec![
            state(true, true, true),
            state(true, true, false),
            state(true, true, true),
        ];
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..200 {
            assert_eq!(choose(&pool, false, &mut rng).unwrap(), 1);
        }
    }

    #[test]
    fn backup_is_chosen_when_it_is_the_only_available() {
        let pool = vec![state(false, true, false), state(true, true, true)];
        let mut rng = StdRng::seed_from_u64(7);
        assert_eq!(choose(&pool, false, &mut rng).unwrap(), 1);
    }

    #[test]
    fn try_unavailable_falls_back_to_connected() {
        let pool = vec![state(false, true, false), state(false, false, false)];
        let mut rng = StdRng::seed_from_u64(7);
        assert!(matches!(
            choose(&pool, false, &mut rng),
            Err(Error::PoolError(_))
        ));
        assert_eq!(choose(&pool, true, &mut rng).unwrap(), 0);
    }

    #[test]
    fn exhausted_pool_is_a_pool_error() {
        let pool = vec![state(false, false, false)];
        let mut rng = StdRng::seed_from_u64(7);
        assert!(matches!(
            choose(&pool, true, &mut rng),
            Err(Error::PoolError(_))
        ));
    }

    #[test]
    fn weight_replication_skews_the_pick() {
        // one server with weight 3 (indices 0..3) against one with weight 1
        let pool = vec![
            state(true, true, false),
            state(true, true, false),
            state(true, true, false),
            state(true, true, false),
        ];
        let mut rng = StdRng::seed_from_u64(42);
        let picks = 10_000;
        let heavy = (0..picks)
            .filter(|_| choose(&pool, false, &mut rng).unwrap() < 3)
            .count();
        let ratio = heavy as f64 / picks as f64;
        assert!(
            (0.70..0.80).contains(&ratio),
            "expected ~0.75 of picks on the weight-3 server, got {ratio}"
        );
    }
}
