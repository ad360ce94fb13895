use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use futures::StreamExt;
use rmpv::Value;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;
use tracing::{debug, error, instrument};

use crate::constant::{AUTH_TIMEOUT, KEEPALIVE_PING_TIMEOUT, RequestType, TimePrecision};
use crate::error::{Error, Result};
use crate::protocol::{FrameCodec, Response, encode_frame};
use crate::qpack;

/// Hooks invoked by the protocol engine at connection lifecycle points.
///
/// The cluster endpoint uses these to maintain its availability flag and
/// to kick the reconnect loop; plain connections use [`NullObserver`].
pub(crate) trait ProtoObserver: Send + Sync + 'static {
    fn on_authenticated(&self) {}
    fn on_connection_lost(&self) {}
}

pub(crate) struct NullObserver;

impl ProtoObserver for NullObserver {}

/// Login for one database. Consumed by [`Proto::open`]; the engine keeps
/// no copy of the password once the authentication frame has been sent.
pub(crate) struct Credentials {
    pub username: String,
    pub password: String,
    pub dbname: String,
}

struct PendingMap {
    next_pid: u16,
    slots: HashMap<u16, oneshot::Sender<Result<Response>>>,
}

struct Shared {
    peer: String,
    connected: AtomicBool,
    pending: Mutex<PendingMap>,
    last_resp: Mutex<Instant>,
}

impl Shared {
    fn lock_pending(&self) -> std::sync::MutexGuard<'_, PendingMap> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Assign the next free request id and register an awaiter for it.
    ///
    /// The pid is a monotonically increasing u16 with wraparound; a slot
    /// that is still waiting on a slow response is skipped. Only when all
    /// 65,536 slots are live the send is refused.
    fn register(&self) -> Result<(u16, oneshot::Receiver<Result<Response>>)> {
        let mut map = self.lock_pending();
        for _ in 0..=u16::MAX as u32 {
            map.next_pid = map.next_pid.wrapping_add(1);
            let pid = map.next_pid;
            if let Entry::Vacant(slot) = map.slots.entry(pid) {
                let (tx, rx) = oneshot::channel();
                slot.insert(tx);
                return Ok((pid, rx));
            }
        }
        Err(Error::ProtocolError(
            "request id space exhausted".to_string(),
        ))
    }

    /// Fail every pending awaiter. Safe to call more than once; the map is
    /// drained so each awaiter sees exactly one resolution.
    fn fail_all(&self) {
        let slots = std::mem::take(&mut self.lock_pending().slots);
        for (pid, tx) in slots {
            let _ = tx.send(Err(Error::ConnectionError(format!(
                "connection is lost before we had an answer on package id: {pid}"
            ))));
        }
    }

    fn touch(&self) {
        *self
            .last_resp
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    fn last_resp_age(&self) -> Duration {
        self.last_resp
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }
}

/// Clears the pending slot when an awaiter goes away without an answer:
/// per-request timeout, write failure, or the caller dropping its future.
/// A response arriving for a cleared pid is logged and discarded.
struct PendingGuard<'a> {
    shared: &'a Shared,
    pid: Option<u16>,
}

impl PendingGuard<'_> {
    fn disarm(&mut self) {
        self.pid = None;
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if let Some(pid) = self.pid {
            self.shared.lock_pending().slots.remove(&pid);
        }
    }
}

/// Protocol engine for a single server connection.
///
/// Owns the transport. Requests are multiplexed over the connection and
/// correlated by pid; writes are serialized through a mutex while
/// responses are dispatched by a background reader task.
pub(crate) struct Proto {
    shared: Arc<Shared>,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    reader: JoinHandle<()>,
}

impl Proto {
    /// Open a transport without authenticating. Used by `server_info`,
    /// which is the one request a server answers pre-auth.
    pub(crate) async fn open_unauth(
        host: &str,
        port: u16,
        timeout: Duration,
        observer: Arc<dyn ProtoObserver>,
    ) -> Result<Proto> {
        let addr = format!("{host}:{port}");
        let stream = tokio::time::timeout(timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| Error::ConnectError(format!("timed out connecting to {addr}")))?
            .map_err(|e| Error::ConnectError(format!("{addr}: {e}")))?;
        stream.set_nodelay(true)?;

        let (read_half, write_half) = stream.into_split();
        let shared = Arc::new(Shared {
            peer: addr,
            connected: AtomicBool::new(true),
            pending: Mutex::new(PendingMap {
                next_pid: 0,
                slots: HashMap::new(),
            }),
            last_resp: Mutex::new(Instant::now()),
        });
        debug!(peer = %shared.peer, "connection made");

        let reader = tokio::spawn(run_reader(Arc::clone(&shared), read_half, observer));
        Ok(Proto {
            shared,
            writer: tokio::sync::Mutex::new(write_half),
            reader,
        })
    }

    /// Open a transport and authenticate. Resolves once the server has
    /// accepted the credentials; on any failure the transport is closed.
    pub(crate) async fn open(
        host: &str,
        port: u16,
        credentials: Credentials,
        timeout: Duration,
        observer: Arc<dyn ProtoObserver>,
    ) -> Result<Proto> {
        let proto = Self::open_unauth(host, port, timeout, Arc::clone(&observer)).await?;

        let Credentials {
            username,
            password,
            dbname,
        } = credentials;
        let auth = Value::Array(vec![username.into(), password.into(), dbname.into()]);
        let outcome = proto.send(RequestType::Auth, Some(&auth), AUTH_TIMEOUT).await;
        drop(auth);

        match outcome {
            Ok(Response::AuthSuccess) => {
                observer.on_authenticated();
                Ok(proto)
            }
            Ok(other) => {
                proto.close().await;
                Err(Error::ProtocolError(format!(
                    "unexpected response to AUTH: {other:?}"
                )))
            }
            Err(e) => {
                debug!(peer = %proto.shared.peer, "authentication failed: {e}");
                proto.close().await;
                Err(e)
            }
        }
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    pub(crate) fn last_resp_age(&self) -> Duration {
        self.shared.last_resp_age()
    }

    /// Send one request and await its typed response.
    ///
    /// The pending entry is registered before any byte is written, so a
    /// fast response can never miss its awaiter. Whatever happens to this
    /// future afterwards (timeout, cancellation, write failure), the slot
    /// is cleared exactly once.
    #[instrument(skip_all, fields(peer = %self.shared.peer, ty = ty.as_str()))]
    pub(crate) async fn send(
        &self,
        ty: RequestType,
        data: Option<&Value>,
        timeout: Duration,
    ) -> Result<Response> {
        let payload = qpack::pack_request(ty, data)?;
        if !self.is_connected() {
            return Err(Error::ConnectionError(format!(
                "connection to {} is closed",
                self.shared.peer
            )));
        }

        let (pid, rx) = self.shared.register()?;
        let mut guard = PendingGuard {
            shared: self.shared.as_ref(),
            pid: Some(pid),
        };

        let wire = encode_frame(pid, ty as u8, &payload);
        {
            let mut writer = self.writer.lock().await;
            writer.write_all(&wire).await.map_err(|e| {
                Error::ConnectionError(format!("write to {} failed: {e}", self.shared.peer))
            })?;
        }

        match tokio::time::timeout(timeout, rx).await {
            Err(_) => Err(Error::TimeoutError(format!(
                "request timed out on pid {pid} ({})",
                ty.as_str()
            ))),
            Ok(Err(_)) => Err(Error::ConnectionError(format!(
                "connection to {} is lost",
                self.shared.peer
            ))),
            Ok(Ok(result)) => {
                guard.disarm();
                result
            }
        }
    }

    pub(crate) async fn query(
        &self,
        query: &str,
        time_precision: Option<TimePrecision>,
        timeout: Duration,
    ) -> Result<Value> {
        let data = Value::Array(vec![
            Value::from(query),
            time_precision.map_or(Value::Nil, |p| Value::from(p as u8)),
        ]);
        match self.send(RequestType::Query, Some(&data), timeout).await? {
            Response::Query(result) => Ok(result),
            other => Err(unexpected(RequestType::Query, &other)),
        }
    }

    pub(crate) async fn insert(&self, data: &Value, timeout: Duration) -> Result<Value> {
        match self.send(RequestType::Insert, Some(data), timeout).await? {
            Response::Insert(result) => Ok(result),
            other => Err(unexpected(RequestType::Insert, &other)),
        }
    }

    pub(crate) async fn ping(&self, timeout: Duration) -> Result<()> {
        match self.send(RequestType::Ping, None, timeout).await? {
            Response::Ack => Ok(()),
            other => Err(unexpected(RequestType::Ping, &other)),
        }
    }

    /// Close the transport. All pending awaiters fail with a connection
    /// error. Idempotent.
    pub(crate) async fn close(&self) {
        if self.shared.connected.swap(false, Ordering::SeqCst) {
            debug!(peer = %self.shared.peer, "closing connection");
        }
        self.shared.fail_all();
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
        self.reader.abort();
    }
}

impl Drop for Proto {
    fn drop(&mut self) {
        self.shared.connected.store(false, Ordering::SeqCst);
        self.shared.fail_all();
        self.reader.abort();
    }
}

pub(crate) fn unexpected(ty: RequestType, response: &Response) -> Error {
    Error::ProtocolError(format!(
        "unexpected response to {}: {response:?}",
        ty.as_str()
    ))
}

/// Receive pipeline: parse frames, look up the awaiter by pid, dispatch the
/// typed response. On EOF or a framing error the connection is marked lost,
/// every pending awaiter is failed and the observer is notified.
async fn run_reader(shared: Arc<Shared>, read_half: OwnedReadHalf, observer: Arc<dyn ProtoObserver>) {
    let mut frames = FramedRead::new(read_half, FrameCodec::new());
    loop {
        match frames.next().await {
            Some(Ok(frame)) => {
                shared.touch();
                let sender = shared.lock_pending().slots.remove(&frame.pid);
                match sender {
                    Some(tx) => {
                        // A cancelled awaiter dropped its receiver; the
                        // response is discarded with it.
                        let _ = tx.send(Response::dispatch(frame.ty, &frame.payload));
                    }
                    None => {
                        error!(peer = %shared.peer, pid = frame.pid, ty = frame.ty,
                            "package id not found");
                    }
                }
            }
            Some(Err(e)) => {
                error!(peer = %shared.peer, "dropping connection: {e}");
                break;
            }
            None => {
                debug!(peer = %shared.peer, "connection lost");
                break;
            }
        }
    }

    let first_loss = shared.connected.swap(false, Ordering::SeqCst);
    shared.fail_all();
    if first_loss {
        observer.on_connection_lost();
    }
}

/// Idle probe for an otherwise quiet connection.
///
/// Sleeps for the keep-alive interval, then pings only if nothing has been
/// received in the meantime; otherwise sleeps out the remaining gap. A
/// failed probe closes the connection so the reconnect machinery can
/// re-establish it.
pub(crate) fn spawn_keepalive(proto: Arc<Proto>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut sleep = interval;
        loop {
            tokio::time::sleep(sleep).await;
            if !proto.is_connected() {
                break;
            }
            let idle = proto.last_resp_age();
            if idle >= interval {
                debug!("sending keep-alive package");
                if let Err(e) = proto
                    .send(RequestType::Ping, None, KEEPALIVE_PING_TIMEOUT)
                    .await
                {
                    error!("keep-alive failed: {e}");
                    proto.close().await;
                    break;
                }
                sleep = interval;
            } else {
                sleep = interval - idle;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_shared() -> Shared {
        Shared {
            peer: "test:9000".to_string(),
            connected: AtomicBool::new(true),
            pending: Mutex::new(PendingMap {
                next_pid: 0,
                slots: HashMap::new(),
            }),
            last_resp: Mutex::new(Instant::now()),
        }
    }

    #[test]
    fn pids_increase_from_one() {
        let shared = empty_shared();
        let (pid1, _rx1) = shared.register().unwrap();
        let (pid2, _rx2) = shared.register().unwrap();
        assert_eq!(pid1, 1);
        assert_eq!(pid2, 2);
    }

    #[test]
    fn pid_wraparound_skips_live_slots() {
        let shared = empty_shared();
        shared.lock_pending().next_pid = u16::MAX - 1;

        let (pid1, _rx1) = shared.register().unwrap();
        assert_eq!(pid1, u16::MAX);

        // 0 wraps in next, 1 is still occupied by a slow request
        let (occupied_tx, _occupied_rx) = oneshot::channel();
        shared.lock_pending().slots.insert(1, occupied_tx);

        let (pid2, _rx2) = shared.register().unwrap();
        assert_eq!(pid2, 0);
        let (pid3, _rx3) = shared.register().unwrap();
        assert_eq!(pid3, 2, "live pid 1 must be skipped");
    }

    #[test]
    fn fail_all_resolves_every_awaiter() {
        let shared = empty_shared();
        let (_pid1, mut rx1) = shared.register().unwrap();
        let (_pid2, mut rx2) = shared.register().unwrap();

        shared.fail_all();
        assert!(matches!(rx1.try_recv(), Ok(Err(Error::ConnectionError(_)))));
        assert!(matches!(rx2.try_recv(), Ok(Err(Error::ConnectionError(_)))));
        assert!(shared.lock_pending().slots.is_empty());

        // a second sweep is a no-op
        shared.fail_all();
    }

    #[test]
    fn guard_clears_slot_unless_disarmed() {
        let shared = empty_shared();
        let (pid, _rx) = shared.register().unwrap();
        {
            let _guard = PendingGuard {
                shared: &shared,
                pid: Some(pid),
            };
        }
        assert!(!shared.lock_pending().slots.contains_key(&pid));

        let (pid, _rx) = shared.register().unwrap();
        {
            let mut guard = PendingGuard {
                shared: &shared,
                pid: Some(pid),
            };
            guard.disarm();
        }
        assert!(shared.lock_pending().slots.contains_key(&pid));
    }
}
