//! A single-server connection that re-establishes itself.
//!
//! Every request goes through a write loop that waits for a connection,
//! retries transient failures and periodically forces a reconnect, so a
//! restarting server only shows up as latency, not as errors.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use rmpv::Value;
use tokio::time::sleep;
use tracing::{error, info};

use crate::constant::{RequestType, TimePrecision};
use crate::error::{Error, Result};
use crate::opts::Opts;
use crate::protocol::Response;

use super::proto::{Credentials, NullObserver, Proto, unexpected};

const MAX_RECONNECT_WAIT_TIME: u64 = 60;
const MAX_RECONNECT_TIMEOUT: u64 = 10;
const MAX_WRITE_RETRY: u32 = 120;
const RECONNECT_ATTEMPT: u32 = 3;

pub struct Conn {
    opts: Opts,
    proto: Mutex<Option<Arc<Proto>>>,
    reconnecting: AtomicBool,
}

impl Conn {
    /// Create the handle. No transport is opened yet; the first request
    /// (or [`connect`](Self::connect)) establishes it.
    pub fn new<O: TryInto<Opts>>(opts: O) -> Result<Self>
    where
        Error: From<O::Error>,
    {
        let opts: Opts = opts.try_into()?;
        opts.validate()?;
        Ok(Self {
            opts,
            proto: Mutex::new(None),
            reconnecting: AtomicBool::new(false),
        })
    }

    pub fn is_connected(&self) -> bool {
        self.proto().is_some_and(|proto| proto.is_connected())
    }

    /// Establish the connection by driving a PING through the write loop.
    pub async fn connect(&self, timeout: Duration) -> Result<()> {
        match self.ensure_write(RequestType::Ping, None, timeout).await? {
            Response::Ack => Ok(()),
            other => Err(unexpected(RequestType::Ping, &other)),
        }
    }

    pub async fn query(
        &self,
        query: &str,
        time_precision: Option<TimePrecision>,
        timeout: Duration,
    ) -> Result<Value> {
        let data = Value::Array(vec![
            Value::from(query),
            time_precision.map_or(Value::Nil, |p| Value::from(p as u8)),
        ]);
        match self
            .ensure_write(RequestType::Query, Some(&data), timeout)
            .await?
        {
            Response::Query(result) => Ok(result),
            other => Err(unexpected(RequestType::Query, &other)),
        }
    }

    pub async fn insert(&self, data: &Value, timeout: Duration) -> Result<Value> {
        match self
            .ensure_write(RequestType::Insert, Some(data), timeout)
            .await?
        {
            Response::Insert(result) => Ok(result),
            other => Err(unexpected(RequestType::Insert, &other)),
        }
    }

    pub async fn close(&self) {
        let proto = self
            .proto
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(proto) = proto {
            proto.close().await;
        }
    }

    fn proto(&self) -> Option<Arc<Proto>> {
        self.proto
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Send a request, waiting out disconnects and transient failures.
    ///
    /// Up to [`MAX_WRITE_RETRY`] attempts: while disconnected, drive the
    /// reconnect; on a transient error, sleep a second, forcing a fresh
    /// reconnect every [`RECONNECT_ATTEMPT`]th failure. The last error
    /// surfaces once the retry budget is spent.
    async fn ensure_write(
        &self,
        ty: RequestType,
        data: Option<&Value>,
        timeout: Duration,
    ) -> Result<Response> {
        let mut retry: u32 = 0;
        loop {
            retry += 1;

            let Some(proto) = self.proto().filter(|proto| proto.is_connected()) else {
                if retry > MAX_WRITE_RETRY {
                    return Err(Error::ConnectionError(
                        "failed to create a connection".to_string(),
                    ));
                }
                if retry == 1 {
                    info!("wait for a connection");
                }
                self.reconnect().await;
                continue;
            };

            match proto.send(ty, data, timeout).await {
                Err(e) if retryable(&e) => {
                    if retry > MAX_WRITE_RETRY {
                        return Err(e);
                    }
                    if retry % RECONNECT_ATTEMPT == 0 {
                        self.reconnect().await;
                    } else {
                        sleep(Duration::from_secs(1)).await;
                    }
                }
                result => return result,
            }
        }
    }

    /// At most one caller runs the reconnect loop; the others only yield
    /// for a second so the write loop re-checks the connection.
    async fn reconnect(&self) {
        if self.reconnecting.swap(true, Ordering::SeqCst) {
            sleep(Duration::from_secs(1)).await;
            return;
        }
        let _reset = ResetOnDrop(&self.reconnecting);

        let server = &self.opts.servers[0];
        let mut wait = 1u64;
        let mut timeout = 2u64;
        loop {
            let credentials = Credentials {
                username: self.opts.username.clone(),
                password: self.opts.password.clone(),
                dbname: self.opts.dbname.clone(),
            };
            match Proto::open(
                &server.host,
                server.port,
                credentials,
                Duration::from_secs(timeout),
                Arc::new(NullObserver),
            )
            .await
            {
                Ok(proto) => {
                    // the replaced engine is dropped once in-flight
                    // requests let go of it; dropping sweeps its pending
                    // table
                    *self.proto.lock().unwrap_or_else(PoisonError::into_inner) =
                        Some(Arc::new(proto));
                    break;
                }
                Err(e) => {
                    error!(
                        "connecting to {}:{} failed: {e}, try next connect in {wait} seconds",
                        server.host, server.port
                    );
                }
            }

            sleep(Duration::from_secs(wait)).await;
            wait = (wait * 2).min(MAX_RECONNECT_WAIT_TIME);
            timeout = (timeout + 1).min(MAX_RECONNECT_TIMEOUT);
        }
    }
}

fn retryable(err: &Error) -> bool {
    matches!(
        err,
        Error::ServerError(_)
            | Error::PoolError(_)
            | Error::IoError(_)
            | Error::TimeoutError(_)
            | Error::ConnectionError(_)
            | Error::ConnectError(_)
    )
}

struct ResetOnDrop<'a>(&'a AtomicBool);

impl Drop for ResetOnDrop<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}
