mod cluster;
mod conn;
mod endpoint;
mod proto;
pub mod reconnect;

use std::sync::Arc;
use std::time::Duration;

use rmpv::Value;

use crate::constant::RequestType;
use crate::error::{Error, Result};
use crate::protocol::Response;

pub use cluster::Cluster;
pub use conn::Conn;

/// Probe a server without authenticating.
///
/// INFO is the one request a SiriDB server answers pre-auth; it returns
/// the server's name, version and pool layout. The transport is closed
/// before returning.
pub async fn server_info(host: &str, port: u16, timeout: Duration) -> Result<Value> {
    let proto =
        proto::Proto::open_unauth(host, port, timeout, Arc::new(proto::NullObserver)).await?;
    let outcome = proto
        .send(RequestType::Info, None, Duration::from_secs(10))
        .await;
    proto.close().await;
    match outcome? {
        Response::Info(info) => Ok(info),
        other => Err(Error::ProtocolError(format!(
            "unexpected response to INFO: {other:?}"
        ))),
    }
}
