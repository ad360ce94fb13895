pub mod client;
pub mod constant;
pub mod error;
mod opts;
pub mod protocol;
mod qpack;
pub mod sync;

pub use client::{Cluster, Conn, server_info};
pub use constant::TimePrecision;
pub use error::{Error, Result};
pub use opts::{Opts, Server};
pub use rmpv::Value;

/// Connect to a single server and return a cooperative handle.
pub async fn async_connect<O: TryInto<Opts>>(opts: O) -> Result<client::Conn>
where
    Error: From<O::Error>,
{
    client::Conn::connect(opts).await
}

/// Connect to a single server and return a blocking handle.
pub fn connect<O: TryInto<Opts>>(opts: O) -> Result<sync::Conn>
where
    Error: From<O::Error>,
{
    sync::connect(opts)
}
