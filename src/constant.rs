use std::time::Duration;

/// Default port a SiriDB server listens on for client connections.
pub const DEFAULT_CLIENT_PORT: u16 = 9000;

/// 2 MB is the maximum package size which is allowed by SiriDB,
/// but even lower size packages are recommended (< 1 MB).
pub const MAX_PACKAGE_SZ: usize = 2_000_000;

/// Default timeout used while connecting to a SiriDB server.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// When a server is temporarily not available, for example the server
/// could be paused, it is marked inactive for this long.
pub const DEFAULT_INACTIVE_TIME: Duration = Duration::from_secs(30);

/// Never wait more than this long before trying to connect again.
pub const DEFAULT_MAX_WAIT_RETRY: Duration = Duration::from_secs(90);

/// The authentication request gets its own fixed timeout.
pub const AUTH_TIMEOUT: Duration = Duration::from_secs(10);

/// An idle connection is probed after this long without a response.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(45);

/// Timeout for the keep-alive PING probe.
pub const KEEPALIVE_PING_TIMEOUT: Duration = Duration::from_secs(15);

/// Payload encoding for a message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DType {
    /// No payload.
    None,
    /// Payload is an encoded value tree.
    Encoded,
    /// Payload is passed through as raw bytes.
    Raw,
}

/// Client protocol request types.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestType {
    Query = 0,
    Insert = 1,
    Auth = 2,
    Ping = 3,
    Info = 4,
    LoadDb = 5,
    RegisterServer = 6,
    FileServers = 7,
    FileUsers = 8,
    FileGroups = 9,
    FileDatabase = 10,
}

impl RequestType {
    /// How the payload for this request type is produced.
    pub fn dtype(self) -> DType {
        match self {
            Self::Query | Self::Insert | Self::Auth | Self::LoadDb | Self::RegisterServer => {
                DType::Encoded
            }
            Self::Ping
            | Self::Info
            | Self::FileServers
            | Self::FileUsers
            | Self::FileGroups
            | Self::FileDatabase => DType::None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Query => "QUERY",
            Self::Insert => "INSERT",
            Self::Auth => "AUTH",
            Self::Ping => "PING",
            Self::Info => "INFO",
            Self::LoadDb => "LOADDB",
            Self::RegisterServer => "REGISTER_SERVER",
            Self::FileServers => "FILE_SERVERS",
            Self::FileUsers => "FILE_USERS",
            Self::FileGroups => "FILE_GROUPS",
            Self::FileDatabase => "FILE_DATABASE",
        }
    }
}

// Client protocol success response types.
pub const RES_QUERY: u8 = 0;
pub const RES_INSERT: u8 = 1;
pub const RES_ACK: u8 = 2;
pub const RES_AUTH_SUCCESS: u8 = 3;
pub const RES_INFO: u8 = 4;
pub const RES_FILE: u8 = 5;

// Client protocol error response types.
pub const ERR_MSG: u8 = 64;
pub const ERR_QUERY: u8 = 65;
pub const ERR_INSERT: u8 = 66;
pub const ERR_SERVER: u8 = 67;
pub const ERR_POOL: u8 = 68;
pub const ERR_USER_ACCESS: u8 = 69;
pub const ERR: u8 = 70;
pub const ERR_NOT_AUTHENTICATED: u8 = 71;
pub const ERR_AUTH_CREDENTIALS: u8 = 72;
pub const ERR_AUTH_UNKNOWN_DB: u8 = 73;
pub const ERR_LOADING_DB: u8 = 74;
pub const ERR_FILE: u8 = 75;

/// Timestamp unit transmitted alongside a query.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimePrecision {
    Second = 0,
    Millisecond = 1,
    Microsecond = 2,
    Nanosecond = 3,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_dtypes() {
        assert_eq!(RequestType::Query.dtype(), DType::Encoded);
        assert_eq!(RequestType::Insert.dtype(), DType::Encoded);
        assert_eq!(RequestType::Auth.dtype(), DType::Encoded);
        assert_eq!(RequestType::Ping.dtype(), DType::None);
        assert_eq!(RequestType::Info.dtype(), DType::None);
        assert_eq!(RequestType::FileDatabase.dtype(), DType::None);
    }
}
