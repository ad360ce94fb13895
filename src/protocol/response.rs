use rmpv::Value;

use crate::constant::{
    ERR, ERR_AUTH_CREDENTIALS, ERR_AUTH_UNKNOWN_DB, ERR_FILE, ERR_INSERT, ERR_LOADING_DB, ERR_MSG,
    ERR_NOT_AUTHENTICATED, ERR_POOL, ERR_QUERY, ERR_SERVER, ERR_USER_ACCESS, RES_ACK,
    RES_AUTH_SUCCESS, RES_FILE, RES_INFO, RES_INSERT, RES_QUERY,
};
use crate::error::{Error, Result};
use crate::qpack;

/// A successful server response, already decoded per its type.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Query(Value),
    Insert(Value),
    Ack,
    AuthSuccess,
    Info(Value),
    File(Vec<u8>),
}

impl Response {
    /// Translate a received package into a response or the matching error
    /// kind. Error payloads carry `{error_msg: ...}`; it is extracted here,
    /// once, so awaiters only ever see typed errors.
    pub fn dispatch(ty: u8, payload: &[u8]) -> Result<Response> {
        match ty {
            RES_QUERY => Ok(Response::Query(qpack::decode(payload)?)),
            RES_INSERT => Ok(Response::Insert(qpack::decode(payload)?)),
            RES_ACK => Ok(Response::Ack),
            RES_AUTH_SUCCESS => Ok(Response::AuthSuccess),
            RES_INFO => Ok(Response::Info(qpack::decode(payload)?)),
            RES_FILE => Ok(Response::File(payload.to_vec())),

            ERR_MSG => Err(Error::RuntimeError(server_msg(payload))),
            ERR_QUERY => Err(Error::QueryError(server_msg(payload))),
            ERR_INSERT => Err(Error::InsertError(server_msg(payload))),
            ERR_SERVER => Err(Error::ServerError(server_msg(payload))),
            ERR_POOL => Err(Error::PoolError(server_msg(payload))),
            ERR_USER_ACCESS => Err(Error::UserAuthError(server_msg(payload))),
            ERR => Err(Error::RuntimeError(
                "Unexpected error occurred, view siridb log for more info".to_string(),
            )),
            ERR_NOT_AUTHENTICATED => Err(Error::AuthError(
                "This connection is not authenticated".to_string(),
            )),
            ERR_AUTH_CREDENTIALS => Err(Error::AuthError("Invalid credentials".to_string())),
            ERR_AUTH_UNKNOWN_DB => Err(Error::AuthError("Unknown database".to_string())),
            ERR_LOADING_DB => Err(Error::RuntimeError(
                "Error loading database, please check the SiriDB log files".to_string(),
            )),
            ERR_FILE => Err(Error::RuntimeError("Error retrieving file".to_string())),

            unknown => Err(Error::UnknownPackageType(unknown)),
        }
    }
}

fn server_msg(payload: &[u8]) -> String {
    qpack::error_msg(payload).unwrap_or_else(|| "no error message received".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn err_payload(msg: &str) -> Vec<u8> {
        qpack::encode(&Value::Map(vec![(
            Value::from("error_msg"),
            Value::from(msg),
        )]))
        .expect("encode error payload")
    }

    #[test]
    fn success_types() {
        assert_eq!(Response::dispatch(RES_ACK, b"").unwrap(), Response::Ack);
        assert_eq!(
            Response::dispatch(RES_AUTH_SUCCESS, b"").unwrap(),
            Response::AuthSuccess
        );

        let payload = qpack::encode(&Value::from(123)).unwrap();
        assert_eq!(
            Response::dispatch(RES_QUERY, &payload).unwrap(),
            Response::Query(Value::from(123))
        );
        assert_eq!(
            Response::dispatch(RES_FILE, b"\x01\x02").unwrap(),
            Response::File(vec![1, 2])
        );
    }

    #[test]
    fn query_error_carries_message() {
        match Response::dispatch(ERR_QUERY, &err_payload("syntax error")) {
            Err(Error::QueryError(msg)) => assert_eq!(msg, "syntax error"),
            other => panic!("expected QueryError, got {other:?}"),
        }
    }

    #[test]
    fn auth_errors_use_fixed_messages() {
        match Response::dispatch(ERR_AUTH_CREDENTIALS, b"") {
            Err(Error::AuthError(msg)) => assert_eq!(msg, "Invalid credentials"),
            other => panic!("expected AuthError, got {other:?}"),
        }
        match Response::dispatch(ERR_AUTH_UNKNOWN_DB, b"") {
            Err(Error::AuthError(msg)) => assert_eq!(msg, "Unknown database"),
            other => panic!("expected AuthError, got {other:?}"),
        }
        match Response::dispatch(ERR_NOT_AUTHENTICATED, b"") {
            Err(Error::AuthError(msg)) => assert_eq!(msg, "This connection is not authenticated"),
            other => panic!("expected AuthError, got {other:?}"),
        }
    }

    #[test]
    fn user_access_error_is_its_own_kind() {
        match Response::dispatch(ERR_USER_ACCESS, &err_payload("no insert rights")) {
            Err(Error::UserAuthError(msg)) => assert_eq!(msg, "no insert rights"),
            other => panic!("expected UserAuthError, got {other:?}"),
        }
    }

    #[test]
    fn unknown_type_is_rejected() {
        assert!(matches!(
            Response::dispatch(0xAB, b""),
            Err(Error::UnknownPackageType(0xAB))
        ));
    }
}
