//! 客户端错误定义。

use cs_shared_protocol::e2ee::E2eeError;
use thiserror::Error;

/// relay 客户端对外错误。
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("no e2ee session for peer {0}")]
    NoSession(String),
    #[error("relay connection is not established")]
    NotConnected,
    #[error("invalid relay server url: {0}")]
    InvalidServerUrl(String),
    #[error("payload is not serializable json")]
    Encode,
    #[error("crypto failure: {0}")]
    Crypto(#[from] E2eeError),
}
