use thiserror::Error;

use crate::protocol::codec::FrameError;
use crate::protocol::rpc::RpcError;

#[derive(Error, Debug)]
pub enum TparError {
    #[error("failed to connect to {addr} (is the server running there?)")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("connection closed by peer")]
    Disconnected,

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("server unavailable: {0}")]
    Server(#[from] RpcError),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("invalid filter expression: {0}")]
    Filter(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, TparError>;
