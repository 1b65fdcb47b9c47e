//! Main Crate Error

use crate::common::messages::{MessageError, MessageType};
use crate::republish::StoreError;
use crate::rpc::DispatchError;

#[derive(thiserror::Error, Debug)]
/// Kadmos crate error enum.
pub enum Error {
    /// Indicates that a [crate::Kuid] was built from the wrong number of bytes.
    #[error("Invalid Kuid size, expected 20, got {0}")]
    InvalidKuidSize(usize),

    #[error("Invalid Kuid hex encoding: {0}")]
    InvalidKuidEncoding(String),

    #[error(transparent)]
    /// Transparent [std::io::Error]
    IO(#[from] std::io::Error),

    #[error(transparent)]
    Message(#[from] MessageError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// No response arrived before the request timed out.
    #[error("Request timed out")]
    Timeout,

    #[error("Unexpected response type: {0:?}")]
    UnexpectedResponse(MessageType),
}
