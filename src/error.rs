//! Error taxonomy. Every variant renders to the exact RESP error text the
//! wire protocol expects; `RedpointError::to_frame` is the one place that
//! knows how.

use crate::resp::Frame;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RedpointError {
    #[error("ERR Protocol error: {0}")]
    Protocol(String),

    #[error("ERR Expected array for command")]
    ExpectedArray,

    #[error("ERR No command given")]
    NoCommand,

    #[error("ERR Unknown command")]
    UnknownCommand,

    #[error("ERR INVALID_NUMBER_OF_ARGUMENTS")]
    WrongArity,

    #[error("ERR value is not an integer")]
    NotAnInteger,

    #[error("ERR Operation against a key holding the wrong kind of value")]
    WrongType,

    #[error("ERR syntax error")]
    Syntax,

    #[error("ERR MULTI calls can not be nested")]
    NestedMulti,

    #[error("ERR DISCARD without MULTI")]
    DiscardWithoutMulti,

    #[error("ERR EXEC without MULTI")]
    ExecWithoutMulti,

    #[error("ERR The ID specified in XADD is equal or smaller than the target stream top item")]
    XaddIdTooSmall,

    #[error("ERR The ID specified in XADD must be greater than 0-0")]
    XaddIdZero,

    #[error("ERR MISMATCHED_KEYS_AND_IDS")]
    MismatchedKeysAndIds,

    #[error("ERR Unsupported CONFIG parameter: {0}")]
    UnsupportedConfigParam(String),

    #[error("ERR {0}")]
    Persistence(String),

    #[error("ERR {0}")]
    Other(String),
}

impl RedpointError {
    pub fn to_frame(&self) -> Frame {
        Frame::error(self.to_string())
    }
}
