//! error types shared by the resolver engine

use derive_more::{Display, Error, From};

#[derive(Debug, Display, From, Error)]
pub enum ResolveError {
    Proto(hickory_proto::error::ProtoError),
    Io(std::io::Error),
    DuplicateKey,
    NoServerFound,
    NoResponse,
    PoolClosed,
    InvalidAddr,
    TimeOut,
}

pub type Result<T> = std::result::Result<T, ResolveError>;
