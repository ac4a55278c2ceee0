use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("cache init error: {0}")]
    CacheInit(String),

    #[error("incompatible cache header: {0}")]
    CacheHeader(String),

    #[error("cache region is full")]
    CacheFull,

    #[error("record does not fit the cache entry buffer")]
    EntryOverflow,

    #[error("dns protocol error: {0}")]
    Proto(#[from] hickory_proto::error::ProtoError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
