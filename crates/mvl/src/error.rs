use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, LogError>;

#[derive(Debug, Error)]
pub enum LogError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("out of memory allocating {len} bytes")]
    OutOfMemory { len: usize },

    #[error("invalid video log magic")]
    InvalidMagic,

    #[error("video log declares too many channels ({0})")]
    TooManyChannels(u32),

    #[error("operation requires a {0} container")]
    WrongMode(&'static str),

    #[error("corrupt video log: {0}")]
    Corrupt(&'static str),

    #[error("unknown dirty packet tag {0:#x}")]
    UnknownPacketTag(u32),

    #[error("deflate failed: {0}")]
    Compress(#[from] flate2::CompressError),
}
