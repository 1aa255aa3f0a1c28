use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("device list is empty or mixes page sizes")]
    MixedPageSizes,

    #[error("arena would exceed its maximum size")]
    MaxSizeExceeded,

    #[error("mmap failed: {0}")]
    Mmap(#[source] io::Error),

    #[error("mbind failed: {0}")]
    Bind(#[source] io::Error),

    #[error("jemalloc control call {0:?} failed: {1}")]
    Mallctl(&'static str, i32),

    #[error("page migration failed with errno {0}")]
    Migration(i32),

    #[error("no arena owns this pointer")]
    UnknownArena,
}
