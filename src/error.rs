use std::io;

use thiserror::Error;

#[non_exhaustive]
#[derive(Debug, Error)]
pub enum Error {
    /// The OS refused to reserve (or commit) the address range
    #[error("could not reserve {size} bytes of address space (errno {errno})")]
    OutOfAddressSpace { size: usize, errno: i32 },
    #[error(
        "block size {block_size} must be a multiple of the page size ({page_size}) \
         and divide the region size {max_size}"
    )]
    InvalidGeometry {
        block_size: usize,
        max_size: usize,
        page_size: usize,
    },
    #[error("invalid value {value:?} for {key}")]
    InvalidConfig { key: &'static str, value: String },
    #[error("the block allocator is already initialized")]
    AlreadyInitialized,
    #[error("the block allocator is not initialized")]
    NotInitialized,
    #[error("a run loop is already installed on this thread")]
    RunLoopInstalled,
    #[error("thread stack size {size} is below the minimum of {min}")]
    StackTooSmall { size: usize, min: usize },
    #[error("could not spawn thread: {0}")]
    Spawn(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
