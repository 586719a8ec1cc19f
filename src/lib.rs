//! Memory and thread plumbing for an embedded interpreter runtime: a
//! fixed-block region allocator with a heap fallback, a pluggable allocator
//! indirection, tracked heap wrappers, and threads that start with a run loop
//! and run exit callbacks when they end. [`externc`] is the C face of all of
//! it.

pub mod alloc;
pub mod error;
pub mod externc;
pub mod os;
mod serialize;
pub mod thread;
pub mod util;

pub use error::{Error, Result};

/// Set up `env_logger`, filtered by `RUST_LOG` (default `warn`). Harmless to
/// call more than once.
pub fn init_logging() {
    _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"))
        .try_init();
}

/// C entry point for [`init_logging()`]
#[no_mangle]
pub extern "C" fn dlc_init_logging() {
    init_logging();
}
