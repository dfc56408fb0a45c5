//! Named shared-memory queue for moving large binary payloads between
//! one producer process and one consumer process.
//!
//! ```no_run
//! use shmem::SMQueue;
//!
//! # fn main() -> Result<(), shmem::ShmemLibError> {
//! SMQueue::destroy("/demo")?;
//! let mut producer = SMQueue::create("/demo", 4, 1024)?;
//! let mut consumer = SMQueue::open("/demo")?;
//!
//! producer.push(b"payload")?;
//! let mut buf = vec![0u8; consumer.element_size()];
//! if let Some(len) = consumer.try_pop(&mut buf)? {
//!     assert_eq!(&buf[..len], b"payload");
//! }
//! SMQueue::destroy("/demo")?;
//! # Ok(())
//! # }
//! ```

#[cfg(not(unix))]
compile_error!("shmem relies on POSIX shared memory and only supports Unix-like systems.");

mod core;
mod errors;
pub mod frame;
mod queue;
mod reader;
mod writer;

#[cfg(test)]
mod tests;

pub use crate::core::{validate_name, Layout, ShmemConfig, ShmemConfigBuilder};
pub use crate::errors::{Result, ShmemLibError};
pub use crate::queue::{QueueStats, SMQueue};
