//! Page-mapped flash translation layer over a timed multi-channel NAND model.

pub mod address;
pub mod block;
pub mod buffer;
pub mod clock;
pub mod config;
pub mod error;
pub mod flash;
pub mod ftl;
pub mod gc;
pub mod host;
pub mod persist;
pub mod request;
pub mod scheduler;
pub mod ssd;
pub mod stats;

pub use error::{FtlError, Result};
pub use scheduler::{HostInterface, IoScheduler};
pub use ssd::Ssd;
