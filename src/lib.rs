//! Replicated shared log.
//!
//! Records are appended through a per-log sequencer that assigns LSNs
//! `(epoch, esn)`, replicated by appenders to `r` storage nodes chosen by
//! the copyset selector, and read back from the nodes' local log stores.
//! On failover the new sequencer recovers every unfinished epoch before
//! assigning LSNs of its own.

pub mod appender;
pub mod cancel;
pub mod config;
pub mod copyset;
pub mod driver;
pub mod epoch_store;
pub mod error;
pub mod message;
pub mod mock;
pub mod network;
pub mod node;
pub mod permission;
pub mod reader;
pub mod recovery;
pub mod retry;
pub mod sequencer;
pub mod storage;
pub mod traits;
pub mod types;

pub use config::{ClusterConfig, NodeDescriptor};
pub use driver::{DriverOptions, LogDriver};
pub use error::ReplogError;
pub use reader::{LogReader, ReaderOptions};
pub use traits::{EpochAuthority, StorageTransport};
pub use types::*;
