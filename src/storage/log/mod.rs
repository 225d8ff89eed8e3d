//! Local log store for one storage node.
//!
//! Every mutation (record, seal, trim) is appended to a single segment file
//! and nothing is rewritten in place; the in-memory index is rebuilt by
//! replaying the segment on open.
//!
//! # Module Structure
//!
//! - `entry`: entry header, seal/trim bodies and the per-log index
//! - `segment`: segment file append and replay
//! - `store`: `LocalLogStore`, the store operations and `RecordIter`

mod entry;
mod segment;
mod store;


pub use entry::{
    ENTRY_HEADER_SIZE, ENTRY_MAGIC_NUM, EntryHeader, EntryMeta, EntryType, Index, LogIndex,
    SealRecord, TrimRecord,
};

pub use segment::LogSegment;

pub use store::{LocalLogStore, LocalLogStoreOptions, RecordIter, StoreHealth, StoreStatus};
