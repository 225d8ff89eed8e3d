pub mod log;

pub use log::{LocalLogStore, LocalLogStoreOptions, RecordIter, StoreHealth, StoreStatus};
