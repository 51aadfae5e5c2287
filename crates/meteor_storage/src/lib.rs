//! Storage layer: sharded versioned table, write-ahead log, sequence
//! allocation, and crash recovery.

pub mod gsn;
pub mod recovery;
pub mod table;
pub mod wal;

pub use gsn::{SequenceAllocator, SequenceKind};
pub use table::VersionedTable;
pub use wal::WalManager;
