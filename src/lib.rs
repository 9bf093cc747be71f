//! A persistent, incrementally maintained vantage-point tree over 64-bit
//! perceptual hashes, stored in LMDB.
//!
//! The index answers "which files look like this one?" queries: every file is
//! associated to one or more perceptual hashes, the hashes live in a metric
//! tree under the Hamming distance, and [`Reader::search`] walks the tree with
//! ball-overlap pruning to report every file within a requested distance.
//!
//! Mutations go through a [`Writer`]: interning a new hash inserts its leaf
//! into the live tree, and insertions that leave a subtree lopsided queue it
//! for regeneration. The queue is drained by [`Writer::maintain_tree`], a
//! cooperative maintenance loop that rebuilds one branch at a time and can be
//! cancelled between units of work.
//!
//! The crate also carries the per-service file state store ([`FileStore`])
//! whose membership decides which hashes are still worth indexing.

mod distance;
mod error;
mod files;
mod index;
mod key;
mod maintenance;
mod metadata;
mod node;
mod reader;
mod writer;

#[cfg(test)]
mod tests;

pub use distance::hamming;
pub use error::Error;
pub use files::{FileStatus, FileStore, Services};
pub use index::{Index, IndexOptions};
pub use maintenance::MaintainOptions;
pub use metadata::Metadata;
pub use reader::Reader;
pub use writer::Writer;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// An external file identifier.
pub type FileId = u32;

/// The stable identifier of an interned perceptual hash.
pub type PhashId = u32;

/// An external service namespace identifier.
pub type ServiceId = u32;

/// An external petition or deletion reason identifier.
pub type ReasonId = u32;

/// A 64-bit perceptual hash, treated as raw bits.
pub type PHash = u64;

/// A big endian-encoded u32.
pub type BEU32 = heed::types::U32<heed::byteorder::BE>;

/// A big endian-encoded u64.
pub type BEU64 = heed::types::U64<heed::byteorder::BE>;
