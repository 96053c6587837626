//! Per-key version chains: lock-free reads, single-latched-writer updates,
//! and the per-worker allocators that back them (spec.md §3, §4.2).

pub mod record;
pub mod slot;
pub mod table;
pub mod version_buffer;

pub use record::{RecordNode, RecordSlab};
pub use table::{begin_write, RecordHandle, VersionedTable};
pub use version_buffer::{VersionBuffer, VersionBufferAllocator, BUFFER_SIZE, SEGMENT_CAPACITY};
