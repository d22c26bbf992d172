pub mod disk;
pub mod entry;
pub mod fast_cache;
pub mod flusher;
pub mod tiered;

// Re-export the store surface for convenient access (e.g. `use crate::store::TieredStore`).
pub use disk::DiskTier;
pub use fast_cache::{FastCache, InProcessFastCache};
pub use flusher::{FlushRequest, SnapshotSink, WriteBehindFlusher};
pub use tiered::TieredStore;
