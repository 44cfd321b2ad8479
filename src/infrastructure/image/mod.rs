//! Image loading infrastructure.
//!
//! This module provides:
//! - Memory caching with LRU eviction and memory-pressure handling
//! - Filesystem reads and atomic writes for local images
//! - HTTP fetching and decoding
//! - Request coalescing, bounded scheduling and the loader façade

pub mod decoder;
pub mod disk_store;
pub mod http_fetcher;
pub mod loader;
pub mod memory_cache;
pub mod registry;
pub mod request_table;
pub mod scheduler;

pub use decoder::{StandardDecoder, decoded_cost};
pub use disk_store::{FileDiskStore, default_cache_dir, default_document_dir};
pub use http_fetcher::HttpFetcher;
pub use loader::{ImageLoader, ImageLoaderBuilder, ImageLoaderConfig};
pub use memory_cache::{CacheStats, MemoryImageCache, MemoryPressureSignal};
pub use registry::{DEFAULT_LOADER_NAME, LoaderRegistry};
pub use request_table::{Consumer, Registration, RequestTable, RequestToken};
pub use scheduler::{JobError, JobHandle, JobResult, Scheduler};
