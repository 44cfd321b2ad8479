//! Infrastructure layer with the loader and its adapters.

/// Application configuration.
pub mod config;
/// Image loading (caching, scheduling, fetching, coalescing).
pub mod image;

pub use config::{AppConfig, CliArgs, ConfigError, ConfigStorage, LogLevel};
pub use image::{
    CacheStats, FileDiskStore, HttpFetcher, ImageLoader, ImageLoaderBuilder, ImageLoaderConfig,
    LoaderRegistry, MemoryImageCache, MemoryPressureSignal, StandardDecoder,
};
