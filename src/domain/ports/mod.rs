mod disk_store_port;
mod image_cache_port;
mod image_decoder_port;
mod image_fetcher_port;

pub use disk_store_port::DiskStorePort;
pub use image_cache_port::ImageCachePort;
pub use image_decoder_port::ImageDecoder;
pub use image_fetcher_port::ImageFetcher;
