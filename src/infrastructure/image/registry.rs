//! Named loader instances.
//!
//! A [`LoaderRegistry`] owns every loader it hands out. Loaders are created
//! on first request by name and torn down by [`LoaderRegistry::cleanup_loader_with_name`].
//! All registry-created loaders share one memory cache unless the factory
//! says otherwise.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use tracing::{debug, info};

use super::loader::{ImageLoader, ImageLoaderConfig};
use super::memory_cache::MemoryImageCache;
use crate::domain::errors::SetupError;
use crate::domain::ports::ImageCachePort;

/// Name of the loader returned by [`LoaderRegistry::default_loader`].
pub const DEFAULT_LOADER_NAME: &str = "Default";

type LoaderFactory =
    dyn Fn(&str, Arc<dyn ImageCachePort>) -> Result<ImageLoader, SetupError> + Send + Sync;

/// Owns loaders keyed by name.
pub struct LoaderRegistry {
    loaders: Mutex<HashMap<String, Arc<ImageLoader>>>,
    cache: Arc<MemoryImageCache>,
    factory: Box<LoaderFactory>,
}

static GLOBAL: OnceLock<LoaderRegistry> = OnceLock::new();

impl LoaderRegistry {
    /// Creates a registry whose loaders are built from `config`.
    #[must_use]
    pub fn new(config: ImageLoaderConfig) -> Self {
        Self::with_factory(Arc::new(MemoryImageCache::unbounded()), move |name, cache| {
            ImageLoader::builder(name)
                .config(config.clone())
                .cache(cache)
                .build()
        })
    }

    /// Creates a registry with a custom loader factory.
    pub fn with_factory<F>(cache: Arc<MemoryImageCache>, factory: F) -> Self
    where
        F: Fn(&str, Arc<dyn ImageCachePort>) -> Result<ImageLoader, SetupError>
            + Send
            + Sync
            + 'static,
    {
        Self {
            loaders: Mutex::new(HashMap::new()),
            cache,
            factory: Box::new(factory),
        }
    }

    /// Returns the process-wide registry, created on first use.
    pub fn global() -> &'static Self {
        GLOBAL.get_or_init(|| Self::new(ImageLoaderConfig::default()))
    }

    /// Returns the loader named [`DEFAULT_LOADER_NAME`].
    ///
    /// # Errors
    /// Returns error if the loader has to be created and creation fails.
    pub fn default_loader(&self) -> Result<Arc<ImageLoader>, SetupError> {
        self.loader_with_name(DEFAULT_LOADER_NAME)
    }

    /// Returns the loader called `name`, creating it on first use.
    ///
    /// # Errors
    /// Returns error if the loader has to be created and creation fails.
    pub fn loader_with_name(&self, name: &str) -> Result<Arc<ImageLoader>, SetupError> {
        let mut loaders = self.loaders.lock();
        if let Some(loader) = loaders.get(name) {
            return Ok(loader.clone());
        }

        let cache: Arc<dyn ImageCachePort> = self.cache.clone();
        let loader = Arc::new((self.factory)(name, cache)?);
        loaders.insert(name.to_string(), loader.clone());
        debug!(name, "Registered image loader");
        Ok(loader)
    }

    /// Shuts down and forgets the loader called `name`.
    /// Returns false if there was none.
    pub fn cleanup_loader_with_name(&self, name: &str) -> bool {
        let Some(loader) = self.loaders.lock().remove(name) else {
            return false;
        };
        loader.shutdown();
        info!(name, "Image loader cleaned up");
        true
    }

    /// Shuts down and forgets every loader.
    pub fn cleanup_all(&self) {
        let loaders: Vec<_> = self.loaders.lock().drain().collect();
        for (name, loader) in loaders {
            loader.shutdown();
            debug!(name = %name, "Image loader cleaned up");
        }
    }

    /// Returns the cache shared by registry-created loaders.
    #[must_use]
    pub fn default_image_cache(&self) -> Arc<MemoryImageCache> {
        self.cache.clone()
    }

    /// Returns the names of live loaders, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.loaders.lock().keys().cloned().collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for LoaderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoaderRegistry")
            .field("loaders", &self.names())
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}
