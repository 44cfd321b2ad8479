//! Async image loading orchestrator.
//!
//! Resolves identifiers through three tiers: memory cache, local disk and
//! the network fetcher. Cache hits complete on the caller's thread. Misses
//! register a consumer in the [`RequestTable`]; the first consumer for an
//! identifier submits one scheduler job and everyone else waits on it.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::runtime::Handle;
use tracing::{debug, info, trace, warn};

use super::decoder::{StandardDecoder, decoded_cost};
use super::disk_store::{FileDiskStore, default_cache_dir, default_document_dir};
use super::http_fetcher::HttpFetcher;
use super::memory_cache::MemoryImageCache;
use super::request_table::{Consumer, Registration, RequestTable, RequestToken};
use super::scheduler::{JobError, JobHandle, JobResult, Scheduler};
use crate::domain::entities::{
    Completion, Image, ImageId, LoadLocation, LoadOutcome, ResolvedImage, Target,
};
use crate::domain::errors::{LoadError, SetupError};
use crate::domain::ports::{DiskStorePort, ImageCachePort, ImageDecoder, ImageFetcher};

/// Configuration for the image loader.
#[derive(Debug, Clone)]
pub struct ImageLoaderConfig {
    /// Maximum concurrent loads, 0 for unbounded.
    pub max_concurrent_loads: usize,
    /// Deadline per load counted from submission, `None` for no deadline.
    pub loading_timeout: Option<Duration>,
    /// Base for [`ImageLoader::load_from_cache_path`].
    pub cache_dir: Option<PathBuf>,
    /// Base for [`ImageLoader::load_from_document_path`].
    pub document_dir: Option<PathBuf>,
}

impl Default for ImageLoaderConfig {
    fn default() -> Self {
        Self {
            max_concurrent_loads: 4,
            loading_timeout: Some(Duration::from_secs(30)),
            cache_dir: Some(default_cache_dir()),
            document_dir: Some(default_document_dir()),
        }
    }
}

/// Builder for [`ImageLoader`]. Unset collaborators get production defaults.
pub struct ImageLoaderBuilder {
    name: String,
    config: ImageLoaderConfig,
    cache: Option<Arc<dyn ImageCachePort>>,
    fetcher: Option<Arc<dyn ImageFetcher>>,
    decoder: Option<Arc<dyn ImageDecoder>>,
    disk: Option<Arc<dyn DiskStorePort>>,
    runtime: Option<Handle>,
}

impl ImageLoaderBuilder {
    /// Replaces the whole configuration.
    #[must_use]
    pub fn config(mut self, config: ImageLoaderConfig) -> Self {
        self.config = config;
        self
    }

    /// Uses `cache` instead of a private unbounded one.
    #[must_use]
    pub fn cache(mut self, cache: Arc<dyn ImageCachePort>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Uses `fetcher` for external identifiers.
    #[must_use]
    pub fn fetcher(mut self, fetcher: impl ImageFetcher + 'static) -> Self {
        self.fetcher = Some(Arc::new(fetcher));
        self
    }

    /// Uses `decoder` for fetched and local bytes.
    #[must_use]
    pub fn decoder(mut self, decoder: impl ImageDecoder + 'static) -> Self {
        self.decoder = Some(Arc::new(decoder));
        self
    }

    /// Uses `disk` for local reads and persisted copies.
    #[must_use]
    pub fn disk(mut self, disk: impl DiskStorePort + 'static) -> Self {
        self.disk = Some(Arc::new(disk));
        self
    }

    /// Spawns jobs onto `runtime` instead of the current one.
    #[must_use]
    pub fn runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Builds the loader.
    ///
    /// # Errors
    /// Returns error if no runtime is available or the default HTTP
    /// fetcher cannot be created.
    pub fn build(self) -> Result<ImageLoader, SetupError> {
        let runtime = match self.runtime {
            Some(handle) => handle,
            None => Handle::try_current().map_err(|_| SetupError::NoRuntime)?,
        };
        let fetcher: Arc<dyn ImageFetcher> = match self.fetcher {
            Some(fetcher) => fetcher,
            None => Arc::new(HttpFetcher::new()?),
        };
        let cache = self
            .cache
            .unwrap_or_else(|| Arc::new(MemoryImageCache::unbounded()));

        let scheduler = Scheduler::new(
            runtime,
            self.config.max_concurrent_loads,
            self.config.loading_timeout,
        );

        info!(
            name = %self.name,
            max_concurrent_loads = self.config.max_concurrent_loads,
            timeout = ?self.config.loading_timeout,
            "Image loader created"
        );

        Ok(ImageLoader {
            shared: Arc::new(LoaderShared {
                name: self.name,
                cache: RwLock::new(cache),
                table: Mutex::new(RequestTable::new()),
                scheduler,
                fetcher,
                decoder: self.decoder.unwrap_or_else(|| Arc::new(StandardDecoder)),
                disk: self.disk.unwrap_or_else(|| Arc::new(FileDiskStore::new())),
                cache_dir: self.config.cache_dir,
                document_dir: self.config.document_dir,
            }),
        })
    }
}

/// Bytes and decoded image produced by one job.
struct Fetched {
    resolved: ResolvedImage,
    bytes: Bytes,
    source: Option<PathBuf>,
}

struct LoaderShared {
    name: String,
    cache: RwLock<Arc<dyn ImageCachePort>>,
    table: Mutex<RequestTable>,
    scheduler: Scheduler,
    fetcher: Arc<dyn ImageFetcher>,
    decoder: Arc<dyn ImageDecoder>,
    disk: Arc<dyn DiskStorePort>,
    cache_dir: Option<PathBuf>,
    document_dir: Option<PathBuf>,
}

impl LoaderShared {
    fn cache(&self) -> Arc<dyn ImageCachePort> {
        self.cache.read().clone()
    }

    /// Local candidates first, then the fetcher. Runs inside a job.
    ///
    /// A destination file that cannot be read or decoded is skipped; only a
    /// failure on the identifier's own path ends the load.
    async fn resolve(&self, id: &ImageId) -> Result<Fetched, LoadError> {
        let own_path = id.local_path();
        let mut candidates: Vec<PathBuf> = own_path.iter().cloned().collect();
        candidates.extend(self.table.lock().destinations(id));

        for path in candidates {
            if !self.disk.exists(&path).await {
                continue;
            }
            debug!(id = %id, path = %path.display(), "Loading image from disk");
            match self.read_local(&path).await {
                Ok((bytes, image)) => {
                    return Ok(Fetched {
                        resolved: ResolvedImage {
                            location: LoadLocation::LocalFile,
                            image: Arc::new(image),
                        },
                        bytes,
                        source: Some(path),
                    });
                }
                Err(e) if own_path.as_ref() == Some(&path) => return Err(e),
                Err(e) => {
                    warn!(
                        id = %id,
                        path = %path.display(),
                        error = %e,
                        "Skipping unreadable destination"
                    );
                }
            }
        }

        if own_path.is_some() {
            return Err(LoadError::not_found(id.as_str()));
        }

        let bytes = self.fetcher.fetch(id).await?;
        debug!(id = %id, size = bytes.len(), "Fetched image");
        let image = self.decode(bytes.clone()).await?;
        Ok(Fetched {
            resolved: ResolvedImage {
                location: LoadLocation::ExternalFile,
                image: Arc::new(image),
            },
            bytes,
            source: None,
        })
    }

    async fn read_local(&self, path: &Path) -> Result<(Bytes, Image), LoadError> {
        let bytes = self.disk.read(path).await?;
        let image = self.decode(bytes.clone()).await?;
        Ok((bytes, image))
    }

    async fn decode(&self, bytes: Bytes) -> Result<Image, LoadError> {
        let decoder = self.decoder.clone();
        tokio::task::spawn_blocking(move || decoder.decode(&bytes))
            .await
            .map_err(|e| LoadError::worker(format!("Decode task failed: {e}")))?
    }

    /// Job completion hook: caches, persists and fans out the result.
    async fn finish(
        &self,
        id: ImageId,
        token: RequestToken,
        result: JobResult<Result<Fetched, LoadError>>,
    ) {
        let resolution = match result {
            Ok(Err(LoadError::Cancelled)) | Err(JobError::Cancelled) => {
                self.table.lock().discard(&id, token);
                trace!(id = %id, "Load cancelled, no completion");
                return;
            }
            Ok(resolution) => resolution,
            Err(e) => Err(e.into()),
        };

        let drained = {
            let mut table = self.table.lock();
            if !table.is_current(&id, token) {
                trace!(id = %id, "Dropping result of superseded load");
                return;
            }
            if let Ok(fetched) = &resolution {
                let image = fetched.resolved.image.clone();
                self.cache()
                    .set(id.clone(), image.clone(), decoded_cost(&image));
            }
            table.drain(&id, token)
        };
        let Some(drained) = drained else {
            return;
        };

        if let Ok(fetched) = &resolution {
            for destination in drained.destinations() {
                if fetched.source.as_deref() == Some(destination.as_path()) {
                    continue;
                }
                if let Err(e) = self.disk.write(&destination, &fetched.bytes).await {
                    warn!(
                        id = %id,
                        path = %destination.display(),
                        error = %e,
                        "Failed to persist image"
                    );
                }
            }
        }

        let resolution = resolution.map(|fetched| fetched.resolved);
        match &resolution {
            Ok(resolved) => debug!(id = %id, location = %resolved.location, "Image loaded"),
            Err(e) => debug!(id = %id, error = %e, "Image load failed"),
        }
        let delivered = drained.deliver(&resolution);
        trace!(id = %id, delivered, "Completions delivered");
    }
}

impl std::fmt::Debug for LoaderShared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoaderShared")
            .field("name", &self.name)
            .field("scheduler", &self.scheduler)
            .field("pending", &self.table.lock().len())
            .finish_non_exhaustive()
    }
}

/// Orchestrates image loading from memory, disk, and network.
///
/// Dropping the loader cancels all in-flight work, clears pending requests
/// and empties its cache.
#[derive(Debug)]
pub struct ImageLoader {
    shared: Arc<LoaderShared>,
}

impl ImageLoader {
    /// Starts building a loader called `name`.
    #[must_use]
    pub fn builder(name: impl Into<String>) -> ImageLoaderBuilder {
        ImageLoaderBuilder {
            name: name.into(),
            config: ImageLoaderConfig::default(),
            cache: None,
            fetcher: None,
            decoder: None,
            disk: None,
            runtime: None,
        }
    }

    /// Returns the loader's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Loads `id` and reports the outcome to `completion`.
    ///
    /// The completion runs synchronously for an empty identifier or a cache
    /// hit, and on a runtime worker otherwise. It never runs if the load is
    /// cancelled or `target` is dropped first.
    pub fn load(
        &self,
        id: impl Into<ImageId>,
        target: Option<&Target>,
        completion: Option<Completion>,
    ) {
        self.enqueue(id.into(), None, target, completion);
    }

    /// Like [`load`](Self::load), also writing the image bytes to
    /// `destination`. An existing file there satisfies the load directly.
    /// Failing to write it does not fail the load.
    pub fn load_to_file(
        &self,
        id: impl Into<ImageId>,
        destination: impl Into<PathBuf>,
        target: Option<&Target>,
        completion: Option<Completion>,
    ) {
        self.enqueue(id.into(), Some(destination.into()), target, completion);
    }

    /// Warms the cache with `id`; nobody is notified.
    pub fn preload(&self, id: impl Into<ImageId>) {
        self.enqueue(id.into(), None, None, None);
    }

    /// Loads `relative` from the cache directory.
    pub fn load_from_cache_path(
        &self,
        relative: impl AsRef<Path>,
        target: Option<&Target>,
        completion: Option<Completion>,
    ) {
        let base = self.shared.cache_dir.clone();
        self.load_relative(base, relative.as_ref(), "cache", target, completion);
    }

    /// Loads `relative` from the document directory.
    pub fn load_from_document_path(
        &self,
        relative: impl AsRef<Path>,
        target: Option<&Target>,
        completion: Option<Completion>,
    ) {
        let base = self.shared.document_dir.clone();
        self.load_relative(base, relative.as_ref(), "document", target, completion);
    }

    fn load_relative(
        &self,
        base: Option<PathBuf>,
        relative: &Path,
        kind: &str,
        target: Option<&Target>,
        completion: Option<Completion>,
    ) {
        match base {
            Some(base) => {
                let id = ImageId::from_path(base.join(relative));
                self.enqueue(id, None, target, completion);
            }
            None => {
                let id = ImageId::new(relative.display().to_string());
                warn!(id = %id, kind, "No base directory configured");
                if let Some(completion) = completion {
                    completion.complete(LoadOutcome::failure(
                        id,
                        LoadError::invalid_identifier(format!("no {kind} directory configured")),
                        target.map(Target::id),
                    ));
                }
            }
        }
    }

    fn enqueue(
        &self,
        id: ImageId,
        destination: Option<PathBuf>,
        target: Option<&Target>,
        completion: Option<Completion>,
    ) {
        let target_id = target.map(Target::id);
        if id.is_empty() {
            debug!("Rejected load with empty identifier");
            if let Some(completion) = completion {
                completion.complete(LoadOutcome::failure(
                    id,
                    LoadError::invalid_identifier("identifier is empty"),
                    target_id,
                ));
            }
            return;
        }

        let shared = &self.shared;
        let cache = shared.cache();
        let mut hit = cache.get(&id);

        if hit.is_none() {
            let mut table = shared.table.lock();
            // A job may have filled the cache between the lookup and the lock.
            hit = cache.get(&id);
            if hit.is_none() {
                let consumer = Consumer::new(target, completion, destination);
                if let Registration::NewFetch(token) = table.register(&id, consumer) {
                    let job = self.submit_job(&id, token);
                    table.attach_job(&id, token, job);
                }
                return;
            }
        }

        if let (Some(image), Some(completion)) = (hit, completion) {
            completion.complete(LoadOutcome {
                id,
                location: LoadLocation::Cache,
                result: Ok(image),
                target: target_id,
            });
        }
    }

    fn submit_job(&self, id: &ImageId, token: RequestToken) -> JobHandle {
        let worker: Weak<LoaderShared> = Arc::downgrade(&self.shared);
        let finisher = worker.clone();
        let work_id = id.clone();
        let done_id = id.clone();

        debug!(id = %id, loader = %self.shared.name, "Scheduling image load");

        self.shared.scheduler.submit(
            async move {
                match worker.upgrade() {
                    Some(shared) => shared.resolve(&work_id).await,
                    None => Err(LoadError::Cancelled),
                }
            },
            move |result| async move {
                if let Some(shared) = finisher.upgrade() {
                    shared.finish(done_id, token, result).await;
                }
            },
        )
    }

    /// Cancels every consumer of `id`. No completion runs for them.
    pub fn cancel(&self, id: &ImageId) {
        let job = self.shared.table.lock().cancel_for_id(id);
        if let Some(job) = job {
            job.cancel();
        }
    }

    /// Cancels every consumer bound to `target`, across identifiers.
    pub fn cancel_target(&self, target: &Target) {
        let jobs = self.shared.table.lock().cancel_for_target(target.id());
        for job in jobs {
            job.cancel();
        }
    }

    /// Cancels the consumers of `id` bound to `target`.
    pub fn cancel_for(&self, id: &ImageId, target: &Target) {
        let job = self
            .shared
            .table
            .lock()
            .cancel_for_id_and_target(id, target.id());
        if let Some(job) = job {
            job.cancel();
        }
    }

    /// Returns the cache this loader reads and fills.
    #[must_use]
    pub fn image_cache(&self) -> Arc<dyn ImageCachePort> {
        self.shared.cache()
    }

    /// Replaces the cache. Loads already in flight fill the new one.
    pub fn set_image_cache(&self, cache: Arc<dyn ImageCachePort>) {
        *self.shared.cache.write() = cache;
        debug!(loader = %self.shared.name, "Image cache replaced");
    }

    /// Returns the concurrency bound, 0 if unbounded.
    #[must_use]
    pub fn maximum_concurrent_loads(&self) -> usize {
        self.shared.scheduler.max_concurrent()
    }

    /// Sets the concurrency bound for loads started afterwards.
    pub fn set_maximum_concurrent_loads(&self, max: usize) {
        self.shared.scheduler.set_max_concurrent(max);
    }

    /// Returns the per-load deadline.
    #[must_use]
    pub fn loading_timeout(&self) -> Option<Duration> {
        self.shared.scheduler.timeout()
    }

    /// Sets the per-load deadline for loads started afterwards.
    pub fn set_loading_timeout(&self, timeout: Option<Duration>) {
        self.shared.scheduler.set_timeout(timeout);
    }

    /// Returns true while a fetch for `id` is pending.
    #[must_use]
    pub fn is_loading(&self, id: &ImageId) -> bool {
        self.shared.table.lock().contains(id)
    }

    /// Number of identifiers with a fetch pending.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.shared.table.lock().len()
    }

    /// Cancels all work, forgets pending requests and empties the cache.
    pub fn shutdown(&self) {
        let jobs = self.shared.table.lock().clear();
        let cancelled = jobs.len();
        for job in jobs {
            job.cancel();
        }
        self.shared.cache().remove_all();
        info!(loader = %self.shared.name, cancelled, "Image loader shut down");
    }
}

impl Drop for ImageLoader {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::mocks::{MockDiskStorePort, MockImageFetcher, ScriptedFetcher};
    use crate::infrastructure::image::decoder::encode_png;
    use tempfile::TempDir;
    use tokio::sync::mpsc;
    use tokio_test::{assert_err, assert_ok};

    fn test_config() -> ImageLoaderConfig {
        ImageLoaderConfig {
            max_concurrent_loads: 4,
            loading_timeout: None,
            cache_dir: None,
            document_dir: None,
        }
    }

    fn loader_with(fetcher: &ScriptedFetcher) -> ImageLoader {
        ImageLoader::builder("test")
            .config(test_config())
            .fetcher(fetcher.clone())
            .build()
            .unwrap()
    }

    fn png_fetcher(ids: &[&str]) -> ScriptedFetcher {
        ids.iter()
            .fold(ScriptedFetcher::new(), |f, id| f.with_bytes(id, encode_png(2, 2)))
    }

    fn channel() -> (Completion, mpsc::UnboundedReceiver<LoadOutcome>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Completion::channel(tx), rx)
    }

    type Captured = Arc<Mutex<Option<LoadOutcome>>>;

    fn capture() -> (Completion, Captured) {
        let slot: Captured = Arc::default();
        let sink = slot.clone();
        (
            Completion::new(move |outcome| *sink.lock() = Some(outcome)),
            slot,
        )
    }

    #[tokio::test]
    async fn test_concurrent_loads_share_one_fetch() {
        let fetcher = png_fetcher(&["img://a"]).with_delay(Duration::from_millis(30));
        let loader = loader_with(&fetcher);
        let (first, mut rx1) = channel();
        let (second, mut rx2) = channel();

        loader.load("img://a", None, Some(first));
        loader.load("img://a", None, Some(second));
        assert!(loader.is_loading(&ImageId::new("img://a")));
        assert_eq!(loader.pending_count(), 1);

        let a = rx1.recv().await.unwrap();
        let b = rx2.recv().await.unwrap();

        assert_eq!(fetcher.call_count("img://a"), 1);
        assert!(a.is_success() && b.is_success());
        assert_eq!(a.location, LoadLocation::ExternalFile);
        assert_eq!(b.location, LoadLocation::ExternalFile);
        assert!(Arc::ptr_eq(a.image().unwrap(), b.image().unwrap()));
        assert_eq!(loader.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_loaded_image_is_served_from_cache() {
        let fetcher = png_fetcher(&["img://a"]);
        let loader = loader_with(&fetcher);
        let (first, mut rx) = channel();
        loader.load("img://a", None, Some(first));
        rx.recv().await.unwrap();

        let (again, slot) = capture();
        loader.load("img://a", None, Some(again));

        let outcome = slot.lock().take().unwrap();
        assert_eq!(outcome.location, LoadLocation::Cache);
        assert_eq!(fetcher.call_count("img://a"), 1);
    }

    #[tokio::test]
    async fn test_cache_hit_completes_synchronously() {
        let mut fetcher = MockImageFetcher::new();
        fetcher.expect_fetch().never();
        let loader = ImageLoader::builder("test")
            .config(test_config())
            .fetcher(fetcher)
            .build()
            .unwrap();
        loader
            .image_cache()
            .set(ImageId::new("img://b"), Arc::new(Image::new_rgb8(1, 1)), 3);
        let target = Target::new();
        let (completion, slot) = capture();

        loader.load("img://b", Some(&target), Some(completion));

        let outcome = slot.lock().take().unwrap();
        assert_eq!(outcome.location, LoadLocation::Cache);
        assert_eq!(outcome.target, Some(target.id()));
        assert_eq!(loader.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_empty_identifier_fails_synchronously() {
        let fetcher = ScriptedFetcher::new();
        let loader = loader_with(&fetcher);
        let (completion, slot) = capture();

        loader.load("  ", None, Some(completion));

        let outcome = slot.lock().take().unwrap();
        assert_eq!(outcome.location, LoadLocation::None);
        assert!(matches!(
            outcome.error(),
            Some(LoadError::InvalidIdentifier { .. })
        ));
        assert!(fetcher.calls().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_target_keeps_other_consumers() {
        let fetcher = png_fetcher(&["img://a"]).with_delay(Duration::from_millis(30));
        let loader = loader_with(&fetcher);
        let cell = Target::new();
        let other = Target::new();
        let (for_cell, mut cell_rx) = channel();
        let (for_other, mut other_rx) = channel();

        loader.load("img://a", Some(&cell), Some(for_cell));
        loader.load("img://a", Some(&other), Some(for_other));
        loader.cancel_target(&cell);

        let outcome = other_rx.recv().await.unwrap();
        assert!(outcome.is_success());
        assert_eq!(outcome.target, Some(other.id()));
        assert!(cell_rx.recv().await.is_none());
        assert_eq!(fetcher.call_count("img://a"), 1);
    }

    #[tokio::test]
    async fn test_cancelling_every_consumer_stops_the_fetch() {
        let fetcher = png_fetcher(&["img://a"]).with_delay(Duration::from_millis(50));
        let loader = loader_with(&fetcher);
        let id = ImageId::new("img://a");
        let (completion, mut rx) = channel();

        loader.load(&id, None, Some(completion));
        tokio::time::sleep(Duration::from_millis(10)).await;
        loader.cancel(&id);

        assert!(rx.recv().await.is_none());
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(fetcher.span("img://a").is_none());
        assert!(loader.image_cache().get(&id).is_none());
        assert!(!loader.is_loading(&id));
    }

    #[tokio::test]
    async fn test_cancel_pair_leaves_other_target() {
        let fetcher = png_fetcher(&["img://a"]).with_delay(Duration::from_millis(20));
        let loader = loader_with(&fetcher);
        let id = ImageId::new("img://a");
        let cell = Target::new();
        let other = Target::new();
        let (for_cell, mut cell_rx) = channel();
        let (for_other, mut other_rx) = channel();

        loader.load(&id, Some(&cell), Some(for_cell));
        loader.load(&id, Some(&other), Some(for_other));
        loader.cancel_for(&id, &cell);

        assert!(other_rx.recv().await.unwrap().is_success());
        assert!(cell_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_cancel_without_pending_request_is_noop() {
        let loader = loader_with(&ScriptedFetcher::new());
        loader.cancel(&ImageId::new("img://nothing"));
        loader.cancel_target(&Target::new());
        loader.cancel_for(&ImageId::new("img://nothing"), &Target::new());
        assert_eq!(loader.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_slow_load_times_out() {
        let fetcher = png_fetcher(&["img://slow"]).with_delay(Duration::from_millis(300));
        let loader = loader_with(&fetcher);
        loader.set_loading_timeout(Some(Duration::from_millis(30)));
        let (completion, mut rx) = channel();

        loader.load("img://slow", None, Some(completion));

        let outcome = rx.recv().await.unwrap();
        assert!(outcome.error().is_some_and(LoadError::is_timeout));
        assert_eq!(outcome.location, LoadLocation::None);
        assert!(loader.image_cache().get(&ImageId::new("img://slow")).is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_single_slot_loads_do_not_overlap() {
        let fetcher = png_fetcher(&["img://a", "img://b"]).with_delay(Duration::from_millis(40));
        let loader = loader_with(&fetcher);
        loader.set_maximum_concurrent_loads(1);
        let (first, mut rx1) = channel();
        let (second, mut rx2) = channel();

        loader.load("img://a", None, Some(first));
        loader.load("img://b", None, Some(second));
        rx1.recv().await.unwrap();
        rx2.recv().await.unwrap();

        let a = fetcher.span("img://a").unwrap();
        let b = fetcher.span("img://b").unwrap();
        assert!(b.started >= a.finished);
        assert_eq!(fetcher.peak_in_flight(), 1);
    }

    #[tokio::test]
    async fn test_transport_and_decode_failures_are_reported() {
        let fetcher = ScriptedFetcher::new()
            .with_error("img://down", LoadError::transport("connection refused"))
            .with_bytes("img://junk", &b"not an image"[..]);
        let loader = loader_with(&fetcher);
        let (down, mut down_rx) = channel();
        let (junk, mut junk_rx) = channel();
        let (missing, mut missing_rx) = channel();

        loader.load("img://down", None, Some(down));
        loader.load("img://junk", None, Some(junk));
        loader.load("img://missing", None, Some(missing));

        assert!(matches!(
            down_rx.recv().await.unwrap().error(),
            Some(LoadError::Transport { .. })
        ));
        assert!(matches!(
            junk_rx.recv().await.unwrap().error(),
            Some(LoadError::Decode { .. })
        ));
        assert!(matches!(
            missing_rx.recv().await.unwrap().error(),
            Some(LoadError::NotFound { .. })
        ));
        assert!(loader.image_cache().is_empty());
    }

    #[tokio::test]
    async fn test_local_file_skips_fetcher() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("local.png");
        std::fs::write(&path, encode_png(3, 3)).unwrap();
        let fetcher = ScriptedFetcher::new();
        let loader = loader_with(&fetcher);
        let (found, mut found_rx) = channel();
        let (absent, mut absent_rx) = channel();

        loader.load(ImageId::from_path(&path), None, Some(found));
        loader.load(ImageId::from_path(temp.path().join("absent.png")), None, Some(absent));

        let outcome = found_rx.recv().await.unwrap();
        assert_eq!(outcome.location, LoadLocation::LocalFile);
        assert_eq!(outcome.image().unwrap().width(), 3);
        assert!(matches!(
            absent_rx.recv().await.unwrap().error(),
            Some(LoadError::NotFound { .. })
        ));
        assert!(fetcher.calls().is_empty());
    }

    #[tokio::test]
    async fn test_load_to_file_persists_bytes() {
        let temp = TempDir::new().unwrap();
        let destination = temp.path().join("out").join("a.png");
        let png = encode_png(2, 2);
        let fetcher = ScriptedFetcher::new().with_bytes("img://a", png.clone());
        let loader = loader_with(&fetcher);
        let (completion, mut rx) = channel();

        loader.load_to_file("img://a", &destination, None, Some(completion));

        let outcome = rx.recv().await.unwrap();
        assert_eq!(outcome.location, LoadLocation::ExternalFile);
        assert_eq!(std::fs::read(&destination).unwrap(), png);
    }

    #[tokio::test]
    async fn test_existing_destination_is_used_as_disk_tier() {
        let temp = TempDir::new().unwrap();
        let destination = temp.path().join("a.png");
        std::fs::write(&destination, encode_png(2, 2)).unwrap();
        let fetcher = ScriptedFetcher::new();
        let loader = loader_with(&fetcher);
        let (completion, mut rx) = channel();

        loader.load_to_file("img://a", &destination, None, Some(completion));

        assert_eq!(rx.recv().await.unwrap().location, LoadLocation::LocalFile);
        assert!(fetcher.calls().is_empty());
    }

    #[tokio::test]
    async fn test_persistence_failure_keeps_success() {
        let mut disk = MockDiskStorePort::new();
        disk.expect_exists().returning(|_| false);
        disk.expect_write()
            .times(1)
            .returning(|_, _| Err(LoadError::io("disk full")));
        let loader = ImageLoader::builder("test")
            .config(test_config())
            .fetcher(png_fetcher(&["img://a"]))
            .disk(disk)
            .build()
            .unwrap();
        let (completion, mut rx) = channel();

        loader.load_to_file("img://a", "/nowhere/a.png", None, Some(completion));

        let outcome = rx.recv().await.unwrap();
        assert!(outcome.is_success());
        assert_eq!(outcome.location, LoadLocation::ExternalFile);
    }

    struct PanickingFetcher;

    #[async_trait::async_trait]
    impl ImageFetcher for PanickingFetcher {
        async fn fetch(&self, _id: &ImageId) -> Result<Bytes, LoadError> {
            panic!("transport exploded")
        }
    }

    #[tokio::test]
    async fn test_panicking_fetcher_becomes_failure() {
        let loader = ImageLoader::builder("test")
            .config(test_config())
            .fetcher(PanickingFetcher)
            .build()
            .unwrap();
        let (completion, mut rx) = channel();

        loader.load("img://boom", None, Some(completion));

        let outcome = rx.recv().await.unwrap();
        assert!(matches!(outcome.error(), Some(LoadError::Worker { .. })));
        assert_eq!(loader.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_panicking_completion_spares_other_consumers() {
        let fetcher = png_fetcher(&["img://a"]).with_delay(Duration::from_millis(20));
        let loader = loader_with(&fetcher);
        let (survivor, mut rx) = channel();

        loader.load(
            "img://a",
            None,
            Some(Completion::new(|_| panic!("consumer exploded"))),
        );
        loader.load("img://a", None, Some(survivor));

        let outcome = rx.recv().await.unwrap();
        assert!(outcome.is_success());
        assert_eq!(loader.pending_count(), 0);
        assert!(loader.image_cache().get(&ImageId::new("img://a")).is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_loads_from_many_threads_share_one_fetch() {
        const THREADS: usize = 8;
        let fetcher = png_fetcher(&["img://a"]).with_delay(Duration::from_millis(30));
        let loader = Arc::new(loader_with(&fetcher));
        let barrier = Arc::new(std::sync::Barrier::new(THREADS));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let callers: Vec<_> = (0..THREADS)
            .map(|_| {
                let loader = loader.clone();
                let barrier = barrier.clone();
                let tx = tx.clone();
                tokio::task::spawn_blocking(move || {
                    barrier.wait();
                    loader.load("img://a", None, Some(Completion::channel(tx)));
                })
            })
            .collect();
        for caller in callers {
            caller.await.unwrap();
        }
        drop(tx);

        let mut outcomes = Vec::new();
        while let Some(outcome) = rx.recv().await {
            outcomes.push(outcome);
        }

        assert_eq!(outcomes.len(), THREADS);
        assert!(outcomes.iter().all(LoadOutcome::is_success));
        assert_eq!(fetcher.call_count("img://a"), 1);
        assert_eq!(loader.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_unreadable_destination_falls_back_to_fetch() {
        let mut disk = MockDiskStorePort::new();
        disk.expect_exists().returning(|_| true);
        disk.expect_read()
            .returning(|_| Err(LoadError::io("permission denied")));
        disk.expect_write().returning(|_, _| Ok(()));
        let fetcher = png_fetcher(&["img://a"]);
        let loader = ImageLoader::builder("test")
            .config(test_config())
            .fetcher(fetcher.clone())
            .disk(disk)
            .build()
            .unwrap();
        let (completion, mut rx) = channel();

        loader.load_to_file("img://a", "/stale/a.png", None, Some(completion));

        let outcome = rx.recv().await.unwrap();
        assert!(outcome.is_success());
        assert_eq!(outcome.location, LoadLocation::ExternalFile);
        assert_eq!(fetcher.call_count("img://a"), 1);
    }

    #[tokio::test]
    async fn test_unreadable_own_file_is_reported() {
        let mut disk = MockDiskStorePort::new();
        disk.expect_exists().returning(|_| true);
        disk.expect_read()
            .returning(|_| Err(LoadError::io("permission denied")));
        let fetcher = ScriptedFetcher::new();
        let loader = ImageLoader::builder("test")
            .config(test_config())
            .fetcher(fetcher.clone())
            .disk(disk)
            .build()
            .unwrap();
        let (completion, mut rx) = channel();

        loader.load("/locked/a.png", None, Some(completion));

        let outcome = rx.recv().await.unwrap();
        assert!(matches!(outcome.error(), Some(LoadError::Io { .. })));
        assert!(fetcher.calls().is_empty());
    }

    #[tokio::test]
    async fn test_local_file_with_space_in_name() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("with space.png");
        std::fs::write(&path, encode_png(2, 2)).unwrap();
        let loader = loader_with(&ScriptedFetcher::new());
        let (completion, mut rx) = channel();

        let id = ImageId::from_path(&path);
        assert!(id.as_str().contains("%20"));
        loader.load(id, None, Some(completion));

        assert_eq!(rx.recv().await.unwrap().location, LoadLocation::LocalFile);
    }

    #[tokio::test]
    async fn test_same_target_registers_once() {
        let fetcher = png_fetcher(&["img://a"]).with_delay(Duration::from_millis(20));
        let loader = loader_with(&fetcher);
        let cell = Target::new();
        let (stale, mut stale_rx) = channel();
        let (fresh, mut fresh_rx) = channel();

        loader.load("img://a", Some(&cell), Some(stale));
        loader.load("img://a", Some(&cell), Some(fresh));

        assert!(fresh_rx.recv().await.unwrap().is_success());
        assert!(stale_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_disposed_target_gets_no_completion() {
        let fetcher = png_fetcher(&["img://a"]).with_delay(Duration::from_millis(20));
        let loader = loader_with(&fetcher);
        let recycled = Target::new();
        let (gone, mut gone_rx) = channel();
        let (kept, mut kept_rx) = channel();

        loader.load("img://a", Some(&recycled), Some(gone));
        loader.load("img://a", None, Some(kept));
        drop(recycled);

        assert!(kept_rx.recv().await.unwrap().is_success());
        assert!(gone_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_preload_fills_cache() {
        let fetcher = png_fetcher(&["img://a"]);
        let loader = loader_with(&fetcher);
        let id = ImageId::new("img://a");

        loader.preload(&id);
        while loader.is_loading(&id) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert!(loader.image_cache().get(&id).is_some());
    }

    #[tokio::test]
    async fn test_relative_loads_resolve_against_directories() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("thumb.png"), encode_png(2, 2)).unwrap();
        let loader = ImageLoader::builder("test")
            .config(ImageLoaderConfig {
                cache_dir: Some(temp.path().to_path_buf()),
                ..test_config()
            })
            .fetcher(ScriptedFetcher::new())
            .build()
            .unwrap();
        let (cached, mut cached_rx) = channel();
        let (document, slot) = capture();

        loader.load_from_cache_path("thumb.png", None, Some(cached));
        loader.load_from_document_path("thumb.png", None, Some(document));

        assert_eq!(cached_rx.recv().await.unwrap().location, LoadLocation::LocalFile);
        let outcome = slot.lock().take().unwrap();
        assert!(matches!(
            outcome.error(),
            Some(LoadError::InvalidIdentifier { .. })
        ));
    }

    #[tokio::test]
    async fn test_shutdown_cancels_pending_and_clears_cache() {
        let fetcher = png_fetcher(&["img://slow"]).with_delay(Duration::from_millis(200));
        let loader = loader_with(&fetcher);
        loader
            .image_cache()
            .set(ImageId::new("img://cached"), Arc::new(Image::new_rgb8(1, 1)), 3);
        let (completion, mut rx) = channel();

        loader.load("img://slow", None, Some(completion));
        loader.shutdown();

        assert_eq!(loader.pending_count(), 0);
        assert!(loader.image_cache().is_empty());
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_setters_round_trip() {
        let loader = loader_with(&ScriptedFetcher::new());
        assert_eq!(loader.name(), "test");
        assert_eq!(loader.maximum_concurrent_loads(), 4);

        loader.set_maximum_concurrent_loads(0);
        loader.set_loading_timeout(Some(Duration::from_secs(5)));
        assert_eq!(loader.maximum_concurrent_loads(), 0);
        assert_eq!(loader.loading_timeout(), Some(Duration::from_secs(5)));

        let replacement: Arc<dyn ImageCachePort> = Arc::new(MemoryImageCache::new(1, 0));
        loader.set_image_cache(replacement.clone());
        assert!(Arc::ptr_eq(&loader.image_cache(), &replacement));
    }

    #[test]
    fn test_build_requires_runtime() {
        let result = ImageLoader::builder("no-runtime")
            .fetcher(ScriptedFetcher::new())
            .build();
        assert!(matches!(assert_err!(result), SetupError::NoRuntime));
    }

    #[test]
    fn test_build_with_explicit_runtime() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let loader = assert_ok!(
            ImageLoader::builder("explicit")
                .runtime(runtime.handle().clone())
                .fetcher(ScriptedFetcher::new())
                .build()
        );
        assert_eq!(loader.name(), "explicit");
    }
}
