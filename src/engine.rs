//! The [LoadEngine] answers a request for a key from the cheapest place that has it.
//!
//! In order, a load looks at:
//!
//! - The memory cache, delivering synchronously on a hit.
//! - Resources evicted from memory which some caller still holds.  These are found through weak references and
//!   re-acquired only while their count is above zero.
//! - A job already running for the key, which the new caller joins instead of starting a second one.
//!
//! Otherwise a new job runs the pipeline on a worker thread: it reads the disk store, or fetches, decodes, transforms
//! and writes back.  Outcomes are applied to jobs on a single coordinator thread, so a job's transitions never race
//! each other.  Disk failures are logged and treated as misses; only pipeline failures reach callers.
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{mpsc, Arc, Weak};

use parking_lot::Mutex;

use crate::executor::{Task, TaskSender, WorkerPool};
use crate::*;

type KeyMap<V> = std::collections::HashMap<CacheKey, V, ahash::RandomState>;

/// Dead entries in the active resource map are swept once it grows past this, or past twice its size after the last
/// sweep.
const ACTIVE_SWEEP_THRESHOLD: usize = 64;

/// Per-load control over which cache levels are used.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct LoadOptions {
    /// Look in and store to the memory cache and active resources.
    pub memory_cacheable: bool,
    /// Look in and store to the disk store.
    pub disk_cacheable: bool,
}

impl Default for LoadOptions {
    fn default() -> Self {
        LoadOptions {
            memory_cacheable: true,
            disk_cacheable: true,
        }
    }
}

struct EngineState<R: Resource> {
    cache: MemoryCache<R>,
    jobs: KeyMap<Arc<LoadJob<R>>>,
    active: KeyMap<Weak<R>>,
    next_active_sweep: usize,
    next_job_id: u64,
    shut_down: bool,
}

impl<R: Resource> EngineState<R> {
    /// Forget a job, unless a newer one for the same key has replaced it.
    fn remove_job(&mut self, job: &LoadJob<R>) {
        if self.jobs.get(job.key()).map_or(false, |j| j.id() == job.id()) {
            self.jobs.remove(job.key());
        }
    }

    fn remember_active(&mut self, key: &CacheKey, resource: &Arc<R>) {
        self.active.insert(key.clone(), Arc::downgrade(resource));
        if self.active.len() >= self.next_active_sweep {
            self.active.retain(|_, r| r.strong_count() > 0);
            self.next_active_sweep = (self.active.len() * 2).max(ACTIVE_SWEEP_THRESHOLD);
        }
    }
}

/// Releases the memory cache's acquisition of every resource it lets go of.
struct ReleaseOnEvict<R> {
    counter: Arc<ReferenceCounter<R>>,
}

impl<R: Resource> EvictionListener<R> for ReleaseOnEvict<R> {
    fn on_entry_evicted(&mut self, _key: &CacheKey, resource: Arc<R>) {
        self.counter.release(&resource);
    }
}

struct EngineInner<R: Resource> {
    state: Mutex<EngineState<R>>,
    counter: Arc<ReferenceCounter<R>>,
    disk: Option<DiskLruStore>,
    workers: WorkerPool,
    coordinator: WorkerPool,
}

impl<R: Resource> JobListener<R> for EngineInner<R> {
    fn on_job_complete(&self, job: &LoadJob<R>, resource: Option<&Arc<R>>) {
        let mut state = self.state.lock();
        state.remove_job(job);
        let resource = match resource {
            Some(r) => r,
            None => return,
        };
        if job.options().memory_cacheable {
            self.counter.acquire(resource);
            state.cache.put(job.key().clone(), resource.clone());
            state.remember_active(job.key(), resource);
        }
    }

    fn on_job_cancelled(&self, job: &LoadJob<R>) {
        self.state.lock().remove_job(job);
    }
}

/// Loads resources through caller-supplied pipelines, with a memory cache, an optional disk store, and
/// deduplication of concurrent loads.
///
/// Dropping the engine shuts it down.
pub struct LoadEngine<R: Resource> {
    inner: Arc<EngineInner<R>>,
}

impl<R: Resource> LoadEngine<R> {
    /// Start an engine.  Fails only if threads can't be spawned.
    ///
    /// # Panics
    ///
    /// If the configured memory size multiplier is negative or not finite.
    pub fn new(config: &CacheConfig, disk: Option<DiskLruStore>) -> std::io::Result<LoadEngine<R>> {
        let counter = Arc::new(ReferenceCounter::new());
        let mut cache = MemoryCache::new(config.max_memory_size);
        cache.set_eviction_listener(Box::new(ReleaseOnEvict {
            counter: counter.clone(),
        }));
        cache.set_size_multiplier(config.memory_size_multiplier);

        let workers = WorkerPool::new("resource-cache-worker", config.worker_threads)?;
        let coordinator = WorkerPool::single("resource-cache-coordinator")?;
        log::info!(
            "Started load engine with {} workers, {} bytes of memory cache, disk store {}",
            config.worker_threads,
            cache.max_size(),
            if disk.is_some() { "enabled" } else { "disabled" }
        );

        Ok(LoadEngine {
            inner: Arc::new(EngineInner {
                state: Mutex::new(EngineState {
                    cache,
                    jobs: Default::default(),
                    active: Default::default(),
                    next_active_sweep: ACTIVE_SWEEP_THRESHOLD,
                    next_job_id: 0,
                    shut_down: false,
                }),
                counter,
                disk,
                workers,
                coordinator,
            }),
        })
    }

    /// Request a resource.
    ///
    /// If the resource is in memory the callback runs before this returns and `None` is returned.  Otherwise the
    /// callback runs later on the coordinator thread, and the returned status can withdraw it.  After shutdown, the
    /// callback is told the load was cancelled.
    pub fn load(
        &self,
        key: CacheKey,
        pipeline: Arc<dyn Pipeline<R>>,
        options: LoadOptions,
        callback: Box<dyn ResourceCallback<R>>,
    ) -> Option<LoadStatus<R>> {
        let mut state = self.inner.state.lock();
        if state.shut_down {
            drop(state);
            callback.on_load_failed(LoadError::Cancelled);
            return None;
        }

        if options.memory_cacheable {
            if let Some(resource) = state.cache.get(&key) {
                let handle = self.inner.counter.handle(resource);
                drop(state);
                log::debug!("Memory cache hit for {}", key);
                callback.on_resource_ready(handle, DataSource::MemoryCache);
                return None;
            }

            let still_held = state
                .active
                .get(&key)
                .and_then(Weak::upgrade)
                .and_then(|r| self.inner.counter.try_handle(r));
            if let Some(handle) = still_held {
                drop(state);
                log::debug!("Reusing active resource for {}", key);
                callback.on_resource_ready(handle, DataSource::ActiveResource);
                return None;
            }
        }

        let callback = match state.jobs.get(&key) {
            Some(job) => match job.add_callback(callback) {
                Ok(status) => {
                    log::debug!("Joined running job for {}", key);
                    return Some(status);
                }
                // Finished, but its completion hasn't cleared it from the table yet.
                Err(callback) => callback,
            },
            None => callback,
        };

        let id = state.next_job_id;
        state.next_job_id += 1;
        let listener = Arc::downgrade(&self.inner);
        let listener: Weak<dyn JobListener<R>> = listener;
        let (job, status) = LoadJob::new(
            key.clone(),
            id,
            options,
            self.inner.counter.clone(),
            listener,
            callback,
        );
        state.jobs.insert(key, job.clone());
        drop(state);

        self.start(job, pipeline);
        Some(status)
    }

    /// Load and wait for the outcome.  Must not be called from a callback, which would wait on itself.
    pub fn load_sync(
        &self,
        key: CacheKey,
        pipeline: Arc<dyn Pipeline<R>>,
        options: LoadOptions,
    ) -> Result<(Acquired<R>, DataSource), LoadError> {
        let (tx, rx) = mpsc::channel::<Result<(Acquired<R>, DataSource), LoadError>>();
        let _status = self.load(key, pipeline, options, Box::new(tx));
        rx.recv().unwrap_or(Err(LoadError::Cancelled))
    }

    fn start(&self, job: Arc<LoadJob<R>>, pipeline: Arc<dyn Pipeline<R>>) {
        log::debug!("Starting job {} for {}", job.id(), job.key());
        let disk = self.inner.disk.clone();
        let coordinator = self.inner.coordinator.sender();
        let task_job = job.clone();
        let task: Task = Box::new(move || run_job(task_job, pipeline, disk, coordinator));
        if self.inner.workers.execute(task).is_err() {
            job.cancel();
        }
    }

    /// Evict everything from memory.  Resources still held elsewhere stay alive and reachable as active resources.
    pub fn clear_memory(&self) {
        self.inner.state.lock().cache.clear_memory();
    }

    /// Scale the memory cache's configured size, evicting if it shrank.
    ///
    /// # Panics
    ///
    /// If the multiplier is negative or not finite.
    pub fn set_size_multiplier(&self, multiplier: f32) {
        self.inner.state.lock().cache.set_size_multiplier(multiplier);
    }

    /// Evict from memory until at most `size` bytes remain.
    pub fn trim_memory(&self, size: u64) {
        self.inner.state.lock().cache.trim_to_size(size);
    }

    pub fn memory_size(&self) -> u64 {
        self.inner.state.lock().cache.current_size()
    }

    pub fn max_memory_size(&self) -> u64 {
        self.inner.state.lock().cache.max_size()
    }

    pub fn is_memory_cached(&self, key: &CacheKey) -> bool {
        self.inner.state.lock().cache.contains(key)
    }

    /// Jobs currently running.
    pub fn active_jobs(&self) -> usize {
        self.inner.state.lock().jobs.len()
    }

    pub fn disk_store(&self) -> Option<&DiskLruStore> {
        self.inner.disk.as_ref()
    }

    pub fn reference_counter(&self) -> &Arc<ReferenceCounter<R>> {
        &self.inner.counter
    }

    /// Cancel every running job, wait for the threads, and empty the memory cache.  Later loads fail as cancelled.
    ///
    /// Waits for pipeline stages already in progress to return.
    pub fn shutdown(&self) {
        let jobs: Vec<_> = {
            let mut state = self.inner.state.lock();
            if state.shut_down {
                return;
            }
            state.shut_down = true;
            state.jobs.drain().map(|(_, j)| j).collect()
        };

        log::info!("Shutting down load engine, cancelling {} jobs", jobs.len());
        for job in jobs {
            job.cancel();
        }
        self.inner.workers.shutdown();
        self.inner.coordinator.shutdown();
        self.inner.state.lock().cache.clear_memory();

        if let Some(disk) = self.inner.disk.as_ref().filter(|d| !d.is_closed()) {
            if let Err(e) = disk.flush() {
                log::warn!("Failed to flush the disk store: {}", e);
            }
        }
    }
}

impl<R: Resource> Drop for LoadEngine<R> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// The body of a worker task: run the pipeline, then hand the outcome to the coordinator.
fn run_job<R: Resource>(
    job: Arc<LoadJob<R>>,
    pipeline: Arc<dyn Pipeline<R>>,
    disk: Option<DiskLruStore>,
    coordinator: Option<TaskSender>,
) {
    if job.is_cancelled() {
        return;
    }

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        run_pipeline(&job, &*pipeline, disk.as_ref())
    }))
    .unwrap_or_else(|payload| Err(LoadError::Panicked(panic_message(&*payload))));

    let deliver: Task = Box::new(move || match outcome {
        Ok((resource, source)) => job.on_resource_ready(resource, source),
        Err(e) => job.on_exception(e),
    });
    let rejected = match coordinator {
        Some(c) => c.execute(deliver).err(),
        None => Some(deliver),
    };
    // Only after shutdown, when the job is already cancelled and this just recycles.
    if let Some(deliver) = rejected {
        deliver();
    }
}

fn run_pipeline<R: Resource>(
    job: &LoadJob<R>,
    pipeline: &dyn Pipeline<R>,
    disk: Option<&DiskLruStore>,
) -> Result<(R, DataSource), LoadError> {
    let key = job.key();
    let disk = disk.filter(|_| job.options().disk_cacheable);
    let disk_key = key.disk_key();

    if let Some(store) = disk {
        if let Some(resource) = read_from_disk(store, &disk_key, key, pipeline) {
            return Ok((resource, DataSource::DiskCache));
        }
    }

    let check_cancelled = || {
        if job.is_cancelled() {
            Err(LoadError::Cancelled)
        } else {
            Ok(())
        }
    };

    check_cancelled()?;
    let data = pipeline
        .fetch(key)
        .map_err(|e| LoadError::pipeline(Stage::Fetch, e))?;
    check_cancelled()?;
    let decoded = pipeline
        .decode(&data)
        .map_err(|e| LoadError::pipeline(Stage::Decode, e))?;
    check_cancelled()?;
    let resource = pipeline
        .transform(decoded)
        .map_err(|e| LoadError::pipeline(Stage::Transform, e))?;

    if let Some(store) = disk {
        write_to_disk(store, &disk_key, key, pipeline, &resource);
    }
    Ok((resource, DataSource::Remote))
}

/// A disk hit, decoded.  Entries which fail to decode are removed.
fn read_from_disk<R: Resource>(
    store: &DiskLruStore,
    disk_key: &str,
    key: &CacheKey,
    pipeline: &dyn Pipeline<R>,
) -> Option<R> {
    let snapshot = match store.get(disk_key) {
        Ok(Some(s)) => s,
        Ok(None) => return None,
        Err(e) => {
            log::warn!("Disk store read for {} failed: {}", key, e);
            return None;
        }
    };
    let data = match snapshot.read(0) {
        Ok(d) => d,
        Err(e) => {
            log::warn!("Reading the disk entry for {} failed: {}", key, e);
            return None;
        }
    };

    match pipeline.decode(&data) {
        Ok(r) => {
            log::debug!("Disk cache hit for {}", key);
            Some(r)
        }
        Err(e) => {
            log::warn!("Disk entry for {} doesn't decode ({}), removing it", key, e);
            if let Err(e) = store.remove(disk_key) {
                log::warn!("Removing the disk entry for {} failed: {}", key, e);
            }
            None
        }
    }
}

fn write_to_disk<R: Resource>(
    store: &DiskLruStore,
    disk_key: &str,
    key: &CacheKey,
    pipeline: &dyn Pipeline<R>,
    resource: &R,
) {
    let result = (|| -> Result<(), PipelineError> {
        let mut editor = match store.edit(disk_key)? {
            Some(e) => e,
            // Someone else is writing this entry.
            None => return Ok(()),
        };
        let mut file = editor.writer(0)?;
        if !pipeline.encode(resource, &mut file)? {
            drop(file);
            editor.abort()?;
            return Ok(());
        }
        drop(file);
        // Entries hold one value per slot; the engine only uses the first.
        if !editor.is_update() {
            for i in 1..store.value_count() {
                editor.set(i, &[])?;
            }
        }
        editor.commit()?;
        Ok(())
    })();

    if let Err(e) = result {
        log::warn!("Writing {} to the disk store failed: {}", key, e);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
