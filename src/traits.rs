//! The seams between the cache core and everything around it.
//!
//! Decoded data comes in as a [Resource], produced by a caller-supplied [Pipeline].  Results go out through a
//! [ResourceCallback].  The [EvictionListener] and [JobListener] traits are how the memory cache and load jobs report
//! back to the [crate::LoadEngine].
use std::io::Write;
use std::sync::{mpsc, Arc};

use crate::*;

/// Errors raised by pipeline stages.  Kept opaque; the engine only passes them on.
pub type PipelineError = Box<dyn std::error::Error + Send + Sync>;

/// Decoded data which knows its size and how to give its memory back.
pub trait Resource: Send + Sync + 'static {
    /// Size in memory, used against the memory cache budget.
    fn byte_size(&self) -> u64;

    /// Called exactly once, when nothing references this resource anymore.
    ///
    /// This runs under the reference counter's lock, so it must not acquire or release resources.
    fn recycle(&self);
}

/// Fetch, decode and transform for one kind of request.
///
/// Stages run on the engine's worker threads.  Anything persisted to the disk store is the output of
/// [Pipeline::encode], so a disk hit is decoded and handed out without running [Pipeline::transform] again.
pub trait Pipeline<R>: Send + Sync + 'static {
    /// Get the raw bytes for a key, typically from the network or a file.
    fn fetch(&self, key: &CacheKey) -> Result<Vec<u8>, PipelineError>;

    fn decode(&self, data: &[u8]) -> Result<R, PipelineError>;

    fn transform(&self, resource: R) -> Result<R, PipelineError> {
        Ok(resource)
    }

    /// Write the resource in a form [Pipeline::decode] can read back.  Return `false` if this resource shouldn't be
    /// persisted.
    fn encode(&self, resource: &R, out: &mut dyn Write) -> Result<bool, PipelineError> {
        let _ = (resource, out);
        Ok(false)
    }
}

/// Receives the outcome of a load.  Exactly one of the two methods is called, once.
pub trait ResourceCallback<R: Resource>: Send + 'static {
    fn on_resource_ready(&self, resource: Acquired<R>, source: DataSource);

    fn on_load_failed(&self, error: LoadError);
}

/// Forward outcomes to a channel, mostly useful for callers which block on a load.
impl<R: Resource> ResourceCallback<R> for mpsc::Sender<Result<(Acquired<R>, DataSource), LoadError>> {
    fn on_resource_ready(&self, resource: Acquired<R>, source: DataSource) {
        let _ = self.send(Ok((resource, source)));
    }

    fn on_load_failed(&self, error: LoadError) {
        let _ = self.send(Err(error));
    }
}

/// Told synchronously about every entry leaving a [MemoryCache].
pub trait EvictionListener<R>: Send {
    fn on_entry_evicted(&mut self, key: &CacheKey, resource: Arc<R>);
}

/// Told when a [LoadJob] reaches a terminal state.
pub trait JobListener<R: Resource>: Send + Sync {
    /// The job finished.  `resource` is set on success and carries one acquisition owned by the job for the duration
    /// of this call.
    fn on_job_complete(&self, job: &LoadJob<R>, resource: Option<&Arc<R>>);

    fn on_job_cancelled(&self, job: &LoadJob<R>);
}
