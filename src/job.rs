//! A [LoadJob] is the one in-flight computation for a key, shared by every caller waiting on that key.
//!
//! Jobs start `Running` and make exactly one transition to a terminal state.  Whichever of success, failure or
//! cancellation gets there first wins, and later signals are ignored.  Each registered callback hears about that
//! transition once, except callbacks removed through [LoadStatus::cancel], which hear nothing.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::*;

/// Where a delivered resource came from.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DataSource {
    MemoryCache,
    /// Evicted from the memory cache, but still held by another caller.
    ActiveResource,
    DiskCache,
    /// Produced by running the pipeline from scratch.
    Remote,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Stage {
    Fetch,
    Decode,
    Transform,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum LoadError {
    #[error("{stage:?} failed: {cause}")]
    Pipeline {
        stage: Stage,
        cause: Arc<dyn std::error::Error + Send + Sync>,
    },
    #[error("pipeline panicked: {0}")]
    Panicked(String),
    #[error("the load was cancelled")]
    Cancelled,
}

impl LoadError {
    pub(crate) fn pipeline(stage: Stage, cause: PipelineError) -> LoadError {
        LoadError::Pipeline {
            stage,
            cause: Arc::from(cause),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum JobState {
    Running,
    ResourceReady,
    Failed,
    Cancelled,
}

struct JobInner<R: Resource> {
    state: JobState,
    callbacks: Vec<(u64, Box<dyn ResourceCallback<R>>)>,
    next_callback_id: u64,
}

pub struct LoadJob<R: Resource> {
    key: CacheKey,
    id: u64,
    options: LoadOptions,
    counter: Arc<ReferenceCounter<R>>,
    listener: Weak<dyn JobListener<R>>,
    inner: Mutex<JobInner<R>>,
    /// Set on cancellation so that pipeline work can stop early.
    interrupted: AtomicBool,
}

impl<R: Resource> LoadJob<R> {
    /// Create a running job with its first callback.
    pub(crate) fn new(
        key: CacheKey,
        id: u64,
        options: LoadOptions,
        counter: Arc<ReferenceCounter<R>>,
        listener: Weak<dyn JobListener<R>>,
        callback: Box<dyn ResourceCallback<R>>,
    ) -> (Arc<LoadJob<R>>, LoadStatus<R>) {
        let job = Arc::new(LoadJob {
            key,
            id,
            options,
            counter,
            listener,
            inner: Mutex::new(JobInner {
                state: JobState::Running,
                callbacks: vec![(0, callback)],
                next_callback_id: 1,
            }),
            interrupted: AtomicBool::new(false),
        });
        let status = LoadStatus {
            job: job.clone(),
            callback_id: 0,
        };
        (job, status)
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn options(&self) -> LoadOptions {
        self.options
    }

    pub fn state(&self) -> JobState {
        self.inner.lock().state
    }

    pub fn callback_count(&self) -> usize {
        self.inner.lock().callbacks.len()
    }

    /// Whether background work for this job should give up.
    pub fn is_cancelled(&self) -> bool {
        self.interrupted.load(Ordering::Acquire)
    }

    /// Attach another waiter.  Once the job is terminal this does nothing and hands the callback back.
    pub fn add_callback(
        self: &Arc<Self>,
        callback: Box<dyn ResourceCallback<R>>,
    ) -> Result<LoadStatus<R>, Box<dyn ResourceCallback<R>>> {
        let mut inner = self.inner.lock();
        if inner.state != JobState::Running {
            return Err(callback);
        }
        let callback_id = inner.next_callback_id;
        inner.next_callback_id += 1;
        inner.callbacks.push((callback_id, callback));
        Ok(LoadStatus {
            job: self.clone(),
            callback_id,
        })
    }

    /// Detach a waiter without telling it anything.  Removing the last one cancels the job.
    fn remove_callback(&self, callback_id: u64) {
        let mut inner = self.inner.lock();
        if inner.state != JobState::Running {
            return;
        }
        inner.callbacks.retain(|(id, _)| *id != callback_id);
        if !inner.callbacks.is_empty() {
            return;
        }

        inner.state = JobState::Cancelled;
        self.interrupted.store(true, Ordering::Release);
        drop(inner);
        log::debug!("Last waiter left, cancelling job for {}", self.key);
        if let Some(listener) = self.listener.upgrade() {
            listener.on_job_cancelled(self);
        }
    }

    /// Cancel the job outright.  Waiters still attached are told with [LoadError::Cancelled].
    pub fn cancel(&self) {
        let callbacks = {
            let mut inner = self.inner.lock();
            if inner.state != JobState::Running {
                return;
            }
            inner.state = JobState::Cancelled;
            std::mem::take(&mut inner.callbacks)
        };
        self.interrupted.store(true, Ordering::Release);

        log::debug!("Cancelled job for {}", self.key);
        if let Some(listener) = self.listener.upgrade() {
            listener.on_job_cancelled(self);
        }
        for (_, cb) in callbacks {
            cb.on_load_failed(LoadError::Cancelled);
        }
    }

    /// Deliver a resource to every waiter.
    ///
    /// The job acquires the resource for itself first, so that the memory cache evicting it immediately can't recycle
    /// it before the waiters have theirs.  If the job is no longer running, nobody can ever see the resource and it is
    /// recycled on the spot.
    pub fn on_resource_ready(&self, resource: R, source: DataSource) {
        let callbacks = {
            let mut inner = self.inner.lock();
            if inner.state != JobState::Running {
                drop(inner);
                log::debug!("Discarding resource for finished job {}", self.key);
                resource.recycle();
                return;
            }
            inner.state = JobState::ResourceReady;
            std::mem::take(&mut inner.callbacks)
        };

        let resource = Arc::new(resource);
        self.counter.acquire(&resource);
        if let Some(listener) = self.listener.upgrade() {
            listener.on_job_complete(self, Some(&resource));
        }
        for (_, cb) in callbacks {
            cb.on_resource_ready(self.counter.handle(resource.clone()), source);
        }
        self.counter.release(&resource);
    }

    /// Deliver a failure to every waiter.
    pub fn on_exception(&self, error: LoadError) {
        let callbacks = {
            let mut inner = self.inner.lock();
            if inner.state != JobState::Running {
                return;
            }
            inner.state = JobState::Failed;
            std::mem::take(&mut inner.callbacks)
        };

        log::debug!("Load of {} failed: {}", self.key, error);
        if let Some(listener) = self.listener.upgrade() {
            listener.on_job_complete(self, None);
        }
        for (_, cb) in callbacks {
            cb.on_load_failed(error.clone());
        }
    }
}

impl<R: Resource> std::fmt::Debug for LoadJob<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadJob")
            .field("key", &self.key)
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

/// One caller's interest in a running job.
pub struct LoadStatus<R: Resource> {
    job: Arc<LoadJob<R>>,
    callback_id: u64,
}

impl<R: Resource> LoadStatus<R> {
    pub fn key(&self) -> &CacheKey {
        self.job.key()
    }

    /// Stop waiting.  This caller's callback won't be called.  Safe to call at any time, any number of times.
    pub fn cancel(&self) {
        self.job.remove_callback(self.callback_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use crate::test_support::{channel_callback, TestResource};

    /// Stands in for the engine: counts signals, and holds one acquisition per completed resource like the memory
    /// cache would.
    #[derive(Default)]
    struct CountingListener {
        completes: AtomicUsize,
        cancels: AtomicUsize,
        cached: Mutex<Vec<Arc<TestResource>>>,
        counter: Arc<ReferenceCounter<TestResource>>,
    }

    impl JobListener<TestResource> for CountingListener {
        fn on_job_complete(&self, _job: &LoadJob<TestResource>, resource: Option<&Arc<TestResource>>) {
            self.completes.fetch_add(1, Ordering::SeqCst);
            if let Some(r) = resource {
                self.counter.acquire(r);
                self.cached.lock().push(r.clone());
            }
        }

        fn on_job_cancelled(&self, _job: &LoadJob<TestResource>) {
            self.cancels.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn build_job(
        listener: &Arc<CountingListener>,
    ) -> (
        Arc<LoadJob<TestResource>>,
        LoadStatus<TestResource>,
        std::sync::mpsc::Receiver<crate::test_support::Outcome>,
    ) {
        let (cb, rx) = channel_callback();
        let weak = Arc::downgrade(listener);
        let weak: Weak<dyn JobListener<TestResource>> = weak;
        let (job, status) = LoadJob::new(
            "k".into(),
            1,
            LoadOptions::default(),
            listener.counter.clone(),
            weak,
            cb,
        );
        (job, status, rx)
    }

    #[test]
    fn test_delivers_to_every_callback() {
        let listener = Arc::new(CountingListener::default());
        let (job, _status, rx1) = build_job(&listener);
        let (cb2, rx2) = channel_callback();
        let _status2 = job.add_callback(cb2).ok().unwrap();

        job.on_resource_ready(TestResource::unshared("k", 1), DataSource::Remote);
        let (first, source) = rx1.try_recv().unwrap().unwrap();
        let (second, _) = rx2.try_recv().unwrap().unwrap();
        assert_eq!(source, DataSource::Remote);
        assert!(Arc::ptr_eq(first.resource(), second.resource()));

        // One acquisition per callback plus the one the cache holds; the job's own is gone.
        assert_eq!(listener.counter.count(first.resource()), 3);
        assert_eq!(job.state(), JobState::ResourceReady);
        assert_eq!(listener.completes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_late_callback_is_handed_back() {
        let listener = Arc::new(CountingListener::default());
        let (job, _status, _rx) = build_job(&listener);
        job.on_exception(LoadError::Cancelled);
        let (cb, _rx2) = channel_callback();
        assert!(job.add_callback(cb).is_err());
    }

    #[test]
    fn test_failure_reaches_everyone() {
        let listener = Arc::new(CountingListener::default());
        let (job, _status, rx1) = build_job(&listener);
        let (cb2, rx2) = channel_callback();
        let _status2 = job.add_callback(cb2).ok().unwrap();

        job.on_exception(LoadError::pipeline(Stage::Decode, "bad bytes".into()));
        for rx in &[rx1, rx2] {
            match rx.try_recv().unwrap() {
                Err(LoadError::Pipeline { stage, .. }) => assert_eq!(stage, Stage::Decode),
                _ => panic!("Expected a decode failure"),
            }
        }

        // Terminal: a late resource is recycled and nobody hears about it.
        let late = TestResource::unshared("late", 1);
        job.on_resource_ready(late, DataSource::Remote);
        assert_eq!(listener.completes.load(Ordering::SeqCst), 1);
        assert_eq!(listener.counter.tracked(), 0);
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let listener = Arc::new(CountingListener::default());
        let (job, _status, rx) = build_job(&listener);
        job.cancel();
        job.cancel();
        assert_eq!(listener.cancels.load(Ordering::SeqCst), 1);
        assert!(job.is_cancelled());
        assert!(matches!(rx.try_recv().unwrap(), Err(LoadError::Cancelled)));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_cancel_after_completion_is_a_no_op() {
        let listener = Arc::new(CountingListener::default());
        let (job, status, rx) = build_job(&listener);
        job.on_resource_ready(TestResource::unshared("k", 1), DataSource::Remote);
        let (handle, _) = rx.try_recv().unwrap().unwrap();

        job.cancel();
        status.cancel();
        assert_eq!(listener.cancels.load(Ordering::SeqCst), 0);
        assert_eq!(job.state(), JobState::ResourceReady);
        assert_eq!(handle.recycle_count(), 0);
        assert_eq!(listener.counter.count(handle.resource()), 2);
    }

    #[test]
    fn test_removing_last_callback_cancels() {
        let listener = Arc::new(CountingListener::default());
        let (job, status1, rx1) = build_job(&listener);
        let (cb2, rx2) = channel_callback();
        let status2 = job.add_callback(cb2).ok().unwrap();

        status1.cancel();
        assert_eq!(job.state(), JobState::Running);
        assert_eq!(job.callback_count(), 1);

        status2.cancel();
        status2.cancel();
        assert_eq!(job.state(), JobState::Cancelled);
        assert_eq!(listener.cancels.load(Ordering::SeqCst), 1);

        // Removed callbacks are never told anything.
        assert!(rx1.recv_timeout(Duration::from_millis(10)).is_err());
        assert!(rx2.recv_timeout(Duration::from_millis(10)).is_err());
    }
}
