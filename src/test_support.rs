//! Resources and pipelines shared by the unit tests.
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

use crate::*;

pub(crate) const WAIT: Duration = Duration::from_secs(10);

#[derive(Debug)]
pub(crate) struct TestResource {
    label: String,
    size: u64,
    recycled: AtomicUsize,
}

impl TestResource {
    pub(crate) fn new(label: &str, size: u64) -> Arc<TestResource> {
        Arc::new(Self::unshared(label, size))
    }

    pub(crate) fn unshared(label: &str, size: u64) -> TestResource {
        TestResource {
            label: label.to_string(),
            size,
            recycled: AtomicUsize::new(0),
        }
    }

    pub(crate) fn label(&self) -> &str {
        &self.label
    }

    pub(crate) fn recycle_count(&self) -> usize {
        self.recycled.load(Ordering::SeqCst)
    }
}

impl Resource for TestResource {
    fn byte_size(&self) -> u64 {
        self.size
    }

    fn recycle(&self) {
        self.recycled.fetch_add(1, Ordering::SeqCst);
    }
}

/// A pipeline whose fetch stage can be held open, and which counts its stage invocations.
///
/// Fetched bytes are the key text; decoding produces a resource labelled with the bytes and sized by their length.
pub(crate) struct TestPipeline {
    pub(crate) fetches: AtomicUsize,
    pub(crate) decodes: AtomicUsize,
    pub(crate) fail_fetch: bool,
    /// When set, fetch blocks until a message arrives.
    gate: Option<Mutex<mpsc::Receiver<()>>>,
}

impl TestPipeline {
    fn build(fail_fetch: bool, gate: Option<mpsc::Receiver<()>>) -> Arc<TestPipeline> {
        Arc::new(TestPipeline {
            fetches: AtomicUsize::new(0),
            decodes: AtomicUsize::new(0),
            fail_fetch,
            gate: gate.map(Mutex::new),
        })
    }

    pub(crate) fn new() -> Arc<TestPipeline> {
        Self::build(false, None)
    }

    /// Returns the pipeline and the sender which opens the gate, once per fetch.
    pub(crate) fn gated() -> (Arc<TestPipeline>, mpsc::Sender<()>) {
        let (tx, rx) = mpsc::channel();
        (Self::build(false, Some(rx)), tx)
    }

    /// Like [TestPipeline::gated], but every fetch fails once let through.
    pub(crate) fn gated_failing() -> (Arc<TestPipeline>, mpsc::Sender<()>) {
        let (tx, rx) = mpsc::channel();
        (Self::build(true, Some(rx)), tx)
    }

    pub(crate) fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub(crate) fn decode_count(&self) -> usize {
        self.decodes.load(Ordering::SeqCst)
    }
}

impl Pipeline<TestResource> for TestPipeline {
    fn fetch(&self, key: &CacheKey) -> Result<Vec<u8>, PipelineError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.lock().unwrap().recv_timeout(WAIT)?;
        }
        if self.fail_fetch {
            return Err(format!("no such model: {}", key).into());
        }
        Ok(key.as_str().as_bytes().to_vec())
    }

    fn decode(&self, data: &[u8]) -> Result<TestResource, PipelineError> {
        self.decodes.fetch_add(1, Ordering::SeqCst);
        let label = String::from_utf8(data.to_vec())?;
        Ok(TestResource::unshared(&label, data.len() as u64))
    }

    fn encode(
        &self,
        resource: &TestResource,
        out: &mut dyn std::io::Write,
    ) -> Result<bool, PipelineError> {
        out.write_all(resource.label().as_bytes())?;
        Ok(true)
    }
}

pub(crate) type Outcome = Result<(Acquired<TestResource>, DataSource), LoadError>;

/// A callback forwarding into a channel, plus the receiving end.
pub(crate) fn channel_callback() -> (Box<dyn ResourceCallback<TestResource>>, mpsc::Receiver<Outcome>) {
    let (tx, rx) = mpsc::channel::<Outcome>();
    (Box::new(tx), rx)
}
