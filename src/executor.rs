//! Named worker threads fed from a channel.
//!
//! The engine runs two pools: several workers for pipeline stages, and a single coordinator thread which delivers
//! outcomes to jobs one at a time.
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;

pub(crate) type Task = Box<dyn FnOnce() + Send + 'static>;

/// A clonable way to submit to a [WorkerPool] without borrowing it.
#[derive(Clone)]
pub(crate) struct TaskSender {
    tx: mpsc::Sender<Task>,
}

impl TaskSender {
    /// Hands the task back if the pool has shut down.
    pub(crate) fn execute(&self, task: Task) -> Result<(), Task> {
        self.tx.send(task).map_err(|e| e.0)
    }
}

pub(crate) struct WorkerPool {
    name: String,
    tx: Mutex<Option<mpsc::Sender<Task>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Spawn `threads` workers named `<prefix>-<i>`.
    pub(crate) fn new(prefix: &str, threads: usize) -> std::io::Result<WorkerPool> {
        let names = (0..threads.max(1)).map(|i| format!("{}-{}", prefix, i));
        WorkerPool::spawn(prefix, names.collect())
    }

    /// A pool of one thread, which runs tasks in submission order.
    pub(crate) fn single(name: &str) -> std::io::Result<WorkerPool> {
        WorkerPool::spawn(name, vec![name.to_string()])
    }

    fn spawn(name: &str, thread_names: Vec<String>) -> std::io::Result<WorkerPool> {
        let threads = thread_names.len();
        let (tx, rx) = mpsc::channel::<Task>();
        let rx = Arc::new(Mutex::new(rx));

        let mut workers = Vec::with_capacity(threads);
        for thread_name in thread_names {
            let rx = rx.clone();
            workers.push(
                thread::Builder::new()
                    .name(thread_name)
                    .spawn(move || worker_loop(rx))?,
            );
        }
        log::debug!("Started {} with {} threads", name, threads);

        Ok(WorkerPool {
            name: name.to_string(),
            tx: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
        })
    }

    pub(crate) fn sender(&self) -> Option<TaskSender> {
        self.tx
            .lock()
            .as_ref()
            .map(|tx| TaskSender { tx: tx.clone() })
    }

    pub(crate) fn execute(&self, task: Task) -> Result<(), Task> {
        match self.tx.lock().as_ref() {
            Some(tx) => tx.send(task).map_err(|e| e.0),
            None => Err(task),
        }
    }

    /// Stop accepting tasks, let the queue drain, and join the workers.
    ///
    /// Workers only exit once every [TaskSender] is gone too.  Called from one of the pool's own threads, this doesn't
    /// wait for that thread.
    pub(crate) fn shutdown(&self) {
        self.tx.lock().take();
        let workers = std::mem::take(&mut *self.workers.lock());
        let me = thread::current().id();
        for w in workers {
            if w.thread().id() == me {
                continue;
            }
            if w.join().is_err() {
                log::warn!("A {} thread panicked", self.name);
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(rx: Arc<Mutex<mpsc::Receiver<Task>>>) {
    loop {
        // Only hold the lock while waiting, not while running.
        let task = rx.lock().recv();
        match task {
            Ok(task) => task(),
            Err(_) => return,
        }
    }
}
