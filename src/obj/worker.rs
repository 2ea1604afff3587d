//! Deferred-work pool.
//!
//! Asynchronous teardown and request callbacks run here so that they never execute on the
//! stack of the call that triggered them.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};

use crossbeam_channel::{unbounded, Sender};
use parking_lot::{Condvar, Mutex};

type Job = Box<dyn FnOnce() + Send + 'static>;

struct Idle {
    queued: AtomicUsize,
    lock: Mutex<()>,
    cond: Condvar,
}

/// A fixed-size pool of threads draining one FIFO job queue.
pub struct WorkerPool {
    tx: Option<Sender<Job>>,
    threads: Vec<JoinHandle<()>>,
    thread_ids: Vec<ThreadId>,
    idle: Arc<Idle>,
}

impl WorkerPool {
    /// Spawn `threads` workers (at least one).
    pub fn new(name: &str, threads: usize) -> WorkerPool {
        let (tx, rx) = unbounded::<Job>();
        let idle = Arc::new(Idle {
            queued: AtomicUsize::new(0),
            lock: Mutex::new(()),
            cond: Condvar::new(),
        });
        let threads: Vec<_> = (0..threads.max(1))
            .map(|i| {
                let rx = rx.clone();
                let idle = idle.clone();
                thread::Builder::new()
                    .name(format!("{name}-{i}"))
                    .spawn(move || {
                        for job in rx.iter() {
                            job();
                            if idle.queued.fetch_sub(1, Ordering::AcqRel) == 1 {
                                let _guard = idle.lock.lock();
                                idle.cond.notify_all();
                            }
                        }
                    })
                    .expect("failed to spawn worker thread")
            })
            .collect();
        let thread_ids = threads.iter().map(|t| t.thread().id()).collect();
        WorkerPool {
            tx: Some(tx),
            threads,
            thread_ids,
            idle,
        }
    }

    /// Queue `job` for execution on a worker thread.
    pub fn queue(&self, job: impl FnOnce() + Send + 'static) {
        let Some(tx) = self.tx.as_ref() else {
            tracing::error!("worker pool already shut down; dropping job");
            return;
        };
        self.idle.queued.fetch_add(1, Ordering::AcqRel);
        if tx.send(Box::new(job)).is_err() {
            self.idle.queued.fetch_sub(1, Ordering::AcqRel);
            tracing::error!("worker pool queue closed; dropping job");
        }
    }

    /// Returns `true` when called from one of this pool's threads.
    pub fn on_worker_thread(&self) -> bool {
        self.thread_ids.contains(&thread::current().id())
    }

    /// Block until every queued job, including jobs queued by running jobs, has finished.
    ///
    /// Must not be called from a worker thread.
    pub fn wait_idle(&self) {
        debug_assert!(!self.on_worker_thread());
        let mut guard = self.idle.lock.lock();
        while self.idle.queued.load(Ordering::Acquire) != 0 {
            self.idle.cond.wait(&mut guard);
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        drop(self.tx.take());
        let me = thread::current().id();
        for t in self.threads.drain(..) {
            // the last owner may be a job running on this very pool
            if t.thread().id() != me {
                let _ = t.join();
            }
        }
    }
}
