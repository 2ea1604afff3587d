//! In-process stand-ins for fabric peers.
//!
//! [`SimTarget`] plays an SRP target behind the [`TransportFactory`](crate::srp::TransportFactory)
//! and [`ChannelTransport`](crate::srp::ChannelTransport) contracts, and [`SimSa`] plays the
//! subnet administrator behind [`MadTransport`](crate::mad::MadTransport). Both report every
//! asynchronous event from their own dispatcher thread, never from inside the call that caused
//! it, the way a completion queue would.
//!
//! They exist for tests and for bringing the stack up without hardware.

pub mod sa;
pub mod srp;

pub use sa::SimSa;
pub use srp::{LoginScript, ResponseMode, SimTarget, SimTransport};

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{unbounded, Sender};
use parking_lot::Mutex;

use crate::event::Event;
use crate::{Error, Result};

type Job = Box<dyn FnOnce() + Send>;

/// A single thread running queued jobs in order.
pub(crate) struct Dispatcher {
    tx: Mutex<Option<Sender<Job>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
    pub(crate) fn new(name: &str) -> Result<Arc<Dispatcher>> {
        let (tx, rx) = unbounded::<Job>();
        let thread = thread::Builder::new()
            .name(name.into())
            .spawn(move || {
                for job in rx {
                    job();
                }
            })
            .map_err(|e| {
                tracing::error!(error = %e, "failed to start dispatcher");
                Error::InsufficientResources
            })?;
        Ok(Arc::new(Dispatcher {
            tx: Mutex::new(Some(tx)),
            thread: Mutex::new(Some(thread)),
        }))
    }

    pub(crate) fn run(&self, job: impl FnOnce() + Send + 'static) {
        let tx = self.tx.lock().clone();
        match tx {
            Some(tx) if tx.send(Box::new(job)).is_ok() => {}
            _ => tracing::debug!("dispatcher stopped; job dropped"),
        }
    }

    /// Wait until everything queued so far has run.
    pub(crate) fn flush(&self, timeout: Duration) -> bool {
        let done = Arc::new(Event::new());
        let signal = done.clone();
        self.run(move || signal.signal());
        done.wait_timeout(timeout)
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.tx.lock().take();
        if let Some(handle) = self.thread.lock().take() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}
