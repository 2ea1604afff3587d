use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use super::worker::WorkerPool;
use super::{AlObj, ObjState, ObjType};
use crate::config::ObjConfig;

/// Identifier assigned to every node by its manager.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjId(pub u64);

impl fmt::Display for ObjId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A point-in-time view of one live node, for the diagnostic surface.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjSnapshot {
    /// Node identifier.
    pub id: ObjId,
    /// Type tag.
    pub obj_type: ObjType,
    /// Lifecycle state.
    pub state: ObjState,
    /// Reference count.
    pub refs: i32,
    /// Parent, if attached.
    pub parent: Option<ObjId>,
    /// Attached children.
    pub children: Vec<ObjId>,
    /// Descendants accounted to this node by teardown.
    pub descendants: u32,
}

struct ManagerShared {
    config: ObjConfig,
    next_id: AtomicU64,
    live: AtomicUsize,
    registry: Mutex<BTreeMap<ObjId, AlObj>>,
    pool: WorkerPool,
}

/// Owner of the live-object registry and the deferred-work pool.
///
/// Every node constructed through a manager is tracked until it is finalized, so that leaks can
/// be detected, stuck teardown can be diagnosed, and [`ObjManager::shutdown`] can drain whatever
/// is left.
#[derive(Clone)]
pub struct ObjManager {
    shared: Arc<ManagerShared>,
}

impl fmt::Debug for ObjManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjManager")
            .field("live", &self.live_count())
            .finish()
    }
}

impl ObjManager {
    /// Create a manager and start its worker pool.
    pub fn new(config: ObjConfig) -> ObjManager {
        let pool = WorkerPool::new("al-worker", config.worker_threads);
        ObjManager {
            shared: Arc::new(ManagerShared {
                config,
                next_id: AtomicU64::new(1),
                live: AtomicUsize::new(0),
                registry: Mutex::new(BTreeMap::new()),
                pool,
            }),
        }
    }

    /// The configuration this manager was created with.
    pub fn config(&self) -> &ObjConfig {
        &self.shared.config
    }

    /// Construct a new, uninitialized node with a reference count of one.
    pub fn construct(&self, obj_type: ObjType) -> AlObj {
        let id = ObjId(self.shared.next_id.fetch_add(1, Ordering::Relaxed));
        let obj = AlObj::new(id, obj_type, self.clone());
        self.register(&obj);
        tracing::trace!(obj_id = %id, ?obj_type, "constructed");
        obj
    }

    pub(crate) fn register(&self, obj: &AlObj) {
        if self.shared.registry.lock().insert(obj.id(), obj.clone()).is_none() {
            self.shared.live.fetch_add(1, Ordering::AcqRel);
        }
    }

    pub(crate) fn unregister(&self, obj: &AlObj) {
        if self.shared.registry.lock().remove(&obj.id()).is_some() {
            self.shared.live.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Number of nodes constructed and not yet finalized.
    pub fn live_count(&self) -> usize {
        self.shared.live.load(Ordering::Acquire)
    }

    /// Handles to every live node, in construction order.
    pub fn objects(&self) -> Vec<AlObj> {
        self.shared.registry.lock().values().cloned().collect()
    }

    /// Snapshot every live node.
    pub fn snapshot(&self) -> Vec<ObjSnapshot> {
        self.objects().iter().map(AlObj::snapshot).collect()
    }

    /// Log every live node at `warn` level.
    pub fn dump(&self) {
        let objects = self.snapshot();
        tracing::warn!(live = objects.len(), "live object dump");
        for o in objects {
            tracing::warn!(
                obj_id = %o.id,
                obj_type = ?o.obj_type,
                state = ?o.state,
                refs = o.refs,
                parent = ?o.parent,
                children = o.children.len(),
                "live object"
            );
        }
    }

    /// Run `job` on the worker pool.
    pub fn queue(&self, job: impl FnOnce() + Send + 'static) {
        self.shared.pool.queue(job);
    }

    /// Block until the worker pool has no queued or running jobs.
    pub fn wait_idle(&self) {
        self.shared.pool.wait_idle();
    }

    /// Destroy every remaining top-level node and wait for deferred teardown to finish.
    ///
    /// Returns the number of nodes this call started destroying.
    pub fn shutdown(&self) -> usize {
        let roots: Vec<_> = self
            .objects()
            .into_iter()
            .filter(|o| o.parent().is_none() && o.state() == ObjState::Initialized)
            .collect();
        let mut destroyed = 0;
        for root in roots {
            if root.destroy(None) != super::DestroyStatus::InProgress {
                destroyed += 1;
            }
        }
        self.wait_idle();
        if self.live_count() != 0 {
            tracing::warn!(live = self.live_count(), "objects still live after shutdown");
            self.dump();
        }
        destroyed
    }
}
