//! Reference-counted lifecycle objects.
//!
//! Every resource in the access layer (service instances, request contexts, SRP sessions and
//! channels, ...) is an [`AlObj`]: a node in a parent/child graph with an explicit reference
//! count. A node may be referenced transiently from several asynchronous contexts (completion
//! callbacks, client requests, parent teardown) and is only finalized once the last reference is
//! gone. Finalization happens exactly once, and a parent is never cleaned up before every one of
//! its children has been.
//!
//! # Lifecycle
//!
//! ```text
//! construct ──► Uninitialized ──init──► Initialized ──destroy──► Destroying ──refs=0──► Destroyed
//!                                            ▲                                              │
//!                                            └─────────────── reset (pooled reuse) ─────────┘
//! ```
//!
//!  - [`ObjManager::construct`] creates the node with a reference count of one (the *base*
//!    reference) and registers it for diagnostics.
//!  - [`AlObj::init`] wires the teardown hooks and takes a keep-alive reference that the creator
//!    releases with [`AlObj::deref`] once creation has finished, successfully or not.
//!  - [`AlObj::attach`] links a child and takes a reference on the parent on the child's behalf;
//!    that reference is released when the child is finalized.
//!  - [`AlObj::destroy`] starts teardown and releases the base reference.
//!
//! Children hold only a weak link to their parent; the parent's child list holds the strong one.

mod manager;
mod worker;

pub use manager::{ObjId, ObjManager, ObjSnapshot};
pub use worker::WorkerPool;

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::event::Event;
use crate::{Error, Result};

/// The kind of resource a node represents. Used for diagnostics only.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjType {
    /// A top-level access-layer instance.
    Al,
    /// A channel adapter.
    Ca,
    /// A per-port SA service instance.
    SaService,
    /// A context owning outstanding SA requests.
    RequestContext,
    /// The SRP host adapter owning all target sessions.
    Hba,
    /// An SRP session bound to one target.
    Session,
    /// The flow-controlled channel of a session.
    Connection,
    /// An entry recycled through a pool.
    Pooled,
    /// Caller-defined resource.
    User(u16),
}

/// Lifecycle state of a node.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObjState {
    /// Constructed, hooks not yet wired.
    Uninitialized,
    /// Live; children may be attached.
    Initialized,
    /// Teardown has begun; waiting for the reference count to drain.
    Destroying,
    /// Finalized; cleanup and free hooks have run.
    Destroyed,
}

/// Where final destruction runs once the reference count reaches zero.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DestroyMode {
    /// Cleanup is queued to the manager's worker pool; `destroy` returns immediately.
    Async,
    /// `destroy` blocks until the count drains (bounded) and runs cleanup on the caller's thread.
    Sync,
}

/// Outcome of [`AlObj::destroy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestroyStatus {
    /// Synchronous teardown finished; the node is finalized.
    Completed,
    /// Asynchronous teardown started; finalization happens once the last reference is released.
    Pending,
    /// Teardown was already under way; only the caller's own reference was released.
    InProgress,
    /// Synchronous teardown timed out and the node was finalized by force.
    Forced,
}

/// Hook invoked synchronously when teardown begins.
pub type DestroyingFn = Box<dyn Fn(&AlObj) + Send + Sync>;
/// Hook invoked once the reference count has drained, cleanup first and then free.
pub type FinalFn = Box<dyn Fn(&AlObj) + Send + Sync>;
/// One-shot notification delivered after a node has been finalized.
pub type DestroyCallback = Box<dyn FnOnce() + Send>;

/// The teardown hooks of a node.
///
/// Hooks receive the node itself so that they never need to capture a handle to it.
#[derive(Default)]
pub struct ObjHooks {
    on_destroying: Option<DestroyingFn>,
    on_cleanup: Option<FinalFn>,
    on_free: Option<FinalFn>,
}

impl ObjHooks {
    /// No hooks.
    pub fn new() -> Self {
        Self::default()
    }

    /// Called when teardown begins, before children are destroyed. Used to cancel outstanding
    /// asynchronous operations.
    pub fn destroying(mut self, f: impl Fn(&AlObj) + Send + Sync + 'static) -> Self {
        self.on_destroying = Some(Box::new(f));
        self
    }

    /// Called once the reference count has reached zero, to release transport resources.
    pub fn cleanup(mut self, f: impl Fn(&AlObj) + Send + Sync + 'static) -> Self {
        self.on_cleanup = Some(Box::new(f));
        self
    }

    /// Called last, to release the memory owned on behalf of the node.
    pub fn free(mut self, f: impl Fn(&AlObj) + Send + Sync + 'static) -> Self {
        self.on_free = Some(Box::new(f));
        self
    }
}

struct ObjCore {
    state: ObjState,
    mode: DestroyMode,
    parent: Option<Weak<ObjInner>>,
    children: Vec<AlObj>,
    timeout: Duration,
    descendants: u32,
    hooks: Arc<ObjHooks>,
    callbacks: Vec<DestroyCallback>,
}

pub(crate) struct ObjInner {
    id: ObjId,
    obj_type: ObjType,
    refs: AtomicI32,
    forced: AtomicBool,
    manager: ObjManager,
    core: Mutex<ObjCore>,
    zero: Event,
    destroyed: Event,
}

/// A handle to a lifecycle node.
///
/// Cloning the handle does not touch the node's reference count; use [`AlObj::add_ref`] and
/// [`AlObj::deref`] for that.
#[derive(Clone)]
pub struct AlObj {
    inner: Arc<ObjInner>,
}

impl fmt::Debug for AlObj {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlObj")
            .field("id", &self.inner.id)
            .field("type", &self.inner.obj_type)
            .field("state", &self.state())
            .field("refs", &self.ref_count())
            .finish()
    }
}

impl PartialEq for AlObj {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for AlObj {}

impl AlObj {
    pub(crate) fn new(id: ObjId, obj_type: ObjType, manager: ObjManager) -> AlObj {
        let timeout = manager.config().base_timeout;
        AlObj {
            inner: Arc::new(ObjInner {
                id,
                obj_type,
                refs: AtomicI32::new(1),
                forced: AtomicBool::new(false),
                manager,
                core: Mutex::new(ObjCore {
                    state: ObjState::Uninitialized,
                    mode: DestroyMode::Async,
                    parent: None,
                    children: Vec::new(),
                    timeout,
                    descendants: 0,
                    hooks: Arc::new(ObjHooks::default()),
                    callbacks: Vec::new(),
                }),
                zero: Event::new(),
                destroyed: Event::new(),
            }),
        }
    }

    /// The manager-assigned identifier of this node.
    pub fn id(&self) -> ObjId {
        self.inner.id
    }

    /// The type tag given at construction.
    pub fn obj_type(&self) -> ObjType {
        self.inner.obj_type
    }

    /// The current lifecycle state.
    pub fn state(&self) -> ObjState {
        self.inner.core.lock().state
    }

    /// The current reference count.
    pub fn ref_count(&self) -> i32 {
        self.inner.refs.load(Ordering::Acquire)
    }

    /// The manager this node is registered with.
    pub fn manager(&self) -> &ObjManager {
        &self.inner.manager
    }

    /// The parent this node is attached to, if any.
    pub fn parent(&self) -> Option<AlObj> {
        let core = self.inner.core.lock();
        core.parent
            .as_ref()
            .and_then(Weak::upgrade)
            .map(|inner| AlObj { inner })
    }

    /// The children currently attached to this node.
    pub fn children(&self) -> Vec<AlObj> {
        self.inner.core.lock().children.clone()
    }

    /// Number of descendants whose teardown has been accounted to this node.
    pub fn descendants(&self) -> u32 {
        self.inner.core.lock().descendants
    }

    /// Override the base synchronous-destroy timeout of this node.
    pub fn set_timeout(&self, timeout: Duration) {
        self.inner.core.lock().timeout = timeout;
    }

    /// Wire the teardown hooks and move the node to `Initialized`.
    ///
    /// Takes one keep-alive reference for the duration of creation; the creator must release it
    /// with [`AlObj::deref`] once the resource is fully built (or after destroying it on a
    /// failed build).
    ///
    /// # Errors
    ///
    ///  - `InvalidState`: the node was already initialized.
    pub fn init(&self, mode: DestroyMode, hooks: ObjHooks) -> Result<()> {
        {
            let mut core = self.inner.core.lock();
            if core.state != ObjState::Uninitialized {
                return Err(Error::InvalidState);
            }
            core.mode = mode;
            core.hooks = Arc::new(hooks);
            core.state = ObjState::Initialized;
        }
        self.add_ref();
        Ok(())
    }

    /// Attach `child` to this node.
    ///
    /// On success the child appears in this node's list exactly once and this node's reference
    /// count has grown by one. On failure nothing was changed, and the caller owns (and must
    /// destroy) the child.
    ///
    /// # Errors
    ///
    ///  - `InvalidState`: this node is not `Initialized`, or the child already has a parent.
    pub fn attach(&self, child: &AlObj) -> Result<()> {
        if self == child {
            return Err(Error::InvalidParameter("an object cannot be its own child"));
        }
        let mut core = self.inner.core.lock();
        if core.state != ObjState::Initialized {
            return Err(Error::InvalidState);
        }
        {
            let mut child_core = child.inner.core.lock();
            if child_core.parent.is_some() {
                return Err(Error::InvalidState);
            }
            child_core.parent = Some(Arc::downgrade(&self.inner));
        }
        core.children.push(child.clone());
        self.add_ref();
        Ok(())
    }

    /// Take a reference.
    pub fn add_ref(&self) {
        let prev = self.inner.refs.fetch_add(1, Ordering::AcqRel);
        debug_assert!(prev >= 0, "reference taken on a finalized object");
    }

    /// Take a reference unless the count has already drained to zero.
    ///
    /// Used by event paths that may race with finalization.
    pub fn try_ref(&self) -> bool {
        let mut cur = self.inner.refs.load(Ordering::Acquire);
        loop {
            if cur <= 0 {
                return false;
            }
            match self.inner.refs.compare_exchange_weak(
                cur,
                cur + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => cur = actual,
            }
        }
    }

    /// Release a reference, dispatching final destruction when the count reaches zero.
    ///
    /// # Panics
    ///
    /// Panics if the count is already zero; that is a lifetime bug in the caller.
    pub fn deref(&self) {
        let mut cur = self.inner.refs.load(Ordering::Acquire);
        loop {
            if cur == 0 && self.inner.forced.load(Ordering::Acquire) {
                tracing::warn!(
                    obj_id = %self.inner.id,
                    obj_type = ?self.inner.obj_type,
                    "late reference release on a force-finalized object"
                );
                return;
            }
            assert!(
                cur > 0,
                "reference count underflow on {:?} {}",
                self.inner.obj_type,
                self.inner.id
            );
            match self.inner.refs.compare_exchange_weak(
                cur,
                cur - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => cur = actual,
            }
        }
        if cur == 1 {
            self.on_zero();
        }
    }

    fn on_zero(&self) {
        let (state, mode) = {
            let core = self.inner.core.lock();
            (core.state, core.mode)
        };
        match (state, mode) {
            (ObjState::Destroying, DestroyMode::Sync) => self.inner.zero.signal(),
            (ObjState::Destroying, DestroyMode::Async) => {
                let obj = self.clone();
                self.inner.manager.queue(move || obj.finalize());
            }
            (state, _) => {
                // released without an explicit destroy
                tracing::warn!(
                    obj_id = %self.inner.id,
                    obj_type = ?self.inner.obj_type,
                    ?state,
                    "reference count drained without destroy"
                );
                self.inner.core.lock().state = ObjState::Destroying;
                self.finalize();
            }
        }
    }

    /// Begin teardown of this node and everything attached below it.
    ///
    /// The first call marks the node `Destroying`, runs the `destroying` hook, detaches from the
    /// parent, destroys every attached child, accounts the subtree to the parent's timeout, and
    /// releases the base reference. Later calls return [`DestroyStatus::InProgress`] and change
    /// nothing else. `callback` runs after the node has been finalized.
    ///
    /// For [`DestroyMode::Sync`] nodes this blocks until the reference count drains. The wait is
    /// bounded by `base_timeout + per_descendant_timeout * descendants`; if it expires, the live
    /// objects are dumped, the node is finalized by force and [`DestroyStatus::Forced`] is
    /// returned.
    pub fn destroy(&self, callback: Option<DestroyCallback>) -> DestroyStatus {
        match self.begin_destroy(callback) {
            None => DestroyStatus::InProgress,
            Some(DestroyMode::Async) => DestroyStatus::Pending,
            Some(DestroyMode::Sync) => self.wait_for_zero(),
        }
    }

    /// Everything `destroy` does short of waiting. Returns `None` if teardown had already begun.
    fn begin_destroy(&self, callback: Option<DestroyCallback>) -> Option<DestroyMode> {
        // our own reference keeps the node alive across the hooks below
        if !self.try_ref() {
            return None;
        }

        let (mode, hooks, parent) = {
            let mut core = self.inner.core.lock();
            if core.state != ObjState::Initialized {
                drop(core);
                self.deref();
                return None;
            }
            core.state = ObjState::Destroying;
            if let Some(cb) = callback {
                core.callbacks.push(cb);
            }
            (
                core.mode,
                core.hooks.clone(),
                core.parent.as_ref().and_then(Weak::upgrade),
            )
        };
        tracing::debug!(obj_id = %self.inner.id, obj_type = ?self.inner.obj_type, "destroying");

        if let Some(on_destroying) = &hooks.on_destroying {
            on_destroying(self);
        }

        if let Some(parent) = &parent {
            let mut pcore = parent.core.lock();
            pcore.children.retain(|c| c != self);
        }

        let children = std::mem::take(&mut self.inner.core.lock().children);
        for child in children.iter().rev() {
            // no reference of ours may be held while a sync child drains
            if child.begin_destroy(None) == Some(DestroyMode::Sync) {
                child.wait_for_zero();
            }
        }

        if let Some(parent) = &parent {
            let (timeout, descendants) = {
                let core = self.inner.core.lock();
                (core.timeout, core.descendants)
            };
            let mut pcore = parent.core.lock();
            pcore.descendants += 1 + descendants;
            pcore.timeout = pcore.timeout.max(timeout);
        }

        // base reference, then our own
        self.deref();
        self.deref();
        Some(mode)
    }

    fn wait_for_zero(&self) -> DestroyStatus {
        let config = self.inner.manager.config();
        let (base, descendants) = {
            let core = self.inner.core.lock();
            (core.timeout, core.descendants)
        };
        let total = (base + config.per_descendant_timeout * descendants).min(config.max_timeout);
        let slices = config.wait_slices.max(1);
        let slice = total / slices;

        for i in 0..slices {
            if i + 1 == slices {
                tracing::warn!(
                    obj_id = %self.inner.id,
                    obj_type = ?self.inner.obj_type,
                    refs = self.ref_count(),
                    "object slow to destroy; dumping live objects"
                );
                self.inner.manager.dump();
            }
            if self.inner.zero.wait_timeout(slice) {
                self.finalize();
                return DestroyStatus::Completed;
            }
        }

        tracing::error!(
            obj_id = %self.inner.id,
            obj_type = ?self.inner.obj_type,
            refs = self.ref_count(),
            timeout_ms = total.as_millis() as u64,
            "object failed to destroy in time; forcing finalization"
        );
        self.inner.forced.store(true, Ordering::Release);
        self.inner.refs.store(0, Ordering::Release);
        self.finalize();
        DestroyStatus::Forced
    }

    fn finalize(&self) {
        let (hooks, parent, callbacks) = {
            let mut core = self.inner.core.lock();
            debug_assert_eq!(core.state, ObjState::Destroying);
            core.state = ObjState::Destroyed;
            (
                core.hooks.clone(),
                core.parent.take(),
                std::mem::take(&mut core.callbacks),
            )
        };

        if let Some(cleanup) = &hooks.on_cleanup {
            cleanup(self);
        }
        if let Some(free) = &hooks.on_free {
            free(self);
        }
        self.inner.manager.unregister(self);
        tracing::trace!(obj_id = %self.inner.id, obj_type = ?self.inner.obj_type, "destroyed");
        self.inner.destroyed.signal();

        for cb in callbacks {
            cb();
        }

        // the reference taken on the parent by `attach`
        if let Some(parent) = parent.and_then(|p| p.upgrade()) {
            AlObj { inner: parent }.deref();
        }
    }

    /// Wait until the node has been finalized.
    ///
    /// Returns `true` if finalization happened within `timeout`.
    pub fn wait_destroyed(&self, timeout: Duration) -> bool {
        self.inner.destroyed.wait_timeout(timeout)
    }

    /// Return a finalized node to the `Initialized` state for pooled reuse.
    ///
    /// The node keeps its hooks and destroy mode and gets a fresh base reference.
    ///
    /// # Errors
    ///
    ///  - `InvalidState`: the node has not been finalized, or something still references it.
    pub fn reset(&self) -> Result<()> {
        {
            let mut core = self.inner.core.lock();
            if core.state != ObjState::Destroyed || self.ref_count() != 0 {
                return Err(Error::InvalidState);
            }
            core.state = ObjState::Initialized;
            core.children.clear();
            core.descendants = 0;
            core.timeout = self.inner.manager.config().base_timeout;
            self.inner.refs.store(1, Ordering::Release);
            self.inner.forced.store(false, Ordering::Release);
            self.inner.zero.reset();
            self.inner.destroyed.reset();
        }
        self.inner.manager.register(self);
        Ok(())
    }

    pub(crate) fn snapshot(&self) -> ObjSnapshot {
        let core = self.inner.core.lock();
        ObjSnapshot {
            id: self.inner.id,
            obj_type: self.inner.obj_type,
            state: core.state,
            refs: self.inner.refs.load(Ordering::Acquire),
            parent: core
                .parent
                .as_ref()
                .and_then(Weak::upgrade)
                .map(|p| p.id),
            children: core.children.iter().map(|c| c.inner.id).collect(),
            descendants: core.descendants,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::ObjConfig;
    use std::sync::atomic::AtomicU32;
    use std::thread;

    fn manager() -> ObjManager {
        ObjManager::new(ObjConfig {
            base_timeout: Duration::from_millis(400),
            per_descendant_timeout: Duration::from_millis(10),
            max_timeout: Duration::from_secs(5),
            wait_slices: 4,
            worker_threads: 2,
        })
    }

    fn live(mgr: &ObjManager, ty: ObjType, mode: DestroyMode, hooks: ObjHooks) -> AlObj {
        let obj = mgr.construct(ty);
        obj.init(mode, hooks).unwrap();
        obj.deref();
        obj
    }

    #[test]
    fn construct_and_init() {
        let mgr = manager();
        let obj = mgr.construct(ObjType::User(1));
        assert_eq!(obj.state(), ObjState::Uninitialized);
        assert_eq!(obj.ref_count(), 1);
        assert_eq!(mgr.live_count(), 1);

        obj.init(DestroyMode::Sync, ObjHooks::new()).unwrap();
        assert_eq!(obj.ref_count(), 2);
        assert_eq!(obj.state(), ObjState::Initialized);
        assert_eq!(obj.init(DestroyMode::Sync, ObjHooks::new()), Err(Error::InvalidState));

        obj.deref();
        assert_eq!(obj.destroy(None), DestroyStatus::Completed);
        assert_eq!(obj.state(), ObjState::Destroyed);
        assert_eq!(mgr.live_count(), 0);
    }

    #[test]
    fn attach_requires_initialized_parent() {
        let mgr = manager();
        let parent = mgr.construct(ObjType::Ca);
        let child = live(&mgr, ObjType::User(2), DestroyMode::Sync, ObjHooks::new());

        assert_eq!(parent.attach(&child), Err(Error::InvalidState));
        assert!(parent.children().is_empty());
        assert_eq!(parent.ref_count(), 1);
        assert!(child.parent().is_none());

        parent.init(DestroyMode::Sync, ObjHooks::new()).unwrap();
        parent.deref();
        parent.attach(&child).unwrap();
        assert_eq!(parent.children(), vec![child.clone()]);
        assert_eq!(parent.ref_count(), 2);
        assert_eq!(child.parent(), Some(parent.clone()));

        // a second parent is refused without side effects
        let other = live(&mgr, ObjType::Ca, DestroyMode::Sync, ObjHooks::new());
        assert_eq!(other.attach(&child), Err(Error::InvalidState));
        assert_eq!(other.ref_count(), 1);

        assert_eq!(parent.destroy(None), DestroyStatus::Completed);
        assert_eq!(child.state(), ObjState::Destroyed);
        assert_eq!(other.destroy(None), DestroyStatus::Completed);
        assert_eq!(mgr.live_count(), 0);
    }

    #[test]
    fn destroy_is_idempotent() {
        let mgr = manager();
        let cleanups = Arc::new(AtomicU32::new(0));
        let c = cleanups.clone();
        let obj = live(
            &mgr,
            ObjType::User(3),
            DestroyMode::Async,
            ObjHooks::new().cleanup(move |_| {
                c.fetch_add(1, Ordering::SeqCst);
            }),
        );
        // an in-flight operation holds a reference
        obj.add_ref();
        assert_eq!(obj.destroy(None), DestroyStatus::Pending);
        assert_eq!(obj.destroy(None), DestroyStatus::InProgress);
        assert_eq!(obj.state(), ObjState::Destroying);
        assert_eq!(obj.ref_count(), 1);
        obj.deref();
        assert!(obj.wait_destroyed(Duration::from_secs(5)));
        mgr.wait_idle();
        assert_eq!(cleanups.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn concurrent_release_finalizes_once() {
        let mgr = manager();
        let cleanups = Arc::new(AtomicU32::new(0));
        let c = cleanups.clone();
        let obj = live(
            &mgr,
            ObjType::User(4),
            DestroyMode::Async,
            ObjHooks::new().cleanup(move |_| {
                c.fetch_add(1, Ordering::SeqCst);
            }),
        );
        for _ in 0..64 {
            obj.add_ref();
        }
        obj.destroy(None);
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let obj = obj.clone();
                thread::spawn(move || {
                    for _ in 0..8 {
                        assert!(obj.ref_count() >= 0);
                        obj.deref();
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert!(obj.wait_destroyed(Duration::from_secs(5)));
        mgr.wait_idle();
        assert_eq!(obj.ref_count(), 0);
        assert_eq!(cleanups.load(Ordering::SeqCst), 1);
    }

    #[test]
    #[should_panic(expected = "underflow")]
    fn underflow_panics() {
        let mgr = manager();
        let obj = mgr.construct(ObjType::User(5));
        obj.inner.core.lock().state = ObjState::Destroyed;
        obj.inner.refs.store(0, Ordering::SeqCst);
        obj.deref();
    }

    #[test]
    fn children_destroying_before_parent_cleanup() {
        let mgr = manager();
        let log = Arc::new(Mutex::new(Vec::new()));
        let hooks = |name: &'static str| {
            let l1 = log.clone();
            let l2 = log.clone();
            ObjHooks::new()
                .destroying(move |_| l1.lock().push(format!("{name}:destroying")))
                .cleanup(move |_| l2.lock().push(format!("{name}:cleanup")))
        };
        let parent = live(&mgr, ObjType::Hba, DestroyMode::Sync, hooks("p"));
        let kids: Vec<_> = (0..3)
            .map(|i| {
                let name: &'static str = ["c0", "c1", "c2"][i];
                let c = live(&mgr, ObjType::Session, DestroyMode::Async, hooks(name));
                parent.attach(&c).unwrap();
                c
            })
            .collect();

        assert_eq!(parent.destroy(None), DestroyStatus::Completed);
        let log = log.lock();
        let parent_cleanup = log.iter().position(|e| e == "p:cleanup").unwrap();
        for name in ["c0", "c1", "c2"] {
            let d = log.iter().position(|e| *e == format!("{name}:destroying")).unwrap();
            let c = log.iter().position(|e| *e == format!("{name}:cleanup")).unwrap();
            assert!(d < parent_cleanup);
            assert!(c < parent_cleanup);
        }
        assert_eq!(parent.descendants(), 3);
        for k in kids {
            assert_eq!(k.state(), ObjState::Destroyed);
        }
    }

    #[test]
    fn stuck_reference_forces_finalization() {
        let mgr = ObjManager::new(ObjConfig {
            base_timeout: Duration::from_millis(40),
            per_descendant_timeout: Duration::from_millis(1),
            max_timeout: Duration::from_secs(1),
            wait_slices: 2,
            worker_threads: 1,
        });
        let freed = Arc::new(AtomicU32::new(0));
        let f = freed.clone();
        let obj = live(
            &mgr,
            ObjType::User(6),
            DestroyMode::Sync,
            ObjHooks::new().free(move |_| {
                f.fetch_add(1, Ordering::SeqCst);
            }),
        );
        // a callback that never returns its reference
        obj.add_ref();
        assert_eq!(obj.destroy(None), DestroyStatus::Forced);
        assert_eq!(obj.state(), ObjState::Destroyed);
        assert_eq!(freed.load(Ordering::SeqCst), 1);
        // the late release is tolerated
        obj.deref();
        assert_eq!(freed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn sync_children_drain_without_forcing() {
        let mgr = ObjManager::new(ObjConfig {
            base_timeout: Duration::from_millis(300),
            per_descendant_timeout: Duration::from_millis(10),
            max_timeout: Duration::from_secs(5),
            wait_slices: 2,
            worker_threads: 1,
        });
        let parent = live(&mgr, ObjType::Hba, DestroyMode::Sync, ObjHooks::new());
        let kids: Vec<_> = (0..2)
            .map(|_| {
                let c = live(&mgr, ObjType::Session, DestroyMode::Sync, ObjHooks::new());
                parent.attach(&c).unwrap();
                c
            })
            .collect();

        let start = std::time::Instant::now();
        assert_eq!(parent.destroy(None), DestroyStatus::Completed);
        assert!(start.elapsed() < Duration::from_millis(300));
        for k in &kids {
            assert_eq!(k.state(), ObjState::Destroyed);
            assert!(!k.inner.forced.load(Ordering::SeqCst));
        }
        assert!(!parent.inner.forced.load(Ordering::SeqCst));
        assert_eq!(mgr.live_count(), 0);
    }

    #[test]
    fn descendant_count_propagates_through_subtree() {
        let mgr = manager();
        let root = live(&mgr, ObjType::Al, DestroyMode::Sync, ObjHooks::new());
        let mid = live(&mgr, ObjType::Ca, DestroyMode::Async, ObjHooks::new());
        root.attach(&mid).unwrap();
        for _ in 0..4 {
            let leaf = live(&mgr, ObjType::User(7), DestroyMode::Async, ObjHooks::new());
            mid.attach(&leaf).unwrap();
        }
        assert_eq!(root.destroy(None), DestroyStatus::Completed);
        assert_eq!(root.descendants(), 5);
        assert_eq!(mgr.live_count(), 0);
    }

    #[test]
    fn reset_for_pooled_reuse() {
        let mgr = manager();
        let obj = live(&mgr, ObjType::Pooled, DestroyMode::Sync, ObjHooks::new());
        assert_eq!(obj.reset(), Err(Error::InvalidState));
        assert_eq!(obj.destroy(None), DestroyStatus::Completed);
        obj.reset().unwrap();
        assert_eq!(obj.state(), ObjState::Initialized);
        assert_eq!(obj.ref_count(), 1);
        assert_eq!(mgr.live_count(), 1);
        assert_eq!(obj.destroy(None), DestroyStatus::Completed);
        assert_eq!(mgr.live_count(), 0);
    }

    #[test]
    fn try_ref_refuses_drained_node() {
        let mgr = manager();
        let obj = live(&mgr, ObjType::User(9), DestroyMode::Sync, ObjHooks::new());
        assert!(obj.try_ref());
        obj.deref();
        assert_eq!(obj.destroy(None), DestroyStatus::Completed);
        assert!(!obj.try_ref());
        assert_eq!(obj.ref_count(), 0);
    }

    #[test]
    fn user_callback_runs_after_finalize() {
        let mgr = manager();
        let obj = live(&mgr, ObjType::User(8), DestroyMode::Async, ObjHooks::new());
        let done = Arc::new(Event::new());
        let d = done.clone();
        let o = obj.clone();
        obj.destroy(Some(Box::new(move || {
            assert_eq!(o.state(), ObjState::Destroyed);
            d.signal();
        })));
        assert!(done.wait_timeout(Duration::from_secs(5)));
    }
}
