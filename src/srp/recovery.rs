//! Session supervision and reconnection.
//!
//! The [`RecoveryManager`] keeps one entry per stable [`TargetId`]. While an entry is `Ready` it
//! owns a logged-in [`Session`]; when that session's channel fails, the entry moves to
//! `Recovering`, the SCSI layer is told to hold new work, and a background worker destroys the
//! failed session (draining its requests) and logs in again over the next available path.
//! Connection attempts are bounded; when they run out the entry is left `Unbound` and the SCSI
//! layer is told the target is unreachable.
//!
//! Every installed session carries a generation number. A failure report is acted on only if it
//! names the current generation of a `Ready` entry, so duplicate reports from one failure, or late
//! ones from a session already replaced, start nothing.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::connection::{ConnectionSnapshot, ConnectionState};
use super::session::Session;
use super::transport::{ScsiSink, TaskReport, TransportFactory};
use super::{ScsiCompletion, ScsiRequest, TargetDescriptor, TargetId};
use crate::config::SrpConfig;
use crate::obj::{AlObj, DestroyMode, DestroyStatus, ObjHooks, ObjManager, ObjType};
use crate::sa::{Gid, PathQuery, PathRecord, RequestContext};
use crate::{Error, Result};

/// Supplies the paths a target can be reached over.
pub trait PathSource: Send + Sync {
    /// Paths to `target`, best first.
    ///
    /// # Errors
    ///
    ///  - `NotFound`: no path is known.
    fn paths(&self, target: &TargetDescriptor) -> Result<Vec<PathRecord>>;
}

/// A fixed path table, matched on destination GID.
#[derive(Debug, Clone, Default)]
pub struct StaticPaths {
    paths: Vec<PathRecord>,
}

impl StaticPaths {
    /// A table of `paths`.
    pub fn new(paths: Vec<PathRecord>) -> StaticPaths {
        StaticPaths { paths }
    }
}

impl PathSource for StaticPaths {
    fn paths(&self, target: &TargetDescriptor) -> Result<Vec<PathRecord>> {
        let found: Vec<_> = self
            .paths
            .iter()
            .filter(|p| p.dgid == target.dgid)
            .copied()
            .collect();
        if found.is_empty() {
            Err(Error::NotFound)
        } else {
            Ok(found)
        }
    }
}

/// Paths queried from the subnet administrator.
#[derive(Debug, Clone)]
pub struct SaPathSource {
    ctx: RequestContext,
    sgid: Gid,
    timeout: Duration,
    max_paths: u8,
}

impl SaPathSource {
    /// Query through `ctx` from the local port with GID `sgid`.
    pub fn new(ctx: RequestContext, sgid: Gid, timeout: Duration) -> SaPathSource {
        SaPathSource {
            ctx,
            sgid,
            timeout,
            max_paths: 4,
        }
    }
}

impl PathSource for SaPathSource {
    fn paths(&self, target: &TargetDescriptor) -> Result<Vec<PathRecord>> {
        let query = PathQuery {
            port_guid: target.port_guid,
            sgid: self.sgid,
            dgid: target.dgid,
            pkey: None,
            max_paths: self.max_paths,
        };
        let paths = self.ctx.query_paths_blocking(&query, self.timeout)?;
        if paths.is_empty() {
            Err(Error::NotFound)
        } else {
            Ok(paths)
        }
    }
}

/// Where a target stands with the recovery manager.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetPhase {
    /// No session; new work is refused.
    Unbound,
    /// A session is being (re)established; new work is held.
    Recovering,
    /// A logged-in session serves the target.
    Ready,
}

/// Point-in-time view of one target, for diagnostics.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetSnapshot {
    /// Target id.
    pub target: TargetId,
    /// Target identity.
    pub descriptor: TargetDescriptor,
    /// Phase.
    pub phase: TargetPhase,
    /// Number of sessions installed so far.
    pub generation: u64,
    /// Paths known from the last lookup.
    pub paths: Vec<PathRecord>,
    /// The current channel, if any.
    pub connection: Option<ConnectionSnapshot>,
}

struct Entry {
    descriptor: TargetDescriptor,
    phase: TargetPhase,
    session: Option<Session>,
    generation: u64,
    paths: Vec<PathRecord>,
    next_path: usize,
}

#[derive(Debug, Clone, Copy, Default)]
struct BusyMarks {
    channel: bool,
    recovering: bool,
}

impl BusyMarks {
    fn held(&self) -> bool {
        self.channel || self.recovering
    }
}

/// Merges the hold requests of a target's channel and of recovery into one busy signal.
///
/// Channels report to the latch instead of the SCSI sink, so a channel that is already holding
/// work, or one draining during teardown, cannot release a target that recovery still holds.
struct BusyLatch {
    sink: Arc<dyn ScsiSink>,
    marks: Mutex<BTreeMap<TargetId, BusyMarks>>,
}

impl BusyLatch {
    /// Apply `change`; forwards the new state if it differs, or unconditionally with `force`.
    ///
    /// Forwarded under the lock so transitions reach the sink in order.
    fn update(&self, target: TargetId, force: bool, change: impl FnOnce(&mut BusyMarks)) {
        let mut marks = self.marks.lock();
        let m = marks.entry(target).or_default();
        let before = m.held();
        change(m);
        let after = m.held();
        if force || before != after {
            self.sink.set_busy(target, after);
        }
    }

    fn recovering(&self, target: TargetId) {
        self.update(target, false, |m| m.recovering = true);
    }

    /// A fresh session took over; nothing holds the target any more.
    fn ready(&self, target: TargetId) {
        self.update(target, true, |m| *m = BusyMarks::default());
    }

    fn forget(&self, target: TargetId) {
        self.marks.lock().remove(&target);
    }
}

impl ScsiSink for BusyLatch {
    fn complete(&self, target: TargetId, completion: ScsiCompletion) {
        self.sink.complete(target, completion);
    }

    fn set_busy(&self, target: TargetId, busy: bool) {
        self.update(target, false, |m| m.channel = busy);
    }

    fn task_management(&self, report: TaskReport) {
        self.sink.task_management(report);
    }

    fn async_event(&self, target: TargetId, lun: u64, sense: &[u8]) {
        self.sink.async_event(target, lun, sense);
    }

    fn unreachable(&self, target: TargetId) {
        self.sink.unreachable(target);
    }
}

enum Signal {
    Connect(TargetId),
    Failed { target: TargetId, generation: u64 },
    Shutdown,
}

struct Inner {
    me: Weak<Inner>,
    obj: AlObj,
    config: SrpConfig,
    factory: Arc<dyn TransportFactory>,
    paths: Arc<dyn PathSource>,
    sink: Arc<dyn ScsiSink>,
    busy: Arc<BusyLatch>,
    targets: Mutex<BTreeMap<TargetId, Entry>>,
    changed: Condvar,
    signals: Sender<Signal>,
    shutting_down: AtomicBool,
}

/// Supervises one session per target and replaces failed ones.
pub struct RecoveryManager {
    inner: Arc<Inner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for RecoveryManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecoveryManager")
            .field("obj", &self.inner.obj.id())
            .field("targets", &self.inner.targets.lock().len())
            .finish()
    }
}

impl RecoveryManager {
    /// Create the manager and its host adapter node, and start the recovery worker.
    ///
    /// # Errors
    ///
    ///  - `InsufficientResources`: the worker thread could not be started.
    pub fn new(
        manager: &ObjManager,
        factory: Arc<dyn TransportFactory>,
        paths: Arc<dyn PathSource>,
        sink: Arc<dyn ScsiSink>,
        config: SrpConfig,
    ) -> Result<RecoveryManager> {
        let obj = manager.construct(ObjType::Hba);
        obj.init(
            DestroyMode::Sync,
            ObjHooks::new().cleanup(|o| debug!(obj_id = %o.id(), "host adapter finalized")),
        )?;
        let (tx, rx) = unbounded();
        let inner = Arc::new_cyclic(|me| Inner {
            me: me.clone(),
            obj: obj.clone(),
            config,
            factory,
            paths,
            busy: Arc::new(BusyLatch {
                sink: sink.clone(),
                marks: Mutex::new(BTreeMap::new()),
            }),
            sink,
            targets: Mutex::new(BTreeMap::new()),
            changed: Condvar::new(),
            signals: tx,
            shutting_down: AtomicBool::new(false),
        });
        let weak = Arc::downgrade(&inner);
        let worker = thread::Builder::new()
            .name("srp-recovery".into())
            .spawn(move || run(weak, rx));
        obj.deref();
        let worker = match worker {
            Ok(w) => w,
            Err(e) => {
                error!(error = %e, "failed to start recovery worker");
                obj.destroy(None);
                return Err(Error::InsufficientResources);
            }
        };
        Ok(RecoveryManager {
            inner,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Host adapter node; every session is attached below it.
    pub fn obj(&self) -> &AlObj {
        &self.inner.obj
    }

    /// Start supervising `descriptor` under `target` and connect to it in the background.
    ///
    /// # Errors
    ///
    ///  - `InvalidParameter`: `target` is already supervised.
    ///  - `InvalidState`: the manager is shut down.
    pub fn add_target(&self, target: TargetId, descriptor: TargetDescriptor) -> Result<()> {
        if self.inner.shutting_down.load(Ordering::Acquire) {
            return Err(Error::InvalidState);
        }
        {
            let mut targets = self.inner.targets.lock();
            if targets.contains_key(&target) {
                return Err(Error::InvalidParameter("target id already in use"));
            }
            targets.insert(
                target,
                Entry {
                    descriptor,
                    phase: TargetPhase::Recovering,
                    session: None,
                    generation: 0,
                    paths: Vec::new(),
                    next_path: 0,
                },
            );
        }
        info!(target_id = %target, "target added");
        self.inner.changed.notify_all();
        self.inner.send(Signal::Connect(target));
        Ok(())
    }

    /// Stop supervising `target`, tearing down its session.
    ///
    /// # Errors
    ///
    ///  - `NotFound`: `target` is not supervised.
    pub fn remove_target(&self, target: TargetId) -> Result<()> {
        let entry = self
            .inner
            .targets
            .lock()
            .remove(&target)
            .ok_or(Error::NotFound)?;
        self.inner.changed.notify_all();
        self.inner.busy.forget(target);
        info!(target_id = %target, "target removed");
        if let Some(session) = entry.session {
            session.destroy();
        }
        Ok(())
    }

    /// Retry every unbound target, e.g. after a topology change.
    ///
    /// Returns how many targets were queued for connection.
    pub fn rescan(&self) -> usize {
        if self.inner.shutting_down.load(Ordering::Acquire) {
            return 0;
        }
        let queued: Vec<TargetId> = {
            let mut targets = self.inner.targets.lock();
            targets
                .iter_mut()
                .filter(|(_, e)| e.phase == TargetPhase::Unbound)
                .map(|(id, e)| {
                    e.phase = TargetPhase::Recovering;
                    *id
                })
                .collect()
        };
        if !queued.is_empty() {
            self.inner.changed.notify_all();
        }
        for target in &queued {
            debug!(target_id = %target, "rescan");
            self.inner.send(Signal::Connect(*target));
        }
        queued.len()
    }

    /// Current phase of `target`.
    pub fn phase(&self, target: TargetId) -> Option<TargetPhase> {
        self.inner.targets.lock().get(&target).map(|e| e.phase)
    }

    /// Wait until `target` reaches `phase`. Returns `false` on timeout or if the target is
    /// removed.
    pub fn wait_phase(&self, target: TargetId, phase: TargetPhase, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut targets = self.inner.targets.lock();
        loop {
            match targets.get(&target) {
                Some(e) if e.phase == phase => return true,
                Some(_) => {}
                None => return false,
            }
            if self.inner.changed.wait_until(&mut targets, deadline).timed_out() {
                return targets.get(&target).map_or(false, |e| e.phase == phase);
            }
        }
    }

    /// The session currently serving `target`.
    ///
    /// # Errors
    ///
    ///  - `NotFound`: `target` is not supervised.
    ///  - `Busy`: the target is being recovered.
    ///  - `NotConnected`: the target is unbound.
    pub fn session(&self, target: TargetId) -> Result<Session> {
        self.inner.session(target)
    }

    /// Submit `request` to `target`. See [`Connection::submit`](super::Connection::submit).
    ///
    /// # Errors
    ///
    /// Those of [`RecoveryManager::session`] and of the channel.
    pub fn submit(&self, target: TargetId, request: ScsiRequest) -> Result<()> {
        self.inner.session(target)?.connection().submit(request)
    }

    /// Abort request `id` on `target`.
    pub fn abort(&self, target: TargetId, id: u64) -> Result<()> {
        self.inner.session(target)?.connection().abort(id)
    }

    /// Reset one logical unit of `target`; returns how many requests were completed.
    pub fn reset_lun(&self, target: TargetId, lun: u64) -> Result<usize> {
        Ok(self.inner.session(target)?.connection().reset_lun(lun))
    }

    /// Reset every logical unit of `target`; returns how many requests were completed.
    pub fn reset_target(&self, target: TargetId) -> Result<usize> {
        Ok(self.inner.session(target)?.connection().reset_device())
    }

    /// Diagnostic snapshot of every target.
    pub fn snapshot(&self) -> Vec<TargetSnapshot> {
        let entries: Vec<_> = self
            .inner
            .targets
            .lock()
            .iter()
            .map(|(id, e)| {
                (
                    TargetSnapshot {
                        target: *id,
                        descriptor: e.descriptor.clone(),
                        phase: e.phase,
                        generation: e.generation,
                        paths: e.paths.clone(),
                        connection: None,
                    },
                    e.session.clone(),
                )
            })
            .collect();
        entries
            .into_iter()
            .map(|(mut snap, session)| {
                snap.connection = session.map(|s| s.connection().snapshot());
                snap
            })
            .collect()
    }

    /// Tear down every session without reconnecting, stop the worker, and destroy the host
    /// adapter node. Later calls do nothing.
    pub fn shutdown(&self) {
        if self.inner.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("recovery manager shutting down");
        self.inner.send(Signal::Shutdown);
        if let Some(worker) = self.worker.lock().take() {
            if worker.thread().id() != thread::current().id() && worker.join().is_err() {
                error!("recovery worker panicked");
            }
        }
        let sessions: Vec<Session> = {
            let mut targets = self.inner.targets.lock();
            targets
                .values_mut()
                .filter_map(|e| {
                    e.phase = TargetPhase::Unbound;
                    e.session.take()
                })
                .collect()
        };
        self.inner.changed.notify_all();
        for session in sessions {
            session.destroy();
        }
        if self.inner.obj.destroy(None) == DestroyStatus::Forced {
            warn!("host adapter teardown was forced");
        }
    }
}

impl Drop for RecoveryManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(inner: Weak<Inner>, signals: Receiver<Signal>) {
    while let Ok(signal) = signals.recv() {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        match signal {
            Signal::Shutdown => break,
            Signal::Connect(target) => inner.establish(target),
            Signal::Failed { target, generation } => inner.recover(target, generation),
        }
    }
    debug!("recovery worker exiting");
}

impl Inner {
    fn send(&self, signal: Signal) {
        if self.signals.send(signal).is_err() {
            warn!("recovery worker is gone; signal dropped");
        }
    }

    fn session(&self, target: TargetId) -> Result<Session> {
        let targets = self.targets.lock();
        let entry = targets.get(&target).ok_or(Error::NotFound)?;
        match entry.phase {
            TargetPhase::Ready => entry.session.clone().ok_or(Error::NotConnected),
            TargetPhase::Recovering => Err(Error::Busy),
            TargetPhase::Unbound => Err(Error::NotConnected),
        }
    }

    fn signal_failure(&self, target: TargetId, generation: u64, error: Error) {
        if self.shutting_down.load(Ordering::Acquire) {
            return;
        }
        {
            let mut targets = self.targets.lock();
            match targets.get_mut(&target) {
                Some(e) if e.generation == generation && e.phase == TargetPhase::Ready => {
                    e.phase = TargetPhase::Recovering;
                }
                _ => {
                    debug!(target_id = %target, generation, "stale failure report ignored");
                    return;
                }
            }
        }
        warn!(target_id = %target, generation, %error, "session failed; recovering");
        self.changed.notify_all();
        self.busy.recovering(target);
        self.send(Signal::Failed { target, generation });
    }

    fn recover(&self, target: TargetId, generation: u64) {
        let session = {
            let mut targets = self.targets.lock();
            match targets.get_mut(&target) {
                Some(e) if e.generation == generation && e.phase == TargetPhase::Recovering => {
                    e.session.take()
                }
                _ => return,
            }
        };
        if let Some(session) = session {
            let status = session.destroy();
            debug!(target_id = %target, generation, ?status, "failed session destroyed");
        }
        self.establish(target);
    }

    fn establish(&self, target: TargetId) {
        let attempts = self.config.reconnect_attempts.max(1);
        for attempt in 1..=attempts {
            if self.shutting_down.load(Ordering::Acquire) {
                return;
            }
            let (descriptor, generation) = {
                let targets = self.targets.lock();
                match targets.get(&target) {
                    Some(e) if e.phase == TargetPhase::Recovering => {
                        (e.descriptor.clone(), e.generation + 1)
                    }
                    _ => return,
                }
            };
            match self.attempt(target, descriptor, generation) {
                Ok(session) => {
                    self.install(target, generation, session);
                    return;
                }
                Err(e) => {
                    warn!(target_id = %target, attempt, attempts, error = %e, "connection attempt failed");
                    if attempt < attempts {
                        thread::sleep(self.config.reconnect_backoff);
                    }
                }
            }
        }

        let unbound = {
            let mut targets = self.targets.lock();
            match targets.get_mut(&target) {
                Some(e) if e.phase == TargetPhase::Recovering => {
                    e.phase = TargetPhase::Unbound;
                    true
                }
                _ => false,
            }
        };
        if unbound {
            error!(target_id = %target, attempts, "recovery exhausted; target unbound");
            self.changed.notify_all();
            self.sink.unreachable(target);
        }
    }

    fn attempt(
        &self,
        target: TargetId,
        descriptor: TargetDescriptor,
        generation: u64,
    ) -> Result<Session> {
        let paths = self.paths.paths(&descriptor)?;
        if paths.is_empty() {
            return Err(Error::NotFound);
        }
        let path = {
            let mut targets = self.targets.lock();
            let entry = targets.get_mut(&target).ok_or(Error::NotFound)?;
            let path = paths[entry.next_path % paths.len()];
            entry.next_path = entry.next_path.wrapping_add(1);
            entry.paths = paths;
            path
        };
        debug!(target_id = %target, dlid = path.dlid, generation, "connecting");

        let session = Session::open(
            &self.obj,
            target,
            descriptor,
            path,
            self.factory.as_ref(),
            self.busy.clone(),
            self.config.clone(),
        )?;
        let me = self.me.clone();
        session.set_failure_handler(Box::new(move |target, error| {
            if let Some(inner) = me.upgrade() {
                inner.signal_failure(target, generation, error);
            }
        }));
        if let Err(e) = session.login() {
            session.destroy();
            return Err(e);
        }
        Ok(session)
    }

    fn install(&self, target: TargetId, generation: u64, session: Session) {
        let installed = {
            let mut targets = self.targets.lock();
            match targets.get_mut(&target) {
                Some(e)
                    if e.phase == TargetPhase::Recovering
                        && !self.shutting_down.load(Ordering::Acquire) =>
                {
                    e.generation = generation;
                    e.session = Some(session.clone());
                    e.phase = TargetPhase::Ready;
                    true
                }
                _ => false,
            }
        };
        if !installed {
            debug!(target_id = %target, "target went away during login; discarding session");
            session.destroy();
            return;
        }
        info!(target_id = %target, generation, "session ready");
        self.changed.notify_all();
        self.busy.ready(target);

        // a failure reported before the entry was Ready was ignored
        if session.connection().state() != ConnectionState::Connected {
            self.signal_failure(target, generation, Error::NotConnected);
        }
    }
}
