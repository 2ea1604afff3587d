//! The credit-flow-controlled SRP channel.
//!
//! A [`Connection`] logs in to one target over one [`ChannelTransport`] and then carries SCSI
//! commands and task management requests to it. Every request consumes one credit of the
//! target-granted request limit; responses (and credit or event requests from the target) hand
//! credits back. Requests that arrive while credits are short wait in a FIFO pending queue and are
//! reposted, in order, as credits return.
//!
//! ```text
//!                 connect                 login response
//! NotConnected ──────────► ConnectRequested ──────────────► Connected ──disconnect──► ConnectionClosing
//!                               │                              │
//!                               │ reject / error               │ error, disconnect, T_LOGOUT
//!                               ▼                              ▼
//!                          ConnectFailure  ◄────────────  TargetDisconnecting
//! ```
//!
//! A failed channel never recovers; the owner replaces it. Each request holds a reference on the
//! channel's [`AlObj`] from the moment it is accepted until it has been reported upward, so
//! destroying the channel finalizes only after every request was completed exactly once.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use super::descriptor::{
    self, PendingQueue, RecvPool, SendDescriptor, SentSet, Work, CONTROL_WR_FLAG, RECV_WR_FLAG,
};
use super::fmr::FmrPool;
use super::iu::{
    self, Command, Iu, LoginRequest, LoginResponse, Response, TaskFunction, TaskManagement,
    BUF_FORMAT_DIRECT, BUF_FORMAT_INDIRECT, RSP_FLAG_SNSVALID,
};
use super::quirks;
use super::transport::{
    ChannelTransport, ConnectRequest, ScsiSink, TaskReport, TransportEvent, TransportEvents,
};
use super::{DataDirection, RequestStatus, ScsiCompletion, ScsiRequest, TargetDescriptor, TargetId};
use crate::config::SrpConfig;
use crate::error::{RejectReason, WcStatus};
use crate::event::OneShot;
use crate::obj::{AlObj, DestroyMode, ObjHooks, ObjType};
use crate::sa::PathRecord;
use crate::{Error, Result};

/// Login and lifetime state of a channel.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Created, no login attempted.
    NotConnected,
    /// Login request sent, waiting for the reply.
    ConnectRequested,
    /// Logged in; requests flow.
    Connected,
    /// Login failed or the connection broke.
    ConnectFailure,
    /// Local logout or teardown in progress.
    ConnectionClosing,
    /// The target logged the initiator out.
    TargetDisconnecting,
}

/// Data descriptor format agreed at login.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorFormat {
    /// One direct descriptor per command.
    Direct,
    /// Indirect descriptor tables are accepted.
    Indirect,
}

/// Parameters negotiated at login.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Negotiated {
    /// Request limit after capping and quirks; also the receive pool size.
    pub request_limit: u32,
    /// Largest initiator-to-target IU.
    pub max_it_iu_len: u32,
    /// Largest target-to-initiator IU.
    pub max_ti_iu_len: u32,
    /// Data descriptor format.
    pub format: DescriptorFormat,
    /// Scatter/gather entries a command can carry without remapping.
    pub max_sg: usize,
}

/// Point-in-time view of a channel, for diagnostics.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSnapshot {
    /// Target served.
    pub target: TargetId,
    /// Channel state.
    pub state: ConnectionState,
    /// Credits currently available.
    pub request_limit: i32,
    /// Request limit granted at login.
    pub max_limit: u32,
    /// Credits held back from posting.
    pub threshold: u32,
    /// Requests waiting for credits.
    pub pending: usize,
    /// Requests posted and not yet answered.
    pub sent: usize,
    /// Login parameters, once connected.
    pub negotiated: Option<Negotiated>,
}

/// Called once when a channel fails after it was handed to its owner.
pub type FailureHandler = Box<dyn Fn(TargetId, Error) + Send + Sync>;

struct Flow {
    state: ConnectionState,
    request_limit: i32,
    max_limit: u32,
    pending: PendingQueue,
    reposting: bool,
    busy: bool,
    negotiated: Option<Negotiated>,
    offered_formats: u16,
    login_attempts: u32,
    failure_reported: bool,
}

enum Outcome<'a> {
    Response(&'a Response),
    Local(RequestStatus),
}

struct EventRelay {
    conn: Weak<Connection>,
}

impl TransportEvents for EventRelay {
    fn deliver(&self, event: TransportEvent) {
        let Some(conn) = self.conn.upgrade() else {
            return;
        };
        if !conn.obj.try_ref() {
            trace!(target_id = %conn.target, ?event, "event after finalization dropped");
            return;
        }
        conn.handle_event(event);
        conn.obj.deref();
    }
}

/// One flow-controlled channel to an SRP target.
pub struct Connection {
    target: TargetId,
    descriptor: TargetDescriptor,
    path: PathRecord,
    config: SrpConfig,
    obj: AlObj,
    transport: Arc<dyn ChannelTransport>,
    sink: Arc<dyn ScsiSink>,
    relay: Arc<EventRelay>,
    flow: Mutex<Flow>,
    sent: Mutex<SentSet>,
    recv: Mutex<RecvPool>,
    fmr: Option<FmrPool>,
    next_tag: AtomicU64,
    login: OneShot<Result<()>>,
    on_failure: Mutex<Option<FailureHandler>>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("target", &self.target)
            .field("obj", &self.obj.id())
            .field("state", &self.state())
            .finish()
    }
}

impl Connection {
    /// Create a channel to `descriptor` over `path`, attached below `parent`.
    ///
    /// Nothing is sent until [`Connection::connect`] or [`Connection::login`].
    ///
    /// # Errors
    ///
    ///  - `InvalidState`: `parent` is not initialized.
    pub fn new(
        parent: &AlObj,
        target: TargetId,
        descriptor: TargetDescriptor,
        path: PathRecord,
        transport: Arc<dyn ChannelTransport>,
        sink: Arc<dyn ScsiSink>,
        config: SrpConfig,
    ) -> Result<Arc<Connection>> {
        let obj = parent.manager().construct(ObjType::Connection);
        let fmr = (config.fmr_pool_size > 0)
            .then(|| FmrPool::new(transport.clone(), config.fmr_pool_size));
        let conn = Arc::new_cyclic(|weak| Connection {
            target,
            descriptor,
            path,
            config,
            obj: obj.clone(),
            transport,
            sink,
            relay: Arc::new(EventRelay { conn: weak.clone() }),
            flow: Mutex::new(Flow {
                state: ConnectionState::NotConnected,
                request_limit: 0,
                max_limit: 0,
                pending: PendingQueue::default(),
                reposting: false,
                busy: false,
                negotiated: None,
                offered_formats: BUF_FORMAT_DIRECT | BUF_FORMAT_INDIRECT,
                login_attempts: 0,
                failure_reported: false,
            }),
            sent: Mutex::new(SentSet::default()),
            recv: Mutex::new(RecvPool::new(0, 0)),
            fmr,
            next_tag: AtomicU64::new(1),
            login: OneShot::new(),
            on_failure: Mutex::new(None),
        });

        let weak = Arc::downgrade(&conn);
        obj.init(
            DestroyMode::Async,
            ObjHooks::new()
                .destroying(move |_| {
                    if let Some(conn) = weak.upgrade() {
                        conn.close();
                    }
                })
                .cleanup(move |o| debug!(obj_id = %o.id(), target_id = %target, "channel finalized")),
        )?;
        if let Err(e) = parent.attach(&obj) {
            obj.destroy(None);
            obj.deref();
            return Err(e);
        }
        obj.deref();
        Ok(conn)
    }

    /// Target this channel serves.
    pub fn target(&self) -> TargetId {
        self.target
    }

    /// The target's identity.
    pub fn descriptor(&self) -> &TargetDescriptor {
        &self.descriptor
    }

    /// Path the channel was opened over.
    pub fn path(&self) -> &PathRecord {
        &self.path
    }

    /// Lifecycle node of the channel.
    pub fn obj(&self) -> &AlObj {
        &self.obj
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.flow.lock().state
    }

    /// Credits currently available.
    pub fn request_limit(&self) -> i32 {
        self.flow.lock().request_limit
    }

    /// Requests waiting for credits.
    pub fn pending_count(&self) -> usize {
        self.flow.lock().pending.len()
    }

    /// Requests posted and not yet answered.
    pub fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }

    /// Login parameters, once connected.
    pub fn negotiated(&self) -> Option<Negotiated> {
        self.flow.lock().negotiated.clone()
    }

    /// Diagnostic snapshot.
    pub fn snapshot(&self) -> ConnectionSnapshot {
        let flow = self.flow.lock();
        let sent = self.sent.lock().len();
        ConnectionSnapshot {
            target: self.target,
            state: flow.state,
            request_limit: flow.request_limit,
            max_limit: flow.max_limit,
            threshold: self.config.request_threshold,
            pending: flow.pending.len(),
            sent,
            negotiated: flow.negotiated.clone(),
        }
    }

    /// Install the handler told, once, that this channel failed.
    pub fn set_failure_handler(&self, handler: FailureHandler) {
        *self.on_failure.lock() = Some(handler);
    }

    /// Send the login request. The outcome arrives asynchronously; [`Connection::login`] waits
    /// for it.
    ///
    /// # Errors
    ///
    ///  - `InvalidState`: a login was already attempted.
    ///  - Whatever the transport refused the connection request with.
    pub fn connect(&self) -> Result<()> {
        {
            let mut flow = self.flow.lock();
            if flow.state != ConnectionState::NotConnected {
                return Err(Error::InvalidState);
            }
            flow.state = ConnectionState::ConnectRequested;
            flow.offered_formats = BUF_FORMAT_DIRECT | BUF_FORMAT_INDIRECT;
            flow.login_attempts = 1;
        }
        debug!(target_id = %self.target, "connect requested");
        if let Err(e) = self.send_login(BUF_FORMAT_DIRECT | BUF_FORMAT_INDIRECT) {
            self.fail(e.clone());
            return Err(e);
        }
        Ok(())
    }

    /// Log in and wait for the outcome, at most `login_timeout`.
    ///
    /// # Errors
    ///
    ///  - `Rejected`: the target refused the login, after the direct-only retry if one applied.
    ///  - `Timeout`: no reply in time; the channel is failed.
    ///  - Anything [`Connection::connect`] returns.
    pub fn login(&self) -> Result<Negotiated> {
        self.connect()?;
        match self.login.wait_timeout(self.config.login_timeout) {
            Some(Ok(())) => self.negotiated().ok_or(Error::InvalidState),
            Some(Err(e)) => Err(e),
            None => {
                warn!(target_id = %self.target, "login timed out");
                self.fail(Error::Timeout);
                Err(Error::Timeout)
            }
        }
    }

    fn send_login(&self, formats: u16) -> Result<()> {
        let ca = self.transport.query_ca()?;
        let login = Iu::LoginRequest(LoginRequest {
            tag: self.next_tag(),
            max_it_iu_len: self.config.max_iu_size,
            buf_formats: formats,
            flags: 0,
            initiator_port_id: self.descriptor.initiator_port_id(),
            target_port_id: self.descriptor.target_port_id(),
        });
        let timeout = self.path.round_trip_timeout();
        let request = ConnectRequest {
            service_id: self.descriptor.service_id,
            path: self.path,
            responder_resources: ca.max_responder_resources,
            initiator_depth: ca.max_initiator_depth,
            local_resp_timeout: timeout,
            remote_resp_timeout: timeout,
            retry_count: self.config.cm_retry_count,
            private_data: login.encode()?,
        };
        info!(target_id = %self.target, formats, "sending login");
        self.transport.connect(request, self.relay.clone())
    }

    fn next_tag(&self) -> u64 {
        self.next_tag.fetch_add(1, Ordering::Relaxed)
    }

    fn handle_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::ConnectReply { private_data } => self.on_connect_reply(&private_data),
            TransportEvent::ConnectReject {
                reason,
                private_data,
            } => {
                let reason = match reason {
                    RejectReason::Consumer => match Iu::decode(&private_data) {
                        Ok(Iu::LoginReject(rej)) => rej.reason(),
                        _ => RejectReason::Consumer,
                    },
                    other => other,
                };
                self.on_login_reject(reason);
            }
            TransportEvent::Recv {
                wr_id,
                status,
                data,
            } => self.on_recv(wr_id, status, &data),
            TransportEvent::Send { wr_id, status } => {
                if status.is_success() {
                    trace!(target_id = %self.target, wr_id, "send complete");
                } else {
                    self.fail(Error::Transport(status));
                    let carried = self.sent.lock().take(wr_id);
                    if let Some(desc) = carried {
                        self.finish(
                            desc,
                            Outcome::Local(RequestStatus::Failed(Error::Transport(status))),
                        );
                    }
                }
            }
            TransportEvent::Disconnected => self.fail(Error::NotConnected),
        }
    }

    fn on_connect_reply(&self, data: &[u8]) {
        if self.state() != ConnectionState::ConnectRequested {
            warn!(target_id = %self.target, "connect reply in unexpected state");
            return;
        }
        match Iu::decode(data) {
            Ok(Iu::LoginResponse(rsp)) => {
                if let Err(e) = self.complete_login(&rsp) {
                    self.fail(e);
                }
            }
            Ok(Iu::LoginReject(rej)) => self.on_login_reject(rej.reason()),
            Ok(_) => self.fail(Error::Protocol("unexpected IU in connect reply")),
            Err(e) => self.fail(e),
        }
    }

    fn complete_login(&self, rsp: &LoginResponse) -> Result<()> {
        let offered = self.flow.lock().offered_formats;
        let common = offered & rsp.buf_formats;
        let format = if common & BUF_FORMAT_INDIRECT != 0 {
            DescriptorFormat::Indirect
        } else if common & BUF_FORMAT_DIRECT != 0 {
            DescriptorFormat::Direct
        } else {
            return Err(Error::Rejected(RejectReason::UnsupportedDescriptorFormat));
        };

        let granted = rsp.req_lim_delta.min(self.config.max_queue_depth);
        let limit = quirks::adjust_request_limit(
            &self.config.quirks,
            self.descriptor.vendor_id,
            self.descriptor.subsystem_id,
            granted,
        );
        if limit == 0 {
            return Err(Error::Rejected(RejectReason::InsufficientResources));
        }
        let max_it_iu_len = rsp.max_it_iu_len.min(self.config.max_iu_size);
        let max_ti_iu_len = rsp.max_ti_iu_len.min(self.config.max_iu_size);
        let negotiated = Negotiated {
            request_limit: limit,
            max_it_iu_len,
            max_ti_iu_len,
            format,
            max_sg: iu::max_sg_entries(format == DescriptorFormat::Indirect, max_it_iu_len),
        };

        let slots = limit as usize;
        *self.recv.lock() = RecvPool::new(slots, max_ti_iu_len);
        for slot in 0..slots {
            self.recv.lock().mark_posted(slot);
            self.transport.post_recv(RecvPool::wr_id(slot), max_ti_iu_len)?;
        }
        self.transport.delay_ack()?;
        self.transport.ready_to_use()?;
        self.transport.arm_cq()?;

        {
            let mut flow = self.flow.lock();
            if flow.state != ConnectionState::ConnectRequested {
                return Err(Error::InvalidState);
            }
            flow.state = ConnectionState::Connected;
            flow.request_limit = limit as i32;
            flow.max_limit = limit;
            flow.negotiated = Some(negotiated.clone());
        }
        info!(
            target_id = %self.target,
            granted = rsp.req_lim_delta,
            request_limit = limit,
            ?format,
            max_sg = negotiated.max_sg,
            "logged in"
        );
        self.login.set(Ok(()));
        Ok(())
    }

    fn on_login_reject(&self, reason: RejectReason) {
        let retry = {
            let mut flow = self.flow.lock();
            if flow.state != ConnectionState::ConnectRequested {
                return;
            }
            if reason == RejectReason::UnsupportedDescriptorFormat && flow.login_attempts == 1 {
                flow.login_attempts = 2;
                flow.offered_formats = BUF_FORMAT_DIRECT;
                true
            } else {
                false
            }
        };
        if retry {
            warn!(target_id = %self.target, ?reason, "login rejected; retrying with direct descriptors");
            if let Err(e) = self.send_login(BUF_FORMAT_DIRECT) {
                self.fail(e);
            }
        } else {
            warn!(target_id = %self.target, ?reason, "login rejected");
            self.fail(Error::Rejected(reason));
        }
    }

    fn fail(&self, error: Error) {
        let notify = {
            let mut flow = self.flow.lock();
            if flow.state == ConnectionState::ConnectionClosing {
                return;
            }
            if flow.state != ConnectionState::ConnectFailure {
                debug!(target_id = %self.target, from = ?flow.state, "channel failed");
                flow.state = ConnectionState::ConnectFailure;
            }
            !std::mem::replace(&mut flow.failure_reported, true)
        };
        self.login.set(Err(error.clone()));
        if notify {
            warn!(target_id = %self.target, %error, "channel lost");
            if let Some(handler) = &*self.on_failure.lock() {
                handler(self.target, error);
            }
        }
    }

    fn target_logout(&self, reason: u32) {
        let notify = {
            let mut flow = self.flow.lock();
            if flow.state != ConnectionState::Connected {
                return;
            }
            flow.state = ConnectionState::TargetDisconnecting;
            !std::mem::replace(&mut flow.failure_reported, true)
        };
        warn!(target_id = %self.target, reason, "target logged out");
        if notify {
            if let Some(handler) = &*self.on_failure.lock() {
                handler(self.target, Error::NotConnected);
            }
        }
    }

    fn on_recv(&self, wr_id: u64, status: WcStatus, data: &[u8]) {
        let Some(slot) = RecvPool::slot_of(wr_id) else {
            warn!(target_id = %self.target, wr_id, "receive completion with a foreign id");
            return;
        };
        self.recv.lock().mark_completed(slot);
        if !status.is_success() {
            self.fail(Error::Transport(status));
            return;
        }
        let received = match Iu::decode(data) {
            Ok(iu) => iu,
            Err(e) => {
                self.fail(e);
                return;
            }
        };
        if let Iu::TargetLogout { reason, .. } = received {
            self.target_logout(reason);
            return;
        }
        self.repost_recv(slot);

        match received {
            Iu::Response(rsp) => self.on_response(&rsp),
            Iu::CreditRequest { tag, req_lim_delta } => {
                self.add_credit(req_lim_delta);
                self.send_control(Iu::CreditResponse { tag });
            }
            Iu::AerRequest {
                tag,
                req_lim_delta,
                lun,
                sense,
            } => {
                self.add_credit(req_lim_delta);
                info!(target_id = %self.target, lun, "asynchronous event");
                self.sink.async_event(self.target, lun, &sense);
                self.send_control(Iu::AerResponse { tag });
            }
            other => {
                warn!(target_id = %self.target, opcode = other.opcode(), "unexpected IU from target");
            }
        }
        self.drain_pending();
    }

    fn repost_recv(&self, slot: usize) {
        if self.state() != ConnectionState::Connected {
            return;
        }
        let len = {
            let mut recv = self.recv.lock();
            recv.mark_posted(slot);
            recv.buf_len()
        };
        if let Err(e) = self.transport.post_recv(RecvPool::wr_id(slot), len) {
            self.fail(e);
        }
    }

    fn on_response(&self, rsp: &Response) {
        self.add_credit(rsp.req_lim_delta);
        let desc = self.sent.lock().take(rsp.tag);
        match desc {
            Some(desc) => self.finish(desc, Outcome::Response(rsp)),
            None => debug!(target_id = %self.target, tag = rsp.tag, "response for a tag no longer outstanding"),
        }
    }

    fn add_credit(&self, delta: i32) {
        if delta < 0 {
            warn!(target_id = %self.target, delta, "negative credit delta ignored");
            return;
        }
        let mut flow = self.flow.lock();
        flow.request_limit = flow.request_limit.saturating_add(delta);
        trace!(target_id = %self.target, delta, request_limit = flow.request_limit, "credits returned");
    }

    fn send_control(&self, control: Iu) {
        let wr_id = CONTROL_WR_FLAG | (control.tag() & !(CONTROL_WR_FLAG | RECV_WR_FLAG));
        let result = control
            .encode()
            .and_then(|bytes| self.transport.post_send(wr_id, bytes));
        if let Err(e) = result {
            self.fail(e);
        }
    }

    fn finish(&self, desc: SendDescriptor, outcome: Outcome<'_>) {
        let lun = desc.lun();
        match desc.into_work() {
            Work::Command(request) => {
                let completion = match outcome {
                    Outcome::Response(rsp) => completion_from(&request, rsp),
                    Outcome::Local(status) => ScsiCompletion::local(request.id, status),
                };
                trace!(target_id = %self.target, id = completion.id, status = ?completion.status, "request complete");
                self.sink.complete(self.target, completion);
            }
            Work::Task { function, task_tag } => {
                let response = match outcome {
                    Outcome::Response(rsp) => Some(rsp.response_code().unwrap_or(0)),
                    Outcome::Local(_) => None,
                };
                self.sink.task_management(TaskReport {
                    target: self.target,
                    lun,
                    function,
                    task_tag,
                    response,
                });
            }
        }
        self.obj.deref();
    }

    /// Submit a SCSI command.
    ///
    /// The command is posted at once if credits allow and nothing is queued ahead of it;
    /// otherwise it waits in FIFO order. Its completion is reported through the [`ScsiSink`]
    /// exactly once.
    ///
    /// # Errors
    ///
    ///  - `NotConnected`: the channel is not logged in.
    ///  - `InsufficientResources`: the data buffer cannot be described with a free remap entry or
    ///    a descriptor table that fits.
    ///  - `InvalidParameter`: the command does not fit the negotiated IU size, or carries data
    ///    without a direction.
    pub fn submit(&self, request: ScsiRequest) -> Result<()> {
        let negotiated = self.negotiated().ok_or(Error::NotConnected)?;
        let (buffer, fmr) = descriptor::describe(
            &request,
            negotiated.format == DescriptorFormat::Indirect,
            negotiated.max_sg,
            self.fmr.as_ref(),
        )?;
        let (data_out, data_in) = descriptor::by_direction(request.direction, buffer);
        let tag = self.next_tag();
        let bytes = Iu::Command(Command {
            tag,
            lun: request.lun,
            task_attr: request.task_attr,
            cdb: request.cdb.clone(),
            data_out,
            data_in,
        })
        .encode()?;
        if bytes.len() > negotiated.max_it_iu_len as usize {
            return Err(Error::InvalidParameter("command exceeds the negotiated IU size"));
        }
        let lun = request.lun;
        self.enqueue(SendDescriptor::new(tag, lun, Work::Command(request), bytes, fmr))
    }

    fn submit_task(&self, function: TaskFunction, lun: u64, task_tag: u64) -> Result<()> {
        let tag = self.next_tag();
        let bytes = Iu::TaskManagement(TaskManagement {
            tag,
            lun,
            function,
            task_tag,
        })
        .encode()?;
        debug!(target_id = %self.target, ?function, lun, task_tag, "task management");
        self.enqueue(SendDescriptor::new(
            tag,
            lun,
            Work::Task { function, task_tag },
            bytes,
            None,
        ))
    }

    fn enqueue(&self, mut desc: SendDescriptor) -> Result<()> {
        let threshold = self.config.request_threshold as i32;
        let mut flow = self.flow.lock();
        if flow.state != ConnectionState::Connected {
            return Err(Error::NotConnected);
        }
        self.obj.add_ref();
        if flow.pending.is_empty() && !flow.reposting && flow.request_limit > threshold {
            flow.request_limit -= 1;
            let tag = desc.tag();
            let bytes = desc.take_iu().unwrap_or_default();
            self.sent.lock().insert(desc);
            drop(flow);
            self.post(tag, bytes);
        } else {
            flow.pending.push_back(desc);
            let went_busy = !flow.busy && flow.pending.len() >= flow.max_limit as usize;
            if went_busy {
                flow.busy = true;
            }
            let queued = flow.pending.len();
            drop(flow);
            trace!(target_id = %self.target, queued, "request queued for credits");
            if went_busy {
                debug!(target_id = %self.target, queued, "pending queue full; holding new work");
                self.sink.set_busy(self.target, true);
            }
        }
        Ok(())
    }

    fn post(&self, tag: u64, bytes: Vec<u8>) {
        trace!(target_id = %self.target, tag, "posting");
        if let Err(e) = self.transport.post_send(tag, bytes) {
            let desc = {
                let mut flow = self.flow.lock();
                let desc = self.sent.lock().take(tag);
                if desc.is_some() {
                    flow.request_limit += 1;
                }
                desc
            };
            if let Some(desc) = desc {
                self.finish(desc, Outcome::Local(RequestStatus::Failed(e.clone())));
            }
            self.fail(e);
        }
    }

    fn drain_pending(&self) {
        {
            let mut flow = self.flow.lock();
            if flow.reposting || flow.pending.is_empty() {
                return;
            }
            flow.reposting = true;
        }
        let threshold = self.config.request_threshold as i32;
        loop {
            let (tag, bytes) = {
                let mut flow = self.flow.lock();
                let next = if flow.state == ConnectionState::Connected
                    && flow.request_limit > threshold
                {
                    flow.pending.pop_front()
                } else {
                    None
                };
                match next {
                    Some(mut desc) => {
                        flow.request_limit -= 1;
                        let tag = desc.tag();
                        let bytes = desc.take_iu().unwrap_or_default();
                        self.sent.lock().insert(desc);
                        (tag, bytes)
                    }
                    None => {
                        flow.reposting = false;
                        drop(flow);
                        self.resume_if_drained();
                        return;
                    }
                }
            };
            self.post(tag, bytes);
        }
    }

    fn resume_if_drained(&self) {
        let resume = {
            let mut flow = self.flow.lock();
            let resume = flow.busy && flow.pending.len() < flow.max_limit as usize;
            if resume {
                flow.busy = false;
            }
            resume
        };
        if resume {
            debug!(target_id = %self.target, "pending queue drained; resuming");
            self.sink.set_busy(self.target, false);
        }
    }

    /// Abort the request submitted with `id`.
    ///
    /// A queued request is removed and completed as [`RequestStatus::Aborted`] without reaching
    /// the target. A posted one is completed as aborted at once and an `ABORT TASK` request for
    /// it is submitted; its outcome is reported through [`ScsiSink::task_management`], and a late
    /// response to the original command is ignored apart from its credits.
    ///
    /// # Errors
    ///
    ///  - `NotFound`: no outstanding request has that id.
    ///  - Anything submitting the task management request returns.
    pub fn abort(&self, id: u64) -> Result<()> {
        let (queued, posted) = {
            let mut flow = self.flow.lock();
            match flow.pending.remove_request(id) {
                Some(desc) => (Some(desc), None),
                None => (None, self.sent.lock().take_request(id)),
            }
        };
        if let Some(desc) = queued {
            debug!(target_id = %self.target, id, "aborted before posting");
            self.finish(desc, Outcome::Local(RequestStatus::Aborted));
            self.resume_if_drained();
            return Ok(());
        }
        let desc = posted.ok_or(Error::NotFound)?;
        let (tag, lun) = (desc.tag(), desc.lun());
        debug!(target_id = %self.target, id, tag, "aborting posted request");
        self.finish(desc, Outcome::Local(RequestStatus::Aborted));
        self.submit_task(TaskFunction::AbortTask, lun, tag)
    }

    /// Complete every outstanding request of `lun` as [`RequestStatus::Reset`].
    ///
    /// Returns how many were completed. The channel stays connected; credits of posted requests
    /// come back with the target's responses, which are otherwise ignored.
    pub fn reset_lun(&self, lun: u64) -> usize {
        let (queued, posted) = {
            let mut flow = self.flow.lock();
            let queued = flow.pending.take_lun(lun);
            (queued, self.sent.lock().take_lun(lun))
        };
        let count = queued.len() + posted.len();
        info!(target_id = %self.target, lun, count, "LUN reset");
        for desc in posted.into_iter().chain(queued) {
            self.finish(desc, Outcome::Local(RequestStatus::Reset));
        }
        self.resume_if_drained();
        count
    }

    /// Complete every outstanding request as [`RequestStatus::Reset`].
    pub fn reset_device(&self) -> usize {
        let count = self.drain_all(RequestStatus::Reset);
        info!(target_id = %self.target, count, "device reset");
        count
    }

    /// Complete every queued and posted request with `status`, each exactly once.
    pub fn drain_all(&self, status: RequestStatus) -> usize {
        let (queued, posted) = {
            let mut flow = self.flow.lock();
            let queued = flow.pending.drain();
            (queued, self.sent.lock().drain())
        };
        let count = queued.len() + posted.len();
        for desc in posted.into_iter().chain(queued) {
            self.finish(desc, Outcome::Local(status.clone()));
        }
        self.resume_if_drained();
        count
    }

    /// Log out and disconnect.
    ///
    /// Outstanding requests stay outstanding until the channel is destroyed or drained.
    ///
    /// # Errors
    ///
    ///  - `NotConnected`: the channel is not logged in.
    pub fn disconnect(&self) -> Result<()> {
        {
            let mut flow = self.flow.lock();
            if flow.state != ConnectionState::Connected {
                return Err(Error::NotConnected);
            }
            flow.state = ConnectionState::ConnectionClosing;
        }
        info!(target_id = %self.target, "logging out");
        self.send_logout();
        self.transport.disconnect()
    }

    fn send_logout(&self) {
        let tag = self.next_tag();
        let result = Iu::InitiatorLogout { tag }
            .encode()
            .and_then(|bytes| self.transport.post_send(CONTROL_WR_FLAG | tag, bytes));
        if let Err(e) = result {
            debug!(target_id = %self.target, %e, "logout not sent");
        }
    }

    fn close(&self) {
        let previous = {
            let mut flow = self.flow.lock();
            let previous = flow.state;
            if previous != ConnectionState::ConnectFailure {
                flow.state = ConnectionState::ConnectionClosing;
            }
            previous
        };
        if previous == ConnectionState::Connected {
            self.send_logout();
        }
        self.login.set(Err(Error::Cancelled));
        let drained = self.drain_all(RequestStatus::Failed(Error::NotConnected));
        if previous != ConnectionState::NotConnected {
            if let Err(e) = self.transport.disconnect() {
                debug!(target_id = %self.target, %e, "disconnect failed");
            }
        }
        debug!(target_id = %self.target, ?previous, drained, "channel closing");
    }
}

fn completion_from(request: &ScsiRequest, rsp: &Response) -> ScsiCompletion {
    let residual = match request.direction {
        DataDirection::Read => rsp.data_in_residual(),
        DataDirection::Write => rsp.data_out_residual(),
        DataDirection::None => 0,
    };
    ScsiCompletion {
        id: request.id,
        status: if rsp.status == 0 {
            RequestStatus::Success
        } else {
            RequestStatus::ScsiError
        },
        scsi_status: rsp.status,
        sense: if rsp.flags & RSP_FLAG_SNSVALID != 0 {
            rsp.sense.clone()
        } else {
            Vec::new()
        },
        residual,
    }
}
