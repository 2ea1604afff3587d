//! A scripted SRP target.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use super::Dispatcher;
use crate::error::{RejectReason, WcStatus};
use crate::sa::PathRecord;
use crate::srp::iu::{
    Iu, LoginReject, LoginResponse, Response, Segment, BUF_FORMAT_DIRECT, BUF_FORMAT_INDIRECT,
    RSP_FLAG_RSPVALID,
};
use crate::srp::transport::{
    CaAttributes, ChannelTransport, ConnectRequest, FmrRegion, TransportEvent, TransportEvents,
    TransportFactory,
};
use crate::{Error, Result};

/// How the target answers a login request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginScript {
    /// Accept with this request limit if the offered formats overlap `buf_formats`; otherwise
    /// reject with [`RejectReason::UnsupportedDescriptorFormat`].
    Accept {
        /// Initial request limit granted.
        request_limit: u32,
        /// Buffer formats the target supports.
        buf_formats: u16,
    },
    /// Reject with a login reject carrying this reason.
    Reject(RejectReason),
    /// Never answer.
    Silent,
}

impl Default for LoginScript {
    fn default() -> Self {
        LoginScript::Accept {
            request_limit: 64,
            buf_formats: BUF_FORMAT_DIRECT | BUF_FORMAT_INDIRECT,
        }
    }
}

/// How the target answers commands and task management requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseMode {
    /// Answer every request with GOOD status, returning `req_lim_delta` credits.
    Auto {
        /// Credits returned with each response.
        req_lim_delta: i32,
    },
    /// Keep requests until [`SimTransport::respond`] or [`SimTransport::release_held`].
    Hold,
}

impl Default for ResponseMode {
    fn default() -> Self {
        ResponseMode::Auto { req_lim_delta: 1 }
    }
}

struct Script {
    logins: Mutex<VecDeque<LoginScript>>,
    default_login: Mutex<LoginScript>,
    mode: Mutex<ResponseMode>,
}

impl Script {
    fn next_login(&self) -> LoginScript {
        self.logins
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.default_login.lock().clone())
    }
}

/// A simulated SRP target reachable over any path.
///
/// Every [`TransportFactory::open`] creates a new [`SimTransport`]; scripts and response modes
/// apply to all of them.
#[derive(Clone)]
pub struct SimTarget {
    script: Arc<Script>,
    dispatcher: Arc<Dispatcher>,
    transports: Arc<Mutex<Vec<Arc<SimTransport>>>>,
    refuse: Arc<AtomicBool>,
}

impl fmt::Debug for SimTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimTarget")
            .field("transports", &self.transports.lock().len())
            .finish()
    }
}

impl SimTarget {
    /// A target that accepts every login and answers every request.
    ///
    /// # Errors
    ///
    ///  - `InsufficientResources`: the dispatcher thread could not be started.
    pub fn new() -> Result<SimTarget> {
        Ok(SimTarget {
            script: Arc::new(Script {
                logins: Mutex::new(VecDeque::new()),
                default_login: Mutex::new(LoginScript::default()),
                mode: Mutex::new(ResponseMode::default()),
            }),
            dispatcher: Dispatcher::new("sim-srp-target")?,
            transports: Arc::new(Mutex::new(Vec::new())),
            refuse: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Answer the next login with `script`. Queued scripts are used in order before the default.
    pub fn script_login(&self, script: LoginScript) {
        self.script.logins.lock().push_back(script);
    }

    /// Answer logins with `script` once the queued ones are used up.
    pub fn set_default_login(&self, script: LoginScript) {
        *self.script.default_login.lock() = script;
    }

    /// Change how requests are answered.
    pub fn set_response_mode(&self, mode: ResponseMode) {
        *self.script.mode.lock() = mode;
    }

    /// Make [`TransportFactory::open`] fail, as if the port were down.
    pub fn refuse_opens(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Every transport opened so far, oldest first.
    pub fn transports(&self) -> Vec<Arc<SimTransport>> {
        self.transports.lock().clone()
    }

    /// The most recently opened transport.
    pub fn latest(&self) -> Option<Arc<SimTransport>> {
        self.transports.lock().last().cloned()
    }

    /// Wait until every event raised so far has been delivered.
    pub fn flush(&self, timeout: Duration) -> bool {
        self.dispatcher.flush(timeout)
    }
}

impl TransportFactory for SimTarget {
    fn open(&self, path: &PathRecord) -> Result<Arc<dyn ChannelTransport>> {
        if self.refuse.load(Ordering::SeqCst) {
            debug!(dlid = path.dlid, "sim target refusing open");
            return Err(Error::Transport(WcStatus::RetryExceeded));
        }
        let transport = Arc::new(SimTransport {
            script: self.script.clone(),
            dispatcher: self.dispatcher.clone(),
            path: *path,
            link: Mutex::new(Link::default()),
            fail_next_send: AtomicBool::new(false),
            mapped: AtomicUsize::new(0),
        });
        self.transports.lock().push(transport.clone());
        Ok(transport)
    }
}

#[derive(Default)]
struct Link {
    events: Option<Arc<dyn TransportEvents>>,
    ready: bool,
    down: bool,
    recvs: VecDeque<u64>,
    held: Vec<u64>,
    received: Vec<Iu>,
}

/// One simulated connection to a [`SimTarget`].
pub struct SimTransport {
    script: Arc<Script>,
    dispatcher: Arc<Dispatcher>,
    path: PathRecord,
    link: Mutex<Link>,
    fail_next_send: AtomicBool,
    mapped: AtomicUsize,
}

impl fmt::Debug for SimTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let link = self.link.lock();
        f.debug_struct("SimTransport")
            .field("dlid", &self.path.dlid)
            .field("ready", &link.ready)
            .field("down", &link.down)
            .field("held", &link.held.len())
            .finish()
    }
}

impl SimTransport {
    /// Path the transport was opened over.
    pub fn path(&self) -> &PathRecord {
        &self.path
    }

    /// Whether the initiator completed connection establishment and nothing broke since.
    pub fn is_ready(&self) -> bool {
        let link = self.link.lock();
        link.ready && !link.down
    }

    /// Every IU the initiator sent, in order.
    pub fn received(&self) -> Vec<Iu> {
        self.link.lock().received.clone()
    }

    /// Tags of requests kept by [`ResponseMode::Hold`].
    pub fn held(&self) -> Vec<u64> {
        self.link.lock().held.clone()
    }

    /// Receive buffers currently posted by the initiator.
    pub fn posted_receives(&self) -> usize {
        self.link.lock().recvs.len()
    }

    /// Regions currently remapped.
    pub fn mapped_regions(&self) -> usize {
        self.mapped.load(Ordering::SeqCst)
    }

    /// Answer the held request `tag` with GOOD status. Returns `false` if it was not held.
    pub fn respond(&self, tag: u64, req_lim_delta: i32) -> bool {
        let held = {
            let mut link = self.link.lock();
            match link.held.iter().position(|t| *t == tag) {
                Some(i) => {
                    link.held.remove(i);
                    true
                }
                None => false,
            }
        };
        if held {
            self.send_response(good(tag, req_lim_delta));
        }
        held
    }

    /// Answer every held request, oldest first.
    pub fn release_held(&self, req_lim_delta: i32) -> usize {
        let held = std::mem::take(&mut self.link.lock().held);
        for tag in &held {
            self.send_response(good(*tag, req_lim_delta));
        }
        held.len()
    }

    /// Send a target-initiated IU, such as a credit request or a logout.
    pub fn send_iu(&self, iu: Iu) {
        self.deliver_into_recv(iu);
    }

    /// Complete the next send with an error, as if the link had failed under it.
    pub fn fail_next_send(&self) {
        self.fail_next_send.store(true, Ordering::SeqCst);
    }

    /// Break the connection from the target's side.
    pub fn break_link(&self) {
        let events = {
            let mut link = self.link.lock();
            link.down = true;
            link.events.clone()
        };
        if let Some(events) = events {
            self.dispatcher
                .run(move || events.deliver(TransportEvent::Disconnected));
        }
    }

    fn raise(&self, event: TransportEvent) {
        let events = self.link.lock().events.clone();
        match events {
            Some(events) => self.dispatcher.run(move || events.deliver(event)),
            None => warn!("sim transport event before connect dropped"),
        }
    }

    fn send_response(&self, rsp: Response) {
        self.deliver_into_recv(Iu::Response(rsp));
    }

    fn deliver_into_recv(&self, iu: Iu) {
        let (wr_id, events) = {
            let mut link = self.link.lock();
            if link.down {
                return;
            }
            let Some(wr_id) = link.recvs.pop_front() else {
                warn!(opcode = iu.opcode(), "no receive posted; IU dropped");
                return;
            };
            (wr_id, link.events.clone())
        };
        let data = match iu.encode() {
            Ok(d) => d,
            Err(e) => {
                warn!(error = %e, "sim target failed to encode IU");
                return;
            }
        };
        if let Some(events) = events {
            self.dispatcher.run(move || {
                events.deliver(TransportEvent::Recv {
                    wr_id,
                    status: WcStatus::Success,
                    data,
                })
            });
        }
    }

    fn answer_login(&self, login_tag: u64, offered: u16) {
        let script = self.script.next_login();
        trace!(?script, offered, "sim target answering login");
        let event = match script {
            LoginScript::Accept {
                request_limit,
                buf_formats,
            } if offered & buf_formats != 0 => {
                let rsp = Iu::LoginResponse(LoginResponse {
                    tag: login_tag,
                    req_lim_delta: request_limit,
                    max_it_iu_len: 4096,
                    max_ti_iu_len: 4096,
                    buf_formats,
                    flags: 0,
                });
                rsp.encode()
                    .map(|private_data| TransportEvent::ConnectReply { private_data })
            }
            LoginScript::Accept { buf_formats, .. } => reject(
                login_tag,
                RejectReason::UnsupportedDescriptorFormat,
                buf_formats,
            ),
            LoginScript::Reject(reason) => reject(login_tag, reason, BUF_FORMAT_DIRECT),
            LoginScript::Silent => return,
        };
        match event {
            Ok(event) => self.raise(event),
            Err(e) => warn!(error = %e, "sim target failed to encode login answer"),
        }
    }
}

fn reject(tag: u64, reason: RejectReason, buf_formats: u16) -> Result<TransportEvent> {
    Iu::LoginReject(LoginReject::new(tag, reason, buf_formats))
        .encode()
        .map(|private_data| TransportEvent::ConnectReject {
            reason: RejectReason::Consumer,
            private_data,
        })
}

fn good(tag: u64, req_lim_delta: i32) -> Response {
    Response {
        tag,
        req_lim_delta,
        ..Response::default()
    }
}

impl ChannelTransport for SimTransport {
    fn query_ca(&self) -> Result<CaAttributes> {
        Ok(CaAttributes {
            max_responder_resources: 4,
            max_initiator_depth: 4,
            max_queue_depth: 16384,
        })
    }

    fn connect(&self, request: ConnectRequest, events: Arc<dyn TransportEvents>) -> Result<()> {
        let login = match Iu::decode(&request.private_data)? {
            Iu::LoginRequest(login) => login,
            _ => return Err(Error::InvalidParameter("connect private data is not a login")),
        };
        {
            let mut link = self.link.lock();
            if link.down {
                return Err(Error::NotConnected);
            }
            link.events = Some(events);
            link.received.push(Iu::LoginRequest(login.clone()));
        }
        self.answer_login(login.tag, login.buf_formats);
        Ok(())
    }

    fn delay_ack(&self) -> Result<()> {
        Ok(())
    }

    fn ready_to_use(&self) -> Result<()> {
        self.link.lock().ready = true;
        Ok(())
    }

    fn arm_cq(&self) -> Result<()> {
        Ok(())
    }

    fn post_recv(&self, wr_id: u64, _len: u32) -> Result<()> {
        let mut link = self.link.lock();
        if link.down {
            return Err(Error::Transport(WcStatus::WrFlushErr));
        }
        link.recvs.push_back(wr_id);
        Ok(())
    }

    fn post_send(&self, wr_id: u64, iu: Vec<u8>) -> Result<()> {
        let iu = Iu::decode(&iu)?;
        {
            let mut link = self.link.lock();
            if link.down {
                return Err(Error::Transport(WcStatus::WrFlushErr));
            }
            link.received.push(iu.clone());
        }
        if self.fail_next_send.swap(false, Ordering::SeqCst) {
            self.raise(TransportEvent::Send {
                wr_id,
                status: WcStatus::RetryExceeded,
            });
            return Ok(());
        }
        self.raise(TransportEvent::Send {
            wr_id,
            status: WcStatus::Success,
        });

        let mode = *self.script.mode.lock();
        match (&iu, mode) {
            (Iu::Command(cmd), ResponseMode::Auto { req_lim_delta }) => {
                self.send_response(good(cmd.tag, req_lim_delta));
            }
            (Iu::TaskManagement(tm), ResponseMode::Auto { req_lim_delta }) => {
                self.send_response(Response {
                    flags: RSP_FLAG_RSPVALID,
                    response_data: vec![0; 4],
                    ..good(tm.tag, req_lim_delta)
                });
            }
            (Iu::Command(_) | Iu::TaskManagement(_), ResponseMode::Hold) => {
                self.link.lock().held.push(iu.tag());
            }
            (Iu::InitiatorLogout { .. }, _) => {
                debug!(dlid = self.path.dlid, "initiator logged out");
            }
            _ => {}
        }
        Ok(())
    }

    fn map_fmr(&self, segments: &[Segment]) -> Result<FmrRegion> {
        let n = self.mapped.fetch_add(1, Ordering::SeqCst) as u64;
        Ok(FmrRegion {
            segment: Segment {
                addr: 0x4000_0000 + (n << 24),
                key: 0x0f00 + n as u32,
                len: segments.iter().map(|s| s.len).sum(),
            },
        })
    }

    fn unmap_fmr(&self, _region: FmrRegion) {
        self.mapped.fetch_sub(1, Ordering::SeqCst);
    }

    fn disconnect(&self) -> Result<()> {
        let mut link = self.link.lock();
        link.down = true;
        link.held.clear();
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::{ObjConfig, SrpConfig};
    use crate::obj::{DestroyMode, ObjHooks, ObjManager, ObjType};
    use crate::srp::iu::opcode;
    use crate::srp::mock::RecordingSink;
    use crate::srp::{
        Connection, ConnectionState, DataDirection, RequestStatus, ScsiRequest, TargetDescriptor,
        TargetId,
    };

    const WAIT: Duration = Duration::from_secs(2);

    fn open(target: &SimTarget) -> (ObjManager, Arc<Connection>, Arc<RecordingSink>) {
        let mgr = ObjManager::new(ObjConfig::default());
        let parent = mgr.construct(ObjType::Session);
        parent.init(DestroyMode::Sync, ObjHooks::new()).unwrap();
        parent.deref();
        let sink = Arc::new(RecordingSink::default());
        let conn = Connection::new(
            &parent,
            TargetId(0),
            TargetDescriptor {
                id_ext: 0,
                ioc_guid: 1,
                service_id: 1,
                dgid: [0; 16],
                vendor_id: 0,
                subsystem_id: 0,
                port_guid: 2,
                initiator_ext: 0,
            },
            PathRecord::default(),
            target.open(&PathRecord::default()).unwrap(),
            sink.clone(),
            SrpConfig {
                login_timeout: WAIT,
                ..SrpConfig::default()
            },
        )
        .unwrap();
        (mgr, conn, sink)
    }

    fn command(id: u64) -> ScsiRequest {
        ScsiRequest {
            id,
            cdb: vec![0; 6],
            direction: DataDirection::Read,
            segments: vec![Segment {
                addr: 0x1000,
                key: 1,
                len: 512,
            }],
            ..ScsiRequest::default()
        }
    }

    #[test]
    fn auto_mode_answers_commands() {
        let target = SimTarget::new().unwrap();
        let (_mgr, conn, sink) = open(&target);
        conn.login().unwrap();
        assert!(target.latest().unwrap().is_ready());
        for id in 0..5 {
            conn.submit(command(id)).unwrap();
        }
        assert!(target.flush(WAIT));
        assert_eq!(sink.completions.lock().len(), 5);
        assert!(sink
            .completions
            .lock()
            .iter()
            .all(|(_, c)| c.status == RequestStatus::Success));
        assert_eq!(conn.request_limit(), 64);
    }

    #[test]
    fn format_mismatch_is_rejected_then_direct_retry_accepted() {
        let target = SimTarget::new().unwrap();
        target.script_login(LoginScript::Reject(RejectReason::UnsupportedDescriptorFormat));
        target.set_default_login(LoginScript::Accept {
            request_limit: 16,
            buf_formats: BUF_FORMAT_DIRECT,
        });
        let (_mgr, conn, _sink) = open(&target);
        let negotiated = conn.login().unwrap();
        assert_eq!(negotiated.request_limit, 16);
        let logins: Vec<u16> = target
            .latest()
            .unwrap()
            .received()
            .into_iter()
            .filter_map(|iu| match iu {
                Iu::LoginRequest(l) => Some(l.buf_formats),
                _ => None,
            })
            .collect();
        assert_eq!(logins, vec![BUF_FORMAT_DIRECT | BUF_FORMAT_INDIRECT, BUF_FORMAT_DIRECT]);
    }

    #[test]
    fn held_requests_wait_for_release() {
        let target = SimTarget::new().unwrap();
        target.set_response_mode(ResponseMode::Hold);
        let (_mgr, conn, sink) = open(&target);
        conn.login().unwrap();
        conn.submit(command(1)).unwrap();
        conn.submit(command(2)).unwrap();
        let t = target.latest().unwrap();
        assert_eq!(t.held().len(), 2);
        assert!(t.respond(t.held()[1], 1));
        assert!(target.flush(WAIT));
        assert_eq!(sink.completed_ids(), vec![2]);
        assert_eq!(t.release_held(1), 1);
        assert!(target.flush(WAIT));
        assert_eq!(sink.completed_ids(), vec![2, 1]);
    }

    #[test]
    fn failed_send_breaks_channel() {
        let target = SimTarget::new().unwrap();
        target.set_response_mode(ResponseMode::Hold);
        let (_mgr, conn, _sink) = open(&target);
        conn.login().unwrap();
        let t = target.latest().unwrap();
        t.fail_next_send();
        conn.submit(command(1)).unwrap();
        assert!(target.flush(WAIT));
        assert_eq!(conn.state(), ConnectionState::ConnectFailure);
        assert!(t
            .received()
            .iter()
            .any(|iu| iu.opcode() == opcode::CMD));
    }

    #[test]
    fn refused_open_reports_transport_error() {
        let target = SimTarget::new().unwrap();
        target.refuse_opens(true);
        assert!(matches!(
            target.open(&PathRecord::default()),
            Err(Error::Transport(_))
        ));
        assert!(target.transports().is_empty());
    }
}
